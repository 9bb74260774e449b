//! 保留工具的参数结构与 JSON Schema（schemars 自动生成）
//!
//! 参数结构同时用于反序列化 params（未知键忽略，向前兼容）与拼入 system prompt。

use schemars::{schema_for, JsonSchema};
use serde::Deserialize;

fn default_host() -> String {
    "main".to_string()
}

fn default_true() -> bool {
    true
}

/// execute_command 的参数
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, JsonSchema)]
pub struct ExecuteCommandParams {
    /// 要执行的 shell 命令
    pub command: String,
    /// 目标主机，默认 main
    #[serde(default = "default_host")]
    pub host: String,
}

/// respond 的参数
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, JsonSchema)]
pub struct RespondParams {
    /// 展示给用户的文本
    #[serde(default)]
    pub text: String,
    /// 是否结束多轮循环（缺省为 true）
    #[serde(default = "default_true")]
    pub break_loop: bool,
}

/// delegate 的参数
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, JsonSchema)]
pub struct DelegateParams {
    /// 子任务描述
    pub task: String,
    /// 委派原因
    #[serde(default)]
    pub reason: String,
    /// 是否等待子智能体结果（缺省为 true）
    #[serde(default = "default_true")]
    pub wait_for_result: bool,
}

/// 三个保留工具的参数 Schema，可拼入 system prompt
pub fn protocol_schema_json() -> String {
    let schemas = serde_json::json!({
        "execute_command": schema_for!(ExecuteCommandParams),
        "respond": schema_for!(RespondParams),
        "delegate": schema_for!(DelegateParams),
    });
    serde_json::to_string_pretty(&schemas).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_apply() {
        let p: ExecuteCommandParams = serde_json::from_value(serde_json::json!({"command": "ls"})).unwrap();
        assert_eq!(p.host, "main");
        let r: RespondParams = serde_json::from_value(serde_json::json!({"text": "hi"})).unwrap();
        assert!(r.break_loop);
        let d: DelegateParams = serde_json::from_value(serde_json::json!({"task": "t"})).unwrap();
        assert!(d.wait_for_result);
        assert!(d.reason.is_empty());
    }

    #[test]
    fn test_unknown_keys_pass_through() {
        let p: ExecuteCommandParams =
            serde_json::from_value(serde_json::json!({"command": "ls", "cwd": "/tmp"})).unwrap();
        assert_eq!(p.command, "ls");
    }

    #[test]
    fn test_schema_lists_reserved_tools() {
        let s = protocol_schema_json();
        assert!(s.contains("execute_command"));
        assert!(s.contains("break_loop"));
        assert!(s.contains("wait_for_result"));
    }
}
