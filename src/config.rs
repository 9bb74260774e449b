//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `TOOLRUN__*` 覆盖（双下划线表示嵌套，如 `TOOLRUN__LLM__PROVIDER=openai`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::tools::approval::ApprovalPolicy;
use crate::tools::shell::DEFAULT_FORBIDDEN_PATTERNS;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub approval: ApprovalSection,
    pub tools: ToolsSection,
    pub persistence: PersistenceSection,
}

/// [app] 段：应用名、对话轮数上限、多轮循环上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 对话历史保留轮数（短期记忆）
    pub max_context_turns: usize,
    /// 多轮循环最多轮次
    pub max_iterations: usize,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            max_context_turns: 20,
            max_iterations: 10,
        }
    }
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：ollama / openai / mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            model: "llama3".to_string(),
            base_url: None,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmTimeoutsSection {
    pub request: u64,
    /// 相邻两个流式 chunk 之间的最长等待（秒）
    pub stream: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: 60,
            stream: 120,
        }
    }
}

/// [approval] 段：审批轮询参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApprovalSection {
    pub poll_interval_ms: u64,
    pub max_wait_secs: u64,
    /// pending 已清除但历史缺失时容忍的轮询次数
    pub missing_entry_grace_ticks: u32,
}

impl Default for ApprovalSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            max_wait_secs: 3600,
            missing_entry_grace_ticks: 20,
        }
    }
}

impl ApprovalSection {
    pub fn policy(&self) -> ApprovalPolicy {
        ApprovalPolicy {
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            max_wait: Duration::from_secs(self.max_wait_secs),
            missing_entry_grace_ticks: self.missing_entry_grace_ticks.max(1),
        }
    }
}

/// [tools] 段
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    pub shell: ShellSection,
}

/// [tools.shell] 段：白名单命令（仅首词）直接执行，其余进入审批
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShellSection {
    pub allowed_commands: Vec<String>,
    pub forbidden_patterns: Vec<String>,
    pub timeout_secs: u64,
    pub default_host: String,
}

impl Default for ShellSection {
    fn default() -> Self {
        Self {
            allowed_commands: ["ls", "pwd", "whoami", "cat", "head", "tail", "wc", "grep", "echo", "date", "uname", "df"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            forbidden_patterns: DEFAULT_FORBIDDEN_PATTERNS.iter().map(|s| s.to_string()).collect(),
            timeout_secs: 30,
            default_host: "main".to_string(),
        }
    }
}

/// [persistence] 段：未设置 path 时使用内存实现
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PersistenceSection {
    pub path: Option<PathBuf>,
}

/// 从 config 目录加载配置，环境变量 TOOLRUN__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 TOOLRUN__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!(path = %path.display(), "config file not found, ignoring");
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("TOOLRUN")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
