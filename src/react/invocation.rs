//! 工具调用：解析器的输出单元

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const EXECUTE_COMMAND: &str = "execute_command";
pub const RESPOND: &str = "respond";
pub const DELEGATE: &str = "delegate";

/// 工具种类：前三个为保留名，其余一律 Unknown（编排器静默跳过）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    ExecuteCommand,
    Respond,
    Delegate,
    Unknown,
}

impl ToolKind {
    pub fn from_name(name: &str) -> Self {
        let name = name.trim();
        if name.eq_ignore_ascii_case(EXECUTE_COMMAND) {
            ToolKind::ExecuteCommand
        } else if name.eq_ignore_ascii_case(RESPOND) {
            ToolKind::Respond
        } else if name.eq_ignore_ascii_case(DELEGATE) {
            ToolKind::Delegate
        } else {
            ToolKind::Unknown
        }
    }
}

/// 从模型输出中提取出的一次工具调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub name: String,
    pub parameters: Map<String, Value>,
    pub description: String,
}

impl ToolInvocation {
    pub fn new(name: impl Into<String>, parameters: Map<String, Value>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters,
            description: description.into(),
        }
    }

    pub fn kind(&self) -> ToolKind {
        ToolKind::from_name(&self.name)
    }

    /// 是否为执行类工具（受单步执行约束）
    pub fn is_execution(&self) -> bool {
        self.kind() == ToolKind::ExecuteCommand
    }

    /// 把 parameters 反序列化为具体参数结构
    pub fn params<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.parameters.clone()))
    }
}
