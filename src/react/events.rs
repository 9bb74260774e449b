//! 轮次消息：编排器向外（UI / 持久化）发出的不可变单元
//!
//! type 字段取值是对外稳定契约：response / terminal_command / terminal_output /
//! command_approval_request / metadata_update / execution_summary / delegation / error

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnMessageType {
    Response,
    TerminalCommand,
    TerminalOutput,
    CommandApprovalRequest,
    MetadataUpdate,
    ExecutionSummary,
    Delegation,
    Error,
}

impl TurnMessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnMessageType::Response => "response",
            TurnMessageType::TerminalCommand => "terminal_command",
            TurnMessageType::TerminalOutput => "terminal_output",
            TurnMessageType::CommandApprovalRequest => "command_approval_request",
            TurnMessageType::MetadataUpdate => "metadata_update",
            TurnMessageType::ExecutionSummary => "execution_summary",
            TurnMessageType::Delegation => "delegation",
            TurnMessageType::Error => "error",
        }
    }
}

/// 单条轮次消息；发出后不可修改（字段私有，只能在发出前用 with_meta 构建）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnMessage {
    #[serde(rename = "type")]
    kind: TurnMessageType,
    content: String,
    #[serde(default)]
    metadata: Map<String, Value>,
}

impl TurnMessage {
    pub fn new(kind: TurnMessageType, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            metadata: Map::new(),
        }
    }

    pub fn response(content: impl Into<String>) -> Self {
        Self::new(TurnMessageType::Response, content)
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::new(TurnMessageType::Error, content)
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn kind(&self) -> TurnMessageType {
        self.kind
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    pub fn meta(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// 流式阶段的 response 片段（持久化时由完整 assistant 文本代替）
    pub fn is_stream_chunk(&self) -> bool {
        self.meta("stream_chunk").and_then(Value::as_bool).unwrap_or(false)
    }
}
