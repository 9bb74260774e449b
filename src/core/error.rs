//! 运行时错误类型与命令失败分类结果
//!
//! RuntimeError 只描述「本轮无法继续」的情况（LLM 流失败、取消等）；
//! 命令本身的失败不走 Err，而是经 ErrorClassifier 映射为 CommandFailure 按值返回。

use serde::Serialize;
use thiserror::Error;

/// 运行时错误：对当前轮次致命，但不影响会话本身
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Token stream timed out after {0}s")]
    StreamTimeout(u64),

    /// 持久化失败只记录日志并计数，不中断轮次
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Cancelled")]
    Cancelled,
}

/// 错误分类结果：可修复时附带给模型的重试建议
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorClassification {
    pub repairable: bool,
    pub message: String,
    pub suggestion: Option<String>,
}

/// 命令失败的两类结局（按值返回，由编排器显式分支）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandFailure {
    /// 模型可以换种方式重试
    Repairable(ErrorClassification),
    /// 不可恢复（如内存耗尽），不再给出重试建议
    Critical { message: String },
}

impl CommandFailure {
    pub fn is_repairable(&self) -> bool {
        matches!(self, CommandFailure::Repairable(_))
    }

    pub fn message(&self) -> &str {
        match self {
            CommandFailure::Repairable(c) => &c.message,
            CommandFailure::Critical { message } => message,
        }
    }

    pub fn suggestion(&self) -> Option<&str> {
        match self {
            CommandFailure::Repairable(c) => c.suggestion.as_deref(),
            CommandFailure::Critical { .. } => None,
        }
    }
}
