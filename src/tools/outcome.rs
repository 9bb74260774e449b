//! 命令执行结果与协作方（命令执行服务）的数据结构
//!
//! CommandResponse 是协作方的线上格式；ExecutionOutcome 是运行时内部使用的标签联合。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 命令执行结局：成功 / 待审批 / 失败
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success {
        stdout: String,
        stderr: String,
        exit_code: i32,
    },
    PendingApproval {
        risk_level: String,
        reasons: Vec<String>,
        approval_ui_text: String,
    },
    Failure {
        error: String,
        stderr: String,
    },
}

impl ExecutionOutcome {
    pub fn failure(error: impl Into<String>) -> Self {
        ExecutionOutcome::Failure {
            error: error.into(),
            stderr: String::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Success { .. })
    }

    pub fn status(&self) -> CommandStatus {
        match self {
            ExecutionOutcome::Success { .. } => CommandStatus::Success,
            ExecutionOutcome::PendingApproval { .. } => CommandStatus::PendingApproval,
            ExecutionOutcome::Failure { .. } => CommandStatus::Error,
        }
    }
}

/// 协作方上报的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Success,
    PendingApproval,
    Error,
}

/// execute_command 的线上响应，字段按状态选填
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub status: Option<CommandStatus>,
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub stderr: Option<String>,
    #[serde(default)]
    pub return_code: Option<i32>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub risk: Option<String>,
    #[serde(default)]
    pub reasons: Option<Vec<String>>,
    #[serde(default)]
    pub approval_ui_message: Option<String>,
}

impl CommandResponse {
    pub fn success(stdout: impl Into<String>, stderr: impl Into<String>, return_code: i32) -> Self {
        Self {
            status: Some(CommandStatus::Success),
            stdout: Some(stdout.into()),
            stderr: Some(stderr.into()),
            return_code: Some(return_code),
            ..Default::default()
        }
    }

    pub fn pending(risk: impl Into<String>, reasons: Vec<String>, ui_message: impl Into<String>) -> Self {
        Self {
            status: Some(CommandStatus::PendingApproval),
            risk: Some(risk.into()),
            reasons: Some(reasons),
            approval_ui_message: Some(ui_message.into()),
            ..Default::default()
        }
    }

    pub fn error(error: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(CommandStatus::Error),
            error: Some(error.into()),
            stderr: Some(stderr.into()),
            ..Default::default()
        }
    }

    /// 只按 status 分支；缺失 status 视为错误
    pub fn into_outcome(self) -> ExecutionOutcome {
        match self.status {
            Some(CommandStatus::Success) => ExecutionOutcome::Success {
                stdout: self.stdout.unwrap_or_default(),
                stderr: self.stderr.unwrap_or_default(),
                exit_code: self.return_code.unwrap_or(0),
            },
            Some(CommandStatus::PendingApproval) => ExecutionOutcome::PendingApproval {
                risk_level: self.risk.unwrap_or_else(|| "unknown".to_string()),
                reasons: self.reasons.unwrap_or_default(),
                approval_ui_text: self
                    .approval_ui_message
                    .unwrap_or_else(|| "Command requires approval".to_string()),
            },
            Some(CommandStatus::Error) => ExecutionOutcome::Failure {
                error: self.error.unwrap_or_else(|| "Unknown error".to_string()),
                stderr: self.stderr.unwrap_or_default(),
            },
            None => ExecutionOutcome::Failure {
                error: self
                    .error
                    .unwrap_or_else(|| "Command service returned no status".to_string()),
                stderr: self.stderr.unwrap_or_default(),
            },
        }
    }
}

/// 会话历史中的一条记录；只会追加，不会回退
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub command: String,
    #[serde(default)]
    pub approved_by: Option<String>,
    #[serde(default)]
    pub approval_comment: Option<String>,
    #[serde(default)]
    pub denial_reason: Option<String>,
    pub result: ExecutionOutcome,
}

/// 正在等待审批的命令
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCommand {
    pub command: String,
    pub description: String,
    pub risk_level: String,
    pub reasons: Vec<String>,
    pub requested_at: DateTime<Utc>,
}

/// get_session_info 的返回
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    #[serde(default)]
    pub pending_approval: Option<PendingCommand>,
    #[serde(default)]
    pub command_history: Vec<ApprovalRecord>,
}
