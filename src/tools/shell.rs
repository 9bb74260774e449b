//! 本地命令执行服务：CommandService 的进程内实现
//!
//! 白名单命令（首词，如 ls、grep、cat）直接执行；其余命令进入 pending_approval，
//! 由人工通过 resolve_approval 批准或拒绝；禁止子串（rm -rf、mkfs 等）直接报错。
//! 审批超时或被取消时运行时调用 withdraw_approval，之后迟到的批准不会再执行该命令。
//! 执行通过 sh -c / cmd /C，带超时与 tracing 审计。

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::tools::outcome::{ApprovalRecord, CommandResponse, ExecutionOutcome, PendingCommand, SessionInfo};
use crate::tools::service::CommandService;

/// 默认禁止的子串（即使人工批准也不执行）
pub const DEFAULT_FORBIDDEN_PATTERNS: &[&str] = &[
    "rm -rf /",
    "rm -fr /",
    "mkfs",
    "dd if=",
    "> /dev/sd",
    ":(){ :|:& };:",
];

/// 风险提示：(子串, 原因, 风险等级)
const RISK_HINTS: &[(&str, &str, &str)] = &[
    ("sudo ", "runs with elevated privileges", "high"),
    ("rm ", "deletes files", "high"),
    ("chmod ", "changes file permissions", "medium"),
    ("chown ", "changes file ownership", "medium"),
    ("curl ", "accesses the network", "medium"),
    ("wget ", "accesses the network", "medium"),
    ("| sh", "pipes data into a shell", "high"),
    ("| bash", "pipes data into a shell", "high"),
    ("> ", "overwrites a file", "medium"),
    ("kill ", "terminates processes", "medium"),
];

#[derive(Debug, Default)]
struct LocalSession {
    pending: Option<PendingCommand>,
    /// resolve_approval 正在执行已批准命令，防止重复处理
    resolving: bool,
    history: Vec<ApprovalRecord>,
}

/// 进程内命令执行服务
pub struct LocalCommandService {
    allowed_commands: HashSet<String>,
    forbidden_patterns: Vec<String>,
    timeout_secs: u64,
    sessions: Mutex<HashMap<String, LocalSession>>,
}

impl LocalCommandService {
    pub fn new(allowed_commands: Vec<String>, forbidden_patterns: Vec<String>, timeout_secs: u64) -> Self {
        let allowed_commands = allowed_commands
            .into_iter()
            .map(|s| s.to_lowercase())
            .collect();
        Self {
            allowed_commands,
            forbidden_patterns: forbidden_patterns.into_iter().map(|s| s.to_lowercase()).collect(),
            timeout_secs,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// 只取第一个 token 作为命令名
    fn command_name(raw: &str) -> &str {
        raw.split_whitespace().next().unwrap_or("")
    }

    fn forbidden_match(&self, raw: &str) -> Option<&str> {
        let lower = raw.to_lowercase();
        self.forbidden_patterns
            .iter()
            .find(|p| lower.contains(p.as_str()))
            .map(String::as_str)
    }

    fn is_allowlisted(&self, raw: &str) -> bool {
        let lower = raw.to_lowercase();
        let name = Self::command_name(&lower);
        // 带管道 / 重定向 / 串联时不自动放行
        let compound = ["|", ";", "&&", ">", "`", "$("].iter().any(|op| lower.contains(op));
        !name.is_empty() && !compound && self.allowed_commands.contains(name)
    }

    /// 评估风险等级与原因
    fn assess_risk(&self, raw: &str) -> (String, Vec<String>) {
        let lower = format!("{} ", raw.to_lowercase());
        let mut reasons = vec![format!("`{}` is not in the auto-approve allowlist", Self::command_name(raw))];
        let mut level = "low";
        for (needle, reason, risk) in RISK_HINTS {
            if lower.contains(needle) {
                reasons.push(reason.to_string());
                if *risk == "high" || level == "low" {
                    level = *risk;
                }
            }
        }
        (level.to_string(), reasons)
    }

    /// 在 shell 中执行命令；非零退出码视为错误
    async fn run(&self, command: &str) -> ExecutionOutcome {
        tracing::info!(command = %command, "local command execute");

        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", command]);
            c
        };
        cmd.kill_on_drop(true);

        let output = match tokio::time::timeout(Duration::from_secs(self.timeout_secs), cmd.output()).await {
            Err(_) => return ExecutionOutcome::failure(format!("Command timed out after {}s", self.timeout_secs)),
            Ok(Err(e)) => return ExecutionOutcome::failure(format!("Execution failed: {}", e)),
            Ok(Ok(o)) => o,
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        match output.status.code() {
            Some(0) => ExecutionOutcome::Success {
                stdout,
                stderr,
                exit_code: 0,
            },
            Some(code) => ExecutionOutcome::Failure {
                error: format!("Command exited with code {}", code),
                stderr,
            },
            None => ExecutionOutcome::Failure {
                error: "Command terminated by signal".to_string(),
                stderr,
            },
        }
    }

    /// 人工审批：批准则执行并记录 approved_by，拒绝则记录 denial_reason；
    /// 两种情况都在同一次加锁中清除 pending 并追加历史
    pub async fn resolve_approval(
        &self,
        session_id: &str,
        approve: bool,
        user: &str,
        comment: Option<String>,
    ) -> Result<ApprovalRecord, String> {
        let pending = {
            let mut sessions = self.sessions.lock().await;
            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| format!("Unknown session: {}", session_id))?;
            if session.resolving {
                return Err("Approval is already being resolved".to_string());
            }
            let pending = session
                .pending
                .clone()
                .ok_or_else(|| "No command is awaiting approval".to_string())?;
            session.resolving = true;
            pending
        };

        let record = if approve {
            let result = self.run(&pending.command).await;
            ApprovalRecord {
                command: pending.command.clone(),
                approved_by: Some(user.to_string()),
                approval_comment: comment,
                denial_reason: None,
                result,
            }
        } else {
            let reason = comment.unwrap_or_else(|| format!("Denied by {}", user));
            ApprovalRecord {
                command: pending.command.clone(),
                approved_by: None,
                approval_comment: None,
                denial_reason: Some(reason.clone()),
                result: ExecutionOutcome::failure(format!("Command denied: {}", reason)),
            }
        };

        let mut sessions = self.sessions.lock().await;
        let session = sessions.entry(session_id.to_string()).or_default();
        session.pending = None;
        session.resolving = false;
        session.history.push(record.clone());
        tracing::info!(
            session = %session_id,
            command = %record.command,
            approved = approve,
            "approval resolved"
        );
        Ok(record)
    }

    /// 当前待审批命令（供 CLI / UI 展示）
    pub async fn pending_command(&self, session_id: &str) -> Option<PendingCommand> {
        self.sessions
            .lock()
            .await
            .get(session_id)
            .and_then(|s| s.pending.clone())
    }
}

#[async_trait]
impl CommandService for LocalCommandService {
    async fn has_session(&self, session_id: &str) -> Result<bool, String> {
        Ok(self.sessions.lock().await.contains_key(session_id))
    }

    async fn create_session(&self, session_id: &str) -> Result<(), String> {
        self.sessions
            .lock()
            .await
            .entry(session_id.to_string())
            .or_default();
        Ok(())
    }

    async fn execute_command(
        &self,
        session_id: &str,
        command: &str,
        host: &str,
        description: &str,
    ) -> Result<CommandResponse, String> {
        let command = command.trim();
        if command.is_empty() {
            return Ok(CommandResponse::error("Empty command", ""));
        }
        if let Some(pattern) = self.forbidden_match(command) {
            return Ok(CommandResponse::error(format!("Forbidden pattern: {}", pattern), ""));
        }
        if host != "main" && host != "localhost" {
            return Ok(CommandResponse::error(format!("Unknown host: {}", host), ""));
        }

        if !self.is_allowlisted(command) {
            let (risk, reasons) = self.assess_risk(command);
            let mut sessions = self.sessions.lock().await;
            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| format!("Unknown session: {}", session_id))?;
            if session.pending.is_some() {
                return Ok(CommandResponse::error(
                    "Another command is already awaiting approval",
                    "",
                ));
            }
            let ui_message = format!(
                "⚠️ Approval required ({} risk)\nCommand: {}\nPurpose: {}\nReasons: {}",
                risk,
                command,
                description,
                reasons.join("; ")
            );
            session.pending = Some(PendingCommand {
                command: command.to_string(),
                description: description.to_string(),
                risk_level: risk.clone(),
                reasons: reasons.clone(),
                requested_at: Utc::now(),
            });
            return Ok(CommandResponse::pending(risk, reasons, ui_message));
        }

        let result = self.run(command).await;
        let mut sessions = self.sessions.lock().await;
        sessions
            .entry(session_id.to_string())
            .or_default()
            .history
            .push(ApprovalRecord {
                command: command.to_string(),
                approved_by: None,
                approval_comment: None,
                denial_reason: None,
                result: result.clone(),
            });
        Ok(match result {
            ExecutionOutcome::Success { stdout, stderr, exit_code } => CommandResponse::success(stdout, stderr, exit_code),
            ExecutionOutcome::Failure { error, stderr } => CommandResponse::error(error, stderr),
            ExecutionOutcome::PendingApproval { .. } => CommandResponse::error("Unexpected pending state", ""),
        })
    }

    async fn get_session_info(&self, session_id: &str) -> Result<Option<SessionInfo>, String> {
        Ok(self.sessions.lock().await.get(session_id).map(|s| SessionInfo {
            session_id: session_id.to_string(),
            pending_approval: s.pending.clone(),
            command_history: s.history.clone(),
        }))
    }

    async fn withdraw_approval(&self, session_id: &str, command: &str, reason: &str) -> Result<bool, String> {
        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.get_mut(session_id) else {
            return Ok(false);
        };
        // 已批准的命令正在执行，无法撤回；结果会照常写入历史
        if session.resolving {
            return Ok(false);
        }
        match &session.pending {
            Some(p) if p.command == command => {}
            _ => return Ok(false),
        }
        session.pending = None;
        session.history.push(ApprovalRecord {
            command: command.to_string(),
            approved_by: None,
            approval_comment: None,
            denial_reason: Some(reason.to_string()),
            result: ExecutionOutcome::failure(format!("Approval withdrawn: {}", reason)),
        });
        tracing::info!(session = %session_id, command = %command, reason = %reason, "pending approval withdrawn");
        Ok(true)
    }
}
