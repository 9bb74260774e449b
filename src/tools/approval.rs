//! 审批握手控制器：轮询式状态机
//!
//! Requested -> {Approved, Denied, TimedOut}（终态）。按固定间隔查询协作方的会话状态，
//! 直到目标命令的历史记录出现或超过最大等待时长。状态只前进不回退；重复轮询是幂等的。
//!
//! 若 pending_approval 已被清除但历史中迟迟没有对应记录（协作方可能因无关原因清除了标记），
//! 连续 missing_entry_grace_ticks 次轮询后按超时处理，避免无界等待；期间再次看到 pending 则重新计数。
//!
//! 超时或取消时通过 withdraw_approval 撤回待审批命令，保证超时后不会再执行它。
//! 撤回失败（审批恰好在同一时刻完成）时再查询一次历史，以协作方的真实结果为准。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::core::RuntimeError;
use crate::tools::outcome::{ApprovalRecord, ExecutionOutcome, SessionInfo};
use crate::tools::service::CommandService;

/// 轮询参数：间隔、最大等待、缺失记录宽限次数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApprovalPolicy {
    pub poll_interval: Duration,
    pub max_wait: Duration,
    pub missing_entry_grace_ticks: u32,
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            max_wait: Duration::from_secs(3600),
            missing_entry_grace_ticks: 20,
        }
    }
}

/// 审批状态；Resolving 表示 pending 已清除、正在等待历史记录出现（非终态）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "approval_status", rename_all = "snake_case")]
pub enum ApprovalState {
    Requested,
    Resolving,
    Approved {
        approved_by: String,
        comment: Option<String>,
        outcome: ExecutionOutcome,
    },
    Denied {
        reason: String,
    },
    TimedOut {
        waited_secs: u64,
    },
}

impl ApprovalState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ApprovalState::Approved { .. } | ApprovalState::Denied { .. } | ApprovalState::TimedOut { .. }
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            ApprovalState::Requested => "requested",
            ApprovalState::Resolving => "resolving",
            ApprovalState::Approved { .. } => "approved",
            ApprovalState::Denied { .. } => "denied",
            ApprovalState::TimedOut { .. } => "timed_out",
        }
    }

    /// 由历史记录判定：有 approved_by 即批准，否则为拒绝
    fn from_record(record: &ApprovalRecord) -> Self {
        match (&record.approved_by, &record.denial_reason) {
            (Some(user), None) => ApprovalState::Approved {
                approved_by: user.clone(),
                comment: record.approval_comment.clone(),
                outcome: record.result.clone(),
            },
            (_, reason) => ApprovalState::Denied {
                reason: reason
                    .clone()
                    .unwrap_or_else(|| "Command was denied".to_string()),
            },
        }
    }
}

/// 审批控制器：只读协作方状态
pub struct ApprovalController {
    service: Arc<dyn CommandService>,
    policy: ApprovalPolicy,
}

impl ApprovalController {
    pub fn new(service: Arc<dyn CommandService>, policy: ApprovalPolicy) -> Self {
        Self { service, policy }
    }

    pub fn policy(&self) -> &ApprovalPolicy {
        &self.policy
    }

    /// 等待 command 的审批结果；每次状态前进都调用 on_transition（先调用一次 Requested）。
    /// 取消令牌触发时撤回待审批命令并返回 Err(Cancelled)。
    pub async fn await_resolution<F>(
        &self,
        session_id: &str,
        command: &str,
        cancel: &CancellationToken,
        mut on_transition: F,
    ) -> Result<ApprovalState, RuntimeError>
    where
        F: FnMut(&ApprovalState) + Send,
    {
        let mut state = ApprovalState::Requested;
        on_transition(&state);

        // 只在基线之后查找记录，避免匹配到同名命令的旧历史
        let baseline = match self.service.get_session_info(session_id).await {
            Ok(Some(info)) if info.pending_approval.is_some() => info.command_history.len(),
            Ok(Some(info)) => baseline_before_match(&info, command),
            _ => 0,
        };
        let started = Instant::now();
        let mut missing_ticks: u32 = 0;

        loop {
            if started.elapsed() >= self.policy.max_wait {
                return Ok(self
                    .time_out(session_id, command, baseline, started, &mut on_transition)
                    .await);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!(session = %session_id, command = %command, "approval wait cancelled");
                    self.withdraw(session_id, command, "approval wait was cancelled").await;
                    return Err(RuntimeError::Cancelled);
                }
                _ = tokio::time::sleep(self.policy.poll_interval) => {}
            }

            let info = match self.service.get_session_info(session_id).await {
                Ok(Some(info)) => info,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(session = %session_id, error = %e, "session poll failed, retrying");
                    continue;
                }
            };

            if info.pending_approval.is_some() {
                missing_ticks = 0;
                continue;
            }

            match find_record(&info, baseline, command) {
                Some(record) => {
                    let resolved = ApprovalState::from_record(record);
                    tracing::info!(
                        session = %session_id,
                        command = %command,
                        status = resolved.label(),
                        "approval resolved"
                    );
                    on_transition(&resolved);
                    return Ok(resolved);
                }
                None => {
                    if state == ApprovalState::Requested {
                        state = ApprovalState::Resolving;
                        on_transition(&state);
                    }
                    missing_ticks += 1;
                    if missing_ticks >= self.policy.missing_entry_grace_ticks {
                        tracing::warn!(
                            session = %session_id,
                            command = %command,
                            ticks = missing_ticks,
                            "pending approval cleared but no history entry appeared"
                        );
                        return Ok(self
                            .time_out(session_id, command, baseline, started, &mut on_transition)
                            .await);
                    }
                }
            }
        }
    }

    /// 超时：先撤回；没有可撤回的项时以历史中的最终记录为准
    async fn time_out<F>(
        &self,
        session_id: &str,
        command: &str,
        baseline: usize,
        started: Instant,
        on_transition: &mut F,
    ) -> ApprovalState
    where
        F: FnMut(&ApprovalState),
    {
        let waited_secs = started.elapsed().as_secs();
        let withdrawn = self
            .withdraw(session_id, command, &format!("approval timed out after {}s", waited_secs))
            .await;

        if !withdrawn {
            if let Ok(Some(info)) = self.service.get_session_info(session_id).await {
                if info.pending_approval.is_none() {
                    if let Some(record) = find_record(&info, baseline, command) {
                        let resolved = ApprovalState::from_record(record);
                        tracing::info!(
                            session = %session_id,
                            command = %command,
                            status = resolved.label(),
                            "approval resolved at the deadline"
                        );
                        on_transition(&resolved);
                        return resolved;
                    }
                }
            }
        }

        let state = ApprovalState::TimedOut { waited_secs };
        tracing::warn!(session = %session_id, command = %command, withdrawn, "approval timed out");
        on_transition(&state);
        state
    }

    async fn withdraw(&self, session_id: &str, command: &str, reason: &str) -> bool {
        match self.service.withdraw_approval(session_id, command, reason).await {
            Ok(withdrawn) => withdrawn,
            Err(e) => {
                tracing::warn!(session = %session_id, command = %command, error = %e, "failed to withdraw pending approval");
                false
            }
        }
    }
}

/// 首次查询时已无 pending：若最后一条就是目标命令，说明审批在首次查询前已完成
fn baseline_before_match(info: &SessionInfo, command: &str) -> usize {
    let len = info.command_history.len();
    match info.command_history.last() {
        Some(last) if last.command == command => len - 1,
        _ => len,
    }
}

fn find_record<'a>(info: &'a SessionInfo, baseline: usize, command: &str) -> Option<&'a ApprovalRecord> {
    info.command_history
        .iter()
        .skip(baseline)
        .find(|r| r.command == command)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::outcome::{CommandResponse, PendingCommand};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// 按脚本返回会话快照：前 pending_polls 次仍在等待，之后返回 resolution
    struct ScriptedSession {
        polls: Mutex<u32>,
        pending_polls: u32,
        resolution: Option<ApprovalRecord>,
        history_before: Vec<ApprovalRecord>,
        /// 奇数次轮询 pending，偶数次清除但无记录
        flapping: bool,
        /// 撤回时审批恰好完成：撤回失败，下一次查询即可看到 resolution
        settle_on_withdraw: bool,
        settled: AtomicBool,
        withdrawn: Mutex<Vec<String>>,
    }

    impl ScriptedSession {
        fn new(pending_polls: u32, resolution: Option<ApprovalRecord>) -> Self {
            Self {
                polls: Mutex::new(0),
                pending_polls,
                resolution,
                history_before: Vec::new(),
                flapping: false,
                settle_on_withdraw: false,
                settled: AtomicBool::new(false),
                withdrawn: Mutex::new(Vec::new()),
            }
        }

        fn withdrawn(&self) -> Vec<String> {
            self.withdrawn.lock().unwrap().clone()
        }
    }

    fn pending(command: &str) -> PendingCommand {
        PendingCommand {
            command: command.into(),
            description: String::new(),
            risk_level: "high".into(),
            reasons: vec![],
            requested_at: Utc::now(),
        }
    }

    #[async_trait]
    impl CommandService for ScriptedSession {
        async fn has_session(&self, _: &str) -> Result<bool, String> {
            Ok(true)
        }
        async fn create_session(&self, _: &str) -> Result<(), String> {
            Ok(())
        }
        async fn execute_command(&self, _: &str, _: &str, _: &str, _: &str) -> Result<CommandResponse, String> {
            Err("not used".into())
        }
        async fn get_session_info(&self, session_id: &str) -> Result<Option<SessionInfo>, String> {
            let n = {
                let mut polls = self.polls.lock().unwrap();
                *polls += 1;
                *polls
            };
            let mut history = self.history_before.clone();
            let still_pending = if self.settled.load(Ordering::SeqCst) {
                false
            } else if self.flapping {
                n % 2 == 1
            } else {
                n <= self.pending_polls || self.pending_polls == u32::MAX
            };
            let pending_approval = if still_pending {
                Some(pending("rm -rf build"))
            } else if self.flapping {
                None
            } else {
                if let Some(r) = &self.resolution {
                    history.push(r.clone());
                }
                None
            };
            Ok(Some(SessionInfo {
                session_id: session_id.into(),
                pending_approval,
                command_history: history,
            }))
        }
        async fn withdraw_approval(&self, _: &str, command: &str, _: &str) -> Result<bool, String> {
            self.withdrawn.lock().unwrap().push(command.to_string());
            if self.settle_on_withdraw {
                self.settled.store(true, Ordering::SeqCst);
                return Ok(false);
            }
            Ok(self.pending_polls == u32::MAX)
        }
    }

    fn fast_policy() -> ApprovalPolicy {
        ApprovalPolicy {
            poll_interval: Duration::from_millis(5),
            max_wait: Duration::from_millis(200),
            missing_entry_grace_ticks: 4,
        }
    }

    fn record(approved_by: Option<&str>, denial: Option<&str>) -> ApprovalRecord {
        ApprovalRecord {
            command: "rm -rf build".into(),
            approved_by: approved_by.map(String::from),
            approval_comment: Some("ok".into()),
            denial_reason: denial.map(String::from),
            result: ExecutionOutcome::Success {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: 0,
            },
        }
    }

    #[tokio::test]
    async fn test_never_resolved_times_out() {
        let svc = Arc::new(ScriptedSession::new(u32::MAX, None));
        let ctl = ApprovalController::new(svc.clone(), fast_policy());
        let started = Instant::now();
        let state = ctl
            .await_resolution("s", "rm -rf build", &CancellationToken::new(), |_| {})
            .await
            .unwrap();
        assert!(matches!(state, ApprovalState::TimedOut { .. }));
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(svc.withdrawn(), vec!["rm -rf build".to_string()]);
    }

    #[tokio::test]
    async fn test_resolution_racing_the_deadline_wins() {
        let mut svc = ScriptedSession::new(u32::MAX, Some(record(Some("alice"), None)));
        svc.settle_on_withdraw = true;
        let svc = Arc::new(svc);
        let ctl = ApprovalController::new(
            svc.clone(),
            ApprovalPolicy {
                max_wait: Duration::from_millis(30),
                ..fast_policy()
            },
        );
        let mut seen = Vec::new();
        let state = ctl
            .await_resolution("s", "rm -rf build", &CancellationToken::new(), |s| seen.push(s.label()))
            .await
            .unwrap();
        assert!(matches!(state, ApprovalState::Approved { ref approved_by, .. } if approved_by == "alice"));
        assert_eq!(seen, vec!["requested", "approved"]);
        assert_eq!(svc.withdrawn().len(), 1);
    }

    #[tokio::test]
    async fn test_flapping_pending_restarts_grace_count() {
        // pending 反复出现时缺失计数归零，只能由 max_wait 结束等待
        let mut svc = ScriptedSession::new(0, None);
        svc.flapping = true;
        let ctl = ApprovalController::new(Arc::new(svc), fast_policy());
        let started = Instant::now();
        let state = ctl
            .await_resolution("s", "rm -rf build", &CancellationToken::new(), |_| {})
            .await
            .unwrap();
        assert!(matches!(state, ApprovalState::TimedOut { .. }));
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_approved_after_polling() {
        let svc = Arc::new(ScriptedSession::new(3, Some(record(Some("alice"), None))));
        let ctl = ApprovalController::new(svc, fast_policy());
        let mut seen = Vec::new();
        let state = ctl
            .await_resolution("s", "rm -rf build", &CancellationToken::new(), |s| seen.push(s.label()))
            .await
            .unwrap();
        match state {
            ApprovalState::Approved { approved_by, comment, outcome } => {
                assert_eq!(approved_by, "alice");
                assert_eq!(comment.as_deref(), Some("ok"));
                assert!(outcome.is_success());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(seen, vec!["requested", "approved"]);
    }

    #[tokio::test]
    async fn test_denied_carries_reason() {
        let svc = Arc::new(ScriptedSession::new(2, Some(record(None, Some("blocked by policy")))));
        let ctl = ApprovalController::new(svc, fast_policy());
        let state = ctl
            .await_resolution("s", "rm -rf build", &CancellationToken::new(), |_| {})
            .await
            .unwrap();
        assert_eq!(state, ApprovalState::Denied { reason: "blocked by policy".into() });
    }

    #[tokio::test]
    async fn test_cleared_without_record_uses_grace() {
        let svc = Arc::new(ScriptedSession::new(1, None));
        let ctl = ApprovalController::new(
            svc,
            ApprovalPolicy {
                max_wait: Duration::from_secs(60),
                ..fast_policy()
            },
        );
        let mut seen = Vec::new();
        let started = Instant::now();
        let state = ctl
            .await_resolution("s", "rm -rf build", &CancellationToken::new(), |s| seen.push(s.label()))
            .await
            .unwrap();
        assert!(matches!(state, ApprovalState::TimedOut { .. }));
        assert_eq!(seen, vec!["requested", "resolving", "timed_out"]);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_stale_history_entry_is_ignored() {
        // 同名命令的旧记录在基线之前，不能被当作本次审批结果
        let mut svc = ScriptedSession::new(1, None);
        svc.history_before = vec![record(Some("old"), None)];
        let ctl = ApprovalController::new(
            Arc::new(svc),
            ApprovalPolicy {
                max_wait: Duration::from_secs(60),
                ..fast_policy()
            },
        );
        let state = ctl
            .await_resolution("s", "rm -rf build", &CancellationToken::new(), |_| {})
            .await
            .unwrap();
        assert!(matches!(state, ApprovalState::TimedOut { .. }));
    }

    #[tokio::test]
    async fn test_cancel_aborts_wait() {
        let svc = Arc::new(ScriptedSession::new(u32::MAX, None));
        let ctl = ApprovalController::new(
            svc.clone(),
            ApprovalPolicy {
                max_wait: Duration::from_secs(60),
                ..fast_policy()
            },
        );
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let result = ctl.await_resolution("s", "rm -rf build", &token, |_| {}).await;
        assert!(matches!(result, Err(RuntimeError::Cancelled)));
        assert_eq!(svc.withdrawn(), vec!["rm -rf build".to_string()]);
    }
}
