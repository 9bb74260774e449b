//! 轮次编排器：流式接收 -> 解析 -> 执行（可选审批）-> 解释 -> 持久化 -> 继续/结束
//!
//! 每轮最多执行一个 execute_command；respond 终止本轮剩余调用的处理，delegate 只登记。
//! 与模型通信的任何失败都只产生一条 error 消息并结束本轮，不自动重试。
//! 可选 events：逐条推送 TurnMessage，UI 无需自己轮询。

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::{CommandFailure, ErrorClassifier, LoopControlSignal, RuntimeError, TurnPhase};
use crate::llm::LlmClient;
use crate::memory::{ConversationMemory, Message, PersistenceService};
use crate::react::control::{handle_control, ControlEffect, PendingDelegation};
use crate::react::events::{TurnMessage, TurnMessageType};
use crate::react::invocation::ToolInvocation;
use crate::react::parser::{normalize_tag_quirks, ParserStatsSnapshot, TagParser, ToolCallParser};
use crate::react::prompt::{build_system_prompt, feedback_message, interpretation_messages, FeedbackItem};
use crate::tools::approval::{ApprovalController, ApprovalPolicy, ApprovalState};
use crate::tools::executor::CommandStage;
use crate::tools::outcome::ExecutionOutcome;
use crate::tools::schema::ExecuteCommandParams;
use crate::tools::service::CommandService;

pub const DEFAULT_MAX_ITERATIONS: usize = 10;
pub const DEFAULT_STREAM_TIMEOUT_SECS: u64 = 120;

const APPROVED_NOTICE: &str = "✅ Command approved and executed!";
const ASSISTANT_SENDER: &str = "assistant";

/// 本轮的一条执行结果
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionRecord {
    /// 命令已运行（直接执行或审批后执行）
    Command {
        command: String,
        outcome: ExecutionOutcome,
        approved: bool,
        failure: Option<CommandFailure>,
    },
    /// 审批被拒绝，命令未运行
    Denied { command: String, reason: String },
    /// 审批超时，命令未运行
    TimedOut { command: String, waited_secs: u64 },
    Delegation(PendingDelegation),
}

impl ExecutionRecord {
    pub fn ran(&self) -> bool {
        matches!(self, ExecutionRecord::Command { .. })
    }

    pub fn succeeded(&self) -> bool {
        matches!(self, ExecutionRecord::Command { outcome, .. } if outcome.is_success())
    }

    fn feedback(&self) -> FeedbackItem {
        match self {
            ExecutionRecord::Command { command, outcome, failure, .. } => {
                let mut item = FeedbackItem::from_outcome(command, outcome);
                item.suggestion = failure.as_ref().and_then(|f| f.suggestion()).map(String::from);
                item
            }
            ExecutionRecord::Denied { command, reason } => {
                FeedbackItem::note(command.as_str(), format!("was denied by the approver: {}", reason))
            }
            ExecutionRecord::TimedOut { command, waited_secs } => FeedbackItem::note(
                command.as_str(),
                format!("was not executed: approval timed out after {}s", waited_secs),
            ),
            ExecutionRecord::Delegation(d) => FeedbackItem::note(
                format!("delegate: {}", d.task),
                "was recorded for a sub-agent",
            ),
        }
    }
}

/// 单轮结果
#[derive(Debug, Default)]
pub struct TurnReport {
    pub messages: Vec<TurnMessage>,
    pub assistant_text: String,
    pub control: LoopControlSignal,
    pub records: Vec<ExecutionRecord>,
    pub phases: Vec<TurnPhase>,
    /// 与模型通信失败或被取消
    pub fatal: Option<RuntimeError>,
    /// 命令遇到不可恢复错误
    pub critical: bool,
    /// 下一轮的反馈上下文（本轮有执行结果时）
    pub feedback: Option<Message>,
    /// 交付持久化失败的条数
    pub persistence_failures: usize,
}

impl TurnReport {
    /// 是否进入下一轮：没有致命/严重失败，respond 未要求结束，且本轮产生了可反馈的内容
    pub fn should_continue(&self) -> bool {
        self.fatal.is_none()
            && !self.critical
            && !self.control.break_loop
            && (self.feedback.is_some() || self.control.respond_content.is_some())
    }

    pub fn total_commands(&self) -> usize {
        self.records.iter().filter(|r| r.ran()).count()
    }

    pub fn successful_commands(&self) -> usize {
        self.records.iter().filter(|r| r.succeeded()).count()
    }

    fn last_error(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.kind() == TurnMessageType::Error)
            .map(|m| m.content())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Responded,
    NoToolCall,
    CriticalFailure,
    Fatal,
    IterationCap,
    Cancelled,
}

/// 多轮循环结果
#[derive(Debug)]
pub struct ConversationOutcome {
    pub final_answer: Option<String>,
    pub turns: usize,
    pub stop_reason: StopReason,
    pub messages: Vec<TurnMessage>,
}

/// 收集本轮消息并即时推送
struct TurnEmitter<'a> {
    events: Option<&'a mpsc::UnboundedSender<TurnMessage>>,
    messages: Vec<TurnMessage>,
}

impl<'a> TurnEmitter<'a> {
    fn new(events: Option<&'a mpsc::UnboundedSender<TurnMessage>>) -> Self {
        Self {
            events,
            messages: Vec::new(),
        }
    }

    fn emit(&mut self, msg: TurnMessage) {
        if let Some(tx) = self.events {
            let _ = tx.send(msg.clone());
        }
        self.messages.push(msg);
    }
}

/// 轮次编排器；协作方全部通过构造函数注入
pub struct TurnOrchestrator {
    llm: Arc<dyn LlmClient>,
    parser: Arc<dyn ToolCallParser>,
    stage: CommandStage,
    approval: ApprovalController,
    classifier: ErrorClassifier,
    persistence: Arc<dyn PersistenceService>,
    system_prompt: String,
    stream_timeout: Duration,
    max_iterations: usize,
    rag_used: bool,
}

impl TurnOrchestrator {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        commands: Arc<dyn CommandService>,
        persistence: Arc<dyn PersistenceService>,
    ) -> Self {
        Self {
            llm,
            parser: Arc::new(TagParser::new()),
            stage: CommandStage::new(Arc::clone(&commands), "main"),
            approval: ApprovalController::new(commands, ApprovalPolicy::default()),
            classifier: ErrorClassifier::new(),
            persistence,
            system_prompt: build_system_prompt(None),
            stream_timeout: Duration::from_secs(DEFAULT_STREAM_TIMEOUT_SECS),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            rag_used: false,
        }
    }

    pub fn with_parser(mut self, parser: Arc<dyn ToolCallParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn with_approval_policy(mut self, policy: ApprovalPolicy) -> Self {
        self.approval = ApprovalController::new(Arc::clone(self.stage.service()), policy);
        self
    }

    pub fn with_default_host(mut self, host: impl Into<String>) -> Self {
        self.stage = CommandStage::new(Arc::clone(self.stage.service()), host);
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_stream_timeout(mut self, timeout: Duration) -> Self {
        self.stream_timeout = timeout;
        self
    }

    pub fn with_max_iterations(mut self, n: usize) -> Self {
        self.max_iterations = n.max(1);
        self
    }

    /// 标记上游是否为本次请求做了检索增强（流式 chunk 的 rag_used 元数据）
    pub fn with_retrieval(mut self, rag_used: bool) -> Self {
        self.rag_used = rag_used;
        self
    }

    pub fn parser_stats(&self) -> ParserStatsSnapshot {
        self.parser.stats()
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    /// 运行单轮；history 为不含 system prompt 的对话上下文
    pub async fn run_turn(
        &self,
        session_id: &str,
        history: &[Message],
        is_first_turn: bool,
        cancel: &CancellationToken,
        events: Option<&mpsc::UnboundedSender<TurnMessage>>,
    ) -> TurnReport {
        let mut out = TurnEmitter::new(events);
        let mut report = TurnReport::default();

        report.phases.push(TurnPhase::Streaming);
        let mut request = Vec::with_capacity(history.len() + 1);
        request.push(Message::system(self.system_prompt.clone()));
        request.extend_from_slice(history);

        match self.stream_response(&request, cancel, &mut out, &mut report.assistant_text).await {
            Ok(()) => {}
            Err(e) => {
                tracing::error!(session = %session_id, error = %e, "model stream failed, ending turn");
                out.emit(TurnMessage::error(fatal_text(&e)));
                report.fatal = Some(e);
                return self.finish(session_id, report, out).await;
            }
        }

        report.phases.push(TurnPhase::Parsed);
        let invocations = self.parser.parse(&report.assistant_text, is_first_turn);
        if invocations.is_empty() {
            report.phases.push(TurnPhase::NoTool);
        }

        for invocation in &invocations {
            if invocation.is_execution() {
                report.phases.push(TurnPhase::ExecutingTool);
                if let Err(e) = self
                    .run_command(session_id, invocation, cancel, &mut out, &mut report)
                    .await
                {
                    tracing::error!(session = %session_id, error = %e, "turn aborted during command handling");
                    out.emit(TurnMessage::error(fatal_text(&e)));
                    report.fatal = Some(e);
                    return self.finish(session_id, report, out).await;
                }
                continue;
            }
            match handle_control(invocation) {
                Some(ControlEffect::Respond { signal, message }) => {
                    out.emit(message);
                    report.control = signal;
                    break;
                }
                Some(ControlEffect::Delegate { delegation, message }) => {
                    tracing::info!(session = %session_id, task = %delegation.task, "delegation recorded");
                    out.emit(message);
                    report.records.push(ExecutionRecord::Delegation(delegation));
                }
                None => {
                    tracing::debug!(tool = %invocation.name, "unknown tool skipped");
                }
            }
        }

        let total = report.total_commands();
        if total > 0 {
            if !report.phases.contains(&TurnPhase::Interpreting) {
                report.phases.push(TurnPhase::Interpreting);
            }
            let successful = report.successful_commands();
            out.emit(
                TurnMessage::new(
                    TurnMessageType::ExecutionSummary,
                    format!("Executed {} command(s), {} succeeded", total, successful),
                )
                .with_meta("total_commands", total as u64)
                .with_meta("successful_commands", successful as u64),
            );
        }
        if !report.records.is_empty() {
            let items: Vec<FeedbackItem> = report.records.iter().map(ExecutionRecord::feedback).collect();
            report.feedback = Some(feedback_message(&items, total, report.successful_commands()));
        }

        self.finish(session_id, report, out).await
    }

    /// 多轮循环：直到 respond 结束、无工具调用、致命/严重失败、取消或达到迭代上限
    pub async fn run_conversation(
        &self,
        session_id: &str,
        memory: &mut ConversationMemory,
        user_input: &str,
        cancel: &CancellationToken,
        events: Option<&mpsc::UnboundedSender<TurnMessage>>,
    ) -> ConversationOutcome {
        memory.push(Message::user(user_input));
        let mut messages = Vec::new();

        for turn in 1..=self.max_iterations {
            let is_first_turn = memory.is_first_turn();
            let report = self
                .run_turn(session_id, memory.messages(), is_first_turn, cancel, events)
                .await;
            if !report.assistant_text.is_empty() {
                memory.push(Message::assistant(report.assistant_text.clone()));
            }
            messages.extend(report.messages.iter().cloned());

            if report.should_continue() {
                let next = report
                    .feedback
                    .clone()
                    .unwrap_or_else(|| Message::user("Continue."));
                memory.push(next);
                continue;
            }

            let (stop_reason, final_answer) = if let Some(e) = &report.fatal {
                let reason = if matches!(e, RuntimeError::Cancelled) {
                    StopReason::Cancelled
                } else {
                    StopReason::Fatal
                };
                (reason, report.last_error().map(String::from))
            } else if report.critical {
                (StopReason::CriticalFailure, report.last_error().map(String::from))
            } else if report.control.break_loop {
                (StopReason::Responded, report.control.respond_content.clone())
            } else {
                (StopReason::NoToolCall, Some(report.assistant_text.clone()))
            };
            tracing::info!(session = %session_id, turns = turn, reason = ?stop_reason, "conversation loop finished");
            return ConversationOutcome {
                final_answer,
                turns: turn,
                stop_reason,
                messages,
            };
        }

        tracing::warn!(session = %session_id, cap = self.max_iterations, "iteration cap reached");
        let cap = TurnMessage::new(
            TurnMessageType::MetadataUpdate,
            format!("Stopped after reaching the maximum of {} iterations", self.max_iterations),
        )
        .with_meta("iteration_cap", self.max_iterations as u64);
        if let Some(tx) = events {
            let _ = tx.send(cap.clone());
        }
        self.persist_message(session_id, &cap).await;
        messages.push(cap);
        ConversationOutcome {
            final_answer: memory.last_assistant().map(|m| m.content.clone()),
            turns: self.max_iterations,
            stop_reason: StopReason::IterationCap,
            messages,
        }
    }

    /// 逐块接收：每块先归一化标签怪癖再拼接，并立即作为 response 推送
    async fn stream_response(
        &self,
        request: &[Message],
        cancel: &CancellationToken,
        out: &mut TurnEmitter<'_>,
        text: &mut String,
    ) -> Result<(), RuntimeError> {
        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RuntimeError::Cancelled),
            r = self.llm.complete_stream(request) => r.map_err(RuntimeError::Llm)?,
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RuntimeError::Cancelled),
                r = tokio::time::timeout(self.stream_timeout, stream.next()) => {
                    r.map_err(|_| RuntimeError::StreamTimeout(self.stream_timeout.as_secs()))?
                }
            };
            let chunk = match next {
                None => return Ok(()),
                Some(chunk) => chunk.map_err(RuntimeError::Llm)?,
            };
            if !chunk.response.is_empty() {
                let piece = normalize_tag_quirks(&chunk.response);
                text.push_str(&piece);
                out.emit(
                    TurnMessage::response(piece)
                        .with_meta("stream_chunk", true)
                        .with_meta("rag_used", self.rag_used),
                );
            }
            if chunk.done {
                return Ok(());
            }
        }
    }

    /// execute_command：执行 -> （待审批则等待）-> 成功解释 / 失败分类
    async fn run_command(
        &self,
        session_id: &str,
        invocation: &ToolInvocation,
        cancel: &CancellationToken,
        out: &mut TurnEmitter<'_>,
        report: &mut TurnReport,
    ) -> Result<(), RuntimeError> {
        let params = match invocation.params::<ExecuteCommandParams>() {
            Ok(p) => p,
            Err(e) => {
                let command = invocation
                    .parameters
                    .get("command")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let error = format!("Invalid execute_command parameters: {}", e);
                self.handle_failure(&command, &error, "", false, out, report);
                return Ok(());
            }
        };
        let command = params.command;
        // 未显式给出 host 时使用配置的默认主机
        let host = invocation.parameters.get("host").and_then(Value::as_str);

        out.emit(
            TurnMessage::new(TurnMessageType::TerminalCommand, command.clone())
                .with_meta("host", host.unwrap_or(self.stage.default_host()))
                .with_meta("description", invocation.description.clone()),
        );

        let outcome = self
            .stage
            .execute(session_id, &command, host, &invocation.description)
            .await;

        match outcome {
            ExecutionOutcome::Success { stdout, stderr, exit_code } => {
                self.handle_success(&command, stdout, stderr, exit_code, false, cancel, out, report)
                    .await
            }
            ExecutionOutcome::Failure { error, stderr } => {
                self.handle_failure(&command, &error, &stderr, false, out, report);
                Ok(())
            }
            ExecutionOutcome::PendingApproval {
                risk_level,
                reasons,
                approval_ui_text,
            } => {
                let content = if approval_ui_text.trim().is_empty() {
                    format!("Command requires approval: {}", command)
                } else {
                    approval_ui_text
                };
                out.emit(
                    TurnMessage::new(TurnMessageType::CommandApprovalRequest, content)
                        .with_meta("command", command.clone())
                        .with_meta("risk_level", risk_level)
                        .with_meta("reasons", reasons),
                );

                let state = self
                    .approval
                    .await_resolution(session_id, &command, cancel, |state| {
                        if *state != ApprovalState::Requested {
                            out.emit(approval_update(&command, state));
                        }
                    })
                    .await?;
                self.handle_resolution(&command, state, cancel, out, report).await
            }
        }
    }

    async fn handle_resolution(
        &self,
        command: &str,
        state: ApprovalState,
        cancel: &CancellationToken,
        out: &mut TurnEmitter<'_>,
        report: &mut TurnReport,
    ) -> Result<(), RuntimeError> {
        match state {
            ApprovalState::Approved {
                approved_by,
                comment,
                outcome,
            } => match outcome {
                ExecutionOutcome::Success { stdout, stderr, exit_code } => {
                    out.emit(
                        TurnMessage::response(APPROVED_NOTICE)
                            .with_meta("approved_by", approved_by)
                            .with_meta("approval_comment", comment),
                    );
                    self.handle_success(command, stdout, stderr, exit_code, true, cancel, out, report)
                        .await
                }
                ExecutionOutcome::Failure { error, stderr } => {
                    self.handle_failure(command, &error, &stderr, true, out, report);
                    Ok(())
                }
                ExecutionOutcome::PendingApproval { .. } => {
                    let error = "Approved command reported a pending state instead of a result";
                    self.handle_failure(command, error, "", true, out, report);
                    Ok(())
                }
            },
            ApprovalState::Denied { reason } => {
                out.emit(
                    TurnMessage::error(format!("❌ Command denied: {}", reason))
                        .with_meta("command", command)
                        .with_meta("approval_status", "denied"),
                );
                report.records.push(ExecutionRecord::Denied {
                    command: command.to_string(),
                    reason,
                });
                Ok(())
            }
            ApprovalState::TimedOut { waited_secs } => {
                self.approval_timed_out(command, waited_secs, out, report);
                Ok(())
            }
            ApprovalState::Requested | ApprovalState::Resolving => {
                tracing::warn!(command = %command, "approval wait ended in a non-terminal state");
                self.approval_timed_out(command, 0, out, report);
                Ok(())
            }
        }
    }

    fn approval_timed_out(&self, command: &str, waited_secs: u64, out: &mut TurnEmitter<'_>, report: &mut TurnReport) {
        out.emit(
            TurnMessage::error(format!(
                "⏱️ Approval timed out after {}s; the command was not executed.",
                waited_secs
            ))
            .with_meta("command", command)
            .with_meta("approval_status", "timed_out"),
        );
        report.records.push(ExecutionRecord::TimedOut {
            command: command.to_string(),
            waited_secs,
        });
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_success(
        &self,
        command: &str,
        stdout: String,
        stderr: String,
        exit_code: i32,
        approved: bool,
        cancel: &CancellationToken,
        out: &mut TurnEmitter<'_>,
        report: &mut TurnReport,
    ) -> Result<(), RuntimeError> {
        out.emit(
            TurnMessage::new(TurnMessageType::TerminalOutput, stdout.clone())
                .with_meta("command", command)
                .with_meta("stderr", stderr.clone())
                .with_meta("exit_code", exit_code)
                .with_meta("approved", approved),
        );
        report.records.push(ExecutionRecord::Command {
            command: command.to_string(),
            outcome: ExecutionOutcome::Success {
                stdout: stdout.clone(),
                stderr: stderr.clone(),
                exit_code,
            },
            approved,
            failure: None,
        });

        report.phases.push(TurnPhase::Interpreting);
        let prompt = interpretation_messages(command, &stdout, &stderr, exit_code);
        let interpretation = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RuntimeError::Cancelled),
            r = self.llm.complete(&prompt) => r.map_err(RuntimeError::Llm)?,
        };
        let interpretation = interpretation.trim();
        if !interpretation.is_empty() {
            out.emit(TurnMessage::response(interpretation).with_meta("interpretation", true));
        }
        Ok(())
    }

    /// 失败一律先经分类器：可修复附带 suggestion，严重失败结束循环
    fn handle_failure(
        &self,
        command: &str,
        error: &str,
        stderr: &str,
        approved: bool,
        out: &mut TurnEmitter<'_>,
        report: &mut TurnReport,
    ) {
        let failure = self.classifier.assess(command, error, stderr);
        let msg = match &failure {
            CommandFailure::Repairable(c) => TurnMessage::error(c.message.clone())
                .with_meta("repairable", true)
                .with_meta("suggestion", c.suggestion.clone()),
            CommandFailure::Critical { message } => {
                report.critical = true;
                TurnMessage::error(message.clone()).with_meta("repairable", false)
            }
        };
        tracing::info!(command = %command, repairable = failure.is_repairable(), "command failed");
        out.emit(msg.with_meta("command", command));
        report.records.push(ExecutionRecord::Command {
            command: command.to_string(),
            outcome: ExecutionOutcome::Failure {
                error: error.to_string(),
                stderr: stderr.to_string(),
            },
            approved,
            failure: Some(failure),
        });
    }

    /// 交付持久化并记录最终阶段；必须在下一轮读取历史前完成
    async fn finish(&self, session_id: &str, mut report: TurnReport, out: TurnEmitter<'_>) -> TurnReport {
        report.messages = out.messages;

        if !report.assistant_text.is_empty() {
            let mut meta = Map::new();
            meta.insert("full_text".into(), Value::Bool(true));
            if let Err(e) = self
                .append(session_id, &report.assistant_text, "response", meta)
                .await
            {
                tracing::warn!(session = %session_id, error = %e, "failed to persist assistant text");
                report.persistence_failures += 1;
            }
        }
        for msg in report.messages.iter().filter(|m| !m.is_stream_chunk()) {
            if !self.persist_message(session_id, msg).await {
                report.persistence_failures += 1;
            }
        }
        report.phases.push(TurnPhase::Persisted);

        report.phases.push(if report.should_continue() {
            TurnPhase::Continue
        } else {
            TurnPhase::Break
        });
        report
    }

    /// 返回是否写入成功；失败只记日志
    async fn persist_message(&self, session_id: &str, msg: &TurnMessage) -> bool {
        match self
            .append(session_id, msg.content(), msg.kind().as_str(), msg.metadata().clone())
            .await
        {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(session = %session_id, kind = msg.kind().as_str(), error = %e, "failed to persist turn message");
                false
            }
        }
    }

    async fn append(
        &self,
        session_id: &str,
        text: &str,
        message_type: &str,
        metadata: Map<String, Value>,
    ) -> Result<(), RuntimeError> {
        self.persistence
            .append_message(session_id, ASSISTANT_SENDER, text, message_type, metadata)
            .await
            .map_err(RuntimeError::Persistence)
    }
}

fn approval_update(command: &str, state: &ApprovalState) -> TurnMessage {
    let content = match state {
        ApprovalState::Requested => "Awaiting approval".to_string(),
        ApprovalState::Resolving => "Approval cleared, waiting for the result".to_string(),
        ApprovalState::Approved { approved_by, .. } => format!("Approved by {}", approved_by),
        ApprovalState::Denied { reason } => format!("Denied: {}", reason),
        ApprovalState::TimedOut { waited_secs } => format!("Timed out after {}s", waited_secs),
    };
    TurnMessage::new(TurnMessageType::MetadataUpdate, content)
        .with_meta("command", command)
        .with_meta("approval_status", state.label())
}

fn fatal_text(e: &RuntimeError) -> String {
    match e {
        RuntimeError::Cancelled => "cancelled".to_string(),
        other => format!("Model request failed: {}", other),
    }
}
