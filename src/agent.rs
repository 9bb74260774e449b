//! Headless 运行时装配
//!
//! create_agent_components 按配置构建 LLM、本地命令服务、持久化与编排器；
//! process_message 对单条用户输入跑多轮循环，取消令牌由 SessionSupervisor 按会话分配。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::AppConfig;
use crate::core::SessionSupervisor;
use crate::llm::{create_llm_from_config, LlmClient};
use crate::memory::{ConversationMemory, InMemoryPersistence, JsonlPersistence, PersistenceService};
use crate::react::{build_system_prompt, ConversationOutcome, TurnMessage, TurnOrchestrator};
use crate::tools::LocalCommandService;

/// 预构建的组件，可多会话共享
pub struct AgentComponents {
    pub orchestrator: TurnOrchestrator,
    /// 本地命令服务（审批由 CLI / UI 通过 resolve_approval 驱动）
    pub commands: Arc<LocalCommandService>,
    pub persistence: Arc<dyn PersistenceService>,
    pub supervisor: SessionSupervisor,
    pub max_context_turns: usize,
}

impl AgentComponents {
    /// 新会话的对话上下文
    pub fn new_context(&self) -> ConversationMemory {
        ConversationMemory::new(self.max_context_turns)
    }
}

/// 按配置装配；LLM 由 provider 选择
pub fn create_agent_components(cfg: &AppConfig) -> AgentComponents {
    let llm = create_llm_from_config(cfg);
    create_agent_components_with_llm(cfg, llm)
}

/// 使用外部提供的 LLM 装配（测试或嵌入场景）
pub fn create_agent_components_with_llm(cfg: &AppConfig, llm: Arc<dyn LlmClient>) -> AgentComponents {
    let shell = &cfg.tools.shell;
    let commands = Arc::new(LocalCommandService::new(
        shell.allowed_commands.clone(),
        shell.forbidden_patterns.clone(),
        shell.timeout_secs,
    ));

    let persistence: Arc<dyn PersistenceService> = match &cfg.persistence.path {
        Some(path) => {
            tracing::info!(path = %path.display(), "persisting turn messages to JSONL");
            Arc::new(JsonlPersistence::new(path))
        }
        None => Arc::new(InMemoryPersistence::new()),
    };

    let orchestrator = TurnOrchestrator::new(llm, commands.clone(), Arc::clone(&persistence))
        .with_approval_policy(cfg.approval.policy())
        .with_default_host(shell.default_host.clone())
        .with_system_prompt(build_system_prompt(None))
        .with_stream_timeout(Duration::from_secs(cfg.llm.timeouts.stream.max(1)))
        .with_max_iterations(cfg.app.max_iterations);

    AgentComponents {
        orchestrator,
        commands,
        persistence,
        supervisor: SessionSupervisor::new(),
        max_context_turns: cfg.app.max_context_turns,
    }
}

/// 处理单条用户消息（无事件推送）
pub async fn process_message(
    components: &AgentComponents,
    session_id: &str,
    context: &mut ConversationMemory,
    user_input: &str,
) -> ConversationOutcome {
    run(components, session_id, context, user_input, None).await
}

/// 处理单条用户消息：通过 event_tx 逐条推送 TurnMessage
pub async fn process_message_stream(
    components: &AgentComponents,
    session_id: &str,
    context: &mut ConversationMemory,
    user_input: &str,
    event_tx: mpsc::UnboundedSender<TurnMessage>,
) -> ConversationOutcome {
    run(components, session_id, context, user_input, Some(&event_tx)).await
}

async fn run(
    components: &AgentComponents,
    session_id: &str,
    context: &mut ConversationMemory,
    user_input: &str,
    events: Option<&mpsc::UnboundedSender<TurnMessage>>,
) -> ConversationOutcome {
    let cancel = components.supervisor.token_for(session_id).await;
    let outcome = components
        .orchestrator
        .run_conversation(session_id, context, user_input, &cancel, events)
        .await;
    components.supervisor.release(session_id).await;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use crate::react::StopReason;

    #[tokio::test]
    async fn test_process_message_plain_answer() {
        let mut cfg = AppConfig::default();
        cfg.llm.provider = "mock".into();
        let llm = Arc::new(MockLlmClient::with_replies(["Nothing to run, all good."]));
        let components = create_agent_components_with_llm(&cfg, llm);
        let mut ctx = components.new_context();

        let outcome = process_message(&components, "s1", &mut ctx, "hello").await;
        assert_eq!(outcome.stop_reason, StopReason::NoToolCall);
        assert_eq!(outcome.final_answer.as_deref(), Some("Nothing to run, all good."));
        assert_eq!(ctx.len(), 2);
    }
}
