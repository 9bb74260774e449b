//! 命令执行阶段
//!
//! 确保会话存在后把命令交给命令执行服务，只按协作方上报的 status 分支
//! （success / pending_approval / error）；本层不重试，重试由编排器在错误分类后决定。
//! 每次调用输出一条结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::Instant;

use crate::tools::outcome::ExecutionOutcome;
use crate::tools::service::CommandService;

/// 命令执行阶段：持有协作方引用与默认主机
pub struct CommandStage {
    service: Arc<dyn CommandService>,
    default_host: String,
}

impl CommandStage {
    pub fn new(service: Arc<dyn CommandService>, default_host: impl Into<String>) -> Self {
        Self {
            service,
            default_host: default_host.into(),
        }
    }

    pub fn service(&self) -> &Arc<dyn CommandService> {
        &self.service
    }

    pub fn default_host(&self) -> &str {
        &self.default_host
    }

    /// 会话不存在则创建
    pub async fn ensure_session(&self, session_id: &str) -> Result<(), String> {
        if self.service.has_session(session_id).await? {
            return Ok(());
        }
        tracing::info!(session = %session_id, "creating terminal session");
        self.service.create_session(session_id).await
    }

    /// 执行命令；协作方的传输错误同样按 Failure 返回
    pub async fn execute(
        &self,
        session_id: &str,
        command: &str,
        host: Option<&str>,
        description: &str,
    ) -> ExecutionOutcome {
        let host = host
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .unwrap_or(self.default_host.as_str());
        let start = Instant::now();

        let outcome = match self.ensure_session(session_id).await {
            Err(e) => ExecutionOutcome::failure(format!("Failed to create terminal session: {}", e)),
            Ok(()) => match self
                .service
                .execute_command(session_id, command, host, description)
                .await
            {
                Ok(resp) => resp.into_outcome(),
                Err(e) => ExecutionOutcome::failure(e),
            },
        };

        let audit = serde_json::json!({
            "event": "command_audit",
            "session": session_id,
            "host": host,
            "status": outcome.status(),
            "duration_ms": start.elapsed().as_millis() as u64,
            "command_preview": command_preview(command),
        });
        tracing::info!(audit = %audit.to_string(), "command");
        outcome
    }
}

fn command_preview(command: &str) -> String {
    if command.chars().count() > 200 {
        format!("{}...", command.chars().take(200).collect::<String>())
    } else {
        command.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::outcome::{CommandResponse, SessionInfo};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// 记录调用顺序的假协作方
    #[derive(Default)]
    struct RecordingService {
        calls: Mutex<Vec<String>>,
        exists: Mutex<bool>,
        response: Option<CommandResponse>,
    }

    #[async_trait]
    impl CommandService for RecordingService {
        async fn has_session(&self, _: &str) -> Result<bool, String> {
            self.calls.lock().unwrap().push("has_session".into());
            Ok(*self.exists.lock().unwrap())
        }
        async fn create_session(&self, _: &str) -> Result<(), String> {
            self.calls.lock().unwrap().push("create_session".into());
            *self.exists.lock().unwrap() = true;
            Ok(())
        }
        async fn execute_command(&self, _: &str, command: &str, host: &str, _: &str) -> Result<CommandResponse, String> {
            self.calls.lock().unwrap().push(format!("execute:{}@{}", command, host));
            self.response.clone().ok_or_else(|| "connection refused".to_string())
        }
        async fn get_session_info(&self, _: &str) -> Result<Option<SessionInfo>, String> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_creates_session_once() {
        let svc = Arc::new(RecordingService {
            response: Some(CommandResponse::success("ok", "", 0)),
            ..Default::default()
        });
        let stage = CommandStage::new(svc.clone(), "main");
        assert!(stage.execute("s", "ls", None, "").await.is_success());
        assert!(stage.execute("s", "ls", Some("web"), "").await.is_success());
        let calls = svc.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec!["has_session", "create_session", "execute:ls@main", "has_session", "execute:ls@web"]
        );
    }

    #[tokio::test]
    async fn test_branches_on_status() {
        let svc = Arc::new(RecordingService {
            response: Some(CommandResponse::pending("high", vec!["r".into()], "approve?")),
            ..Default::default()
        });
        let stage = CommandStage::new(svc, "main");
        assert!(matches!(
            stage.execute("s", "rm x", None, "").await,
            ExecutionOutcome::PendingApproval { .. }
        ));
    }

    #[tokio::test]
    async fn test_transport_error_is_failure() {
        let stage = CommandStage::new(Arc::new(RecordingService::default()), "main");
        match stage.execute("s", "ls", None, "").await {
            ExecutionOutcome::Failure { error, .. } => assert_eq!(error, "connection refused"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
