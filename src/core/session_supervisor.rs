//! 会话监管：按 session 管理取消令牌
//!
//! 每个会话一个子 token（派生自根 token）；取消会中断正在进行的流式输出与审批等待。

use std::collections::HashMap;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// 多会话的取消令牌表；会话之间互不影响
#[derive(Debug)]
pub struct SessionSupervisor {
    root: CancellationToken,
    sessions: RwLock<HashMap<String, CancellationToken>>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// 取得（必要时创建）会话的 token；已取消的旧 token 会被替换
    pub async fn token_for(&self, session_id: &str) -> CancellationToken {
        let mut sessions = self.sessions.write().await;
        match sessions.get(session_id) {
            Some(t) if !t.is_cancelled() => t.clone(),
            _ => {
                let token = self.root.child_token();
                sessions.insert(session_id.to_string(), token.clone());
                token
            }
        }
    }

    /// 取消单个会话当前的轮次
    pub async fn cancel(&self, session_id: &str) -> bool {
        match self.sessions.read().await.get(session_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// 进程退出时取消全部会话
    pub fn cancel_all(&self) {
        self.root.cancel();
    }

    pub async fn release(&self, session_id: &str) {
        self.sessions.write().await.remove(session_id);
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
