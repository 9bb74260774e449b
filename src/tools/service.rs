//! 命令执行服务（外部协作方）接口
//!
//! 运行时只通过该 trait 读写会话状态（待审批标记、命令历史），从不直接访问；
//! 具体实现可以是本地 shell（LocalCommandService）或远端终端后端。

use async_trait::async_trait;

use crate::tools::outcome::{CommandResponse, SessionInfo};

#[async_trait]
pub trait CommandService: Send + Sync {
    /// 会话是否已存在
    async fn has_session(&self, session_id: &str) -> Result<bool, String>;

    /// 创建终端会话
    async fn create_session(&self, session_id: &str) -> Result<(), String>;

    /// 执行命令；结果以 status 区分 success / pending_approval / error
    async fn execute_command(
        &self,
        session_id: &str,
        command: &str,
        host: &str,
        description: &str,
    ) -> Result<CommandResponse, String>;

    /// 会话快照；会话不存在时为 None
    async fn get_session_info(&self, session_id: &str) -> Result<Option<SessionInfo>, String>;

    /// 撤回仍在等待审批的 command（审批超时或等待被取消时调用）。
    /// 撤回后该命令不得再被执行；实现应清除 pending 并追加一条拒绝记录。
    /// 返回 false 表示没有可撤回的待审批项（已被处理或从未存在），
    /// 默认实现不做任何事，调用方会再查询一次历史。
    async fn withdraw_approval(&self, _session_id: &str, _command: &str, _reason: &str) -> Result<bool, String> {
        Ok(false)
    }
}
