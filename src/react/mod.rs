//! 认知层：标签协议解析、控制工具、轮次编排与提示词拼装

pub mod control;
pub mod events;
pub mod invocation;
pub mod loop_;
pub mod parser;
pub mod prompt;

pub use control::{handle_control, handle_delegate, handle_respond, ControlEffect, PendingDelegation};
pub use events::{TurnMessage, TurnMessageType};
pub use invocation::{ToolInvocation, ToolKind};
pub use loop_::{ConversationOutcome, ExecutionRecord, StopReason, TurnOrchestrator, TurnReport};
pub use parser::{ParserStatsSnapshot, TagParser, ToolCallParser};
pub use prompt::build_system_prompt;
