//! 工具层：命令执行协作方接口、本地参考实现、执行阶段与审批握手

pub mod approval;
pub mod executor;
pub mod outcome;
pub mod schema;
pub mod service;
pub mod shell;

pub use approval::{ApprovalController, ApprovalPolicy, ApprovalState};
pub use executor::CommandStage;
pub use outcome::{ApprovalRecord, CommandResponse, CommandStatus, ExecutionOutcome, PendingCommand, SessionInfo};
pub use schema::protocol_schema_json;
pub use service::CommandService;
pub use shell::LocalCommandService;
