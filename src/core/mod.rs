//! 核心层：错误分类、运行时错误、轮次状态、会话监管

pub mod classifier;
pub mod error;
pub mod session_supervisor;
pub mod state;

pub use classifier::ErrorClassifier;
pub use error::{CommandFailure, ErrorClassification, RuntimeError};
pub use session_supervisor::SessionSupervisor;
pub use state::{LoopControlSignal, TurnPhase};
