//! 轮次状态机：阶段定义与循环控制信号
//!
//! 单轮：Streaming -> Parsed -> {NoTool, ExecutingTool} -> Interpreting -> Persisted -> {Continue, Break}

use serde::Serialize;

/// 单轮内的阶段（TurnReport 中按顺序记录，便于观测与测试）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    Streaming,
    Parsed,
    NoTool,
    ExecutingTool,
    Interpreting,
    Persisted,
    Continue,
    Break,
}

impl TurnPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TurnPhase::Continue | TurnPhase::Break)
    }
}

/// 由 respond 工具计算出的循环控制信号；默认继续循环
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LoopControlSignal {
    pub break_loop: bool,
    pub respond_content: Option<String>,
}

impl LoopControlSignal {
    pub fn stop(content: impl Into<String>) -> Self {
        Self {
            break_loop: true,
            respond_content: Some(content.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_signal_continues() {
        let s = LoopControlSignal::default();
        assert!(!s.break_loop);
        assert!(s.respond_content.is_none());
    }

    #[test]
    fn test_terminal_phases() {
        assert!(TurnPhase::Break.is_terminal());
        assert!(TurnPhase::Continue.is_terminal());
        assert!(!TurnPhase::Interpreting.is_terminal());
    }
}
