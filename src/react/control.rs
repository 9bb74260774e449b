//! 控制工具：respond（结束/继续循环）与 delegate（登记子任务委派）
//!
//! 两者都不执行外部操作，只改变本轮的循环控制信号或执行结果列表。

use serde::Serialize;

use crate::core::LoopControlSignal;
use crate::react::events::{TurnMessage, TurnMessageType};
use crate::react::invocation::{ToolInvocation, ToolKind};
use crate::tools::schema::{DelegateParams, RespondParams};

/// 待处理的委派（阻塞等待子智能体结果由外部分层协作方负责）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingDelegation {
    pub task: String,
    pub reason: String,
    pub wait_for_result: bool,
}

/// 控制工具处理结果
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEffect {
    Respond {
        signal: LoopControlSignal,
        message: TurnMessage,
    },
    Delegate {
        delegation: PendingDelegation,
        message: TurnMessage,
    },
}

/// respond：break_loop 缺省为 true；text 缺失时退回标签描述
pub fn handle_respond(invocation: &ToolInvocation) -> (LoopControlSignal, TurnMessage) {
    let params = invocation.params::<RespondParams>().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "respond params malformed, using defaults");
        RespondParams {
            text: String::new(),
            break_loop: true,
        }
    });
    let text = if params.text.trim().is_empty() {
        invocation.description.clone()
    } else {
        params.text
    };
    let signal = LoopControlSignal {
        break_loop: params.break_loop,
        respond_content: Some(text.clone()),
    };
    let message = TurnMessage::response(text)
        .with_meta("respond", true)
        .with_meta("break_loop", signal.break_loop);
    (signal, message)
}

/// delegate：只登记，不阻塞
pub fn handle_delegate(invocation: &ToolInvocation) -> Option<(PendingDelegation, TurnMessage)> {
    let params = match invocation.params::<DelegateParams>() {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(error = %e, "delegate params malformed, skipping");
            return None;
        }
    };
    let delegation = PendingDelegation {
        task: params.task,
        reason: params.reason,
        wait_for_result: params.wait_for_result,
    };
    let message = TurnMessage::new(
        TurnMessageType::Delegation,
        format!("Delegating task: {}", delegation.task),
    )
    .with_meta("task", delegation.task.clone())
    .with_meta("reason", delegation.reason.clone())
    .with_meta("wait_for_result", delegation.wait_for_result);
    Some((delegation, message))
}

/// 分派控制工具；execute_command 与未知工具返回 None
pub fn handle_control(invocation: &ToolInvocation) -> Option<ControlEffect> {
    match invocation.kind() {
        ToolKind::Respond => {
            let (signal, message) = handle_respond(invocation);
            Some(ControlEffect::Respond { signal, message })
        }
        ToolKind::Delegate => {
            handle_delegate(invocation).map(|(delegation, message)| ControlEffect::Delegate { delegation, message })
        }
        ToolKind::ExecuteCommand | ToolKind::Unknown => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map, Value};

    fn inv(name: &str, params: Value) -> ToolInvocation {
        let map: Map<String, Value> = params.as_object().cloned().unwrap_or_default();
        ToolInvocation::new(name, map, "fallback text")
    }

    #[test]
    fn test_respond_breaks_by_default() {
        let (signal, msg) = handle_respond(&inv("respond", json!({"text": "All done"})));
        assert!(signal.break_loop);
        assert_eq!(signal.respond_content.as_deref(), Some("All done"));
        assert_eq!(msg.kind(), TurnMessageType::Response);
    }

    #[test]
    fn test_respond_explicit_continue() {
        let (signal, msg) = handle_respond(&inv("respond", json!({"text": "progress", "break_loop": false})));
        assert!(!signal.break_loop);
        assert_eq!(msg.meta("break_loop"), Some(&Value::Bool(false)));
    }

    #[test]
    fn test_respond_falls_back_to_description() {
        let (signal, _) = handle_respond(&inv("respond", json!({})));
        assert_eq!(signal.respond_content.as_deref(), Some("fallback text"));
    }

    #[test]
    fn test_delegate_defaults() {
        let (d, msg) = handle_delegate(&inv("delegate", json!({"task": "scan ports", "reason": "specialist"}))).unwrap();
        assert!(d.wait_for_result);
        assert_eq!(d.reason, "specialist");
        assert_eq!(msg.kind(), TurnMessageType::Delegation);
        assert!(msg.content().contains("scan ports"));
    }

    #[test]
    fn test_delegate_without_task_is_skipped() {
        assert!(handle_delegate(&inv("delegate", json!({"reason": "x"}))).is_none());
    }

    #[test]
    fn test_unknown_and_execute_are_not_control() {
        assert!(handle_control(&inv("browse", json!({}))).is_none());
        assert!(handle_control(&inv("execute_command", json!({"command": "ls"}))).is_none());
        assert!(matches!(
            handle_control(&inv("respond", json!({"text": "x"}))),
            Some(ControlEffect::Respond { .. })
        ));
    }
}
