//! 提示词拼装：system prompt（协议说明 + 参数 Schema）、命令结果解释、下一轮反馈上下文

use crate::memory::Message;
use crate::tools::outcome::ExecutionOutcome;
use crate::tools::schema::protocol_schema_json;

/// 输出预览上限（字符），避免把超长 stdout 整段塞回模型
const OUTPUT_PREVIEW_CHARS: usize = 4000;

const PROTOCOL_INTRO: &str = r#"You are an operations assistant that can run shell commands on the user's machine.

To use a tool, write exactly one tag of the form:
<tool_call name="TOOL_NAME" params='JSON_OBJECT'>short description of what you are doing</tool_call>

Available tools:
- execute_command: run a shell command. params: {"command": "...", "host": "main"}
- respond: show a message to the user. params: {"text": "...", "break_loop": true}
  Pass "break_loop": false to keep working after the message.
- delegate: hand a sub-task to another agent. params: {"task": "...", "reason": "...", "wait_for_result": true}

Rules:
- At most one execute_command runs per turn; later ones are ignored. Wait for its result before the next step.
- Some commands need human approval before they run. If a command is denied, do not retry it verbatim.
- When a command fails you will receive an error and a suggestion; adapt your approach.
- When you are done, use respond."#;

const PLANNING_HINT: &str = "For multi-step tasks you may start your first reply with a [PLANNING] section; the plan is shown to the user before anything runs.";

/// 构建 system prompt；extra 为调用方追加的领域说明
pub fn build_system_prompt(extra: Option<&str>) -> String {
    let mut out = String::from(PROTOCOL_INTRO);
    out.push_str("\n\n");
    out.push_str(PLANNING_HINT);
    out.push_str("\n\nParameter schemas:\n");
    out.push_str(&protocol_schema_json());
    if let Some(extra) = extra.map(str::trim).filter(|s| !s.is_empty()) {
        out.push_str("\n\n");
        out.push_str(extra);
    }
    out
}

/// 解释阶段的消息：不允许调用工具，只根据输出做简要说明
pub fn interpretation_messages(command: &str, stdout: &str, stderr: &str, exit_code: i32) -> Vec<Message> {
    let mut body = format!("The command `{}` finished with exit code {}.\n", command, exit_code);
    body.push_str("\nSTDOUT:\n");
    body.push_str(&preview(stdout));
    if !stderr.trim().is_empty() {
        body.push_str("\n\nSTDERR:\n");
        body.push_str(&preview(stderr));
    }
    body.push_str("\n\nExplain briefly what this output means for the user's request.");
    vec![
        Message::system(
            "You interpret command output for the user. Do not emit tool_call tags and do not suggest running tools.",
        ),
        Message::user(body),
    ]
}

/// 单条执行结果在反馈上下文中的一行
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedbackItem {
    /// 命令文本或委派任务
    pub subject: String,
    pub outcome: String,
    pub suggestion: Option<String>,
}

impl FeedbackItem {
    pub fn from_outcome(command: &str, outcome: &ExecutionOutcome) -> Self {
        let text = match outcome {
            ExecutionOutcome::Success { stdout, stderr, exit_code } => {
                let mut s = format!("succeeded (exit {})\n{}", exit_code, preview(stdout));
                if !stderr.trim().is_empty() {
                    s.push_str("\nstderr:\n");
                    s.push_str(&preview(stderr));
                }
                s
            }
            ExecutionOutcome::PendingApproval { risk_level, .. } => {
                format!("is still awaiting approval (risk: {})", risk_level)
            }
            ExecutionOutcome::Failure { error, .. } => format!("failed: {}", error),
        };
        Self::note(command, text)
    }

    pub fn note(subject: impl Into<String>, outcome: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            outcome: outcome.into(),
            suggestion: None,
        }
    }
}

/// 把本轮执行摘要拼成下一轮的 user 消息
pub fn feedback_message(items: &[FeedbackItem], total: usize, successful: usize) -> Message {
    let mut out = format!(
        "Execution summary: {} of {} command(s) succeeded.\n",
        successful, total
    );
    for item in items {
        out.push_str(&format!("\n- `{}` {}", item.subject, item.outcome));
        if let Some(s) = &item.suggestion {
            out.push_str(&format!("\n  Suggestion: {}", s));
        }
    }
    out.push_str("\n\nContinue with the next step, or use respond when the task is complete.");
    Message::user(out)
}

fn preview(text: &str) -> String {
    let trimmed = text.trim_end();
    if trimmed.chars().count() <= OUTPUT_PREVIEW_CHARS {
        return trimmed.to_string();
    }
    let head: String = trimmed.chars().take(OUTPUT_PREVIEW_CHARS).collect();
    format!("{}\n... (truncated)", head)
}
