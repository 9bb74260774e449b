//! 短期记忆：多轮循环内的对话上下文
//!
//! 保留最近 N 轮（user/assistant 对），超出时剪枝；render_transcript 供只接受单一 prompt 的后端使用。

use serde::{Deserialize, Serialize};

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// 对话上下文：实际保留约 max_turns*2 条消息
#[derive(Clone, Debug)]
pub struct ConversationMemory {
    messages: Vec<Message>,
    max_turns: usize,
}

impl ConversationMemory {
    pub fn new(max_turns: usize) -> Self {
        Self {
            messages: Vec::new(),
            max_turns: max_turns.max(1),
        }
    }

    pub fn push(&mut self, msg: Message) {
        self.messages.push(msg);
        self.prune();
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// 尚无 assistant 消息即为会话首轮（规划优先策略依赖此判断）
    pub fn is_first_turn(&self) -> bool {
        !self.messages.iter().any(|m| m.role == Role::Assistant)
    }

    pub fn last_assistant(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.role == Role::Assistant)
    }

    fn prune(&mut self) {
        let keep = self.max_turns * 2;
        if self.messages.len() > keep {
            self.messages.drain(..self.messages.len() - keep);
        }
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// 把消息渲染为 "Role: content" 文本，末尾留出 assistant 续写位置
pub fn render_transcript(messages: &[Message]) -> String {
    let mut out = String::new();
    for m in messages.iter().filter(|m| m.role != Role::System) {
        let label = match m.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::System => "System",
        };
        out.push_str(label);
        out.push_str(": ");
        out.push_str(m.content.trim());
        out.push_str("\n\n");
    }
    out.push_str("Assistant: ");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prune_keeps_recent() {
        let mut mem = ConversationMemory::new(1);
        mem.push(Message::user("a"));
        mem.push(Message::assistant("b"));
        mem.push(Message::user("c"));
        assert_eq!(mem.len(), 2);
        assert_eq!(mem.messages()[0].content, "b");
    }

    #[test]
    fn test_first_turn_detection() {
        let mut mem = ConversationMemory::new(10);
        mem.push(Message::user("hi"));
        assert!(mem.is_first_turn());
        mem.push(Message::assistant("hello"));
        assert!(!mem.is_first_turn());
        assert_eq!(mem.last_assistant().map(|m| m.content.as_str()), Some("hello"));
    }

    #[test]
    fn test_render_transcript_skips_system() {
        let text = render_transcript(&[Message::system("rules"), Message::user("list files")]);
        assert_eq!(text, "User: list files\n\nAssistant: ");
    }
}
