//! Mock LLM 客户端（用于测试与无 API Key 的本地运行）
//!
//! 按顺序返回预设回复，每条切成若干小块模拟流式输出；可预设连接失败或流中断。
//! 同时记录每次收到的消息，便于断言传给模型的上下文。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::stream;

use crate::llm::{ChunkStream, LlmClient, StreamChunk};
use crate::memory::Message;

/// 每块字符数（模拟 token 流）
const CHUNK_CHARS: usize = 8;

#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// 正常回复
    Text(String),
    /// 建立流即失败
    ConnectError(String),
    /// 输出一段文本后流报错
    BrokenStream { partial: String, error: String },
}

#[derive(Debug, Default)]
pub struct MockLlmClient {
    replies: Mutex<VecDeque<ScriptedReply>>,
    requests: Mutex<Vec<Vec<Message>>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let client = Self::new();
        for r in replies {
            client.push(ScriptedReply::Text(r.into()));
        }
        client
    }

    pub fn push(&self, reply: ScriptedReply) {
        if let Ok(mut q) = self.replies.lock() {
            q.push_back(reply);
        }
    }

    /// 已收到的请求（每次调用一条）
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn next_reply(&self, messages: &[Message]) -> ScriptedReply {
        if let Ok(mut r) = self.requests.lock() {
            r.push(messages.to_vec());
        }
        self.replies
            .lock()
            .ok()
            .and_then(|mut q| q.pop_front())
            .unwrap_or_else(|| {
                // 脚本耗尽：回显最后一条 user 消息
                let last_user = messages
                    .iter()
                    .rev()
                    .find(|m| m.role == crate::memory::Role::User)
                    .map(|m| m.content.as_str())
                    .unwrap_or("(no input)");
                ScriptedReply::Text(format!("Echo from Mock: {}", last_user))
            })
    }
}

fn chunked(text: &str) -> Vec<Result<StreamChunk, String>> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(CHUNK_CHARS)
        .map(|c| Ok(StreamChunk::text(c.iter().collect::<String>())))
        .collect()
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete_stream(&self, messages: &[Message]) -> Result<ChunkStream, String> {
        match self.next_reply(messages) {
            ScriptedReply::Text(text) => {
                let mut items = chunked(&text);
                items.push(Ok(StreamChunk::done()));
                Ok(Box::pin(stream::iter(items)))
            }
            ScriptedReply::ConnectError(e) => Err(e),
            ScriptedReply::BrokenStream { partial, error } => {
                let mut items = chunked(&partial);
                items.push(Err(error));
                Ok(Box::pin(stream::iter(items)))
            }
        }
    }
}
