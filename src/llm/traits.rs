//! LLM 客户端抽象
//!
//! 生成服务以分块流的形式返回：每块是 `{"response": "...", "done": bool}`；
//! complete 是把整条流拼接起来的便捷方法（用于不调用工具的解释阶段）。

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::memory::Message;

/// 流中的单块；done=true 为结束哨兵
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamChunk {
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub done: bool,
}

impl StreamChunk {
    pub fn text(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            done: false,
        }
    }

    pub fn done() -> Self {
        Self {
            response: String::new(),
            done: true,
        }
    }
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, String>> + Send>>;

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 流式完成，返回分块流
    async fn complete_stream(&self, messages: &[Message]) -> Result<ChunkStream, String>;

    /// 非流式完成：消费整条流直到 done 或流结束
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        let mut stream = self.complete_stream(messages).await?;
        let mut out = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            out.push_str(&chunk.response);
            if chunk.done {
                break;
            }
        }
        Ok(out)
    }

    /// 累计 token 统计：(prompt_tokens, completion_tokens, total_tokens)
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
