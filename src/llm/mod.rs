//! LLM 层：分块流抽象与实现（Ollama 风格 NDJSON / OpenAI 兼容 / Mock）

pub mod mock;
pub mod ollama;
pub mod openai;
pub mod traits;

use std::sync::Arc;

pub use mock::{MockLlmClient, ScriptedReply};
pub use ollama::{NdjsonDecoder, OllamaClient};
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::{ChunkStream, LlmClient, StreamChunk};

use crate::config::AppConfig;

/// 根据配置选择生成服务后端；构建失败时退回 Mock
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    match provider.as_str() {
        "ollama" => match OllamaClient::new(cfg.llm.base_url.as_deref(), &cfg.llm.model, cfg.llm.timeouts.request) {
            Ok(c) => {
                tracing::info!("Using Ollama-compatible LLM ({})", cfg.llm.model);
                Arc::new(c)
            }
            Err(e) => {
                tracing::warn!("Failed to build Ollama client ({}), using Mock LLM", e);
                Arc::new(MockLlmClient::new())
            }
        },
        "openai" => {
            tracing::info!("Using OpenAI LLM ({})", cfg.llm.model);
            Arc::new(OpenAiClient::new(
                cfg.llm.base_url.as_deref(),
                &cfg.llm.model,
                std::env::var("OPENAI_API_KEY").ok().as_deref(),
            ))
        }
        other => {
            if other != "mock" {
                tracing::warn!("Unknown LLM provider '{}', using Mock LLM", other);
            }
            Arc::new(MockLlmClient::new())
        }
    }
}
