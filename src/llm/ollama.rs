//! Ollama 风格生成服务客户端
//!
//! POST {base_url}/api/generate（stream=true），响应为 NDJSON：每行一个 `{"response": "...", "done": bool}`。
//! 网络分包可能把一行切开，NdjsonDecoder 负责按换行重组。

use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, Stream, StreamExt, TryStreamExt};
use reqwest::Client;
use serde::Serialize;

use crate::llm::{ChunkStream, LlmClient, StreamChunk};
use crate::memory::{render_transcript, Message, Role};

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

/// NDJSON 增量解码器
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    buf: Vec<u8>,
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加字节，返回已凑齐的完整行解析结果
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Result<StreamChunk, String>> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            if let Some(item) = decode_line(&line) {
                out.push(item);
            }
        }
        out
    }

    /// 流结束：处理末尾没有换行的残余
    pub fn finish(&mut self) -> Option<Result<StreamChunk, String>> {
        let rest = std::mem::take(&mut self.buf);
        decode_line(&rest)
    }
}

fn decode_line(line: &[u8]) -> Option<Result<StreamChunk, String>> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    Some(serde_json::from_str::<StreamChunk>(text).map_err(|e| format!("invalid stream chunk: {}: {}", e, text)))
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    system: String,
    prompt: String,
    stream: bool,
}

type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, String>> + Send>>;

struct DecodeState {
    bytes: ByteStream,
    decoder: NdjsonDecoder,
    pending: VecDeque<Result<StreamChunk, String>>,
    finished: bool,
}

pub struct OllamaClient {
    client: Client,
    base_url: String,
    model: String,
}

impl OllamaClient {
    pub fn new(base_url: Option<&str>, model: &str, request_timeout_secs: u64) -> Result<Self, String> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(request_timeout_secs))
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            client,
            base_url: base_url
                .unwrap_or(DEFAULT_OLLAMA_URL)
                .trim_end_matches('/')
                .to_string(),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn complete_stream(&self, messages: &[Message]) -> Result<ChunkStream, String> {
        let system = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let body = GenerateRequest {
            model: &self.model,
            system,
            prompt: render_transcript(messages),
            stream: true,
        };

        let resp = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("generation service unreachable: {}", e))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(format!("generation service returned {}: {}", status, text));
        }

        let bytes: ByteStream = Box::pin(
            resp.bytes_stream()
                .map_ok(|b| b.to_vec())
                .map_err(|e| e.to_string()),
        );
        let state = DecodeState {
            bytes,
            decoder: NdjsonDecoder::new(),
            pending: VecDeque::new(),
            finished: false,
        };

        let chunks = stream::unfold(state, |mut st| async move {
            loop {
                if let Some(item) = st.pending.pop_front() {
                    return Some((item, st));
                }
                if st.finished {
                    return None;
                }
                match st.bytes.next().await {
                    Some(Ok(b)) => st.pending.extend(st.decoder.push(&b)),
                    Some(Err(e)) => {
                        st.finished = true;
                        st.pending.push_back(Err(e));
                    }
                    None => {
                        st.finished = true;
                        if let Some(item) = st.decoder.finish() {
                            st.pending.push_back(item);
                        }
                    }
                }
            }
        });
        Ok(Box::pin(chunks))
    }
}
