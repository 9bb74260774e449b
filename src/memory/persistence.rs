//! 持久化协作方：轮次结束时交付全部 TurnMessage 与完整 assistant 文本
//!
//! 运行时只依赖 append_message；内置内存实现（测试 / 默认）与 JSONL 文件实现。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// 一条持久化记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub session_id: String,
    pub sender: String,
    pub text: String,
    pub message_type: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait PersistenceService: Send + Sync {
    async fn append_message(
        &self,
        session_id: &str,
        sender: &str,
        text: &str,
        message_type: &str,
        metadata: Map<String, Value>,
    ) -> Result<(), String>;
}

/// 内存实现：按追加顺序保存
#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    records: Mutex<Vec<StoredMessage>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<StoredMessage> {
        self.records.lock().await.clone()
    }

    pub async fn session_records(&self, session_id: &str) -> Vec<StoredMessage> {
        self.records
            .lock()
            .await
            .iter()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl PersistenceService for InMemoryPersistence {
    async fn append_message(
        &self,
        session_id: &str,
        sender: &str,
        text: &str,
        message_type: &str,
        metadata: Map<String, Value>,
    ) -> Result<(), String> {
        self.records.lock().await.push(StoredMessage {
            session_id: session_id.to_string(),
            sender: sender.to_string(),
            text: text.to_string(),
            message_type: message_type.to_string(),
            metadata,
            timestamp: Utc::now(),
        });
        Ok(())
    }
}

/// JSONL 文件实现：每行一条 StoredMessage；父目录不存在时自动创建
#[derive(Debug)]
pub struct JsonlPersistence {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlPersistence {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    /// 读取某会话的全部记录；文件不存在时返回空 Vec
    pub async fn load(&self, session_id: &str) -> anyhow::Result<Vec<StoredMessage>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let data = tokio::fs::read_to_string(&self.path).await?;
        let mut out = Vec::new();
        for line in data.lines().filter(|l| !l.trim().is_empty()) {
            let record: StoredMessage = serde_json::from_str(line)?;
            if record.session_id == session_id {
                out.push(record);
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl PersistenceService for JsonlPersistence {
    async fn append_message(
        &self,
        session_id: &str,
        sender: &str,
        text: &str,
        message_type: &str,
        metadata: Map<String, Value>,
    ) -> Result<(), String> {
        let record = StoredMessage {
            session_id: session_id.to_string(),
            sender: sender.to_string(),
            text: text.to_string(),
            message_type: message_type.to_string(),
            metadata,
            timestamp: Utc::now(),
        };
        let mut line = serde_json::to_string(&record).map_err(|e| e.to_string())?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| e.to_string())?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| format!("open {}: {}", self.path.display(), e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| e.to_string())?;
        file.flush().await.map_err(|e| e.to_string())
    }
}
