//! 记忆层：循环内对话上下文与持久化协作方

pub mod conversation;
pub mod persistence;

pub use conversation::{render_transcript, ConversationMemory, Message, Role};
pub use persistence::{InMemoryPersistence, JsonlPersistence, PersistenceService, StoredMessage};
