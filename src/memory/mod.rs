//! 记忆层：带标签的记忆记录、存储契约（内存 / JSONL 文件）、对话消息

pub mod conversation;
pub mod persistence;
pub mod record;
pub mod store;

pub use conversation::{recent_history, Message, Role, CONVERSATION_TAG};
pub use persistence::JsonlMemoryStore;
pub use record::{MemoryRecord, RecordId};
pub use store::{InMemoryMemoryStore, MemoryError, MemoryStore, RetentionPolicy};
