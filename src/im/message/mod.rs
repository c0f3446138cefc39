//! 消息模块
//!
//! 消息模型、变更事件定义以及消息存储（REST / 本地 SQLite）

pub mod api;
pub mod dao;
pub mod models;
pub mod types;

// 重新导出主要类型
pub use api::RestMessageStore;
pub use dao::{MessageStore, SqliteMessageStore};
pub use models::{Direction, Message, NewMessage, RawMessageRecord};
pub use types::{ChangeEvent, ChangeKind, ContentType};
