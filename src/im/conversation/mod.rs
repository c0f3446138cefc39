//! 会话模块
//!
//! 单个会话的实时消息同步：全量加载、变更合并、已读回执回写

pub mod listener;
pub mod merge;
pub mod models;
pub mod receipt;
pub mod service;

#[cfg(test)]
pub(crate) mod testing;

// 重新导出主要类型和函数
pub use listener::{ConversationSyncListener, EmptyConversationSyncListener};
pub use merge::{apply_event, IgnoreReason, MergeOutcome};
pub use models::{
    ConnectionStatus, ConversationSyncState, ReadReceiptPolicy, SyncOptions,
    DEFAULT_TOMBSTONE_TTL,
};
pub use receipt::ReadReceiptWriter;
pub use service::{ConversationSnapshot, ConversationSync, LoadReport};
