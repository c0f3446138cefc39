pub mod auth;
pub mod client;
pub mod conversation;
pub mod db;
pub mod error;
pub mod feed;
pub mod message;
pub mod serialization;
pub mod types;

// 重新导出认证相关函数
pub use auth::sign_in_with_password;

// 重新导出会话同步相关类型
pub use conversation::{ConversationSync, ConversationSyncListener, SyncOptions};
