pub mod im;

// 重新导出常用类型和函数，方便外部使用
pub use im::{
    client::{ClientConfig, SyncClient},
    conversation::{
        ConnectionStatus, ConversationSync, ConversationSyncListener, ReadReceiptPolicy,
    },
    error::SyncError,
    message::{ChangeEvent, ChangeKind, Message, MessageStore},
    sign_in_with_password,
};
