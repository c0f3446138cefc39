//! 会话同步错误类型
//!
//! 协作方（消息存储、变更订阅）统一返回 `anyhow::Result`，
//! 同步核心对外只暴露下面三类错误。

use thiserror::Error;

/// 会话同步错误
#[derive(Debug, Error)]
pub enum SyncError {
    /// 全量加载失败，本地状态未做任何修改
    #[error("加载会话消息失败 (conversationID={conversation_id}): {source}")]
    LoadFailed {
        conversation_id: String,
        #[source]
        source: anyhow::Error,
    },

    /// 变更订阅建立失败，连接状态保持 disconnected
    #[error("订阅会话变更失败 (conversationID={conversation_id}): {source}")]
    SubscriptionFailed {
        conversation_id: String,
        #[source]
        source: anyhow::Error,
    },

    /// 已读回执或编辑回写失败，本地乐观状态不回滚
    #[error("回写失败 (ids={ids:?}): {source}")]
    WriteBackFailed {
        ids: Vec<String>,
        #[source]
        source: anyhow::Error,
    },
}

/// 原始消息记录无法映射为本地消息
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("消息记录缺少字段: {0}")]
    MissingField(&'static str),
}
