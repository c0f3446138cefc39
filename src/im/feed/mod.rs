//! 变更订阅模块
//!
//! 按会话订阅消息表的行级变更（insert / update / delete）。
//! 推送不保证顺序，也不保证恰好一次，去重与排序由会话同步器负责。

pub mod local;
pub mod realtime;

use crate::im::message::ChangeEvent;
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

pub use local::LocalChangeFeed;
pub use realtime::{RealtimeChangeFeed, RealtimeConfig};

/// 订阅通道上传递的信号
#[derive(Debug, Clone, PartialEq)]
pub enum FeedSignal {
    /// 订阅已确认
    Connected,
    /// 行级变更
    Event(ChangeEvent),
    /// 订阅终止（尽力通知，订阅方也可能只是静默停止推送）
    Disconnected,
}

/// 订阅方接收信号的通道
pub type FeedSink = mpsc::UnboundedSender<FeedSignal>;

/// 订阅句柄，每次 subscribe 都是独立的订阅
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub id: Uuid,
    pub conversation_id: String,
}

impl SubscriptionHandle {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id: conversation_id.into(),
        }
    }
}

/// 变更订阅接口
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// 订阅指定会话的消息变更，信号写入 `sink`
    async fn subscribe(&self, conversation_id: &str, sink: FeedSink) -> Result<SubscriptionHandle>;

    /// 取消订阅
    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()>;
}
