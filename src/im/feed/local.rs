//! 进程内变更订阅
//!
//! 本地离线模式与测试使用：写入方调用 `publish` 把事件扇出给同一会话的所有订阅。

use crate::im::feed::{ChangeFeed, FeedSignal, FeedSink, SubscriptionHandle};
use crate::im::message::ChangeEvent;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;
use uuid::Uuid;

struct LocalSubscriber {
    conversation_id: String,
    sink: FeedSink,
}

/// 进程内变更订阅
#[derive(Clone, Default)]
pub struct LocalChangeFeed {
    subscribers: Arc<Mutex<HashMap<Uuid, LocalSubscriber>>>,
}

impl LocalChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    fn subscribers(&self) -> MutexGuard<'_, HashMap<Uuid, LocalSubscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// 向会话的所有订阅推送事件，返回送达的订阅数
    pub fn publish(&self, conversation_id: &str, event: ChangeEvent) -> usize {
        let mut subscribers = self.subscribers();
        let mut delivered = 0;
        subscribers.retain(|id, sub| {
            if sub.conversation_id != conversation_id {
                return true;
            }
            if sub.sink.send(FeedSignal::Event(event.clone())).is_ok() {
                delivered += 1;
                true
            } else {
                debug!("[LocalFeed] 订阅通道已关闭，移除订阅: {}", id);
                false
            }
        });
        delivered
    }

    /// 断开会话的所有订阅（先通知 Disconnected 再关闭通道）
    pub fn disconnect_conversation(&self, conversation_id: &str) {
        let mut subscribers = self.subscribers();
        subscribers.retain(|_, sub| {
            if sub.conversation_id == conversation_id {
                let _ = sub.sink.send(FeedSignal::Disconnected);
                false
            } else {
                true
            }
        });
    }

    /// 静默丢弃会话的所有订阅（不发送 Disconnected，模拟推送悄然停止）
    pub fn drop_conversation_silently(&self, conversation_id: &str) {
        self.subscribers()
            .retain(|_, sub| sub.conversation_id != conversation_id);
    }

    pub fn subscriber_count(&self, conversation_id: &str) -> usize {
        self.subscribers()
            .values()
            .filter(|sub| sub.conversation_id == conversation_id)
            .count()
    }
}

#[async_trait]
impl ChangeFeed for LocalChangeFeed {
    async fn subscribe(&self, conversation_id: &str, sink: FeedSink) -> Result<SubscriptionHandle> {
        let handle = SubscriptionHandle::new(conversation_id);
        // 本地订阅无需握手，直接确认
        sink.send(FeedSignal::Connected)
            .map_err(|_| anyhow::anyhow!("订阅通道已关闭"))?;
        self.subscribers().insert(
            handle.id,
            LocalSubscriber {
                conversation_id: conversation_id.to_string(),
                sink,
            },
        );
        debug!(
            "[LocalFeed] 新订阅: conversationID={}, handle={}",
            conversation_id, handle.id
        );
        Ok(handle)
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()> {
        self.subscribers().remove(&handle.id);
        debug!("[LocalFeed] 取消订阅: handle={}", handle.id);
        Ok(())
    }
}
