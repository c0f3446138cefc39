//! 会话同步监听器回调接口

use crate::im::conversation::models::ConnectionStatus;
use crate::im::message::Message;
use async_trait::async_trait;

/// 会话同步监听器
///
/// 回调在状态锁释放之后调用，可以在回调内读取同步器状态
#[async_trait]
pub trait ConversationSyncListener: Send + Sync {
    /// 可见消息序列变更（全量快照）
    async fn on_messages_changed(&self, conversation_id: &str, messages: Vec<Message>);

    /// 订阅连接状态变更
    async fn on_connection_status_changed(&self, conversation_id: &str, status: ConnectionStatus);

    /// 已读回执回写失败
    async fn on_write_back_failed(&self, conversation_id: &str, ids: Vec<String>, error: String);
}

/// 空实现（默认监听器）
pub struct EmptyConversationSyncListener;

#[async_trait]
impl ConversationSyncListener for EmptyConversationSyncListener {
    async fn on_messages_changed(&self, _conversation_id: &str, _messages: Vec<Message>) {}
    async fn on_connection_status_changed(
        &self,
        _conversation_id: &str,
        _status: ConnectionStatus,
    ) {
    }
    async fn on_write_back_failed(&self, _conversation_id: &str, _ids: Vec<String>, _error: String) {
    }
}
