//! 同步客户端
//!
//! 持有消息存储与变更订阅，负责打开、关闭会话以及发送、编辑、删除消息。
//! 同一会话同时只存在一个 `ConversationSync`，重新打开会丢弃旧实例的状态。

use crate::im::conversation::{
    ConversationSync, ConversationSyncListener, EmptyConversationSyncListener, ReadReceiptPolicy,
    SyncOptions, DEFAULT_TOMBSTONE_TTL,
};
use crate::im::db::create_sqlite_pool_with_migration;
use crate::im::error::SyncError;
use crate::im::feed::{ChangeFeed, LocalChangeFeed, RealtimeChangeFeed, RealtimeConfig};
use crate::im::message::{MessageStore, NewMessage, RawMessageRecord, RestMessageStore, SqliteMessageStore};
use crate::im::serialization::generate_msg_id;
use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// 客户端配置
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// 本地登录用户 ID
    pub user_id: String,
    /// 用户访问 token
    pub token: String,
    /// 项目 API key
    pub api_key: String,
    /// REST 基础地址
    pub api_base_url: String,
    /// 实时服务地址
    pub realtime_url: String,
    /// 本地 SQLite 数据库 URL（仅本地模式使用）
    ///
    /// 例如：`sqlite://convsync.db?mode=rwc`
    pub db_url: String,
    /// 已读回写失败策略
    pub read_receipt_policy: ReadReceiptPolicy,
    /// 删除墓碑保留时长
    pub tombstone_ttl: Duration,
    /// 等待加入频道确认的超时时间
    pub join_timeout: Duration,
    /// 实时连接心跳间隔
    pub heartbeat_interval: Duration,
    /// 订阅无活动超过该时长即视为陈旧，需要重新同步
    pub max_staleness: Duration,
}

impl ClientConfig {
    /// 创建默认配置
    pub fn new(user_id: String, token: String, api_key: String) -> Self {
        Self {
            user_id,
            token,
            api_key,
            api_base_url: "http://localhost:54321".to_string(),
            realtime_url: "ws://localhost:54321/realtime/v1".to_string(),
            db_url: "sqlite://convsync.db?mode=rwc".to_string(),
            read_receipt_policy: ReadReceiptPolicy::Optimistic,
            tombstone_ttl: DEFAULT_TOMBSTONE_TTL,
            join_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(25),
            max_staleness: Duration::from_secs(120),
        }
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            read_receipt_policy: self.read_receipt_policy,
            tombstone_ttl: self.tombstone_ttl,
        }
    }

    pub fn realtime_config(&self) -> RealtimeConfig {
        RealtimeConfig {
            realtime_url: self.realtime_url.clone(),
            api_key: self.api_key.clone(),
            access_token: self.token.clone(),
            join_timeout: self.join_timeout,
            heartbeat_interval: self.heartbeat_interval,
        }
    }
}

/// 同步客户端
pub struct SyncClient {
    config: ClientConfig,
    store: Arc<dyn MessageStore>,
    feed: Arc<dyn ChangeFeed>,
    // 会话同步监听器（可由调用方注册）
    listener: Arc<dyn ConversationSyncListener>,
    conversations: Mutex<HashMap<String, Arc<ConversationSync>>>,
}

impl SyncClient {
    /// 连接远端后端：REST 读写 + 实时订阅
    pub fn connect(config: ClientConfig) -> Result<Self> {
        // 创建带认证的 HTTP 客户端（apikey 与 token 通过 default_headers 自动添加）
        let http_client = reqwest::ClientBuilder::new()
            .default_headers({
                let mut headers = reqwest::header::HeaderMap::new();
                headers.insert(
                    reqwest::header::HeaderName::from_static("apikey"),
                    reqwest::header::HeaderValue::from_str(&config.api_key)
                        .context("无效的 api key")?,
                );
                headers.insert(
                    reqwest::header::AUTHORIZATION,
                    reqwest::header::HeaderValue::from_str(&format!("Bearer {}", config.token))
                        .context("无效的 token")?,
                );
                headers
            })
            .build()
            .context("创建 HTTP 客户端失败")?;

        info!(
            "[Client] 🔗 使用远端后端: user={}, api={}, realtime={}",
            config.user_id, config.api_base_url, config.realtime_url
        );
        let store = Arc::new(RestMessageStore::new(
            http_client,
            config.api_base_url.clone(),
        ));
        let feed = Arc::new(RealtimeChangeFeed::new(config.realtime_config()));
        Ok(Self::with_backend(config, store, feed))
    }

    /// 本地模式：SQLite 存储，写入回放到进程内变更订阅
    pub async fn local(config: ClientConfig) -> Result<Self> {
        let pool = create_sqlite_pool_with_migration(&config.db_url).await?;
        let feed = LocalChangeFeed::new();
        let store = Arc::new(SqliteMessageStore::with_change_feed(pool, feed.clone()));
        info!(
            "[Client] 💾 使用本地后端: user={}, db={}",
            config.user_id, config.db_url
        );
        Ok(Self::with_backend(config, store, Arc::new(feed)))
    }

    /// 使用自定义存储与订阅
    pub fn with_backend(
        config: ClientConfig,
        store: Arc<dyn MessageStore>,
        feed: Arc<dyn ChangeFeed>,
    ) -> Self {
        Self {
            config,
            store,
            feed,
            listener: Arc::new(EmptyConversationSyncListener),
            conversations: Mutex::new(HashMap::new()),
        }
    }

    /// 注册会话同步监听器，对之后打开的会话生效
    pub fn set_conversation_sync_listener(&mut self, listener: Arc<dyn ConversationSyncListener>) {
        self.listener = listener;
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn MessageStore> {
        self.store.clone()
    }

    /// 打开会话：先订阅再全量加载，加载期间到达的推送按幂等规则合并
    ///
    /// 订阅失败时降级为只读全量数据，连接状态保持 disconnected；加载失败返回错误
    pub async fn open_conversation(&self, conversation_id: &str) -> Result<Arc<ConversationSync>, SyncError> {
        let mut conversations = self.conversations.lock().await;
        if let Some(previous) = conversations.remove(conversation_id) {
            info!("[Client] ♻️ 重新打开会话，丢弃旧状态: {}", conversation_id);
            previous.dispose().await;
        }

        let sync = Arc::new(ConversationSync::with_listener(
            conversation_id,
            self.config.user_id.clone(),
            self.store.clone(),
            self.feed.clone(),
            self.config.sync_options(),
            self.listener.clone(),
        ));

        if let Err(e) = sync.subscribe().await {
            warn!("[Client] ⚠️ {}，会话以只读模式打开", e);
        }
        if let Err(e) = sync.initialize().await {
            sync.dispose().await;
            return Err(e);
        }

        conversations.insert(conversation_id.to_string(), sync.clone());
        info!("[Client] 📂 已打开会话: {}", conversation_id);
        Ok(sync)
    }

    /// 当前已打开的会话
    pub async fn conversation(&self, conversation_id: &str) -> Option<Arc<ConversationSync>> {
        self.conversations.lock().await.get(conversation_id).cloned()
    }

    /// 关闭会话并释放本地状态
    pub async fn close_conversation(&self, conversation_id: &str) {
        let removed = self.conversations.lock().await.remove(conversation_id);
        if let Some(sync) = removed {
            sync.dispose().await;
            info!("[Client] 📁 已关闭会话: {}", conversation_id);
        }
    }

    /// 关闭所有会话
    pub async fn close(&self) {
        let all: Vec<Arc<ConversationSync>> = self
            .conversations
            .lock()
            .await
            .drain()
            .map(|(_, sync)| sync)
            .collect();
        for sync in all {
            sync.dispose().await;
        }
    }

    /// 发送文本消息；本地会话状态通过变更推送更新
    pub async fn send_text_message(
        &self,
        conversation_id: &str,
        body: &str,
    ) -> Result<RawMessageRecord> {
        let message = NewMessage::text(
            generate_msg_id(),
            conversation_id,
            self.config.user_id.clone(),
            body,
        );
        info!(
            "[Client] 📤 发送消息: conversationID={}, id={}",
            conversation_id, message.id
        );
        self.store
            .insert_message(&message)
            .await
            .with_context(|| format!("发送消息失败: {}", message.id))
    }

    /// 编辑消息正文
    pub async fn edit_message(&self, message_id: &str, body: &str) -> Result<()> {
        info!("[Client] ✏️ 编辑消息: id={}", message_id);
        self.store
            .update_body(message_id, body, Utc::now())
            .await
            .with_context(|| format!("编辑消息失败: {}", message_id))
    }

    /// 删除消息（软删除）
    pub async fn delete_message(&self, message_id: &str) -> Result<()> {
        info!("[Client] 🗑️ 删除消息: id={}", message_id);
        self.store
            .soft_delete(message_id, Utc::now())
            .await
            .with_context(|| format!("删除消息失败: {}", message_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::im::conversation::testing::{eventually, init_test_logger, RecordingListener};
    use crate::im::conversation::ConnectionStatus;

    const CONV: &str = "conv-1";

    async fn local_client(user_id: &str) -> Result<SyncClient> {
        init_test_logger();
        let mut config = ClientConfig::new(user_id.to_string(), String::new(), String::new());
        config.db_url = "sqlite::memory:".to_string();
        SyncClient::local(config).await
    }

    fn bodies(sync: &ConversationSync) -> Vec<String> {
        sync.messages().into_iter().map(|m| m.body).collect()
    }

    #[test]
    fn config_defaults() {
        let config = ClientConfig::new("alice".into(), "t".into(), "k".into());
        assert_eq!(config.join_timeout, Duration::from_secs(10));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(25));
        assert_eq!(config.sync_options().tombstone_ttl, DEFAULT_TOMBSTONE_TTL);
        assert_eq!(config.realtime_config().access_token, "t");
    }

    #[test]
    fn connect_rejects_invalid_header_values() {
        let config = ClientConfig::new("alice".into(), "bad\ntoken".into(), "k".into());
        assert!(SyncClient::connect(config).is_err());
    }

    #[tokio::test]
    async fn local_round_trip_send_edit_delete() -> Result<()> {
        let mut client = local_client("alice").await?;
        let listener = Arc::new(RecordingListener::default());
        client.set_conversation_sync_listener(listener.clone());

        // 对方在打开前发来一条消息
        let store = client.store();
        let mut early = NewMessage::text("m1", CONV, "bob", "hi alice");
        early.created_at = Utc::now() - chrono::Duration::seconds(5);
        store.insert_message(&early).await?;

        let sync = client.open_conversation(CONV).await?;
        assert!(eventually(|| sync.connection_status() == ConnectionStatus::Connected).await);
        assert_eq!(bodies(&sync), vec!["hi alice"]);
        // 打开时对未读的对方消息回写已读
        assert!(sync.messages()[0].is_read);
        assert!(sync.messages()[0].read_at.is_some());

        let sent = client.send_text_message(CONV, "hello bob").await?;
        let sent_id = sent.id.clone().unwrap_or_default();
        assert!(eventually(|| bodies(&sync) == vec!["hi alice", "hello bob"]).await);

        client.edit_message(&sent_id, "hello bob!").await?;
        assert!(eventually(|| bodies(&sync).last().map(String::as_str) == Some("hello bob!")).await);

        client.delete_message("m1").await?;
        assert!(eventually(|| bodies(&sync) == vec!["hello bob!"]).await);
        assert!(sync.check_invariants());
        assert!(listener.snapshot_count() > 0);

        client.close_conversation(CONV).await;
        assert!(client.conversation(CONV).await.is_none());
        assert_eq!(sync.connection_status(), ConnectionStatus::Disconnected);
        Ok(())
    }

    #[tokio::test]
    async fn reopening_discards_previous_instance() -> Result<()> {
        let client = local_client("alice").await?;
        let first = client.open_conversation(CONV).await?;
        let second = client.open_conversation(CONV).await?;

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(first.connection_status(), ConnectionStatus::Disconnected);
        assert!(eventually(|| second.connection_status() == ConnectionStatus::Connected).await);
        client.close().await;
        Ok(())
    }
}
