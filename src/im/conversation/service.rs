//! 会话同步服务层
//!
//! 一个 `ConversationSync` 对应一个打开的会话：全量加载、订阅变更、合并推送、
//! 回写已读回执。状态只由本实例修改，事件在派发任务中串行合并。

use crate::im::conversation::listener::{ConversationSyncListener, EmptyConversationSyncListener};
use crate::im::conversation::merge::{apply_event, MergeOutcome};
use crate::im::conversation::models::{
    lock_state, ConnectionStatus, ConversationSyncState, SyncOptions,
};
use crate::im::conversation::receipt::ReadReceiptWriter;
use crate::im::error::SyncError;
use crate::im::feed::{ChangeFeed, FeedSignal, SubscriptionHandle};
use crate::im::message::{Message, MessageStore};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 一次全量加载的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadReport {
    /// 加载后可见的消息数
    pub loaded: usize,
    /// 本次加载发出的已读回执条数（0 表示没有回写）
    pub read_acks: usize,
}

/// 同步状态的只读快照
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationSnapshot {
    pub conversation_id: String,
    pub messages: Vec<Message>,
    pub connection_status: ConnectionStatus,
    pub pending_read_acks: Vec<String>,
}

/// 活跃订阅，丢弃时终止派发任务
struct ActiveSubscription {
    handle: SubscriptionHandle,
    task: JoinHandle<()>,
}

impl Drop for ActiveSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// 派发任务持有的上下文
#[derive(Clone)]
struct Dispatcher {
    conversation_id: String,
    state: Arc<Mutex<ConversationSyncState>>,
    listener: Arc<dyn ConversationSyncListener>,
    receipts: ReadReceiptWriter,
}

impl Dispatcher {
    /// 串行处理订阅信号；代次不匹配说明已取消订阅，直接退出
    async fn run(self, mut rx: mpsc::UnboundedReceiver<FeedSignal>, generation: u64) {
        while let Some(signal) = rx.recv().await {
            let mut status_change = None;
            let mut snapshot = None;
            let mut read_acks = Vec::new();
            {
                let mut state = lock_state(&self.state);
                if state.generation != generation {
                    debug!(
                        "[ConvSync] 丢弃已取消订阅的信号: conversationID={}, generation={}",
                        self.conversation_id, generation
                    );
                    return;
                }
                let now = Instant::now();
                state.last_activity = Some(now);
                match signal {
                    FeedSignal::Connected => {
                        if state.connection_status != ConnectionStatus::Connected {
                            state.connection_status = ConnectionStatus::Connected;
                            status_change = Some(ConnectionStatus::Connected);
                        }
                    }
                    FeedSignal::Disconnected => {
                        if state.connection_status != ConnectionStatus::Disconnected {
                            state.connection_status = ConnectionStatus::Disconnected;
                            status_change = Some(ConnectionStatus::Disconnected);
                        }
                    }
                    FeedSignal::Event(event) => {
                        let outcome = apply_event(&mut state, &event, now);
                        if let MergeOutcome::Inserted { id, .. } | MergeOutcome::Updated { id } =
                            &outcome
                        {
                            state.note_live_arrival(id);
                        }
                        if let Some(id) = outcome.read_ack_id() {
                            read_acks = state.claim_read_acks(&[id.to_string()]);
                        }
                        if outcome.changed() {
                            snapshot = Some(state.messages.clone());
                        }
                    }
                }
            }

            if let Some(status) = status_change {
                info!(
                    "[ConvSync] 🔌 连接状态: conversationID={}, status={:?}",
                    self.conversation_id, status
                );
                self.listener
                    .on_connection_status_changed(&self.conversation_id, status)
                    .await;
            }
            if let Some(messages) = snapshot {
                self.listener
                    .on_messages_changed(&self.conversation_id, messages)
                    .await;
            }
            if !read_acks.is_empty() {
                let receipts = self.receipts.clone();
                let state = self.state.clone();
                tokio::spawn(async move {
                    // 失败已在回写器内记录并通知监听器
                    let _ = receipts.write_back(&state, read_acks).await;
                });
            }
        }

        // 推送通道关闭：订阅方静默结束
        let closed = {
            let mut state = lock_state(&self.state);
            let live = state.generation == generation
                && state.connection_status != ConnectionStatus::Disconnected;
            if live {
                state.connection_status = ConnectionStatus::Disconnected;
            }
            live
        };
        if closed {
            warn!(
                "[ConvSync] ⚠️ 订阅通道已关闭: conversationID={}",
                self.conversation_id
            );
            self.listener
                .on_connection_status_changed(&self.conversation_id, ConnectionStatus::Disconnected)
                .await;
        }
    }
}

/// 会话同步器
pub struct ConversationSync {
    conversation_id: String,
    local_user_id: String,
    store: Arc<dyn MessageStore>,
    feed: Arc<dyn ChangeFeed>,
    listener: Arc<dyn ConversationSyncListener>,
    receipts: ReadReceiptWriter,
    state: Arc<Mutex<ConversationSyncState>>,
    subscription: tokio::sync::Mutex<Option<ActiveSubscription>>,
}

impl ConversationSync {
    /// 创建会话同步器（使用默认空监听器）
    pub fn new(
        conversation_id: impl Into<String>,
        local_user_id: impl Into<String>,
        store: Arc<dyn MessageStore>,
        feed: Arc<dyn ChangeFeed>,
        options: SyncOptions,
    ) -> Self {
        Self::with_listener(
            conversation_id,
            local_user_id,
            store,
            feed,
            options,
            Arc::new(EmptyConversationSyncListener),
        )
    }

    /// 创建会话同步器（带自定义监听器）
    pub fn with_listener(
        conversation_id: impl Into<String>,
        local_user_id: impl Into<String>,
        store: Arc<dyn MessageStore>,
        feed: Arc<dyn ChangeFeed>,
        options: SyncOptions,
        listener: Arc<dyn ConversationSyncListener>,
    ) -> Self {
        let conversation_id = conversation_id.into();
        let local_user_id = local_user_id.into();
        info!(
            "[ConvSync] 创建会话同步器: conversationID={}, 用户ID={}, policy={:?}",
            conversation_id, local_user_id, options.read_receipt_policy
        );
        let receipts = ReadReceiptWriter::new(
            store.clone(),
            listener.clone(),
            conversation_id.clone(),
            local_user_id.clone(),
            options.read_receipt_policy,
        );
        let state = ConversationSyncState::new(
            conversation_id.clone(),
            local_user_id.clone(),
            options.tombstone_ttl,
        );
        Self {
            conversation_id,
            local_user_id,
            store,
            feed,
            listener,
            receipts,
            state: Arc::new(Mutex::new(state)),
            subscription: tokio::sync::Mutex::new(None),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    /// 全量加载会话消息，并为未读的对方消息发出一次批量已读回写
    ///
    /// 查询失败时返回 `LoadFailed`，本地状态保持不变。
    /// 回写失败只记录日志并通知监听器，不影响加载结果。
    pub async fn initialize(&self) -> Result<LoadReport, SyncError> {
        self.load("初始化").await
    }

    /// 手动重新同步：重新全量加载并原子替换本地序列
    pub async fn resync(&self) -> Result<LoadReport, SyncError> {
        self.load("重新同步").await
    }

    async fn load(&self, operation_name: &str) -> Result<LoadReport, SyncError> {
        info!(
            "[ConvSync] 🔄 {}: 全量加载 conversationID={}",
            operation_name, self.conversation_id
        );
        let load_started = lock_state(&self.state).feed_seq;
        let records = self
            .store
            .query_messages(&self.conversation_id)
            .await
            .map_err(|source| {
                warn!(
                    "[ConvSync] ❌ 全量加载失败: conversationID={}, error={:#}",
                    self.conversation_id, source
                );
                SyncError::LoadFailed {
                    conversation_id: self.conversation_id.clone(),
                    source,
                }
            })?;

        // 先在锁外完成映射，提交时一次性替换
        let mut loaded: Vec<Message> = Vec::with_capacity(records.len());
        let mut seen = HashSet::with_capacity(records.len());
        for raw in &records {
            if raw
                .conversation_id
                .as_deref()
                .is_some_and(|c| c != self.conversation_id)
            {
                warn!("[ConvSync] ⚠️ 全量结果中混入其他会话的消息: id={:?}", raw.id);
                continue;
            }
            match Message::from_raw(raw, &self.conversation_id, &self.local_user_id) {
                Ok(message) if message.is_deleted() => {}
                Ok(message) => {
                    if seen.insert(message.id.clone()) {
                        loaded.push(message);
                    }
                }
                Err(e) => warn!("[ConvSync] ⚠️ 跳过无法映射的消息: id={:?}, {}", raw.id, e),
            }
        }
        loaded.sort_by_key(|m| m.created_at);

        let (batch, snapshot) = {
            let mut state = lock_state(&self.state);
            let now = Instant::now();
            state.prune_tombstones(now);
            loaded.retain(|m| !state.is_tombstoned(&m.id));

            let unread: Vec<String> = loaded
                .iter()
                .filter(|m| m.is_inbound() && !m.is_read)
                .map(|m| m.id.clone())
                .collect();

            // 全量结果之外的推送消息：加载期间到达的，或比全量结果更新的，予以保留
            let newest = loaded.last().map(|m| m.created_at);
            let mut local: HashMap<&str, &Message> = HashMap::with_capacity(state.messages.len());
            for m in &state.messages {
                local.insert(m.id.as_str(), m);
            }
            let mut live: Vec<Message> = Vec::new();
            for m in &state.messages {
                if seen.contains(&m.id) || state.is_tombstoned(&m.id) {
                    continue;
                }
                let Some(&arrived) = state.live_arrivals.get(&m.id) else {
                    continue;
                };
                if arrived > load_started || newest.map_or(true, |n| m.created_at > n) {
                    live.push(m.clone());
                }
            }

            // 已读只能单向变化：本地已读的消息不被较旧的全量结果改回未读
            for message in loaded.iter_mut() {
                if state.pending_read_acks.contains(&message.id) {
                    message.is_read = true;
                }
                if let Some(previous) = local.get(message.id.as_str()) {
                    if previous.is_read {
                        message.is_read = true;
                    }
                    if message.read_at.is_none() {
                        message.read_at = previous.read_at;
                    }
                }
            }
            drop(local);
            loaded.extend(live);
            loaded.sort_by_key(|m| m.created_at);
            let kept: HashSet<&str> = loaded.iter().map(|m| m.id.as_str()).collect();
            state.live_arrivals.retain(|id, _| kept.contains(id.as_str()));
            state.messages = loaded;
            state.last_activity = Some(now);

            let batch = state.claim_read_acks(&unread);
            (batch, state.messages.clone())
        };

        let report = LoadReport {
            loaded: snapshot.len(),
            read_acks: batch.len(),
        };
        info!(
            "[ConvSync] ✅ {}完成: conversationID={}, 消息={}, 待回写已读={}",
            operation_name, self.conversation_id, report.loaded, report.read_acks
        );
        self.listener
            .on_messages_changed(&self.conversation_id, snapshot)
            .await;

        if !batch.is_empty() {
            // 失败已在回写器内记录并通知监听器
            let _ = self.receipts.write_back(&self.state, batch).await;
        }
        Ok(report)
    }

    /// 订阅会话变更；已有连接中或已连接的订阅时直接返回
    pub async fn subscribe(&self) -> Result<(), SyncError> {
        let mut slot = self.subscription.lock().await;
        let status = self.connection_status();
        if slot.is_some() && status != ConnectionStatus::Disconnected {
            debug!(
                "[ConvSync] 订阅已存在，忽略: conversationID={}, status={:?}",
                self.conversation_id, status
            );
            return Ok(());
        }
        if let Some(stale) = slot.take() {
            debug!("[ConvSync] 清理已断开的订阅: handle={}", stale.handle.id);
            self.teardown(stale).await;
        }

        let generation = {
            let mut state = lock_state(&self.state);
            state.generation += 1;
            state.connection_status = ConnectionStatus::Connecting;
            state.generation
        };
        info!(
            "[ConvSync] 📡 订阅会话变更: conversationID={}, generation={}",
            self.conversation_id, generation
        );
        self.listener
            .on_connection_status_changed(&self.conversation_id, ConnectionStatus::Connecting)
            .await;

        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher {
            conversation_id: self.conversation_id.clone(),
            state: self.state.clone(),
            listener: self.listener.clone(),
            receipts: self.receipts.clone(),
        };
        let task = tokio::spawn(dispatcher.run(rx, generation));

        match self.feed.subscribe(&self.conversation_id, tx).await {
            Ok(handle) => {
                debug!(
                    "[ConvSync] 订阅已建立: conversationID={}, handle={}",
                    self.conversation_id, handle.id
                );
                *slot = Some(ActiveSubscription { handle, task });
                Ok(())
            }
            Err(source) => {
                task.abort();
                let reset = {
                    let mut state = lock_state(&self.state);
                    let current = state.generation == generation;
                    if current {
                        state.connection_status = ConnectionStatus::Disconnected;
                    }
                    current
                };
                warn!(
                    "[ConvSync] ❌ 订阅失败，仅保留全量数据: conversationID={}, error={:#}",
                    self.conversation_id, source
                );
                if reset {
                    self.listener
                        .on_connection_status_changed(
                            &self.conversation_id,
                            ConnectionStatus::Disconnected,
                        )
                        .await;
                }
                Err(SyncError::SubscriptionFailed {
                    conversation_id: self.conversation_id.clone(),
                    source,
                })
            }
        }
    }

    /// 取消订阅；返回后不会再有任何推送被合并
    pub async fn unsubscribe(&self) {
        let mut slot = self.subscription.lock().await;
        let previous = {
            let mut state = lock_state(&self.state);
            state.generation += 1;
            std::mem::replace(&mut state.connection_status, ConnectionStatus::Disconnected)
        };
        if let Some(active) = slot.take() {
            self.teardown(active).await;
            info!("[ConvSync] 👋 已取消订阅: conversationID={}", self.conversation_id);
        }
        drop(slot);

        if previous != ConnectionStatus::Disconnected {
            self.listener
                .on_connection_status_changed(&self.conversation_id, ConnectionStatus::Disconnected)
                .await;
        }
    }

    async fn teardown(&self, active: ActiveSubscription) {
        active.task.abort();
        if let Err(e) = self.feed.unsubscribe(active.handle.clone()).await {
            warn!(
                "[ConvSync] ⚠️ 取消订阅失败: handle={}, error={:#}",
                active.handle.id, e
            );
        }
    }

    /// 重连：拆除旧订阅，重新订阅后全量同步补齐断线期间的变更
    ///
    /// 订阅失败时仍会执行全量同步，之后返回订阅错误
    pub async fn reconnect(&self) -> Result<LoadReport, SyncError> {
        info!("[ConvSync] 🔁 重连: conversationID={}", self.conversation_id);
        self.unsubscribe().await;
        let subscribed = self.subscribe().await;
        let report = self.resync().await?;
        subscribed?;
        Ok(report)
    }

    /// 标记指定消息已读
    pub async fn mark_read(&self, ids: &[String]) -> Result<u64, SyncError> {
        self.receipts.mark_read(&self.state, ids).await
    }

    /// 距离最近一次订阅活动或全量同步的时间
    pub fn staleness(&self) -> Option<Duration> {
        lock_state(&self.state).last_activity.map(|t| t.elapsed())
    }

    /// 是否超过最大允许的陈旧时间（从未同步过也视为陈旧）
    pub fn is_stale(&self, max_staleness: Duration) -> bool {
        self.staleness().map_or(true, |elapsed| elapsed > max_staleness)
    }

    /// 释放：取消订阅并清空本地状态
    pub async fn dispose(&self) {
        self.unsubscribe().await;
        let mut state = lock_state(&self.state);
        state.messages.clear();
        state.pending_read_acks.clear();
        state.tombstones.clear();
        state.live_arrivals.clear();
        state.last_activity = None;
        info!("[ConvSync] 🗑️ 已释放会话: conversationID={}", self.conversation_id);
    }

    pub fn messages(&self) -> Vec<Message> {
        lock_state(&self.state).messages.clone()
    }

    pub fn snapshot(&self) -> ConversationSnapshot {
        let state = lock_state(&self.state);
        let mut pending: Vec<String> = state.pending_read_acks.iter().cloned().collect();
        pending.sort();
        ConversationSnapshot {
            conversation_id: state.conversation_id.clone(),
            messages: state.messages.clone(),
            connection_status: state.connection_status,
            pending_read_acks: pending,
        }
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        lock_state(&self.state).connection_status
    }

    pub fn pending_read_acks(&self) -> HashSet<String> {
        lock_state(&self.state).pending_read_acks.clone()
    }

    pub fn check_invariants(&self) -> bool {
        lock_state(&self.state).check_invariants()
    }
}
