//! 会话同步本地模型定义

use crate::im::message::Message;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// 变更订阅连接状态
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// 已读回写失败时的本地处理策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReadReceiptPolicy {
    /// 保留本地乐观已读，不回滚（优先界面响应）
    #[default]
    Optimistic,
    /// 回写失败的消息恢复为未读（优先一致性）
    RollbackOnFailure,
}

/// 默认墓碑保留时长
pub const DEFAULT_TOMBSTONE_TTL: Duration = Duration::from_secs(300);

/// 会话同步器配置
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// 已读回写失败策略
    pub read_receipt_policy: ReadReceiptPolicy,
    /// 删除墓碑保留时长，过期后同 id 的插入不再被拦截
    pub tombstone_ttl: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            read_receipt_policy: ReadReceiptPolicy::default(),
            tombstone_ttl: DEFAULT_TOMBSTONE_TTL,
        }
    }
}

/// 加锁读写同步状态；锁只在同步代码段内持有，不跨 `.await`
pub(crate) fn lock_state(state: &Mutex<ConversationSyncState>) -> MutexGuard<'_, ConversationSyncState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 单个打开会话的同步状态，由打开它的会话同步器独占
#[derive(Debug)]
pub struct ConversationSyncState {
    pub(crate) conversation_id: String,
    pub(crate) local_user_id: String,
    /// 可见消息序列：按 `created_at` 升序、按 id 去重
    pub(crate) messages: Vec<Message>,
    pub(crate) connection_status: ConnectionStatus,
    /// 已发出但尚未完成的已读回写
    pub(crate) pending_read_acks: HashSet<String>,
    /// 已删除 id 及删除时间
    pub(crate) tombstones: HashMap<String, Instant>,
    pub(crate) tombstone_ttl: Duration,
    /// 订阅代次，取消订阅时递增，旧代次的事件一律丢弃
    pub(crate) generation: u64,
    /// 最近一次收到订阅信号的时间
    pub(crate) last_activity: Option<Instant>,
    /// 推送合并计数，每次经推送插入或更新消息时递增
    pub(crate) feed_seq: u64,
    /// 经推送到达的消息 id 及其到达序号
    pub(crate) live_arrivals: HashMap<String, u64>,
}

impl ConversationSyncState {
    pub fn new(
        conversation_id: impl Into<String>,
        local_user_id: impl Into<String>,
        tombstone_ttl: Duration,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            local_user_id: local_user_id.into(),
            messages: Vec::new(),
            connection_status: ConnectionStatus::Disconnected,
            pending_read_acks: HashSet::new(),
            tombstones: HashMap::new(),
            tombstone_ttl,
            generation: 0,
            last_activity: None,
            feed_seq: 0,
            live_arrivals: HashMap::new(),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection_status
    }

    pub fn pending_read_acks(&self) -> &HashSet<String> {
        &self.pending_read_acks
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.messages.iter().position(|m| m.id == id)
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub(crate) fn get_mut(&mut self, id: &str) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == id)
    }

    /// 按 `created_at` 二分插入，相同时间排在已有消息之后（保持到达顺序）
    pub(crate) fn insert_sorted(&mut self, message: Message) {
        let idx = self
            .messages
            .partition_point(|m| m.created_at <= message.created_at);
        self.messages.insert(idx, message);
    }

    pub(crate) fn remove(&mut self, id: &str) -> Option<Message> {
        self.live_arrivals.remove(id);
        self.position(id).map(|idx| self.messages.remove(idx))
    }

    /// 记录一次经推送到达的插入或更新
    pub(crate) fn note_live_arrival(&mut self, id: &str) {
        self.feed_seq += 1;
        self.live_arrivals.insert(id.to_string(), self.feed_seq);
    }

    pub fn is_tombstoned(&self, id: &str) -> bool {
        self.tombstones.contains_key(id)
    }

    pub(crate) fn add_tombstone(&mut self, id: &str, now: Instant) {
        self.tombstones.insert(id.to_string(), now);
    }

    pub(crate) fn prune_tombstones(&mut self, now: Instant) {
        let ttl = self.tombstone_ttl;
        self.tombstones
            .retain(|_, deleted_at| now.saturating_duration_since(*deleted_at) < ttl);
    }

    /// 领取需要回写的已读回执
    ///
    /// 只领取：本地存在、对方发来、服务端尚未确认已读（`read_at` 为空）且不在途的消息。
    /// 领取后立即乐观置为已读并记入 `pending_read_acks`
    pub(crate) fn claim_read_acks(&mut self, ids: &[String]) -> Vec<String> {
        let mut batch = Vec::new();
        for id in ids {
            if self.pending_read_acks.contains(id) || batch.contains(id) {
                continue;
            }
            let Some(message) = self.messages.iter_mut().find(|m| &m.id == id) else {
                continue;
            };
            if !message.is_inbound() || message.read_at.is_some() {
                continue;
            }
            message.is_read = true;
            batch.push(id.clone());
        }
        self.pending_read_acks.extend(batch.iter().cloned());
        batch
    }

    /// 已读回写结束：清理在途集合，成功时记录确认时间，失败时按策略决定是否回滚
    pub(crate) fn settle_read_acks(
        &mut self,
        ids: &[String],
        confirmed_at: Option<chrono::DateTime<chrono::Utc>>,
        policy: ReadReceiptPolicy,
    ) -> bool {
        let mut changed = false;
        for id in ids {
            self.pending_read_acks.remove(id);
            let Some(message) = self.messages.iter_mut().find(|m| &m.id == id) else {
                continue;
            };
            match confirmed_at {
                Some(at) => {
                    if message.read_at.is_none() {
                        message.read_at = Some(at);
                        changed = true;
                    }
                }
                None if policy == ReadReceiptPolicy::RollbackOnFailure => {
                    if message.is_read && message.read_at.is_none() {
                        message.is_read = false;
                        changed = true;
                    }
                }
                None => {}
            }
        }
        changed
    }

    /// 可见序列不变量：id 唯一、按 `created_at` 升序、不含已删除消息
    pub fn check_invariants(&self) -> bool {
        let sorted = self
            .messages
            .windows(2)
            .all(|w| w[0].created_at <= w[1].created_at);
        let mut seen = HashSet::with_capacity(self.messages.len());
        let unique = self.messages.iter().all(|m| seen.insert(m.id.as_str()));
        let no_deleted = self.messages.iter().all(|m| !m.is_deleted());
        sorted && unique && no_deleted
    }
}
