//! 已读回执回写
//!
//! 领取（claim）在状态锁内同步完成并乐观置为已读，真正的存储写入在锁外进行。
//! 同一条消息在回写结束前不会被再次领取，重叠的调用因此自然合并。

use crate::im::conversation::listener::ConversationSyncListener;
use crate::im::conversation::models::{lock_state, ConversationSyncState, ReadReceiptPolicy};
use crate::im::error::SyncError;
use crate::im::message::MessageStore;
use chrono::Utc;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// 已读回执回写器
#[derive(Clone)]
pub struct ReadReceiptWriter {
    store: Arc<dyn MessageStore>,
    listener: Arc<dyn ConversationSyncListener>,
    conversation_id: String,
    local_user_id: String,
    policy: ReadReceiptPolicy,
}

impl ReadReceiptWriter {
    pub fn new(
        store: Arc<dyn MessageStore>,
        listener: Arc<dyn ConversationSyncListener>,
        conversation_id: impl Into<String>,
        local_user_id: impl Into<String>,
        policy: ReadReceiptPolicy,
    ) -> Self {
        Self {
            store,
            listener,
            conversation_id: conversation_id.into(),
            local_user_id: local_user_id.into(),
            policy,
        }
    }

    /// 标记指定消息已读：只处理对方发来、尚未确认已读且不在途的消息
    pub async fn mark_read(
        &self,
        state: &Mutex<ConversationSyncState>,
        ids: &[String],
    ) -> Result<u64, SyncError> {
        let (batch, snapshot) = {
            let mut state = lock_state(state);
            let batch = state.claim_read_acks(ids);
            let snapshot = (!batch.is_empty()).then(|| state.messages.clone());
            (batch, snapshot)
        };
        if batch.is_empty() {
            debug!(
                "[ReadAck] 无需回写: conversationID={}, 请求={}",
                self.conversation_id,
                ids.len()
            );
            return Ok(0);
        }
        if let Some(messages) = snapshot {
            self.listener
                .on_messages_changed(&self.conversation_id, messages)
                .await;
        }
        self.write_back(state, batch).await
    }

    /// 回写一批已领取的回执，一次存储写入
    pub async fn write_back(
        &self,
        state: &Mutex<ConversationSyncState>,
        batch: Vec<String>,
    ) -> Result<u64, SyncError> {
        if batch.is_empty() {
            return Ok(0);
        }
        info!(
            "[ReadAck] 📤 回写已读: conversationID={}, 条数={}",
            self.conversation_id,
            batch.len()
        );

        let read_at = Utc::now();
        let result = self
            .store
            .mark_read(&self.conversation_id, &batch, &self.local_user_id, read_at)
            .await;

        let confirmed_at = result.as_ref().ok().map(|_| read_at);
        let snapshot = {
            let mut state = lock_state(state);
            state
                .settle_read_acks(&batch, confirmed_at, self.policy)
                .then(|| state.messages.clone())
        };
        if let Some(messages) = snapshot {
            self.listener
                .on_messages_changed(&self.conversation_id, messages)
                .await;
        }

        match result {
            Ok(updated) => {
                debug!(
                    "[ReadAck] ✅ 回写完成: conversationID={}, 请求={}, 实际更新={}",
                    self.conversation_id,
                    batch.len(),
                    updated
                );
                Ok(updated)
            }
            Err(e) => {
                warn!(
                    "[ReadAck] ⚠️ 回写失败: conversationID={}, ids={:?}, policy={:?}, error={:#}",
                    self.conversation_id, batch, self.policy, e
                );
                self.listener
                    .on_write_back_failed(&self.conversation_id, batch.clone(), format!("{:#}", e))
                    .await;
                Err(SyncError::WriteBackFailed {
                    ids: batch,
                    source: e,
                })
            }
        }
    }
}
