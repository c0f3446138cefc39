//! 变更事件合并
//!
//! 推送不保证顺序，也可能重复，因此合并按 id 做幂等 upsert，而不是追加日志。
//! `apply_event` 是同步函数，不做任何 I/O；处理完每个事件后
//! `ConversationSyncState::check_invariants` 都应成立。

use crate::im::conversation::models::ConversationSyncState;
use crate::im::error::RecordError;
use crate::im::message::{ChangeEvent, ChangeKind, Message, RawMessageRecord};
use std::time::Instant;
use tracing::{debug, warn};

/// 事件被忽略的原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    /// 重复插入
    Duplicate,
    /// 删除的 id 本地不存在
    UnknownId,
    /// id 已被删除，拦截迟到的插入
    Tombstoned,
    /// 事件属于其他会话
    ForeignConversation,
    /// 记录缺少必要字段
    Malformed(&'static str),
    /// 更新没有带来任何变化
    NoChange,
}

/// 单个事件的合并结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted { id: String, needs_read_ack: bool },
    Updated { id: String },
    Removed { id: String },
    Ignored(IgnoreReason),
}

impl MergeOutcome {
    /// 可见序列是否发生变化
    pub fn changed(&self) -> bool {
        !matches!(self, MergeOutcome::Ignored(_))
    }

    /// 需要回写已读回执的消息 id
    pub fn read_ack_id(&self) -> Option<&str> {
        match self {
            MergeOutcome::Inserted {
                id,
                needs_read_ack: true,
            } => Some(id),
            _ => None,
        }
    }
}

/// 合并一个变更事件
pub fn apply_event(
    state: &mut ConversationSyncState,
    event: &ChangeEvent,
    now: Instant,
) -> MergeOutcome {
    state.prune_tombstones(now);

    let record = &event.record;
    let Some(id) = record.id.as_deref() else {
        warn!(
            "[ConvSync/Merge] ⚠️ 丢弃缺少 id 的 {:?} 事件: conversationID={}",
            event.kind, state.conversation_id
        );
        return MergeOutcome::Ignored(IgnoreReason::Malformed("id"));
    };

    if let Some(conversation_id) = record.conversation_id.as_deref() {
        if conversation_id != state.conversation_id {
            warn!(
                "[ConvSync/Merge] ⚠️ 丢弃其他会话的事件: 期望={}, 实际={}, id={}",
                state.conversation_id, conversation_id, id
            );
            return MergeOutcome::Ignored(IgnoreReason::ForeignConversation);
        }
    }

    let outcome = match event.kind {
        ChangeKind::Insert => on_insert(state, id, record, now),
        ChangeKind::Update => on_update(state, id, record, now),
        ChangeKind::Delete => on_delete(state, id, now),
    };
    debug!(
        "[ConvSync/Merge] {:?} id={} -> {:?}",
        event.kind, id, outcome
    );
    outcome
}

fn on_insert(
    state: &mut ConversationSyncState,
    id: &str,
    record: &RawMessageRecord,
    now: Instant,
) -> MergeOutcome {
    if record.deleted_at.is_some() {
        return on_delete(state, id, now);
    }
    if state.is_tombstoned(id) {
        debug!("[ConvSync/Merge] 拦截已删除消息的插入: id={}", id);
        return MergeOutcome::Ignored(IgnoreReason::Tombstoned);
    }
    if state.position(id).is_some() {
        return MergeOutcome::Ignored(IgnoreReason::Duplicate);
    }

    let mut message = match Message::from_raw(record, &state.conversation_id, &state.local_user_id)
    {
        Ok(message) => message,
        Err(e) => {
            warn!("[ConvSync/Merge] ⚠️ 丢弃无法映射的插入: id={}, {}", id, e);
            let RecordError::MissingField(field) = e;
            return MergeOutcome::Ignored(IgnoreReason::Malformed(field));
        }
    };

    // 对方发来的未读消息：先乐观置为已读，回执异步回写
    let needs_read_ack = message.is_inbound() && !message.is_read;
    if needs_read_ack {
        message.is_read = true;
    }

    state.insert_sorted(message);
    MergeOutcome::Inserted {
        id: id.to_string(),
        needs_read_ack,
    }
}

fn on_update(
    state: &mut ConversationSyncState,
    id: &str,
    record: &RawMessageRecord,
    now: Instant,
) -> MergeOutcome {
    if record.deleted_at.is_some() {
        return on_delete(state, id, now);
    }

    let Some(existing) = state.get_mut(id) else {
        // 更新先于插入到达：按插入处理
        debug!("[ConvSync/Merge] 更新先于插入到达，合成插入: id={}", id);
        return on_insert(state, id, record, now);
    };

    let mut changed = false;

    // 正文与编辑时间以服务端为准（后写覆盖）
    if let Some(body) = &record.body {
        if &existing.body != body {
            existing.body = body.clone();
            changed = true;
        }
    }
    if record.edited_at.is_some() && existing.edited_at != record.edited_at {
        existing.edited_at = record.edited_at;
        changed = true;
    }
    if let Some(content_type) = record.content_type {
        if existing.content_type != content_type {
            existing.content_type = content_type;
            changed = true;
        }
    }
    if record.media_url.is_some() && existing.media_url != record.media_url {
        existing.media_url = record.media_url.clone();
        changed = true;
    }

    // 已读只能 false -> true，过期的更新不能把已读改回未读
    if record.is_read == Some(true) && !existing.is_read {
        existing.is_read = true;
        changed = true;
    }
    if existing.read_at.is_none() && record.read_at.is_some() && existing.is_read {
        existing.read_at = record.read_at;
        changed = true;
    }

    if changed {
        MergeOutcome::Updated { id: id.to_string() }
    } else {
        MergeOutcome::Ignored(IgnoreReason::NoChange)
    }
}

fn on_delete(state: &mut ConversationSyncState, id: &str, now: Instant) -> MergeOutcome {
    state.add_tombstone(id, now);
    match state.remove(id) {
        Some(_) => MergeOutcome::Removed { id: id.to_string() },
        None => MergeOutcome::Ignored(IgnoreReason::UnknownId),
    }
}
