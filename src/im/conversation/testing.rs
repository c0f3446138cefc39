//! 会话同步测试用的存储与监听器替身

use crate::im::conversation::listener::ConversationSyncListener;
use crate::im::conversation::models::ConnectionStatus;
use crate::im::message::{Message, MessageStore, NewMessage, RawMessageRecord};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, Once};
use std::time::Duration;
use tokio::sync::Semaphore;

static INIT_LOGGER: Once = Once::new();

pub fn init_test_logger() {
    INIT_LOGGER.call_once(|| {
        use tracing_subscriber::prelude::*;
        use tracing_subscriber::EnvFilter;

        let filter_layer = EnvFilter::new("info,convsync_sdk_core=debug,sqlx=warn");
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_file(true)
            .with_line_number(true)
            .with_target(false)
            .with_test_writer();

        let _ = tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .try_init();
    });
}

pub fn ts(offset_ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(1_714_550_400_000 + offset_ms).unwrap()
}

pub fn record(id: &str, conversation_id: &str, sender: &str, offset_ms: i64) -> RawMessageRecord {
    RawMessageRecord {
        id: Some(id.to_string()),
        conversation_id: Some(conversation_id.to_string()),
        sender_id: Some(sender.to_string()),
        body: Some(format!("body {}", id)),
        created_at: Some(ts(offset_ms)),
        is_read: Some(false),
        ..Default::default()
    }
}

/// 轮询直到条件成立，超时返回 false
pub async fn eventually<F>(mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// 带超时地等待一个 future
pub async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out")
}

/// 内存消息存储：记录每次已读回写，可注入失败或挂起回写
pub struct RecordingStore {
    pub records: Mutex<Vec<RawMessageRecord>>,
    pub mark_read_calls: Mutex<Vec<Vec<String>>>,
    pub query_calls: Mutex<usize>,
    pub fail_query: AtomicBool,
    pub fail_mark_read: AtomicBool,
    gate: Semaphore,
    query_gate: Semaphore,
}

impl RecordingStore {
    pub fn new(records: Vec<RawMessageRecord>) -> Self {
        Self {
            records: Mutex::new(records),
            mark_read_calls: Mutex::new(Vec::new()),
            query_calls: Mutex::new(0),
            fail_query: AtomicBool::new(false),
            fail_mark_read: AtomicBool::new(false),
            gate: Semaphore::new(Semaphore::MAX_PERMITS),
            query_gate: Semaphore::new(Semaphore::MAX_PERMITS),
        }
    }

    /// 之后的查询先取好结果，再挂起到 `release_queries`
    pub fn hold_queries(&self) {
        self.query_gate.forget_permits(Semaphore::MAX_PERMITS);
    }

    pub fn release_queries(&self, n: usize) {
        self.query_gate.add_permits(n);
    }

    /// 回写在 `release` 之前一直挂起
    pub fn held(records: Vec<RawMessageRecord>) -> Self {
        let store = Self::new(records);
        store.gate.forget_permits(Semaphore::MAX_PERMITS);
        store
    }

    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    pub fn mark_read_calls(&self) -> Vec<Vec<String>> {
        self.mark_read_calls.lock().unwrap().clone()
    }

    pub fn query_calls(&self) -> usize {
        *self.query_calls.lock().unwrap()
    }

    pub fn is_read(&self, id: &str) -> bool {
        self.records
            .lock()
            .unwrap()
            .iter()
            .any(|r| r.id.as_deref() == Some(id) && r.is_read == Some(true))
    }
}

#[async_trait]
impl MessageStore for RecordingStore {
    async fn query_messages(&self, conversation_id: &str) -> Result<Vec<RawMessageRecord>> {
        *self.query_calls.lock().unwrap() += 1;
        if self.fail_query.load(Ordering::SeqCst) {
            return Err(anyhow!("query unavailable"));
        }
        let mut rows: Vec<RawMessageRecord> = self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.conversation_id.as_deref() == Some(conversation_id))
            .filter(|r| r.deleted_at.is_none())
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.created_at);
        self.query_gate.acquire().await?.forget();
        Ok(rows)
    }

    async fn insert_message(&self, message: &NewMessage) -> Result<RawMessageRecord> {
        let record = message.to_raw();
        self.records.lock().unwrap().push(record.clone());
        Ok(record)
    }

    async fn mark_read(
        &self,
        conversation_id: &str,
        ids: &[String],
        reader_id: &str,
        read_at: DateTime<Utc>,
    ) -> Result<u64> {
        self.mark_read_calls.lock().unwrap().push(ids.to_vec());
        self.gate.acquire().await?.forget();
        if self.fail_mark_read.load(Ordering::SeqCst) {
            return Err(anyhow!("write rejected"));
        }
        let mut updated = 0;
        for r in self.records.lock().unwrap().iter_mut() {
            let matches = r.conversation_id.as_deref() == Some(conversation_id)
                && r.id.as_ref().is_some_and(|id| ids.contains(id))
                && r.sender_id.as_deref() != Some(reader_id)
                && r.is_read != Some(true);
            if matches {
                r.is_read = Some(true);
                r.read_at = Some(read_at);
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn update_body(&self, id: &str, body: &str, edited_at: DateTime<Utc>) -> Result<()> {
        for r in self.records.lock().unwrap().iter_mut() {
            if r.id.as_deref() == Some(id) {
                r.body = Some(body.to_string());
                r.edited_at = Some(edited_at);
            }
        }
        Ok(())
    }

    async fn soft_delete(&self, id: &str, deleted_at: DateTime<Utc>) -> Result<()> {
        for r in self.records.lock().unwrap().iter_mut() {
            if r.id.as_deref() == Some(id) {
                r.deleted_at = Some(deleted_at);
            }
        }
        Ok(())
    }
}

/// 记录所有回调的监听器
#[derive(Default)]
pub struct RecordingListener {
    pub snapshots: Mutex<Vec<Vec<Message>>>,
    pub statuses: Mutex<Vec<ConnectionStatus>>,
    pub failures: Mutex<Vec<Vec<String>>>,
}

impl RecordingListener {
    pub fn statuses(&self) -> Vec<ConnectionStatus> {
        self.statuses.lock().unwrap().clone()
    }

    pub fn failures(&self) -> Vec<Vec<String>> {
        self.failures.lock().unwrap().clone()
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.lock().unwrap().len()
    }
}

#[async_trait]
impl ConversationSyncListener for RecordingListener {
    async fn on_messages_changed(&self, _conversation_id: &str, messages: Vec<Message>) {
        self.snapshots.lock().unwrap().push(messages);
    }

    async fn on_connection_status_changed(&self, _conversation_id: &str, status: ConnectionStatus) {
        self.statuses.lock().unwrap().push(status);
    }

    async fn on_write_back_failed(&self, _conversation_id: &str, ids: Vec<String>, _error: String) {
        self.failures.lock().unwrap().push(ids);
    }
}
