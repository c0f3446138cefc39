//! 消息数据访问层（DAO）
//!
//! `MessageStore` 是同步核心依赖的消息存储接口；这里提供本地 SQLite 实现，
//! 远端 REST 实现见 `api.rs`。

use crate::im::feed::LocalChangeFeed;
use crate::im::message::models::{NewMessage, RawMessageRecord};
use crate::im::message::types::{ChangeEvent, ContentType};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Pool, Row, Sqlite};
use tracing::debug;

/// 消息存储接口
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// 查询会话内所有未删除消息，按 `created_at` 升序
    async fn query_messages(&self, conversation_id: &str) -> Result<Vec<RawMessageRecord>>;

    /// 写入新消息，返回存储后的记录
    async fn insert_message(&self, message: &NewMessage) -> Result<RawMessageRecord>;

    /// 批量标记已读：只更新发送者不是 `reader_id` 且尚未已读的消息，返回实际更新条数
    async fn mark_read(
        &self,
        conversation_id: &str,
        ids: &[String],
        reader_id: &str,
        read_at: DateTime<Utc>,
    ) -> Result<u64>;

    /// 编辑消息正文
    async fn update_body(&self, id: &str, body: &str, edited_at: DateTime<Utc>) -> Result<()>;

    /// 软删除（设置 `deleted_at`）
    async fn soft_delete(&self, id: &str, deleted_at: DateTime<Utc>) -> Result<()>;
}

/// 本地消息存储（使用 sqlx / SQLite）
///
/// 可选地把每次写入回放到 `LocalChangeFeed`，模拟远端的实时推送
pub struct SqliteMessageStore {
    pool: Pool<Sqlite>,
    feed: Option<LocalChangeFeed>,
}

impl SqliteMessageStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool, feed: None }
    }

    /// 写入后向本地订阅推送变更
    pub fn with_change_feed(pool: Pool<Sqlite>, feed: LocalChangeFeed) -> Self {
        Self {
            pool,
            feed: Some(feed),
        }
    }

    fn placeholders(n: usize) -> String {
        if n == 0 {
            String::new()
        } else {
            vec!["?"; n].join(",")
        }
    }

    fn publish(&self, event: ChangeEvent) {
        if let Some(feed) = &self.feed {
            let conversation_id = event.record.conversation_id.clone().unwrap_or_default();
            let delivered = feed.publish(&conversation_id, event);
            debug!(
                "[MsgStore] 推送本地变更: conversationID={}, 订阅数={}",
                conversation_id, delivered
            );
        }
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<RawMessageRecord>> {
        let row = sqlx::query("SELECT * FROM messages WHERE id = ? LIMIT 1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Self::row_to_record))
    }

    fn row_to_record(row: SqliteRow) -> RawMessageRecord {
        let ts = |column: &str| -> Option<DateTime<Utc>> {
            row.try_get::<Option<i64>, _>(column)
                .ok()
                .flatten()
                .and_then(DateTime::from_timestamp_millis)
        };
        RawMessageRecord {
            id: row.try_get::<String, _>("id").ok(),
            conversation_id: row.try_get::<String, _>("conversation_id").ok(),
            sender_id: row.try_get::<String, _>("sender_id").ok(),
            body: row.try_get::<String, _>("body").ok(),
            content_type: row
                .try_get::<String, _>("content_type")
                .ok()
                .map(|s| ContentType::parse(&s)),
            media_url: row.try_get::<Option<String>, _>("media_url").ok().flatten(),
            created_at: ts("created_at"),
            edited_at: ts("edited_at"),
            is_read: Some(row.try_get::<i64, _>("is_read").unwrap_or_default() != 0),
            read_at: ts("read_at"),
            deleted_at: ts("deleted_at"),
        }
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn query_messages(&self, conversation_id: &str) -> Result<Vec<RawMessageRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM messages
            WHERE conversation_id = ? AND deleted_at IS NULL
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("查询会话消息失败: {}", conversation_id))?;
        Ok(rows.into_iter().map(Self::row_to_record).collect())
    }

    async fn insert_message(&self, message: &NewMessage) -> Result<RawMessageRecord> {
        sqlx::query(
            r#"
            INSERT INTO messages (
                id, conversation_id, sender_id, body, content_type, media_url, created_at, is_read
            ) VALUES (?,?,?,?,?,?,?,0)
            "#,
        )
        .bind(&message.id)
        .bind(&message.conversation_id)
        .bind(&message.sender_id)
        .bind(&message.body)
        .bind(message.content_type.as_str())
        .bind(&message.media_url)
        .bind(message.created_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .with_context(|| format!("写入消息失败: {}", message.id))?;

        let record = self
            .get_by_id(&message.id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("写入后未找到消息: {}", message.id))?;
        self.publish(ChangeEvent::insert(record.clone()));
        Ok(record)
    }

    async fn mark_read(
        &self,
        conversation_id: &str,
        ids: &[String],
        reader_id: &str,
        read_at: DateTime<Utc>,
    ) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let placeholders = Self::placeholders(ids.len());
        let filter = format!(
            "conversation_id = ? AND id IN ({}) AND sender_id != ? AND is_read = 0",
            placeholders
        );

        let mut tx = self.pool.begin().await?;

        // 先取出会被更新的消息，用于回放推送
        let select_sql = format!("SELECT id FROM messages WHERE {}", filter);
        let mut select = sqlx::query(&select_sql).bind(conversation_id);
        for id in ids {
            select = select.bind(id);
        }
        let affected_ids: Vec<String> = select
            .bind(reader_id)
            .fetch_all(&mut *tx)
            .await?
            .into_iter()
            .filter_map(|row| row.try_get::<String, _>("id").ok())
            .collect();

        let update_sql = format!(
            "UPDATE messages SET is_read = 1, read_at = ? WHERE {}",
            filter
        );
        let mut update = sqlx::query(&update_sql)
            .bind(read_at.timestamp_millis())
            .bind(conversation_id);
        for id in ids {
            update = update.bind(id);
        }
        let res = update
            .bind(reader_id)
            .execute(&mut *tx)
            .await
            .context("标记已读失败")?;
        tx.commit().await?;

        for id in &affected_ids {
            if let Some(record) = self.get_by_id(id).await? {
                self.publish(ChangeEvent::update(record));
            }
        }
        Ok(res.rows_affected())
    }

    async fn update_body(&self, id: &str, body: &str, edited_at: DateTime<Utc>) -> Result<()> {
        let res = sqlx::query("UPDATE messages SET body = ?, edited_at = ? WHERE id = ?")
            .bind(body)
            .bind(edited_at.timestamp_millis())
            .bind(id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("编辑消息失败: {}", id))?;
        if res.rows_affected() == 0 {
            return Err(anyhow::anyhow!("消息不存在: {}", id));
        }
        if let Some(record) = self.get_by_id(id).await? {
            self.publish(ChangeEvent::update(record));
        }
        Ok(())
    }

    async fn soft_delete(&self, id: &str, deleted_at: DateTime<Utc>) -> Result<()> {
        let res = sqlx::query(
            "UPDATE messages SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(deleted_at.timestamp_millis())
        .bind(id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("删除消息失败: {}", id))?;
        if res.rows_affected() > 0 {
            // 软删除在远端表现为一次带 deleted_at 的 UPDATE
            if let Some(record) = self.get_by_id(id).await? {
                self.publish(ChangeEvent::update(record));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::im::db::create_sqlite_pool_with_migration;
    use crate::im::feed::{ChangeFeed, FeedSignal};
    use crate::im::message::types::ChangeKind;
    use chrono::Duration;
    use tokio::sync::mpsc;

    async fn memory_store(feed: Option<LocalChangeFeed>) -> Result<SqliteMessageStore> {
        let pool = create_sqlite_pool_with_migration("sqlite::memory:").await?;
        Ok(match feed {
            Some(feed) => SqliteMessageStore::with_change_feed(pool, feed),
            None => SqliteMessageStore::new(pool),
        })
    }

    fn new_message(id: &str, sender: &str, offset_ms: i64) -> NewMessage {
        let base = DateTime::from_timestamp_millis(1_714_550_400_000).unwrap();
        let mut msg = NewMessage::text(id, "conv-1", sender, format!("body {}", id));
        msg.created_at = base + Duration::milliseconds(offset_ms);
        msg
    }

    #[tokio::test]
    async fn query_orders_by_created_at_and_skips_deleted() -> Result<()> {
        let store = memory_store(None).await?;
        store.insert_message(&new_message("m2", "alice", 200)).await?;
        store.insert_message(&new_message("m1", "bob", 100)).await?;
        store.insert_message(&new_message("m3", "bob", 300)).await?;
        store.soft_delete("m3", Utc::now()).await?;

        let ids: Vec<_> = store
            .query_messages("conv-1")
            .await?
            .into_iter()
            .filter_map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["m1", "m2"]);
        Ok(())
    }

    #[tokio::test]
    async fn mark_read_skips_own_and_already_read_messages() -> Result<()> {
        let store = memory_store(None).await?;
        store.insert_message(&new_message("in-1", "bob", 100)).await?;
        store.insert_message(&new_message("out-1", "alice", 200)).await?;

        let ids = vec!["in-1".to_string(), "out-1".to_string()];
        let read_at = Utc::now();
        assert_eq!(store.mark_read("conv-1", &ids, "alice", read_at).await?, 1);
        // 重复写入是幂等的
        assert_eq!(store.mark_read("conv-1", &ids, "alice", read_at).await?, 0);

        let records = store.query_messages("conv-1").await?;
        let inbound = records.iter().find(|r| r.id.as_deref() == Some("in-1")).unwrap();
        let outbound = records.iter().find(|r| r.id.as_deref() == Some("out-1")).unwrap();
        assert_eq!(inbound.is_read, Some(true));
        assert_eq!(
            inbound.read_at.map(|t| t.timestamp_millis()),
            Some(read_at.timestamp_millis())
        );
        assert_eq!(outbound.is_read, Some(false));
        Ok(())
    }

    #[tokio::test]
    async fn update_body_sets_edited_at() -> Result<()> {
        let store = memory_store(None).await?;
        store.insert_message(&new_message("m1", "bob", 0)).await?;
        store.update_body("m1", "edited", Utc::now()).await?;

        let record = store.get_by_id("m1").await?.unwrap();
        assert_eq!(record.body.as_deref(), Some("edited"));
        assert!(record.edited_at.is_some());

        assert!(store.update_body("missing", "x", Utc::now()).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn writes_are_echoed_to_local_feed() -> Result<()> {
        let feed = LocalChangeFeed::new();
        let store = memory_store(Some(feed.clone())).await?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        feed.subscribe("conv-1", tx).await?;
        assert_eq!(rx.recv().await, Some(FeedSignal::Connected));

        store.insert_message(&new_message("m1", "bob", 0)).await?;
        store.soft_delete("m1", Utc::now()).await?;

        match rx.recv().await {
            Some(FeedSignal::Event(ev)) => {
                assert_eq!(ev.kind, ChangeKind::Insert);
                assert_eq!(ev.message_id(), Some("m1"));
            }
            other => panic!("unexpected signal: {:?}", other),
        }
        match rx.recv().await {
            Some(FeedSignal::Event(ev)) => {
                assert_eq!(ev.kind, ChangeKind::Update);
                assert!(ev.record.deleted_at.is_some());
            }
            other => panic!("unexpected signal: {:?}", other),
        }
        Ok(())
    }
}
