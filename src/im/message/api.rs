//! 消息 REST API 客户端
//!
//! 通过后端的 REST 数据接口读写 `messages` 表

use crate::im::message::dao::MessageStore;
use crate::im::message::models::{NewMessage, RawMessageRecord};
use crate::im::types::handle_http_response;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

/// 消息相关的 REST 客户端
pub struct RestMessageStore {
    client: reqwest::Client,
    api_base_url: String,
}

impl RestMessageStore {
    /// 创建新的消息 REST 客户端
    ///
    /// `client` 应该已经在外部配置好 `apikey` 与 `Authorization` 默认请求头
    pub fn new(client: reqwest::Client, api_base_url: String) -> Self {
        Self {
            client,
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
        }
    }

    fn table_url(&self) -> String {
        format!("{}/rest/v1/messages", self.api_base_url)
    }

    /// 全量查询参数：未删除、按创建时间升序
    fn query_params(conversation_id: &str) -> Vec<(&'static str, String)> {
        vec![
            ("select", "*".to_string()),
            ("conversation_id", format!("eq.{}", conversation_id)),
            ("deleted_at", "is.null".to_string()),
            ("order", "created_at.asc".to_string()),
        ]
    }

    /// `in.(...)` 列表：每个值加双引号，值中的 `,` `.` `:` 括号不再被当作分隔符
    fn quoted_list(ids: &[String]) -> String {
        ids.iter()
            .map(|id| format!("\"{}\"", id.replace('\\', "\\\\").replace('"', "\\\"")))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// 已读回写参数：限定会话、排除自己发送的消息、只改未读
    fn mark_read_params(
        conversation_id: &str,
        ids: &[String],
        reader_id: &str,
    ) -> Vec<(&'static str, String)> {
        vec![
            ("conversation_id", format!("eq.{}", conversation_id)),
            ("id", format!("in.({})", Self::quoted_list(ids))),
            ("sender_id", format!("neq.{}", reader_id)),
            ("is_read", "eq.false".to_string()),
        ]
    }

    /// 发送 PATCH，返回被更新的行
    async fn patch(
        &self,
        params: &[(&'static str, String)],
        body: serde_json::Value,
        operation_name: &str,
    ) -> Result<Vec<RawMessageRecord>> {
        let response = self
            .client
            .patch(self.table_url())
            .query(params)
            .header("Prefer", "return=representation")
            .json(&body)
            .send()
            .await
            .context("请求失败")?;
        handle_http_response(response, operation_name).await
    }
}

#[async_trait]
impl MessageStore for RestMessageStore {
    async fn query_messages(&self, conversation_id: &str) -> Result<Vec<RawMessageRecord>> {
        info!("[MsgAPI] 📡 拉取会话消息: conversationID={}", conversation_id);
        let response = self
            .client
            .get(self.table_url())
            .query(&Self::query_params(conversation_id))
            .send()
            .await
            .context("请求失败")?;
        let records: Vec<RawMessageRecord> = handle_http_response(response, "拉取消息").await?;
        info!(
            "[MsgAPI] 📥 拉取完成: conversationID={}, 条数={}",
            conversation_id,
            records.len()
        );
        Ok(records)
    }

    async fn insert_message(&self, message: &NewMessage) -> Result<RawMessageRecord> {
        debug!(
            "[MsgAPI] 发送消息: conversationID={}, id={}",
            message.conversation_id, message.id
        );
        let response = self
            .client
            .post(self.table_url())
            .header("Prefer", "return=representation")
            .json(message)
            .send()
            .await
            .context("请求失败")?;
        let mut rows: Vec<RawMessageRecord> = handle_http_response(response, "发送消息").await?;
        rows.pop()
            .ok_or_else(|| anyhow::anyhow!("写入响应为空: {}", message.id))
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
        let rows = self
            .patch(
                &Self::mark_read_params(conversation_id, ids, reader_id),
                serde_json::json!({ "is_read": true, "read_at": read_at }),
                "标记已读",
            )
            .await?;
        debug!(
            "[MsgAPI] 标记已读完成: conversationID={}, 请求={}, 实际更新={}",
            conversation_id,
            ids.len(),
            rows.len()
        );
        Ok(rows.len() as u64)
    }

    async fn update_body(&self, id: &str, body: &str, edited_at: DateTime<Utc>) -> Result<()> {
        let rows = self
            .patch(
                &[("id", format!("eq.{}", id))],
                serde_json::json!({ "body": body, "edited_at": edited_at }),
                "编辑消息",
            )
            .await?;
        if rows.is_empty() {
            return Err(anyhow::anyhow!("消息不存在或无权限编辑: {}", id));
        }
        Ok(())
    }

    async fn soft_delete(&self, id: &str, deleted_at: DateTime<Utc>) -> Result<()> {
        self.patch(
            &[("id", format!("eq.{}", id))],
            serde_json::json!({ "deleted_at": deleted_at }),
            "删除消息",
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_params_filter_deleted_and_order_ascending() {
        let params = RestMessageStore::query_params("conv-1");
        assert!(params.contains(&("conversation_id", "eq.conv-1".to_string())));
        assert!(params.contains(&("deleted_at", "is.null".to_string())));
        assert!(params.contains(&("order", "created_at.asc".to_string())));
    }

    #[test]
    fn mark_read_params_exclude_reader_and_read_rows() {
        let ids = vec!["a".to_string(), "b".to_string()];
        let params = RestMessageStore::mark_read_params("conv-1", &ids, "alice");
        assert!(params.contains(&("id", r#"in.("a","b")"#.to_string())));
        assert!(params.contains(&("sender_id", "neq.alice".to_string())));
        assert!(params.contains(&("is_read", "eq.false".to_string())));
    }

    #[test]
    fn mark_read_ids_are_quoted() {
        let ids = vec!["m.1".to_string(), "a,b".to_string(), r#"say "hi""#.to_string()];
        let params = RestMessageStore::mark_read_params("conv-1", &ids, "alice");
        assert!(params.contains(&("id", r#"in.("m.1","a,b","say \"hi\"")"#.to_string())));
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let store = RestMessageStore::new(reqwest::Client::new(), "http://host/".to_string());
        assert_eq!(store.table_url(), "http://host/rest/v1/messages");
    }
}
