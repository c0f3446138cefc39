//! 消息本地模型定义

use crate::im::error::RecordError;
use crate::im::message::types::ContentType;
use crate::im::serialization::{deserialize_opt_id, deserialize_opt_timestamp};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 消息方向（相对本地登录用户），创建时确定，之后不再重新计算
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// 对方发来的消息
    Inbound,
    /// 本地用户发出的消息
    Outbound,
}

impl Direction {
    pub fn classify(sender_id: &str, local_user_id: &str) -> Self {
        if sender_id == local_user_id {
            Direction::Outbound
        } else {
            Direction::Inbound
        }
    }
}

/// 原始消息记录（REST 查询结果或变更推送中的行数据）
///
/// 所有字段都可能缺失：变更推送可能只携带部分列，缺失字段在合并时按"未提供"处理
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawMessageRecord {
    #[serde(default, deserialize_with = "deserialize_opt_id")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, alias = "conversationId", skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, alias = "senderId", skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, alias = "contentType", skip_serializing_if = "Option::is_none")]
    pub content_type: Option<ContentType>,
    #[serde(default, alias = "mediaUrl", skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(
        default,
        alias = "createdAt",
        deserialize_with = "deserialize_opt_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        alias = "editedAt",
        deserialize_with = "deserialize_opt_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "isRead", skip_serializing_if = "Option::is_none")]
    pub is_read: Option<bool>,
    #[serde(
        default,
        alias = "readAt",
        deserialize_with = "deserialize_opt_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        alias = "deletedAt",
        deserialize_with = "deserialize_opt_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub deleted_at: Option<DateTime<Utc>>,
}

/// 本地消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub body: String,
    pub content_type: ContentType,
    pub media_url: Option<String>,
    /// 排序键
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub is_read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub direction: Direction,
}

impl Message {
    /// 从原始记录构建本地消息，并按本地用户确定方向
    ///
    /// `id`、`sender_id`、`created_at` 为必填；会话 ID 缺失时使用 `fallback_conversation_id`
    pub fn from_raw(
        raw: &RawMessageRecord,
        fallback_conversation_id: &str,
        local_user_id: &str,
    ) -> Result<Self, RecordError> {
        let id = raw.id.clone().ok_or(RecordError::MissingField("id"))?;
        let sender_id = raw
            .sender_id
            .clone()
            .ok_or(RecordError::MissingField("sender_id"))?;
        let created_at = raw.created_at.ok_or(RecordError::MissingField("created_at"))?;
        let direction = Direction::classify(&sender_id, local_user_id);

        Ok(Self {
            id,
            conversation_id: raw
                .conversation_id
                .clone()
                .unwrap_or_else(|| fallback_conversation_id.to_string()),
            sender_id,
            body: raw.body.clone().unwrap_or_default(),
            content_type: raw.content_type.unwrap_or_default(),
            media_url: raw.media_url.clone(),
            created_at,
            edited_at: raw.edited_at,
            is_read: raw.is_read.unwrap_or(false),
            read_at: raw.read_at,
            deleted_at: raw.deleted_at,
            direction,
        })
    }

    pub fn is_inbound(&self) -> bool {
        self.direction == Direction::Inbound
    }

    pub fn is_outbound(&self) -> bool {
        self.direction == Direction::Outbound
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn is_edited(&self) -> bool {
        self.edited_at.is_some()
    }

    /// 转回原始记录（用于本地存储回放推送）
    pub fn to_raw(&self) -> RawMessageRecord {
        RawMessageRecord {
            id: Some(self.id.clone()),
            conversation_id: Some(self.conversation_id.clone()),
            sender_id: Some(self.sender_id.clone()),
            body: Some(self.body.clone()),
            content_type: Some(self.content_type),
            media_url: self.media_url.clone(),
            created_at: Some(self.created_at),
            edited_at: self.edited_at,
            is_read: Some(self.is_read),
            read_at: self.read_at,
            deleted_at: self.deleted_at,
        }
    }
}

/// 待发送消息（发送流程写入消息存储时使用）
#[derive(Debug, Clone, Serialize)]
pub struct NewMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub body: String,
    pub content_type: ContentType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl NewMessage {
    pub fn text(
        id: impl Into<String>,
        conversation_id: impl Into<String>,
        sender_id: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            conversation_id: conversation_id.into(),
            sender_id: sender_id.into(),
            body: body.into(),
            content_type: ContentType::Text,
            media_url: None,
            created_at: Utc::now(),
        }
    }

    pub fn to_raw(&self) -> RawMessageRecord {
        RawMessageRecord {
            id: Some(self.id.clone()),
            conversation_id: Some(self.conversation_id.clone()),
            sender_id: Some(self.sender_id.clone()),
            body: Some(self.body.clone()),
            content_type: Some(self.content_type),
            media_url: self.media_url.clone(),
            created_at: Some(self.created_at),
            edited_at: None,
            is_read: Some(false),
            read_at: None,
            deleted_at: None,
        }
    }
}
