//! 消息类型定义
//!
//! 内容类型以及变更订阅推送的行级事件

use crate::im::message::models::RawMessageRecord;
use serde::{Deserialize, Serialize};

/// 消息内容类型
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    #[default]
    Text,
    Image,
    Video,
    Audio,
    File,
    /// 打赏/礼物消息
    Gift,
    /// 无法识别的类型，保留消息本身
    #[serde(other)]
    Unknown,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Text => "text",
            ContentType::Image => "image",
            ContentType::Video => "video",
            ContentType::Audio => "audio",
            ContentType::File => "file",
            ContentType::Gift => "gift",
            ContentType::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "text" => ContentType::Text,
            "image" => ContentType::Image,
            "video" => ContentType::Video,
            "audio" => ContentType::Audio,
            "file" => ContentType::File,
            "gift" => ContentType::Gift,
            _ => ContentType::Unknown,
        }
    }
}

/// 行级变更类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    /// 解析推送中的事件类型（大小写不敏感）
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "INSERT" => Some(ChangeKind::Insert),
            "UPDATE" => Some(ChangeKind::Update),
            "DELETE" => Some(ChangeKind::Delete),
            _ => None,
        }
    }
}

/// 变更订阅推送的单条事件
///
/// 删除事件通常只携带 `id`（或带 `deleted_at` 的整行）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub record: RawMessageRecord,
}

impl ChangeEvent {
    pub fn insert(record: RawMessageRecord) -> Self {
        Self {
            kind: ChangeKind::Insert,
            record,
        }
    }

    pub fn update(record: RawMessageRecord) -> Self {
        Self {
            kind: ChangeKind::Update,
            record,
        }
    }

    pub fn delete(id: impl Into<String>) -> Self {
        Self {
            kind: ChangeKind::Delete,
            record: RawMessageRecord {
                id: Some(id.into()),
                ..Default::default()
            },
        }
    }

    pub fn message_id(&self) -> Option<&str> {
        self.record.id.as_deref()
    }
}
