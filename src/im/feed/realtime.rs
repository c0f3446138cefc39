//! 实时变更订阅（WebSocket）
//!
//! 使用 Phoenix channel 的 JSON 帧格式订阅 `messages` 表的 `postgres_changes`。
//! 每次 subscribe 建立一条独立的 WebSocket 连接，互不复用。

use crate::im::feed::{ChangeFeed, FeedSignal, FeedSink, SubscriptionHandle};
use crate::im::message::{ChangeEvent, ChangeKind, RawMessageRecord};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, error, info, warn};

/// WebSocket 写入端类型别名
pub type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

/// WebSocket 读取端类型别名
pub type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// 加入频道请求使用的 ref
const JOIN_REF: &str = "1";

/// Phoenix 事件名
pub mod phx_event {
    pub const JOIN: &str = "phx_join";
    pub const LEAVE: &str = "phx_leave";
    pub const REPLY: &str = "phx_reply";
    pub const CLOSE: &str = "phx_close";
    pub const ERROR: &str = "phx_error";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const POSTGRES_CHANGES: &str = "postgres_changes";
}

/// 实时订阅配置
#[derive(Clone, Debug)]
pub struct RealtimeConfig {
    /// 实时服务地址，例如 `ws://localhost:54321/realtime/v1`
    pub realtime_url: String,
    /// 项目 API key
    pub api_key: String,
    /// 用户访问 token（行级权限校验）
    pub access_token: String,
    /// 等待加入频道确认的超时时间
    pub join_timeout: Duration,
    /// 心跳间隔
    pub heartbeat_interval: Duration,
}

/// Phoenix channel 帧
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhoenixFrame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
}

/// 解析后的入站帧
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// 请求应答（加入频道、心跳等）
    Reply {
        reference: Option<String>,
        ok: bool,
        detail: String,
    },
    /// 行级变更
    Change(ChangeEvent),
    /// 频道被服务端关闭或出错
    ChannelClosed { reason: String },
    /// 与订阅无关的帧（presence、系统消息等）
    Ignored,
}

/// 频道主题：每个会话一个
pub fn channel_topic(conversation_id: &str) -> String {
    format!("realtime:messages:{}", conversation_id)
}

/// 构建 WebSocket 连接 URL
pub fn build_socket_url(realtime_url: &str, api_key: &str) -> String {
    format!(
        "{}/websocket?apikey={}&vsn=1.0.0",
        realtime_url.trim_end_matches('/'),
        api_key
    )
}

/// 构建加入频道帧：只订阅当前会话的 messages 变更
pub fn build_join_frame(conversation_id: &str, access_token: &str) -> PhoenixFrame {
    PhoenixFrame {
        topic: channel_topic(conversation_id),
        event: phx_event::JOIN.to_string(),
        payload: serde_json::json!({
            "config": {
                "broadcast": { "self": false },
                "presence": { "key": "" },
                "postgres_changes": [{
                    "event": "*",
                    "schema": "public",
                    "table": "messages",
                    "filter": format!("conversation_id=eq.{}", conversation_id),
                }],
            },
            "access_token": access_token,
        }),
        reference: Some(JOIN_REF.to_string()),
        join_ref: Some(JOIN_REF.to_string()),
    }
}

fn build_heartbeat_frame(reference: u64) -> PhoenixFrame {
    PhoenixFrame {
        topic: "phoenix".to_string(),
        event: phx_event::HEARTBEAT.to_string(),
        payload: serde_json::json!({}),
        reference: Some(reference.to_string()),
        join_ref: None,
    }
}

fn build_leave_frame(topic: &str) -> PhoenixFrame {
    PhoenixFrame {
        topic: topic.to_string(),
        event: phx_event::LEAVE.to_string(),
        payload: serde_json::json!({}),
        reference: Some("leave".to_string()),
        join_ref: Some(JOIN_REF.to_string()),
    }
}

/// 解析 postgres_changes 负载
///
/// 负载形如 `{"data": {"type": "INSERT", "record": {...}, "old_record": {...}}}`，
/// 旧版本服务端使用 `eventType` / `new` / `old` 字段名，这里一并兼容
fn parse_change_payload(payload: &serde_json::Value) -> Option<ChangeEvent> {
    let data = payload.get("data").unwrap_or(payload);
    let kind = data
        .get("type")
        .or_else(|| data.get("eventType"))
        .and_then(|v| v.as_str())
        .and_then(ChangeKind::parse)?;

    let row = match kind {
        ChangeKind::Delete => data.get("old_record").or_else(|| data.get("old")),
        _ => data.get("record").or_else(|| data.get("new")),
    }?;

    match serde_json::from_value::<RawMessageRecord>(row.clone()) {
        Ok(record) => Some(ChangeEvent { kind, record }),
        Err(e) => {
            warn!("[Realtime] ⚠️ 变更行解析失败，丢弃: {}, 原始数据: {}", e, row);
            None
        }
    }
}

/// 解析入站文本帧
pub fn parse_frame(text: &str) -> Result<InboundFrame> {
    let frame: PhoenixFrame = serde_json::from_str(text).context("解析 Phoenix 帧失败")?;
    Ok(match frame.event.as_str() {
        phx_event::REPLY => {
            let status = frame
                .payload
                .get("status")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            InboundFrame::Reply {
                reference: frame.reference,
                ok: status == "ok",
                detail: frame
                    .payload
                    .get("response")
                    .map(|v| v.to_string())
                    .unwrap_or_default(),
            }
        }
        phx_event::POSTGRES_CHANGES => match parse_change_payload(&frame.payload) {
            Some(event) => InboundFrame::Change(event),
            None => InboundFrame::Ignored,
        },
        phx_event::CLOSE | phx_event::ERROR => InboundFrame::ChannelClosed {
            reason: format!("{}: {}", frame.event, frame.payload),
        },
        _ => InboundFrame::Ignored,
    })
}

fn encode_frame(frame: &PhoenixFrame) -> Result<WsMessage> {
    Ok(WsMessage::Text(
        serde_json::to_string(frame).context("序列化 Phoenix 帧失败")?,
    ))
}

/// 单个订阅持有的连接与后台任务
struct ActiveSocket {
    topic: String,
    writer: Arc<Mutex<WsWriter>>,
    reader_task: JoinHandle<()>,
    heartbeat_task: JoinHandle<()>,
}

/// 实时变更订阅
#[derive(Clone)]
pub struct RealtimeChangeFeed {
    config: RealtimeConfig,
    sockets: Arc<std::sync::Mutex<HashMap<uuid::Uuid, ActiveSocket>>>,
}

impl RealtimeChangeFeed {
    pub fn new(config: RealtimeConfig) -> Self {
        Self {
            config,
            sockets: Arc::new(std::sync::Mutex::new(HashMap::new())),
        }
    }

    /// 等待加入频道的应答，期间收到的变更先缓存，确认后再投递
    async fn await_join_reply(read: &mut WsReader, pending: &mut Vec<ChangeEvent>) -> Result<()> {
        while let Some(msg_result) = read.next().await {
            match msg_result.context("WebSocket 读取失败")? {
                WsMessage::Text(text) => match parse_frame(&text) {
                    Ok(InboundFrame::Reply {
                        reference,
                        ok,
                        detail,
                    }) if reference.as_deref() == Some(JOIN_REF) => {
                        if ok {
                            return Ok(());
                        }
                        return Err(anyhow::anyhow!("加入频道被拒绝: {}", detail));
                    }
                    Ok(InboundFrame::Change(event)) => pending.push(event),
                    Ok(InboundFrame::ChannelClosed { reason }) => {
                        return Err(anyhow::anyhow!("频道在加入前关闭: {}", reason));
                    }
                    Ok(_) => {}
                    Err(e) => warn!("[Realtime] ⚠️ {}", e),
                },
                WsMessage::Close(frame) => {
                    return Err(anyhow::anyhow!("连接在加入前关闭: {:?}", frame));
                }
                _ => {}
            }
        }
        Err(anyhow::anyhow!("连接在加入前结束"))
    }

    /// 处理接收消息（事件循环），结束时通知 Disconnected
    async fn handle_messages(mut read: WsReader, sink: FeedSink, topic: String) {
        while let Some(msg_result) = read.next().await {
            match msg_result {
                Ok(WsMessage::Text(text)) => match parse_frame(&text) {
                    Ok(InboundFrame::Change(event)) => {
                        debug!(
                            "[Realtime] 📥 变更: topic={}, type={:?}, id={:?}",
                            topic,
                            event.kind,
                            event.message_id()
                        );
                        if sink.send(FeedSignal::Event(event)).is_err() {
                            debug!("[Realtime] 订阅方已关闭，停止读取: {}", topic);
                            return;
                        }
                    }
                    Ok(InboundFrame::ChannelClosed { reason }) => {
                        warn!("[Realtime] 👋 频道关闭: topic={}, {}", topic, reason);
                        break;
                    }
                    Ok(InboundFrame::Reply { ok: false, detail, .. }) => {
                        warn!("[Realtime] ⚠️ 请求失败: topic={}, {}", topic, detail);
                    }
                    Ok(_) => {}
                    Err(e) => warn!("[Realtime] ⚠️ 丢弃无法解析的帧: {}", e),
                },
                Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => {}
                Ok(WsMessage::Close(frame)) => {
                    warn!("[Realtime] 👋 连接关闭: {:?}", frame);
                    break;
                }
                Err(e) => {
                    error!("[Realtime] WebSocket 错误: {}", e);
                    break;
                }
                _ => {}
            }
        }
        let _ = sink.send(FeedSignal::Disconnected);
    }
}

#[async_trait]
impl ChangeFeed for RealtimeChangeFeed {
    async fn subscribe(&self, conversation_id: &str, sink: FeedSink) -> Result<SubscriptionHandle> {
        let handle = SubscriptionHandle::new(conversation_id);
        let topic = channel_topic(conversation_id);
        let url = build_socket_url(&self.config.realtime_url, &self.config.api_key);

        info!(
            "[Realtime] 🔗 连接实时服务: conversationID={}, handle={}",
            conversation_id, handle.id
        );
        let (ws_stream, response) = connect_async(&url)
            .await
            .context("连接实时服务失败")?;
        debug!("[Realtime] WebSocket 连接成功, 状态: {}", response.status());

        let (mut write, mut read) = ws_stream.split();
        write
            .send(encode_frame(&build_join_frame(
                conversation_id,
                &self.config.access_token,
            ))?)
            .await
            .context("发送加入频道请求失败")?;

        let mut pending = Vec::new();
        tokio::time::timeout(
            self.config.join_timeout,
            Self::await_join_reply(&mut read, &mut pending),
        )
        .await
        .map_err(|_| anyhow::anyhow!("等待加入频道确认超时: {}", topic))??;
        info!("[Realtime] ✅ 已加入频道: {}", topic);

        sink.send(FeedSignal::Connected)
            .map_err(|_| anyhow::anyhow!("订阅通道已关闭"))?;
        for event in pending {
            let _ = sink.send(FeedSignal::Event(event));
        }

        let writer = Arc::new(Mutex::new(write));

        // 启动心跳
        let writer_for_heartbeat = writer.clone();
        let heartbeat_interval = self.config.heartbeat_interval;
        let heartbeat_task = tokio::spawn(async move {
            let mut reference: u64 = 1;
            let mut ticker = interval(heartbeat_interval);
            // 第一次 tick 立即返回，跳过
            ticker.tick().await;
            loop {
                ticker.tick().await;
                reference += 1;
                let frame = match encode_frame(&build_heartbeat_frame(reference)) {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!("[Realtime] 心跳帧编码失败: {}", e);
                        break;
                    }
                };
                let mut w = writer_for_heartbeat.lock().await;
                if w.send(frame).await.is_err() {
                    debug!("[Realtime] 心跳发送失败，停止心跳");
                    break;
                }
            }
        });

        // 在内部启动消息处理任务
        let reader_task = tokio::spawn(Self::handle_messages(read, sink, topic.clone()));

        self.sockets
            .lock()
            .map_err(|_| anyhow::anyhow!("订阅表锁已损坏"))?
            .insert(
                handle.id,
                ActiveSocket {
                    topic,
                    writer,
                    reader_task,
                    heartbeat_task,
                },
            );
        Ok(handle)
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()> {
        let socket = self
            .sockets
            .lock()
            .map_err(|_| anyhow::anyhow!("订阅表锁已损坏"))?
            .remove(&handle.id);
        let Some(socket) = socket else {
            debug!("[Realtime] 订阅不存在或已取消: {}", handle.id);
            return Ok(());
        };

        socket.reader_task.abort();
        socket.heartbeat_task.abort();

        let mut w = socket.writer.lock().await;
        let leave = encode_frame(&build_leave_frame(&socket.topic))?;
        if let Err(e) = w.send(leave).await {
            debug!("[Realtime] 发送 phx_leave 失败（连接可能已断开）: {}", e);
        }
        if let Err(e) = w.close().await {
            debug!("[Realtime] 关闭连接失败: {}", e);
        }
        info!("[Realtime] 👋 已离开频道: {}", socket.topic);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_frame_filters_by_conversation() {
        let frame = build_join_frame("conv-9", "token-1");
        assert_eq!(frame.topic, "realtime:messages:conv-9");
        assert_eq!(frame.event, "phx_join");
        assert_eq!(frame.reference.as_deref(), Some("1"));
        let change = &frame.payload["config"]["postgres_changes"][0];
        assert_eq!(change["table"], "messages");
        assert_eq!(change["filter"], "conversation_id=eq.conv-9");
        assert_eq!(frame.payload["access_token"], "token-1");

        let encoded = serde_json::to_value(&frame).unwrap();
        assert_eq!(encoded["ref"], "1");
    }

    #[test]
    fn socket_url_appends_api_key() {
        assert_eq!(
            build_socket_url("ws://localhost:54321/realtime/v1/", "anon"),
            "ws://localhost:54321/realtime/v1/websocket?apikey=anon&vsn=1.0.0"
        );
    }

    #[test]
    fn parses_join_reply() {
        let frame = parse_frame(
            r#"{"topic":"realtime:messages:c1","event":"phx_reply",
                "payload":{"status":"ok","response":{}},"ref":"1"}"#,
        )
        .unwrap();
        assert!(matches!(
            frame,
            InboundFrame::Reply { ok: true, ref reference, .. } if reference.as_deref() == Some("1")
        ));
    }

    #[test]
    fn parses_insert_change() {
        let frame = parse_frame(
            r#"{"topic":"realtime:messages:c1","event":"postgres_changes","ref":null,
                "payload":{"data":{"type":"INSERT","table":"messages",
                  "record":{"id":"m1","conversation_id":"c1","sender_id":"bob",
                            "body":"hi","created_at":"2024-05-01T08:00:00+00:00","is_read":false},
                  "old_record":null}}}"#,
        )
        .unwrap();
        match frame {
            InboundFrame::Change(event) => {
                assert_eq!(event.kind, ChangeKind::Insert);
                assert_eq!(event.message_id(), Some("m1"));
                assert_eq!(event.record.body.as_deref(), Some("hi"));
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn delete_change_uses_old_record() {
        let frame = parse_frame(
            r#"{"topic":"t","event":"postgres_changes",
                "payload":{"data":{"type":"DELETE","record":null,"old_record":{"id":"m7"}}}}"#,
        )
        .unwrap();
        assert_eq!(frame, InboundFrame::Change(ChangeEvent::delete("m7")));
    }

    #[test]
    fn legacy_payload_field_names_are_accepted() {
        let frame = parse_frame(
            r#"{"topic":"t","event":"postgres_changes",
                "payload":{"data":{"eventType":"UPDATE","new":{"id":"m2","is_read":true}}}}"#,
        )
        .unwrap();
        match frame {
            InboundFrame::Change(event) => {
                assert_eq!(event.kind, ChangeKind::Update);
                assert_eq!(event.record.is_read, Some(true));
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn unknown_change_type_and_presence_are_ignored() {
        let frame = parse_frame(
            r#"{"topic":"t","event":"postgres_changes","payload":{"data":{"type":"TRUNCATE"}}}"#,
        )
        .unwrap();
        assert_eq!(frame, InboundFrame::Ignored);

        let frame =
            parse_frame(r#"{"topic":"t","event":"presence_state","payload":{}}"#).unwrap();
        assert_eq!(frame, InboundFrame::Ignored);
    }

    #[test]
    fn channel_error_is_reported_as_closed() {
        let frame = parse_frame(r#"{"topic":"t","event":"phx_error","payload":{}}"#).unwrap();
        assert!(matches!(frame, InboundFrame::ChannelClosed { .. }));
    }

    #[test]
    fn malformed_text_is_an_error() {
        assert!(parse_frame("not json").is_err());
    }
}
