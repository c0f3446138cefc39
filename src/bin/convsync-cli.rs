//! ConvSync CLI 客户端（测试版）
//!
//! 非交互式 CLI，用于测试和展示会话同步功能
//! 启动时登录并打开一个会话，持续输出监听器收到的所有事件；
//! 订阅断开或长时间无活动时自动重连并重新同步

use anyhow::{Context, Result};
use clap::Parser;
use convsync_sdk_core::im::client::{ClientConfig, SyncClient};
use convsync_sdk_core::im::conversation::{
    ConnectionStatus, ConversationSync, ConversationSyncListener, ReadReceiptPolicy,
};
use convsync_sdk_core::im::message::{Message, MessageStore, NewMessage};
use convsync_sdk_core::im::serialization::generate_msg_id;
use convsync_sdk_core::sign_in_with_password;
use std::sync::Arc;
use tokio::time::{interval, sleep, Duration};
use tracing::{error, info, warn};

/// 演示模式下对方用户的 ID
const DEMO_PEER: &str = "demo-peer";

/// ConvSync CLI 客户端
#[derive(Parser, Debug)]
#[command(name = "convsync-cli")]
#[command(about = "ConvSync CLI 客户端 - 用于测试和展示会话实时同步", long_about = None)]
struct Args {
    /// 要打开的会话 ID
    #[arg(short, long, env = "CONVSYNC_CONVERSATION")]
    conversation: String,

    /// 本地模式：SQLite + 进程内推送，并启动一个演示对端
    #[arg(long)]
    local: bool,

    /// 登录邮箱
    #[arg(long, env = "CONVSYNC_EMAIL")]
    email: Option<String>,

    /// 登录密码
    #[arg(long, env = "CONVSYNC_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// 直接使用已有的访问 token（需同时提供 --user-id）
    #[arg(long, env = "CONVSYNC_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// 与 --token 配合使用的用户 ID
    #[arg(long, env = "CONVSYNC_USER_ID", default_value = "local-user")]
    user_id: String,

    /// 项目 API key
    #[arg(long, env = "CONVSYNC_API_KEY", default_value = "")]
    api_key: String,

    /// REST 基础地址
    #[arg(long, env = "CONVSYNC_API_URL", default_value = "http://localhost:54321")]
    api_url: String,

    /// 实时服务地址
    #[arg(long, env = "CONVSYNC_REALTIME_URL", default_value = "ws://localhost:54321/realtime/v1")]
    realtime_url: String,

    /// 本地模式使用的数据库 URL
    #[arg(long, default_value = "sqlite://convsync.db?mode=rwc")]
    db_url: String,

    /// 已读回写失败时回滚本地已读状态
    #[arg(long)]
    rollback_on_failure: bool,

    /// 最大陈旧时间（秒），超过后重新同步
    #[arg(long, default_value = "120")]
    max_staleness: u64,

    /// 启动后发送一条文本消息
    #[arg(long)]
    send: Option<String>,

    /// 运行时长（秒），0 表示持续运行
    #[arg(short, long, default_value = "0")]
    duration: u64,

    /// 日志级别（默认: info,convsync_sdk_core=debug）
    #[arg(long, default_value = "info,convsync_sdk_core=debug")]
    log_level: String,
}

/// 初始化日志（同时输出到 stdout 和文件）
fn init_logger(log_level: &str) -> Result<()> {
    use std::fs::OpenOptions;
    use std::io;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    // 优先使用环境变量 RUST_LOG（如果设置了），否则使用命令行参数
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    // 创建日志文件（追加模式）
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open("debug.log")
        .context("无法创建日志文件 debug.log")?;

    // 输出到 stdout（控制台），保留 ANSI 颜色代码用于终端显示
    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stdout)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(true);

    // 输出到文件，禁用 ANSI 颜色代码（文件不需要颜色）
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    info!("[CLI] 📝 日志已同时输出到控制台和文件: debug.log");
    Ok(())
}

/// 输出所有接收到的事件
struct CliConversationSyncListener;

#[async_trait::async_trait]
impl ConversationSyncListener for CliConversationSyncListener {
    async fn on_messages_changed(&self, conversation_id: &str, messages: Vec<Message>) {
        info!(
            "[CLI/Conversation] 🔄 消息变更: {} | 共 {} 条",
            conversation_id,
            messages.len()
        );
        for m in messages.iter().rev().take(5).rev() {
            info!(
                "[CLI/Conversation]   {} {} {} | {}{} | 已读: {}",
                m.created_at.format("%H:%M:%S"),
                if m.is_outbound() { "→" } else { "←" },
                m.sender_id,
                if m.body.chars().count() > 30 {
                    m.body.chars().take(30).collect::<String>()
                } else {
                    m.body.clone()
                },
                if m.is_edited() { " (已编辑)" } else { "" },
                m.is_read
            );
        }
    }

    async fn on_connection_status_changed(&self, conversation_id: &str, status: ConnectionStatus) {
        match status {
            ConnectionStatus::Connected => {
                info!("[CLI/Conversation] 🔗 已连接: {}", conversation_id)
            }
            ConnectionStatus::Connecting => {
                info!("[CLI/Conversation] ⏳ 连接中: {}", conversation_id)
            }
            ConnectionStatus::Disconnected => {
                error!("[CLI/Conversation] 🔗 断开连接: {}", conversation_id)
            }
        }
    }

    async fn on_write_back_failed(&self, conversation_id: &str, ids: Vec<String>, error: String) {
        warn!(
            "[CLI/Conversation] ⚠️ 已读回写失败: {} | ids={:?} | {}",
            conversation_id, ids, error
        );
    }
}

/// 演示对端：定期发消息，偶尔编辑、删除自己的消息
fn spawn_demo_peer(store: Arc<dyn MessageStore>, conversation_id: String) {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(3));
        let mut last_id: Option<String> = None;
        for round in 1u64.. {
            ticker.tick().await;
            let target = last_id.clone();
            let result = match (round % 5, target.as_deref()) {
                (0, Some(id)) => store.soft_delete(id, chrono::Utc::now()).await,
                (3, Some(id)) => {
                    store
                        .update_body(id, &format!("第 {} 条（已修改）", round - 1), chrono::Utc::now())
                        .await
                }
                _ => {
                    let message = NewMessage::text(
                        generate_msg_id(),
                        conversation_id.as_str(),
                        DEMO_PEER,
                        format!("第 {} 条", round),
                    );
                    last_id = Some(message.id.clone());
                    store.insert_message(&message).await.map(|_| ())
                }
            };
            if let Err(e) = result {
                warn!("[CLI/Demo] ⚠️ 演示对端写入失败: {:#}", e);
            }
        }
    });
}

/// 断线或陈旧时重连
async fn watch_connection(sync: Arc<ConversationSync>, max_staleness: Duration) {
    let mut ticker = interval(Duration::from_secs(5));
    loop {
        ticker.tick().await;
        let status = sync.connection_status();
        if status == ConnectionStatus::Connecting {
            continue;
        }
        if status == ConnectionStatus::Disconnected || sync.is_stale(max_staleness) {
            info!(
                "[CLI] 🔁 重连: status={:?}, staleness={:?}",
                status,
                sync.staleness()
            );
            match sync.reconnect().await {
                Ok(report) => info!("[CLI] ✅ 重新同步完成: {:?}", report),
                Err(e) => error!("[CLI] ❌ 重连失败: {}", e),
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 初始化日志
    init_logger(&args.log_level)?;

    info!("[CLI] 🚀 ConvSync CLI 客户端（测试模式）");
    info!("[CLI] 💬 会话: {}", args.conversation);
    info!("[CLI] ⏱️  运行时长: {} 秒（0=持续运行）", args.duration);

    let (user_id, token) = if args.local {
        (args.user_id.clone(), String::new())
    } else if let Some(token) = args.token.clone() {
        (args.user_id.clone(), token)
    } else {
        let (Some(email), Some(password)) = (args.email.as_deref(), args.password.as_deref())
        else {
            return Err(anyhow::anyhow!("需要 --email/--password 或 --token"));
        };
        info!("[CLI] 🔐 正在登录...");
        let session = sign_in_with_password(&args.api_url, &args.api_key, email, password)
            .await
            .context("登录失败")?;
        (session.user_id, session.access_token)
    };
    info!("[CLI] 👤 用户ID: {}", user_id);

    let mut config = ClientConfig::new(user_id, token, args.api_key.clone());
    config.api_base_url = args.api_url.clone();
    config.realtime_url = args.realtime_url.clone();
    config.db_url = args.db_url.clone();
    config.max_staleness = Duration::from_secs(args.max_staleness);
    if args.rollback_on_failure {
        config.read_receipt_policy = ReadReceiptPolicy::RollbackOnFailure;
    }

    // 创建客户端
    let mut client = if args.local {
        SyncClient::local(config).await?
    } else {
        SyncClient::connect(config)?
    };
    client.set_conversation_sync_listener(Arc::new(CliConversationSyncListener));

    // 打开会话
    info!("[CLI] 📂 正在打开会话...");
    let sync = client.open_conversation(&args.conversation).await?;
    let snapshot = sync.snapshot();
    info!(
        "[CLI] ✅ 会话已打开: 消息 {} 条，连接状态 {:?}",
        snapshot.messages.len(),
        snapshot.connection_status
    );

    if args.local {
        info!("[CLI] 🤖 启动演示对端: {}", DEMO_PEER);
        spawn_demo_peer(client.store(), args.conversation.clone());
    }
    if let Some(text) = &args.send {
        let sent = client.send_text_message(&args.conversation, text).await?;
        info!("[CLI] 📤 已发送: {:?}", sent.id);
    }

    let watcher = tokio::spawn(watch_connection(
        sync.clone(),
        client.config().max_staleness,
    ));

    info!("[CLI] 📥 开始监听消息...");
    if args.duration > 0 {
        info!("[CLI] ⏰ {} 秒后自动退出", args.duration);
        tokio::select! {
            _ = sleep(Duration::from_secs(args.duration)) => {}
            _ = tokio::signal::ctrl_c() => {}
        }
    } else {
        info!("[CLI] ⏰ 持续运行中，按 Ctrl+C 退出");
        tokio::signal::ctrl_c().await.context("等待 Ctrl+C 失败")?;
    }

    watcher.abort();
    client.close().await;
    info!("[CLI] 👋 程序退出");
    Ok(())
}
