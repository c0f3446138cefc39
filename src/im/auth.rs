use crate::im::types::handle_http_response;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct PasswordSignInRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct AuthUser {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AuthSessionResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    pub user: AuthUser,
}

/// 登录会话：后续 REST / 实时订阅都使用 `access_token`
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub user_id: String,
}

impl From<AuthSessionResponse> for AuthSession {
    fn from(resp: AuthSessionResponse) -> Self {
        Self {
            access_token: resp.access_token,
            refresh_token: resp.refresh_token,
            user_id: resp.user.id,
        }
    }
}

fn token_url(api_base_url: &str) -> String {
    format!(
        "{}/auth/v1/token?grant_type=password",
        api_base_url.trim_end_matches('/')
    )
}

/// 邮箱密码登录
pub async fn sign_in_with_password(
    api_base_url: &str,
    api_key: &str,
    email: &str,
    password: &str,
) -> Result<AuthSession> {
    let client = reqwest::Client::new();
    let operation_id = Uuid::new_v4().to_string();
    let url = token_url(api_base_url);

    info!("🔐 正在登录...");
    debug!("   URL: {}", url);
    debug!("   邮箱: {}", email);
    debug!("   OperationID: {}", operation_id);

    let response = client
        .post(&url)
        .header("apikey", api_key)
        .header("Content-Type", "application/json")
        .header("operationID", &operation_id)
        .json(&PasswordSignInRequest { email, password })
        .send()
        .await
        .context("登录请求失败")?;

    let resp: AuthSessionResponse = handle_http_response(response, "登录").await?;
    debug!(
        "   过期时间: {:?}s, 邮箱: {:?}",
        resp.expires_in, resp.user.email
    );
    let session = AuthSession::from(resp);
    info!("✅ 登录成功！用户ID: {}", session.user_id);
    Ok(session)
}
