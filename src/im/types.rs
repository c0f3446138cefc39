use serde::Deserialize;

/// REST 数据接口的错误响应体
///
/// 网关返回非 2xx 时携带 `message` / `code` / `details` / `hint`，字段均可能缺失。
/// 认证接口使用 `msg` 或 `error_description` 作为说明
#[derive(Debug, Default, Deserialize)]
pub struct RestErrorBody {
    #[serde(default, alias = "msg", alias = "error_description")]
    pub message: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default)]
    pub hint: Option<String>,
}

impl RestErrorBody {
    fn describe(&self) -> String {
        let mut parts = Vec::new();
        if let Some(code) = &self.code {
            parts.push(format!("code={}", code));
        }
        if let Some(message) = &self.message {
            parts.push(message.clone());
        }
        if let Some(details) = &self.details {
            parts.push(format!("details={}", details));
        }
        if let Some(hint) = &self.hint {
            parts.push(format!("hint={}", hint));
        }
        parts.join(", ")
    }
}

/// 通用 HTTP 响应处理函数：检查状态码后直接反序列化为目标结构体
/// 所有 REST 调用都可以共用此方法
pub async fn handle_http_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    operation_name: &str,
) -> anyhow::Result<T> {
    use anyhow::Context;
    use tracing::{debug, error};

    let status = response.status();

    // 读取 body bytes（只能读取一次）
    let body_bytes = response.bytes().await.context("读取响应 body 失败")?;
    let body_str = String::from_utf8_lossy(&body_bytes);
    debug!("[HTTP] {}响应 Body: {}", operation_name, body_str);

    if !status.is_success() {
        let detail = serde_json::from_slice::<RestErrorBody>(&body_bytes)
            .map(|b| b.describe())
            .ok()
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| body_str.to_string());
        error!(
            "[HTTP] {}请求失败，HTTP状态: {}, 响应: {}",
            operation_name, status, detail
        );
        return Err(anyhow::anyhow!("HTTP 错误 {}: {}", status, detail));
    }
    debug!("[HTTP] {}请求成功，HTTP状态: {}", operation_name, status);

    serde_json::from_slice::<T>(&body_bytes).map_err(|e| {
        error!(
            "[HTTP] {}反序列化失败: {:?}\n原始响应: {}",
            operation_name, e, body_str
        );
        anyhow::anyhow!("反序列化响应失败: {:?}", e)
    })
}
