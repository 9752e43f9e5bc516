//! The concrete `ChatClient`: a `reqwest::Client` pointed at the upstream
//! chat-completion endpoint, mapping transport and response errors into
//! the shared error-info shape the classifier consumes.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use sidecar_core::error::UpstreamErrorInfo;
use sidecar_core::upstream::ChatClient;

pub struct ReqwestChatClient {
    client: reqwest::Client,
    base_url: String,
    default_timeout: Duration,
}

impl ReqwestChatClient {
    pub fn new(base_url: String, default_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .user_agent("sidecar-async-control-plane")
            .build()
            .expect("failed to construct reqwest client for upstream chat client");

        Self {
            client,
            base_url,
            default_timeout,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

fn error_from_transport(err: &reqwest::Error) -> UpstreamErrorInfo {
    UpstreamErrorInfo {
        status: err.status().map(|s| s.as_u16()),
        code: None,
        message: err.to_string(),
        is_timeout: err.is_timeout(),
    }
}

async fn error_from_response(response: reqwest::Response) -> UpstreamErrorInfo {
    let status = response.status();
    let body = response.json::<Value>().await.ok();
    let message = body
        .as_ref()
        .and_then(|b| b.get("error"))
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .map(str::to_owned)
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("upstream error").to_owned());
    let code = body
        .as_ref()
        .and_then(|b| b.get("error"))
        .and_then(|e| e.get("code"))
        .and_then(Value::as_str)
        .map(str::to_owned);

    UpstreamErrorInfo {
        status: Some(status.as_u16()),
        code,
        message,
        is_timeout: status == StatusCode::REQUEST_TIMEOUT,
    }
}

#[async_trait]
impl ChatClient for ReqwestChatClient {
    async fn chat_completions(
        &self,
        payload: &Value,
        timeout: Option<Duration>,
    ) -> Result<Value, UpstreamErrorInfo> {
        let response = self
            .client
            .post(self.endpoint("/v1/chat/completions"))
            .timeout(timeout.unwrap_or(self.default_timeout))
            .json(payload)
            .send()
            .await
            .map_err(|e| error_from_transport(&e))?;

        let status = response.status();
        if status.is_success() {
            response.json::<Value>().await.map_err(|e| UpstreamErrorInfo {
                status: Some(status.as_u16()),
                code: None,
                message: format!("failed to decode upstream response body: {e}"),
                is_timeout: false,
            })
        } else {
            Err(error_from_response(response).await)
        }
    }

    async fn health(&self) -> Result<(), UpstreamErrorInfo> {
        let response = self
            .client
            .get(self.endpoint("/health"))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| error_from_transport(&e))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(error_from_response(response).await)
        }
    }
}
