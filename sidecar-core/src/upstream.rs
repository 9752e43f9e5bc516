//! The upstream chat client interface the core consumes. Out of
//! scope for this crate's implementation, but the trait and its error shape
//! are specified here since the queue manager and classifier depend on them.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::UpstreamErrorInfo;

/// Thin interface a concrete HTTP-backed client implements to forward an
/// opaque payload bag to the upstream chat-completion endpoint.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn chat_completions(
        &self,
        payload: &Value,
        timeout: Option<Duration>,
    ) -> Result<Value, UpstreamErrorInfo>;

    async fn health(&self) -> Result<(), UpstreamErrorInfo>;
}
