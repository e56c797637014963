use crate::constants::{ACCEPT_EVENT_STREAM, ACCEPT_JSON};
use crate::history::History;
use crate::types::{
    ChatError, Message, MessageContent, ObservedError, RequestId, Result, Role, UsageInfo,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::{FutureExt, StreamExt};
use reqwest::header::ACCEPT;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Outbound chat request body.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChatRequestBody {
    #[serde(rename = "requestId")]
    pub request_id: RequestId,
    pub model: String,
    pub messages: Vec<OutboundMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
}

/// A history entry as sent upstream: metrics stripped.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub role: Role,
    pub content: MessageContent,
    pub timestamp: DateTime<Utc>,
    pub unique_id: String,
}

impl From<&Message> for OutboundMessage {
    fn from(m: &Message) -> Self {
        Self {
            role: m.role,
            content: m.content.clone(),
            timestamp: m.timestamp,
            unique_id: m.unique_id.clone(),
        }
    }
}

impl ChatRequestBody {
    /// Error entries and empty assistant placeholders are not part of the conversation.
    pub fn from_history(
        request_id: RequestId,
        settings: &crate::controller::ChatSettings,
        model: String,
        history: &History,
    ) -> Self {
        let messages = history
            .iter()
            .filter(|m| m.role != Role::Error)
            .filter(|m| !(m.role == Role::Assistant && m.content.is_blank()))
            .map(|m| OutboundMessage::from(m.as_ref()))
            .collect();
        Self {
            request_id,
            model,
            messages,
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
            top_p: settings.top_p,
            frequency_penalty: settings.frequency_penalty,
            presence_penalty: settings.presence_penalty,
        }
    }
}

/// A complete (non-streamed) reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedReply {
    pub content: String,
    pub usage: Option<UsageInfo>,
    pub finish_reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BufferedWire {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    usage: Option<UsageInfo>,
    #[serde(default, alias = "finish_reason")]
    finish_reason: Option<String>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

/// Decodes a buffered response body; an `error` payload becomes `ServerReported`.
pub fn decode_buffered_body(text: &str) -> Result<BufferedReply> {
    let wire: BufferedWire = serde_json::from_str(text)
        .map_err(|e| ChatError::Protocol(format!("Invalid buffered response: {}", e)))?;

    if let Some(err) = wire.error.filter(|e| !e.is_null()) {
        let message = match err.get("message").and_then(|m| m.as_str()) {
            Some(m) => m.to_string(),
            None => match err.as_str() {
                Some(s) => s.to_string(),
                None => err.to_string(),
            },
        };
        return Err(ChatError::ServerReported(message).into());
    }

    Ok(BufferedReply {
        content: wire.content.unwrap_or_default(),
        usage: wire.usage,
        finish_reason: wire.finish_reason,
    })
}

/// The completion service as seen by the controller. Dropping a returned
/// future or stream aborts the underlying request.
pub trait ChatTransport: Send + Sync + 'static {
    fn open_stream<'a>(&'a self, body: &'a ChatRequestBody) -> BoxFuture<'a, Result<ByteStream>>;

    /// One attempt; retries are layered on top by `fetch_with_retry`.
    fn send_buffered<'a>(&'a self, body: &'a ChatRequestBody)
        -> BoxFuture<'a, Result<BufferedReply>>;

    fn notify_stop<'a>(&'a self, request_id: &'a RequestId) -> BoxFuture<'a, Result<()>>;
}

/// Supplies the bearer token, if any, at request time.
pub trait TokenSource: Send + Sync {
    fn bearer_token(&self) -> Option<String>;
}

impl TokenSource for Option<String> {
    fn bearer_token(&self) -> Option<String> {
        self.clone()
    }
}

pub struct HttpTransport {
    client: reqwest::Client,
    chat_endpoint: String,
    stop_endpoint: String,
    token: Arc<dyn TokenSource>,
}

impl HttpTransport {
    pub fn new(
        client: reqwest::Client,
        chat_endpoint: impl Into<String>,
        stop_endpoint: impl Into<String>,
        token: Arc<dyn TokenSource>,
    ) -> Self {
        Self {
            client,
            chat_endpoint: chat_endpoint.into(),
            stop_endpoint: stop_endpoint.into(),
            token,
        }
    }

    fn post(&self, url: &str) -> reqwest::RequestBuilder {
        let req = self.client.post(url);
        match self.token.bearer_token() {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let error_body = match response.text().await {
            Ok(text) => text,
            Err(e) => format!("Upstream error (body unreadable): {}", e),
        };
        tracing::error!("[☁️  -> 🖥️ ] Upstream Error {}: {}", status, error_body);
        Err(ChatError::Upstream(status, error_body).into())
    }
}

impl ChatTransport for HttpTransport {
    fn open_stream<'a>(&'a self, body: &'a ChatRequestBody) -> BoxFuture<'a, Result<ByteStream>> {
        async move {
            tracing::debug!(
                "[🖥️  -> ☁️ ] Opening stream for {} ({} messages)",
                body.request_id.short(),
                body.messages.len()
            );
            let response = self
                .post(&self.chat_endpoint)
                .header(ACCEPT, ACCEPT_EVENT_STREAM)
                .json(body)
                .send()
                .await?;
            let response = Self::check_status(response).await?;
            tracing::info!("[☁️  -> 🖥️ ] Status: {}", response.status());

            let stream = response
                .bytes_stream()
                .map(|r| r.map_err(ObservedError::from))
                .boxed();
            Ok(stream)
        }
        .boxed()
    }

    fn send_buffered<'a>(
        &'a self,
        body: &'a ChatRequestBody,
    ) -> BoxFuture<'a, Result<BufferedReply>> {
        async move {
            let response = self
                .post(&self.chat_endpoint)
                .header(ACCEPT, ACCEPT_JSON)
                .json(body)
                .send()
                .await?;
            let response = Self::check_status(response).await?;
            let text = response.text().await?;
            decode_buffered_body(&text)
        }
        .boxed()
    }

    fn notify_stop<'a>(&'a self, request_id: &'a RequestId) -> BoxFuture<'a, Result<()>> {
        async move {
            let response = self
                .post(&self.stop_endpoint)
                .json(&serde_json::json!({ "requestId": request_id }))
                .send()
                .await?;
            let response = Self::check_status(response).await?;
            tracing::debug!(
                "[☁️  -> 🖥️ ] Stop acknowledged for {} ({})",
                request_id.short(),
                response.status()
            );
            Ok(())
        }
        .boxed()
    }
}
