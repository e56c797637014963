use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing_error::SpanTrace;
use uuid::Uuid;

/// Opaque token identifying one submitted chat turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(8) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// --- CORE ROLES ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Error,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::System => write!(f, "system"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// --- MESSAGES ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Anything else a part carries (image urls, file refs) passes through untouched.
    #[serde(default, flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".to_string(),
            text: Some(text.into()),
            extra: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Plain-text view: text parts are concatenated, other parts are skipped.
    pub fn as_text(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|p| p.text.as_deref())
                .collect::<Vec<_>>()
                .join(""),
        }
    }

    pub fn is_blank(&self) -> bool {
        self.as_text().trim().is_empty()
    }

    pub fn push_str(&mut self, suffix: &str) {
        match self {
            Self::Text(s) => s.push_str(suffix),
            Self::Parts(parts) => match parts
                .iter_mut()
                .rev()
                .find_map(|p| p.text.as_mut())
            {
                Some(text) => text.push_str(suffix),
                None => parts.push(ContentPart::text(suffix)),
            },
        }
    }
}

impl Default for MessageContent {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

impl From<String> for MessageContent {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for MessageContent {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub unique_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Metrics>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<MessageContent>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            unique_id: new_message_id(),
            metrics: None,
        }
    }

    pub fn text(&self) -> String {
        self.content.as_text()
    }
}

pub fn new_message_id() -> String {
    format!("msg_{}", Uuid::new_v4().simple())
}

/// --- METRICS ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Milliseconds since the request started.
    pub elapsed_time: u64,
    pub token_count: u32,
    pub tokens_per_second: f64,
    /// Milliseconds until the first token was observed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_to_first_token: Option<u64>,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    pub is_complete: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub error: bool,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            start_time: Utc::now(),
            end_time: None,
            elapsed_time: 0,
            token_count: 0,
            tokens_per_second: 0.0,
            time_to_first_token: None,
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
            finish_reason: None,
            is_complete: false,
            error: false,
        }
    }
}

impl Metrics {
    pub fn merge(&mut self, update: &MetricsUpdate) {
        if let Some(v) = update.start_time {
            self.start_time = v;
        }
        if let Some(v) = update.end_time {
            self.end_time = Some(v);
        }
        if let Some(v) = update.elapsed_time {
            self.elapsed_time = v;
        }
        if let Some(v) = update.token_count {
            self.token_count = v;
        }
        if let Some(v) = update.tokens_per_second {
            self.tokens_per_second = v;
        }
        if let Some(v) = update.time_to_first_token {
            self.time_to_first_token = Some(v);
        }
        if let Some(v) = update.prompt_tokens {
            self.prompt_tokens = v;
        }
        if let Some(v) = update.completion_tokens {
            self.completion_tokens = v;
        }
        if let Some(v) = update.total_tokens {
            self.total_tokens = v;
        }
        if let Some(v) = &update.finish_reason {
            self.finish_reason = Some(v.clone());
        }
        if let Some(v) = update.is_complete {
            self.is_complete = v;
        }
        if let Some(v) = update.error {
            self.error = v;
        }
    }
}

/// Field-wise patch merged onto a message's metrics; `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsUpdate {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub elapsed_time: Option<u64>,
    pub token_count: Option<u32>,
    pub tokens_per_second: Option<f64>,
    pub time_to_first_token: Option<u64>,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
    pub finish_reason: Option<String>,
    pub is_complete: Option<bool>,
    pub error: Option<bool>,
}

impl MetricsUpdate {
    pub fn completed(error: bool) -> Self {
        Self {
            end_time: Some(Utc::now()),
            is_complete: Some(true),
            error: Some(error),
            ..Self::default()
        }
    }
}

impl From<Metrics> for MetricsUpdate {
    fn from(m: Metrics) -> Self {
        Self {
            start_time: Some(m.start_time),
            end_time: m.end_time,
            elapsed_time: Some(m.elapsed_time),
            token_count: Some(m.token_count),
            tokens_per_second: Some(m.tokens_per_second),
            time_to_first_token: m.time_to_first_token,
            prompt_tokens: Some(m.prompt_tokens),
            completion_tokens: Some(m.completion_tokens),
            total_tokens: Some(m.total_tokens),
            finish_reason: m.finish_reason,
            is_complete: Some(m.is_complete),
            error: Some(m.error),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UsageInfo {
    #[serde(default, alias = "prompt_tokens")]
    pub prompt_tokens: u32,
    #[serde(default, alias = "completion_tokens")]
    pub completion_tokens: u32,
    #[serde(default, alias = "total_tokens")]
    pub total_tokens: u32,
}

/// --- STREAMING ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    ContentDelta {
        text: String,
    },
    UsageReport {
        usage: UsageInfo,
        finish_reason: Option<String>,
    },
    Done,
    ServerError {
        message: String,
    },
}

/// --- ERRORS ---

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Upstream error (status {0}): {1}")]
    Upstream(StatusCode, String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("{0}")]
    ServerReported(String),

    #[error("Request timed out: no response data received for {} seconds", .0.as_secs())]
    Timeout(Duration),

    #[error("Request aborted")]
    Aborted,

    #[error("Metrics are already complete for this request")]
    MetricsFinalized,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String, SpanTrace),
}

impl ChatError {
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into(), SpanTrace::capture())
    }

    /// Transport-level failures that a fresh attempt may cure.
    pub fn is_network(&self) -> bool {
        match self {
            Self::Network(_) | Self::Connection(_) => true,
            Self::Upstream(status, _) => !status.is_success(),
            _ => false,
        }
    }
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: ChatError,
    pub span_trace: SpanTrace,
}

impl ObservedError {
    pub fn into_inner(self) -> ChatError {
        self.inner
    }
}

impl std::fmt::Display for ObservedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<ChatError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;
