use crate::frame_parser::ParsedChunk;
use crate::token_counting::TokenEstimator;
use crate::transport::ChatRequestBody;
use crate::types::{ChatError, RequestId, Result, Role, StreamFrame};
use colored::*;
use std::panic;
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;

pub const DEFAULT_LOG_FILTER: &str = "chatwire=info,flight_recorder=info";

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub directory: PathBuf,
    pub file_name: String,
    /// NDJSON instead of plain text in the log file.
    pub json: bool,
    /// Mirror logs to stderr.
    pub stderr: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("logs"),
            file_name: "chatwire.log".to_string(),
            json: false,
            stderr: false,
        }
    }
}

/// Installs the global subscriber. Keep the returned guard alive for the
/// lifetime of the process or buffered log lines are lost.
pub fn init_tracing(config: &LogConfig) -> Result<WorkerGuard> {
    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => DEFAULT_LOG_FILTER.into(),
    };

    if let Err(e) = std::fs::create_dir_all(&config.directory) {
        return Err(ChatError::internal(format!(
            "cannot create log directory {}: {}",
            config.directory.display(),
            e
        ))
        .into());
    }
    let file_appender = tracing_appender::rolling::daily(&config.directory, &config.file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let (text_layer, json_layer) = if config.json {
        (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(non_blocking),
            ),
        )
    } else {
        (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false),
            ),
            None,
        )
    };
    let stderr_layer = config
        .stderr
        .then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(text_layer)
        .with(json_layer)
        .with(stderr_layer)
        .with(tracing_error::ErrorLayer::default())
        .try_init()
        .map_err(|e| ChatError::internal(format!("tracing already initialised: {}", e)))?;

    Ok(guard)
}

/// Sets up a global panic hook that logs panics using tracing.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

pub fn log_request_summary(body: &ChatRequestBody, stream: bool) {
    let last_role = match body.messages.last() {
        Some(m) => m.role.to_string(),
        None => "NONE".into(),
    };
    let prompt_estimate: u32 = body
        .messages
        .iter()
        .map(|m| TokenEstimator::estimate_text_tokens(&m.content.as_text()))
        .sum();

    if body.messages.last().map(|m| m.role) != Some(Role::User) {
        warn!(
            target: "flight_recorder",
            "{}", "[REQ] Last outbound message is not from the user".yellow()
        );
    }

    info!(
        target: "flight_recorder",
        "[REQ] {} | Model: {} | Messages: {} | Last Role: {} | ~{} prompt tokens | Mode: {}",
        body.request_id.short(),
        body.model,
        body.messages.len(),
        last_role,
        prompt_estimate,
        if stream { "stream" } else { "buffered" }
    );
}

/// Per-stream counters, summarised once when the stream ends.
#[derive(Debug, Default)]
pub struct StreamTally {
    pub chunks: usize,
    pub bytes: usize,
    pub frames: usize,
    pub dropped: usize,
    pub text_chars: usize,
}

impl StreamTally {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_chunk(&mut self, len: usize) {
        self.chunks += 1;
        self.bytes += len;
    }

    pub fn record_batch(&mut self, parsed: &ParsedChunk) {
        self.frames += parsed.frames.len();
        self.dropped += parsed.dropped;
        for frame in &parsed.frames {
            if let StreamFrame::ContentDelta { text } = frame {
                self.text_chars += text.chars().count();
            }
        }
    }

    pub fn log_summary(&self, request_id: &RequestId) {
        let dropped = if self.dropped > 0 {
            format!("{}", self.dropped).red().to_string()
        } else {
            "0".to_string()
        };
        info!(
            target: "flight_recorder",
            "[STREAM END] {} | Chunks: {} ({} bytes) | Frames: {} | Dropped: {} | Text: {} chars",
            request_id.short(),
            self.chunks,
            self.bytes,
            self.frames,
            dropped,
            self.text_chars
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_parser::parse_chunk_with_stats;

    #[test]
    fn test_tally_counts_frames_and_drops() {
        let mut tally = StreamTally::new();
        let text = "data: {\"content\":\"héllo\"}\n\ndata: {oops\n\ndata: [DONE]\n\n";
        tally.record_chunk(text.len());
        tally.record_batch(&parse_chunk_with_stats(text));
        assert_eq!(tally.chunks, 1);
        assert_eq!(tally.frames, 2);
        assert_eq!(tally.dropped, 1);
        assert_eq!(tally.text_chars, 5);
    }
}
