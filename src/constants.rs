use std::time::Duration;

/// Suffix appended to the assistant message when the user stops a request.
pub const STOPPED_SUFFIX: &str = " [Stopped]";

/// SSE sentinel closing a stream.
pub const DONE_SENTINEL: &str = "[DONE]";

pub const ACCEPT_EVENT_STREAM: &str = "text/event-stream";
pub const ACCEPT_JSON: &str = "application/json";

/// Retry defaults for the buffered transport
pub const DEFAULT_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_RETRY_MAX_JITTER: Duration = Duration::from_millis(100);

/// Render debounce window (~50 flushes per second)
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(20);

/// Inactivity watchdog, rearmed on every chunk
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(60);

/// Parser worker mailbox depth
pub const PARSER_QUEUE_DEPTH: usize = 64;

/// Upper bound on a carried, unterminated frame fragment.
pub const MAX_CARRY_BYTES: usize = 4 * 1024 * 1024;

/// Endpoint defaults
pub const DEFAULT_CHAT_ENDPOINT: &str = "http://127.0.0.1:8080/api/chat";
pub const DEFAULT_STOP_ENDPOINT: &str = "http://127.0.0.1:8080/api/chat/stop";
pub const API_TOKEN_ENV: &str = "CHATWIRE_API_TOKEN";
