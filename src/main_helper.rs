use crate::constants::{API_TOKEN_ENV, DEFAULT_CHAT_ENDPOINT, DEFAULT_STOP_ENDPOINT};
use crate::controller::{ChatController, ChatSettings, ControllerConfig};
use crate::hardening::RetryPolicy;
use crate::logging::LogConfig;
use crate::transport::{HttpTransport, TokenSource};
use crate::types::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(long, default_value = DEFAULT_CHAT_ENDPOINT)]
    pub endpoint: String,
    #[arg(long, default_value = DEFAULT_STOP_ENDPOINT)]
    pub stop_endpoint: String,
    #[arg(long)]
    pub model: Option<String>,
    #[arg(long, default_value_t = false)]
    pub no_stream: bool,
    #[arg(long, default_value_t = 0.7)]
    pub temperature: f32,
    #[arg(long, default_value_t = 2048)]
    pub max_tokens: u32,
    #[arg(long, default_value_t = 1.0)]
    pub top_p: f32,
    #[arg(long, default_value_t = 0.0)]
    pub frequency_penalty: f32,
    #[arg(long, default_value_t = 0.0)]
    pub presence_penalty: f32,
    #[arg(long, default_value_t = 60)]
    pub inactivity_timeout_secs: u64,
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,
    #[arg(long, default_value_t = 3)]
    pub max_retries: u32,
    #[arg(long, default_value_t = 500)]
    pub retry_base_delay_ms: u64,
    #[arg(long, default_value = "logs")]
    pub log_dir: PathBuf,
    #[arg(long, default_value_t = false)]
    pub json_logs: bool,
    /// Mirror logs to stderr
    #[arg(long, short, default_value_t = false)]
    pub verbose: bool,
}

impl Args {
    pub fn settings(&self) -> ChatSettings {
        ChatSettings {
            model: self.model.clone(),
            stream: !self.no_stream,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            top_p: self.top_p,
            frequency_penalty: self.frequency_penalty,
            presence_penalty: self.presence_penalty,
        }
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            inactivity_timeout: Duration::from_secs(self.inactivity_timeout_secs),
            retry: RetryPolicy::new(
                self.max_retries,
                Duration::from_millis(self.retry_base_delay_ms),
            ),
            ..ControllerConfig::default()
        }
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            directory: self.log_dir.clone(),
            json: self.json_logs,
            stderr: self.verbose,
            ..LogConfig::default()
        }
    }
}

/// Reads the bearer token from the environment on every request, so a
/// rotated token is picked up without a restart.
pub struct EnvToken;

impl TokenSource for EnvToken {
    fn bearer_token(&self) -> Option<String> {
        match std::env::var(API_TOKEN_ENV) {
            Ok(t) if !t.trim().is_empty() => Some(t.trim().to_string()),
            _ => None,
        }
    }
}

/// No total timeout: long streams are governed by the inactivity watchdog.
pub fn build_http_client(connect_timeout: Duration) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(10)
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .build()?;
    Ok(client)
}

pub fn build_controller(args: &Args) -> Result<ChatController> {
    let client = build_http_client(Duration::from_secs(args.connect_timeout_secs))?;
    let transport = HttpTransport::new(
        client,
        args.endpoint.clone(),
        args.stop_endpoint.clone(),
        Arc::new(EnvToken),
    );
    Ok(ChatController::new(
        Arc::new(transport),
        args.settings(),
        args.controller_config(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_map_to_settings_and_config() {
        let args = Args::parse_from([
            "chatwire",
            "--model",
            "llama3",
            "--no-stream",
            "--max-retries",
            "5",
            "--inactivity-timeout-secs",
            "30",
        ]);
        let settings = args.settings();
        assert_eq!(settings.model.as_deref(), Some("llama3"));
        assert!(!settings.stream);

        let config = args.controller_config();
        assert_eq!(config.retry.retries, 5);
        assert_eq!(config.inactivity_timeout, Duration::from_secs(30));
        assert_eq!(config.retry.base_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["chatwire"]);
        assert_eq!(args.endpoint, DEFAULT_CHAT_ENDPOINT);
        assert!(args.settings().stream);
        assert!(args.settings().model.is_none());
    }
}
