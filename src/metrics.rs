//! Performance Metrics Accumulator
//!
//! Derives elapsed time, time-to-first-token and throughput for one request
//! from a sequence of partial and final usage reports.

use crate::types::{ChatError, Metrics, Result, UsageInfo};
use chrono::{DateTime, Utc};
use tokio::time::Instant;

#[derive(Debug, Default)]
pub struct PerformanceMetrics {
    started_at: Option<Instant>,
    start_time: Option<DateTime<Utc>>,
    first_token_ms: Option<u64>,
    usage: Option<UsageInfo>,
    finish_reason: Option<String>,
    token_count: u32,
    last_elapsed_ms: u64,
    completed: bool,
    last: Option<Metrics>,
}

fn round_one_decimal(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

impl PerformanceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self) {
        self.started_at = Some(Instant::now());
        self.start_time = Some(Utc::now());
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Most recent computed snapshot.
    pub fn snapshot(&self) -> Option<&Metrics> {
        self.last.as_ref()
    }

    /// Records progress. `token_count` is the client-side estimate; `usage`,
    /// once seen, replaces it for the rest of the request.
    pub fn update(
        &mut self,
        token_count: u32,
        is_complete: bool,
        usage: Option<UsageInfo>,
        finish_reason: Option<String>,
    ) -> Result<Metrics> {
        if self.completed {
            return Err(ChatError::MetricsFinalized.into());
        }
        let Some(started_at) = self.started_at else {
            return Err(ChatError::internal("metrics update before start()").into());
        };

        let elapsed_ms = (started_at.elapsed().as_millis() as u64).max(self.last_elapsed_ms);
        self.last_elapsed_ms = elapsed_ms;

        if usage.is_some() {
            self.usage = usage;
        }
        if finish_reason.is_some() {
            self.finish_reason = finish_reason;
        }
        self.token_count = token_count;

        let completion_tokens = match self.usage {
            Some(u) => u.completion_tokens,
            None => token_count,
        };
        let (prompt_tokens, total_tokens) = match self.usage {
            Some(u) => (u.prompt_tokens, u.total_tokens),
            None => (0, completion_tokens),
        };

        if self.first_token_ms.is_none() && (token_count > 0 || completion_tokens > 0) {
            self.first_token_ms = Some(elapsed_ms);
        }

        let tokens_per_second = if elapsed_ms > 0 {
            round_one_decimal(completion_tokens as f64 / (elapsed_ms as f64 / 1000.0))
        } else {
            0.0
        };

        let end_time = if is_complete { Some(Utc::now()) } else { None };
        self.completed = is_complete;

        let metrics = Metrics {
            start_time: self.start_time.unwrap_or_else(Utc::now),
            end_time,
            elapsed_time: elapsed_ms,
            token_count: completion_tokens,
            tokens_per_second,
            time_to_first_token: self.first_token_ms,
            prompt_tokens,
            completion_tokens,
            total_tokens,
            finish_reason: self.finish_reason.clone(),
            is_complete,
            error: false,
        };

        if is_complete {
            tracing::info!(
                target: "flight_recorder",
                "[METRICS] {} ms | TTFT: {} | {} tokens ({} tok/s) | finish: {}",
                metrics.elapsed_time,
                match metrics.time_to_first_token {
                    Some(t) => format!("{} ms", t),
                    None => "n/a".to_string(),
                },
                metrics.completion_tokens,
                metrics.tokens_per_second,
                metrics.finish_reason.as_deref().unwrap_or("unknown")
            );
        }

        self.last = Some(metrics.clone());
        Ok(metrics)
    }

    /// Closes the request with the last known counts (stop, abort, failure).
    pub fn finish(&mut self, error: bool) -> Result<Metrics> {
        let mut metrics = self.update(self.token_count, true, None, None)?;
        metrics.error = error;
        self.last = Some(metrics.clone());
        Ok(metrics)
    }
}
