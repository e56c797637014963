use chatwire::hardening::*;
use chatwire::types::*;
use reqwest::StatusCode;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn upstream_503() -> ObservedError {
    ChatError::Upstream(StatusCode::SERVICE_UNAVAILABLE, "busy".to_string()).into()
}

#[tokio::test]
async fn test_retry_policy_success() {
    let policy = RetryPolicy::new(3, Duration::from_millis(1));
    let cancel = CancellationToken::new();
    let mut attempts = 0;

    let result: chatwire::types::Result<i32> = policy
        .execute_with_retry(&cancel, || {
            attempts += 1;
            async move { Ok(42) }
        })
        .await;

    match result {
        Ok(val) => assert_eq!(val, 42),
        Err(e) => panic!("Expected Ok, got Err: {:?}", e),
    }
    assert_eq!(attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn test_retry_policy_eventual_success() {
    let policy = RetryPolicy::new(3, Duration::from_millis(500));
    let cancel = CancellationToken::new();
    let mut attempts = 0;

    let result: chatwire::types::Result<i32> = policy
        .execute_with_retry(&cancel, || {
            attempts += 1;
            let a = attempts;
            async move {
                if a < 3 {
                    Err(ChatError::Connection("reset by peer".to_string()).into())
                } else {
                    Ok(42)
                }
            }
        })
        .await;

    match result {
        Ok(val) => assert_eq!(val, 42),
        Err(e) => panic!("Expected Ok, got Err: {:?}", e),
    }
    assert_eq!(attempts, 3);
}

#[tokio::test(start_paused = true)]
async fn test_persistent_network_failure_makes_retries_plus_one_attempts() {
    let policy = RetryPolicy::new(3, Duration::from_millis(500)).without_jitter();
    let cancel = CancellationToken::new();
    let attempts = Arc::new(AtomicU32::new(0));
    let started = tokio::time::Instant::now();

    let counter = attempts.clone();
    let result: chatwire::types::Result<()> = policy
        .execute_with_retry(&cancel, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Err(upstream_503()) }
        })
        .await;

    let err = result.unwrap_err();
    assert!(matches!(err.inner, ChatError::Upstream(_, _)));
    assert_eq!(attempts.load(Ordering::SeqCst), 4);
    // 500 + 1000 + 2000 ms of backoff
    assert!(started.elapsed() >= Duration::from_millis(3500));
    assert!(started.elapsed() < Duration::from_millis(3600));
}

#[tokio::test]
async fn test_server_reported_error_is_not_retried() {
    let policy = RetryPolicy::new(3, Duration::from_millis(1));
    let cancel = CancellationToken::new();
    let mut attempts = 0;

    let result: chatwire::types::Result<()> = policy
        .execute_with_retry(&cancel, || {
            attempts += 1;
            async move { Err(ChatError::ServerReported("rate limited".to_string()).into()) }
        })
        .await;

    assert_eq!(attempts, 1);
    assert_eq!(result.unwrap_err().to_string(), "rate limited");
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_backoff_aborts_without_further_attempts() {
    let policy = RetryPolicy::new(3, Duration::from_secs(10)).without_jitter();
    let cancel = CancellationToken::new();
    let attempts = Arc::new(AtomicU32::new(0));

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let counter = attempts.clone();
    let result: chatwire::types::Result<()> = policy
        .execute_with_retry(&cancel, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Err(upstream_503()) }
        })
        .await;

    assert!(matches!(result.unwrap_err().inner, ChatError::Aborted));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_already_cancelled_makes_no_attempt() {
    let policy = RetryPolicy::default();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let mut attempts = 0;

    let result: chatwire::types::Result<()> = policy
        .execute_with_retry(&cancel, || {
            attempts += 1;
            async move { Ok(()) }
        })
        .await;

    assert!(matches!(result.unwrap_err().inner, ChatError::Aborted));
    assert_eq!(attempts, 0);
}
