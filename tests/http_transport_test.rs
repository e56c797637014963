use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use chatwire::controller::*;
use chatwire::hardening::{fetch_with_retry, RetryPolicy};
use chatwire::transport::{ChatRequestBody, ChatTransport, HttpTransport};
use chatwire::types::*;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy)]
enum Mode {
    Normal,
    ErrorBody,
    Status500,
}

struct MockState {
    mode: Mode,
    chat_calls: AtomicU32,
    auth: Mutex<Vec<String>>,
    stopped: Mutex<Vec<Value>>,
}

async fn chat(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    state.chat_calls.fetch_add(1, Ordering::SeqCst);
    if let Some(auth) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        state.auth.lock().unwrap().push(auth.to_string());
    }
    assert!(body["requestId"].is_string());
    assert!(body["messages"].as_array().is_some());

    let accept = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    match state.mode {
        Mode::Status500 => (StatusCode::INTERNAL_SERVER_ERROR, "upstream exploded").into_response(),
        Mode::ErrorBody => Json(json!({ "error": { "message": "rate limited" } })).into_response(),
        Mode::Normal if accept == "text/event-stream" => (
            [(header::CONTENT_TYPE, "text/event-stream")],
            "data: {\"content\":\"Hello\"}\n\n\
             : heartbeat\n\n\
             data: {\"content\":\" world\"}\n\n\
             data: {\"usage\":{\"prompt_tokens\":4,\"completion_tokens\":2,\"total_tokens\":6}}\n\n\
             data: [DONE]\n\n",
        )
            .into_response(),
        Mode::Normal => Json(json!({
            "content": "Hello world",
            "usage": { "promptTokens": 4, "completionTokens": 2, "totalTokens": 6 },
            "finishReason": "stop"
        }))
        .into_response(),
    }
}

async fn stop(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> StatusCode {
    state.stopped.lock().unwrap().push(body);
    StatusCode::NO_CONTENT
}

async fn spawn_server(mode: Mode) -> (String, Arc<MockState>) {
    let state = Arc::new(MockState {
        mode,
        chat_calls: AtomicU32::new(0),
        auth: Mutex::new(Vec::new()),
        stopped: Mutex::new(Vec::new()),
    });
    let app = Router::new()
        .route("/api/chat", post(chat))
        .route("/api/chat/stop", post(stop))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), state)
}

fn transport(base: &str) -> HttpTransport {
    HttpTransport::new(
        reqwest::Client::new(),
        format!("{}/api/chat", base),
        format!("{}/api/chat/stop", base),
        Arc::new(Some("secret-token".to_string())),
    )
}

fn controller(base: &str, stream: bool, retries: u32) -> ChatController {
    let settings = ChatSettings {
        model: Some("test-model".into()),
        stream,
        ..ChatSettings::default()
    };
    let config = ControllerConfig {
        retry: RetryPolicy::new(retries, Duration::from_millis(1)).without_jitter(),
        ..ControllerConfig::default()
    };
    ChatController::new(Arc::new(transport(base)), settings, config)
}

#[tokio::test]
async fn test_streaming_round_trip_over_http() {
    let (base, state) = spawn_server(Mode::Normal).await;
    let controller = controller(&base, true, 0);

    let outcome = controller.submit("Hi", None).unwrap().wait().await;
    assert_eq!(outcome, RequestOutcome::Completed);

    let last = controller.history().last().unwrap();
    assert_eq!(last.text(), "Hello world");
    let metrics = last.metrics.clone().unwrap();
    assert_eq!(metrics.completion_tokens, 2);
    assert!(metrics.is_complete);

    assert_eq!(
        state.auth.lock().unwrap().as_slice(),
        ["Bearer secret-token".to_string()]
    );
}

#[tokio::test]
async fn test_buffered_round_trip_over_http() {
    let (base, _state) = spawn_server(Mode::Normal).await;
    let controller = controller(&base, false, 0);

    let outcome = controller.submit("Hi", None).unwrap().wait().await;
    assert_eq!(outcome, RequestOutcome::Completed);
    let last = controller.history().last().unwrap();
    assert_eq!(last.text(), "Hello world");
    assert_eq!(last.metrics.as_ref().unwrap().finish_reason.as_deref(), Some("stop"));
}

#[tokio::test]
async fn test_error_body_in_success_response_is_not_retried() {
    let (base, state) = spawn_server(Mode::ErrorBody).await;
    let controller = controller(&base, false, 3);

    let outcome = controller.submit("Hi", None).unwrap().wait().await;
    assert_eq!(outcome, RequestOutcome::Errored("rate limited".into()));
    assert_eq!(state.chat_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_server_error_status_is_retried() {
    let (base, state) = spawn_server(Mode::Status500).await;
    let http = transport(&base);
    let policy = RetryPolicy::new(3, Duration::from_millis(1)).without_jitter();
    let body = ChatRequestBody::from_history(
        RequestId::new(),
        &ChatSettings::default(),
        "m".into(),
        &vec![Arc::new(Message::new(Role::User, "Hi"))],
    );

    let err = fetch_with_retry(&http, &body, &policy, &CancellationToken::new())
        .await
        .unwrap_err();
    match err.inner {
        ChatError::Upstream(status, body) => {
            assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(body, "upstream exploded");
        }
        other => panic!("Expected Upstream, got {:?}", other),
    }
    assert_eq!(state.chat_calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_stop_notification_posts_request_id() {
    let (base, state) = spawn_server(Mode::Normal).await;
    let http = transport(&base);
    let rid = RequestId::from("req-123".to_string());

    http.notify_stop(&rid).await.unwrap();
    let stopped = state.stopped.lock().unwrap().clone();
    assert_eq!(stopped, vec![json!({ "requestId": "req-123" })]);
}

#[tokio::test]
async fn test_unreachable_stream_endpoint_reports_network_error() {
    let http = HttpTransport::new(
        reqwest::Client::new(),
        "http://127.0.0.1:1/api/chat",
        "http://127.0.0.1:1/api/chat/stop",
        Arc::new(None::<String>),
    );
    let body = ChatRequestBody::from_history(
        RequestId::new(),
        &ChatSettings::default(),
        "m".into(),
        &Vec::new(),
    );
    let err = match http.open_stream(&body).await {
        Ok(_) => panic!("Expected connection failure"),
        Err(e) => e,
    };
    assert!(err.inner.is_network());
}
