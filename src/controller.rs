//! Request Lifecycle Controller
//!
//! Owns the active request session. Every history mutation that belongs to a
//! request happens while the session lock is held and after checking that the
//! request is still the active one, so a stop, a timeout or a newer submit
//! can never be overwritten by a late batch from an older request.
//!
//! Lock order: session, metrics, render sync, history.

use crate::constants::{
    DEFAULT_FLUSH_INTERVAL, DEFAULT_INACTIVITY_TIMEOUT, PARSER_QUEUE_DEPTH, STOPPED_SUFFIX,
};
use crate::hardening::{fetch_with_retry, RetryPolicy};
use crate::history::HistoryStore;
use crate::logging::log_request_summary;
use crate::metrics::PerformanceMetrics;
use crate::render_sync::RenderSync;
use crate::streaming::StreamHandler;
use crate::token_counting::{RunningWordCount, TokenEstimator};
use crate::transport::{BufferedReply, ChatRequestBody, ChatTransport};
use crate::types::{
    ChatError, Message, MessageContent, Metrics, MetricsUpdate, RequestId, Result, Role,
    StreamFrame,
};
use crate::worker::ParserWorker;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// User-facing request settings, replaced wholesale between requests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatSettings {
    pub model: Option<String>,
    pub stream: bool,
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            model: None,
            stream: true,
            temperature: 0.7,
            max_tokens: 2048,
            top_p: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Re-armed on every transport read.
    pub inactivity_timeout: Duration,
    pub retry: RetryPolicy,
    pub flush_interval: Duration,
    pub parser_queue_depth: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
            retry: RetryPolicy::default(),
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            parser_queue_depth: PARSER_QUEUE_DEPTH,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum RequestState {
    #[default]
    Idle,
    Sending,
    Streaming,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RequestOutcome {
    Completed,
    Errored(String),
    /// Stopped by the user, or retired by a newer submit.
    Aborted,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ControllerStatus {
    pub state: RequestState,
    pub active_request: Option<RequestId>,
    pub last_error: Option<String>,
    pub last_outcome: Option<RequestOutcome>,
}

impl ControllerStatus {
    pub fn is_waiting(&self) -> bool {
        self.state != RequestState::Idle
    }
}

/// Returned by `submit`; resolves once the request reaches a terminal state.
pub struct RequestHandle {
    request_id: RequestId,
    join: JoinHandle<RequestOutcome>,
}

impl RequestHandle {
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub async fn wait(self) -> RequestOutcome {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Request task for {} failed: {}", self.request_id.short(), e);
                RequestOutcome::Errored(format!("Request task failed: {}", e))
            }
        }
    }
}

struct ActiveSession {
    request_id: RequestId,
    cancel: CancellationToken,
    /// Present only on the streaming path.
    sync: Option<RenderSync>,
    words: RunningWordCount,
}

pub(crate) enum FrameFlow {
    Continue,
    Finished(RequestOutcome),
    Stale,
}

pub(crate) struct ControllerShared {
    pub(crate) transport: Arc<dyn ChatTransport>,
    pub(crate) config: ControllerConfig,
    history: HistoryStore,
    settings: RwLock<ChatSettings>,
    session: Mutex<Option<ActiveSession>>,
    metrics: Mutex<PerformanceMetrics>,
    parser: OnceLock<ParserWorker>,
    status: watch::Sender<ControllerStatus>,
}

#[derive(Clone)]
pub struct ChatController {
    shared: Arc<ControllerShared>,
}

impl ChatController {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        settings: ChatSettings,
        config: ControllerConfig,
    ) -> Self {
        Self::with_history(transport, settings, config, HistoryStore::new())
    }

    pub fn with_history(
        transport: Arc<dyn ChatTransport>,
        settings: ChatSettings,
        config: ControllerConfig,
        history: HistoryStore,
    ) -> Self {
        let (status, _) = watch::channel(ControllerStatus::default());
        Self {
            shared: Arc::new(ControllerShared {
                transport,
                config,
                history,
                settings: RwLock::new(settings),
                session: Mutex::new(None),
                metrics: Mutex::new(PerformanceMetrics::new()),
                parser: OnceLock::new(),
                status,
            }),
        }
    }

    pub fn history(&self) -> &HistoryStore {
        &self.shared.history
    }

    pub fn settings(&self) -> ChatSettings {
        self.shared
            .settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Takes effect from the next `submit`.
    pub fn update_settings(&self, settings: ChatSettings) {
        *self
            .shared
            .settings
            .write()
            .unwrap_or_else(PoisonError::into_inner) = settings;
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.shared.config
    }

    pub fn status(&self) -> ControllerStatus {
        self.shared.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ControllerStatus> {
        self.shared.status.subscribe()
    }

    pub fn is_waiting_for_response(&self) -> bool {
        self.shared.status.borrow().is_waiting()
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.status.borrow().last_error.clone()
    }

    pub fn active_request_id(&self) -> Option<RequestId> {
        self.shared.status.borrow().active_request.clone()
    }

    /// Metrics of the current or most recent request.
    pub fn latest_metrics(&self) -> Option<Metrics> {
        self.shared.metrics().snapshot().cloned()
    }

    /// Starts a new chat turn. `edit_index`, when it names an existing entry,
    /// rewrites history from that point instead of appending.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit(
        &self,
        message: impl Into<MessageContent>,
        edit_index: Option<usize>,
    ) -> Result<RequestHandle> {
        let shared = &self.shared;
        let content = message.into();
        let settings = self.settings();

        let model = match settings.model.as_deref().map(str::trim) {
            Some(m) if !m.is_empty() => m.to_string(),
            _ => return Err(shared.reject("No model selected")),
        };
        if content.is_blank() {
            return Err(shared.reject("Message is empty"));
        }

        let mut slot = shared.session();
        shared.retire_locked(&mut slot);
        debug_assert!(slot.is_none(), "a retired session is still active");

        match edit_index.and_then(|i| shared.history.get(i).map(|m| (i, m))) {
            Some((index, original)) => {
                let mut edited = Message::new(Role::User, content);
                edited.unique_id = original.unique_id.clone();
                edited.timestamp = original.timestamp;
                debug!("Editing history at index {}", index);
                shared.history.truncate_and_replace(index, edited);
            }
            None => {
                shared.history.append(Role::User, content, None);
            }
        }

        let request_id = RequestId::new();
        {
            let mut metrics = shared.metrics();
            metrics.reset();
            metrics.start();
        }

        let body = ChatRequestBody::from_history(
            request_id.clone(),
            &settings,
            model,
            &shared.history.snapshot(),
        );
        log_request_summary(&body, settings.stream);

        let cancel = CancellationToken::new();
        let sync = if settings.stream {
            shared.history.append(Role::Assistant, "", None);
            Some(RenderSync::new(
                shared.history.clone(),
                shared.config.flush_interval,
            ))
        } else {
            None
        };

        *slot = Some(ActiveSession {
            request_id: request_id.clone(),
            cancel: cancel.clone(),
            sync: sync.clone(),
            words: RunningWordCount::new(),
        });
        shared.status.send_modify(|s| {
            s.state = RequestState::Sending;
            s.active_request = Some(request_id.clone());
            s.last_error = None;
        });
        drop(slot);

        let span = info_span!("request", rid = %request_id.short());
        let join = if sync.is_some() {
            tokio::spawn(
                StreamHandler::run(shared.clone(), request_id.clone(), cancel, body)
                    .instrument(span),
            )
        } else {
            tokio::spawn(
                run_buffered(shared.clone(), request_id.clone(), cancel, body).instrument(span),
            )
        };

        Ok(RequestHandle { request_id, join })
    }

    /// Stops the active request, if any. Returns whether one was stopped.
    pub async fn stop(&self) -> bool {
        let shared = &self.shared;
        let request_id = {
            let mut slot = shared.session();
            let Some(session) = slot.take() else {
                debug!("stop() with no active request");
                return false;
            };
            session.cancel.cancel();

            match &session.sync {
                Some(sync) => {
                    let suffix = if sync.finish().is_empty() {
                        STOPPED_SUFFIX.trim_start()
                    } else {
                        STOPPED_SUFFIX
                    };
                    shared.history.append_to_last_assistant(suffix);
                }
                None => {
                    shared
                        .history
                        .append(Role::Assistant, STOPPED_SUFFIX.trim_start(), None);
                }
            }
            let update = shared.close_metrics(false);
            shared.history.attach_metrics(&update);

            info!("[🖥️ ] Stopped request {}", session.request_id.short());
            shared.settle(RequestOutcome::Aborted, None);
            session.request_id
        };

        if let Err(e) = shared.transport.notify_stop(&request_id).await {
            warn!(
                "[🖥️  -> ☁️ ] Stop notification for {} failed: {}",
                request_id.short(),
                e
            );
        }
        true
    }
}

impl ControllerShared {
    fn session(&self) -> MutexGuard<'_, Option<ActiveSession>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn metrics(&self) -> MutexGuard<'_, PerformanceMetrics> {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn parser(&self) -> &ParserWorker {
        self.parser
            .get_or_init(|| ParserWorker::spawn(self.config.parser_queue_depth))
    }

    fn reject(&self, reason: &str) -> crate::types::ObservedError {
        let err = ChatError::Validation(reason.to_string());
        warn!("Rejected submit: {}", err);
        let message = err.to_string();
        self.status.send_modify(|s| s.last_error = Some(message));
        err.into()
    }

    fn take_current(
        slot: &mut Option<ActiveSession>,
        request_id: &RequestId,
    ) -> Option<ActiveSession> {
        let is_current = slot
            .as_ref()
            .map(|s| &s.request_id == request_id)
            .unwrap_or(false);
        if is_current {
            slot.take()
        } else {
            None
        }
    }

    /// Publishes the terminal outcome and returns the controller to idle.
    fn settle(&self, outcome: RequestOutcome, error: Option<String>) -> RequestOutcome {
        let published = outcome.clone();
        self.status.send_modify(|s| {
            s.state = RequestState::Idle;
            s.active_request = None;
            s.last_error = error;
            s.last_outcome = Some(published);
        });
        outcome
    }

    fn close_metrics(&self, error: bool) -> MetricsUpdate {
        match self.metrics().finish(error) {
            Ok(m) => m.into(),
            Err(e) => {
                debug!("Metrics already closed: {}", e);
                MetricsUpdate::completed(error)
            }
        }
    }

    /// Advances the accumulator. The snapshot is returned rather than written
    /// so it reaches history together with the content it describes.
    fn record_progress(
        &self,
        estimate: u32,
        usage: Option<crate::types::UsageInfo>,
        finish_reason: Option<String>,
    ) -> Option<MetricsUpdate> {
        match self.metrics().update(estimate, false, usage, finish_reason) {
            Ok(m) => Some(m.into()),
            Err(e) => {
                debug!("Skipping metrics update: {}", e);
                None
            }
        }
    }

    /// Implicit client-side abort of whatever is still running.
    fn retire_locked(&self, slot: &mut Option<ActiveSession>) {
        let Some(previous) = slot.take() else {
            return;
        };
        info!(
            "[🖥️ ] Retiring request {} before starting a new one",
            previous.request_id.short()
        );
        previous.cancel.cancel();
        if let Some(sync) = previous.sync {
            sync.finish();
            let update = self.close_metrics(false);
            self.history.attach_metrics(&update);
        }
    }

    pub(crate) fn mark_streaming(&self, request_id: &RequestId) -> bool {
        let slot = self.session();
        match slot.as_ref() {
            Some(s) if &s.request_id == request_id => {
                self.status.send_modify(|s| s.state = RequestState::Streaming);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn apply_frames(
        &self,
        request_id: &RequestId,
        frames: Vec<StreamFrame>,
    ) -> FrameFlow {
        let mut slot = self.session();
        let is_current = slot
            .as_ref()
            .is_some_and(|s| &s.request_id == request_id && s.sync.is_some());
        if !is_current {
            debug!(
                "Discarding {} frames from stale request {}",
                frames.len(),
                request_id.short()
            );
            return FrameFlow::Stale;
        }

        for frame in frames {
            match frame {
                StreamFrame::ContentDelta { text } => {
                    let Some(session) = slot.as_mut() else {
                        return FrameFlow::Stale;
                    };
                    let estimate = session.words.push(&text);
                    let update = self.record_progress(estimate, None, None);
                    if let Some(sync) = &session.sync {
                        sync.push(&text, update);
                    }
                }
                StreamFrame::UsageReport {
                    usage,
                    finish_reason,
                } => {
                    let Some(session) = slot.as_ref() else {
                        return FrameFlow::Stale;
                    };
                    let estimate = session.words.total();
                    let update = self.record_progress(estimate, Some(usage), finish_reason);
                    if let Some(sync) = &session.sync {
                        sync.push("", update);
                    }
                }
                StreamFrame::Done => {
                    return FrameFlow::Finished(self.complete_stream_locked(&mut slot, request_id));
                }
                StreamFrame::ServerError { message } => {
                    return FrameFlow::Finished(self.fail_locked(
                        &mut slot,
                        request_id,
                        ChatError::ServerReported(message),
                    ));
                }
            }
        }
        FrameFlow::Continue
    }

    pub(crate) fn complete_stream(&self, request_id: &RequestId) -> RequestOutcome {
        let mut slot = self.session();
        self.complete_stream_locked(&mut slot, request_id)
    }

    fn complete_stream_locked(
        &self,
        slot: &mut Option<ActiveSession>,
        request_id: &RequestId,
    ) -> RequestOutcome {
        let Some(session) = Self::take_current(slot, request_id) else {
            return RequestOutcome::Aborted;
        };
        let content = match session.sync {
            Some(sync) => sync.finish(),
            None => String::new(),
        };
        let estimate = session.words.total();
        let update = match self.metrics().update(estimate, true, None, None) {
            Ok(m) => m.into(),
            Err(e) => {
                debug!("Final metrics update skipped: {}", e);
                MetricsUpdate::completed(false)
            }
        };
        self.history.attach_metrics(&update);

        info!(
            "[☁️  -> 🖥️ ] Request {} completed ({} chars)",
            request_id.short(),
            content.len()
        );
        self.settle(RequestOutcome::Completed, None)
    }

    pub(crate) fn fail(&self, request_id: &RequestId, err: ChatError) -> RequestOutcome {
        let mut slot = self.session();
        self.fail_locked(&mut slot, request_id, err)
    }

    fn fail_locked(
        &self,
        slot: &mut Option<ActiveSession>,
        request_id: &RequestId,
        err: ChatError,
    ) -> RequestOutcome {
        let Some(session) = Self::take_current(slot, request_id) else {
            debug!(
                "Ignoring failure of inactive request {}: {}",
                request_id.short(),
                err
            );
            return RequestOutcome::Aborted;
        };
        session.cancel.cancel();
        let message = err.to_string();
        error!(
            "[☁️  -> 🖥️ ] Request {} failed: {}",
            request_id.short(),
            message
        );

        match session.sync {
            Some(sync) => {
                let partial = sync.finish();
                let content = if partial.trim().is_empty() {
                    message.clone()
                } else {
                    format!("{}\n\n{}", partial, message)
                };
                self.history.update_last_assistant_content(&content);
                let update = self.close_metrics(true);
                self.history.attach_metrics(&update);
            }
            None => {
                let update = self.close_metrics(true);
                if matches!(err, ChatError::ServerReported(_)) {
                    self.history.append(Role::Assistant, message.clone(), None);
                    self.history.attach_metrics(&update);
                } else {
                    self.history.append(Role::Error, message.clone(), None);
                }
            }
        }

        self.settle(RequestOutcome::Errored(message.clone()), Some(message))
    }

    fn complete_buffered(&self, request_id: &RequestId, reply: BufferedReply) -> RequestOutcome {
        let mut slot = self.session();
        if Self::take_current(&mut slot, request_id).is_none() {
            return RequestOutcome::Aborted;
        }
        let estimate = TokenEstimator::estimate_text_tokens(&reply.content);
        let update = match self
            .metrics()
            .update(estimate, true, reply.usage, reply.finish_reason)
        {
            Ok(m) => m.into(),
            Err(e) => {
                debug!("Final metrics update skipped: {}", e);
                MetricsUpdate::completed(false)
            }
        };
        info!(
            "[☁️  -> 🖥️ ] Request {} completed ({} chars, buffered)",
            request_id.short(),
            reply.content.len()
        );
        self.history.append(Role::Assistant, reply.content, None);
        self.history.attach_metrics(&update);
        self.settle(RequestOutcome::Completed, None)
    }
}

async fn run_buffered(
    shared: Arc<ControllerShared>,
    request_id: RequestId,
    cancel: CancellationToken,
    body: ChatRequestBody,
) -> RequestOutcome {
    let window = shared.config.inactivity_timeout;
    let policy = shared.config.retry;

    let fetched = tokio::select! {
        biased;
        _ = cancel.cancelled() => return RequestOutcome::Aborted,
        r = tokio::time::timeout(
            window,
            fetch_with_retry(shared.transport.as_ref(), &body, &policy, &cancel),
        ) => r,
    };

    match fetched {
        Ok(Ok(reply)) => shared.complete_buffered(&request_id, reply),
        Ok(Err(e)) if matches!(e.inner, ChatError::Aborted) => RequestOutcome::Aborted,
        Ok(Err(e)) => shared.fail(&request_id, e.into_inner()),
        Err(_) => shared.fail(&request_id, ChatError::Timeout(window)),
    }
}
