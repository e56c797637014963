use crate::controller::{ControllerShared, FrameFlow, RequestOutcome};
use crate::frame_parser::FrameCarry;
use crate::logging::StreamTally;
use crate::transport::ChatRequestBody;
use crate::types::{ChatError, RequestId};
use futures_util::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Drives one SSE response: bytes are carried to frame boundaries, parsed
/// on the worker, then applied through the controller.
pub(crate) struct StreamHandler;

impl StreamHandler {
    pub(crate) async fn run(
        shared: Arc<ControllerShared>,
        request_id: RequestId,
        cancel: CancellationToken,
        body: ChatRequestBody,
    ) -> RequestOutcome {
        let window = shared.config.inactivity_timeout;
        let mut tally = StreamTally::new();

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return RequestOutcome::Aborted,
            r = tokio::time::timeout(window, shared.transport.open_stream(&body)) => r,
        };
        let mut stream = match opened {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return shared.fail(&request_id, e.into_inner()),
            Err(_) => return shared.fail(&request_id, ChatError::Timeout(window)),
        };

        if !shared.mark_streaming(&request_id) {
            return RequestOutcome::Aborted;
        }
        tracing::debug!("[☁️  -> 🖥️ ] Stream open for {}", request_id.short());

        let mut carry = FrameCarry::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tally.log_summary(&request_id);
                    return RequestOutcome::Aborted;
                }
                r = tokio::time::timeout(window, stream.next()) => r,
            };

            let (text, ended) = match next {
                Err(_) => {
                    tally.log_summary(&request_id);
                    return shared.fail(&request_id, ChatError::Timeout(window));
                }
                Ok(Some(Err(e))) => {
                    tally.log_summary(&request_id);
                    return shared.fail(&request_id, e.into_inner());
                }
                Ok(Some(Ok(bytes))) => {
                    tally.record_chunk(bytes.len());
                    match carry.push(&bytes) {
                        Some(text) => (text, false),
                        None => continue,
                    }
                }
                Ok(None) => (carry.finish().unwrap_or_default(), true),
            };

            if !text.is_empty() {
                let batch = match shared.parser().parse(&request_id, text).await {
                    Ok(batch) => batch,
                    Err(e) => return shared.fail(&request_id, e.into_inner()),
                };
                tally.record_batch(&batch.parsed);

                match shared.apply_frames(&batch.request_id, batch.parsed.frames) {
                    FrameFlow::Continue => {}
                    FrameFlow::Finished(outcome) => {
                        tally.log_summary(&request_id);
                        return outcome;
                    }
                    FrameFlow::Stale => return RequestOutcome::Aborted,
                }
            }

            if ended {
                tracing::warn!(
                    "[☁️  -> 🖥️ ] Stream for {} ended without {}",
                    request_id.short(),
                    crate::constants::DONE_SENTINEL
                );
                tally.log_summary(&request_id);
                return shared.complete_stream(&request_id);
            }
        }
    }
}
