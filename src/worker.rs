use crate::frame_parser::{parse_chunk_with_stats, ParsedChunk};
use crate::types::{ChatError, RequestId, Result};
use tokio::sync::{mpsc, oneshot};

pub enum WorkerCommand {
    Parse {
        request_id: RequestId,
        chunk: String,
        resp: oneshot::Sender<ParsedBatch>,
    },
}

/// Parser output tagged with the request that produced the chunk.
#[derive(Debug, Clone)]
pub struct ParsedBatch {
    pub request_id: RequestId,
    pub parsed: ParsedChunk,
}

/// Handle to the long-lived parser task. Cloning shares the same task.
#[derive(Clone)]
pub struct ParserWorker {
    tx_cmd: mpsc::Sender<WorkerCommand>,
}

impl ParserWorker {
    /// Must be called from within a tokio runtime.
    pub fn spawn(queue_depth: usize) -> Self {
        let (tx_cmd, rx_cmd) = mpsc::channel(queue_depth.max(1));
        tokio::spawn(ParserKernel { rx_cmd }.run());
        Self { tx_cmd }
    }

    /// Posts one chunk and waits for exactly one reply.
    pub async fn parse(&self, request_id: &RequestId, chunk: String) -> Result<ParsedBatch> {
        let (resp, rx) = oneshot::channel();
        self.tx_cmd
            .send(WorkerCommand::Parse {
                request_id: request_id.clone(),
                chunk,
                resp,
            })
            .await
            .map_err(|_| ChatError::internal("parser worker is gone"))?;
        rx.await
            .map_err(|_| ChatError::internal("parser worker dropped the reply").into())
    }
}

struct ParserKernel {
    rx_cmd: mpsc::Receiver<WorkerCommand>,
}

impl ParserKernel {
    async fn run(mut self) {
        tracing::debug!("Parser worker started");
        while let Some(cmd) = self.rx_cmd.recv().await {
            match cmd {
                WorkerCommand::Parse {
                    request_id,
                    chunk,
                    resp,
                } => {
                    let parsed = parse_chunk_with_stats(&chunk);
                    // requester may have been aborted meanwhile
                    let _ = resp.send(ParsedBatch { request_id, parsed });
                }
            }
        }
        tracing::debug!("Parser worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StreamFrame;

    #[tokio::test]
    async fn test_round_trip_keeps_request_id() {
        let worker = ParserWorker::spawn(4);
        let rid = RequestId::new();
        let batch = worker
            .parse(&rid, "data: {\"content\":\"x\"}\n\ndata: [DONE]\n\n".into())
            .await
            .unwrap();
        assert_eq!(batch.request_id, rid);
        assert_eq!(
            batch.parsed.frames,
            vec![StreamFrame::ContentDelta { text: "x".into() }, StreamFrame::Done]
        );
    }

    #[tokio::test]
    async fn test_worker_is_reusable_across_requests() {
        let worker = ParserWorker::spawn(4);
        let a = RequestId::new();
        let b = RequestId::new();
        let first = worker
            .parse(&a, "data: {\"content\":\"1\"}\n\n".into())
            .await
            .unwrap();
        let second = worker
            .clone()
            .parse(&b, "data: {\"content\":\"2\"}\n\n".into())
            .await
            .unwrap();
        assert_eq!(first.request_id, a);
        assert_eq!(second.request_id, b);
        assert_eq!(
            second.parsed.frames,
            vec![StreamFrame::ContentDelta { text: "2".into() }]
        );
    }
}
