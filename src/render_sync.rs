//! Render Synchronization Layer
//!
//! Buffers content deltas and metrics snapshots and writes them into the
//! history store together, at most once per flush interval. `finish` always
//! writes the tail.

use crate::history::HistoryStore;
use crate::types::MetricsUpdate;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Clone)]
pub struct RenderSync {
    inner: Arc<SyncInner>,
}

struct SyncInner {
    store: HistoryStore,
    interval: Duration,
    state: Mutex<SyncState>,
}

#[derive(Default)]
struct SyncState {
    content: String,
    dirty: bool,
    pending_metrics: Option<MetricsUpdate>,
    last_flush: Option<Instant>,
    timer_armed: bool,
    closed: bool,
    flushes: u64,
}

impl SyncInner {
    fn lock(&self) -> MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn flush_locked(&self, st: &mut SyncState) {
        if !st.dirty && st.pending_metrics.is_none() {
            return;
        }
        let content = st.dirty.then_some(st.content.as_str());
        self.store
            .update_last_assistant(content, st.pending_metrics.as_ref());
        st.dirty = false;
        st.pending_metrics = None;
        st.last_flush = Some(Instant::now());
        st.flushes += 1;
    }
}

impl RenderSync {
    pub fn new(store: HistoryStore, interval: Duration) -> Self {
        Self {
            inner: Arc::new(SyncInner {
                store,
                interval,
                state: Mutex::new(SyncState::default()),
            }),
        }
    }

    /// Buffers `delta` and, if given, the latest metrics snapshot. The
    /// snapshot replaces any unflushed one. Must be called from within a
    /// tokio runtime.
    pub fn push(&self, delta: &str, metrics: Option<MetricsUpdate>) {
        let mut st = self.inner.lock();
        if st.closed || (delta.is_empty() && metrics.is_none()) {
            return;
        }
        if !delta.is_empty() {
            st.content.push_str(delta);
            st.dirty = true;
        }
        if metrics.is_some() {
            st.pending_metrics = metrics;
        }

        let wait = match st.last_flush {
            Some(at) => self.inner.interval.saturating_sub(at.elapsed()),
            None => Duration::ZERO,
        };
        if wait.is_zero() {
            self.inner.flush_locked(&mut st);
        } else if !st.timer_armed {
            st.timer_armed = true;
            let inner = self.inner.clone();
            tokio::spawn(async move {
                tokio::time::sleep(wait).await;
                let mut st = inner.lock();
                st.timer_armed = false;
                if !st.closed {
                    inner.flush_locked(&mut st);
                }
            });
        }
    }

    /// Writes any buffered tail synchronously and stops accepting deltas.
    /// Returns the full accumulated content.
    pub fn finish(&self) -> String {
        let mut st = self.inner.lock();
        if !st.closed {
            self.inner.flush_locked(&mut st);
            st.closed = true;
        }
        st.content.clone()
    }

    #[cfg(test)]
    fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    #[cfg(test)]
    fn flush_count(&self) -> u64 {
        self.inner.lock().flushes
    }
}
