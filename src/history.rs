//! History Store
//!
//! Ordered log of chat messages. One `watch` channel is the single source of
//! truth: renders subscribe to it, the controller reads it synchronously.

use crate::types::{Message, MessageContent, Metrics, MetricsUpdate, Role};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

pub type History = Vec<Arc<Message>>;

#[derive(Clone)]
pub struct HistoryStore {
    inner: Arc<HistoryInner>,
}

struct HistoryInner {
    tx: watch::Sender<History>,
    revision: AtomicU64,
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl HistoryStore {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Vec::new());
        Self {
            inner: Arc::new(HistoryInner {
                tx,
                revision: AtomicU64::new(0),
            }),
        }
    }

    fn mutate<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut History) -> bool,
    {
        let changed = self.inner.tx.send_if_modified(f);
        if changed {
            self.inner.revision.fetch_add(1, Ordering::Relaxed);
        }
        changed
    }

    /// Latest state, independent of any render having happened.
    pub fn snapshot(&self) -> History {
        self.inner.tx.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.tx.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<Arc<Message>> {
        self.inner.tx.borrow().get(index).cloned()
    }

    pub fn last(&self) -> Option<Arc<Message>> {
        self.inner.tx.borrow().last().cloned()
    }

    /// Number of observable mutations so far.
    pub fn revision(&self) -> u64 {
        self.inner.revision.load(Ordering::Relaxed)
    }

    pub fn subscribe(&self) -> watch::Receiver<History> {
        self.inner.tx.subscribe()
    }

    pub fn updates(&self) -> WatchStream<History> {
        WatchStream::new(self.subscribe())
    }

    pub fn append(
        &self,
        role: Role,
        content: impl Into<MessageContent>,
        metrics: Option<Metrics>,
    ) -> Arc<Message> {
        let mut message = Message::new(role, content);
        message.metrics = metrics;
        self.push(message)
    }

    /// Appends a prepared message, keeping its id unless it has none.
    pub fn push(&self, mut message: Message) -> Arc<Message> {
        if message.unique_id.is_empty() {
            message.unique_id = crate::types::new_message_id();
        }
        let message = Arc::new(message);
        let stored = message.clone();
        self.mutate(move |h| {
            h.push(stored);
            true
        });
        message
    }

    /// Drops every entry at or after `index` and appends `message`.
    /// Entries below `index` are left untouched.
    pub fn truncate_and_replace(&self, index: usize, mut message: Message) -> Arc<Message> {
        if message.unique_id.is_empty() {
            message.unique_id = crate::types::new_message_id();
        }
        let message = Arc::new(message);
        let stored = message.clone();
        self.mutate(move |h| {
            if index < h.len() {
                h.truncate(index);
            }
            h.push(stored);
            true
        });
        message
    }

    /// Replaces the trailing assistant message's content. Returns `false`
    /// without notifying subscribers when there is nothing to change.
    pub fn update_last_assistant_content(&self, content: &str) -> bool {
        self.update_last_assistant(Some(content), None)
    }

    /// Applies a content replacement and a metrics merge to the trailing
    /// assistant message as one observable mutation.
    pub fn update_last_assistant(
        &self,
        content: Option<&str>,
        metrics: Option<&MetricsUpdate>,
    ) -> bool {
        self.mutate(|h| match h.last_mut() {
            Some(last) if last.role == Role::Assistant => {
                let content_changed = content.is_some_and(|c| last.content.as_text() != c);
                let metrics_changed = metrics.is_some_and(|u| merged_differs(&**last, u));
                if !content_changed && !metrics_changed {
                    return false;
                }
                let message = Arc::make_mut(last);
                if let (true, Some(c)) = (content_changed, content) {
                    message.content = MessageContent::Text(c.to_string());
                }
                if let (true, Some(u)) = (metrics_changed, metrics) {
                    merge_metrics(message, u);
                }
                true
            }
            _ => false,
        })
    }

    pub fn append_to_last_assistant(&self, suffix: &str) -> bool {
        self.mutate(|h| match h.last_mut() {
            Some(last) if last.role == Role::Assistant && !suffix.is_empty() => {
                Arc::make_mut(last).content.push_str(suffix);
                true
            }
            _ => false,
        })
    }

    /// Merges `update` into the trailing assistant message's metrics.
    pub fn attach_metrics(&self, update: &MetricsUpdate) -> bool {
        self.update_last_assistant(None, Some(update))
    }

    /// Full reset, used by the "new chat" action of the UI.
    pub fn clear(&self) {
        self.mutate(|h| {
            let had_entries = !h.is_empty();
            h.clear();
            had_entries
        });
    }
}

fn merged_differs(message: &Message, update: &MetricsUpdate) -> bool {
    match &message.metrics {
        Some(existing) => {
            let mut merged = existing.clone();
            merged.merge(update);
            merged != *existing
        }
        None => true,
    }
}

fn merge_metrics(message: &mut Message, update: &MetricsUpdate) {
    message
        .metrics
        .get_or_insert_with(Metrics::default)
        .merge(update);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(n: usize) -> HistoryStore {
        let store = HistoryStore::new();
        for i in 0..n {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            store.append(role, format!("m{}", i), None);
        }
        store
    }

    #[test]
    fn test_append_generates_ids() {
        let store = HistoryStore::new();
        let a = store.append(Role::User, "a", None);
        let b = store.append(Role::User, "b", None);
        assert_ne!(a.unique_id, b.unique_id);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_push_keeps_existing_id() {
        let store = HistoryStore::new();
        let mut msg = Message::new(Role::User, "x");
        msg.unique_id = "keep-me".into();
        assert_eq!(store.push(msg).unique_id, "keep-me");
    }

    #[test]
    fn test_truncate_and_replace_keeps_prefix_references() {
        let store = seeded(5);
        let before = store.snapshot();
        store.truncate_and_replace(2, Message::new(Role::User, "edited"));
        let after = store.snapshot();
        assert_eq!(after.len(), 3);
        for i in 0..2 {
            assert!(Arc::ptr_eq(&before[i], &after[i]));
        }
        assert_eq!(after[2].text(), "edited");
    }

    #[test]
    fn test_update_is_idempotent() {
        let store = seeded(2);
        let mut rx = store.subscribe();
        rx.borrow_and_update();
        let rev = store.revision();

        assert!(store.update_last_assistant_content("same"));
        assert!(!store.update_last_assistant_content("same"));
        assert_eq!(store.revision(), rev + 1);
        assert!(rx.has_changed().unwrap());
    }

    #[test]
    fn test_update_skips_non_assistant_tail() {
        let store = seeded(1);
        assert!(!store.update_last_assistant_content("nope"));
        assert_eq!(store.last().unwrap().text(), "m0");
    }

    #[test]
    fn test_content_and_metrics_land_in_one_revision() {
        let store = seeded(2);
        let rev = store.revision();
        let update = MetricsUpdate {
            token_count: Some(3),
            ..MetricsUpdate::default()
        };
        assert!(store.update_last_assistant(Some("a b c"), Some(&update)));
        assert_eq!(store.revision(), rev + 1);
        assert!(!store.update_last_assistant(Some("a b c"), Some(&update)));
        assert_eq!(store.revision(), rev + 1);

        let last = store.last().unwrap();
        assert_eq!(last.text(), "a b c");
        assert_eq!(last.metrics.as_ref().unwrap().token_count, 3);
    }

    #[test]
    fn test_attach_metrics_creates_then_merges() {
        let store = seeded(2);
        store.attach_metrics(&MetricsUpdate {
            completion_tokens: Some(4),
            ..MetricsUpdate::default()
        });
        store.attach_metrics(&MetricsUpdate::completed(false));
        let metrics = store.last().unwrap().metrics.clone().unwrap();
        assert_eq!(metrics.completion_tokens, 4);
        assert!(metrics.is_complete);
    }

    #[test]
    fn test_edit_leaves_old_snapshot_intact() {
        let store = seeded(2);
        let old = store.snapshot();
        store.update_last_assistant_content("changed");
        assert_eq!(old[1].text(), "m1");
        assert_eq!(store.last().unwrap().text(), "changed");
    }
}
