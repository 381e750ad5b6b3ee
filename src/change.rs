//! Change tracking and observers: a broadcast of `ChangeEvent`s
//! that `observe`/`observeQuery` subscribers drain, with emitter suppression
//! so a write doesn't notify the tab/replica that made it.
//!
//! Each subscriber gets its own `futures::channel::mpsc` pair, registered
//! in a list the writer fans out to on every committed change.

use crate::id::RecordId;
use futures::channel::mpsc;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;

/// Identifies who produced a change, so subscribers can filter out their
/// own writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EmitterId(pub u64);

/// A single change to a collection.
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    /// A record was created or updated locally.
    Put {
        /// Owning collection.
        collection: String,
        /// Affected record id.
        id: RecordId,
        /// The record's new data.
        data: Value,
    },
    /// A record was tombstoned locally.
    Delete {
        /// Owning collection.
        collection: String,
        /// Affected record id.
        id: RecordId,
    },
    /// Several puts/deletes landed together.
    Bulk {
        /// Owning collection.
        collection: String,
        /// The ids touched by the bulk operation.
        ids: Vec<RecordId>,
    },
    /// A record changed because a remote peer's write was merged in.
    Remote {
        /// Owning collection.
        collection: String,
        /// Affected record id.
        id: RecordId,
        /// The merged record's new data.
        data: Value,
    },
}

impl ChangeEvent {
    /// The collection this event belongs to.
    pub fn collection(&self) -> &str {
        match self {
            ChangeEvent::Put { collection, .. }
            | ChangeEvent::Delete { collection, .. }
            | ChangeEvent::Bulk { collection, .. }
            | ChangeEvent::Remote { collection, .. } => collection,
        }
    }

    /// Whether this event affects `id`, for a single-record observer
    /// deciding whether to re-fetch.
    pub fn touches(&self, id: &RecordId) -> bool {
        match self {
            ChangeEvent::Put { id: i, .. }
            | ChangeEvent::Delete { id: i, .. }
            | ChangeEvent::Remote { id: i, .. } => i == id,
            ChangeEvent::Bulk { ids, .. } => ids.contains(id),
        }
    }
}

struct Subscription {
    emitter: Option<EmitterId>,
    collection: Option<String>,
    sender: mpsc::UnboundedSender<ChangeEvent>,
}

/// The change bus for one open database: every `put`/`patch`/`delete`/
/// `bulkPut`/`bulkDelete`/remote-merge funnels through `emit`, and every
/// `observe`/`observeQuery` call registers a subscription here.
#[derive(Default)]
pub struct ChangeBus {
    subscriptions: Mutex<Vec<Subscription>>,
}

impl ChangeBus {
    /// A fresh, empty bus.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a subscriber for every change in `collection` (or, if
    /// `None`, every collection in the database), optionally suppressing
    /// events whose `emitter` matches `suppress_emitter`.
    pub fn observe(
        &self,
        collection: Option<String>,
        suppress_emitter: Option<EmitterId>,
    ) -> mpsc::UnboundedReceiver<ChangeEvent> {
        let (sender, receiver) = mpsc::unbounded();
        self.subscriptions.lock().push(Subscription {
            emitter: suppress_emitter,
            collection,
            sender,
        });
        receiver
    }

    /// Publishes `event` from `emitter` to every subscription that wants it,
    /// dropping senders whose receiver has gone away.
    pub fn emit(&self, emitter: EmitterId, event: ChangeEvent) {
        let mut subs = self.subscriptions.lock();
        subs.retain(|sub| {
            if sub.emitter == Some(emitter) {
                return true;
            }
            if let Some(scope) = &sub.collection {
                if scope != event.collection() {
                    return true;
                }
            }
            sub.sender.unbounded_send(event.clone()).is_ok()
        });
    }

    /// Number of currently-live subscriptions, for diagnostics and tests.
    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    #[async_std::test]
    async fn observe_receives_matching_events() {
        let bus = ChangeBus::new();
        let mut rx = bus.observe(Some("users".into()), None);
        bus.emit(
            EmitterId(1),
            ChangeEvent::Put {
                collection: "users".into(),
                id: RecordId::generate(),
                data: json!({"name": "Alice"}),
            },
        );
        bus.emit(
            EmitterId(1),
            ChangeEvent::Put {
                collection: "orders".into(),
                id: RecordId::generate(),
                data: json!({}),
            },
        );
        let event = rx.next().await.unwrap();
        assert_eq!(event.collection(), "users");
    }

    #[test]
    fn emitter_suppression_filters_own_writes() {
        let bus = ChangeBus::new();
        let mut rx = bus.observe(None, Some(EmitterId(7)));
        bus.emit(
            EmitterId(7),
            ChangeEvent::Delete {
                collection: "users".into(),
                id: RecordId::generate(),
            },
        );
        assert!(rx.try_next().is_err() || rx.try_next().unwrap().is_none());
    }
}
