//! Domain Event Bus
//!
//! Synchronous in-process pub/sub. Subscriber lists are copy-on-write:
//! `emit` iterates a snapshot, so subscribers may unsubscribe during
//! delivery. Subscriber failures are logged and never propagated.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Well-known event kinds.
pub mod kinds {
    pub const ACCOUNT_CREATED: &str = "account.created";
    pub const ACCOUNT_UPDATED: &str = "account.updated";
    pub const ACCOUNT_DELETED: &str = "account.deleted";
    pub const BALANCE_CREDITED: &str = "balance.credited";
    pub const BALANCE_DEBITED: &str = "balance.debited";
    pub const TRANSFER_COMPLETED: &str = "transfer.completed";
    pub const ESCROW_CREATED: &str = "escrow.created";
    pub const ESCROW_RELEASED: &str = "escrow.released";
    pub const ESCROW_REFUNDED: &str = "escrow.refunded";
    pub const ESCROW_EXPIRED: &str = "escrow.expired";
    pub const ESCROW_DISPUTED: &str = "escrow.disputed";
    pub const BATCH_COMPLETED: &str = "batch.completed";
    pub const PAYMENT_EXECUTED: &str = "payment.executed";
    pub const PAYMENT_FAILED: &str = "payment.failed";
}

/// A domain event delivered after the triggering transaction commits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub kind: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent {
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Subscription handle, used to unsubscribe.
pub type SubscriptionId = u64;

type Handler = Arc<dyn Fn(&DomainEvent) + Send + Sync>;

/// In-process event bus with copy-on-write subscriber lists.
pub struct EventBus {
    subscribers: RwLock<HashMap<String, Arc<Vec<(SubscriptionId, Handler)>>>>,
    next_id: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a handler for one event kind.
    pub fn subscribe<F>(&self, kind: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&DomainEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut subscribers = self.subscribers.write();
        let list = subscribers.entry(kind.to_string()).or_insert_with(|| Arc::new(Vec::new()));
        let mut next: Vec<(SubscriptionId, Handler)> = list.as_ref().clone();
        next.push((id, Arc::new(handler)));
        *list = Arc::new(next);
        id
    }

    /// Remove a handler. Unknown ids are ignored.
    pub fn unsubscribe(&self, kind: &str, id: SubscriptionId) {
        let mut subscribers = self.subscribers.write();
        if let Some(list) = subscribers.get_mut(kind) {
            let next: Vec<(SubscriptionId, Handler)> =
                list.iter().filter(|(sid, _)| *sid != id).cloned().collect();
            *list = Arc::new(next);
        }
    }

    /// Deliver an event to the snapshot of current subscribers, in
    /// subscription order. Panicking subscribers are isolated.
    pub fn emit(&self, event: DomainEvent) {
        let snapshot = {
            let subscribers = self.subscribers.read();
            subscribers.get(&event.kind).cloned()
        };

        let Some(snapshot) = snapshot else {
            return;
        };

        for (id, handler) in snapshot.iter() {
            let result = catch_unwind(AssertUnwindSafe(|| handler(&event)));
            if result.is_err() {
                tracing::warn!(kind = %event.kind, subscription = *id, "Event subscriber panicked");
            }
        }
    }

    /// Number of subscribers for one kind.
    pub fn subscriber_count(&self, kind: &str) -> usize {
        self.subscribers.read().get(kind).map(|l| l.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_emit_reaches_subscribers() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let seen_clone = seen.clone();
        bus.subscribe(kinds::TRANSFER_COMPLETED, move |_| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(DomainEvent::new(kinds::TRANSFER_COMPLETED, serde_json::json!({})));
        bus.emit(DomainEvent::new(kinds::ESCROW_RELEASED, serde_json::json!({})));

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let seen_clone = seen.clone();
        let id = bus.subscribe("x", move |_| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });
        bus.unsubscribe("x", id);
        bus.emit(DomainEvent::new("x", serde_json::json!({})));

        assert_eq!(seen.load(Ordering::SeqCst), 0);
        assert_eq!(bus.subscriber_count("x"), 0);
    }

    #[test]
    fn test_panicking_subscriber_is_isolated() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));

        bus.subscribe("x", |_| panic!("subscriber bug"));
        let seen_clone = seen.clone();
        bus.subscribe("x", move |_| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(DomainEvent::new("x", serde_json::json!({})));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_mid_delivery() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(AtomicUsize::new(0));

        let bus_clone = bus.clone();
        let seen_clone = seen.clone();
        let id = Arc::new(AtomicU64::new(0));
        let id_clone = id.clone();
        let sub = bus.subscribe("x", move |_| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
            bus_clone.unsubscribe("x", id_clone.load(Ordering::SeqCst));
        });
        id.store(sub, Ordering::SeqCst);

        bus.emit(DomainEvent::new("x", serde_json::json!({})));
        bus.emit(DomainEvent::new("x", serde_json::json!({})));

        // Second emit sees the post-unsubscribe snapshot.
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
