// ===============================
// src/stream.rs (publish/subscribe for user events)
// ===============================
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;

use crate::account::BalanceUpdate;
use crate::domain::Trade;

/// Events pushed by the live user-data feed.
#[derive(Debug, Clone, PartialEq)]
pub enum UserEvent {
    Trade(Trade),
    Balances(BalanceUpdate),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Removable subscriptions; handlers run on the publishing task.
pub struct EventHub<E> {
    next_id: AtomicU64,
    handlers: RwLock<AHashMap<SubscriptionId, Handler<E>>>,
}

impl<E> Default for EventHub<E> {
    fn default() -> Self {
        Self { next_id: AtomicU64::new(1), handlers: RwLock::new(AHashMap::new()) }
    }
}

impl<E> EventHub<E> {
    pub fn new() -> Self { Self::default() }

    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().insert(id, Arc::new(handler));
        id
    }

    /// Returns false when the id was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.handlers.write().remove(&id).is_some()
    }

    pub fn subscribers(&self) -> usize { self.handlers.read().len() }

    /// Delivers `event` to every handler in subscription order.
    pub fn publish(&self, event: &E) {
        // snapshot so a handler may (un)subscribe without deadlocking
        let mut handlers: Vec<(SubscriptionId, Handler<E>)> =
            self.handlers.read().iter().map(|(id, h)| (*id, Arc::clone(h))).collect();
        handlers.sort_by_key(|(id, _)| *id);
        for (_, h) in handlers {
            h(event);
        }
    }
}

pub type UserDataStream = EventHub<UserEvent>;
