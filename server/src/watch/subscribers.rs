//! Subscriber set of a registry entry.
//!
//! Each subscriber is an unbounded channel feeding one streaming response.
//! The same [`Subscriber`] can sit in several entries at once (the global
//! stream attaches one subscriber to every root); it is identified by its
//! [`SubscriberId`] when detaching.
//!
//! # Thread Safety
//!
//! The set is guarded by a `std::sync::Mutex` that is only held for map
//! operations and channel sends, never across an `.await`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::trace;

use crate::types::ChangeEvent;

/// Identifier of a subscriber, unique for the process lifetime.
pub type SubscriberId = u64;

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Sending half of a subscriber's event channel.
#[derive(Debug, Clone)]
pub struct Subscriber {
    id: SubscriberId,
    sender: mpsc::UnboundedSender<ChangeEvent>,
}

impl Subscriber {
    /// Creates a subscriber and the receiver its stream reads from.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ChangeEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed);
        (Self { id, sender }, receiver)
    }

    #[must_use]
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Delivers one event. Returns `false` if the receiver is gone.
    pub fn deliver(&self, event: ChangeEvent) -> bool {
        self.sender.send(event).is_ok()
    }
}

/// The subscribers attached to one registry entry.
#[derive(Debug, Default)]
pub struct SubscriberSet {
    subscribers: Mutex<HashMap<SubscriberId, Subscriber>>,
}

impl SubscriberSet {
    fn lock(&self) -> MutexGuard<'_, HashMap<SubscriberId, Subscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a subscriber. Returns `false` if it was already present.
    pub fn insert(&self, subscriber: Subscriber) -> bool {
        self.lock().insert(subscriber.id, subscriber).is_none()
    }

    /// Removes a subscriber. Returns `true` if it was present.
    pub fn remove(&self, id: SubscriberId) -> bool {
        self.lock().remove(&id).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Sends `event` to every subscriber; returns how many accepted it.
    ///
    /// Subscribers whose receiver is gone stay in the set; their stream's
    /// drop guard detaches them.
    pub fn broadcast(&self, event: &ChangeEvent) -> usize {
        let subscribers = self.lock();
        let mut delivered = 0;
        for subscriber in subscribers.values() {
            if subscriber.deliver(event.clone()) {
                delivered += 1;
            } else {
                trace!(subscriber_id = subscriber.id, "Subscriber receiver closed");
            }
        }
        delivered
    }
}
