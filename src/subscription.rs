//! Subscriber bookkeeping for observers.
//!
//! [`Listeners`] keeps callbacks in subscription order and notifies them from a
//! snapshot, so a callback may subscribe or unsubscribe during notification
//! without deadlocking. A [`Subscription`] removes its callback when dropped.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Identifies one registered callback.
pub type ListenerId = u64;

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// An ordered list of callbacks.
pub(crate) struct Listeners<E> {
    callbacks: Mutex<Vec<(ListenerId, Callback<E>)>>,
    next_id: AtomicU64,
}

impl<E> Listeners<E> {
    pub(crate) fn new() -> Self {
        Self {
            callbacks: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers `callback`; returns its id and whether it is the first one.
    pub(crate) fn add(&self, callback: impl Fn(&E) + Send + Sync + 'static) -> (ListenerId, bool) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut callbacks = self.callbacks.lock();
        callbacks.push((id, Arc::new(callback)));
        (id, callbacks.len() == 1)
    }

    /// Removes `id`; returns `true` if it was the last callback.
    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut callbacks = self.callbacks.lock();
        let before = callbacks.len();
        callbacks.retain(|(lid, _)| *lid != id);
        before != callbacks.len() && callbacks.is_empty()
    }

    pub(crate) fn clear(&self) {
        self.callbacks.lock().clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.callbacks.lock().len()
    }

    /// Calls every callback in subscription order.
    pub(crate) fn emit(&self, event: &E) {
        let snapshot: Vec<Callback<E>> = {
            let guard = self.callbacks.lock();
            guard.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };
        for cb in snapshot {
            cb(event);
        }
    }
}

/// Handle for an observer subscription.
///
/// Dropping the handle unsubscribes. Call [`Subscription::detach`] to keep the
/// callback registered for the observer's lifetime.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub(crate) fn new(unsubscribe: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// Removes the callback.
    pub fn unsubscribe(mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }

    /// Keeps the callback registered after the handle is dropped.
    pub fn detach(mut self) {
        self.unsubscribe = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}
