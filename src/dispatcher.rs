//! An in-process, one-to-many event broadcaster.
//!
//! [`Dispatcher`] keeps a registry of subscribers, each with its own bounded queue.
//! [`Dispatcher::dispatch`] never waits: a subscriber whose queue is full misses the event,
//! a subscriber that went away is pruned from the registry.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc::{self, error::TrySendError};

/// Default capacity of each subscriber queue.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 16;

type Registry<E> = Mutex<HashMap<u64, mpsc::Sender<E>>>;

/// Broadcasts events of type `E` to all current subscribers.
///
/// Subscribing, unsubscribing and dispatching can all happen concurrently: the registry is
/// guarded by a single mutex and dispatching is non-blocking, so the lock is only ever held
/// for the time it takes to enqueue an event in each subscriber queue.
pub struct Dispatcher<E> {
    subscribers: Arc<Registry<E>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl<E: Clone + Send + 'static> Dispatcher<E> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    /// Create a dispatcher where every subscriber can buffer up to `capacity` undelivered events.
    ///
    /// The minimum capacity is 1 (clamped).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            capacity: capacity.max(1),
        }
    }

    /// Register a new subscriber.
    ///
    /// The subscriber observes events dispatched _after_ this call returns.
    pub fn add_subscriber(&self) -> Subscription<E> {
        let (sender, receiver) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.subscribers).insert(id, sender);
        Subscription {
            id,
            receiver,
            registry: Arc::downgrade(&self.subscribers),
        }
    }

    /// Deliver `event` to every registered subscriber.
    ///
    /// Returns the number of subscribers the event was delivered to.
    pub fn dispatch(&self, event: E) -> usize {
        let mut subscribers = lock(&self.subscribers);
        let mut delivered = 0;
        subscribers.retain(|id, sender| match sender.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                tracing::debug!(subscriber = id, "Subscriber queue is full, skipping event");
                true
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(subscriber = id, "Subscriber is gone, removing it");
                false
            }
        });
        delivered
    }

    /// The number of subscribers currently registered.
    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }
}

impl<E: Clone + Send + 'static> Default for Dispatcher<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// The receiving side of a [`Dispatcher`] registration.
///
/// Dropping a `Subscription` unsubscribes it.
pub struct Subscription<E> {
    id: u64,
    receiver: mpsc::Receiver<E>,
    registry: Weak<Registry<E>>,
}

impl<E> Subscription<E> {
    /// Wait for the next event.
    ///
    /// Returns `None` once the subscription has been removed and all buffered events
    /// have been consumed, or once the [`Dispatcher`] has been dropped.
    pub async fn recv(&mut self) -> Option<E> {
        self.receiver.recv().await
    }

    /// Return the next buffered event, if any, without waiting.
    pub fn try_recv(&mut self) -> Option<E> {
        self.receiver.try_recv().ok()
    }

    /// Stop receiving events.
    ///
    /// Once this returns, the dispatcher will not deliver anything else to this subscription.
    pub fn unsubscribe(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).remove(&self.id);
        }
        self.registry = Weak::new();
        self.receiver.close();
    }
}

impl<E> Drop for Subscription<E> {
    fn drop(&mut self) {
        self.remove();
    }
}

impl<E> std::fmt::Debug for Subscription<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

// Dispatching never panics while holding the lock, but a subscriber could in theory poison it
// from `Drop`: the map is still consistent in that case.
fn lock<E>(registry: &Registry<E>) -> MutexGuard<'_, HashMap<u64, mpsc::Sender<E>>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}
