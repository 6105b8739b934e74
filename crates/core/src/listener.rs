//! Subscription registry for observer callbacks
//!
//! Listeners are stored behind `Arc` and notified from a snapshot taken
//! under a short read lock. The lock is released before any callback runs,
//! so a listener may subscribe, unsubscribe or call back into the component
//! that notified it without deadlocking.
//!
//! A panicking listener is logged and skipped; it never takes down the
//! thread that delivered the event.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::error;

/// Identifier of one subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

trait Unsubscribe: Send + Sync {
    fn unsubscribe(&self, id: SubscriptionId) -> bool;
}

struct RegistryInner<L: ?Sized> {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(SubscriptionId, Arc<L>)>>,
}

impl<L: ?Sized + Send + Sync> Unsubscribe for RegistryInner<L> {
    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }
}

/// Handle returned by [`ListenerRegistry::subscribe`].
///
/// Dropping the handle leaves the listener registered; call
/// [`Subscription::unsubscribe`] to remove it.
pub struct Subscription {
    id: SubscriptionId,
    registry: Weak<dyn Unsubscribe>,
}

impl Subscription {
    /// The subscription's identifier
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Remove the listener. Returns `false` if it was already gone.
    pub fn unsubscribe(self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => registry.unsubscribe(self.id),
            None => false,
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// Registry of listeners of type `L` (usually a trait object).
pub struct ListenerRegistry<L: ?Sized> {
    inner: Arc<RegistryInner<L>>,
}

impl<L: ?Sized + Send + Sync + 'static> ListenerRegistry<L> {
    /// Empty registry
    pub fn new() -> Self {
        ListenerRegistry {
            inner: Arc::new(RegistryInner {
                next_id: AtomicU64::new(1),
                listeners: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Register a listener
    pub fn subscribe(&self, listener: Arc<L>) -> Subscription {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.listeners.write().push((id, listener));
        let inner: Arc<dyn Unsubscribe> = self.inner.clone();
        Subscription {
            id,
            registry: Arc::downgrade(&inner),
        }
    }

    /// Remove a listener by id. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.unsubscribe(id)
    }

    /// Number of registered listeners
    pub fn len(&self) -> usize {
        self.inner.listeners.read().len()
    }

    /// True if nobody is listening
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call `f` for every listener, outside the registry lock.
    pub fn notify(&self, f: impl Fn(&L)) {
        let snapshot: Vec<Arc<L>> = self
            .inner
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in snapshot {
            let outcome =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(listener.as_ref())));
            if let Err(e) = outcome {
                error!(
                    target: "backfill::listener",
                    "listener panicked: {:?}",
                    e.downcast_ref::<&str>().copied().unwrap_or("(non-string panic)")
                );
            }
        }
    }
}

impl<L: ?Sized + Send + Sync + 'static> Default for ListenerRegistry<L> {
    fn default() -> Self {
        Self::new()
    }
}
