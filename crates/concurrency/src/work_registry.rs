//! Exclusive claims on keys being fetched
//!
//! A buffering round claims the keys it is about to fetch. Only keys that no
//! other in-flight round holds are granted, so a key is fetched by at most
//! one round at a time. The grant is a test-and-set performed under a single
//! mutex; the returned [`Claim`] releases its keys when dropped, whatever the
//! outcome of the round.
//!
//! Rounds that found nothing to claim can block in
//! [`WorkRegistry::wait_for_release`] until some claim is released instead
//! of sleeping for a fixed interval.

use backfill_core::Key;
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashSet;
use std::hash::Hash;
use std::time::{Duration, Instant};

struct RegistryState<K> {
    claimed: FxHashSet<K>,
    /// Bumped on every release and wake-up
    generation: u64,
}

/// Set of keys currently claimed by in-flight fetches.
pub struct WorkRegistry<K = Key> {
    state: Mutex<RegistryState<K>>,
    released: Condvar,
}

impl<K: Eq + Hash + Clone> WorkRegistry<K> {
    /// Registry with nothing claimed
    pub fn new() -> Self {
        WorkRegistry {
            state: Mutex::new(RegistryState {
                claimed: FxHashSet::default(),
                generation: 0,
            }),
            released: Condvar::new(),
        }
    }

    /// Claim every key of `keys` that is not already claimed.
    ///
    /// The granted subset keeps the input order; duplicates are granted once.
    pub fn claim(&self, keys: impl IntoIterator<Item = K>) -> Claim<'_, K> {
        let mut state = self.state.lock();
        let mut granted = Vec::new();
        for key in keys {
            if state.claimed.insert(key.clone()) {
                granted.push(key);
            }
        }
        Claim {
            registry: self,
            keys: granted,
        }
    }

    /// Unmark `keys` and wake waiters.
    pub fn release(&self, keys: &[K]) {
        if keys.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        for key in keys {
            state.claimed.remove(key);
        }
        state.generation = state.generation.wrapping_add(1);
        self.released.notify_all();
    }

    /// True if `key` is held by some claim
    pub fn is_claimed(&self, key: &K) -> bool {
        self.state.lock().claimed.contains(key)
    }

    /// Number of keys currently claimed
    pub fn claimed_count(&self) -> usize {
        self.state.lock().claimed.len()
    }

    /// Current release generation.
    ///
    /// Read it before claiming and pass it to [`wait_for_release`] so that a
    /// release happening in between is not missed.
    ///
    /// [`wait_for_release`]: WorkRegistry::wait_for_release
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Block until the generation moves past `seen` or `timeout` elapses.
    ///
    /// Returns `true` if woken by a release (or [`wake_all`]).
    ///
    /// [`wake_all`]: WorkRegistry::wake_all
    pub fn wait_for_release(&self, seen: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.generation == seen {
            if self.released.wait_until(&mut state, deadline).timed_out() {
                return state.generation != seen;
            }
        }
        true
    }

    /// Wake every waiter without releasing anything (used on stop).
    pub fn wake_all(&self) {
        let mut state = self.state.lock();
        state.generation = state.generation.wrapping_add(1);
        self.released.notify_all();
    }
}

impl<K: Eq + Hash + Clone> Default for WorkRegistry<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Keys granted by [`WorkRegistry::claim`]; released on drop.
pub struct Claim<'a, K: Eq + Hash + Clone> {
    registry: &'a WorkRegistry<K>,
    keys: Vec<K>,
}

impl<K: Eq + Hash + Clone> Claim<'_, K> {
    /// The granted keys
    pub fn keys(&self) -> &[K] {
        &self.keys
    }

    /// True if nothing was granted
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Number of granted keys
    pub fn len(&self) -> usize {
        self.keys.len()
    }
}

impl<K: Eq + Hash + Clone> Drop for Claim<'_, K> {
    fn drop(&mut self) {
        self.registry.release(&self.keys);
    }
}
