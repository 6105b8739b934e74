//! History store for one playback window
//!
//! # Design
//!
//! - Histories: `DashMap<Key, KeyHistory>`, so history reads only touch one
//!   shard and never wait for watermark bookkeeping
//! - Bookkeeping: watermarks, initialized set, batching depth and pending
//!   events under one `RwLock`
//! - Lock order: bookkeeping, then a history shard. Nothing takes them the
//!   other way round.
//! - Notifications are collected while the lock is held and delivered
//!   after it is released. Each batch of events carries a sequence number;
//!   delivery is serialized and a watermark older than the last delivered
//!   one is dropped, so listeners never see the watermark step back to a
//!   stale value.
//!
//! # Global watermark
//!
//! - window end when nothing is registered
//! - window start while any registered key is uninitialized
//! - otherwise the minimum per-key watermark
//!
//! While a batch is open ([`HistoryStore::set_batching`]) reads compute the
//! value from the current table but nothing is notified; closing the
//! outermost batch recomputes and notifies at most once.

use backfill_core::{
    Key, ListenerRegistry, LiveTagValue, Record, Subscription, Timespan, Timestamp,
};
use dashmap::DashMap;
use parking_lot::{ReentrantMutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use std::cell::Cell;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::history::{HistorySnapshot, KeyHistory};
use crate::listener::StoreListener;

#[derive(Default)]
struct Bookkeeping {
    watermarks: FxHashMap<Key, Timestamp>,
    /// Always a subset of the keys of `watermarks`
    initialized: FxHashSet<Key>,
    batch_depth: usize,
    dirty: bool,
    global: Option<Timestamp>,
    last_notified: Option<Timestamp>,
    fully_loaded_notified: bool,
    force_notification: bool,
    pending_initialized: Vec<Key>,
    pending_added: Vec<Key>,
    /// Incremented for every collected set of events
    sequence: u64,
}

#[derive(Default)]
struct Events {
    sequence: u64,
    watermark: Option<Timestamp>,
    fully_loaded: bool,
    initialized: Vec<Key>,
    added: Vec<Key>,
}

impl Events {
    fn is_empty(&self) -> bool {
        self.watermark.is_none()
            && !self.fully_loaded
            && self.initialized.is_empty()
            && self.added.is_empty()
    }
}

impl Bookkeeping {
    fn compute_global(&self, window: &Timespan) -> Timestamp {
        if self.watermarks.is_empty() {
            return window.end();
        }
        if self.initialized.len() < self.watermarks.len() {
            return window.start();
        }
        self.watermarks
            .values()
            .copied()
            .min()
            .unwrap_or_else(|| window.end())
    }

    fn current_global(&mut self, window: &Timespan) -> Timestamp {
        match self.global {
            Some(global) if !self.dirty => global,
            _ => {
                let global = self.compute_global(window);
                self.global = Some(global);
                self.dirty = false;
                global
            }
        }
    }

    /// Collect everything due once no batch is open.
    fn take_events(&mut self, window: &Timespan) -> Events {
        let global = self.current_global(window);
        self.sequence += 1;
        let mut events = Events {
            sequence: self.sequence,
            ..Events::default()
        };

        if self.force_notification || self.last_notified != Some(global) {
            events.watermark = Some(global);
            self.last_notified = Some(global);
        }
        self.force_notification = false;

        if global >= window.end() {
            events.fully_loaded = !self.fully_loaded_notified;
            self.fully_loaded_notified = true;
        } else {
            self.fully_loaded_notified = false;
        }

        let initialized: BTreeSet<Key> = self.pending_initialized.drain(..).collect();
        let added: BTreeSet<Key> = self.pending_added.drain(..).collect();
        events.added = added.difference(&initialized).copied().collect();
        events.initialized = initialized.into_iter().collect();
        events
    }
}

/// Per-key histories and watermarks of one playback window.
pub struct HistoryStore {
    window: Timespan,
    histories: DashMap<Key, KeyHistory>,
    book: RwLock<Bookkeeping>,
    /// Sequence number of the last delivered events. Reentrant so that a
    /// listener may call back into the store.
    delivered: ReentrantMutex<Cell<u64>>,
    listeners: ListenerRegistry<dyn StoreListener>,
}

impl HistoryStore {
    /// Empty store covering `window`
    pub fn new(window: Timespan) -> Self {
        HistoryStore {
            window,
            histories: DashMap::new(),
            book: RwLock::new(Bookkeeping::default()),
            delivered: ReentrantMutex::new(Cell::new(0)),
            listeners: ListenerRegistry::new(),
        }
    }

    /// The playback window
    pub fn window(&self) -> Timespan {
        self.window
    }

    /// Window start
    pub fn start(&self) -> Timestamp {
        self.window.start()
    }

    /// Window end
    pub fn end(&self) -> Timestamp {
        self.window.end()
    }

    /// Register a listener
    pub fn subscribe(&self, listener: Arc<dyn StoreListener>) -> Subscription {
        self.listeners.subscribe(listener)
    }

    // ========================================================================
    // Mutation
    // ========================================================================

    /// Run `f` under the bookkeeping lock, then deliver whatever became due.
    fn mutate<R>(&self, f: impl FnOnce(&mut Bookkeeping) -> R) -> R {
        let (result, events) = {
            let mut book = self.book.write();
            let result = f(&mut book);
            let events = (book.batch_depth == 0).then(|| book.take_events(&self.window));
            (result, events)
        };
        if let Some(events) = events {
            self.dispatch(events);
        }
        result
    }

    fn dispatch(&self, events: Events) {
        if events.is_empty() {
            return;
        }
        let delivered = self.delivered.lock();
        let stale = events.sequence < delivered.get();
        delivered.set(delivered.get().max(events.sequence));

        if let Some(watermark) = events.watermark {
            if stale {
                trace!(target: "backfill::store", %watermark, "stale watermark dropped");
            } else {
                debug!(target: "backfill::store", %watermark, "watermark notification");
                self.listeners.notify(|l| l.on_watermark_advanced(watermark));
            }
        }
        if events.fully_loaded {
            debug!(target: "backfill::store", window = %self.window, "fully loaded");
            self.listeners.notify(|l| l.on_fully_loaded());
        }
        if !events.initialized.is_empty() {
            self.listeners
                .notify(|l| l.on_keys_initialized(&events.initialized));
        }
        if !events.added.is_empty() {
            self.listeners.notify(|l| l.on_keys_added(&events.added));
        }
    }

    /// Insert into a key's history and queue the matching data event.
    /// Caller holds the bookkeeping lock.
    fn store_records(&self, book: &mut Bookkeeping, key: Key, records: Vec<Record>) -> usize {
        let mut history = self
            .histories
            .entry(key)
            .or_insert_with(|| KeyHistory::new(key));
        let was_empty = history.is_empty();
        let stored = history.insert(records);
        if stored > 0 {
            if was_empty {
                book.pending_initialized.push(key);
            } else {
                book.pending_added.push(key);
            }
        }
        stored
    }

    /// Group timestamped records of initialized keys by key.
    fn group_records(
        book: &Bookkeeping,
        records: impl IntoIterator<Item = Record>,
    ) -> FxHashMap<Key, Vec<Record>> {
        let mut grouped: FxHashMap<Key, Vec<Record>> = FxHashMap::default();
        for record in records {
            if record.timestamp().is_none() {
                continue;
            }
            let key = record.key();
            if book.initialized.contains(&key) {
                grouped.entry(key).or_default().push(record);
            }
        }
        grouped
    }

    /// Register keys with watermark = window start.
    ///
    /// Already registered keys are left untouched; the reserved tag id is
    /// ignored. Returns the number of newly registered keys.
    pub fn register_keys(&self, keys: &[Key]) -> usize {
        let start = self.window.start();
        self.mutate(|book| {
            let mut added = 0;
            for key in keys.iter().filter(|k| k.is_acceptable()) {
                if !book.watermarks.contains_key(key) {
                    book.watermarks.insert(*key, start);
                    added += 1;
                }
            }
            if added > 0 {
                book.dirty = true;
                debug!(target: "backfill::store", added, "registered keys");
            }
            added
        })
    }

    /// Drop all state of `keys`. Returns the number of keys removed.
    pub fn unregister_keys(&self, keys: &[Key]) -> usize {
        self.mutate(|book| {
            let mut removed = 0;
            for key in keys {
                if book.watermarks.remove(key).is_some() {
                    removed += 1;
                }
                book.initialized.remove(key);
                self.histories.remove(key);
            }
            if removed > 0 {
                book.dirty = true;
                debug!(target: "backfill::store", removed, "unregistered keys");
            }
            removed
        })
    }

    /// Mark registered `keys` initialized and store their starting records.
    ///
    /// Unregistered keys are ignored. Returns the number of records stored.
    pub fn add_initial_records(&self, keys: &[Key], records: Vec<Record>) -> usize {
        let start = self.window.start();
        self.mutate(|book| {
            for key in keys {
                if let Some(watermark) = book.watermarks.get_mut(key) {
                    *watermark = (*watermark).max(start);
                    book.initialized.insert(*key);
                    book.dirty = true;
                }
            }
            let mut stored = 0;
            for (key, records) in Self::group_records(book, records) {
                stored += self.store_records(book, key, records);
            }
            stored
        })
    }

    /// Store fetched records and advance the watermark of `keys` to `until`.
    ///
    /// Records without a timestamp and records of uninitialized or
    /// unregistered keys are dropped. Watermarks never move backwards.
    /// Returns the number of records stored.
    pub fn add_records(&self, keys: &[Key], records: Vec<Record>, until: Timestamp) -> usize {
        self.mutate(|book| {
            let mut stored = 0;
            for (key, records) in Self::group_records(book, records) {
                stored += self.store_records(book, key, records);
            }
            for key in keys {
                if !book.initialized.contains(key) {
                    continue;
                }
                if let Some(watermark) = book.watermarks.get_mut(key) {
                    if until > *watermark {
                        *watermark = until;
                        book.dirty = true;
                    }
                }
            }
            trace!(target: "backfill::store", keys = keys.len(), stored, %until, "records added");
            stored
        })
    }

    /// Take live values as history where possible.
    ///
    /// A tag whose live value predates the window start cannot change
    /// inside the window: it is registered, initialized with that value and
    /// marked fully loaded. Returns the tags that still need fetching:
    /// those unknown on the live side and unregistered ones with a recent
    /// live value.
    pub fn register_live_values(&self, values: &[LiveTagValue]) -> Vec<Key> {
        let (start, end) = (self.window.start(), self.window.end());
        self.mutate(|book| {
            let mut must_fetch = BTreeSet::new();
            for value in values {
                let key = Key::tag(value.update.tag_id);
                if !key.is_acceptable() {
                    continue;
                }
                if !value.exists {
                    must_fetch.insert(key);
                    continue;
                }
                let watermark = book.watermarks.get(&key).copied();
                if watermark.map_or(false, |w| w >= end) {
                    continue;
                }
                match value.update.server_timestamp {
                    Some(ts) if ts < start => {
                        book.watermarks.insert(key, end);
                        book.initialized.insert(key);
                        book.dirty = true;
                        if !self.histories.contains_key(&key) {
                            self.store_records(book, key, vec![value.update.clone().into()]);
                        }
                    }
                    _ if watermark.is_none() => {
                        must_fetch.insert(key);
                    }
                    _ => {}
                }
            }
            must_fetch.into_iter().collect()
        })
    }

    /// Drop every key, history and pending event.
    pub fn clear(&self) {
        let mut book = self.book.write();
        let batch_depth = book.batch_depth;
        let sequence = book.sequence;
        *book = Bookkeeping {
            batch_depth,
            sequence,
            ..Bookkeeping::default()
        };
        self.histories.clear();
        debug!(target: "backfill::store", "cleared");
    }

    // ========================================================================
    // Batching
    // ========================================================================

    /// Open (`true`) or close (`false`) a batch.
    ///
    /// Batches nest. Closing the outermost one recomputes the global
    /// watermark and delivers the notifications collected meanwhile.
    pub fn set_batching(&self, batching: bool) {
        if batching {
            self.book.write().batch_depth += 1;
            return;
        }
        self.mutate(|book| {
            book.batch_depth = book.batch_depth.saturating_sub(1);
            if book.batch_depth == 0 {
                book.dirty = true;
            }
        });
    }

    /// Open a batch closed when the guard drops.
    pub fn batch(&self) -> BatchGuard<'_> {
        self.set_batching(true);
        BatchGuard { store: self }
    }

    /// True while a batch is open
    pub fn is_batching(&self) -> bool {
        self.book.read().batch_depth > 0
    }

    /// Emit one watermark notification even if the value is unchanged.
    ///
    /// Delivered now, or when the open batch closes.
    pub fn request_watermark_notification(&self) {
        self.mutate(|book| book.force_notification = true);
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Time up to which every registered key is loaded.
    ///
    /// `force` recomputes from the table (and notifies listeners of a
    /// change when no batch is open).
    pub fn global_watermark(&self, force: bool) -> Timestamp {
        if !force {
            let book = self.book.read();
            if book.batch_depth > 0 {
                return book.compute_global(&self.window);
            }
            if let (Some(global), false) = (book.global, book.dirty) {
                return global;
            }
        }
        self.mutate(|book| {
            book.dirty = true;
            if book.batch_depth > 0 {
                book.compute_global(&self.window)
            } else {
                book.current_global(&self.window)
            }
        })
    }

    /// True once the global watermark reached the window end
    pub fn is_loading_complete(&self) -> bool {
        self.global_watermark(false) >= self.window.end()
    }

    /// Watermark of one key
    pub fn watermark(&self, key: &Key) -> Option<Timestamp> {
        self.book.read().watermarks.get(key).copied()
    }

    /// `(key, watermark)` of every initialized key, ordered by key
    pub fn initialized_watermarks(&self) -> Vec<(Key, Timestamp)> {
        let book = self.book.read();
        let mut table: Vec<(Key, Timestamp)> = book
            .initialized
            .iter()
            .filter_map(|key| book.watermarks.get(key).map(|w| (*key, *w)))
            .collect();
        table.sort_unstable();
        table
    }

    /// Snapshot of one key's history
    pub fn history(&self, key: &Key) -> Option<HistorySnapshot> {
        self.histories.get(key).map(|h| h.snapshot())
    }

    /// Latest record of `key` at or before `time`
    pub fn value_at(&self, key: &Key, time: Timestamp) -> Option<Record> {
        self.history(key)?.value_at(time).cloned()
    }

    /// True if `key` is registered
    pub fn is_registered(&self, key: &Key) -> bool {
        self.book.read().watermarks.contains_key(key)
    }

    /// True if `key` has been initialized
    pub fn is_initialized(&self, key: &Key) -> bool {
        self.book.read().initialized.contains(key)
    }

    /// Registered keys, ordered
    pub fn registered_keys(&self) -> Vec<Key> {
        let mut keys: Vec<Key> = self.book.read().watermarks.keys().copied().collect();
        keys.sort_unstable();
        keys
    }

    /// Initialized keys, ordered
    pub fn initialized_keys(&self) -> Vec<Key> {
        let mut keys: Vec<Key> = self.book.read().initialized.iter().copied().collect();
        keys.sort_unstable();
        keys
    }

    /// Registered keys that are not initialized yet, ordered
    pub fn uninitialized_keys(&self) -> Vec<Key> {
        let book = self.book.read();
        let mut keys: Vec<Key> = book
            .watermarks
            .keys()
            .filter(|k| !book.initialized.contains(k))
            .copied()
            .collect();
        keys.sort_unstable();
        keys
    }

    /// True if some registered key is not initialized
    pub fn has_uninitialized(&self) -> bool {
        let book = self.book.read();
        book.initialized.len() < book.watermarks.len()
    }

    /// Number of registered keys
    pub fn len(&self) -> usize {
        self.book.read().watermarks.len()
    }

    /// True if no key is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for HistoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryStore")
            .field("window", &self.window)
            .field("keys", &self.len())
            .finish()
    }
}

/// Open batch on a [`HistoryStore`]; closes it on drop.
pub struct BatchGuard<'a> {
    store: &'a HistoryStore,
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        self.store.set_batching(false);
    }
}
