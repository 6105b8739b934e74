//! History loader
//!
//! Drives a [`HistoryStore`] from a [`HistoryProvider`] in two phases:
//!
//! - initialization ([`HistoryLoader::begin_loading`]): for every
//!   uninitialized key, fetch the state at window start, the supervision
//!   history and the daily snapshot index, in parallel, under one store
//!   batch
//! - buffering: background workers repeatedly pick the lagging keys, size
//!   a round from the speed estimate and fetch it, until the window is
//!   loaded, a stop is requested, memory runs short or rounds keep failing
//!
//! Workers are plain named threads. They share the store, one
//! [`WorkRegistry`] (so a key is fetched by one round at a time) and one
//! [`SpeedEstimate`].

pub(crate) mod buffering;
pub(crate) mod init;

use backfill_concurrency::{SpeedEstimate, StopSignal, WorkRegistry};
use backfill_core::{BackfillResult, HistoryProvider, Key, ListenerRegistry, Subscription};
use backfill_storage::HistoryStore;
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::LoaderConfig;
use crate::listener::LoaderListener;
use crate::memory::{MemoryProbe, SystemMemoryProbe};
use crate::snapshot_filter::DailySnapshotFilter;

/// Why a buffering worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// A stop was requested
    Stopped,
    /// The whole window is loaded
    Complete,
    /// Memory use crossed the configured ceiling
    MemoryPressure,
    /// Too many rounds failed in a row
    TooManyFailures,
    /// Keys remain unloaded but none can be fetched (uninitialized keys)
    NothingToLoad,
}

#[derive(Default)]
struct WorkerState {
    running: usize,
    handles: Vec<JoinHandle<()>>,
    last_exit: Option<LoopExit>,
}

pub(crate) struct LoaderInner {
    pub(crate) config: LoaderConfig,
    pub(crate) store: Arc<HistoryStore>,
    pub(crate) provider: Arc<dyn HistoryProvider>,
    pub(crate) memory: Arc<dyn MemoryProbe>,
    pub(crate) snapshots: DailySnapshotFilter,
    pub(crate) speed: SpeedEstimate,
    pub(crate) work: WorkRegistry<Key>,
    pub(crate) stop: StopSignal,
    pub(crate) listeners: ListenerRegistry<dyn LoaderListener>,
    /// Set once per loading session when the memory event went out
    pub(crate) memory_event_sent: AtomicBool,
    initializing: AtomicBool,
    init_lock: Mutex<()>,
    workers: Mutex<WorkerState>,
    workers_changed: Condvar,
}

impl LoaderInner {
    pub(crate) fn progress(&self, message: &str) {
        debug!(target: "backfill::init", message);
        self.listeners.notify(|l| l.on_initializing_progress(message));
    }

    pub(crate) fn memory_exceeded(&self) -> bool {
        match self.memory.usage_ratio() {
            Some(ratio) if ratio > self.config.memory_ceiling => {
                warn!(
                    target: "backfill::buffering",
                    ratio,
                    ceiling = self.config.memory_ceiling,
                    "memory ceiling exceeded"
                );
                true
            }
            _ => false,
        }
    }

    fn worker_finished(&self, exit: LoopExit) {
        let mut state = self.workers.lock();
        state.running = state.running.saturating_sub(1);
        // A sibling stopping after the real cause must not hide it
        let keep_previous = matches!(
            (state.last_exit, exit),
            (Some(previous), LoopExit::Stopped) if previous != LoopExit::Stopped
        );
        if !keep_previous {
            state.last_exit = Some(exit);
        }
        self.workers_changed.notify_all();
    }
}

/// Loads the history of a playback window into a [`HistoryStore`].
///
/// Dropping the loader stops its workers.
pub struct HistoryLoader {
    inner: Arc<LoaderInner>,
}

impl HistoryLoader {
    /// Loader watching the memory of the current process.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `config` does not validate.
    pub fn new(
        store: Arc<HistoryStore>,
        provider: Arc<dyn HistoryProvider>,
        config: LoaderConfig,
    ) -> BackfillResult<Self> {
        Self::with_memory_probe(store, provider, config, Arc::new(SystemMemoryProbe::new()))
    }

    /// Loader with an explicit memory probe.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `config` does not validate.
    pub fn with_memory_probe(
        store: Arc<HistoryStore>,
        provider: Arc<dyn HistoryProvider>,
        config: LoaderConfig,
        memory: Arc<dyn MemoryProbe>,
    ) -> BackfillResult<Self> {
        config.validate()?;
        let speed = SpeedEstimate::with_weight(config.initial_speed, config.measurement_weight);
        Ok(HistoryLoader {
            inner: Arc::new(LoaderInner {
                config,
                store,
                provider,
                memory,
                snapshots: DailySnapshotFilter::new(),
                speed,
                work: WorkRegistry::new(),
                stop: StopSignal::new(),
                listeners: ListenerRegistry::new(),
                memory_event_sent: AtomicBool::new(false),
                initializing: AtomicBool::new(false),
                init_lock: Mutex::new(()),
                workers: Mutex::new(WorkerState::default()),
                workers_changed: Condvar::new(),
            }),
        })
    }

    /// The store being loaded
    pub fn store(&self) -> &Arc<HistoryStore> {
        &self.inner.store
    }

    /// Loader settings
    pub fn config(&self) -> &LoaderConfig {
        &self.inner.config
    }

    /// Current speed estimate (history-ms per wall-ms)
    pub fn current_speed(&self) -> f64 {
        self.inner.speed.current()
    }

    /// Register a listener
    pub fn subscribe(&self, listener: Arc<dyn LoaderListener>) -> Subscription {
        self.inner.listeners.subscribe(listener)
    }

    /// Initialize every uninitialized key, then start buffering.
    ///
    /// Blocks during initialization and returns once buffering runs in the
    /// background. Concurrent callers are serialized. Running workers are
    /// stopped while new keys are initialized and restarted afterwards. This
    /// is also the way to resume after [`stop_loading`](Self::stop_loading)
    /// or a loop that gave up.
    pub fn begin_loading(&self) {
        let inner = &self.inner;
        let _init = inner.init_lock.lock();

        let keys = inner.store.uninitialized_keys();
        if !keys.is_empty() {
            // One notification for the whole initialization, before any
            // worker runs
            let _batch = inner.store.batch();
            self.fire_initializing_starting();
            inner.progress(&format!(
                "Preparing to initialize history data ({} keys)",
                keys.len()
            ));
            info!(target: "backfill::init", keys = keys.len(), "initializing history");

            if self.is_loading() {
                inner.progress("Waiting for the buffering workers to stop");
                self.stop_loading();
                inner.progress("Buffering stopped, requesting initial history data");
            } else {
                inner.progress("Requesting initial history data");
            }

            init::initialize(inner, &keys);

            inner.progress("Initial history data received, starting buffering");
            self.fire_initializing_finished();
            inner.store.request_watermark_notification();
        }

        inner.stop.reset();
        if !inner.store.is_loading_complete() {
            self.start_buffering();
        }
    }

    /// Ask the workers to stop and wait for them, at most the configured
    /// stop timeout.
    ///
    /// Returns `true` if no worker is running any more.
    pub fn stop_loading(&self) -> bool {
        let inner = &self.inner;
        inner.stop.request_stop();
        inner.work.wake_all();

        let deadline = Instant::now() + inner.config.stop_timeout();
        let mut state = inner.workers.lock();
        while state.running > 0 {
            if inner.workers_changed.wait_until(&mut state, deadline).timed_out() {
                if state.running > 0 {
                    warn!(
                        target: "backfill::loader",
                        running = state.running,
                        "buffering workers did not stop in time"
                    );
                    return false;
                }
                break;
            }
        }
        for handle in state.handles.drain(..) {
            let _ = handle.join();
        }
        true
    }

    /// True while a buffering worker is alive
    pub fn is_loading(&self) -> bool {
        self.inner.workers.lock().running > 0
    }

    /// Why the workers of the last session ended, if they did.
    pub fn last_exit(&self) -> Option<LoopExit> {
        let state = self.inner.workers.lock();
        if state.running > 0 {
            None
        } else {
            state.last_exit
        }
    }

    /// Drop the snapshot index and everything in the store.
    pub fn clear(&self) {
        self.inner.snapshots.clear();
        self.inner.store.clear();
    }

    fn start_buffering(&self) {
        let mut state = self.inner.workers.lock();
        if state.running > 0 {
            return;
        }
        // Every previous worker has finished; reap them
        for handle in state.handles.drain(..) {
            let _ = handle.join();
        }
        state.last_exit = None;
        self.inner.memory_event_sent.store(false, Ordering::Release);

        for i in 0..self.inner.config.buffering_workers {
            let inner = Arc::clone(&self.inner);
            let spawned = std::thread::Builder::new()
                .name(format!("backfill-buffering-{}", i))
                .spawn(move || buffering::run_worker(inner));
            match spawned {
                Ok(handle) => {
                    state.handles.push(handle);
                    state.running += 1;
                }
                Err(e) => {
                    error!(
                        target: "backfill::loader",
                        worker = i,
                        error = %e,
                        "failed to spawn buffering worker"
                    );
                }
            }
        }
        debug!(target: "backfill::loader", workers = state.running, "buffering started");
    }

    fn fire_initializing_starting(&self) {
        if !self.inner.initializing.swap(true, Ordering::AcqRel) {
            self.inner
                .listeners
                .notify(|l| l.on_initializing_starting());
        }
    }

    fn fire_initializing_finished(&self) {
        if self.inner.initializing.swap(false, Ordering::AcqRel) {
            self.inner
                .listeners
                .notify(|l| l.on_initializing_finished());
        }
    }
}

impl Drop for HistoryLoader {
    fn drop(&mut self) {
        self.stop_loading();
    }
}

impl std::fmt::Debug for HistoryLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryLoader")
            .field("store", &self.inner.store)
            .field("loading", &self.is_loading())
            .finish()
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("(non-string panic)")
}
