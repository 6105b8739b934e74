//! Shared test utilities for the end-to-end suites.
//!
//! Import via `#[path = "../common/mod.rs"] mod common;` from a suite's
//! main.rs.

#![allow(dead_code)]

use backfill::testing::{FixedMemoryProbe, ScriptedProvider};
use backfill::{
    HistoryLoader, HistoryStore, Key, LoaderConfig, StoreListener, TagValue, TagValueUpdate,
    Timespan, Timestamp, MILLIS_PER_DAY,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

// ============================================================================
// Time
// ============================================================================

/// Noon, so that short windows never touch a day boundary
pub const T0: u64 = 19_600 * MILLIS_PER_DAY + 12 * 60 * 60 * 1000;

/// Length of the scenario window
pub const LEN: u64 = 10_000;

pub fn ts(offset: u64) -> Timestamp {
    Timestamp::from_millis(T0 + offset)
}

pub fn window() -> Timespan {
    Timespan::new(ts(0), ts(LEN)).unwrap()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

// ============================================================================
// Loader setup
// ============================================================================

/// Settings under which the first round covers exactly 700ms per key.
pub fn scenario_config() -> LoaderConfig {
    LoaderConfig {
        initial_speed: 2.0,
        min_span_per_key_ms: 1,
        min_frames: 1.0,
        failure_retry_delay_ms: 0,
        claim_retry_interval_ms: 20,
        stop_timeout_ms: 5_000,
        ..LoaderConfig::default()
    }
}

/// Provider holding, per tag, one value at `t0` and one every second.
pub fn provider_with_tags(tags: &[u64]) -> Arc<ScriptedProvider> {
    let provider = Arc::new(ScriptedProvider::new());
    for &tag in tags {
        provider.add_updates(vec![TagValueUpdate::new(tag, TagValue::Int(0), ts(0))]);
        provider.add_updates((1..10).map(|i| {
            TagValueUpdate::new(tag, TagValue::Int(i as i64), ts(i * 1_000))
        }));
    }
    provider
}

pub struct Session {
    pub store: Arc<HistoryStore>,
    pub provider: Arc<ScriptedProvider>,
    pub probe: Arc<FixedMemoryProbe>,
    pub loader: HistoryLoader,
    pub events: Arc<StoreEvents>,
}

impl Session {
    pub fn new(keys: &[Key], provider: Arc<ScriptedProvider>, config: LoaderConfig) -> Self {
        let store = Arc::new(HistoryStore::new(window()));
        let events = Arc::new(StoreEvents::default());
        store.subscribe(events.clone());
        store.register_keys(keys);

        let probe = Arc::new(FixedMemoryProbe::new(None));
        let loader = HistoryLoader::with_memory_probe(
            Arc::clone(&store),
            Arc::clone(&provider) as _,
            config,
            Arc::clone(&probe) as _,
        )
        .unwrap();
        Session {
            store,
            provider,
            probe,
            loader,
            events,
        }
    }

    /// Block until no worker runs any more.
    pub fn wait_idle(&self) {
        assert!(
            wait_until(Duration::from_secs(10), || !self.loader.is_loading()),
            "buffering did not finish"
        );
    }
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

// ============================================================================
// Store notifications
// ============================================================================

/// Store listener recording every notification.
#[derive(Default)]
pub struct StoreEvents {
    pub watermarks: Mutex<Vec<Timestamp>>,
    pub fully_loaded: AtomicUsize,
    pub added: Mutex<Vec<Key>>,
    pub initialized: Mutex<Vec<Key>>,
}

impl StoreEvents {
    pub fn fully_loaded_count(&self) -> usize {
        self.fully_loaded.load(Ordering::SeqCst)
    }
}

impl StoreListener for StoreEvents {
    fn on_watermark_advanced(&self, watermark: Timestamp) {
        self.watermarks.lock().push(watermark);
    }

    fn on_fully_loaded(&self) {
        self.fully_loaded.fetch_add(1, Ordering::SeqCst);
    }

    fn on_keys_added(&self, keys: &[Key]) {
        self.added.lock().extend_from_slice(keys);
    }

    fn on_keys_initialized(&self, keys: &[Key]) {
        self.initialized.lock().extend_from_slice(keys);
    }
}
