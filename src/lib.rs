//! Backfill - historical buffering engine for playback
//!
//! A playback window `[start, end]` over a set of keys (tag value streams
//! and supervision streams) is loaded from an external history source into
//! an in-memory store, a chunk at a time, while consumers already read
//! whatever is loaded.
//!
//! # Quick Start
//!
//! ```ignore
//! use backfill::{HistoryLoader, HistoryStore, Key, LoaderConfig, Timespan};
//! use std::sync::Arc;
//!
//! let store = Arc::new(HistoryStore::new(window));
//! store.register_keys(&[Key::tag(1), Key::tag(2)]);
//!
//! let loader = HistoryLoader::new(store.clone(), provider, LoaderConfig::default())?;
//! loader.begin_loading();
//!
//! // Later: everything up to the global watermark is complete
//! let loaded_until = store.global_watermark(false);
//! ```
//!
//! # Architecture
//!
//! - `backfill-core`: timestamps, keys, records, errors, the provider trait
//! - `backfill-concurrency`: key claims, speed estimate, stop signal
//! - `backfill-storage`: the history store and its watermarks
//! - `backfill-engine`: the loader, round sizing, configuration

pub use backfill_concurrency::{SpeedEstimate, StopSignal, WorkRegistry};
pub use backfill_core::*;
pub use backfill_engine::{
    estimate_round_end, testing, BackfillConfig, DailySnapshotFilter, HistoryLoader,
    LoaderConfig, LoaderListener, LoopExit, MemoryProbe, SystemMemoryProbe, WindowConfig,
    CONFIG_FILE_NAME,
};
pub use backfill_storage::{BatchGuard, HistorySnapshot, HistoryStore, KeyHistory, StoreListener};
