//! Loading engine for the backfill system
//!
//! This crate drives a [`HistoryStore`](backfill_storage::HistoryStore)
//! from an external [`HistoryProvider`](backfill_core::HistoryProvider):
//! - HistoryLoader: initialization of new keys and the background
//!   buffering workers
//! - sizing: how far one round reaches, from the speed estimate
//! - DailySnapshotFilter: skipping of ranges proven unchanged
//! - MemoryProbe: the memory ceiling check
//! - BackfillConfig / LoaderConfig: TOML configuration
//! - testing: in-memory provider and probe for tests

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod listener;
pub mod loader;
pub mod memory;
pub mod sizing;
pub mod snapshot_filter;
pub mod testing;

pub use config::{BackfillConfig, LoaderConfig, WindowConfig, CONFIG_FILE_NAME};
pub use listener::LoaderListener;
pub use loader::{HistoryLoader, LoopExit};
pub use memory::{MemoryProbe, SystemMemoryProbe};
pub use sizing::estimate_round_end;
pub use snapshot_filter::DailySnapshotFilter;
