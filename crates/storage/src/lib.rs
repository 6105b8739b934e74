//! Storage layer for the backfill engine
//!
//! This crate holds the loaded history of one playback window:
//! - HistoryStore: per-key histories, per-key watermarks and the derived
//!   global watermark, with batched change notification
//! - KeyHistory / HistorySnapshot: timestamp-ordered records of one key and
//!   cheap immutable views of them
//! - StoreListener: watermark and data notifications
//!
//! # Concurrency
//!
//! Histories sit in a `DashMap`, so readers snapshotting one key never
//! contend with the watermark bookkeeping, which lives under a single
//! `RwLock`. Listener callbacks run after every lock is released.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod history;
pub mod listener;
pub mod store;

pub use history::{HistorySnapshot, KeyHistory};
pub use listener::StoreListener;
pub use store::{BatchGuard, HistoryStore};
