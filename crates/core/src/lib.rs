//! Core types and traits for the backfill engine
//!
//! This crate defines the foundational types used throughout the system:
//! - Timestamp / Timespan: millisecond time and closed ranges
//! - Key: identifier of a tag value stream or a supervision stream
//! - Record: one timestamped fact (tag update or supervision event)
//! - Error: error type hierarchy, including the provider boundary errors
//! - ListenerRegistry: observer subscriptions with unsubscribe handles
//! - HistoryProvider: the external source of historical data

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod key;
pub mod listener;
pub mod provider;
pub mod record;
pub mod timestamp;

pub use error::{BackfillError, BackfillResult, ProviderError};
pub use key::{Key, SupervisionEntity};
pub use listener::{ListenerRegistry, Subscription, SubscriptionId};
pub use provider::{HistoryProvider, ProviderResult, SupervisionRequest};
pub use record::{
    DailySnapshot, LiveTagValue, Quality, Record, SupervisionEvent, SupervisionStatus, TagValue,
    TagValueUpdate,
};
pub use timestamp::{Timespan, Timestamp, MILLIS_PER_DAY};
