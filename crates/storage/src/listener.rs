//! Store notifications
//!
//! Every method has a no-op default so listeners implement only what they
//! need. Notifications are delivered after the store has released its
//! locks; a listener may call back into the store.

use backfill_core::{Key, Timestamp};

/// Observer of a [`HistoryStore`](crate::HistoryStore).
#[allow(unused_variables)]
pub trait StoreListener: Send + Sync {
    /// The global watermark changed (or a notification was requested).
    ///
    /// The value may be lower than a previous one when new keys were
    /// registered.
    fn on_watermark_advanced(&self, watermark: Timestamp) {}

    /// The global watermark reached the window end.
    fn on_fully_loaded(&self) {}

    /// Records were appended to existing histories of `keys`.
    fn on_keys_added(&self, keys: &[Key]) {}

    /// First records were stored for `keys`.
    fn on_keys_initialized(&self, keys: &[Key]) {}
}
