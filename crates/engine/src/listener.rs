//! Loader notifications

/// Observer of a [`HistoryLoader`](crate::HistoryLoader).
///
/// Every method has a no-op default. Calls are made from loader threads
/// with no loader lock held.
#[allow(unused_variables)]
pub trait LoaderListener: Send + Sync {
    /// Initialization of new keys is starting.
    fn on_initializing_starting(&self) {}

    /// Human readable progress of the initialization.
    fn on_initializing_progress(&self, message: &str) {}

    /// Initialization finished; buffering starts next.
    fn on_initializing_finished(&self) {}

    /// Buffering stopped because memory use crossed the ceiling.
    ///
    /// Delivered on a dedicated thread, at most once per loading session.
    fn on_stopped_loading_due_to_out_of_memory(&self) {}

    /// Buffering gave up after `failures` failed rounds in a row.
    fn on_stopped_loading_due_to_failures(&self, failures: u32) {}
}
