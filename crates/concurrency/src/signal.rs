//! Cooperative stop flag with interruptible sleeps
//!
//! Background loops check [`StopSignal::is_stop_requested`] between steps
//! and use [`StopSignal::sleep`] instead of `thread::sleep`, so that a stop
//! request takes effect without waiting out a back-off interval.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Stop flag shared between a controller and its worker threads.
#[derive(Debug, Default)]
pub struct StopSignal {
    stop: Mutex<bool>,
    changed: Condvar,
}

impl StopSignal {
    /// Signal with no stop requested
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask workers to stop and wake any sleeper.
    pub fn request_stop(&self) {
        *self.stop.lock() = true;
        self.changed.notify_all();
    }

    /// Clear the flag so workers may run again.
    pub fn reset(&self) {
        *self.stop.lock() = false;
    }

    /// True once a stop has been requested (until [`reset`](StopSignal::reset))
    pub fn is_stop_requested(&self) -> bool {
        *self.stop.lock()
    }

    /// Sleep for `duration` or until a stop is requested.
    ///
    /// Returns `true` if a stop was requested.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut stop = self.stop.lock();
        while !*stop {
            if self.changed.wait_until(&mut stop, deadline).timed_out() {
                break;
            }
        }
        *stop
    }
}
