//! Adaptive estimate of loading throughput
//!
//! The estimate is expressed in milliseconds of history obtained per
//! millisecond of wall-clock time, summed over all keys of a round. Each
//! measurement pulls the running value towards the observed sample with a
//! configurable weight:
//!
//! ```text
//! sample  = span_ms / max(wall_ms, 1)
//! current = (current * (weight - 1) + sample) / weight
//! ```
//!
//! A weight of 1 replaces the value with every sample; larger weights adapt
//! more slowly.

use parking_lot::Mutex;

/// One day of history per second of wall time.
pub const DEFAULT_SPEED: f64 = 24.0 * 60.0 * 60.0 * 1000.0 / 1000.0;

/// Default pull of a fresh measurement.
pub const DEFAULT_MEASUREMENT_WEIGHT: f64 = 3.0;

#[derive(Debug, Clone, Copy)]
struct SpeedState {
    current: f64,
    weight: f64,
    measurements: u64,
}

/// Exponentially weighted throughput estimate.
#[derive(Debug)]
pub struct SpeedEstimate {
    state: Mutex<SpeedState>,
}

impl SpeedEstimate {
    /// Estimate seeded with `initial` and the default weight
    pub fn new(initial: f64) -> Self {
        Self::with_weight(initial, DEFAULT_MEASUREMENT_WEIGHT)
    }

    /// Estimate seeded with `initial`; weights below 1 are raised to 1.
    pub fn with_weight(initial: f64, weight: f64) -> Self {
        SpeedEstimate {
            state: Mutex::new(SpeedState {
                current: initial,
                weight: weight.max(1.0),
                measurements: 0,
            }),
        }
    }

    /// Current estimate in history-ms per wall-ms
    pub fn current(&self) -> f64 {
        self.state.lock().current
    }

    /// Weight applied to the next measurement
    pub fn measurement_weight(&self) -> f64 {
        self.state.lock().weight
    }

    /// Change the weight; values below 1 are raised to 1.
    pub fn set_measurement_weight(&self, weight: f64) {
        self.state.lock().weight = weight.max(1.0);
    }

    /// Number of measurements folded in so far
    pub fn measurements(&self) -> u64 {
        self.state.lock().measurements
    }

    /// Fold in one observation and return the updated estimate.
    pub fn add_measurement(&self, span_ms: u64, wall_ms: u64) -> f64 {
        let sample = span_ms as f64 / wall_ms.max(1) as f64;
        let mut state = self.state.lock();
        state.current = (state.current * (state.weight - 1.0) + sample) / state.weight;
        state.measurements += 1;
        state.current
    }
}

impl Default for SpeedEstimate {
    fn default() -> Self {
        Self::new(DEFAULT_SPEED)
    }
}
