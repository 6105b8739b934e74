//! Round sizing
//!
//! A round fetches `[from + 1ms, end]` for every claimed key. The end is
//! chosen so the round takes roughly the target wall time at the current
//! speed estimate:
//!
//! 1. `total = speed * target_ms`, the history to fetch over all keys
//! 2. capped at `keys * window / min_frames`
//! 3. raised to at least `keys * min_span_per_key_ms`
//! 4. `end = from + total / keys`
//! 5. moved onto the nearest midnight (UTC) when within
//!    `per_key_span * day_snap_tolerance` of it
//! 6. clamped to the window end

use backfill_core::{Timespan, Timestamp};

use crate::config::LoaderConfig;

/// End of the next round for `keys` keys loaded up to `from`.
///
/// Always after `from` as long as `from` is before the window end.
pub fn estimate_round_end(
    config: &LoaderConfig,
    window: &Timespan,
    speed: f64,
    keys: usize,
    from: Timestamp,
    target_ms: u64,
) -> Timestamp {
    let keys = keys.max(1) as f64;

    let mut total = speed * target_ms as f64;
    let cap = keys * window.len_millis() as f64 / config.min_frames;
    if total > cap {
        total = cap;
    }
    let floor = keys * config.min_span_per_key_ms as f64;
    if total < floor || total.is_nan() {
        total = floor;
    }

    let per_key = ((total / keys) as u64).max(1);
    let tolerance = (per_key as f64 * config.day_snap_tolerance) as u64;
    let end = snap_to_day(from.saturating_add_millis(per_key), from, tolerance);

    end.min(window.end())
}

/// Move `end` onto a neighbouring midnight within `tolerance`, never back
/// to or before `from`.
fn snap_to_day(end: Timestamp, from: Timestamp, tolerance: u64) -> Timestamp {
    let day_start = end.start_of_day();
    if end == day_start {
        return end;
    }
    let next_day = end.start_of_next_day();
    if next_day.millis_since(end) <= tolerance {
        next_day
    } else if end.millis_since(day_start) <= tolerance && day_start > from {
        day_start
    } else {
        end
    }
}
