//! Skipping of unchanged ranges using daily snapshots
//!
//! A daily snapshot records the latest update of a tag as of one day
//! boundary. When consecutive markers carry the same update (same value,
//! quality and server timestamp) the tag cannot have changed between them,
//! so the fine-grained fetch of that range can be skipped.

use backfill_core::{DailySnapshot, Timespan, Timestamp, TagValueUpdate};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::ops::Bound;

/// Per-tag index of daily snapshot markers.
#[derive(Debug, Default)]
pub struct DailySnapshotFilter {
    markers: Mutex<FxHashMap<u64, BTreeMap<Timestamp, TagValueUpdate>>>,
}

impl DailySnapshotFilter {
    /// Empty filter
    pub fn new() -> Self {
        Self::default()
    }

    /// Index snapshot markers. A later marker for the same tag and instant
    /// replaces the earlier one. Returns the number of markers indexed.
    pub fn add_snapshot_values(&self, values: impl IntoIterator<Item = DailySnapshot>) -> usize {
        let mut markers = self.markers.lock();
        let mut added = 0;
        for snapshot in values {
            markers
                .entry(snapshot.tag_id())
                .or_default()
                .insert(snapshot.taken_at, snapshot.update);
            added += 1;
        }
        added
    }

    /// Range starting at `since` over which `tag_id` provably did not change.
    ///
    /// The run starts at the latest marker at or before `since` and extends
    /// through every following marker identical to it. Returns `None` when
    /// the run does not reach past `since`.
    pub fn get_timespan(&self, tag_id: u64, since: Timestamp) -> Option<Timespan> {
        let markers = self.markers.lock();
        let tag_markers = markers.get(&tag_id)?;
        let (anchor_at, anchor) = tag_markers.range(..=since).next_back()?;

        let mut run_end = *anchor_at;
        for (at, update) in tag_markers.range((Bound::Excluded(*anchor_at), Bound::Unbounded)) {
            if !update.same_state_as(anchor) {
                break;
            }
            run_end = *at;
        }

        if run_end > since {
            Timespan::new(since, run_end)
        } else {
            None
        }
    }

    /// Number of tags with at least one marker
    pub fn len(&self) -> usize {
        self.markers.lock().len()
    }

    /// True if no marker is indexed
    pub fn is_empty(&self) -> bool {
        self.markers.lock().is_empty()
    }

    /// Drop every marker.
    pub fn clear(&self) {
        self.markers.lock().clear();
    }
}
