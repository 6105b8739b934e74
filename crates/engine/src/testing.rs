//! Test doubles for the loader
//!
//! - [`ScriptedProvider`]: an in-memory history source that records every
//!   call and can be told to fail
//! - [`FixedMemoryProbe`]: a memory probe returning a settable ratio

use backfill_core::{
    DailySnapshot, HistoryProvider, ProviderError, ProviderResult, SupervisionEvent,
    SupervisionRequest, TagValueUpdate, Timestamp,
};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::time::Duration;

use crate::memory::MemoryProbe;

/// Provider operation, for scripting failures and inspecting calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderOperation {
    /// `get_initial_values`
    InitialValues,
    /// `get_history`
    History,
    /// `get_daily_snapshot_records`
    DailySnapshots,
    /// `get_initial_supervision_events`
    InitialSupervision,
    /// `get_supervision_events`
    SupervisionEvents,
}

impl ProviderOperation {
    /// Name of the provider method
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderOperation::InitialValues => "get_initial_values",
            ProviderOperation::History => "get_history",
            ProviderOperation::DailySnapshots => "get_daily_snapshot_records",
            ProviderOperation::InitialSupervision => "get_initial_supervision_events",
            ProviderOperation::SupervisionEvents => "get_supervision_events",
        }
    }
}

/// One recorded provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCall {
    /// Which method was called
    pub operation: ProviderOperation,
    /// Tag ids of the request (empty for supervision calls)
    pub tag_ids: Vec<u64>,
    /// Entities of the request (empty for tag calls)
    pub entities: Vec<SupervisionRequest>,
    /// Start of the requested range, or the `at` instant
    pub start: Timestamp,
    /// End of the requested range (`None` for point-in-time calls)
    pub end: Option<Timestamp>,
}

#[derive(Debug, Clone, Copy)]
enum FailurePlan {
    Times(u32),
    Always,
}

#[derive(Default)]
struct Script {
    updates: Vec<TagValueUpdate>,
    snapshots: Vec<DailySnapshot>,
    supervision: Vec<SupervisionEvent>,
    failures: FxHashMap<ProviderOperation, FailurePlan>,
    unavailable: bool,
    history_delay: Option<Duration>,
    calls: Vec<ProviderCall>,
}

/// In-memory history source.
///
/// Answers every call from the updates, snapshots and supervision events it
/// was given, the way a history database would: initial values are the
/// latest update at or before the instant, ranges are inclusive.
#[derive(Default)]
pub struct ScriptedProvider {
    script: Mutex<Script>,
}

impl ScriptedProvider {
    /// Provider with no data
    pub fn new() -> Self {
        Self::default()
    }

    /// Add tag updates
    pub fn add_updates(&self, updates: impl IntoIterator<Item = TagValueUpdate>) {
        self.script.lock().updates.extend(updates);
    }

    /// Add daily snapshots
    pub fn add_snapshots(&self, snapshots: impl IntoIterator<Item = DailySnapshot>) {
        self.script.lock().snapshots.extend(snapshots);
    }

    /// Add supervision events
    pub fn add_supervision_events(&self, events: impl IntoIterator<Item = SupervisionEvent>) {
        self.script.lock().supervision.extend(events);
    }

    /// Fail the next `times` calls of `operation`.
    pub fn fail(&self, operation: ProviderOperation, times: u32) {
        self.script
            .lock()
            .failures
            .insert(operation, FailurePlan::Times(times));
    }

    /// Fail every call of `operation` until [`heal`](Self::heal).
    pub fn fail_always(&self, operation: ProviderOperation) {
        self.script
            .lock()
            .failures
            .insert(operation, FailurePlan::Always);
    }

    /// Answer every call with `Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.script.lock().unavailable = unavailable;
    }

    /// Drop every scripted failure.
    pub fn heal(&self) {
        let mut script = self.script.lock();
        script.failures.clear();
        script.unavailable = false;
    }

    /// Delay each `get_history` call
    pub fn set_history_delay(&self, delay: Option<Duration>) {
        self.script.lock().history_delay = delay;
    }

    /// Every call so far, in order
    pub fn calls(&self) -> Vec<ProviderCall> {
        self.script.lock().calls.clone()
    }

    /// Calls of one operation
    pub fn calls_of(&self, operation: ProviderOperation) -> Vec<ProviderCall> {
        self.script
            .lock()
            .calls
            .iter()
            .filter(|c| c.operation == operation)
            .cloned()
            .collect()
    }

    /// `(tag_ids, start, end)` of every `get_history` call
    pub fn history_calls(&self) -> Vec<(Vec<u64>, Timestamp, Timestamp)> {
        self.calls_of(ProviderOperation::History)
            .into_iter()
            .filter_map(|c| c.end.map(|end| (c.tag_ids, c.start, end)))
            .collect()
    }

    /// Forget the recorded calls
    pub fn clear_calls(&self) {
        self.script.lock().calls.clear();
    }

    fn record(&self, call: ProviderCall) -> ProviderResult<()> {
        let operation = call.operation;
        let mut script = self.script.lock();
        script.calls.push(call);
        if script.unavailable {
            return Err(ProviderError::unavailable("scripted outage"));
        }
        match script.failures.get(&operation).copied() {
            Some(FailurePlan::Always) => {
                Err(ProviderError::failed(operation.as_str(), "scripted failure"))
            }
            Some(FailurePlan::Times(n)) if n > 0 => {
                if n == 1 {
                    script.failures.remove(&operation);
                } else {
                    script.failures.insert(operation, FailurePlan::Times(n - 1));
                }
                Err(ProviderError::failed(operation.as_str(), "scripted failure"))
            }
            _ => Ok(()),
        }
    }

    fn tag_call(
        operation: ProviderOperation,
        tag_ids: &[u64],
        start: Timestamp,
        end: Option<Timestamp>,
    ) -> ProviderCall {
        ProviderCall {
            operation,
            tag_ids: tag_ids.to_vec(),
            entities: Vec::new(),
            start,
            end,
        }
    }

    fn supervision_call(
        operation: ProviderOperation,
        entities: &[SupervisionRequest],
        start: Timestamp,
        end: Option<Timestamp>,
    ) -> ProviderCall {
        ProviderCall {
            operation,
            tag_ids: Vec::new(),
            entities: entities.to_vec(),
            start,
            end,
        }
    }
}

fn requested(entities: &[SupervisionRequest], event: &SupervisionEvent) -> bool {
    entities.contains(&SupervisionRequest::new(event.entity_id, event.entity))
}

impl HistoryProvider for ScriptedProvider {
    fn get_initial_values(
        &self,
        tag_ids: &[u64],
        at: Timestamp,
    ) -> ProviderResult<Vec<TagValueUpdate>> {
        self.record(Self::tag_call(ProviderOperation::InitialValues, tag_ids, at, None))?;
        let script = self.script.lock();
        let mut latest: FxHashMap<u64, &TagValueUpdate> = FxHashMap::default();
        for update in &script.updates {
            let Some(ts) = update.server_timestamp else {
                continue;
            };
            if ts > at || !tag_ids.contains(&update.tag_id) {
                continue;
            }
            let newer = latest
                .get(&update.tag_id)
                .map_or(true, |current| current.server_timestamp <= Some(ts));
            if newer {
                latest.insert(update.tag_id, update);
            }
        }
        Ok(latest.into_values().cloned().collect())
    }

    fn get_history(
        &self,
        tag_ids: &[u64],
        start: Timestamp,
        end: Timestamp,
    ) -> ProviderResult<Vec<TagValueUpdate>> {
        let delay = self.script.lock().history_delay;
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        self.record(Self::tag_call(ProviderOperation::History, tag_ids, start, Some(end)))?;
        let script = self.script.lock();
        Ok(script
            .updates
            .iter()
            .filter(|u| tag_ids.contains(&u.tag_id))
            .filter(|u| u.server_timestamp.map_or(false, |ts| ts >= start && ts <= end))
            .cloned()
            .collect())
    }

    fn get_daily_snapshot_records(
        &self,
        tag_ids: &[u64],
        start: Timestamp,
        end: Timestamp,
    ) -> ProviderResult<Vec<DailySnapshot>> {
        self.record(Self::tag_call(ProviderOperation::DailySnapshots, tag_ids, start, Some(end)))?;
        let script = self.script.lock();
        Ok(script
            .snapshots
            .iter()
            .filter(|s| tag_ids.contains(&s.tag_id()))
            .filter(|s| s.taken_at >= start && s.taken_at <= end)
            .cloned()
            .collect())
    }

    fn get_initial_supervision_events(
        &self,
        at: Timestamp,
        entities: &[SupervisionRequest],
    ) -> ProviderResult<Vec<SupervisionEvent>> {
        self.record(Self::supervision_call(
            ProviderOperation::InitialSupervision,
            entities,
            at,
            None,
        ))?;
        let script = self.script.lock();
        let mut latest: FxHashMap<SupervisionRequest, &SupervisionEvent> = FxHashMap::default();
        for event in &script.supervision {
            let Some(ts) = event.timestamp else {
                continue;
            };
            if ts > at || !requested(entities, event) {
                continue;
            }
            let request = SupervisionRequest::new(event.entity_id, event.entity);
            let newer = latest
                .get(&request)
                .map_or(true, |current| current.timestamp <= Some(ts));
            if newer {
                latest.insert(request, event);
            }
        }
        Ok(latest.into_values().cloned().collect())
    }

    fn get_supervision_events(
        &self,
        start: Timestamp,
        end: Timestamp,
        entities: &[SupervisionRequest],
    ) -> ProviderResult<Vec<SupervisionEvent>> {
        self.record(Self::supervision_call(
            ProviderOperation::SupervisionEvents,
            entities,
            start,
            Some(end),
        ))?;
        let script = self.script.lock();
        Ok(script
            .supervision
            .iter()
            .filter(|e| requested(entities, e))
            .filter(|e| e.timestamp.map_or(false, |ts| ts >= start && ts <= end))
            .cloned()
            .collect())
    }
}

impl std::fmt::Debug for ScriptedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let script = self.script.lock();
        f.debug_struct("ScriptedProvider")
            .field("updates", &script.updates.len())
            .field("snapshots", &script.snapshots.len())
            .field("supervision", &script.supervision.len())
            .field("calls", &script.calls.len())
            .finish()
    }
}

/// Memory probe reporting whatever ratio it was set to.
#[derive(Debug, Default)]
pub struct FixedMemoryProbe {
    ratio: Mutex<Option<f64>>,
}

impl FixedMemoryProbe {
    /// Probe reporting `ratio`
    pub fn new(ratio: Option<f64>) -> Self {
        FixedMemoryProbe {
            ratio: Mutex::new(ratio),
        }
    }

    /// Change the reported ratio
    pub fn set(&self, ratio: Option<f64>) {
        *self.ratio.lock() = ratio;
    }
}

impl MemoryProbe for FixedMemoryProbe {
    fn usage_ratio(&self) -> Option<f64> {
        *self.ratio.lock()
    }
}
