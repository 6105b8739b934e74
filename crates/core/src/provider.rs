//! Boundary to the external history source
//!
//! The engine never talks to a database or a network service directly. A
//! [`HistoryProvider`] implementation is injected into the loader and is
//! called from several threads at once (one per fetch partition), so it
//! must be `Send + Sync` and must not rely on being serialized.

use crate::error::ProviderError;
use crate::key::{Key, SupervisionEntity};
use crate::record::{DailySnapshot, SupervisionEvent, TagValueUpdate};
use crate::timestamp::Timestamp;
use serde::{Deserialize, Serialize};

/// Result type alias for provider calls
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Reference to a supervised entity in a provider request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SupervisionRequest {
    /// Entity identifier
    pub entity_id: u64,
    /// Kind of entity
    pub entity: SupervisionEntity,
}

impl SupervisionRequest {
    /// Request for the given entity
    pub fn new(entity_id: u64, entity: SupervisionEntity) -> Self {
        SupervisionRequest { entity_id, entity }
    }

    /// Request matching a supervision key, `None` for tag keys
    pub fn from_key(key: &Key) -> Option<Self> {
        match key {
            Key::Supervision { entity_id, entity } => {
                Some(SupervisionRequest::new(*entity_id, *entity))
            }
            Key::TagValue { .. } => None,
        }
    }
}

/// Source of historical data.
///
/// All calls are synchronous and may fail; none of them retries.
pub trait HistoryProvider: Send + Sync {
    /// Value of each tag as of `at` (the latest update at or before it)
    fn get_initial_values(
        &self,
        tag_ids: &[u64],
        at: Timestamp,
    ) -> ProviderResult<Vec<TagValueUpdate>>;

    /// Every update of the tags recorded in `[start, end]`
    fn get_history(
        &self,
        tag_ids: &[u64],
        start: Timestamp,
        end: Timestamp,
    ) -> ProviderResult<Vec<TagValueUpdate>>;

    /// Daily snapshot samples of the tags in `[start, end]`
    fn get_daily_snapshot_records(
        &self,
        tag_ids: &[u64],
        start: Timestamp,
        end: Timestamp,
    ) -> ProviderResult<Vec<DailySnapshot>>;

    /// Status of each entity as of `at`
    fn get_initial_supervision_events(
        &self,
        at: Timestamp,
        entities: &[SupervisionRequest],
    ) -> ProviderResult<Vec<SupervisionEvent>>;

    /// Every status change of the entities in `[start, end]`
    fn get_supervision_events(
        &self,
        start: Timestamp,
        end: Timestamp,
        entities: &[SupervisionRequest],
    ) -> ProviderResult<Vec<SupervisionEvent>>;
}
