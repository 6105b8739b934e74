//! Historical records
//!
//! A [`Record`] is one timestamped fact for a [`Key`]: either a tag value
//! update or a supervision status change. Records without a timestamp
//! exist on the wire (the provider may return them) but are rejected by
//! the store at insertion time.

use crate::key::{Key, SupervisionEntity};
use crate::timestamp::Timestamp;
use serde::{Deserialize, Serialize};

/// Value carried by a tag update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TagValue {
    /// No value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value
    Int(i64),
    /// Floating point value
    Float(f64),
    /// Text value
    Text(String),
}

/// Quality attached to a tag update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quality {
    /// Whether the value is valid
    pub valid: bool,
    /// Free-form description of the invalidity, empty when valid
    pub description: String,
}

impl Quality {
    /// Valid quality
    pub fn ok() -> Self {
        Quality {
            valid: true,
            description: String::new(),
        }
    }

    /// Invalid quality with a reason
    pub fn invalid(description: impl Into<String>) -> Self {
        Quality {
            valid: false,
            description: description.into(),
        }
    }
}

impl Default for Quality {
    fn default() -> Self {
        Quality::ok()
    }
}

/// One historical value update of a tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagValueUpdate {
    /// Tag the update belongs to
    pub tag_id: u64,
    /// The value
    pub value: TagValue,
    /// Quality of the value
    pub quality: Quality,
    /// When the source produced the value
    pub source_timestamp: Option<Timestamp>,
    /// When the server recorded the value; orders the history
    pub server_timestamp: Option<Timestamp>,
}

impl TagValueUpdate {
    /// Update with valid quality, recorded by the server at `server_timestamp`.
    pub fn new(tag_id: u64, value: TagValue, server_timestamp: Timestamp) -> Self {
        TagValueUpdate {
            tag_id,
            value,
            quality: Quality::ok(),
            source_timestamp: Some(server_timestamp),
            server_timestamp: Some(server_timestamp),
        }
    }

    /// Same value, quality and server time as `other`.
    ///
    /// Two daily snapshots of a tag describe the same state when this holds.
    pub fn same_state_as(&self, other: &TagValueUpdate) -> bool {
        self.value == other.value
            && self.quality == other.quality
            && self.server_timestamp == other.server_timestamp
    }
}

/// Supervision status of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SupervisionStatus {
    /// Entity is running
    Running,
    /// Entity is down
    Down,
    /// Entity is starting up
    Startup,
    /// Entity is stopped
    Stopped,
    /// Status is not known
    Uncertain,
}

/// One historical status change of a supervised entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisionEvent {
    /// Entity identifier
    pub entity_id: u64,
    /// Kind of entity
    pub entity: SupervisionEntity,
    /// New status
    pub status: SupervisionStatus,
    /// Message accompanying the change
    pub message: String,
    /// When the change happened
    pub timestamp: Option<Timestamp>,
}

impl SupervisionEvent {
    /// Status change at `timestamp`
    pub fn new(
        entity_id: u64,
        entity: SupervisionEntity,
        status: SupervisionStatus,
        timestamp: Timestamp,
    ) -> Self {
        SupervisionEvent {
            entity_id,
            entity,
            status,
            message: String::new(),
            timestamp: Some(timestamp),
        }
    }
}

/// One historical fact for a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Record {
    /// Tag value update
    TagValue(TagValueUpdate),
    /// Supervision status change
    Supervision(SupervisionEvent),
}

impl Record {
    /// The key this record belongs to
    pub fn key(&self) -> Key {
        match self {
            Record::TagValue(update) => Key::tag(update.tag_id),
            Record::Supervision(event) => Key::supervision(event.entity_id, event.entity),
        }
    }

    /// Time that orders the record within its key's history
    pub fn timestamp(&self) -> Option<Timestamp> {
        match self {
            Record::TagValue(update) => update.server_timestamp,
            Record::Supervision(event) => event.timestamp,
        }
    }

    /// The tag update, if this is one
    pub fn as_tag_value(&self) -> Option<&TagValueUpdate> {
        match self {
            Record::TagValue(update) => Some(update),
            Record::Supervision(_) => None,
        }
    }

    /// The supervision event, if this is one
    pub fn as_supervision(&self) -> Option<&SupervisionEvent> {
        match self {
            Record::Supervision(event) => Some(event),
            Record::TagValue(_) => None,
        }
    }
}

impl From<TagValueUpdate> for Record {
    fn from(update: TagValueUpdate) -> Self {
        Record::TagValue(update)
    }
}

impl From<SupervisionEvent> for Record {
    fn from(event: SupervisionEvent) -> Self {
        Record::Supervision(event)
    }
}

/// Coarse per-day sample of a tag, used to skip ranges with no changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailySnapshot {
    /// When the snapshot was taken (day granularity)
    pub taken_at: Timestamp,
    /// Latest update of the tag as of `taken_at`
    pub update: TagValueUpdate,
}

impl DailySnapshot {
    /// Snapshot of `update` taken at `taken_at`
    pub fn new(taken_at: Timestamp, update: TagValueUpdate) -> Self {
        DailySnapshot { taken_at, update }
    }

    /// Tag the snapshot belongs to
    pub fn tag_id(&self) -> u64 {
        self.update.tag_id
    }
}

/// A tag's current value as seen by the live cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveTagValue {
    /// Whether the tag exists on the live side
    pub exists: bool,
    /// The current update
    pub update: TagValueUpdate,
}
