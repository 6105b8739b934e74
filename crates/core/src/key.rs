//! Identifiers of the streams the engine backfills
//!
//! A [`Key`] names either one monitored tag (its value updates) or one
//! supervised entity (its status changes). Keys are immutable, hashable
//! and totally ordered; the ordering only exists so that iteration over
//! key sets is deterministic.

use serde::{Deserialize, Serialize};

/// Kind of entity whose supervision status is tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SupervisionEntity {
    /// A data acquisition process
    Process,
    /// An equipment attached to a process
    Equipment,
    /// A sub-equipment attached to an equipment
    SubEquipment,
}

impl std::fmt::Display for SupervisionEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisionEntity::Process => write!(f, "process"),
            SupervisionEntity::Equipment => write!(f, "equipment"),
            SupervisionEntity::SubEquipment => write!(f, "sub-equipment"),
        }
    }
}

/// Identifier of one history stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Key {
    /// Value updates of one tag
    TagValue {
        /// Tag identifier
        tag_id: u64,
    },
    /// Status changes of one supervised entity
    Supervision {
        /// Entity identifier
        entity_id: u64,
        /// What kind of entity `entity_id` refers to
        entity: SupervisionEntity,
    },
}

impl Key {
    /// Tag id `0` is reserved and never accepted into a store.
    pub const RESERVED_TAG_ID: u64 = 0;

    /// Key for the value history of a tag
    pub const fn tag(tag_id: u64) -> Self {
        Key::TagValue { tag_id }
    }

    /// Key for the status history of a supervised entity
    pub const fn supervision(entity_id: u64, entity: SupervisionEntity) -> Self {
        Key::Supervision { entity_id, entity }
    }

    /// Tag id if this is a tag value key
    pub fn tag_id(&self) -> Option<u64> {
        match self {
            Key::TagValue { tag_id } => Some(*tag_id),
            Key::Supervision { .. } => None,
        }
    }

    /// True for tag value keys
    pub fn is_tag_value(&self) -> bool {
        matches!(self, Key::TagValue { .. })
    }

    /// True for supervision keys
    pub fn is_supervision(&self) -> bool {
        matches!(self, Key::Supervision { .. })
    }

    /// Whether the key may be registered in a store.
    pub fn is_acceptable(&self) -> bool {
        !matches!(self, Key::TagValue { tag_id } if *tag_id == Self::RESERVED_TAG_ID)
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Key::TagValue { tag_id } => write!(f, "tag:{}", tag_id),
            Key::Supervision { entity_id, entity } => write!(f, "{}:{}", entity, entity_id),
        }
    }
}
