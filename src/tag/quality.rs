use crate::entity::EntityKind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Reason a tag value should not be trusted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QualityStatus {
    ProcessDown,
    EquipmentDown,
    SubequipmentDown,
    Inaccessible,
    ValueOutOfBounds,
    Uninitialised,
    UnknownReason,
}

impl QualityStatus {
    /// Flag raised when an entity of `kind` goes down.
    pub fn for_entity(kind: EntityKind) -> Self {
        match kind {
            EntityKind::Process => QualityStatus::ProcessDown,
            EntityKind::Equipment => QualityStatus::EquipmentDown,
            EntityKind::SubEquipment => QualityStatus::SubequipmentDown,
        }
    }

    /// True for flags owned by the supervision engine.
    pub fn is_supervision(&self) -> bool {
        matches!(
            self,
            QualityStatus::ProcessDown
                | QualityStatus::EquipmentDown
                | QualityStatus::SubequipmentDown
        )
    }
}

/// Quality of a tag: each raised flag with the entities that caused it.
///
/// Supervision flags are reference-counted by entity id: a flag disappears only
/// when its last cause recovers. Other flags carry no cause.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagQuality {
    causes: BTreeMap<QualityStatus, BTreeSet<i64>>,
}

impl TagQuality {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `entity_id` as cause of `flag`. Returns true if anything changed.
    pub fn add_cause(&mut self, flag: QualityStatus, entity_id: i64) -> bool {
        self.causes.entry(flag).or_default().insert(entity_id)
    }

    /// Drop `entity_id` as cause of `flag`. Returns true if anything changed.
    pub fn remove_cause(&mut self, flag: QualityStatus, entity_id: i64) -> bool {
        let Some(causes) = self.causes.get_mut(&flag) else {
            return false;
        };
        let removed = causes.remove(&entity_id);
        if causes.is_empty() {
            self.causes.remove(&flag);
        }
        removed
    }

    /// Raise a flag that is not tied to an entity.
    pub fn set(&mut self, flag: QualityStatus) -> bool {
        if self.causes.contains_key(&flag) {
            return false;
        }
        self.causes.insert(flag, BTreeSet::new());
        true
    }

    /// Clear a flag regardless of its causes.
    pub fn clear(&mut self, flag: QualityStatus) -> bool {
        self.causes.remove(&flag).is_some()
    }

    pub fn contains(&self, flag: QualityStatus) -> bool {
        self.causes.contains_key(&flag)
    }

    pub fn causes(&self, flag: QualityStatus) -> Option<&BTreeSet<i64>> {
        self.causes.get(&flag)
    }

    pub fn flags(&self) -> BTreeSet<QualityStatus> {
        self.causes.keys().copied().collect()
    }

    /// Valid when no flag is raised.
    pub fn is_valid(&self) -> bool {
        self.causes.is_empty()
    }
}
