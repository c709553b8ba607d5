// DataTag / RuleTag model, quality flags and the tag store

mod quality;
mod store;

pub use quality::{QualityStatus, TagQuality};
pub use store::{TagListener, TagStore};
pub(crate) use store::panic_message;

use crate::entity::{EntityKind, EntityRef};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};

#[cfg(test)]
mod tests;

/// Physical entities a tag depends on.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityIds {
    pub process_ids: BTreeSet<i64>,
    pub equipment_ids: BTreeSet<i64>,
    pub sub_equipment_ids: BTreeSet<i64>,
}

impl EntityIds {
    pub fn from_refs(refs: impl IntoIterator<Item = EntityRef>) -> Self {
        let mut ids = Self::default();
        for r in refs {
            ids.insert(r);
        }
        ids
    }

    pub fn insert(&mut self, entity: EntityRef) -> bool {
        self.set_mut(entity.kind).insert(entity.id)
    }

    pub fn contains(&self, entity: EntityRef) -> bool {
        self.set(entity.kind).contains(&entity.id)
    }

    pub fn union_with(&mut self, other: &EntityIds) {
        self.process_ids.extend(other.process_ids.iter().copied());
        self.equipment_ids.extend(other.equipment_ids.iter().copied());
        self.sub_equipment_ids
            .extend(other.sub_equipment_ids.iter().copied());
    }

    /// Every entity as a typed reference.
    pub fn refs(&self) -> HashSet<EntityRef> {
        self.process_ids
            .iter()
            .map(|&id| EntityRef::process(id))
            .chain(self.equipment_ids.iter().map(|&id| EntityRef::equipment(id)))
            .chain(
                self.sub_equipment_ids
                    .iter()
                    .map(|&id| EntityRef::sub_equipment(id)),
            )
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.process_ids.is_empty()
            && self.equipment_ids.is_empty()
            && self.sub_equipment_ids.is_empty()
    }

    fn set(&self, kind: EntityKind) -> &BTreeSet<i64> {
        match kind {
            EntityKind::Process => &self.process_ids,
            EntityKind::Equipment => &self.equipment_ids,
            EntityKind::SubEquipment => &self.sub_equipment_ids,
        }
    }

    fn set_mut(&mut self, kind: EntityKind) -> &mut BTreeSet<i64> {
        match kind {
            EntityKind::Process => &mut self.process_ids,
            EntityKind::Equipment => &mut self.equipment_ids,
            EntityKind::SubEquipment => &mut self.sub_equipment_ids,
        }
    }
}

/// Leaf measurement point sourced from equipment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataTag {
    pub id: i64,
    pub name: String,
    pub entities: EntityIds,
    pub quality: TagQuality,
    pub value: Option<Value>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Derived tag computed from other tags or rules.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuleTag {
    pub id: i64,
    pub name: String,
    pub input_ids: BTreeSet<i64>,

    /// Union of every physical entity reachable through `input_ids`
    pub entities: EntityIds,

    pub quality: TagQuality,
    pub value: Option<Value>,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagKind {
    Data,
    Rule,
}

/// Copy-on-write view of a tag handed to tag listeners.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TagSnapshot {
    pub id: i64,
    pub kind: TagKind,
    pub name: String,
    pub value: Option<Value>,
    pub quality: BTreeSet<QualityStatus>,
    pub valid: bool,
    pub timestamp: Option<DateTime<Utc>>,
}

impl From<&DataTag> for TagSnapshot {
    fn from(tag: &DataTag) -> Self {
        Self {
            id: tag.id,
            kind: TagKind::Data,
            name: tag.name.clone(),
            value: tag.value.clone(),
            quality: tag.quality.flags(),
            valid: tag.quality.is_valid(),
            timestamp: tag.timestamp,
        }
    }
}

impl From<&RuleTag> for TagSnapshot {
    fn from(tag: &RuleTag) -> Self {
        Self {
            id: tag.id,
            kind: TagKind::Rule,
            name: tag.name.clone(),
            value: tag.value.clone(),
            quality: tag.quality.flags(),
            valid: tag.quality.is_valid(),
            timestamp: tag.timestamp,
        }
    }
}

/// Configuration of a data tag: the entities it is attached to.
///
/// Ancestors are added on registration, so attaching to an equipment also
/// attaches to its process.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataTagDefinition {
    pub id: i64,
    pub name: String,
    pub attached: Vec<EntityRef>,
}

impl DataTagDefinition {
    pub fn new(id: i64, name: impl Into<String>, attached: impl IntoIterator<Item = EntityRef>) -> Self {
        Self {
            id,
            name: name.into(),
            attached: attached.into_iter().collect(),
        }
    }
}

/// Configuration of a rule tag: the tags and rules it reads.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleTagDefinition {
    pub id: i64,
    pub name: String,
    pub input_ids: BTreeSet<i64>,
}

impl RuleTagDefinition {
    pub fn new(id: i64, name: impl Into<String>, input_ids: impl IntoIterator<Item = i64>) -> Self {
        Self {
            id,
            name: name.into(),
            input_ids: input_ids.into_iter().collect(),
        }
    }
}
