use crate::entity::{EntityKind, EntityRef, SupervisedEntity, SupervisionStatus};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

/// Published status representation of one entity.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StateTagValue {
    pub tag_id: i64,
    pub entity: EntityRef,
    /// Status name, `RUNNING_LOCAL` for a process on its local configuration
    pub value: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

impl StateTagValue {
    fn from_entity(tag_id: i64, entity: &SupervisedEntity) -> Self {
        let value = if entity.kind == EntityKind::Process
            && entity.status == SupervisionStatus::Running
            && entity.session.local_config
        {
            "RUNNING_LOCAL".to_string()
        } else {
            entity.status.as_str().to_string()
        };
        Self {
            tag_id,
            entity: entity.entity_ref(),
            value,
            timestamp: entity.status_time,
            message: entity.message.clone(),
        }
    }
}

/// State tags keyed by tag id.
pub struct StateTagStore {
    values: DashMap<i64, StateTagValue>,
}

impl StateTagStore {
    pub fn new() -> Self {
        Self {
            values: DashMap::new(),
        }
    }

    /// Write the entity's current status to its state tag, if it has one.
    pub fn write(&self, entity: &SupervisedEntity) -> bool {
        let Some(tag_id) = entity.state_tag_id else {
            return false;
        };
        self.values
            .insert(tag_id, StateTagValue::from_entity(tag_id, entity));
        true
    }

    pub fn get(&self, tag_id: i64) -> Option<StateTagValue> {
        self.values.get(&tag_id).map(|v| v.clone())
    }

    pub fn remove(&self, tag_id: i64) -> Option<StateTagValue> {
        self.values.remove(&tag_id).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Default for StateTagStore {
    fn default() -> Self {
        Self::new()
    }
}
