use crate::entity::{EntityKind, EntityRef, SupervisedEntity, SupervisionStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// SupervisionEvent describes one status change of one entity.
///
/// Events are immutable: they are built once per accepted transition and
/// shared behind an `Arc` with every listener.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SupervisionEvent {
    pub entity: EntityKind,

    #[serde(rename = "entityId")]
    pub entity_id: i64,

    #[serde(rename = "entityName")]
    pub entity_name: String,

    pub status: SupervisionStatus,

    pub timestamp: DateTime<Utc>,

    pub message: String,

    /// Monotonic across the whole engine; assigned under the process lock
    pub sequence: u64,
}

impl SupervisionEvent {
    /// Build an event from the current registry record.
    pub fn from_entity(entity: &SupervisedEntity, sequence: u64) -> Self {
        Self {
            entity: entity.kind,
            entity_id: entity.id,
            entity_name: entity.name.clone(),
            status: entity.status,
            timestamp: entity.status_time,
            message: entity.message.clone(),
            sequence,
        }
    }

    pub fn entity_ref(&self) -> EntityRef {
        EntityRef {
            kind: self.entity,
            id: self.entity_id,
        }
    }

    /// DOWN or STOPPED: dependent tags must be invalidated.
    pub fn is_outage(&self) -> bool {
        matches!(
            self.status,
            SupervisionStatus::Down | SupervisionStatus::Stopped
        )
    }

    /// RUNNING: dependent tags must be re-validated.
    pub fn is_recovery(&self) -> bool {
        self.status == SupervisionStatus::Running
    }
}
