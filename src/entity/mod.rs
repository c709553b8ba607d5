// Supervised entities (Process / Equipment / SubEquipment) and their registry

mod registry;

pub use registry::EntityRegistry;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

#[cfg(test)]
mod tests;

/// Type of a supervised entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    #[serde(rename = "PROCESS")]
    Process,
    #[serde(rename = "EQUIPMENT")]
    Equipment,
    #[serde(rename = "SUBEQUIPMENT")]
    SubEquipment,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Process => "PROCESS",
            EntityKind::Equipment => "EQUIPMENT",
            EntityKind::SubEquipment => "SUBEQUIPMENT",
        }
    }

    /// Kind of the parent entity, if this kind has one.
    pub fn parent_kind(&self) -> Option<EntityKind> {
        match self {
            EntityKind::Process => None,
            EntityKind::Equipment => Some(EntityKind::Process),
            EntityKind::SubEquipment => Some(EntityKind::Equipment),
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Liveness status of a supervised entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SupervisionStatus {
    Startup,
    Running,
    Down,
    Stopped,
    Uncertain,
}

impl SupervisionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SupervisionStatus::Startup => "STARTUP",
            SupervisionStatus::Running => "RUNNING",
            SupervisionStatus::Down => "DOWN",
            SupervisionStatus::Stopped => "STOPPED",
            SupervisionStatus::Uncertain => "UNCERTAIN",
        }
    }

    /// True while the entity is connected (starting up or running).
    pub fn is_running(&self) -> bool {
        matches!(self, SupervisionStatus::Startup | SupervisionStatus::Running)
    }
}

impl fmt::Display for SupervisionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed reference to an entity, used as key of the reverse indices.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: i64,
}

impl EntityRef {
    pub fn process(id: i64) -> Self {
        Self { kind: EntityKind::Process, id }
    }

    pub fn equipment(id: i64) -> Self {
        Self { kind: EntityKind::Equipment, id }
    }

    pub fn sub_equipment(id: i64) -> Self {
        Self { kind: EntityKind::SubEquipment, id }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.id)
    }
}

/// Connection details of a DAQ process (unused for equipment).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessSession {
    /// Process identification key handed out on connection
    pub pik: Option<i64>,
    pub host: Option<String>,
    pub startup_time: Option<DateTime<Utc>>,
    /// True until the DAQ has fetched its configuration from the server
    pub local_config: bool,
}

/// Current supervision record of one Process / Equipment / SubEquipment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SupervisedEntity {
    pub id: i64,
    pub kind: EntityKind,
    pub name: String,

    /// Process for equipment, equipment for sub-equipment
    pub parent_id: Option<i64>,

    /// Owning process (the entity itself for a process); key of the supervision lock
    pub process_id: i64,

    pub status: SupervisionStatus,
    pub status_time: DateTime<Utc>,
    pub message: String,

    pub alive_timer_id: Option<i64>,
    pub state_tag_id: Option<i64>,

    /// Direct children ids (equipment of a process, sub-equipment of an equipment)
    pub children: BTreeSet<i64>,

    #[serde(default)]
    pub session: ProcessSession,
}

impl SupervisedEntity {
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef {
            kind: self.kind,
            id: self.id,
        }
    }
}

/// Configuration of one entity, as delivered by the configuration loader.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EntityDefinition {
    pub id: i64,
    pub kind: EntityKind,
    pub name: String,
    #[serde(default)]
    pub parent_id: Option<i64>,
    #[serde(default)]
    pub state_tag_id: Option<i64>,
}

impl EntityDefinition {
    pub fn process(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            kind: EntityKind::Process,
            name: name.into(),
            parent_id: None,
            state_tag_id: None,
        }
    }

    pub fn equipment(id: i64, name: impl Into<String>, process_id: i64) -> Self {
        Self {
            id,
            kind: EntityKind::Equipment,
            name: name.into(),
            parent_id: Some(process_id),
            state_tag_id: None,
        }
    }

    pub fn sub_equipment(id: i64, name: impl Into<String>, equipment_id: i64) -> Self {
        Self {
            id,
            kind: EntityKind::SubEquipment,
            name: name.into(),
            parent_id: Some(equipment_id),
            state_tag_id: None,
        }
    }

    pub fn with_state_tag(mut self, state_tag_id: i64) -> Self {
        self.state_tag_id = Some(state_tag_id);
        self
    }
}
