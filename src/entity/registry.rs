use crate::entity::{
    EntityDefinition, EntityKind, EntityRef, ProcessSession, SupervisedEntity, SupervisionStatus,
};
use crate::error::ConfigError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Holds the current supervision record of every configured entity.
///
/// The registry is the single source of truth for entity liveness. Status
/// mutations must be made while holding the owning process lock; reads are
/// lock-free.
pub struct EntityRegistry {
    /// Lock-free concurrent map for fast reads
    entities: DashMap<i64, SupervisedEntity>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self {
            entities: DashMap::new(),
        }
    }

    /// Register (or reconfigure) an entity.
    ///
    /// A new entity starts `UNCERTAIN`. Re-registering an existing id keeps its
    /// current status and children but takes the new name and state tag.
    pub fn register(&self, def: EntityDefinition) -> Result<SupervisedEntity, ConfigError> {
        let process_id = match (def.kind.parent_kind(), def.parent_id) {
            (None, _) => def.id,
            (Some(parent_kind), Some(parent_id)) => {
                let parent = self
                    .entities
                    .get(&parent_id)
                    .filter(|p| p.kind == parent_kind)
                    .ok_or(ConfigError::UnknownEntity {
                        kind: parent_kind,
                        id: parent_id,
                    })?;
                parent.process_id
            }
            (Some(parent_kind), None) => {
                return Err(ConfigError::UnknownEntity {
                    kind: parent_kind,
                    id: 0,
                })
            }
        };

        if let Some(existing) = self.entities.get(&def.id) {
            if existing.kind != def.kind {
                return Err(ConfigError::KindConflict {
                    id: def.id,
                    existing: existing.kind,
                });
            }
        }

        let now = Utc::now();
        let parent_id = if def.kind == EntityKind::Process {
            None
        } else {
            def.parent_id
        };

        let previous_parent = self.entities.get(&def.id).and_then(|e| e.parent_id);

        let entity = {
            let mut entry = self
                .entities
                .entry(def.id)
                .or_insert_with(|| SupervisedEntity {
                    id: def.id,
                    kind: def.kind,
                    name: def.name.clone(),
                    parent_id,
                    process_id,
                    status: SupervisionStatus::Uncertain,
                    status_time: now,
                    message: "Configured, status not yet known".to_string(),
                    alive_timer_id: None,
                    state_tag_id: def.state_tag_id,
                    children: BTreeSet::new(),
                    session: ProcessSession::default(),
                });
            entry.name = def.name.clone();
            entry.parent_id = parent_id;
            entry.process_id = process_id;
            entry.state_tag_id = def.state_tag_id;
            entry.clone()
        };

        if previous_parent != parent_id {
            if let Some(old) = previous_parent {
                if let Some(mut p) = self.entities.get_mut(&old) {
                    p.children.remove(&def.id);
                }
            }
        }
        if let Some(parent) = parent_id {
            if let Some(mut p) = self.entities.get_mut(&parent) {
                p.children.insert(def.id);
            }
        }

        debug!(entity = %entity.entity_ref(), name = %entity.name, "Entity registered");
        Ok(entity)
    }

    /// Remove an entity and all of its descendants.
    ///
    /// Returns the removed records, parent first.
    pub fn remove(&self, id: i64) -> Vec<SupervisedEntity> {
        let mut ids = vec![id];
        ids.extend(self.descendants(id));

        let removed: Vec<SupervisedEntity> = ids
            .into_iter()
            .filter_map(|i| self.entities.remove(&i).map(|(_, e)| e))
            .collect();

        if let Some(parent) = removed.first().and_then(|e| e.parent_id) {
            if let Some(mut p) = self.entities.get_mut(&parent) {
                p.children.remove(&id);
            }
        }

        if !removed.is_empty() {
            info!(entity_id = id, removed = removed.len(), "Entity removed from registry");
        }
        removed
    }

    /// Get entity by ID
    pub fn get(&self, id: i64) -> Option<SupervisedEntity> {
        self.entities.get(&id).map(|e| e.clone())
    }

    /// Get entity by ID, only if it has the given kind
    pub fn get_ref(&self, entity: EntityRef) -> Option<SupervisedEntity> {
        self.entities
            .get(&entity.id)
            .filter(|e| e.kind == entity.kind)
            .map(|e| e.clone())
    }

    pub fn contains(&self, id: i64) -> bool {
        self.entities.contains_key(&id)
    }

    /// Get all entities, ordered by id
    pub fn all(&self) -> Vec<SupervisedEntity> {
        let mut all: Vec<SupervisedEntity> =
            self.entities.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|e| e.id);
        all
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Owning process id of an entity (its supervision lock key)
    pub fn owning_process(&self, id: i64) -> Option<i64> {
        self.entities.get(&id).map(|e| e.process_id)
    }

    /// Find a process by name. The lowest id wins if names collide.
    pub fn find_process_by_name(&self, name: &str) -> Option<SupervisedEntity> {
        self.entities
            .iter()
            .filter(|e| e.kind == EntityKind::Process && e.name == name)
            .map(|e| e.value().clone())
            .min_by_key(|e| e.id)
    }

    /// The entity followed by all of its ancestors up to its process.
    pub fn lineage(&self, entity: EntityRef) -> Option<Vec<EntityRef>> {
        let mut current = self.get_ref(entity)?;
        let mut lineage = vec![current.entity_ref()];
        while let Some(parent_id) = current.parent_id {
            match self.get(parent_id) {
                Some(parent) => {
                    lineage.push(parent.entity_ref());
                    current = parent;
                }
                None => break,
            }
        }
        Some(lineage)
    }

    /// All children and grand-children ids, breadth first.
    pub fn descendants(&self, id: i64) -> Vec<i64> {
        let mut out = Vec::new();
        let mut visited = BTreeSet::new();
        let mut frontier: Vec<i64> = self
            .entities
            .get(&id)
            .map(|e| e.children.iter().copied().collect())
            .unwrap_or_default();

        while !frontier.is_empty() {
            let mut next = Vec::new();
            for child in frontier {
                if !visited.insert(child) {
                    continue;
                }
                out.push(child);
                if let Some(e) = self.entities.get(&child) {
                    next.extend(e.children.iter().copied());
                }
            }
            frontier = next;
        }
        out
    }

    /// Write a new status. Caller must hold the owning process lock.
    pub fn set_status(
        &self,
        id: i64,
        status: SupervisionStatus,
        time: DateTime<Utc>,
        message: &str,
    ) -> Option<SupervisedEntity> {
        let mut entity = self.entities.get_mut(&id)?;
        entity.status = status;
        entity.status_time = time;
        entity.message = message.to_string();
        Some(entity.clone())
    }

    /// Mutate an entity in place. Caller must hold the owning process lock.
    pub fn update<R>(&self, id: i64, f: impl FnOnce(&mut SupervisedEntity) -> R) -> Option<R> {
        self.entities.get_mut(&id).map(|mut e| f(&mut e))
    }
}

impl Default for EntityRegistry {
    fn default() -> Self {
        Self::new()
    }
}
