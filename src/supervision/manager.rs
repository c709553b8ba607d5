use super::control::{
    ControlTagRole, ProcessConfigurationRequest, ProcessConfigurationResponse,
    ProcessConnectionRequest, ProcessConnectionResponse, ProcessDisconnectionRequest,
    SourceControlValue,
};
use super::locks::ProcessLocks;
use super::state_tags::StateTagStore;
use super::transition::{decide, Decision, Trigger};
use crate::alive::{AliveTimer, AliveTimerDefinition, AliveTimerStore, RefreshOutcome};
use crate::config::{SharedRuntimeConfig, SupervisionConfig};
use crate::dependency::DependencyIndex;
use crate::entity::{
    EntityDefinition, EntityKind, EntityRef, EntityRegistry, SupervisedEntity, SupervisionStatus,
};
use crate::error::{ConfigError, SupervisionError};
use crate::event::SupervisionEvent;
use crate::invalidation::InvalidationEngine;
use crate::metrics::SupervisionMetrics;
use crate::notifier::SupervisionNotifier;
use crate::tag::{DataTagDefinition, EntityIds, RuleTagDefinition, TagKind, TagStore};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rand::Rng;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use tracing::{debug, info, warn};

/// Result of a runtime supervision call.
#[derive(Clone, Debug, PartialEq)]
pub enum TransitionOutcome {
    /// Status changed and the event was raised
    Applied(Arc<SupervisionEvent>),
    /// Nothing to do (already in the target status, or the trigger no longer holds)
    Unchanged,
    /// Logged and dropped
    Rejected(SupervisionError),
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied(_))
    }

    pub fn event(&self) -> Option<&Arc<SupervisionEvent>> {
        match self {
            TransitionOutcome::Applied(event) => Some(event),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&SupervisionError> {
        match self {
            TransitionOutcome::Rejected(err) => Some(err),
            _ => None,
        }
    }
}

/// Entry point of the supervision engine.
///
/// Owns the registries, serializes status changes per DAQ process, raises one
/// event per accepted transition and cascades it to the dependent tags once the
/// process lock is released.
pub struct SupervisionManager {
    config: SupervisionConfig,
    runtime: SharedRuntimeConfig,
    registry: Arc<EntityRegistry>,
    timers: Arc<AliveTimerStore>,
    locks: ProcessLocks,
    index: Arc<DependencyIndex>,
    tags: Arc<TagStore>,
    invalidation: InvalidationEngine,
    notifier: SupervisionNotifier,
    state_tags: StateTagStore,
    /// Control tag id -> role
    control_tags: DashMap<i64, ControlTagRole>,
    /// Entity id -> comm-fault tag id
    comm_faults: DashMap<i64, i64>,
    metrics: Arc<SupervisionMetrics>,
    sequence: AtomicU64,
}

impl SupervisionManager {
    pub fn new(config: SupervisionConfig, runtime: SharedRuntimeConfig) -> Self {
        let metrics = Arc::new(SupervisionMetrics::new());
        let index = Arc::new(DependencyIndex::new());
        let tags = Arc::new(TagStore::new());
        let invalidation =
            InvalidationEngine::new(Arc::clone(&index), Arc::clone(&tags), Arc::clone(&metrics));
        let notifier = SupervisionNotifier::new(config.notifier.clone(), Arc::clone(&metrics));

        Self {
            timers: Arc::new(AliveTimerStore::new(config.alive.tolerance_factor)),
            config,
            runtime,
            registry: Arc::new(EntityRegistry::new()),
            locks: ProcessLocks::new(),
            index,
            tags,
            invalidation,
            notifier,
            state_tags: StateTagStore::new(),
            control_tags: DashMap::new(),
            comm_faults: DashMap::new(),
            metrics,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    pub fn timers(&self) -> &AliveTimerStore {
        &self.timers
    }

    pub fn tags(&self) -> &TagStore {
        &self.tags
    }

    pub fn dependencies(&self) -> &DependencyIndex {
        &self.index
    }

    pub fn notifier(&self) -> &SupervisionNotifier {
        &self.notifier
    }

    pub fn state_tags(&self) -> &StateTagStore {
        &self.state_tags
    }

    pub fn metrics(&self) -> &SupervisionMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &SupervisionConfig {
        &self.config
    }

    /// Hot-switchable runtime settings.
    pub fn runtime(&self) -> &SharedRuntimeConfig {
        &self.runtime
    }

    pub fn status(&self, entity_id: i64) -> Option<SupervisionStatus> {
        self.registry.get(entity_id).map(|e| e.status)
    }

    // ---- configuration ----

    pub fn register_entity(&self, def: EntityDefinition) -> Result<SupervisedEntity, ConfigError> {
        let entity = self.registry.register(def)?;
        self.state_tags.write(&entity);
        Ok(entity)
    }

    /// Register an alive timer and link it into the timer hierarchy.
    ///
    /// The timer id doubles as the id of its alive control tag.
    pub fn register_alive_timer(
        &self,
        def: AliveTimerDefinition,
    ) -> Result<AliveTimer, ConfigError> {
        let lineage = self
            .registry
            .lineage(def.related)
            .ok_or(ConfigError::UnknownEntity {
                kind: def.related.kind,
                id: def.related.id,
            })?;
        if self.tags.kind_of(def.id).is_some() {
            return Err(ConfigError::TagConflict(def.id));
        }

        let timer = self.timers.register(&def)?;

        // nearest ancestor timer owns this one
        for ancestor in lineage.iter().skip(1) {
            if let Some(parent_timer) = self
                .registry
                .get(ancestor.id)
                .and_then(|e| e.alive_timer_id)
            {
                self.timers.add_dependent(parent_timer, def.id)?;
                break;
            }
        }
        for child in self.registry.descendants(def.related.id) {
            if let Some(child_timer) = self.registry.get(child).and_then(|e| e.alive_timer_id) {
                self.timers.add_dependent(def.id, child_timer)?;
            }
        }

        self.registry.update(def.related.id, |e| {
            e.alive_timer_id = Some(def.id);
        });
        self.control_tags
            .insert(def.id, ControlTagRole::Alive { timer_id: def.id });

        info!(
            timer_id = def.id,
            entity = %def.related,
            interval_millis = timer.interval_millis,
            "Alive timer registered"
        );
        self.timers.get(def.id).ok_or(ConfigError::UnknownTimer(def.id))
    }

    pub fn register_comm_fault_tag(
        &self,
        tag_id: i64,
        entity_id: i64,
        fault_value: Value,
    ) -> Result<(), ConfigError> {
        self.register_control_tag(
            tag_id,
            ControlTagRole::CommFault {
                entity_id,
                fault_value,
            },
        )
    }

    pub fn register_control_tag(&self, tag_id: i64, role: ControlTagRole) -> Result<(), ConfigError> {
        if self.tags.kind_of(tag_id).is_some() {
            return Err(ConfigError::TagConflict(tag_id));
        }
        match &role {
            ControlTagRole::Alive { timer_id } => {
                if self.timers.get(*timer_id).is_none() {
                    return Err(ConfigError::UnknownTimer(*timer_id));
                }
            }
            ControlTagRole::CommFault { entity_id, .. } => {
                self.require_entity(*entity_id)?;
                self.comm_faults.insert(*entity_id, tag_id);
            }
            ControlTagRole::State { entity_id } => {
                self.require_entity(*entity_id)?;
                let entity = self.registry.update(*entity_id, |e| {
                    e.state_tag_id = Some(tag_id);
                    e.clone()
                });
                if let Some(entity) = entity {
                    self.state_tags.write(&entity);
                }
            }
        }
        debug!(tag_id = tag_id, role = ?role, "Control tag registered");
        self.control_tags.insert(tag_id, role);
        Ok(())
    }

    /// Register a data tag, attaching it to the given entities and their ancestors.
    pub fn register_data_tag(&self, def: DataTagDefinition) -> Result<(), ConfigError> {
        let entities = self.expand_attachment(&def.attached)?;
        self.attach_data_tag(def.id, &def.name, entities)
    }

    /// Attach a (possibly new) data tag to entities given by id.
    pub fn register_tag_dependency(&self, tag_id: i64, entity_ids: &[i64]) -> Result<(), ConfigError> {
        let mut refs = Vec::with_capacity(entity_ids.len());
        for &id in entity_ids {
            let entity = self.require_entity(id)?;
            refs.push(entity.entity_ref());
        }
        let entities = self.expand_attachment(&refs)?;
        let name = self
            .tags
            .data_tag(tag_id)
            .map(|t| t.name)
            .unwrap_or_else(|| format!("tag-{}", tag_id));
        self.attach_data_tag(tag_id, &name, entities)
    }

    pub fn register_rule_tag(&self, def: RuleTagDefinition) -> Result<EntityIds, ConfigError> {
        if self.tags.kind_of(def.id) == Some(TagKind::Data) || self.control_tags.contains_key(&def.id)
        {
            return Err(ConfigError::TagConflict(def.id));
        }
        let updated = self.index.register_rule_tag(def.id, def.input_ids.clone())?;
        let entities = self.index.rule_union(def.id).unwrap_or_default();
        self.tags
            .upsert_rule_tag(def.id, &def.name, def.input_ids, entities.clone())?;
        for rule in updated.into_iter().filter(|u| u.rule_id != def.id) {
            self.tags.set_rule_entities(rule.rule_id, rule.entities);
        }
        debug!(rule_id = def.id, "Rule tag registered");
        Ok(entities)
    }

    /// Remove a data, rule or control tag.
    pub fn remove_tag(&self, tag_id: i64) -> bool {
        if let Some((_, role)) = self.control_tags.remove(&tag_id) {
            if let ControlTagRole::CommFault { entity_id, .. } = role {
                self.comm_faults.remove(&entity_id);
            }
            self.state_tags.remove(tag_id);
            return true;
        }
        let updated = self.index.remove_tag(tag_id);
        for rule in updated {
            self.tags.set_rule_entities(rule.rule_id, rule.entities);
        }
        self.tags.remove(tag_id).is_some()
    }

    /// Remove an entity and its children, with their timers and control tags.
    pub fn remove_entity(&self, entity_id: i64) -> Vec<SupervisedEntity> {
        let Some(process_id) = self.registry.owning_process(entity_id) else {
            return Vec::new();
        };
        let lock = self.locks.lock_for(process_id);
        let removed = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.registry.remove(entity_id)
        };

        for entity in &removed {
            if let Some(timer_id) = entity.alive_timer_id {
                self.timers.remove(timer_id);
                self.control_tags.remove(&timer_id);
            }
            if let Some(tag_id) = entity.state_tag_id {
                self.state_tags.remove(tag_id);
            }
            if let Some((_, tag_id)) = self.comm_faults.remove(&entity.id) {
                self.control_tags.remove(&tag_id);
            }
            self.control_tags.retain(|_, role| {
                !matches!(role, ControlTagRole::State { entity_id } if *entity_id == entity.id)
            });
            self.index.remove_entity(entity.entity_ref());
            self.invalidation.forget(entity.entity_ref());
            if entity.kind == EntityKind::Process {
                self.locks.remove(entity.id);
            }
        }
        if !removed.is_empty() {
            info!(entity_id = entity_id, removed = removed.len(), "Entity removed");
        }
        removed
    }

    // ---- runtime ----

    /// Alive signal for a timer.
    ///
    /// An older timestamp than the last accepted one is ignored. Alive signals
    /// for an inactive timer start it, unless the entity was stopped.
    pub fn refresh_alive(&self, timer_id: i64, timestamp: DateTime<Utc>) -> TransitionOutcome {
        let Some(timer) = self.timers.get(timer_id) else {
            return self.not_found("alive timer", timer_id);
        };
        let Some(process_id) = self.registry.owning_process(timer.related.id) else {
            return self.not_found("entity", timer.related.id);
        };

        let lock = self.locks.lock_for(process_id);
        let outcome = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.refresh_alive_locked(timer_id, timer.related, timestamp)
        };
        self.cascade(&outcome);
        outcome
    }

    fn refresh_alive_locked(
        &self,
        timer_id: i64,
        related: EntityRef,
        timestamp: DateTime<Utc>,
    ) -> TransitionOutcome {
        let Some(entity) = self.registry.get(related.id) else {
            return self.not_found("entity", related.id);
        };
        if entity.status == SupervisionStatus::Stopped {
            return self.invalid(&entity, Trigger::AliveReceived);
        }

        let refreshed = match self.timers.refresh(timer_id, timestamp) {
            RefreshOutcome::Inactive => {
                // an alive from before the stop must not restart the timer tree
                let last_update = self.timers.get(timer_id).map(|t| t.last_update);
                if timestamp < entity.status_time || last_update.is_some_and(|l| timestamp < l) {
                    false
                } else {
                    debug!(timer_id = timer_id, "Alive received for inactive timer, starting it");
                    self.timers.start(timer_id, timestamp);
                    true
                }
            }
            RefreshOutcome::Refreshed { .. } => true,
            RefreshOutcome::Stale => false,
            RefreshOutcome::NotFound => return self.not_found("alive timer", timer_id),
        };
        if !refreshed {
            return self.stale("alive timer", timer_id);
        }

        let message = match related.kind {
            EntityKind::Process => "Process Alive tag received.",
            EntityKind::Equipment => "Equipment Alive tag received.",
            EntityKind::SubEquipment => "Subequipment Alive tag received.",
        };
        self.transition_locked(related.id, Trigger::AliveReceived, timestamp, message)
    }

    /// Value of the comm-fault tag of `entity_id`.
    pub fn process_control_tag_value(
        &self,
        entity_id: i64,
        value: &Value,
        timestamp: DateTime<Utc>,
    ) -> TransitionOutcome {
        let Some(tag_id) = self.comm_faults.get(&entity_id).map(|t| *t) else {
            return self.not_found("comm fault tag for entity", entity_id);
        };
        let fault_value = match self.control_tags.get(&tag_id).map(|r| r.clone()) {
            Some(ControlTagRole::CommFault { fault_value, .. }) => fault_value,
            _ => return self.not_found("comm fault tag", tag_id),
        };
        self.apply_comm_fault(entity_id, *value == fault_value, timestamp)
    }

    /// Route an incoming control tag value by the tag's role.
    pub fn process_control_tag(&self, value: SourceControlValue) -> TransitionOutcome {
        debug!(tag_id = value.tag_id, value = %value.value, "Incoming control tag update");
        let Some(role) = self.control_tags.get(&value.tag_id).map(|r| r.clone()) else {
            return self.not_found("control tag", value.tag_id);
        };
        let now = Utc::now();
        let timestamp = value.supervision_timestamp().unwrap_or(now);

        match role {
            ControlTagRole::Alive { timer_id } => {
                let Some(timer) = self.timers.get(timer_id) else {
                    return self.not_found("alive timer", timer_id);
                };
                if self.is_delayed(&timer, timestamp, now) {
                    debug!(
                        timer_id = timer_id,
                        entity = %timer.related,
                        "Rejecting alive as delayed arrival"
                    );
                    return self.stale("alive tag", value.tag_id);
                }
                self.refresh_alive(timer_id, timestamp)
            }
            ControlTagRole::CommFault {
                entity_id,
                fault_value,
            } => self.apply_comm_fault(entity_id, value.value == fault_value, timestamp),
            ControlTagRole::State { entity_id } => {
                debug!(
                    tag_id = value.tag_id,
                    entity_id = entity_id,
                    "State tags are written by the server, value ignored"
                );
                TransitionOutcome::Unchanged
            }
        }
    }

    fn is_delayed(&self, timer: &AliveTimer, timestamp: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let reject = self
            .runtime
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .reject_delayed_alive;
        if !reject {
            return false;
        }
        let max_delay = (timer.interval_millis as f64 * self.config.alive.max_delay_factor) as i64;
        now - timestamp > Duration::milliseconds(max_delay)
    }

    fn apply_comm_fault(&self, entity_id: i64, fault: bool, timestamp: DateTime<Utc>) -> TransitionOutcome {
        let Some(process_id) = self.registry.owning_process(entity_id) else {
            return self.not_found("entity", entity_id);
        };
        let lock = self.locks.lock_for(process_id);
        let outcome = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(entity) = self.registry.get(entity_id) else {
                return self.not_found("entity", entity_id);
            };
            let kind = entity.kind.as_str().to_lowercase();
            if fault {
                let message = format!(
                    "Communication fault tag indicates that {} {} is down.",
                    kind, entity.name
                );
                self.transition_locked(entity_id, Trigger::ControlFault, timestamp, &message)
            } else if entity.status == SupervisionStatus::Down && !self.timer_ok(&entity) {
                // recovery needs a live alive timer
                self.invalid(&entity, Trigger::ControlRecovered)
            } else {
                let message = format!(
                    "Communication fault tag indicates that {} {} is up.",
                    kind, entity.name
                );
                self.transition_locked(entity_id, Trigger::ControlRecovered, timestamp, &message)
            }
        };
        self.cascade(&outcome);
        outcome
    }

    fn timer_ok(&self, entity: &SupervisedEntity) -> bool {
        match entity.alive_timer_id.and_then(|id| self.timers.get(id)) {
            Some(timer) => timer.active && !timer.expired,
            None => true,
        }
    }

    /// Handle one overdue timer found by the sweeper.
    ///
    /// Re-checked under the process lock: a refresh, stop or disconnect that
    /// won the race turns this into a no-op.
    pub fn on_alive_timer_expiration(&self, timer_id: i64, now: DateTime<Utc>) -> TransitionOutcome {
        let Some(timer) = self.timers.get(timer_id) else {
            return self.not_found("alive timer", timer_id);
        };
        let Some(process_id) = self.registry.owning_process(timer.related.id) else {
            return self.not_found("entity", timer.related.id);
        };

        let lock = self.locks.lock_for(process_id);
        let outcome = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            match self.timers.get(timer_id) {
                Some(t) if t.active && !t.expired && t.is_overdue(now) => {
                    self.timers.mark_expired(timer_id);
                    self.metrics.record_expiration();
                    let message = format!(
                        "Alive timer expired: no alive received for {} ms.",
                        t.interval_millis
                    );
                    self.transition_locked(t.related.id, Trigger::AliveExpired, now, &message)
                }
                _ => {
                    debug!(timer_id = timer_id, "Alive timer no longer overdue");
                    TransitionOutcome::Unchanged
                }
            }
        };
        self.cascade(&outcome);
        outcome
    }

    /// One sweep: raise DOWN for every overdue timer. Returns the events raised.
    pub fn check_alive_timers(&self, now: DateTime<Utc>) -> usize {
        self.timers
            .find_expired(now)
            .into_iter()
            .filter(|&id| self.on_alive_timer_expiration(id, now).is_applied())
            .count()
    }

    /// DAQ connection handshake: hands out a new PIK and moves the process to STARTUP.
    pub fn on_connection(&self, request: ProcessConnectionRequest) -> ProcessConnectionResponse {
        let rejected = ProcessConnectionResponse {
            process_name: request.process_name.clone(),
            pik: None,
        };
        let Some(process) = self.registry.find_process_by_name(&request.process_name) else {
            self.metrics.record_not_found();
            warn!(
                process = %request.process_name,
                "Process not configured, rejecting connection request"
            );
            return rejected;
        };

        let test_mode = self
            .runtime
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .test_mode;
        let lock = self.locks.lock_for(process.id);
        let (pik, outcome, restarted) = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(current) = self.registry.get(process.id) else {
                return rejected;
            };
            if current.status.is_running() && !test_mode {
                warn!(
                    process = %current.name,
                    "DAQ process is already running, rejecting connection request"
                );
                return rejected;
            }

            let pik: i64 = rand::thread_rng().gen_range(100_000..i64::MAX);
            let now = Utc::now();
            self.registry.update(process.id, |e| {
                e.session.pik = Some(pik);
                e.session.host = Some(request.host.clone());
                e.session.startup_time = Some(request.startup_time);
                e.session.local_config = true;
            });
            if let Some(timer_id) = current.alive_timer_id {
                self.timers.start(timer_id, now);
            }
            let message = format!("DAQ process {} connected from {}.", current.name, request.host);
            let outcome = self.transition_locked(process.id, Trigger::Connect, now, &message);
            let restarted = self.restart_stopped_children(process.id, now, &message);
            (pik, outcome, restarted)
        };
        self.cascade(&outcome);
        self.cascade_all(restarted);

        info!(process = %process.name, host = %request.host, "Connection request authorized");
        ProcessConnectionResponse {
            process_name: request.process_name,
            pik: Some(pik),
        }
    }

    /// Configuration request after connection. A matching PIK switches the
    /// process to the server configuration.
    pub fn on_configuration(&self, request: ProcessConfigurationRequest) -> ProcessConfigurationResponse {
        let Some(process) = self.registry.find_process_by_name(&request.process_name) else {
            self.metrics.record_not_found();
            warn!(
                process = %request.process_name,
                "Process not configured, rejecting configuration request"
            );
            return ProcessConfigurationResponse {
                process_name: request.process_name,
                accepted: false,
                local_config: true,
            };
        };

        let lock = self.locks.lock_for(process.id);
        let local_config = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.registry
                .update(process.id, |e| {
                    if e.session.pik == Some(request.pik) {
                        e.session.local_config = false;
                    }
                    e.session.local_config
                })
                .unwrap_or(true)
        };
        if local_config {
            debug!(process = %process.name, "PIK mismatch, process keeps its local configuration");
        } else {
            info!(process = %process.name, "Process switched to server configuration");
        }

        ProcessConfigurationResponse {
            process_name: request.process_name,
            accepted: true,
            local_config,
        }
    }

    /// Disconnection notice: process and all its equipment go DOWN.
    ///
    /// Ignored when the PIK is unset or does not match, or the process is not running.
    pub fn on_disconnection(&self, request: ProcessDisconnectionRequest) -> Vec<Arc<SupervisionEvent>> {
        let process = match request.process_id {
            Some(id) => self
                .registry
                .get(id)
                .filter(|e| e.kind == EntityKind::Process),
            None => self.registry.find_process_by_name(&request.process_name),
        };
        let Some(process) = process else {
            self.not_found("process", request.process_id.unwrap_or_default());
            return Vec::new();
        };

        let lock = self.locks.lock_for(process.id);
        let outcomes = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(current) = self.registry.get(process.id) else {
                return Vec::new();
            };
            match current.session.pik {
                None => {
                    warn!(process_id = current.id, "Disconnection for a process without PIK, ignored");
                    return Vec::new();
                }
                Some(pik) if pik != request.pik => {
                    warn!(
                        process_id = current.id,
                        expected = pik,
                        received = request.pik,
                        "Disconnection with a different PIK, ignored"
                    );
                    return Vec::new();
                }
                Some(_) => {}
            }
            if !current.status.is_running() {
                warn!(process_id = current.id, "Disconnection for a process that is not running, ignored");
                return Vec::new();
            }

            if let Some(timer_id) = current.alive_timer_id {
                self.timers.stop(timer_id);
            }
            let message = format!("DAQ process {} was disconnected.", current.name);
            self.transition_family(&current, Trigger::Disconnect, &message)
        };
        self.cascade_all(outcomes)
    }

    /// Administrative stop of a whole process.
    pub fn stop_process(&self, process_id: i64, message: &str) -> Vec<Arc<SupervisionEvent>> {
        let Some(process) = self
            .registry
            .get(process_id)
            .filter(|e| e.kind == EntityKind::Process)
        else {
            self.not_found("process", process_id);
            return Vec::new();
        };

        let lock = self.locks.lock_for(process.id);
        let outcomes = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(timer_id) = process.alive_timer_id {
                self.timers.stop(timer_id);
            }
            self.registry.update(process.id, |e| e.session.pik = None);
            self.transition_family(&process, Trigger::AdminStop, message)
        };
        info!(process = %process.name, "DAQ process stopped");
        self.cascade_all(outcomes)
    }

    /// Administrative stop of a single entity and its alive timers.
    pub fn stop(&self, entity_id: i64, message: &str) -> TransitionOutcome {
        let Some(process_id) = self.registry.owning_process(entity_id) else {
            return self.not_found("entity", entity_id);
        };
        let lock = self.locks.lock_for(process_id);
        let outcome = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(timer_id) = self.registry.get(entity_id).and_then(|e| e.alive_timer_id) {
                self.timers.stop(timer_id);
            }
            self.transition_locked(entity_id, Trigger::AdminStop, Utc::now(), message)
        };
        self.cascade(&outcome);
        outcome
    }

    /// Bring an equipment or sub-equipment stopped with [`stop`](Self::stop)
    /// back to STARTUP.
    ///
    /// Its alive timer restarts when the owning process is connected. A stopped
    /// process restarts through a new connection instead.
    pub fn restart(&self, entity_id: i64, message: &str) -> TransitionOutcome {
        let Some(process_id) = self.registry.owning_process(entity_id) else {
            return self.not_found("entity", entity_id);
        };
        let lock = self.locks.lock_for(process_id);
        let outcome = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(entity) = self.registry.get(entity_id) else {
                return self.not_found("entity", entity_id);
            };
            if entity.kind == EntityKind::Process {
                return self.invalid(&entity, Trigger::Connect);
            }
            if entity.status != SupervisionStatus::Stopped {
                debug!(entity_id = entity_id, status = %entity.status, "Entity not stopped, restart ignored");
                return TransitionOutcome::Unchanged;
            }

            let now = Utc::now();
            let outcome = self.transition_locked(entity_id, Trigger::Connect, now, message);
            let connected = self
                .registry
                .get(process_id)
                .is_some_and(|p| p.status.is_running() && p.session.pik.is_some());
            if outcome.is_applied() && connected {
                if let Some(timer_id) = entity.alive_timer_id {
                    self.timers.start(timer_id, now);
                }
            }
            outcome
        };
        self.cascade(&outcome);
        outcome
    }

    // ---- facade ----

    /// Current status of every entity, timestamped with the read time.
    pub fn get_all_supervision_states(&self) -> Vec<SupervisionEvent> {
        let now = Utc::now();
        self.registry
            .all()
            .iter()
            .map(|entity| {
                let mut event = SupervisionEvent::from_entity(entity, 0);
                event.timestamp = now;
                event
            })
            .collect()
    }

    /// Push the current status of every entity to listeners and tags.
    ///
    /// Used once the caches are loaded. Returns the number of events pushed.
    pub fn refresh_all_supervision_status(&self) -> usize {
        let mut pushed = 0;
        for process in self
            .registry
            .all()
            .into_iter()
            .filter(|e| e.kind == EntityKind::Process)
        {
            let lock = self.locks.lock_for(process.id);
            let events: Vec<Arc<SupervisionEvent>> = {
                let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
                std::iter::once(process.id)
                    .chain(self.registry.descendants(process.id))
                    .filter_map(|id| self.registry.get(id))
                    .map(|entity| self.raise(&entity))
                    .collect()
            };
            for event in &events {
                self.invalidation.apply(event);
            }
            pushed += events.len();
        }
        info!(events = pushed, "Supervision status refreshed");
        pushed
    }

    /// Re-derive every state tag from the registry. Returns the number written.
    pub fn refresh_state_tags(&self) -> usize {
        let written = self
            .registry
            .all()
            .iter()
            .filter(|entity| self.state_tags.write(entity))
            .count();
        info!(state_tags = written, "State tags refreshed");
        written
    }

    // ---- internals ----

    fn require_entity(&self, id: i64) -> Result<SupervisedEntity, ConfigError> {
        self.registry.get(id).ok_or(ConfigError::UnknownEntityId(id))
    }

    fn expand_attachment(&self, attached: &[EntityRef]) -> Result<EntityIds, ConfigError> {
        let mut entities = EntityIds::default();
        for &entity in attached {
            let lineage = self
                .registry
                .lineage(entity)
                .ok_or(ConfigError::UnknownEntity {
                    kind: entity.kind,
                    id: entity.id,
                })?;
            for r in lineage {
                entities.insert(r);
            }
        }
        Ok(entities)
    }

    fn attach_data_tag(&self, tag_id: i64, name: &str, entities: EntityIds) -> Result<(), ConfigError> {
        if self.tags.kind_of(tag_id) == Some(TagKind::Rule) || self.control_tags.contains_key(&tag_id) {
            return Err(ConfigError::TagConflict(tag_id));
        }
        let updated = self.index.register_data_tag(tag_id, entities.clone())?;
        self.tags.upsert_data_tag(tag_id, name, entities)?;
        for rule in updated {
            self.tags.set_rule_entities(rule.rule_id, rule.entities);
        }
        debug!(tag_id = tag_id, "Data tag registered");
        Ok(())
    }

    /// Apply `trigger` to a process and all its descendants. Caller holds the lock.
    fn transition_family(
        &self,
        process: &SupervisedEntity,
        trigger: Trigger,
        message: &str,
    ) -> Vec<TransitionOutcome> {
        let now = Utc::now();
        std::iter::once(process.id)
            .chain(self.registry.descendants(process.id))
            .map(|id| self.transition_locked(id, trigger, now, message))
            .collect()
    }

    /// Move the stopped descendants of a process back to STARTUP. Caller holds the lock.
    fn restart_stopped_children(
        &self,
        process_id: i64,
        now: DateTime<Utc>,
        message: &str,
    ) -> Vec<TransitionOutcome> {
        self.registry
            .descendants(process_id)
            .into_iter()
            .filter(|&id| {
                self.registry
                    .get(id)
                    .is_some_and(|e| e.status == SupervisionStatus::Stopped)
            })
            .map(|id| self.transition_locked(id, Trigger::Connect, now, message))
            .collect()
    }

    /// Decide and apply one transition. Caller holds the owning process lock.
    fn transition_locked(
        &self,
        entity_id: i64,
        trigger: Trigger,
        time: DateTime<Utc>,
        message: &str,
    ) -> TransitionOutcome {
        let Some(entity) = self.registry.get(entity_id) else {
            return self.not_found("entity", entity_id);
        };
        if trigger.is_timestamped() && time < entity.status_time {
            return self.stale("entity", entity_id);
        }

        match decide(entity.status, trigger) {
            Decision::NoOp => TransitionOutcome::Unchanged,
            Decision::Invalid => self.invalid(&entity, trigger),
            Decision::Apply => {
                let Some(updated) =
                    self.registry
                        .set_status(entity_id, trigger.target(), time, message)
                else {
                    return self.not_found("entity", entity_id);
                };
                info!(
                    entity = %updated.entity_ref(),
                    name = %updated.name,
                    from = %entity.status,
                    to = %updated.status,
                    "Supervision status changed"
                );
                TransitionOutcome::Applied(self.raise(&updated))
            }
        }
    }

    /// Build the event, write the state tag and queue it for listeners.
    /// Caller holds the owning process lock, which orders the sequence numbers.
    fn raise(&self, entity: &SupervisedEntity) -> Arc<SupervisionEvent> {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let event = Arc::new(SupervisionEvent::from_entity(entity, sequence));
        self.state_tags.write(entity);
        self.metrics.record_event();
        self.notifier.notify(Arc::clone(&event));
        event
    }

    fn cascade(&self, outcome: &TransitionOutcome) {
        if let TransitionOutcome::Applied(event) = outcome {
            self.invalidation.apply(event);
        }
    }

    fn cascade_all(&self, outcomes: Vec<TransitionOutcome>) -> Vec<Arc<SupervisionEvent>> {
        outcomes
            .into_iter()
            .filter_map(|outcome| match outcome {
                TransitionOutcome::Applied(event) => {
                    self.invalidation.apply(&event);
                    Some(event)
                }
                _ => None,
            })
            .collect()
    }

    fn not_found(&self, what: &'static str, id: i64) -> TransitionOutcome {
        self.metrics.record_not_found();
        warn!(what = what, id = id, "Supervision target not found, ignored");
        TransitionOutcome::Rejected(SupervisionError::NotFound { what, id })
    }

    fn stale(&self, what: &'static str, id: i64) -> TransitionOutcome {
        self.metrics.record_stale_update();
        debug!(what = what, id = id, "Stale update ignored");
        TransitionOutcome::Rejected(SupervisionError::StaleUpdate { what, id })
    }

    fn invalid(&self, entity: &SupervisedEntity, trigger: Trigger) -> TransitionOutcome {
        self.metrics.record_invalid_transition();
        let err = SupervisionError::InvalidTransition {
            kind: entity.kind,
            id: entity.id,
            from: entity.status,
            to: trigger.target(),
        };
        warn!(error = %err, trigger = ?trigger, "Supervision transition rejected");
        TransitionOutcome::Rejected(err)
    }
}
