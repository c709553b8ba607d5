use crate::error::{ConfigError, SupervisionError};
use crate::tag::{DataTag, EntityIds, QualityStatus, RuleTag, TagKind, TagQuality, TagSnapshot};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{trace, warn};

/// Receives a snapshot of every tag whose supervision quality was touched.
///
/// Called synchronously from the cascade; implementations should hand the
/// snapshot off (channel, cache put) rather than do I/O inline.
pub trait TagListener: Send + Sync {
    fn on_supervision_change(&self, tag: &TagSnapshot) -> anyhow::Result<()>;

    /// Human-readable name (for logs)
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// In-memory DataTag and RuleTag caches with their listeners.
pub struct TagStore {
    data_tags: DashMap<i64, DataTag>,
    rule_tags: DashMap<i64, RuleTag>,
    listeners: RwLock<Vec<Arc<dyn TagListener>>>,
}

impl TagStore {
    pub fn new() -> Self {
        Self {
            data_tags: DashMap::new(),
            rule_tags: DashMap::new(),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn TagListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Insert a data tag, or update its name and entities keeping its quality.
    pub fn upsert_data_tag(
        &self,
        id: i64,
        name: &str,
        entities: EntityIds,
    ) -> Result<(), ConfigError> {
        if self.rule_tags.contains_key(&id) {
            return Err(ConfigError::TagConflict(id));
        }
        let mut tag = self.data_tags.entry(id).or_insert_with(|| DataTag {
            id,
            name: name.to_string(),
            entities: EntityIds::default(),
            quality: TagQuality::new(),
            value: None,
            timestamp: None,
        });
        tag.name = name.to_string();
        tag.entities = entities;
        Ok(())
    }

    /// Insert a rule tag, or update its inputs and entity union keeping its quality.
    pub fn upsert_rule_tag(
        &self,
        id: i64,
        name: &str,
        input_ids: BTreeSet<i64>,
        entities: EntityIds,
    ) -> Result<(), ConfigError> {
        if self.data_tags.contains_key(&id) {
            return Err(ConfigError::TagConflict(id));
        }
        let mut tag = self.rule_tags.entry(id).or_insert_with(|| RuleTag {
            id,
            name: name.to_string(),
            input_ids: BTreeSet::new(),
            entities: EntityIds::default(),
            quality: TagQuality::new(),
            value: None,
            timestamp: None,
        });
        tag.name = name.to_string();
        tag.input_ids = input_ids;
        tag.entities = entities;
        Ok(())
    }

    /// Replace the precomputed entity union of a rule.
    pub fn set_rule_entities(&self, id: i64, entities: EntityIds) {
        if let Some(mut tag) = self.rule_tags.get_mut(&id) {
            tag.entities = entities;
        }
    }

    pub fn remove(&self, id: i64) -> Option<TagKind> {
        if self.data_tags.remove(&id).is_some() {
            return Some(TagKind::Data);
        }
        self.rule_tags.remove(&id).map(|_| TagKind::Rule)
    }

    pub fn kind_of(&self, id: i64) -> Option<TagKind> {
        if self.data_tags.contains_key(&id) {
            Some(TagKind::Data)
        } else if self.rule_tags.contains_key(&id) {
            Some(TagKind::Rule)
        } else {
            None
        }
    }

    pub fn data_tag(&self, id: i64) -> Option<DataTag> {
        self.data_tags.get(&id).map(|t| t.clone())
    }

    pub fn rule_tag(&self, id: i64) -> Option<RuleTag> {
        self.rule_tags.get(&id).map(|t| t.clone())
    }

    pub fn snapshot(&self, id: i64) -> Option<TagSnapshot> {
        if let Some(tag) = self.data_tags.get(&id) {
            return Some(TagSnapshot::from(&*tag));
        }
        self.rule_tags.get(&id).map(|tag| TagSnapshot::from(&*tag))
    }

    pub fn len(&self) -> usize {
        self.data_tags.len() + self.rule_tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store a new value (evaluation itself happens outside this crate).
    pub fn update_value(
        &self,
        id: i64,
        value: Value,
        timestamp: DateTime<Utc>,
    ) -> Option<TagSnapshot> {
        self.modify(id, |v, ts, _| {
            *v = Some(value);
            *ts = Some(timestamp);
        })
    }

    /// Raise a non-supervision quality flag and notify listeners.
    pub fn set_quality(
        &self,
        id: i64,
        flag: QualityStatus,
    ) -> Result<TagSnapshot, SupervisionError> {
        let snapshot = self
            .modify(id, |_, _, q| {
                q.set(flag);
            })
            .ok_or(SupervisionError::NotFound { what: "tag", id })?;
        self.notify_listeners(&snapshot)?;
        Ok(snapshot)
    }

    /// Clear a quality flag and notify listeners.
    pub fn clear_quality(
        &self,
        id: i64,
        flag: QualityStatus,
    ) -> Result<TagSnapshot, SupervisionError> {
        let snapshot = self
            .modify(id, |_, _, q| {
                q.clear(flag);
            })
            .ok_or(SupervisionError::NotFound { what: "tag", id })?;
        self.notify_listeners(&snapshot)?;
        Ok(snapshot)
    }

    /// Add (outage) or remove (recovery) `entity_id` as cause of a supervision
    /// flag, then notify listeners with the updated snapshot.
    ///
    /// Listeners are notified even when the quality did not change.
    pub fn apply_supervision(
        &self,
        id: i64,
        flag: QualityStatus,
        entity_id: i64,
        outage: bool,
    ) -> Result<TagSnapshot, SupervisionError> {
        let snapshot = self
            .modify(id, |_, _, q| {
                if outage {
                    q.add_cause(flag, entity_id);
                } else {
                    q.remove_cause(flag, entity_id);
                }
            })
            .ok_or(SupervisionError::NotFound { what: "tag", id })?;

        trace!(tag_id = id, ?flag, outage, "Supervision quality applied");
        self.notify_listeners(&snapshot)?;
        Ok(snapshot)
    }

    /// Call every listener; one failing listener does not stop the others.
    pub fn notify_listeners(&self, snapshot: &TagSnapshot) -> Result<(), SupervisionError> {
        let listeners: Vec<Arc<dyn TagListener>> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut failures = Vec::new();
        for listener in &listeners {
            let result = catch_unwind(AssertUnwindSafe(|| listener.on_supervision_change(snapshot)));
            let reason = match result {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(panic) => panic_message(panic.as_ref()),
            };
            warn!(
                listener = listener.name(),
                tag_id = snapshot.id,
                reason = %reason,
                "Tag listener failed"
            );
            failures.push((listener.name().to_string(), reason));
        }

        if failures.is_empty() {
            Ok(())
        } else {
            let listener = failures
                .iter()
                .map(|(n, _)| n.as_str())
                .collect::<Vec<_>>()
                .join(",");
            let reason = failures
                .into_iter()
                .map(|(_, r)| r)
                .collect::<Vec<_>>()
                .join("; ");
            Err(SupervisionError::ListenerFailure { listener, reason })
        }
    }

    /// Mutate value/timestamp/quality of either tag kind; returns the new snapshot.
    fn modify(
        &self,
        id: i64,
        f: impl FnOnce(&mut Option<Value>, &mut Option<DateTime<Utc>>, &mut TagQuality),
    ) -> Option<TagSnapshot> {
        if let Some(mut tag) = self.data_tags.get_mut(&id) {
            let t = &mut *tag;
            f(&mut t.value, &mut t.timestamp, &mut t.quality);
            return Some(TagSnapshot::from(&*t));
        }
        let mut tag = self.rule_tags.get_mut(&id)?;
        let t = &mut *tag;
        f(&mut t.value, &mut t.timestamp, &mut t.quality);
        Some(TagSnapshot::from(&*t))
    }
}

impl Default for TagStore {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
