// Cascading invalidation: applies supervision quality to every dependent tag

use crate::dependency::DependencyIndex;
use crate::entity::EntityRef;
use crate::error::SupervisionError;
use crate::event::SupervisionEvent;
use crate::metrics::SupervisionMetrics;
use crate::tag::{QualityStatus, TagStore};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, error};


/// Outcome of cascading one event.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CascadeReport {
    pub data_tags: usize,
    pub rule_tags: usize,
    /// Tags whose update or notification failed
    pub failed: Vec<i64>,
    /// Event was older than one already applied for the same entity
    pub stale: bool,
}

impl CascadeReport {
    pub fn notified(&self) -> usize {
        self.data_tags + self.rule_tags
    }

    pub fn error(&self) -> Option<SupervisionError> {
        if self.failed.is_empty() {
            None
        } else {
            Some(SupervisionError::PartialCascadeFailure {
                failed: self.failed.len(),
                total: self.notified() + self.failed.len(),
            })
        }
    }
}

/// Applies or clears the `*_DOWN` flag of the triggering entity on every tag
/// resolved for a supervision event.
pub struct InvalidationEngine {
    index: Arc<DependencyIndex>,
    tags: Arc<TagStore>,
    metrics: Arc<SupervisionMetrics>,
    /// Last applied event sequence per entity
    last_applied: DashMap<EntityRef, u64>,
}

impl InvalidationEngine {
    pub fn new(
        index: Arc<DependencyIndex>,
        tags: Arc<TagStore>,
        metrics: Arc<SupervisionMetrics>,
    ) -> Self {
        Self {
            index,
            tags,
            metrics,
            last_applied: DashMap::new(),
        }
    }

    /// Cascade one event: DataTags first, then RuleTags.
    ///
    /// Only DOWN/STOPPED (flag added) and RUNNING (flag removed) cascade. Each
    /// tag is touched once; a failure on one tag does not stop the batch.
    pub fn apply(&self, event: &SupervisionEvent) -> CascadeReport {
        let mut report = CascadeReport::default();
        let outage = event.is_outage();
        if !outage && !event.is_recovery() {
            return report;
        }

        let entity = event.entity_ref();
        if !self.accept_sequence(entity, event.sequence) {
            debug!(
                entity = %entity,
                sequence = event.sequence,
                "Supervision event overtaken by a newer one, not cascaded"
            );
            report.stale = true;
            return report;
        }

        let flag = QualityStatus::for_entity(event.entity);
        let resolved = self.index.resolve(entity);

        for &tag_id in &resolved.data_tag_ids {
            if self.apply_one(tag_id, flag, entity, outage) {
                report.data_tags += 1;
            } else {
                report.failed.push(tag_id);
            }
        }
        for &rule_id in &resolved.rule_tag_ids {
            if self.apply_one(rule_id, flag, entity, outage) {
                report.rule_tags += 1;
            } else {
                report.failed.push(rule_id);
            }
        }

        self.metrics.record_tags_notified(report.notified() as u64);
        if let Some(err) = report.error() {
            error!(
                entity = %entity,
                status = %event.status,
                failed = ?report.failed,
                error = %err,
                "Supervision cascade incomplete"
            );
        } else {
            debug!(
                entity = %entity,
                status = %event.status,
                data_tags = report.data_tags,
                rule_tags = report.rule_tags,
                "Supervision cascade applied"
            );
        }
        report
    }

    /// Forget the sequence watermark of a removed entity.
    pub fn forget(&self, entity: EntityRef) {
        self.last_applied.remove(&entity);
    }

    fn accept_sequence(&self, entity: EntityRef, sequence: u64) -> bool {
        let mut last = self.last_applied.entry(entity).or_insert(0);
        if sequence != 0 && sequence <= *last {
            return false;
        }
        *last = (*last).max(sequence);
        true
    }

    fn apply_one(&self, tag_id: i64, flag: QualityStatus, entity: EntityRef, outage: bool) -> bool {
        match self.tags.apply_supervision(tag_id, flag, entity.id, outage) {
            Ok(_) => true,
            Err(SupervisionError::ListenerFailure { listener, reason }) => {
                // quality is applied; only the notification failed
                self.metrics.record_cascade_failure();
                error!(
                    tag_id = tag_id,
                    listener = %listener,
                    reason = %reason,
                    "Tag listener notification failed"
                );
                false
            }
            Err(e) => {
                self.metrics.record_cascade_failure();
                error!(tag_id = tag_id, error = %e, "Unable to apply supervision quality");
                false
            }
        }
    }
}
