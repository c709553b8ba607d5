use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// Counters for the supervision engine
pub struct SupervisionMetrics {
    events_raised: AtomicU64,
    stale_updates: AtomicU64,
    invalid_transitions: AtomicU64,
    not_found: AtomicU64,
    listener_overflows: AtomicU64,
    listener_panics: AtomicU64,
    cascade_failures: AtomicU64,
    tags_notified: AtomicU64,
    expirations: AtomicU64,

    /// Time of the last raised event
    last_event: RwLock<Option<DateTime<Utc>>>,
}

impl SupervisionMetrics {
    pub fn new() -> Self {
        Self {
            events_raised: AtomicU64::new(0),
            stale_updates: AtomicU64::new(0),
            invalid_transitions: AtomicU64::new(0),
            not_found: AtomicU64::new(0),
            listener_overflows: AtomicU64::new(0),
            listener_panics: AtomicU64::new(0),
            cascade_failures: AtomicU64::new(0),
            tags_notified: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            last_event: RwLock::new(None),
        }
    }

    /// Record a raised supervision event
    pub fn record_event(&self) {
        self.events_raised.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut last) = self.last_event.write() {
            *last = Some(Utc::now());
        }
    }

    pub fn record_stale_update(&self) {
        self.stale_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalid_transition(&self) {
        self.invalid_transitions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_not_found(&self) {
        self.not_found.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_listener_overflow(&self) {
        self.listener_overflows.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_listener_panic(&self) {
        self.listener_panics.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cascade_failure(&self) {
        self.cascade_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tags_notified(&self, count: u64) {
        self.tags_notified.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_expiration(&self) {
        self.expirations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn events_raised(&self) -> u64 {
        self.events_raised.load(Ordering::Relaxed)
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_raised: self.events_raised(),
            stale_updates: self.stale_updates.load(Ordering::Relaxed),
            invalid_transitions: self.invalid_transitions.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
            listener_overflows: self.listener_overflows.load(Ordering::Relaxed),
            listener_panics: self.listener_panics.load(Ordering::Relaxed),
            cascade_failures: self.cascade_failures.load(Ordering::Relaxed),
            tags_notified: self.tags_notified.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            last_event: self.last_event.read().ok().and_then(|t| *t),
        }
    }
}

impl Default for SupervisionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub events_raised: u64,
    pub stale_updates: u64,
    pub invalid_transitions: u64,
    pub not_found: u64,
    pub listener_overflows: u64,
    pub listener_panics: u64,
    pub cascade_failures: u64,
    pub tags_notified: u64,
    pub expirations: u64,
    pub last_event: Option<DateTime<Utc>>,
}
