// Alive timers: per-entity liveness records and the expiry sweeper

mod sweeper;

pub use sweeper::AliveTimerSweeper;

use crate::entity::EntityRef;
use crate::error::ConfigError;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;


/// Liveness record tied to the periodic alive signal of one entity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AliveTimer {
    pub id: i64,
    pub related: EntityRef,

    /// Effective interval, tolerance factor already applied
    pub interval_millis: i64,

    pub last_update: DateTime<Utc>,
    pub active: bool,

    /// Set once the sweeper has raised DOWN for the current outage
    pub expired: bool,

    /// Equipment / sub-equipment timers owned by a process timer
    pub dependent_timer_ids: BTreeSet<i64>,
}

impl AliveTimer {
    /// True when `now` is at least one interval past the last update.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        now - self.last_update >= Duration::milliseconds(self.interval_millis)
    }
}

/// Alive timer configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AliveTimerDefinition {
    pub id: i64,
    pub related: EntityRef,
    pub interval_millis: i64,
}

/// Result of an alive refresh.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Timestamp accepted; `was_expired` tells whether an outage was pending
    Refreshed { was_expired: bool },
    /// Older than the recorded last update
    Stale,
    /// Timer is stopped
    Inactive,
    NotFound,
}

/// Store of every alive timer, keyed by timer id.
pub struct AliveTimerStore {
    timers: DashMap<i64, AliveTimer>,
    tolerance_factor: f64,
}

impl AliveTimerStore {
    pub fn new(tolerance_factor: f64) -> Self {
        Self {
            timers: DashMap::new(),
            tolerance_factor,
        }
    }

    /// Register (or reconfigure) a timer. New timers start inactive.
    pub fn register(&self, def: &AliveTimerDefinition) -> Result<AliveTimer, ConfigError> {
        if def.interval_millis <= 0 {
            return Err(ConfigError::InvalidInterval(def.interval_millis));
        }
        if !(self.tolerance_factor >= 1.0) {
            return Err(ConfigError::InvalidToleranceFactor(self.tolerance_factor));
        }
        if let Some(existing) = self.timers.get(&def.id) {
            if existing.related != def.related {
                return Err(ConfigError::TimerConflict(def.id));
            }
        }

        let interval_millis = (def.interval_millis as f64 * self.tolerance_factor).ceil() as i64;
        let mut entry = self.timers.entry(def.id).or_insert_with(|| AliveTimer {
            id: def.id,
            related: def.related,
            interval_millis,
            last_update: Utc::now(),
            active: false,
            expired: false,
            dependent_timer_ids: BTreeSet::new(),
        });
        entry.interval_millis = interval_millis;
        Ok(entry.clone())
    }

    /// Add `child` to the dependents of `parent`.
    pub fn add_dependent(&self, parent: i64, child: i64) -> Result<(), ConfigError> {
        if !self.timers.contains_key(&child) {
            return Err(ConfigError::UnknownTimer(child));
        }
        let mut timer = self
            .timers
            .get_mut(&parent)
            .ok_or(ConfigError::UnknownTimer(parent))?;
        timer.dependent_timer_ids.insert(child);
        Ok(())
    }

    /// Remove a timer, detaching it from any parent.
    pub fn remove(&self, id: i64) -> Option<AliveTimer> {
        let removed = self.timers.remove(&id).map(|(_, t)| t);
        if removed.is_some() {
            for mut timer in self.timers.iter_mut() {
                timer.dependent_timer_ids.remove(&id);
            }
        }
        removed
    }

    pub fn get(&self, id: i64) -> Option<AliveTimer> {
        self.timers.get(&id).map(|t| t.clone())
    }

    pub fn is_active(&self, id: i64) -> bool {
        self.timers.get(&id).map(|t| t.active).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Accept an alive signal, unless it is older than the last update.
    pub fn refresh(&self, id: i64, timestamp: DateTime<Utc>) -> RefreshOutcome {
        let mut timer = match self.timers.get_mut(&id) {
            Some(t) => t,
            None => return RefreshOutcome::NotFound,
        };
        if !timer.active {
            return RefreshOutcome::Inactive;
        }
        if timestamp < timer.last_update {
            return RefreshOutcome::Stale;
        }
        let was_expired = timer.expired;
        timer.last_update = timestamp;
        timer.expired = false;
        RefreshOutcome::Refreshed { was_expired }
    }

    /// Activate a timer and its dependents. Returns the ids that changed.
    ///
    /// Starting resets the last update to `now`, so a fresh timer gets a full
    /// interval before it can expire.
    pub fn start(&self, id: i64, now: DateTime<Utc>) -> Vec<i64> {
        self.cascade(id, |timer| {
            let changed = !timer.active;
            timer.active = true;
            timer.expired = false;
            timer.last_update = now;
            changed
        })
    }

    /// Deactivate a timer and its dependents. Returns the ids that changed.
    pub fn stop(&self, id: i64) -> Vec<i64> {
        self.cascade(id, |timer| {
            let changed = timer.active;
            timer.active = false;
            timer.expired = false;
            changed
        })
    }

    /// Mark the current outage as reported.
    pub fn mark_expired(&self, id: i64) {
        if let Some(mut timer) = self.timers.get_mut(&id) {
            timer.expired = true;
        }
    }

    /// Every active, not yet reported timer whose interval has elapsed at `now`.
    ///
    /// Pure scan, ordered by timer id.
    pub fn find_expired(&self, now: DateTime<Utc>) -> Vec<i64> {
        let mut expired: Vec<i64> = self
            .timers
            .iter()
            .filter(|t| t.active && !t.expired && t.is_overdue(now))
            .map(|t| t.id)
            .collect();
        expired.sort_unstable();
        expired
    }

    fn cascade(&self, id: i64, mut apply: impl FnMut(&mut AliveTimer) -> bool) -> Vec<i64> {
        let mut changed = Vec::new();
        let mut visited = BTreeSet::new();
        let mut pending = vec![id];

        while let Some(current) = pending.pop() {
            if !visited.insert(current) {
                continue;
            }
            let Some(mut timer) = self.timers.get_mut(&current) else {
                debug!(timer_id = current, "Dependent alive timer not registered, skipping");
                continue;
            };
            if apply(&mut timer) {
                changed.push(current);
            }
            pending.extend(timer.dependent_timer_ids.iter().copied());
        }
        changed
    }
}

impl Default for AliveTimerStore {
    fn default() -> Self {
        Self::new(1.0)
    }
}
