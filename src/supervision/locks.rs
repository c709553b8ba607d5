// Per-process locks serializing every status change under one DAQ process

use dashmap::DashMap;
use std::sync::{Arc, Mutex};

/// Map of process id to mutex.
///
/// Locks are created lazily on first use and dropped only when the process is
/// removed from the configuration.
pub struct ProcessLocks {
    locks: DashMap<i64, Arc<Mutex<()>>>,
}

impl ProcessLocks {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Lock handle for `process_id`. The same handle is returned on every call.
    pub fn lock_for(&self, process_id: i64) -> Arc<Mutex<()>> {
        self.locks
            .entry(process_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn remove(&self, process_id: i64) {
        self.locks.remove(&process_id);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl Default for ProcessLocks {
    fn default() -> Self {
        Self::new()
    }
}
