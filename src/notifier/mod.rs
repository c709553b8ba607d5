//! Fan-out of supervision events to registered listeners.
//!
//! ```text
//! notify(event)
//!     │
//!     ├──► [queue 1] ──► worker(s) 1 ──► listener1.on_supervision_event()
//!     │    (bounded)
//!     └──► [queue N] ──► worker(s) N ──► listenerN.on_supervision_event()
//!          (bounded)
//! ```
//!
//! - `notify()` never blocks: it uses `try_send`, a full queue drops the event
//!   for that listener only and is reported back to the caller.
//! - With the default single worker a listener sees events in submission order.
//! - A panicking listener is isolated; its worker keeps running.
//! - Events are queued from registration on, but workers only start consuming
//!   once the returned [`Lifecycle`] is started. After `stop()` no more events
//!   are queued for that listener.

mod lifecycle;
mod listener;
mod log;

pub use lifecycle::Lifecycle;
pub use listener::SupervisionListener;
pub use log::LogListener;

use crate::config::NotifierConfig;
use crate::event::SupervisionEvent;
use crate::metrics::SupervisionMetrics;
use lifecycle::LifecycleState;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, warn};


/// Per-listener queue metadata.
struct ListenerSlot {
    id: u64,
    name: String,
    sender: mpsc::Sender<Arc<SupervisionEvent>>,
    state: Arc<LifecycleState>,
}

/// Result of one `notify()` call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NotifyReport {
    pub queued: usize,
    /// Listeners whose queue was full or closed
    pub rejected: Vec<String>,
}

/// Registry of supervision listeners, each with its own bounded queue.
pub struct SupervisionNotifier {
    slots: RwLock<Vec<ListenerSlot>>,
    next_id: AtomicU64,
    config: NotifierConfig,
    metrics: Arc<SupervisionMetrics>,
}

impl SupervisionNotifier {
    pub fn new(config: NotifierConfig, metrics: Arc<SupervisionMetrics>) -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            config,
            metrics,
        }
    }

    /// Register with the configured default concurrency and queue size.
    pub fn register(&self, listener: Arc<dyn SupervisionListener>) -> Lifecycle {
        self.register_as_listener(
            listener,
            self.config.default_concurrency,
            self.config.default_queue_size,
        )
    }

    /// Register a listener served by `concurrency` workers and a queue of
    /// `queue_size` events.
    ///
    /// Concurrency is clamped to `1..=max_concurrency`, queue size to at least 1.
    /// Nothing is delivered until [`Lifecycle::start`] is called.
    pub fn register_as_listener(
        &self,
        listener: Arc<dyn SupervisionListener>,
        concurrency: usize,
        queue_size: usize,
    ) -> Lifecycle {
        let concurrency = concurrency.clamp(1, self.config.max_concurrency.max(1));
        let queue_size = queue_size.max(1);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = listener.name().to_string();

        let (tx, rx) = mpsc::channel::<Arc<SupervisionEvent>>(queue_size);
        let state = Arc::new(LifecycleState::new());

        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ListenerSlot {
                id,
                name: name.clone(),
                sender: tx,
                state: Arc::clone(&state),
            });

        debug!(
            listener = %name,
            concurrency = concurrency,
            queue_size = queue_size,
            "Supervision listener registered"
        );

        Lifecycle::new(
            id,
            listener,
            rx,
            concurrency,
            state,
            Arc::clone(&self.metrics),
        )
    }

    /// Remove a listener's queue. Its workers drain what is queued and exit.
    pub fn unregister(&self, lifecycle: &Lifecycle) {
        lifecycle.stop();
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|slot| slot.id != lifecycle.id());
    }

    /// Queue `event` for every listener that is not stopped.
    ///
    /// Never blocks; a full queue is logged and reported, the other listeners
    /// still receive the event. Slots of stopped or dropped lifecycles are
    /// pruned afterwards.
    pub fn notify(&self, event: Arc<SupervisionEvent>) -> NotifyReport {
        let mut report = NotifyReport::default();
        let mut stale = false;

        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        for slot in slots.iter() {
            if slot.state.is_stopped() {
                stale = true;
                continue;
            }
            match slot.sender.try_send(Arc::clone(&event)) {
                Ok(()) => report.queued += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.metrics.record_listener_overflow();
                    warn!(
                        listener = %slot.name,
                        entity = %event.entity_ref(),
                        status = %event.status,
                        "Listener queue full, supervision event dropped"
                    );
                    report.rejected.push(slot.name.clone());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.metrics.record_listener_overflow();
                    warn!(listener = %slot.name, "Listener queue closed, supervision event dropped");
                    report.rejected.push(slot.name.clone());
                }
            }
        }
        drop(slots);

        if stale {
            self.prune_stopped();
        }
        report
    }

    fn prune_stopped(&self) {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        let before = slots.len();
        slots.retain(|slot| !slot.state.is_stopped());
        debug!(pruned = before - slots.len(), "Stopped listeners removed");
    }

    pub fn listener_count(&self) -> usize {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
