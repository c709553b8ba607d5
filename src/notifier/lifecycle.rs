use super::SupervisionListener;
use crate::event::SupervisionEvent;
use crate::metrics::SupervisionMetrics;
use crate::tag::panic_message;
use futures::FutureExt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

const REGISTERED: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED: u8 = 2;

/// Shared between the notifier slot and the listener's [`Lifecycle`].
pub(super) struct LifecycleState {
    phase: AtomicU8,
}

impl LifecycleState {
    pub(super) fn new() -> Self {
        Self {
            phase: AtomicU8::new(REGISTERED),
        }
    }

    pub(super) fn is_stopped(&self) -> bool {
        self.phase.load(Ordering::Acquire) == STOPPED
    }
}

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<Arc<SupervisionEvent>>>>;

/// Start/stop handle of one registered listener.
///
/// Events queue up from registration on; `start()` spawns the workers that
/// drain them. `stop()` stops accepting new events and lets the workers finish
/// what is already queued.
pub struct Lifecycle {
    id: u64,
    listener: Arc<dyn SupervisionListener>,
    receiver: SharedReceiver,
    concurrency: usize,
    state: Arc<LifecycleState>,
    metrics: Arc<SupervisionMetrics>,
    token: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Lifecycle {
    pub(super) fn new(
        id: u64,
        listener: Arc<dyn SupervisionListener>,
        receiver: mpsc::Receiver<Arc<SupervisionEvent>>,
        concurrency: usize,
        state: Arc<LifecycleState>,
        metrics: Arc<SupervisionMetrics>,
    ) -> Self {
        Self {
            id,
            listener,
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            concurrency,
            state,
            metrics,
            token: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub(super) fn id(&self) -> u64 {
        self.id
    }

    pub fn listener_name(&self) -> &str {
        self.listener.name()
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Spawn the listener's workers. Must be called from within a tokio runtime.
    /// Has no effect once started or stopped.
    pub fn start(&self) {
        if self
            .state
            .phase
            .compare_exchange(REGISTERED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        for worker in 0..self.concurrency {
            workers.push(tokio::spawn(run_worker(
                worker,
                Arc::clone(&self.listener),
                Arc::clone(&self.receiver),
                self.token.clone(),
                Arc::clone(&self.metrics),
            )));
        }
        debug!(
            listener = self.listener.name(),
            workers = self.concurrency,
            "Supervision listener started"
        );
    }

    /// Stop accepting events. Queued events are still delivered if started.
    pub fn stop(&self) {
        let previous = self.state.phase.swap(STOPPED, Ordering::AcqRel);
        if previous != STOPPED {
            self.token.cancel();
            debug!(listener = self.listener.name(), "Supervision listener stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.phase.load(Ordering::Acquire) == RUNNING
    }

    /// Stop and wait for the workers to drain the queue.
    pub async fn shutdown(&self) {
        self.stop();
        let workers: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in workers {
            let _ = handle.await;
        }
    }
}

impl Drop for Lifecycle {
    fn drop(&mut self) {
        self.state.phase.store(STOPPED, Ordering::Release);
        self.token.cancel();
    }
}

async fn run_worker(
    worker: usize,
    listener: Arc<dyn SupervisionListener>,
    receiver: SharedReceiver,
    token: CancellationToken,
    metrics: Arc<SupervisionMetrics>,
) {
    loop {
        let next = {
            let mut rx = receiver.lock().await;
            if token.is_cancelled() {
                // drain without waiting
                rx.try_recv().ok()
            } else {
                tokio::select! {
                    event = rx.recv() => event,
                    _ = token.cancelled() => rx.try_recv().ok(),
                }
            }
        };

        let Some(event) = next else {
            break;
        };

        let fut = listener.on_supervision_event(event.as_ref());
        if let Err(panic) = std::panic::AssertUnwindSafe(fut).catch_unwind().await {
            metrics.record_listener_panic();
            error!(
                listener = listener.name(),
                worker = worker,
                entity = %event.entity_ref(),
                reason = %panic_message(panic.as_ref()),
                "Supervision listener panicked"
            );
        }
    }
    debug!(listener = listener.name(), worker = worker, "Listener worker exited");
}
