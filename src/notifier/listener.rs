use crate::event::SupervisionEvent;
use async_trait::async_trait;

/// Receiver of supervision status changes.
///
/// Called from the listener's own worker task(s), never under a process lock.
/// Slow listeners only fill their own queue.
#[async_trait]
pub trait SupervisionListener: Send + Sync + 'static {
    async fn on_supervision_event(&self, event: &SupervisionEvent);

    /// Name used in logs and overflow reports.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}
