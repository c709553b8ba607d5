use super::SupervisionListener;
use crate::event::SupervisionEvent;
use async_trait::async_trait;
use tracing::{info, warn};

/// Writes every supervision event to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogListener;

#[async_trait]
impl SupervisionListener for LogListener {
    async fn on_supervision_event(&self, event: &SupervisionEvent) {
        if event.is_outage() {
            warn!(
                entity = %event.entity_ref(),
                name = %event.entity_name,
                status = %event.status,
                message = %event.message,
                "Supervision status changed"
            );
        } else {
            info!(
                entity = %event.entity_ref(),
                name = %event.entity_name,
                status = %event.status,
                message = %event.message,
                "Supervision status changed"
            );
        }
    }

    fn name(&self) -> &str {
        "log"
    }
}
