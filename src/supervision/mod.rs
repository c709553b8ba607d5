//! Supervision state machine.
//!
//! Every status change of a process or of one of its equipment is decided and
//! applied while holding that process's lock; the resulting event is queued
//! for listeners under the same lock and cascaded to the dependent tags after
//! the lock is released.

mod control;
mod locks;
mod manager;
mod state_tags;
mod transition;

pub use control::{
    ControlTagRole, ProcessConfigurationRequest, ProcessConfigurationResponse,
    ProcessConnectionRequest, ProcessConnectionResponse, ProcessDisconnectionRequest,
    SourceControlValue,
};
pub use locks::ProcessLocks;
pub use manager::{SupervisionManager, TransitionOutcome};
pub use state_tags::{StateTagStore, StateTagValue};
pub use transition::{decide, Decision, Trigger};

#[cfg(test)]
mod tests;
