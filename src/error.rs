use crate::entity::{EntityKind, SupervisionStatus};
use thiserror::Error;

/// Errors raised to the configuration loader at registration time.
///
/// These are the only fatal errors in the crate: runtime event processing
/// never returns them.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("alive interval must be positive, got {0} ms")]
    InvalidInterval(i64),

    #[error("alive tolerance factor must be >= 1.0, got {0}")]
    InvalidToleranceFactor(f64),

    #[error("unknown {kind} {id}")]
    UnknownEntity { kind: EntityKind, id: i64 },

    #[error("unknown entity {0}")]
    UnknownEntityId(i64),

    #[error("entity {id} is already registered as {existing}")]
    KindConflict { id: i64, existing: EntityKind },

    #[error("unknown alive timer {0}")]
    UnknownTimer(i64),

    #[error("alive timer {0} is already registered for another entity")]
    TimerConflict(i64),

    #[error("rule {rule_id} reads unknown input {input_id}")]
    UnknownRuleInput { rule_id: i64, input_id: i64 },

    #[error("rule {rule_id} depends on itself through {input_id}")]
    CyclicRule { rule_id: i64, input_id: i64 },

    #[error("rule {rule_id} exceeds the maximum input depth of {max_depth}")]
    RuleTooDeep { rule_id: i64, max_depth: usize },

    #[error("tag {0} is already registered with a different type")]
    TagConflict(i64),

    #[error("tag {0} must be attached to at least one entity")]
    UnattachedTag(i64),
}

/// Runtime error taxonomy.
///
/// Runtime entry points log these and report them inside an outcome value
/// instead of propagating them, so the sweeper and update handlers keep running.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SupervisionError {
    #[error("{what} {id} not found")]
    NotFound { what: &'static str, id: i64 },

    #[error("{kind} {id}: no transition from {from} to {to}")]
    InvalidTransition {
        kind: EntityKind,
        id: i64,
        from: SupervisionStatus,
        to: SupervisionStatus,
    },

    #[error("stale update for {what} {id}")]
    StaleUpdate { what: &'static str, id: i64 },

    #[error("listener '{listener}' failed: {reason}")]
    ListenerFailure { listener: String, reason: String },

    #[error("{failed} of {total} tags could not be updated")]
    PartialCascadeFailure { failed: usize, total: usize },
}

impl SupervisionError {
    /// Short stable label for logs and metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            SupervisionError::NotFound { .. } => "not_found",
            SupervisionError::InvalidTransition { .. } => "invalid_transition",
            SupervisionError::StaleUpdate { .. } => "stale_update",
            SupervisionError::ListenerFailure { .. } => "listener_failure",
            SupervisionError::PartialCascadeFailure { .. } => "partial_cascade_failure",
        }
    }
}
