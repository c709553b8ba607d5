//! Supervision engine for DAQ processes and their equipment.
//!
//! Tracks alive timers, decides status transitions under a per-process lock,
//! fans supervision events out to listeners and cascades quality changes to
//! every data tag and rule tag depending on the affected entity.

// Alive timers and the expiry sweeper
pub mod alive;

// Engine and runtime configuration
pub mod config;

// Reverse indices and rule unions
pub mod dependency;

// Supervised entities and their registry
pub mod entity;

pub mod error;

// Supervision event model
pub mod event;

// Tag quality cascade
pub mod invalidation;

pub mod metrics;

// Listener fan-out
pub mod notifier;

// State machine, locks and DAQ handshake
pub mod supervision;

// Data tags, rule tags and quality
pub mod tag;

pub use config::{load_config, SupervisionConfig};
pub use error::{ConfigError, SupervisionError};
pub use event::SupervisionEvent;
pub use supervision::{SupervisionManager, TransitionOutcome};
