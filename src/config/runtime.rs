use super::SupervisionConfig;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

/// Runtime switches. Read on every call, so changes take effect without restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Allow a running DAQ process to connect again
    pub test_mode: bool,
    /// Drop alives whose source timestamp is older than the allowed delay
    pub reject_delayed_alive: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            test_mode: false,
            reject_delayed_alive: true,
        }
    }
}

impl RuntimeConfig {
    /// Start from the file configuration, then apply env vars.
    pub fn from_config(config: &SupervisionConfig) -> Self {
        let mut cfg = Self {
            test_mode: config.connection.test_mode,
            ..Self::default()
        };
        cfg.apply_env();
        cfg
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("DAQ_SUPERVISION_TEST_MODE") {
            if let Ok(b) = v.parse::<bool>() {
                self.test_mode = b;
            }
        }
        if let Ok(v) = std::env::var("DAQ_SUPERVISION_REJECT_DELAYED_ALIVE") {
            if let Ok(b) = v.parse::<bool>() {
                self.reject_delayed_alive = b;
            }
        }
    }
}

pub type SharedRuntimeConfig = Arc<RwLock<RuntimeConfig>>;

pub fn new_runtime_config(config: &SupervisionConfig) -> SharedRuntimeConfig {
    Arc::new(RwLock::new(RuntimeConfig::from_config(config)))
}
