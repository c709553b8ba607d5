pub mod runtime;
pub use runtime::{new_runtime_config, RuntimeConfig, SharedRuntimeConfig};

use anyhow::Context;
use serde::Deserialize;
use std::path::Path;

/// Complete supervision engine configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SupervisionConfig {
    #[serde(default)]
    pub alive: AliveConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
}

/// Alive timer configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AliveConfig {
    /// Multiplier applied to every registered alive interval
    #[serde(default = "default_tolerance_factor")]
    pub tolerance_factor: f64,
    /// Alives older than `max_delay_factor * interval` are rejected as delayed
    #[serde(default = "default_max_delay_factor")]
    pub max_delay_factor: f64,
}

fn default_tolerance_factor() -> f64 {
    1.0
}

fn default_max_delay_factor() -> f64 {
    2.0
}

impl Default for AliveConfig {
    fn default() -> Self {
        Self {
            tolerance_factor: default_tolerance_factor(),
            max_delay_factor: default_max_delay_factor(),
        }
    }
}

/// Expiry sweeper configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SweeperConfig {
    #[serde(default = "default_sweeper_enabled")]
    pub enabled: bool,
    /// Scan period in milliseconds
    #[serde(default = "default_sweep_interval")]
    pub interval_millis: u64,
}

fn default_sweeper_enabled() -> bool {
    true
}

fn default_sweep_interval() -> u64 {
    500
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: default_sweeper_enabled(),
            interval_millis: default_sweep_interval(),
        }
    }
}

/// Listener fan-out configuration
#[derive(Debug, Clone, Deserialize)]
pub struct NotifierConfig {
    #[serde(default = "default_concurrency")]
    pub default_concurrency: usize,
    #[serde(default = "default_queue_size")]
    pub default_queue_size: usize,
    /// Upper bound for workers per listener
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

fn default_concurrency() -> usize {
    1
}

fn default_queue_size() -> usize {
    1024
}

fn default_max_concurrency() -> usize {
    16
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            default_concurrency: default_concurrency(),
            default_queue_size: default_queue_size(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

/// DAQ connection handshake configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectionConfig {
    /// Allow a DAQ process to reconnect while it is still running
    #[serde(default)]
    pub test_mode: bool,
}

/// Load configuration from TOML file
pub fn load_config(path: impl AsRef<Path>) -> anyhow::Result<SupervisionConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let config: SupervisionConfig = toml::from_str(&contents)
        .with_context(|| format!("parsing config file {}", path.display()))?;
    Ok(config)
}
