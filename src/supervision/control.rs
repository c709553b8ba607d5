// DAQ handshake messages and control tag routing types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What a control tag reports on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlTagRole {
    /// Alive signal feeding an alive timer
    Alive { timer_id: i64 },
    /// Communication fault flag of an equipment; `fault_value` means down
    CommFault { entity_id: i64, fault_value: Value },
    /// Server-written status representation of an entity
    State { entity_id: i64 },
}

/// Control tag value as delivered by a DAQ.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SourceControlValue {
    pub tag_id: i64,
    pub value: Value,
    /// Time the value was acquired at the source
    pub source_timestamp: Option<DateTime<Utc>>,
    /// Time the DAQ sent the value
    pub daq_timestamp: Option<DateTime<Utc>>,
}

impl SourceControlValue {
    pub fn new(tag_id: i64, value: Value, source_timestamp: DateTime<Utc>) -> Self {
        Self {
            tag_id,
            value,
            source_timestamp: Some(source_timestamp),
            daq_timestamp: None,
        }
    }

    /// Earliest of the two timestamps that are set.
    pub fn supervision_timestamp(&self) -> Option<DateTime<Utc>> {
        match (self.source_timestamp, self.daq_timestamp) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessConnectionRequest {
    pub process_name: String,
    pub host: String,
    pub startup_time: DateTime<Utc>,
}

/// `pik` is `None` when the connection was rejected.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessConnectionResponse {
    pub process_name: String,
    pub pik: Option<i64>,
}

impl ProcessConnectionResponse {
    pub fn is_accepted(&self) -> bool {
        self.pik.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessConfigurationRequest {
    pub process_name: String,
    pub pik: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessConfigurationResponse {
    pub process_name: String,
    pub accepted: bool,
    /// False once the DAQ runs on the server configuration
    pub local_config: bool,
}

/// Disconnection notice; `process_id` takes precedence over the name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessDisconnectionRequest {
    pub process_id: Option<i64>,
    pub process_name: String,
    pub pik: i64,
}
