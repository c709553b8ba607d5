use crate::entity::SupervisionStatus;

/// What caused a status change request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trigger {
    /// DAQ connection handshake accepted
    Connect,
    AliveReceived,
    /// Comm-fault tag reports the equipment as working
    ControlRecovered,
    AliveExpired,
    Disconnect,
    /// Comm-fault tag reports a fault
    ControlFault,
    AdminStop,
}

impl Trigger {
    pub fn target(&self) -> SupervisionStatus {
        match self {
            Trigger::Connect => SupervisionStatus::Startup,
            Trigger::AliveReceived | Trigger::ControlRecovered => SupervisionStatus::Running,
            Trigger::AliveExpired | Trigger::Disconnect | Trigger::ControlFault => {
                SupervisionStatus::Down
            }
            Trigger::AdminStop => SupervisionStatus::Stopped,
        }
    }

    /// Triggers whose source timestamp is checked against the entity's status
    /// time. Alive staleness is judged by the alive timer instead.
    pub fn is_timestamped(&self) -> bool {
        matches!(self, Trigger::ControlRecovered | Trigger::ControlFault)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Apply,
    /// Already in the target status
    NoOp,
    Invalid,
}

/// Transition table.
///
/// STOPPED only leaves through a new connection or an explicit restart; nothing
/// moves an entity back to UNCERTAIN.
pub fn decide(current: SupervisionStatus, trigger: Trigger) -> Decision {
    let target = trigger.target();
    if current == target {
        return Decision::NoOp;
    }
    match (current, target) {
        (_, SupervisionStatus::Startup) => Decision::Apply,
        (SupervisionStatus::Stopped, SupervisionStatus::Running | SupervisionStatus::Down) => {
            Decision::Invalid
        }
        (_, SupervisionStatus::Running | SupervisionStatus::Down) => Decision::Apply,
        (_, SupervisionStatus::Stopped) => Decision::Apply,
        (_, SupervisionStatus::Uncertain) => Decision::Invalid,
    }
}
