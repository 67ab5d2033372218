//! Coordinator state definitions.

use baton_common::{Address, UnitId};
use serde::{Deserialize, Serialize};

use crate::unit::UnitRef;

/// Macro-state of the singleton coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SingletonState {
    /// Waiting for the first oldest notification.
    Start,
    /// Another node is responsible for the managed unit.
    Younger,
    /// Waiting for the previous oldest to hand over.
    BecomingOldest,
    /// Hosting the managed unit.
    Oldest,
    /// Still hosting, but a new oldest was announced.
    WasOldest,
    /// Managed unit told to stop; completion goes to the new oldest.
    HandingOver,
    /// Managed unit told to stop with nobody to hand over to.
    Stopping,
    /// Self left the cluster gracefully; waiting for removal.
    End,
}

impl SingletonState {
    /// Check if this state may host a live managed unit.
    pub fn hosts_unit(&self) -> bool {
        matches!(
            self,
            SingletonState::Oldest
                | SingletonState::WasOldest
                | SingletonState::HandingOver
                | SingletonState::Stopping
        )
    }

    /// Numeric code used by the state gauge.
    pub fn code(&self) -> u64 {
        match self {
            SingletonState::Start => 0,
            SingletonState::Younger => 1,
            SingletonState::BecomingOldest => 2,
            SingletonState::Oldest => 3,
            SingletonState::WasOldest => 4,
            SingletonState::HandingOver => 5,
            SingletonState::Stopping => 6,
            SingletonState::End => 7,
        }
    }
}

/// Data carried alongside [`SingletonState`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateData {
    /// Only valid with `Start`.
    Uninitialized,
    /// `oldest` is believed to be responsible, possibly unknown.
    Younger { oldest: Option<Address> },
    /// Awaiting hand-over from `previous_oldest`, if there was one.
    BecomingOldest { previous_oldest: Option<Address> },
    /// Hosting `unit`; `unit_terminated` latches once it ends.
    Oldest { unit: UnitId, unit_terminated: bool },
    /// Still hosting while a take-over request to `new_oldest` is pending.
    WasOldest {
        unit: UnitId,
        unit_terminated: bool,
        new_oldest: Option<Address>,
    },
    /// `unit` is stopping; completion is reported to `hand_over_to`.
    HandingOver {
        unit: UnitId,
        hand_over_to: Option<Address>,
    },
    /// `unit` is stopping with no hand-over target.
    Stopping { unit: UnitId },
    /// Self exited the cluster.
    End,
}

impl StateData {
    /// The managed unit referenced by this data, if any.
    pub fn unit(&self) -> Option<UnitId> {
        match self {
            StateData::Oldest { unit, .. }
            | StateData::WasOldest { unit, .. }
            | StateData::HandingOver { unit, .. }
            | StateData::Stopping { unit } => Some(*unit),
            _ => None,
        }
    }
}

/// Observable coordinator status.
#[derive(Debug, Clone, Serialize)]
pub struct SingletonStatus {
    /// Current macro-state.
    pub state: SingletonState,
    /// Locally hosted managed unit, when active.
    pub unit: Option<UnitRef>,
    /// Reason of a stuck condition, latched until the instance is recreated.
    pub stuck: Option<String>,
    /// Whether the coordinator loop has terminated.
    pub stopped: bool,
}

impl SingletonStatus {
    /// Status of a freshly created coordinator.
    pub fn initial() -> Self {
        Self {
            state: SingletonState::Start,
            unit: None,
            stuck: None,
            stopped: false,
        }
    }

    /// Check if the coordinator is hosting an active unit.
    pub fn is_active(&self) -> bool {
        self.unit.is_some()
    }
}

impl Default for SingletonStatus {
    fn default() -> Self {
        Self::initial()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hosting_states() {
        assert!(SingletonState::Oldest.hosts_unit());
        assert!(SingletonState::HandingOver.hosts_unit());
        assert!(!SingletonState::Younger.hosts_unit());
        assert!(!SingletonState::BecomingOldest.hosts_unit());
    }

    #[test]
    fn test_unit_of_data() {
        let unit = UnitId::new();
        assert_eq!(
            StateData::Oldest {
                unit,
                unit_terminated: false
            }
            .unit(),
            Some(unit)
        );
        assert_eq!(StateData::Younger { oldest: None }.unit(), None);
    }
}
