//! Events consumed by the singleton state machine.

use baton_common::{Address, UnitId};
use baton_protocol::{Envelope, SingletonMessage};

/// Everything the coordinator reacts to, already decoded and attributed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Self became `Up`; start the oldest-change notifier.
    StartNotifier,
    /// First notification from the notifier.
    InitialOldest {
        oldest: Option<Address>,
        safe_to_be_oldest: bool,
    },
    /// The oldest member changed.
    OldestChanged { oldest: Option<Address> },
    /// Handshake message from a peer coordinator.
    Peer {
        from: Address,
        message: SingletonMessage,
    },
    /// Hand-over retry timer fired.
    HandOverRetry { count: u32 },
    /// Take-over retry timer fired.
    TakeOverRetry { count: u32 },
    /// A member finished leaving.
    MemberExited { address: Address },
    /// A member was removed from the cluster.
    MemberRemoved { address: Address },
    /// Removal margin elapsed for a removed member.
    DelayedMemberRemoved { address: Address },
    /// The managed unit ended.
    UnitTerminated { unit: UnitId },
    /// Membership snapshot; nothing to do beyond ignoring it.
    CurrentClusterState,
    /// The membership substrate shut down.
    ClusterShutdown,
    /// Periodic removed-member sweep.
    Cleanup,
}

impl Event {
    /// Short name used in logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            Event::StartNotifier => "StartNotifier",
            Event::InitialOldest { .. } => "InitialOldest",
            Event::OldestChanged { .. } => "OldestChanged",
            Event::Peer { message, .. } => match message {
                SingletonMessage::HandOverToMe => "HandOverToMe",
                SingletonMessage::HandOverInProgress => "HandOverInProgress",
                SingletonMessage::HandOverDone => "HandOverDone",
                SingletonMessage::TakeOverFromMe => "TakeOverFromMe",
            },
            Event::HandOverRetry { .. } => "HandOverRetry",
            Event::TakeOverRetry { .. } => "TakeOverRetry",
            Event::MemberExited { .. } => "MemberExited",
            Event::MemberRemoved { .. } => "MemberRemoved",
            Event::DelayedMemberRemoved { .. } => "DelayedMemberRemoved",
            Event::UnitTerminated { .. } => "UnitTerminated",
            Event::CurrentClusterState => "CurrentClusterState",
            Event::ClusterShutdown => "ClusterShutdown",
            Event::Cleanup => "Cleanup",
        }
    }
}

impl From<Envelope> for Event {
    fn from(envelope: Envelope) -> Self {
        Event::Peer {
            from: envelope.sender,
            message: envelope.message,
        }
    }
}
