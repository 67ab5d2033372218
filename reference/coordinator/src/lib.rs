//! Baton Coordinator
//!
//! Keeps exactly one incarnation of a managed unit running on the oldest
//! eligible node of a cluster. Every node runs a coordinator; the oldest
//! hosts the unit and hands it over to its successor when it leaves.

pub mod config;
pub mod coordinator;
pub mod event;
pub mod fsm;
pub mod membership;
pub mod metrics;
pub mod notifier;
pub mod peer;
pub mod removed_members;
pub mod state;
pub mod timers;
pub mod transition;
pub mod unit;

pub use config::{CoordinatorConfig, RetryLimits, TerminationSignal};
pub use coordinator::{Coordinator, CoordinatorHandle, Inbound};
pub use event::Event;
pub use fsm::SingletonMachine;
pub use membership::LocalMembership;
pub use notifier::{MembershipNotifierFactory, MembershipSource, NotifierFactory, OldestNotifier};
pub use peer::{LocalPeerRegistry, PeerRef, PeerResolver};
pub use state::{SingletonState, SingletonStatus};
pub use unit::{ManagedUnit, UnitContext, UnitFactory, UnitInput, UnitRef, UnitSupervisor};
