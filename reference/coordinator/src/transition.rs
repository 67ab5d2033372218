//! Transition results and side effects produced by the state machine.

use std::time::Duration;

use baton_common::{Address, BatonError, UnitId};
use baton_protocol::SingletonMessage;

use crate::event::Event;
use crate::state::{SingletonState, StateData};

/// Name of a cancellable timer. Starting a keyed timer replaces any
/// pending timer with the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKey {
    HandOverRetry,
    TakeOverRetry,
    Cleanup,
}

/// Side effect requested by the state machine and performed by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Spawn the oldest-change notifier.
    StartNotifier,
    /// Give the notifier one credit.
    RequestNextOldest,
    /// Fire-and-forget message to a peer coordinator.
    Send {
        to: Address,
        message: SingletonMessage,
    },
    /// Create the managed unit.
    StartUnit(UnitId),
    /// Deliver the termination signal to the managed unit.
    TerminateUnit(UnitId),
    /// Start (or restart) a keyed timer.
    StartTimer {
        key: TimerKey,
        event: Event,
        after: Duration,
    },
    /// Cancel a keyed timer.
    CancelTimer(TimerKey),
    /// Untracked one-shot timer.
    ScheduleOnce { event: Event, after: Duration },
}

/// Result of a per-state handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Keep state and data.
    Stay,
    /// Keep state, replace data.
    StayUsing(StateData),
    /// Move to another state.
    Goto(SingletonState, StateData),
    /// Terminate the coordinator.
    Stop,
    /// Terminate the coordinator with an error.
    Fatal(BatonError),
}

/// What the runtime should do after performing the effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Continue,
    Stopped,
    Fatal(BatonError),
}

/// Effects plus outcome of handling one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub effects: Vec<Effect>,
    pub outcome: Outcome,
}

impl Step {
    /// Check if nothing happened.
    pub fn is_noop(&self) -> bool {
        self.effects.is_empty() && self.outcome == Outcome::Continue
    }

    /// Messages sent by this step, in order.
    pub fn sent(&self) -> Vec<(&Address, SingletonMessage)> {
        self.effects
            .iter()
            .filter_map(|e| match e {
                Effect::Send { to, message } => Some((to, *message)),
                _ => None,
            })
            .collect()
    }
}
