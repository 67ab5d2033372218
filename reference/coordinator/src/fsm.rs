//! The per-node singleton state machine.
//!
//! [`SingletonMachine::handle`] reacts to exactly one [`Event`] and never
//! spawns, sends or sleeps. The side effects it wants are returned as
//! [`Effect`]s which the runtime performs in order, so the whole transition
//! table can be exercised without tasks, timers or sockets.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use baton_common::{Address, BatonError, Result, UnitId};
use baton_protocol::SingletonMessage;

use crate::config::{CoordinatorConfig, RetryLimits};
use crate::event::Event;
use crate::removed_members::RemovedMembers;
use crate::state::{SingletonState, StateData};
use crate::transition::{Effect, Outcome, Step, TimerKey, Transition};

/// Single-owner state machine of one coordinator instance.
#[derive(Debug)]
pub struct SingletonMachine {
    self_address: Address,
    limits: RetryLimits,
    retry_interval: Duration,
    removal_margin: Duration,
    state: SingletonState,
    data: StateData,
    removed: RemovedMembers,
    /// Whether the notifier delivered since the last credit was handed out.
    oldest_changed_received: bool,
    self_exited: bool,
    cluster_terminated: bool,
    terminated: bool,
    effects: Vec<Effect>,
}

impl SingletonMachine {
    /// Create a machine in `Start` / `Uninitialized`.
    pub fn new(
        self_address: Address,
        limits: RetryLimits,
        retry_interval: Duration,
        removal_margin: Duration,
        removed_ttl: Duration,
    ) -> Self {
        Self {
            self_address,
            limits,
            retry_interval,
            removal_margin,
            state: SingletonState::Start,
            data: StateData::Uninitialized,
            removed: RemovedMembers::new(removed_ttl),
            oldest_changed_received: true,
            self_exited: false,
            cluster_terminated: false,
            terminated: false,
            effects: Vec::new(),
        }
    }

    /// Create a machine from validated configuration.
    pub fn from_config(config: &CoordinatorConfig) -> Result<Self> {
        config.validate()?;
        let limits = RetryLimits::derive(config)?;
        Ok(Self::new(
            config.node.self_address.clone(),
            limits,
            config.singleton.hand_over_retry_interval,
            config.effective_removal_margin(),
            config.singleton.removed_ttl,
        ))
    }

    /// Handle one event.
    pub fn handle(&mut self, event: Event, now: Instant) -> Step {
        if self.terminated {
            debug!(event = event.name(), "Coordinator terminated, dropping event");
            return Step {
                effects: Vec::new(),
                outcome: Outcome::Stopped,
            };
        }

        let transition = match self.on_state(&event, now) {
            Some(transition) => transition,
            None => self.unhandled(&event, now),
        };
        let outcome = self.apply(transition, now);
        if outcome != Outcome::Continue {
            self.terminated = true;
        }

        Step {
            effects: std::mem::take(&mut self.effects),
            outcome,
        }
    }

    pub fn state(&self) -> SingletonState {
        self.state
    }

    pub fn data(&self) -> &StateData {
        &self.data
    }

    pub fn self_address(&self) -> &Address {
        &self.self_address
    }

    pub fn limits(&self) -> RetryLimits {
        self.limits
    }

    pub fn self_exited(&self) -> bool {
        self.self_exited
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Check if `address` is a removed member that is still remembered.
    pub fn is_removed(&self, address: &Address, now: Instant) -> bool {
        self.removed.contains(address, now)
    }

    /// Number of removed-member entries, including expired ones not yet swept.
    pub fn removed_count(&self) -> usize {
        self.removed.len()
    }

    /// The managed unit if it is hosted and still running.
    pub fn active_unit(&self) -> Option<UnitId> {
        match &self.data {
            StateData::Oldest {
                unit,
                unit_terminated: false,
            }
            | StateData::WasOldest {
                unit,
                unit_terminated: false,
                ..
            } => Some(*unit),
            _ => None,
        }
    }

    /// The incarnation whose end has not been observed yet, hosted or stopping.
    pub fn running_unit(&self) -> Option<UnitId> {
        match &self.data {
            StateData::HandingOver { unit, .. } | StateData::Stopping { unit } => Some(*unit),
            _ => self.active_unit(),
        }
    }

    // --- Per-state handlers; `None` falls through to `unhandled` ---

    fn on_state(&mut self, event: &Event, now: Instant) -> Option<Transition> {
        match self.state {
            SingletonState::Start => self.on_start(event),
            SingletonState::Younger => self.on_younger(event, now),
            SingletonState::BecomingOldest => self.on_becoming_oldest(event, now),
            SingletonState::Oldest => self.on_oldest(event, now),
            SingletonState::WasOldest => self.on_was_oldest(event, now),
            SingletonState::HandingOver => self.on_handing_over(event, now),
            SingletonState::Stopping => self.on_stopping(event),
            SingletonState::End => self.on_end(event),
        }
    }

    fn on_start(&mut self, event: &Event) -> Option<Transition> {
        match event {
            Event::StartNotifier => {
                self.emit(Effect::StartNotifier);
                self.get_next_oldest_changed();
                Some(Transition::Stay)
            }
            Event::InitialOldest {
                oldest,
                safe_to_be_oldest,
            } => {
                self.oldest_changed_received = true;
                let is_self = oldest.as_ref() == Some(&self.self_address);
                if is_self && *safe_to_be_oldest {
                    Some(self.go_to_oldest())
                } else if is_self {
                    Some(Transition::Goto(
                        SingletonState::BecomingOldest,
                        StateData::BecomingOldest {
                            previous_oldest: None,
                        },
                    ))
                } else {
                    Some(Transition::Goto(
                        SingletonState::Younger,
                        StateData::Younger {
                            oldest: oldest.clone(),
                        },
                    ))
                }
            }
            _ => None,
        }
    }

    fn on_younger(&mut self, event: &Event, now: Instant) -> Option<Transition> {
        let StateData::Younger { oldest } = self.data.clone() else {
            return None;
        };

        match event {
            Event::OldestChanged { oldest: new_oldest } => {
                self.oldest_changed_received = true;
                if new_oldest.as_ref() == Some(&self.self_address) {
                    info!(
                        node = %self.self_address,
                        previous_oldest = ?oldest,
                        "Younger observed OldestChanged, becoming oldest"
                    );
                    match oldest {
                        Some(previous) if !self.removed.contains(&previous, now) => {
                            self.send(&previous, SingletonMessage::HandOverToMe);
                            Some(Transition::Goto(
                                SingletonState::BecomingOldest,
                                StateData::BecomingOldest {
                                    previous_oldest: Some(previous),
                                },
                            ))
                        }
                        _ => Some(self.go_to_oldest()),
                    }
                } else {
                    self.get_next_oldest_changed();
                    Some(Transition::StayUsing(StateData::Younger {
                        oldest: new_oldest.clone(),
                    }))
                }
            }
            Event::MemberRemoved { address } => Some(self.on_removed_while_waiting(address)),
            Event::DelayedMemberRemoved { address } if oldest.as_ref() == Some(address) => {
                info!(node = %self.self_address, previous_oldest = %address, "Previous oldest removed");
                self.removed.add(address.clone(), now);
                Some(Transition::StayUsing(StateData::Younger { oldest: None }))
            }
            _ => None,
        }
    }

    fn on_becoming_oldest(&mut self, event: &Event, now: Instant) -> Option<Transition> {
        let StateData::BecomingOldest { previous_oldest } = self.data.clone() else {
            return None;
        };

        match event {
            Event::Peer {
                from,
                message: SingletonMessage::HandOverInProgress,
            } => {
                debug!(node = %self.self_address, from = %from, "Hand-over in progress");
                self.emit(Effect::CancelTimer(TimerKey::HandOverRetry));
                Some(Transition::Stay)
            }
            Event::Peer {
                from,
                message: SingletonMessage::HandOverDone,
            } => match &previous_oldest {
                Some(previous) if previous == from => {
                    info!(node = %self.self_address, from = %from, "Singleton hand-over done");
                    Some(self.go_to_oldest())
                }
                Some(previous) => {
                    warn!(
                        node = %self.self_address,
                        expected = %previous,
                        from = %from,
                        "Ignoring HandOverDone from unexpected sender"
                    );
                    Some(Transition::Stay)
                }
                None => None,
            },
            Event::MemberRemoved { address } => Some(self.on_removed_while_waiting(address)),
            Event::DelayedMemberRemoved { address } if previous_oldest.as_ref() == Some(address) => {
                info!(node = %self.self_address, previous_oldest = %address, "Previous oldest removed");
                self.removed.add(address.clone(), now);
                Some(self.go_to_oldest())
            }
            Event::Peer {
                from,
                message: SingletonMessage::TakeOverFromMe,
            } => match &previous_oldest {
                None => {
                    self.send(from, SingletonMessage::HandOverToMe);
                    Some(Transition::StayUsing(StateData::BecomingOldest {
                        previous_oldest: Some(from.clone()),
                    }))
                }
                Some(previous) if previous == from => {
                    self.send(from, SingletonMessage::HandOverToMe);
                    Some(Transition::Stay)
                }
                Some(previous) => {
                    info!(
                        node = %self.self_address,
                        expected = %previous,
                        from = %from,
                        "Ignoring TakeOver request from unexpected sender"
                    );
                    Some(Transition::Stay)
                }
            },
            Event::HandOverRetry { count } => {
                Some(self.on_hand_over_retry(*count, previous_oldest, now))
            }
            _ => None,
        }
    }

    fn on_hand_over_retry(
        &mut self,
        count: u32,
        previous_oldest: Option<Address>,
        now: Instant,
    ) -> Transition {
        let max = self.limits.max_hand_over_retries;

        if count <= max {
            if max - count <= 3 {
                info!(node = %self.self_address, previous_oldest = ?previous_oldest, count, max, "Retry HandOverToMe");
            } else {
                debug!(node = %self.self_address, previous_oldest = ?previous_oldest, count, max, "Retry HandOverToMe");
            }
            if let Some(previous) = &previous_oldest {
                self.send(previous, SingletonMessage::HandOverToMe);
            }
            self.emit(Effect::StartTimer {
                key: TimerKey::HandOverRetry,
                event: Event::HandOverRetry { count: count + 1 },
                after: self.retry_interval,
            });
            Transition::Stay
        } else if previous_oldest
            .as_ref()
            .map_or(false, |previous| self.removed.contains(previous, now))
        {
            // can't send HandOverToMe; previous oldest is confirmed removed
            self.go_to_oldest()
        } else if self.cluster_terminated {
            Transition::Stop
        } else {
            let reason = format!(
                "Becoming singleton oldest was stuck because previous oldest [{}] is unresponsive",
                display_address(&previous_oldest)
            );
            error!(node = %self.self_address, count, max, "{}", reason);
            Transition::Fatal(BatonError::CoordinatorIsStuck(reason))
        }
    }

    fn on_oldest(&mut self, event: &Event, now: Instant) -> Option<Transition> {
        let StateData::Oldest {
            unit,
            unit_terminated,
        } = self.data.clone()
        else {
            return None;
        };

        match event {
            Event::OldestChanged { oldest } => {
                self.oldest_changed_received = true;
                info!(node = %self.self_address, new_oldest = ?oldest, "Oldest observed OldestChanged");
                match oldest {
                    Some(address) if address == &self.self_address => Some(Transition::Stay),
                    Some(address) if !self.self_exited && self.removed.contains(address, now) => {
                        // a removed member claims to be oldest again
                        warn!(node = %self.self_address, claimed = %address, "Oldest claim from removed member, handing over to nobody");
                        Some(self.go_to_handing_over(unit, unit_terminated, None, now))
                    }
                    Some(address) => {
                        self.send(address, SingletonMessage::TakeOverFromMe);
                        Some(self.go_to_was_oldest(unit, unit_terminated, Some(address.clone())))
                    }
                    None => Some(self.go_to_was_oldest(unit, unit_terminated, None)),
                }
            }
            Event::Peer {
                from,
                message: SingletonMessage::HandOverToMe,
            } => Some(self.go_to_handing_over(unit, unit_terminated, Some(from.clone()), now)),
            Event::UnitTerminated { unit: ended } if *ended == unit => {
                info!(node = %self.self_address, unit = %unit, "Singleton terminated while oldest");
                Some(Transition::StayUsing(StateData::Oldest {
                    unit,
                    unit_terminated: true,
                }))
            }
            _ => None,
        }
    }

    fn on_was_oldest(&mut self, event: &Event, now: Instant) -> Option<Transition> {
        let StateData::WasOldest {
            unit,
            unit_terminated,
            new_oldest,
        } = self.data.clone()
        else {
            return None;
        };

        match event {
            Event::TakeOverRetry { count } => {
                Some(self.on_take_over_retry(*count, unit, unit_terminated, new_oldest, now))
            }
            Event::Peer {
                from,
                message: SingletonMessage::HandOverToMe,
            } => Some(self.go_to_handing_over(unit, unit_terminated, Some(from.clone()), now)),
            Event::MemberRemoved { address }
                if address == &self.self_address && !self.self_exited =>
            {
                info!(node = %self.self_address, "Self removed, stopping coordinator");
                Some(Transition::Stop)
            }
            Event::MemberRemoved { address }
                if new_oldest.as_ref() == Some(address) && !self.self_exited =>
            {
                info!(node = %self.self_address, new_oldest = %address, "New oldest removed");
                self.removed.add(address.clone(), now);
                Some(self.go_to_handing_over(unit, unit_terminated, None, now))
            }
            Event::UnitTerminated { unit: ended } if *ended == unit => {
                Some(Transition::StayUsing(StateData::WasOldest {
                    unit,
                    unit_terminated: true,
                    new_oldest,
                }))
            }
            _ => None,
        }
    }

    fn on_take_over_retry(
        &mut self,
        count: u32,
        unit: UnitId,
        unit_terminated: bool,
        new_oldest: Option<Address>,
        now: Instant,
    ) -> Transition {
        let max = self.limits.max_take_over_retries;

        if (self.cluster_terminated || self.self_exited) && (new_oldest.is_none() || count > max) {
            self.stop_or_stopping(unit, unit_terminated)
        } else if count <= max {
            if max - count <= 3 {
                info!(node = %self.self_address, new_oldest = ?new_oldest, count, max, "Retry TakeOverFromMe");
            } else {
                debug!(node = %self.self_address, new_oldest = ?new_oldest, count, max, "Retry TakeOverFromMe");
            }
            if let Some(next) = &new_oldest {
                self.send(next, SingletonMessage::TakeOverFromMe);
            }
            self.emit(Effect::StartTimer {
                key: TimerKey::TakeOverRetry,
                event: Event::TakeOverRetry { count: count + 1 },
                after: self.retry_interval,
            });
            Transition::Stay
        } else if new_oldest
            .as_ref()
            .map_or(true, |next| self.removed.contains(next, now))
        {
            info!(node = %self.self_address, new_oldest = ?new_oldest, "Nobody left to take over, stopping singleton");
            self.stop_or_stopping(unit, unit_terminated)
        } else {
            let reason = format!(
                "Expected hand-over to [{}] never occurred",
                display_address(&new_oldest)
            );
            error!(node = %self.self_address, count, max, "{}", reason);
            Transition::Fatal(BatonError::CoordinatorIsStuck(reason))
        }
    }

    fn on_handing_over(&mut self, event: &Event, now: Instant) -> Option<Transition> {
        let StateData::HandingOver { unit, hand_over_to } = self.data.clone() else {
            return None;
        };

        match event {
            Event::UnitTerminated { unit: ended } if *ended == unit => {
                Some(self.hand_over_done(hand_over_to, now))
            }
            Event::Peer {
                from,
                message: SingletonMessage::HandOverToMe,
            } if hand_over_to.as_ref() == Some(from) => {
                // retry from the same requester, answer again
                self.send(from, SingletonMessage::HandOverInProgress);
                Some(Transition::Stay)
            }
            _ => None,
        }
    }

    fn on_stopping(&mut self, event: &Event) -> Option<Transition> {
        let StateData::Stopping { unit } = self.data else {
            return None;
        };

        match event {
            Event::UnitTerminated { unit: ended } if *ended == unit => {
                info!(node = %self.self_address, unit = %unit, "Singleton stopped");
                Some(Transition::Stop)
            }
            _ => None,
        }
    }

    fn on_end(&mut self, event: &Event) -> Option<Transition> {
        match event {
            Event::MemberRemoved { address } if address == &self.self_address => {
                info!(node = %self.self_address, "Self removed, stopping coordinator");
                Some(Transition::Stop)
            }
            _ => None,
        }
    }

    /// Fallback applied in every state.
    fn unhandled(&mut self, event: &Event, now: Instant) -> Transition {
        match event {
            Event::CurrentClusterState => Transition::Stay,
            Event::MemberExited { address } if address == &self.self_address => {
                info!(node = %self.self_address, "Exited");
                self.self_exited = true;
                Transition::Stay
            }
            Event::MemberRemoved { address }
                if address == &self.self_address && !self.self_exited =>
            {
                info!(node = %self.self_address, "Self removed, stopping coordinator");
                Transition::Stop
            }
            Event::MemberRemoved { address } => {
                if !self.self_exited {
                    info!(node = %self.self_address, member = %address, "Member removed");
                }
                self.removed.add(address.clone(), now);
                Transition::Stay
            }
            Event::DelayedMemberRemoved { address } => {
                info!(node = %self.self_address, member = %address, "Member removed");
                self.removed.add(address.clone(), now);
                Transition::Stay
            }
            Event::Peer {
                from,
                message: SingletonMessage::TakeOverFromMe,
            } => {
                info!(
                    node = %self.self_address,
                    state = ?self.state,
                    from = %from,
                    "Ignoring TakeOver request"
                );
                Transition::Stay
            }
            Event::Cleanup => {
                self.removed.cleanup(now);
                Transition::Stay
            }
            Event::ClusterShutdown => {
                info!(node = %self.self_address, state = ?self.state, "Cluster membership terminated");
                self.cluster_terminated = true;
                Transition::Stay
            }
            other => {
                debug!(
                    node = %self.self_address,
                    state = ?self.state,
                    event = other.name(),
                    "Unhandled event"
                );
                Transition::Stay
            }
        }
    }

    // --- Shared transitions ---

    fn on_removed_while_waiting(&mut self, address: &Address) -> Transition {
        if address == &self.self_address {
            info!(node = %self.self_address, "Self removed, stopping coordinator");
            Transition::Stop
        } else {
            self.emit(Effect::ScheduleOnce {
                event: Event::DelayedMemberRemoved {
                    address: address.clone(),
                },
                after: self.removal_margin,
            });
            Transition::Stay
        }
    }

    fn go_to_oldest(&mut self) -> Transition {
        let unit = UnitId::new();
        info!(node = %self.self_address, unit = %unit, "Singleton manager starting singleton");
        self.emit(Effect::StartUnit(unit));
        Transition::Goto(
            SingletonState::Oldest,
            StateData::Oldest {
                unit,
                unit_terminated: false,
            },
        )
    }

    fn go_to_was_oldest(
        &mut self,
        unit: UnitId,
        unit_terminated: bool,
        new_oldest: Option<Address>,
    ) -> Transition {
        self.emit(Effect::StartTimer {
            key: TimerKey::TakeOverRetry,
            event: Event::TakeOverRetry { count: 1 },
            after: self.retry_interval,
        });
        Transition::Goto(
            SingletonState::WasOldest,
            StateData::WasOldest {
                unit,
                unit_terminated,
                new_oldest,
            },
        )
    }

    fn go_to_handing_over(
        &mut self,
        unit: UnitId,
        unit_terminated: bool,
        hand_over_to: Option<Address>,
        now: Instant,
    ) -> Transition {
        if unit_terminated {
            return self.hand_over_done(hand_over_to, now);
        }

        if let Some(to) = &hand_over_to {
            self.send(to, SingletonMessage::HandOverInProgress);
        }
        self.emit(Effect::TerminateUnit(unit));
        Transition::Goto(
            SingletonState::HandingOver,
            StateData::HandingOver { unit, hand_over_to },
        )
    }

    fn hand_over_done(&mut self, hand_over_to: Option<Address>, now: Instant) -> Transition {
        info!(
            node = %self.self_address,
            to = ?hand_over_to,
            "Singleton terminated, hand-over done"
        );
        if let Some(to) = &hand_over_to {
            self.send(to, SingletonMessage::HandOverDone);
        }

        if self.removed.contains(&self.self_address, now) {
            info!(node = %self.self_address, "Self removed, stopping coordinator");
            Transition::Stop
        } else if self.self_exited {
            Transition::Goto(SingletonState::End, StateData::End)
        } else {
            Transition::Goto(
                SingletonState::Younger,
                StateData::Younger {
                    oldest: hand_over_to,
                },
            )
        }
    }

    fn stop_or_stopping(&mut self, unit: UnitId, unit_terminated: bool) -> Transition {
        if unit_terminated {
            Transition::Stop
        } else {
            self.emit(Effect::TerminateUnit(unit));
            Transition::Goto(SingletonState::Stopping, StateData::Stopping { unit })
        }
    }

    // --- Plumbing ---

    fn apply(&mut self, transition: Transition, now: Instant) -> Outcome {
        match transition {
            Transition::Stay => Outcome::Continue,
            Transition::StayUsing(data) => {
                self.data = data;
                Outcome::Continue
            }
            Transition::Goto(next, data) => {
                let previous = self.state;
                self.state = next;
                self.data = data;
                if previous != next {
                    self.on_transition(previous, next, now)
                } else {
                    Outcome::Continue
                }
            }
            Transition::Stop => Outcome::Stopped,
            Transition::Fatal(err) => Outcome::Fatal(err),
        }
    }

    fn on_transition(&mut self, from: SingletonState, to: SingletonState, now: Instant) -> Outcome {
        info!(node = %self.self_address, from = ?from, to = ?to, "Singleton state transition");

        if from == SingletonState::BecomingOldest {
            self.emit(Effect::CancelTimer(TimerKey::HandOverRetry));
        }
        if from == SingletonState::WasOldest {
            self.emit(Effect::CancelTimer(TimerKey::TakeOverRetry));
        }
        if to == SingletonState::BecomingOldest {
            self.emit(Effect::StartTimer {
                key: TimerKey::HandOverRetry,
                event: Event::HandOverRetry { count: 1 },
                after: self.retry_interval,
            });
        }
        if matches!(to, SingletonState::Younger | SingletonState::Oldest) {
            self.get_next_oldest_changed();
        }
        if matches!(to, SingletonState::Younger | SingletonState::End)
            && self.removed.contains(&self.self_address, now)
        {
            info!(node = %self.self_address, "Self removed, stopping coordinator");
            return Outcome::Stopped;
        }

        Outcome::Continue
    }

    fn get_next_oldest_changed(&mut self) {
        if self.oldest_changed_received {
            self.oldest_changed_received = false;
            self.emit(Effect::RequestNextOldest);
        }
    }

    fn send(&mut self, to: &Address, message: SingletonMessage) {
        self.emit(Effect::Send {
            to: to.clone(),
            message,
        });
    }

    fn emit(&mut self, effect: Effect) {
        self.effects.push(effect);
    }
}

fn display_address(address: &Option<Address>) -> String {
    address
        .as_ref()
        .map(Address::to_string)
        .unwrap_or_else(|| "none".to_string())
}
