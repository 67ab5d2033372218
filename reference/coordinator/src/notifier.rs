//! Oldest-change notifier.
//!
//! Turns the membership event stream into the ordered, credit-gated
//! `InitialOldest` / `OldestChanged` notifications the coordinator consumes.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use baton_common::{Address, ClusterEvent, CurrentClusterState, Member, MemberStatus};

use crate::coordinator::Inbound;
use crate::event::Event;

/// Membership service the notifier subscribes to.
pub trait MembershipSource: Send + Sync {
    /// Current snapshot plus every event published after it.
    fn subscribe(&self) -> (CurrentClusterState, broadcast::Receiver<ClusterEvent>);
}

/// Running notifier as seen by the coordinator.
pub trait OldestNotifier: Send {
    /// Hand out one credit.
    fn request_next(&mut self);
}

/// Starts the notifier once the coordinator asks for it.
pub trait NotifierFactory: Send + Sync {
    fn start(&self, inbox: mpsc::Sender<Inbound>) -> Box<dyn OldestNotifier>;
}

/// Age-ordered view of eligible members plus undelivered notifications.
#[derive(Debug, Default)]
pub struct OldestChangeBuffer {
    self_address: Option<Address>,
    role: Option<String>,
    members_by_age: Vec<Member>,
    initialized: bool,
    changes: VecDeque<Event>,
    credits: u32,
}

impl OldestChangeBuffer {
    pub fn new(self_address: Address, role: Option<String>) -> Self {
        Self {
            self_address: Some(self_address),
            role,
            ..Self::default()
        }
    }

    /// Seed from a snapshot and queue `InitialOldest`.
    pub fn initialize(&mut self, state: &CurrentClusterState) {
        self.members_by_age = state
            .members
            .iter()
            .filter(|m| matches!(m.status, MemberStatus::Up | MemberStatus::Leaving))
            .filter(|m| self.matches_role(m))
            .cloned()
            .collect();
        self.members_by_age.sort_by(|a, b| a.age_ordering(b));

        let safe_to_be_oldest = !state
            .members
            .iter()
            .any(|m| matches!(m.status, MemberStatus::Down | MemberStatus::Exiting));

        let oldest = self.oldest();
        debug!(oldest = ?oldest, safe_to_be_oldest, "Initial oldest");
        self.changes.push_back(Event::InitialOldest {
            oldest,
            safe_to_be_oldest,
        });
        self.initialized = true;
    }

    /// Apply a membership event, queueing `OldestChanged` when the head moves.
    pub fn on_event(&mut self, event: ClusterEvent) {
        if !self.initialized {
            if let ClusterEvent::CurrentClusterState(state) = &event {
                self.initialize(state);
            } else {
                debug!("Membership event before snapshot, ignoring");
            }
            return;
        }

        match event {
            ClusterEvent::MemberUp(member) => {
                if self.matches_role(&member) {
                    self.track_change(|members| {
                        members.retain(|m| m.address != member.address);
                        members.push(member);
                        members.sort_by(|a, b| a.age_ordering(b));
                    });
                }
            }
            ClusterEvent::MemberRemoved(member) => self.remove(&member),
            ClusterEvent::MemberExited(member) => {
                if Some(&member.address) != self.self_address.as_ref() {
                    self.remove(&member);
                }
            }
            ClusterEvent::CurrentClusterState(_) => {}
        }
    }

    /// Grant one delivery.
    pub fn request_next(&mut self) {
        self.credits = self.credits.saturating_add(1);
    }

    /// Next notification, if one is queued and a credit is available.
    pub fn poll(&mut self) -> Option<Event> {
        if self.credits == 0 {
            return None;
        }
        let next = self.changes.pop_front()?;
        self.credits -= 1;
        Some(next)
    }

    pub fn oldest(&self) -> Option<Address> {
        self.members_by_age.first().map(|m| m.address.clone())
    }

    pub fn pending(&self) -> usize {
        self.changes.len()
    }

    fn remove(&mut self, member: &Member) {
        if self.matches_role(member) {
            self.track_change(|members| members.retain(|m| m.address != member.address));
        }
    }

    fn track_change(&mut self, change: impl FnOnce(&mut Vec<Member>)) {
        let before = self.oldest();
        change(&mut self.members_by_age);
        let after = self.oldest();
        if before != after {
            debug!(before = ?before, after = ?after, "Oldest changed");
            self.changes.push_back(Event::OldestChanged { oldest: after });
        }
    }

    fn matches_role(&self, member: &Member) -> bool {
        member.has_role(self.role.as_deref())
    }
}

/// Notifier task fed by a [`MembershipSource`].
pub struct MembershipNotifier {
    buffer: OldestChangeBuffer,
    events: broadcast::Receiver<ClusterEvent>,
    credits: mpsc::UnboundedReceiver<()>,
    inbox: mpsc::Sender<Inbound>,
}

impl MembershipNotifier {
    async fn run(mut self) {
        loop {
            while let Some(notification) = self.buffer.poll() {
                if self.inbox.send(Inbound::Event(notification)).await.is_err() {
                    return;
                }
            }

            tokio::select! {
                credit = self.credits.recv() => match credit {
                    Some(()) => self.buffer.request_next(),
                    None => return,
                },
                event = self.events.recv() => match event {
                    Ok(event) => self.buffer.on_event(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Notifier lagged behind membership events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Membership stream closed");
                        let _ = self.inbox.send(Inbound::Event(Event::ClusterShutdown)).await;
                        return;
                    }
                },
            }
        }
    }
}

/// Handle to a running [`MembershipNotifier`]; dropping it stops the task.
pub struct MembershipNotifierHandle {
    credits: mpsc::UnboundedSender<()>,
    task: JoinHandle<()>,
}

impl OldestNotifier for MembershipNotifierHandle {
    fn request_next(&mut self) {
        if self.credits.send(()).is_err() {
            debug!("Notifier already stopped");
        }
    }
}

impl Drop for MembershipNotifierHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Starts a [`MembershipNotifier`] for one node.
pub struct MembershipNotifierFactory {
    self_address: Address,
    role: Option<String>,
    source: Arc<dyn MembershipSource>,
}

impl MembershipNotifierFactory {
    pub fn new(self_address: Address, role: Option<String>, source: Arc<dyn MembershipSource>) -> Self {
        Self {
            self_address,
            role,
            source,
        }
    }
}

impl NotifierFactory for MembershipNotifierFactory {
    fn start(&self, inbox: mpsc::Sender<Inbound>) -> Box<dyn OldestNotifier> {
        let (snapshot, events) = self.source.subscribe();
        let mut buffer = OldestChangeBuffer::new(self.self_address.clone(), self.role.clone());
        buffer.initialize(&snapshot);

        let (credits_tx, credits_rx) = mpsc::unbounded_channel();
        let notifier = MembershipNotifier {
            buffer,
            events,
            credits: credits_rx,
            inbox,
        };
        info!(node = %self.self_address, role = ?self.role, "Starting oldest-change notifier");

        Box::new(MembershipNotifierHandle {
            credits: credits_tx,
            task: tokio::spawn(notifier.run()),
        })
    }
}
