//! In-process membership service.
//!
//! Tracks member status transitions and publishes the resulting
//! [`ClusterEvent`]s to subscribers. Used by the simulator and by tests in
//! place of a real failure detector.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use baton_common::{Address, BatonError, ClusterEvent, CurrentClusterState, Member, MemberStatus, Result};

use crate::coordinator::CoordinatorHandle;
use crate::notifier::MembershipSource;

struct MembershipState {
    members: Vec<Member>,
    next_up_number: u32,
    events: Option<broadcast::Sender<ClusterEvent>>,
}

/// Membership shared by every node of an in-process cluster.
pub struct LocalMembership {
    state: Mutex<MembershipState>,
}

impl LocalMembership {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            state: Mutex::new(MembershipState {
                members: Vec::new(),
                next_up_number: 1,
                events: Some(events),
            }),
        })
    }

    /// Admit a member straight to `Up`.
    pub fn join<I, S>(&self, address: Address, roles: I) -> Member
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.state.lock();
        let member = Member::new(address, state.next_up_number, MemberStatus::Up).with_roles(roles);
        state.next_up_number += 1;
        state.members.retain(|m| m.address != member.address);
        state.members.push(member.clone());
        info!(member = %member.address, up_number = member.up_number, "Member up");
        publish(&state, ClusterEvent::MemberUp(member.clone()));
        member
    }

    /// Graceful leave: `Leaving`, then `Exiting` with a `MemberExited` event.
    pub fn leave(&self, address: &Address) -> Result<()> {
        let mut state = self.state.lock();
        transition(&mut state, address, MemberStatus::Leaving)?;
        let exited = transition(&mut state, address, MemberStatus::Exiting)?;
        info!(member = %address, "Member exited");
        publish(&state, ClusterEvent::MemberExited(exited));
        Ok(())
    }

    /// Mark a member unreachable; its removal follows separately.
    pub fn down(&self, address: &Address) -> Result<()> {
        let mut state = self.state.lock();
        transition(&mut state, address, MemberStatus::Down)?;
        warn!(member = %address, "Member down");
        Ok(())
    }

    /// Remove a member and publish `MemberRemoved`.
    pub fn remove(&self, address: &Address) -> Result<()> {
        let mut state = self.state.lock();
        let removed = transition(&mut state, address, MemberStatus::Removed)?;
        state.members.retain(|m| &m.address != address);
        info!(member = %address, "Member removed");
        publish(&state, ClusterEvent::MemberRemoved(removed));
        Ok(())
    }

    pub fn snapshot(&self) -> CurrentClusterState {
        CurrentClusterState::new(self.state.lock().members.clone())
    }

    pub fn member(&self, address: &Address) -> Option<Member> {
        self.state
            .lock()
            .members
            .iter()
            .find(|m| &m.address == address)
            .cloned()
    }

    /// Addresses of current members.
    pub fn addresses(&self) -> BTreeSet<Address> {
        self.state
            .lock()
            .members
            .iter()
            .map(|m| m.address.clone())
            .collect()
    }

    /// Close the event stream; subscribers observe the membership shutting down.
    pub fn shutdown(&self) {
        if self.state.lock().events.take().is_some() {
            info!("Membership service shut down");
        }
    }

    /// Forward the snapshot and every later event to a coordinator.
    pub fn attach(&self, handle: CoordinatorHandle) -> JoinHandle<()> {
        let (snapshot, mut events) = self.subscribe();
        tokio::spawn(async move {
            if handle
                .cluster_event(ClusterEvent::CurrentClusterState(snapshot))
                .await
                .is_err()
            {
                return;
            }
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if handle.cluster_event(event).await.is_err() {
                            debug!(node = %handle.self_address(), "Coordinator gone, detaching");
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(node = %handle.self_address(), skipped, "Membership events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        let _ = handle.cluster_shutdown().await;
                        return;
                    }
                }
            }
        })
    }
}

impl MembershipSource for LocalMembership {
    fn subscribe(&self) -> (CurrentClusterState, broadcast::Receiver<ClusterEvent>) {
        let state = self.state.lock();
        let receiver = match &state.events {
            Some(events) => events.subscribe(),
            None => {
                // already shut down: hand out a closed stream
                let (closed, receiver) = broadcast::channel(1);
                drop(closed);
                receiver
            }
        };
        (CurrentClusterState::new(state.members.clone()), receiver)
    }
}

fn publish(state: &MembershipState, event: ClusterEvent) {
    if let Some(events) = &state.events {
        // no subscribers is fine
        let _ = events.send(event);
    }
}

fn transition(state: &mut MembershipState, address: &Address, next: MemberStatus) -> Result<Member> {
    let member = state
        .members
        .iter_mut()
        .find(|m| &m.address == address)
        .ok_or_else(|| BatonError::InternalError(format!("unknown member {}", address)))?;

    if !member.status.can_transition_to(next) {
        return Err(BatonError::InternalError(format!(
            "member {} cannot go from {:?} to {:?}",
            address, member.status, next
        )));
    }
    member.status = next;
    Ok(member.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(host: &str) -> Address {
        Address::from_parts("sys", host, 2552)
    }

    #[tokio::test]
    async fn test_join_assigns_increasing_up_numbers() {
        let membership = LocalMembership::new();
        let (_, mut events) = membership.subscribe();

        let a = membership.join(addr("a"), Vec::<String>::new());
        let b = membership.join(addr("b"), ["backend"]);
        assert!(a.is_older_than(&b));
        assert!(b.has_role(Some("backend")));

        assert_eq!(events.recv().await.unwrap(), ClusterEvent::MemberUp(a));
        assert_eq!(events.recv().await.unwrap(), ClusterEvent::MemberUp(b));
    }

    #[tokio::test]
    async fn test_leave_then_remove() {
        let membership = LocalMembership::new();
        membership.join(addr("a"), Vec::<String>::new());
        let (snapshot, mut events) = membership.subscribe();
        assert_eq!(snapshot.members.len(), 1);

        membership.leave(&addr("a")).unwrap();
        match events.recv().await.unwrap() {
            ClusterEvent::MemberExited(m) => assert_eq!(m.status, MemberStatus::Exiting),
            other => panic!("unexpected {:?}", other),
        }

        membership.remove(&addr("a")).unwrap();
        assert!(matches!(events.recv().await.unwrap(), ClusterEvent::MemberRemoved(_)));
        assert!(membership.addresses().is_empty());
    }

    #[test]
    fn test_invalid_transition_is_rejected() {
        let membership = LocalMembership::new();
        membership.join(addr("a"), Vec::<String>::new());
        assert!(membership.remove(&addr("a")).is_err());

        membership.down(&addr("a")).unwrap();
        membership.remove(&addr("a")).unwrap();
        assert!(membership.leave(&addr("a")).is_err());
    }

    #[tokio::test]
    async fn test_shutdown_closes_stream() {
        let membership = LocalMembership::new();
        let (_, mut events) = membership.subscribe();
        membership.shutdown();
        assert!(matches!(
            events.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));

        let (_, mut late) = membership.subscribe();
        assert!(late.recv().await.is_err());
    }
}
