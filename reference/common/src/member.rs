//! Cluster member model and membership events.

use crate::Address;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// Member status representing the membership lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemberStatus {
    /// Node asked to join and is waiting to be accepted.
    Joining,
    /// Node is a full member.
    Up,
    /// Node announced a graceful leave.
    Leaving,
    /// Leave converged; node is about to be removed.
    Exiting,
    /// Node was marked down by the failure detector or an operator.
    Down,
    /// Node is no longer part of the cluster.
    Removed,
}

impl MemberStatus {
    /// Check if this is a final state.
    pub fn is_final(&self) -> bool {
        matches!(self, MemberStatus::Removed)
    }

    /// Get valid next states from current state.
    pub fn valid_transitions(&self) -> &[MemberStatus] {
        match self {
            MemberStatus::Joining => &[
                MemberStatus::Up,
                MemberStatus::Down,
                MemberStatus::Removed,
            ],
            MemberStatus::Up => &[MemberStatus::Leaving, MemberStatus::Down],
            MemberStatus::Leaving => &[MemberStatus::Exiting, MemberStatus::Down],
            MemberStatus::Exiting => &[MemberStatus::Removed, MemberStatus::Down],
            MemberStatus::Down => &[MemberStatus::Removed],
            MemberStatus::Removed => &[],
        }
    }

    /// Check if transition to given state is valid.
    pub fn can_transition_to(&self, next: MemberStatus) -> bool {
        self.valid_transitions().contains(&next)
    }
}

/// A member of the cluster as seen by the membership service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Node address.
    pub address: Address,
    /// Order in which the member became `Up`; lower is older.
    pub up_number: u32,
    /// Current status.
    pub status: MemberStatus,
    /// Roles carried by the node.
    pub roles: BTreeSet<String>,
}

impl Member {
    /// Create a new member.
    pub fn new(address: Address, up_number: u32, status: MemberStatus) -> Self {
        Self {
            address,
            up_number,
            status,
            roles: BTreeSet::new(),
        }
    }

    /// Attach roles to the member.
    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    /// Copy of this member with another status.
    pub fn with_status(&self, status: MemberStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }

    /// Check whether the member carries the role. No role matches everyone.
    pub fn has_role(&self, role: Option<&str>) -> bool {
        match role {
            Some(role) => self.roles.contains(role),
            None => true,
        }
    }

    /// Check if this member joined before `other`.
    pub fn is_older_than(&self, other: &Member) -> bool {
        self.age_ordering(other) == Ordering::Less
    }

    /// Oldest-first ordering; ties on `up_number` fall back to the address.
    pub fn age_ordering(&self, other: &Member) -> Ordering {
        self.up_number
            .cmp(&other.up_number)
            .then_with(|| self.address.cmp(&other.address))
    }
}

/// Snapshot of the cluster delivered when subscribing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentClusterState {
    /// Known members.
    pub members: Vec<Member>,
}

impl CurrentClusterState {
    /// Create a snapshot.
    pub fn new(members: Vec<Member>) -> Self {
        Self { members }
    }

    /// Find a member by address.
    pub fn member(&self, address: &Address) -> Option<&Member> {
        self.members.iter().find(|m| &m.address == address)
    }
}

/// Membership events consumed by the singleton coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterEvent {
    /// Member became `Up`.
    MemberUp(Member),
    /// Member finished leaving and is `Exiting`.
    MemberExited(Member),
    /// Member was removed from the cluster.
    MemberRemoved(Member),
    /// Full snapshot, sent first on subscription.
    CurrentClusterState(CurrentClusterState),
}

impl ClusterEvent {
    /// Address the event refers to, if it concerns a single member.
    pub fn address(&self) -> Option<&Address> {
        match self {
            ClusterEvent::MemberUp(m)
            | ClusterEvent::MemberExited(m)
            | ClusterEvent::MemberRemoved(m) => Some(&m.address),
            ClusterEvent::CurrentClusterState(_) => None,
        }
    }
}
