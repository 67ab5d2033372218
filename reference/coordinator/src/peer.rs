//! Peer resolution and in-process transport between coordinators.

use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use baton_common::{Address, BatonError, Result};
use baton_protocol::{decode, encode, Envelope};

use crate::coordinator::Inbound;

/// Resolves a member address to the coordinator running on that node.
pub trait PeerResolver: Send + Sync {
    fn resolve(&self, address: &Address) -> Option<PeerRef>;
}

/// Sendable handle to a peer coordinator.
#[derive(Clone, Debug)]
pub struct PeerRef {
    address: Address,
    mailbox: mpsc::Sender<Inbound>,
}

impl PeerRef {
    pub fn new(address: Address, mailbox: mpsc::Sender<Inbound>) -> Self {
        Self { address, mailbox }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Fire-and-forget delivery. The envelope crosses the wire codec; a
    /// full or closed mailbox drops the message.
    pub fn tell(&self, envelope: &Envelope) -> Result<()> {
        let bytes = encode(envelope)?;
        let decoded = decode(&bytes)?;

        match self.mailbox.try_send(Inbound::Peer(decoded)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(BatonError::ChannelClosed(format!(
                "mailbox of {} is full",
                self.address
            ))),
            Err(TrySendError::Closed(_)) => Err(BatonError::PeerUnreachable(self.address.clone())),
        }
    }
}

/// In-process registry of coordinator mailboxes.
#[derive(Default)]
pub struct LocalPeerRegistry {
    peers: DashMap<Address, mpsc::Sender<Inbound>>,
    blocked: DashSet<Address>,
}

impl LocalPeerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register (or replace) the mailbox of the coordinator at `address`.
    pub fn register(&self, address: Address, mailbox: mpsc::Sender<Inbound>) {
        info!(peer = %address, "Registered peer coordinator");
        self.peers.insert(address, mailbox);
    }

    pub fn unregister(&self, address: &Address) {
        if self.peers.remove(address).is_some() {
            info!(peer = %address, "Unregistered peer coordinator");
        }
    }

    /// Make `address` unreachable until unblocked.
    pub fn block(&self, address: Address) {
        warn!(peer = %address, "Blocking peer");
        self.blocked.insert(address);
    }

    pub fn unblock(&self, address: &Address) {
        if self.blocked.remove(address).is_some() {
            info!(peer = %address, "Unblocked peer");
        }
    }

    pub fn is_blocked(&self, address: &Address) -> bool {
        self.blocked.contains(address)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl PeerResolver for LocalPeerRegistry {
    fn resolve(&self, address: &Address) -> Option<PeerRef> {
        if self.blocked.contains(address) {
            debug!(peer = %address, "Peer blocked");
            return None;
        }
        self.peers
            .get(address)
            .map(|mailbox| PeerRef::new(address.clone(), mailbox.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use baton_protocol::SingletonMessage;

    fn addr(host: &str) -> Address {
        Address::from_parts("sys", host, 2552)
    }

    #[tokio::test]
    async fn test_tell_delivers_through_codec() {
        let registry = LocalPeerRegistry::new();
        let (tx, mut rx) = mpsc::channel(4);
        registry.register(addr("b"), tx);

        let envelope = Envelope::new(addr("a"), SingletonMessage::HandOverToMe);
        let peer = registry.resolve(&addr("b")).unwrap();
        peer.tell(&envelope).unwrap();

        match rx.recv().await {
            Some(Inbound::Peer(received)) => assert_eq!(received, envelope),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_and_blocked_peers_do_not_resolve() {
        let registry = LocalPeerRegistry::new();
        let (tx, _rx) = mpsc::channel(4);
        registry.register(addr("b"), tx);

        assert!(registry.resolve(&addr("c")).is_none());

        registry.block(addr("b"));
        assert!(registry.resolve(&addr("b")).is_none());

        registry.unblock(&addr("b"));
        assert!(registry.resolve(&addr("b")).is_some());

        registry.unregister(&addr("b"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_tell_to_stopped_peer_fails() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let peer = PeerRef::new(addr("b"), tx);
        let err = peer
            .tell(&Envelope::new(addr("a"), SingletonMessage::HandOverDone))
            .unwrap_err();
        assert_eq!(err, BatonError::PeerUnreachable(addr("b")));
    }

    #[test]
    fn test_tell_never_waits_on_full_mailbox() {
        let (tx, _rx) = mpsc::channel(1);
        let peer = PeerRef::new(addr("b"), tx);
        let envelope = Envelope::new(addr("a"), SingletonMessage::TakeOverFromMe);
        peer.tell(&envelope).unwrap();
        assert_eq!(peer.tell(&envelope).unwrap_err().error_code(), "CHANNEL_CLOSED");
    }
}
