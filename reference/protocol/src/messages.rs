//! Protocol message types.
//!
//! These types represent the hand-over/take-over handshake exchanged
//! between the coordinator currently hosting the managed unit and the
//! coordinator that is becoming responsible for it.

use baton_common::{now, Address, BatonError, MessageId, Result, Timestamp};
use serde::{Deserialize, Serialize};

/// Version written into every envelope.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Handshake message between singleton coordinators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SingletonMessage {
    /// Requester asks the current or previous holder to hand over.
    HandOverToMe,
    /// Holder acknowledges that the managed unit is being stopped.
    HandOverInProgress,
    /// Holder reports that the managed unit has stopped.
    HandOverDone,
    /// New holder asks the presumed previous holder to start a hand-over.
    TakeOverFromMe,
}

impl SingletonMessage {
    /// All message kinds, in protocol order.
    pub const ALL: [SingletonMessage; 4] = [
        SingletonMessage::HandOverToMe,
        SingletonMessage::HandOverInProgress,
        SingletonMessage::HandOverDone,
        SingletonMessage::TakeOverFromMe,
    ];

    /// Whether a lost copy of this message is covered by a sender-side retry.
    pub fn is_retried(&self) -> bool {
        matches!(
            self,
            SingletonMessage::HandOverToMe | SingletonMessage::TakeOverFromMe
        )
    }
}

/// A message together with its routing metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version.
    pub version: String,
    /// Unique message ID.
    pub message_id: MessageId,
    /// Address of the sending coordinator.
    pub sender: Address,
    /// Send timestamp.
    pub sent_at: Timestamp,
    /// Payload.
    pub message: SingletonMessage,
}

impl Envelope {
    /// Wrap a message sent by `sender`.
    pub fn new(sender: Address, message: SingletonMessage) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            message_id: MessageId::new(),
            sender,
            sent_at: now(),
            message,
        }
    }
}

/// Encode an envelope for the wire.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(envelope)?)
}

/// Decode an envelope received from the wire.
pub fn decode(bytes: &[u8]) -> Result<Envelope> {
    let envelope: Envelope = serde_json::from_slice(bytes)?;
    if envelope.version != PROTOCOL_VERSION {
        return Err(BatonError::Codec(format!(
            "unsupported protocol version {}, expected {}",
            envelope.version, PROTOCOL_VERSION
        )));
    }
    Ok(envelope)
}
