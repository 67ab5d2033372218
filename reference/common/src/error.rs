//! Error types for the Baton singleton coordinator.

use crate::{Address, UnitId};
use thiserror::Error;

/// Main error type for Baton operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BatonError {
    /// Invalid configuration, detected before the coordinator starts.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The node does not carry the role the singleton is restricted to.
    #[error("This cluster member [{address}] doesn't have the role [{role}]")]
    MissingRole { address: Address, role: String },

    /// Hand-over or take-over retries exhausted without a resolvable outcome.
    #[error("Coordinator is stuck: {0}")]
    CoordinatorIsStuck(String),

    /// No peer coordinator could be resolved for the address.
    #[error("Peer unreachable: {0}")]
    PeerUnreachable(Address),

    /// Envelope could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(String),

    /// The managed unit ended with an error.
    #[error("Managed unit {unit} failed: {reason}")]
    UnitFailed { unit: UnitId, reason: String },

    /// A channel to or from the coordinator was closed.
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Internal coordinator error.
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl BatonError {
    /// Check if this error must tear the coordinator instance down.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BatonError::CoordinatorIsStuck(_)
                | BatonError::Configuration(_)
                | BatonError::MissingRole { .. }
        )
    }

    /// Check if the error is a stuck condition.
    pub fn is_stuck(&self) -> bool {
        matches!(self, BatonError::CoordinatorIsStuck(_))
    }

    /// Get error code for logs and status reporting.
    pub fn error_code(&self) -> &'static str {
        match self {
            BatonError::Configuration(_) => "CONFIGURATION_ERROR",
            BatonError::MissingRole { .. } => "MISSING_ROLE",
            BatonError::CoordinatorIsStuck(_) => "COORDINATOR_IS_STUCK",
            BatonError::PeerUnreachable(_) => "PEER_UNREACHABLE",
            BatonError::Codec(_) => "CODEC_ERROR",
            BatonError::UnitFailed { .. } => "UNIT_FAILED",
            BatonError::ChannelClosed(_) => "CHANNEL_CLOSED",
            BatonError::InternalError(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<serde_json::Error> for BatonError {
    fn from(e: serde_json::Error) -> Self {
        BatonError::Codec(e.to_string())
    }
}

/// Result type alias for Baton operations.
pub type Result<T> = std::result::Result<T, BatonError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(BatonError::CoordinatorIsStuck("x".into()).is_fatal());
        assert!(BatonError::Configuration("x".into()).is_fatal());
        assert!(!BatonError::PeerUnreachable(Address::new("baton://s@h:1")).is_fatal());
        assert!(!BatonError::Codec("x".into()).is_stuck());
    }

    #[test]
    fn test_missing_role_message() {
        let err = BatonError::MissingRole {
            address: Address::new("baton://s@h:1"),
            role: "backend".into(),
        };
        assert_eq!(
            err.to_string(),
            "This cluster member [baton://s@h:1] doesn't have the role [backend]"
        );
        assert_eq!(err.error_code(), "MISSING_ROLE");
    }
}
