//! Identifier types for cluster nodes, managed units and messages.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Address of a cluster node.
/// Canonical form is `baton://<system>@<host>:<port>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(String);

impl Address {
    /// Create an address from its string form.
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// Build the canonical address of a node.
    pub fn from_parts(system: &str, host: &str, port: u16) -> Self {
        Self(format!("baton://{}@{}:{}", system, host, port))
    }

    /// Get the address as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check the address has the canonical shape.
    pub fn is_valid(&self) -> bool {
        let Some(rest) = self.0.strip_prefix("baton://") else {
            return false;
        };
        match rest.split_once('@') {
            Some((system, authority)) => {
                !system.is_empty()
                    && authority
                        .rsplit_once(':')
                        .map(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
                        .unwrap_or(false)
            }
            None => false,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Address {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Address {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier of one incarnation of the managed unit.
/// A new id is allocated every time a node starts hosting the unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnitId(Uuid);

impl UnitId {
    /// Create a new unit ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for UnitId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Create a new message ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_id_creation() {
        let id1 = UnitId::new();
        let id2 = UnitId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_address_from_parts() {
        let address = Address::from_parts("cluster", "10.0.0.1", 2552);
        assert_eq!(address.as_str(), "baton://cluster@10.0.0.1:2552");
        assert!(address.is_valid());
    }

    #[test]
    fn test_address_validation() {
        assert!(Address::new("baton://sys@host:1").is_valid());
        assert!(!Address::new("").is_valid());
        assert!(!Address::new("baton://host:1").is_valid());
        assert!(!Address::new("baton://sys@host").is_valid());
        assert!(!Address::new("http://sys@host:1").is_valid());
    }

    #[test]
    fn test_address_ordering_is_lexical() {
        let a = Address::new("baton://sys@a:1");
        let b = Address::new("baton://sys@b:1");
        assert!(a < b);
    }
}
