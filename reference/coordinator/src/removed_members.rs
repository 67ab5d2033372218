//! Bounded-lifetime record of members known to have left the cluster.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use baton_common::{Address, Deadline};

/// Addresses of removed members with the deadline until which they are
/// remembered. Owned by a single coordinator; never shared.
#[derive(Debug, Clone)]
pub struct RemovedMembers {
    /// Removed member -> expiry.
    entries: HashMap<Address, Deadline>,
    /// Retention window.
    ttl: Duration,
}

impl RemovedMembers {
    /// Create an empty tracker.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    /// Record `address` as removed, restarting its retention window.
    pub fn add(&mut self, address: Address, now: Instant) {
        self.entries.insert(address, Deadline::after(now, self.ttl));
    }

    /// Check if `address` is a removed member that has not expired yet.
    pub fn contains(&self, address: &Address, now: Instant) -> bool {
        self.entries
            .get(address)
            .map(|deadline| !deadline.is_overdue(now))
            .unwrap_or(false)
    }

    /// Purge expired entries, returning how many were dropped.
    pub fn cleanup(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, deadline| !deadline.is_overdue(now));
        let purged = before - self.entries.len();
        if purged > 0 {
            debug!(purged, remaining = self.entries.len(), "Purged removed members");
        }
        purged
    }

    /// Number of tracked entries, expired or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Retention window.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(host: &str) -> Address {
        Address::from_parts("sys", host, 2552)
    }

    #[test]
    fn test_entry_honored_within_ttl() {
        let start = Instant::now();
        let mut removed = RemovedMembers::new(Duration::from_secs(900));
        removed.add(address("a"), start);

        assert!(removed.contains(&address("a"), start));
        assert!(removed.contains(&address("a"), start + Duration::from_secs(899)));
        assert!(!removed.contains(&address("b"), start));
    }

    #[test]
    fn test_entry_ignored_after_ttl() {
        let start = Instant::now();
        let mut removed = RemovedMembers::new(Duration::from_secs(900));
        removed.add(address("a"), start);

        assert!(!removed.contains(&address("a"), start + Duration::from_secs(900)));
        // still stored until swept
        assert_eq!(removed.len(), 1);
    }

    #[test]
    fn test_cleanup_purges_only_expired() {
        let start = Instant::now();
        let mut removed = RemovedMembers::new(Duration::from_secs(60));
        removed.add(address("a"), start);
        removed.add(address("b"), start + Duration::from_secs(30));

        assert_eq!(removed.cleanup(start + Duration::from_secs(61)), 1);
        assert_eq!(removed.len(), 1);
        assert!(removed.contains(&address("b"), start + Duration::from_secs(61)));

        assert_eq!(removed.cleanup(start + Duration::from_secs(91)), 1);
        assert!(removed.is_empty());
    }

    #[test]
    fn test_re_adding_extends_retention() {
        let start = Instant::now();
        let mut removed = RemovedMembers::new(Duration::from_secs(60));
        removed.add(address("a"), start);
        removed.add(address("a"), start + Duration::from_secs(50));

        assert!(removed.contains(&address("a"), start + Duration::from_secs(100)));
        assert_eq!(removed.len(), 1);
    }
}
