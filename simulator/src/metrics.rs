//! Simulation metrics.

use std::time::Duration;

use baton_coordinator::metrics::MetricsSnapshot;

use crate::cluster::UnitTracker;

/// Simulation metrics.
#[derive(Debug, Clone, Default)]
pub struct SimulationMetrics {
    /// Nodes started.
    pub joins: u64,
    /// Graceful leaves.
    pub leaves: u64,
    /// Crashes injected.
    pub crashes: u64,
    /// Completed hand-overs, summed over all coordinators.
    pub hand_overs: u64,
    /// Hand-over and take-over retries, summed over all coordinators.
    pub retries: u64,
    /// Coordinators that got stuck.
    pub stuck: u64,
    /// Singleton incarnations started.
    pub unit_starts: u64,
    /// Highest number of incarnations alive at once.
    pub max_concurrent_units: usize,
    /// Periods without a running incarnation.
    unavailability: Vec<Duration>,
}

impl SimulationMetrics {
    /// Create new metrics.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_join(&mut self) {
        self.joins += 1;
    }

    pub fn record_leave(&mut self) {
        self.leaves += 1;
    }

    pub fn record_crash(&mut self) {
        self.crashes += 1;
    }

    /// Take the singleton counters from the cluster-wide tracker.
    pub fn observe_units(&mut self, tracker: &UnitTracker) {
        self.unit_starts = tracker.started();
        self.max_concurrent_units = tracker.max_active();
        self.unavailability = tracker.unavailability();
    }

    /// Sum the coordinator counters of every node.
    pub fn observe_coordinators(&mut self, snapshots: &[MetricsSnapshot]) {
        self.hand_overs = snapshots.iter().map(|s| s.hand_overs_completed).sum();
        self.retries = snapshots
            .iter()
            .map(|s| s.hand_over_retries + s.take_over_retries)
            .sum();
        self.stuck = snapshots.iter().map(|s| s.stuck_total).sum();
    }

    /// Whether two incarnations were ever alive at once.
    pub fn singleton_violated(&self) -> bool {
        self.max_concurrent_units > 1
    }

    pub fn unavailability_windows(&self) -> usize {
        self.unavailability.len()
    }

    /// Longest period without a singleton.
    pub fn max_unavailability_ms(&self) -> u64 {
        self.unavailability
            .iter()
            .map(|d| d.as_millis() as u64)
            .max()
            .unwrap_or(0)
    }

    /// Average period without a singleton.
    pub fn average_unavailability_ms(&self) -> u64 {
        if self.unavailability.is_empty() {
            return 0;
        }

        let sum: u64 = self.unavailability.iter().map(|d| d.as_millis() as u64).sum();
        sum / self.unavailability.len() as u64
    }
}
