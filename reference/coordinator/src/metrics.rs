//! Metrics collection for coordinator monitoring.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::state::SingletonState;

/// Coordinator metrics.
pub struct Metrics {
    /// Macro-state changes.
    pub transitions_total: AtomicU64,
    /// Managed unit incarnations started.
    pub units_started: AtomicU64,
    /// Managed unit incarnations that ended.
    pub units_terminated: AtomicU64,
    /// `HandOverDone` sent to a successor.
    pub hand_overs_completed: AtomicU64,
    /// Hand-over retries scheduled.
    pub hand_over_retries: AtomicU64,
    /// Take-over retries scheduled.
    pub take_over_retries: AtomicU64,
    /// Peer messages sent.
    pub messages_sent: AtomicU64,
    /// Peer messages received.
    pub messages_received: AtomicU64,
    /// Peer messages that could not be delivered.
    pub messages_dropped: AtomicU64,
    /// Stuck conditions raised.
    pub stuck_total: AtomicU64,
    /// Coordinator re-creations after a stuck condition.
    pub restarts_total: AtomicU64,
    /// Current state code.
    pub state: AtomicU64,
}

impl Metrics {
    /// Create new metrics instance.
    pub fn new() -> Self {
        Self {
            transitions_total: AtomicU64::new(0),
            units_started: AtomicU64::new(0),
            units_terminated: AtomicU64::new(0),
            hand_overs_completed: AtomicU64::new(0),
            hand_over_retries: AtomicU64::new(0),
            take_over_retries: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            stuck_total: AtomicU64::new(0),
            restarts_total: AtomicU64::new(0),
            state: AtomicU64::new(SingletonState::Start.code()),
        }
    }

    /// Record a macro-state change.
    pub fn transition(&self, to: SingletonState) {
        self.transitions_total.fetch_add(1, Ordering::Relaxed);
        self.state.store(to.code(), Ordering::Relaxed);
    }

    /// Reset the state gauge without counting a transition.
    pub fn set_state(&self, state: SingletonState) {
        self.state.store(state.code(), Ordering::Relaxed);
    }

    pub fn unit_started(&self) {
        self.units_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unit_terminated(&self) {
        self.units_terminated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hand_over_completed(&self) {
        self.hand_overs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hand_over_retry(&self) {
        self.hand_over_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn take_over_retry(&self) {
        self.take_over_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stuck(&self) {
        self.stuck_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn restarted(&self) {
        self.restarts_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            transitions_total: self.transitions_total.load(Ordering::Relaxed),
            units_started: self.units_started.load(Ordering::Relaxed),
            units_terminated: self.units_terminated.load(Ordering::Relaxed),
            hand_overs_completed: self.hand_overs_completed.load(Ordering::Relaxed),
            hand_over_retries: self.hand_over_retries.load(Ordering::Relaxed),
            take_over_retries: self.take_over_retries.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            stuck_total: self.stuck_total.load(Ordering::Relaxed),
            restarts_total: self.restarts_total.load(Ordering::Relaxed),
            state: self.state.load(Ordering::Relaxed),
        }
    }

    /// Export metrics in Prometheus format.
    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        format!(
            r#"# HELP baton_transitions_total Total singleton state transitions
# TYPE baton_transitions_total counter
baton_transitions_total {}

# HELP baton_units_started Total managed unit incarnations started
# TYPE baton_units_started counter
baton_units_started {}

# HELP baton_units_terminated Total managed unit incarnations terminated
# TYPE baton_units_terminated counter
baton_units_terminated {}

# HELP baton_hand_overs_completed Total completed hand-overs
# TYPE baton_hand_overs_completed counter
baton_hand_overs_completed {}

# HELP baton_hand_over_retries Total hand-over retries
# TYPE baton_hand_over_retries counter
baton_hand_over_retries {}

# HELP baton_take_over_retries Total take-over retries
# TYPE baton_take_over_retries counter
baton_take_over_retries {}

# HELP baton_messages_sent Total peer messages sent
# TYPE baton_messages_sent counter
baton_messages_sent {}

# HELP baton_messages_received Total peer messages received
# TYPE baton_messages_received counter
baton_messages_received {}

# HELP baton_messages_dropped Total peer messages dropped
# TYPE baton_messages_dropped counter
baton_messages_dropped {}

# HELP baton_stuck_total Total stuck conditions
# TYPE baton_stuck_total counter
baton_stuck_total {}

# HELP baton_restarts_total Total coordinator re-creations
# TYPE baton_restarts_total counter
baton_restarts_total {}

# HELP baton_state Current singleton state code
# TYPE baton_state gauge
baton_state {}
"#,
            snapshot.transitions_total,
            snapshot.units_started,
            snapshot.units_terminated,
            snapshot.hand_overs_completed,
            snapshot.hand_over_retries,
            snapshot.take_over_retries,
            snapshot.messages_sent,
            snapshot.messages_received,
            snapshot.messages_dropped,
            snapshot.stuck_total,
            snapshot.restarts_total,
            snapshot.state,
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub transitions_total: u64,
    pub units_started: u64,
    pub units_terminated: u64,
    pub hand_overs_completed: u64,
    pub hand_over_retries: u64,
    pub take_over_retries: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_dropped: u64,
    pub stuck_total: u64,
    pub restarts_total: u64,
    pub state: u64,
}

/// Shared metrics instance.
pub type SharedMetrics = Arc<Metrics>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_updates_gauge() {
        let metrics = Metrics::new();

        metrics.transition(SingletonState::Younger);
        metrics.transition(SingletonState::BecomingOldest);
        metrics.unit_started();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.transitions_total, 2);
        assert_eq!(snapshot.state, SingletonState::BecomingOldest.code());
        assert_eq!(snapshot.units_started, 1);
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = Metrics::new();
        metrics.stuck();
        metrics.transition(SingletonState::Oldest);

        let output = metrics.to_prometheus();
        assert!(output.contains("baton_stuck_total 1"));
        assert!(output.contains("baton_state 3"));
    }
}
