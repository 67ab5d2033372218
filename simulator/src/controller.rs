//! Simulation controller.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};

use baton_coordinator::SingletonState;

use crate::cluster::{ClusterSettings, SimulatedCluster};
use crate::metrics::SimulationMetrics;
use crate::scenario::{AssertCondition, NodeTarget, Scenario, ScenarioStep};

/// Drives a simulated cluster through scenarios or random churn.
pub struct SimulationController {
    /// Number of nodes started by `initialize`.
    node_count: usize,
    /// Simulation speed multiplier.
    speed: f64,
    /// Random number generator.
    rng: StdRng,
    /// The cluster under test.
    cluster: SimulatedCluster,
    /// Simulation metrics.
    metrics: SimulationMetrics,
    /// How long an assertion may take to hold.
    assert_timeout: Duration,
    /// Nodes that left or crashed and may rejoin.
    departed: Vec<String>,
}

impl SimulationController {
    /// Create a new simulation controller.
    pub fn new(node_count: usize, speed: f64, seed: Option<u64>, settings: ClusterSettings) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        let assert_timeout = settings.leave_timeout;

        Self {
            node_count,
            speed,
            rng,
            cluster: SimulatedCluster::new(settings),
            metrics: SimulationMetrics::new(),
            assert_timeout,
            departed: Vec::new(),
        }
    }

    /// Start `node-1` to `node-N` in age order and wait for the singleton.
    pub async fn initialize(&mut self) -> anyhow::Result<()> {
        info!("Initializing simulation with {} nodes", self.node_count);

        for i in 1..=self.node_count {
            self.join(&format!("node-{}", i)).await?;
        }
        if self.node_count > 0 {
            self.check(&AssertCondition::SingletonOn {
                node: "node-1".to_string(),
            })
            .await?;
        }

        Ok(())
    }

    /// Run a scenario.
    pub async fn run_scenario(&mut self, scenario: Scenario) -> anyhow::Result<()> {
        info!("Running scenario: {} - {}", scenario.name, scenario.description);

        if self.cluster.len() < scenario.min_nodes {
            anyhow::bail!(
                "Scenario {} needs {} nodes, {} running",
                scenario.name,
                scenario.min_nodes,
                self.cluster.len()
            );
        }

        for step in &scenario.steps {
            self.execute_step(step).await?;
        }

        info!("Scenario {} passed", scenario.name);
        Ok(())
    }

    /// Random joins, leaves and crashes until `duration` elapses or Ctrl+C.
    pub async fn run(&mut self, duration: Option<Duration>) -> anyhow::Result<()> {
        info!("Running simulation in continuous mode");

        let stop = async move {
            match duration {
                Some(d) => tokio::time::sleep(d).await,
                None => {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        warn!(error = %e, "Failed to listen for Ctrl+C");
                        std::future::pending::<()>().await;
                    }
                }
            }
        };
        tokio::pin!(stop);

        loop {
            tokio::select! {
                _ = &mut stop => break,
                result = self.churn() => result?,
            }
        }

        Ok(())
    }

    async fn churn(&mut self) -> anyhow::Result<()> {
        let running = self.cluster.names();
        let roll: f64 = self.rng.gen();

        if running.len() > 1 && roll < 0.3 {
            self.execute_step(&ScenarioStep::Crash {
                target: NodeTarget::Random,
            })
            .await?;
        } else if running.len() > 1 && roll < 0.6 {
            let node = running[self.rng.gen_range(0..running.len())].clone();
            self.execute_step(&ScenarioStep::Leave { node }).await?;
        } else if !self.departed.is_empty() {
            let index = self.rng.gen_range(0..self.departed.len());
            let node = self.departed.remove(index);
            self.execute_step(&ScenarioStep::Join { node }).await?;
        }

        if !self.cluster.is_empty() {
            self.check(&AssertCondition::SingletonHosted).await?;
        }
        if self.cluster.tracker().max_active() > 1 {
            warn!("Singleton guarantee violated");
        }

        self.execute_step(&ScenarioStep::Wait { millis: 1000 }).await
    }

    /// Execute a single scenario step.
    async fn execute_step(&mut self, step: &ScenarioStep) -> anyhow::Result<()> {
        match step {
            ScenarioStep::Join { node } => self.join(node).await?,
            ScenarioStep::Leave { node } => {
                info!("Node {} leaving", node);
                self.cluster.leave(node).await?;
                self.metrics.record_leave();
                self.departed.push(node.clone());
            }
            ScenarioStep::Crash { target } => {
                let node = self.resolve(target)?;
                info!("Crashing {} ({:?})", node, target);
                self.cluster.crash(&node).await?;
                self.metrics.record_crash();
                self.departed.push(node);
            }
            ScenarioStep::Wait { millis } => {
                let adjusted = (*millis as f64 / self.speed) as u64;
                info!("Waiting {}ms (adjusted: {}ms)", millis, adjusted);
                tokio::time::sleep(Duration::from_millis(adjusted)).await;
            }
            ScenarioStep::Assert { condition } => self.check(condition).await?,
        }

        Ok(())
    }

    async fn join(&mut self, node: &str) -> anyhow::Result<()> {
        let address = self.cluster.start_node(node)?;
        self.metrics.record_join();
        self.departed.retain(|n| n != node);
        info!("Node {} joined as {}", node, address);

        // settled once the first oldest notification was handled
        let settled = self
            .wait_until(|cluster| {
                cluster
                    .state_of(node)
                    .map_or(true, |state| state != SingletonState::Start)
            })
            .await;
        if !settled {
            warn!("Node {} did not settle", node);
        }
        Ok(())
    }

    fn resolve(&mut self, target: &NodeTarget) -> anyhow::Result<String> {
        match target {
            NodeTarget::Named(node) => Ok(node.clone()),
            NodeTarget::Oldest => self
                .cluster
                .oldest()
                .ok_or_else(|| anyhow::anyhow!("No oldest node to target")),
            NodeTarget::Random => {
                let names = self.cluster.names();
                if names.is_empty() {
                    anyhow::bail!("No node to target");
                }
                Ok(names[self.rng.gen_range(0..names.len())].clone())
            }
        }
    }

    /// Wait for `condition` to hold, failing after the assert timeout.
    async fn check(&self, condition: &AssertCondition) -> anyhow::Result<()> {
        info!("Asserting condition: {:?}", condition);
        let holds = match condition {
            AssertCondition::SingletonOn { node } => {
                self.wait_until(|cluster| cluster.hosts() == [node.clone()])
                    .await
            }
            AssertCondition::SingletonHosted => {
                self.wait_until(|cluster| cluster.hosts().len() == 1).await
            }
            AssertCondition::AtMostOneUnit => {
                let tracker = self.cluster.tracker();
                tracker.max_active() <= 1 && tracker.active() <= 1
            }
            AssertCondition::HandOversAtLeast { count } => {
                self.wait_until(|cluster| {
                    let hand_overs: u64 = cluster
                        .coordinator_metrics()
                        .iter()
                        .map(|m| m.hand_overs_completed)
                        .sum();
                    hand_overs >= *count
                })
                .await
            }
            AssertCondition::StateIs { node, state } => {
                self.wait_until(|cluster| cluster.state_of(node) == Some(*state))
                    .await
            }
        };

        if holds {
            Ok(())
        } else {
            Err(anyhow::anyhow!(
                "Assertion failed: {:?} (hosts {:?})",
                condition,
                self.cluster.hosts()
            ))
        }
    }

    async fn wait_until<F>(&self, check: F) -> bool
    where
        F: Fn(&SimulatedCluster) -> bool,
    {
        let cluster = &self.cluster;
        tokio::time::timeout(self.assert_timeout, async {
            while !check(cluster) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok()
    }

    /// Stop every node and collect the final metrics.
    pub async fn finish(&mut self) -> SimulationMetrics {
        self.metrics.observe_coordinators(&self.cluster.coordinator_metrics());
        self.metrics.observe_units(self.cluster.tracker());
        self.cluster.shutdown().await;
        self.metrics.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(nodes: usize) -> SimulationController {
        let settings = ClusterSettings {
            retry_interval: Duration::from_millis(50),
            min_retries: 5,
            failure_detection_margin: Duration::from_millis(300),
            ..ClusterSettings::default()
        };
        SimulationController::new(nodes, 1.0, Some(7), settings)
    }

    async fn run(name: &str, nodes: usize) -> SimulationMetrics {
        let mut controller = controller(nodes);
        controller.initialize().await.unwrap();
        controller
            .run_scenario(Scenario::load(name).unwrap())
            .await
            .unwrap();
        controller.finish().await
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_node_scenario() {
        let metrics = run("single-node", 1).await;
        assert_eq!(metrics.unit_starts, 1);
        assert_eq!(metrics.hand_overs, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_graceful_handover_scenario() {
        let metrics = run("graceful-handover", 2).await;
        assert_eq!(metrics.hand_overs, 1);
        assert_eq!(metrics.leaves, 1);
        assert!(!metrics.singleton_violated());
        assert_eq!(metrics.unavailability_windows(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_failover_scenario() {
        let metrics = run("crash-failover", 3).await;
        assert_eq!(metrics.crashes, 1);
        assert_eq!(metrics.unit_starts, 2);
        assert!(!metrics.singleton_violated());
        // the successor waits out the failure detection margin
        assert!(metrics.max_unavailability_ms() >= 300);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rolling_restart_scenario() {
        let metrics = run("rolling-restart", 3).await;
        assert_eq!(metrics.joins, 6);
        assert!(metrics.hand_overs >= 3);
        assert!(!metrics.singleton_violated());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_needs_enough_nodes() {
        let mut controller = controller(1);
        controller.initialize().await.unwrap();
        let result = controller
            .run_scenario(Scenario::load("rolling-restart").unwrap())
            .await;
        assert!(result.is_err());
        controller.finish().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_random_churn_keeps_one_singleton() {
        let mut controller = controller(3);
        controller.initialize().await.unwrap();
        controller.run(Some(Duration::from_secs(20))).await.unwrap();

        let metrics = controller.finish().await;
        assert!(!metrics.singleton_violated());
    }
}
