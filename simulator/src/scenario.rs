//! Simulation scenarios.

use serde::{Deserialize, Serialize};

use baton_coordinator::SingletonState;

/// A simulation scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    /// Scenario name.
    pub name: String,
    /// Description.
    pub description: String,
    /// Nodes the scenario expects to be running initially.
    pub min_nodes: usize,
    /// Steps in the scenario.
    pub steps: Vec<ScenarioStep>,
}

/// A step in a scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScenarioStep {
    /// Start a node, or restart a departed one under a fresh address.
    Join { node: String },
    /// Leave gracefully.
    Leave { node: String },
    /// Kill a node without hand-over.
    Crash { target: NodeTarget },
    /// Wait for a duration.
    Wait { millis: u64 },
    /// Assert a condition, waiting for it to hold.
    Assert { condition: AssertCondition },
}

/// Which node a fault hits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeTarget {
    Named(String),
    /// Whichever node is oldest when the step runs.
    Oldest,
    /// A node picked by the seeded generator.
    Random,
}

/// Conditions that can be asserted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AssertCondition {
    /// Exactly this node hosts the singleton.
    SingletonOn { node: String },
    /// Some node hosts the singleton.
    SingletonHosted,
    /// Never more than one incarnation alive at once.
    AtMostOneUnit,
    /// At least this many hand-overs completed.
    HandOversAtLeast { count: u64 },
    /// A node's coordinator is in the given state.
    StateIs { node: String, state: SingletonState },
}

impl Scenario {
    /// Load a scenario by name, or from a JSON file.
    pub fn load(name: &str) -> anyhow::Result<Self> {
        match name {
            "single-node" => Ok(Self::single_node()),
            "graceful-handover" => Ok(Self::graceful_handover()),
            "crash-failover" => Ok(Self::crash_failover()),
            "rolling-restart" => Ok(Self::rolling_restart()),
            path if path.ends_with(".json") => {
                let content = std::fs::read_to_string(path)?;
                Ok(serde_json::from_str(&content)?)
            }
            _ => Err(anyhow::anyhow!("Unknown scenario: {}", name)),
        }
    }

    /// Oldest node hosts the singleton and keeps it.
    fn single_node() -> Self {
        Self {
            name: "single-node".to_string(),
            description: "Oldest node starts the singleton".to_string(),
            min_nodes: 1,
            steps: vec![
                ScenarioStep::Assert {
                    condition: AssertCondition::SingletonOn {
                        node: "node-1".to_string(),
                    },
                },
                ScenarioStep::Wait { millis: 1000 },
                ScenarioStep::Assert {
                    condition: AssertCondition::StateIs {
                        node: "node-1".to_string(),
                        state: SingletonState::Oldest,
                    },
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::AtMostOneUnit,
                },
            ],
        }
    }

    /// Oldest leaves; the next oldest takes over through a hand-over.
    fn graceful_handover() -> Self {
        Self {
            name: "graceful-handover".to_string(),
            description: "Oldest leaves and hands the singleton over".to_string(),
            min_nodes: 2,
            steps: vec![
                ScenarioStep::Assert {
                    condition: AssertCondition::SingletonOn {
                        node: "node-1".to_string(),
                    },
                },
                ScenarioStep::Leave {
                    node: "node-1".to_string(),
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::SingletonOn {
                        node: "node-2".to_string(),
                    },
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::HandOversAtLeast { count: 1 },
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::AtMostOneUnit,
                },
            ],
        }
    }

    /// Oldest crashes; the next oldest starts after the removal margin.
    fn crash_failover() -> Self {
        Self {
            name: "crash-failover".to_string(),
            description: "Oldest crashes and the next oldest takes over".to_string(),
            min_nodes: 2,
            steps: vec![
                ScenarioStep::Assert {
                    condition: AssertCondition::SingletonOn {
                        node: "node-1".to_string(),
                    },
                },
                ScenarioStep::Crash {
                    target: NodeTarget::Oldest,
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::SingletonOn {
                        node: "node-2".to_string(),
                    },
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::AtMostOneUnit,
                },
            ],
        }
    }

    /// Every node is restarted in age order.
    fn rolling_restart() -> Self {
        let mut steps = Vec::new();
        for (node, next) in [("node-1", "node-2"), ("node-2", "node-3"), ("node-3", "node-1")] {
            steps.push(ScenarioStep::Leave {
                node: node.to_string(),
            });
            steps.push(ScenarioStep::Assert {
                condition: AssertCondition::SingletonOn {
                    node: next.to_string(),
                },
            });
            steps.push(ScenarioStep::Join {
                node: node.to_string(),
            });
        }
        steps.push(ScenarioStep::Assert {
            condition: AssertCondition::HandOversAtLeast { count: 3 },
        });
        steps.push(ScenarioStep::Assert {
            condition: AssertCondition::AtMostOneUnit,
        });

        Self {
            name: "rolling-restart".to_string(),
            description: "Restart all three nodes one after another".to_string(),
            min_nodes: 3,
            steps,
        }
    }
}
