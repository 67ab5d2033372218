//! In-process cluster of singleton coordinators.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use baton_common::{Address, MemberStatus, UnitId};
use baton_coordinator::metrics::MetricsSnapshot;
use baton_coordinator::{
    Coordinator, CoordinatorConfig, CoordinatorHandle, LocalMembership, LocalPeerRegistry,
    ManagedUnit, MembershipNotifierFactory, SingletonState, TerminationSignal, UnitContext,
    UnitFactory, UnitInput, UnitSupervisor,
};

/// Knobs shared by every simulated node.
#[derive(Debug, Clone)]
pub struct ClusterSettings {
    /// Hand-over and take-over retry interval.
    pub retry_interval: Duration,
    /// Lower bound of hand-over retries.
    pub min_retries: u32,
    /// Delay between a crash and the member being removed.
    pub failure_detection_margin: Duration,
    /// Signal delivered to the singleton on hand-over.
    pub termination_signal: TerminationSignal,
    /// Upper bound for a graceful leave to complete.
    pub leave_timeout: Duration,
    /// Re-creations allowed for a stuck coordinator.
    pub max_restarts: u32,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_millis(200),
            min_retries: 10,
            failure_detection_margin: Duration::from_secs(1),
            termination_signal: TerminationSignal::Graceful("hand-over".to_string()),
            leave_timeout: Duration::from_secs(10),
            max_restarts: 3,
        }
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    active: usize,
    max_active: usize,
    started: u64,
    gap_started: Option<Instant>,
    gaps: Vec<Duration>,
}

/// Counts live singleton incarnations across the whole cluster.
#[derive(Debug, Default)]
pub struct UnitTracker {
    state: Mutex<TrackerState>,
}

impl UnitTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn enter(self: &Arc<Self>) -> ActiveUnit {
        let mut state = self.state.lock();
        state.active += 1;
        state.started += 1;
        state.max_active = state.max_active.max(state.active);
        if let Some(since) = state.gap_started.take() {
            state.gaps.push(since.elapsed());
        }
        if state.active > 1 {
            warn!(active = state.active, "More than one singleton incarnation running");
        }
        ActiveUnit {
            tracker: self.clone(),
        }
    }

    fn exit(&self) {
        let mut state = self.state.lock();
        state.active = state.active.saturating_sub(1);
        if state.active == 0 {
            state.gap_started = Some(Instant::now());
        }
    }

    pub fn active(&self) -> usize {
        self.state.lock().active
    }

    pub fn max_active(&self) -> usize {
        self.state.lock().max_active
    }

    pub fn started(&self) -> u64 {
        self.state.lock().started
    }

    /// Closed periods with no incarnation running.
    pub fn unavailability(&self) -> Vec<Duration> {
        self.state.lock().gaps.clone()
    }
}

/// Held by a running incarnation; dropping it, even on abort, ends it.
struct ActiveUnit {
    tracker: Arc<UnitTracker>,
}

impl Drop for ActiveUnit {
    fn drop(&mut self) {
        self.tracker.exit();
    }
}

/// Singleton used by the simulator: runs until told to stop.
struct TrackedUnit {
    tracker: Arc<UnitTracker>,
}

#[async_trait]
impl ManagedUnit for TrackedUnit {
    async fn run(&mut self, mut ctx: UnitContext) -> anyhow::Result<()> {
        let _active = self.tracker.enter();
        loop {
            match ctx.next().await {
                UnitInput::Message(message) => debug!(unit = %ctx.id, %message, "Singleton got message"),
                UnitInput::Terminate(signal) => {
                    info!(unit = %ctx.id, signal = %signal, "Singleton handing over");
                    return Ok(());
                }
                UnitInput::Closed => return Ok(()),
            }
        }
    }
}

/// One running node.
pub struct SimulatedNode {
    pub name: String,
    pub address: Address,
    pub handle: CoordinatorHandle,
    supervisor: Arc<UnitSupervisor>,
    task: JoinHandle<baton_common::Result<()>>,
    forwarder: JoinHandle<()>,
}

/// A cluster of coordinators sharing one membership and one peer registry.
pub struct SimulatedCluster {
    settings: ClusterSettings,
    membership: Arc<LocalMembership>,
    registry: Arc<LocalPeerRegistry>,
    tracker: Arc<UnitTracker>,
    nodes: BTreeMap<String, SimulatedNode>,
    /// Handles of nodes that left or crashed, kept for their metrics.
    departed: Vec<CoordinatorHandle>,
    next_port: u16,
}

impl SimulatedCluster {
    pub fn new(settings: ClusterSettings) -> Self {
        Self {
            settings,
            membership: LocalMembership::new(),
            registry: LocalPeerRegistry::new(),
            tracker: UnitTracker::new(),
            nodes: BTreeMap::new(),
            departed: Vec::new(),
            next_port: 2552,
        }
    }

    /// Start a coordinator for `name` and join it. A name may be reused once
    /// its previous incarnation is gone; the new one gets a fresh address.
    pub fn start_node(&mut self, name: &str) -> anyhow::Result<Address> {
        if self.nodes.contains_key(name) {
            anyhow::bail!("Node {} is already running", name);
        }

        let address = Address::from_parts("sim", name, self.next_port);
        self.next_port += 1;

        let mut config = CoordinatorConfig::for_node(address.clone());
        config.node.down_removal_margin = self.settings.failure_detection_margin;
        config.singleton.singleton_name = "sim-singleton".to_string();
        config.singleton.hand_over_retry_interval = self.settings.retry_interval;
        config.singleton.min_hand_over_retries = self.settings.min_retries;
        config.singleton.termination_signal = self.settings.termination_signal.clone();

        let tracker = self.tracker.clone();
        let factory: Arc<dyn UnitFactory> = Arc::new(move |_id: UnitId| -> Box<dyn ManagedUnit> {
            Box::new(TrackedUnit {
                tracker: tracker.clone(),
            })
        });
        let supervisor = Arc::new(UnitSupervisor::from_config(&config.singleton, factory));
        let notifier = Arc::new(MembershipNotifierFactory::new(
            address.clone(),
            config.singleton.role.clone(),
            self.membership.clone(),
        ));

        let (coordinator, handle) =
            Coordinator::new(config, supervisor.clone(), self.registry.clone(), notifier)?;
        self.registry.register(address.clone(), handle.mailbox());
        let forwarder = self.membership.attach(handle.clone());
        let task = tokio::spawn(coordinator.run_supervised(self.settings.max_restarts));

        self.membership.join(address.clone(), Vec::<String>::new());
        info!(node = %name, address = %address, "Node started");

        self.nodes.insert(
            name.to_string(),
            SimulatedNode {
                name: name.to_string(),
                address: address.clone(),
                handle,
                supervisor,
                task,
                forwarder,
            },
        );
        Ok(address)
    }

    /// Leave gracefully: exit, wait for the hand-over, then remove.
    pub async fn leave(&mut self, name: &str) -> anyhow::Result<()> {
        let mut node = self.take(name)?;
        info!(node = %name, state = ?node.handle.status().state, "Node leaving");

        self.membership.leave(&node.address)?;
        // a lone node has nobody to hand over to; its removal stops the singleton
        if !self.nodes.is_empty() {
            let handle = node.handle.clone();
            let handed_over = tokio::time::timeout(self.settings.leave_timeout, async {
                loop {
                    let status = handle.status();
                    if status.stopped || !status.state.hosts_unit() {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await;
            if handed_over.is_err() {
                warn!(node = %name, state = ?node.handle.status().state, "Hand-over did not complete");
            }
        }

        self.membership.remove(&node.address)?;
        match tokio::time::timeout(self.settings.leave_timeout, &mut node.task).await {
            Ok(Ok(Ok(()))) => info!(node = %name, "Node left"),
            Ok(Ok(Err(e))) => warn!(node = %name, error = %e, "Coordinator failed while leaving"),
            Ok(Err(e)) => warn!(node = %name, error = %e, "Coordinator task failed"),
            Err(_) => {
                warn!(node = %name, "Coordinator did not stop, aborting");
                node.task.abort();
                node.supervisor.abort_all();
            }
        }

        node.forwarder.abort();
        self.registry.unregister(&node.address);
        self.departed.push(node.handle);
        Ok(())
    }

    /// Kill a node without a hand-over; membership removes it after the
    /// failure detection margin.
    pub async fn crash(&mut self, name: &str) -> anyhow::Result<()> {
        let node = self.take(name)?;
        warn!(node = %name, state = ?node.handle.status().state, "Crashing node");

        node.task.abort();
        node.forwarder.abort();
        node.supervisor.abort_all();
        self.registry.unregister(&node.address);
        self.membership.down(&node.address)?;

        tokio::time::sleep(self.settings.failure_detection_margin).await;
        self.membership.remove(&node.address)?;
        self.departed.push(node.handle);
        Ok(())
    }

    /// Abort every node.
    pub async fn shutdown(&mut self) {
        self.membership.shutdown();
        let nodes = std::mem::take(&mut self.nodes);
        let mut tasks = Vec::with_capacity(nodes.len());
        for (_, node) in nodes {
            node.task.abort();
            node.forwarder.abort();
            node.supervisor.abort_all();
            self.registry.unregister(&node.address);
            self.departed.push(node.handle);
            tasks.push(node.task);
        }
        futures::future::join_all(tasks).await;
        info!("Cluster shut down");
    }

    fn take(&mut self, name: &str) -> anyhow::Result<SimulatedNode> {
        self.nodes
            .remove(name)
            .ok_or_else(|| anyhow::anyhow!("Unknown node: {}", name))
    }

    pub fn names(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn state_of(&self, name: &str) -> Option<SingletonState> {
        self.nodes.get(name).map(|node| node.handle.status().state)
    }

    /// Names of nodes whose coordinator reports a running singleton.
    pub fn hosts(&self) -> Vec<String> {
        self.nodes
            .values()
            .filter(|node| node.handle.current_unit().is_some())
            .map(|node| node.name.clone())
            .collect()
    }

    /// Running node that the membership considers oldest.
    pub fn oldest(&self) -> Option<String> {
        let snapshot = self.membership.snapshot();
        let mut members: Vec<_> = snapshot
            .members
            .iter()
            .filter(|m| m.status == MemberStatus::Up)
            .collect();
        members.sort_by(|a, b| a.age_ordering(b));
        members.into_iter().find_map(|m| {
            self.nodes
                .values()
                .find(|node| node.address == m.address)
                .map(|node| node.name.clone())
        })
    }

    pub fn tracker(&self) -> &Arc<UnitTracker> {
        &self.tracker
    }

    /// Coordinator metrics of every node, past and present.
    pub fn coordinator_metrics(&self) -> Vec<MetricsSnapshot> {
        self.nodes
            .values()
            .map(|node| &node.handle)
            .chain(self.departed.iter())
            .map(|handle| handle.metrics().snapshot())
            .collect()
    }
}
