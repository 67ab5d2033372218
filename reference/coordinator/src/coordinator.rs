//! Core coordinator runtime.
//!
//! Owns a [`SingletonMachine`] and feeds it one inbox item at a time,
//! performing the effects of every step before taking the next item.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use baton_common::{Address, BatonError, ClusterEvent, MemberStatus, Result};
use baton_protocol::{Envelope, SingletonMessage};

use crate::config::CoordinatorConfig;
use crate::event::Event;
use crate::fsm::SingletonMachine;
use crate::metrics::{Metrics, SharedMetrics};
use crate::notifier::{NotifierFactory, OldestNotifier};
use crate::peer::PeerResolver;
use crate::state::{SingletonState, SingletonStatus};
use crate::timers::Timers;
use crate::transition::{Effect, Outcome, TimerKey};
use crate::unit::{UnitRef, UnitSupervisor};

/// Item queued in a coordinator inbox.
#[derive(Debug)]
pub enum Inbound {
    /// Locally produced event.
    Event(Event),
    /// Envelope from a peer coordinator.
    Peer(Envelope),
    /// Keyed timer fire, checked against the timer generation.
    Timer {
        key: TimerKey,
        generation: u64,
        event: Event,
    },
}

/// The singleton coordinator of one node.
pub struct Coordinator {
    /// Configuration.
    config: CoordinatorConfig,
    /// Address of this node.
    self_address: Address,
    /// Transition logic.
    machine: SingletonMachine,
    /// Single consumer inbox.
    inbox: mpsc::Receiver<Inbound>,
    /// Producer side handed to timers, units and the notifier.
    inbox_tx: mpsc::Sender<Inbound>,
    /// Keyed and one-shot timers.
    timers: Timers,
    /// Managed unit lifecycle.
    supervisor: Arc<UnitSupervisor>,
    /// Address to peer coordinator resolution.
    resolver: Arc<dyn PeerResolver>,
    /// Starts the oldest-change notifier.
    notifier_factory: Arc<dyn NotifierFactory>,
    /// Running notifier, if started.
    notifier: Option<Box<dyn OldestNotifier>>,
    /// Whether a notifier was started by the current instance.
    notifier_started: bool,
    /// Replay `StartNotifier` on the next run after a re-creation.
    restart_notifier: bool,
    /// Published status.
    status: Arc<RwLock<SingletonStatus>>,
    /// Metrics.
    metrics: SharedMetrics,
}

impl Coordinator {
    /// Create a coordinator and its handle. Invalid configuration is fatal.
    pub fn new(
        config: CoordinatorConfig,
        supervisor: Arc<UnitSupervisor>,
        resolver: Arc<dyn PeerResolver>,
        notifier_factory: Arc<dyn NotifierFactory>,
    ) -> Result<(Self, CoordinatorHandle)> {
        let machine = SingletonMachine::from_config(&config)?;
        if supervisor.signal() != &config.singleton.termination_signal {
            return Err(BatonError::Configuration(format!(
                "Supervisor termination signal {:?} differs from configured {:?}",
                supervisor.signal(),
                config.singleton.termination_signal
            )));
        }
        let self_address = config.node.self_address.clone();
        let (inbox_tx, inbox) = mpsc::channel(config.singleton.mailbox_capacity);
        let status = Arc::new(RwLock::new(SingletonStatus::initial()));
        let metrics = Arc::new(Metrics::new());

        info!(
            node = %self_address,
            singleton = %config.singleton.singleton_name,
            role = ?config.singleton.role,
            limits = ?machine.limits(),
            "Created singleton coordinator"
        );

        let handle = CoordinatorHandle {
            self_address: self_address.clone(),
            inbox: inbox_tx.clone(),
            status: status.clone(),
            metrics: metrics.clone(),
        };

        let coordinator = Self {
            config,
            self_address,
            machine,
            inbox,
            timers: Timers::new(inbox_tx.clone()),
            inbox_tx,
            supervisor,
            resolver,
            notifier_factory,
            notifier: None,
            notifier_started: false,
            restart_notifier: false,
            status,
            metrics,
        };

        Ok((coordinator, handle))
    }

    /// Run until the coordinator stops (`Ok`) or fails (`Err`).
    #[instrument(skip(self), fields(node = %self.self_address))]
    pub async fn run(mut self) -> Result<()> {
        self.run_instance().await
    }

    /// Run, re-creating the coordinator from `Start` after a stuck
    /// condition, at most `max_restarts` times.
    #[instrument(skip(self), fields(node = %self.self_address))]
    pub async fn run_supervised(mut self, max_restarts: u32) -> Result<()> {
        let mut restarts = 0;
        loop {
            match self.run_instance().await {
                Err(err) if err.is_stuck() && restarts < max_restarts => {
                    restarts += 1;
                    warn!(
                        node = %self.self_address,
                        restarts,
                        max_restarts,
                        error = %err,
                        "Re-creating stuck singleton coordinator"
                    );
                    self.reset()?;
                }
                result => return result,
            }
        }
    }

    async fn run_instance(&mut self) -> Result<()> {
        info!(node = %self.self_address, "Singleton coordinator running");
        self.timers.start(
            TimerKey::Cleanup,
            Event::Cleanup,
            self.config.singleton.cleanup_interval,
        );
        self.publish(None, false);

        if self.restart_notifier {
            self.restart_notifier = false;
            if let Some(result) = self.process(Event::StartNotifier) {
                return self.finish(result);
            }
        }

        let result = loop {
            let Some(inbound) = self.inbox.recv().await else {
                break Err(BatonError::ChannelClosed("coordinator inbox".to_string()));
            };
            let Some(event) = self.accept(inbound) else {
                continue;
            };
            if let Some(result) = self.process(event) {
                break result;
            }
        };

        self.finish(result)
    }

    /// Turn an inbox item into an event; stale timer fires are dropped.
    fn accept(&mut self, inbound: Inbound) -> Option<Event> {
        match inbound {
            Inbound::Event(event) => Some(event),
            Inbound::Peer(envelope) => {
                self.metrics.message_received();
                debug!(
                    node = %self.self_address,
                    from = %envelope.sender,
                    message = ?envelope.message,
                    "Received peer message"
                );
                Some(envelope.into())
            }
            Inbound::Timer {
                key,
                generation,
                event,
            } => {
                if !self.timers.accept(key, generation) {
                    debug!(node = %self.self_address, ?key, generation, "Discarding stale timer");
                    return None;
                }
                if key == TimerKey::Cleanup {
                    self.timers.start(
                        TimerKey::Cleanup,
                        Event::Cleanup,
                        self.config.singleton.cleanup_interval,
                    );
                }
                Some(event)
            }
        }
    }

    /// Handle one event; `Some` once the instance is done.
    fn process(&mut self, event: Event) -> Option<Result<()>> {
        if let Event::UnitTerminated { unit } = &event {
            if self.machine.running_unit() == Some(*unit) {
                self.metrics.unit_terminated();
            } else {
                debug!(node = %self.self_address, unit = %unit, "Termination of unknown unit");
            }
        }

        let before = self.machine.state();
        let step = self.machine.handle(event, Instant::now());
        for effect in step.effects {
            self.perform(effect);
        }

        let after = self.machine.state();
        if before != after {
            self.metrics.transition(after);
        }

        match step.outcome {
            Outcome::Continue => {
                self.publish(None, false);
                None
            }
            Outcome::Stopped => Some(Ok(())),
            Outcome::Fatal(err) => Some(Err(err)),
        }
    }

    fn perform(&mut self, effect: Effect) {
        match effect {
            Effect::StartNotifier => {
                if self.notifier.is_some() {
                    debug!(node = %self.self_address, "Notifier already running");
                } else {
                    self.notifier = Some(self.notifier_factory.start(self.inbox_tx.clone()));
                    self.notifier_started = true;
                }
            }
            Effect::RequestNextOldest => match self.notifier.as_mut() {
                Some(notifier) => notifier.request_next(),
                None => warn!(node = %self.self_address, "No notifier to request from"),
            },
            Effect::Send { to, message } => self.send(to, message),
            Effect::StartUnit(unit) => {
                self.supervisor.start(unit, self.inbox_tx.clone());
                self.metrics.unit_started();
            }
            Effect::TerminateUnit(unit) => self.supervisor.terminate(unit),
            Effect::StartTimer { key, event, after } => {
                match &event {
                    Event::HandOverRetry { count } if *count > 1 => self.metrics.hand_over_retry(),
                    Event::TakeOverRetry { count } if *count > 1 => self.metrics.take_over_retry(),
                    _ => {}
                }
                self.timers.start(key, event, after);
            }
            Effect::CancelTimer(key) => self.timers.cancel(key),
            Effect::ScheduleOnce { event, after } => self.timers.schedule_once(event, after),
        }
    }

    fn send(&self, to: Address, message: SingletonMessage) {
        let Some(peer) = self.resolver.resolve(&to) else {
            debug!(node = %self.self_address, peer = %to, ?message, "Peer unreachable, message dropped");
            self.metrics.message_dropped();
            return;
        };

        let envelope = Envelope::new(self.self_address.clone(), message);
        match peer.tell(&envelope) {
            Ok(()) => {
                self.metrics.message_sent();
                if message == SingletonMessage::HandOverDone {
                    self.metrics.hand_over_completed();
                }
            }
            Err(err) => {
                warn!(node = %self.self_address, peer = %to, ?message, error = %err, "Failed to send");
                self.metrics.message_dropped();
            }
        }
    }

    fn finish(&mut self, result: Result<()>) -> Result<()> {
        self.timers.cancel_all();
        self.notifier = None;

        let stuck = match &result {
            Ok(()) => {
                info!(node = %self.self_address, state = ?self.machine.state(), "Singleton coordinator stopped");
                None
            }
            Err(err) => {
                error!(
                    node = %self.self_address,
                    state = ?self.machine.state(),
                    code = err.error_code(),
                    error = %err,
                    "Singleton coordinator failed"
                );
                if err.is_stuck() {
                    self.metrics.stuck();
                    Some(err.to_string())
                } else {
                    None
                }
            }
        };

        self.publish(stuck, true);
        result
    }

    /// Fresh `Start`/`Uninitialized` instance on the same inbox. Units of
    /// the failed instance go down with it.
    fn reset(&mut self) -> Result<()> {
        self.supervisor.abort_all();
        self.machine = SingletonMachine::from_config(&self.config)?;
        self.restart_notifier = self.notifier_started;
        self.notifier_started = false;
        self.metrics.restarted();
        self.metrics.set_state(SingletonState::Start);
        Ok(())
    }

    fn publish(&self, stuck: Option<String>, stopped: bool) {
        let unit = self
            .machine
            .active_unit()
            .and_then(|id| self.supervisor.get(id));
        *self.status.write() = SingletonStatus {
            state: self.machine.state(),
            unit,
            stuck,
            stopped,
        };
    }
}

/// Cloneable handle used to feed and observe a [`Coordinator`].
#[derive(Clone)]
pub struct CoordinatorHandle {
    self_address: Address,
    inbox: mpsc::Sender<Inbound>,
    status: Arc<RwLock<SingletonStatus>>,
    metrics: SharedMetrics,
}

impl CoordinatorHandle {
    pub fn self_address(&self) -> &Address {
        &self.self_address
    }

    /// Inbox sender to register with a peer registry.
    pub fn mailbox(&self) -> mpsc::Sender<Inbound> {
        self.inbox.clone()
    }

    /// Forward a membership event. Self becoming `Up` starts the notifier.
    pub async fn cluster_event(&self, event: ClusterEvent) -> Result<()> {
        match event {
            ClusterEvent::MemberUp(member) => {
                if member.address == self.self_address {
                    self.send(Inbound::Event(Event::StartNotifier)).await
                } else {
                    Ok(())
                }
            }
            ClusterEvent::MemberExited(member) => {
                self.send(Inbound::Event(Event::MemberExited {
                    address: member.address,
                }))
                .await
            }
            ClusterEvent::MemberRemoved(member) => {
                self.send(Inbound::Event(Event::MemberRemoved {
                    address: member.address,
                }))
                .await
            }
            ClusterEvent::CurrentClusterState(state) => {
                self.send(Inbound::Event(Event::CurrentClusterState)).await?;
                let self_up = state
                    .member(&self.self_address)
                    .map_or(false, |m| matches!(m.status, MemberStatus::Up | MemberStatus::Leaving));
                if self_up {
                    self.send(Inbound::Event(Event::StartNotifier)).await?;
                }
                Ok(())
            }
        }
    }

    /// Deliver an envelope received from a peer.
    pub async fn deliver(&self, envelope: Envelope) -> Result<()> {
        self.send(Inbound::Peer(envelope)).await
    }

    /// Tell the coordinator the membership service has terminated.
    pub async fn cluster_shutdown(&self) -> Result<()> {
        self.send(Inbound::Event(Event::ClusterShutdown)).await
    }

    pub fn status(&self) -> SingletonStatus {
        self.status.read().clone()
    }

    /// Locally hosted managed unit, when active.
    pub fn current_unit(&self) -> Option<UnitRef> {
        self.status.read().unit.clone()
    }

    pub fn metrics(&self) -> SharedMetrics {
        self.metrics.clone()
    }

    async fn send(&self, inbound: Inbound) -> Result<()> {
        self.inbox
            .send(inbound)
            .await
            .map_err(|_| BatonError::ChannelClosed(format!("coordinator {}", self.self_address)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::config::TerminationSignal;
    use crate::membership::LocalMembership;
    use crate::notifier::MembershipNotifierFactory;
    use crate::peer::LocalPeerRegistry;
    use crate::unit::{ManagedUnit, UnitContext, UnitFactory};
    use baton_common::UnitId;

    struct Idle;

    #[async_trait]
    impl ManagedUnit for Idle {
        async fn run(&mut self, mut ctx: UnitContext) -> anyhow::Result<()> {
            ctx.terminated().await;
            Ok(())
        }
    }

    fn addr(host: &str) -> Address {
        Address::from_parts("sys", host, 2552)
    }

    fn config(host: &str) -> CoordinatorConfig {
        let mut config = CoordinatorConfig::for_node(addr(host));
        config.singleton.hand_over_retry_interval = Duration::from_millis(100);
        config.singleton.min_hand_over_retries = 5;
        config
    }

    struct Node {
        handle: CoordinatorHandle,
        task: tokio::task::JoinHandle<Result<()>>,
    }

    fn start_node(
        config: CoordinatorConfig,
        membership: &Arc<LocalMembership>,
        registry: &Arc<LocalPeerRegistry>,
    ) -> Node {
        let address = config.node.self_address.clone();
        let factory: Arc<dyn UnitFactory> =
            Arc::new(|_id: UnitId| -> Box<dyn ManagedUnit> { Box::new(Idle) });
        let supervisor = Arc::new(UnitSupervisor::new(
            "idle",
            factory,
            TerminationSignal::StopNow,
        ));
        let notifier = Arc::new(MembershipNotifierFactory::new(
            address.clone(),
            None,
            membership.clone(),
        ));
        let (coordinator, handle) =
            Coordinator::new(config, supervisor, registry.clone(), notifier).unwrap();
        registry.register(address, handle.mailbox());
        membership.attach(handle.clone());
        Node {
            handle,
            task: tokio::spawn(coordinator.run()),
        }
    }

    async fn wait_for(handle: &CoordinatorHandle, state: SingletonState) {
        let reached = tokio::time::timeout(Duration::from_secs(10), async {
            while handle.status().state != state {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(
            reached.is_ok(),
            "{} never reached {:?}, status {:?}",
            handle.self_address(),
            state,
            handle.status()
        );
    }

    #[test]
    fn test_missing_role_is_fatal_at_construction() {
        let mut config = config("a");
        config.singleton.role = Some("backend".into());

        let membership = LocalMembership::new();
        let factory: Arc<dyn UnitFactory> =
            Arc::new(|_id: UnitId| -> Box<dyn ManagedUnit> { Box::new(Idle) });
        let supervisor = Arc::new(UnitSupervisor::new("idle", factory, TerminationSignal::StopNow));
        let notifier = Arc::new(MembershipNotifierFactory::new(addr("a"), None, membership));

        let result = Coordinator::new(config, supervisor, LocalPeerRegistry::new(), notifier);
        assert!(matches!(result, Err(BatonError::MissingRole { .. })));
    }

    #[test]
    fn test_supervisor_signal_must_match_config() {
        let mut config = config("a");
        config.singleton.termination_signal = TerminationSignal::Graceful("drain".into());

        let membership = LocalMembership::new();
        let factory: Arc<dyn UnitFactory> =
            Arc::new(|_id: UnitId| -> Box<dyn ManagedUnit> { Box::new(Idle) });
        let notifier = Arc::new(MembershipNotifierFactory::new(addr("a"), None, membership));

        let drifted = Arc::new(UnitSupervisor::new("idle", factory.clone(), TerminationSignal::StopNow));
        let result = Coordinator::new(
            config.clone(),
            drifted,
            LocalPeerRegistry::new(),
            notifier.clone(),
        );
        assert!(matches!(result, Err(BatonError::Configuration(_))));

        let supervisor = Arc::new(UnitSupervisor::from_config(&config.singleton, factory));
        assert!(Coordinator::new(config, supervisor, LocalPeerRegistry::new(), notifier).is_ok());
    }

    #[tokio::test]
    async fn test_single_node_hosts_singleton() {
        let membership = LocalMembership::new();
        let registry = LocalPeerRegistry::new();
        let node = start_node(config("a"), &membership, &registry);

        membership.join(addr("a"), Vec::<String>::new());
        wait_for(&node.handle, SingletonState::Oldest).await;

        let unit = node.handle.current_unit().unwrap();
        assert_eq!(unit.name, "idle");
        assert_eq!(node.handle.metrics().snapshot().units_started, 1);
    }

    #[tokio::test]
    async fn test_stale_unit_termination_is_not_counted() {
        let membership = LocalMembership::new();
        let registry = LocalPeerRegistry::new();
        let node = start_node(config("a"), &membership, &registry);

        membership.join(addr("a"), Vec::<String>::new());
        wait_for(&node.handle, SingletonState::Oldest).await;

        // left over from an instance that was re-created
        node.handle
            .mailbox()
            .send(Inbound::Event(Event::UnitTerminated {
                unit: UnitId::new(),
            }))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let snapshot = node.handle.metrics().snapshot();
        assert_eq!(snapshot.units_terminated, 0);
        assert!(node.handle.current_unit().is_some());
    }

    #[tokio::test]
    async fn test_graceful_leave_hands_over() {
        let membership = LocalMembership::new();
        let registry = LocalPeerRegistry::new();
        let a = start_node(config("a"), &membership, &registry);
        let b = start_node(config("b"), &membership, &registry);

        membership.join(addr("a"), Vec::<String>::new());
        wait_for(&a.handle, SingletonState::Oldest).await;
        membership.join(addr("b"), Vec::<String>::new());
        wait_for(&b.handle, SingletonState::Younger).await;

        membership.leave(&addr("a")).unwrap();
        wait_for(&b.handle, SingletonState::Oldest).await;
        wait_for(&a.handle, SingletonState::End).await;
        assert!(a.handle.current_unit().is_none());
        assert!(b.handle.current_unit().is_some());
        assert_eq!(a.handle.metrics().snapshot().hand_overs_completed, 1);

        membership.remove(&addr("a")).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), a.task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert!(a.handle.status().stopped);
    }

    #[tokio::test]
    async fn test_crash_of_oldest_fails_over() {
        let membership = LocalMembership::new();
        let registry = LocalPeerRegistry::new();
        let a = start_node(config("a"), &membership, &registry);
        let b = start_node(config("b"), &membership, &registry);

        membership.join(addr("a"), Vec::<String>::new());
        wait_for(&a.handle, SingletonState::Oldest).await;
        membership.join(addr("b"), Vec::<String>::new());
        wait_for(&b.handle, SingletonState::Younger).await;

        a.task.abort();
        registry.unregister(&addr("a"));
        membership.down(&addr("a")).unwrap();
        membership.remove(&addr("a")).unwrap();

        wait_for(&b.handle, SingletonState::Oldest).await;
        assert!(b.handle.current_unit().is_some());
    }

    #[tokio::test]
    async fn test_unresponsive_previous_oldest_is_stuck() {
        let membership = LocalMembership::new();
        let registry = LocalPeerRegistry::new();
        // "a" is a member whose coordinator never answers
        membership.join(addr("a"), Vec::<String>::new());
        let b = start_node(config("b"), &membership, &registry);
        membership.join(addr("b"), Vec::<String>::new());
        wait_for(&b.handle, SingletonState::Younger).await;

        membership.leave(&addr("a")).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(10), b.task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(ref e) if e.is_stuck()));

        let status = b.handle.status();
        assert!(status.stuck.is_some());
        assert!(status.stopped);
        assert_eq!(b.handle.metrics().snapshot().stuck_total, 1);
    }

    #[tokio::test]
    async fn test_supervised_coordinator_is_recreated_after_stuck() {
        let membership = LocalMembership::new();
        let registry = LocalPeerRegistry::new();
        membership.join(addr("a"), Vec::<String>::new());

        let factory: Arc<dyn UnitFactory> =
            Arc::new(|_id: UnitId| -> Box<dyn ManagedUnit> { Box::new(Idle) });
        let supervisor = Arc::new(UnitSupervisor::new("idle", factory, TerminationSignal::StopNow));
        let notifier = Arc::new(MembershipNotifierFactory::new(addr("b"), None, membership.clone()));
        let (coordinator, handle) =
            Coordinator::new(config("b"), supervisor, registry.clone(), notifier).unwrap();
        registry.register(addr("b"), handle.mailbox());
        membership.attach(handle.clone());
        let task = tokio::spawn(coordinator.run_supervised(3));

        membership.join(addr("b"), Vec::<String>::new());
        wait_for(&handle, SingletonState::Younger).await;
        membership.leave(&addr("a")).unwrap();

        let restarted = tokio::time::timeout(Duration::from_secs(10), async {
            while handle.metrics().snapshot().restarts_total == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(restarted.is_ok());

        // once "a" is gone a re-created instance sees a safe snapshot and takes over
        membership.remove(&addr("a")).unwrap();
        wait_for(&handle, SingletonState::Oldest).await;
        assert!(handle.status().stuck.is_none());
        task.abort();
    }
}
