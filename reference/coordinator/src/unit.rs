//! Managed unit lifecycle.
//!
//! The coordinator only ever asks the supervisor to start a unit or to
//! deliver its termination signal. However a unit ends (returning, failing,
//! panicking or being aborted) the owning coordinator receives exactly one
//! `UnitTerminated` for it.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use baton_common::{now, BatonError, Result, Timestamp, UnitId};

use crate::config::{SingletonConfig, TerminationSignal};
use crate::coordinator::Inbound;
use crate::event::Event;

/// The long-lived component kept unique across the cluster.
#[async_trait]
pub trait ManagedUnit: Send + 'static {
    /// Run until finished or told to stop through the context.
    async fn run(&mut self, ctx: UnitContext) -> anyhow::Result<()>;
}

/// Creates a fresh unit for every incarnation.
pub trait UnitFactory: Send + Sync {
    fn create(&self, id: UnitId) -> Box<dyn ManagedUnit>;
}

impl<F> UnitFactory for F
where
    F: Fn(UnitId) -> Box<dyn ManagedUnit> + Send + Sync,
{
    fn create(&self, id: UnitId) -> Box<dyn ManagedUnit> {
        self(id)
    }
}

/// Input observed by a running unit.
#[derive(Debug, Clone, PartialEq)]
pub enum UnitInput {
    /// Application message sent through a [`UnitRef`].
    Message(serde_json::Value),
    /// Graceful termination was requested.
    Terminate(String),
    /// Every handle is gone.
    Closed,
}

/// Unit-side view of its incarnation.
pub struct UnitContext {
    pub id: UnitId,
    pub name: String,
    termination: mpsc::Receiver<String>,
    mailbox: mpsc::Receiver<serde_json::Value>,
}

impl UnitContext {
    /// Wait for the next message or termination request.
    pub async fn next(&mut self) -> UnitInput {
        tokio::select! {
            biased;
            signal = self.termination.recv() => match signal {
                Some(signal) => UnitInput::Terminate(signal),
                None => UnitInput::Closed,
            },
            message = self.mailbox.recv() => match message {
                Some(message) => UnitInput::Message(message),
                None => UnitInput::Closed,
            },
        }
    }

    /// Wait for a termination request only.
    pub async fn terminated(&mut self) -> Option<String> {
        self.termination.recv().await
    }
}

/// Caller-side handle to a running unit.
#[derive(Debug, Clone, Serialize)]
pub struct UnitRef {
    pub id: UnitId,
    pub name: String,
    pub started_at: Timestamp,
    #[serde(skip)]
    mailbox: mpsc::Sender<serde_json::Value>,
}

impl UnitRef {
    /// Send a message to the unit without waiting.
    pub fn tell(&self, message: serde_json::Value) -> Result<()> {
        self.mailbox
            .try_send(message)
            .map_err(|e| BatonError::ChannelClosed(format!("unit {}: {}", self.id, e)))
    }
}

struct RunningUnit {
    unit_ref: UnitRef,
    termination: mpsc::Sender<String>,
    abort: AbortHandle,
}

/// Spawns units as tokio tasks and reports their end to the owner.
pub struct UnitSupervisor {
    name: String,
    factory: Arc<dyn UnitFactory>,
    signal: TerminationSignal,
    mailbox_capacity: usize,
    units: Arc<DashMap<UnitId, RunningUnit>>,
}

impl UnitSupervisor {
    pub fn new(
        name: impl Into<String>,
        factory: Arc<dyn UnitFactory>,
        signal: TerminationSignal,
    ) -> Self {
        Self {
            name: name.into(),
            factory,
            signal,
            mailbox_capacity: 256,
            units: Arc::new(DashMap::new()),
        }
    }

    /// Supervisor named and signalled as `config` says.
    pub fn from_config(config: &SingletonConfig, factory: Arc<dyn UnitFactory>) -> Self {
        Self::new(
            config.singleton_name.clone(),
            factory,
            config.termination_signal.clone(),
        )
    }

    pub fn signal(&self) -> &TerminationSignal {
        &self.signal
    }

    /// Start a unit incarnation; its end is reported to `owner`.
    pub fn start(&self, id: UnitId, owner: mpsc::Sender<Inbound>) -> UnitRef {
        let (mailbox_tx, mailbox_rx) = mpsc::channel(self.mailbox_capacity);
        let (termination_tx, termination_rx) = mpsc::channel(1);

        let unit_ref = UnitRef {
            id,
            name: self.name.clone(),
            started_at: now(),
            mailbox: mailbox_tx,
        };
        let ctx = UnitContext {
            id,
            name: self.name.clone(),
            termination: termination_rx,
            mailbox: mailbox_rx,
        };

        let mut unit = self.factory.create(id);
        let task = tokio::spawn(async move { unit.run(ctx).await });

        self.units.insert(
            id,
            RunningUnit {
                unit_ref: unit_ref.clone(),
                termination: termination_tx,
                abort: task.abort_handle(),
            },
        );
        info!(unit = %id, name = %self.name, "Managed unit started");

        let units = self.units.clone();
        tokio::spawn(async move {
            match task.await {
                Ok(Ok(())) => info!(unit = %id, "Managed unit stopped"),
                Ok(Err(e)) => warn!(unit = %id, error = %e, "Managed unit failed"),
                Err(e) if e.is_cancelled() => info!(unit = %id, "Managed unit aborted"),
                Err(e) => error!(unit = %id, error = %e, "Managed unit panicked"),
            }
            units.remove(&id);
            if owner
                .send(Inbound::Event(Event::UnitTerminated { unit: id }))
                .await
                .is_err()
            {
                debug!(unit = %id, "Owner gone, termination not reported");
            }
        });

        unit_ref
    }

    /// Deliver the configured termination signal.
    pub fn terminate(&self, id: UnitId) {
        let Some(running) = self.units.get(&id) else {
            debug!(unit = %id, "Terminate requested for unknown unit");
            return;
        };

        match &self.signal {
            TerminationSignal::StopNow => {
                info!(unit = %id, "Stopping managed unit");
                running.abort.abort();
            }
            TerminationSignal::Graceful(signal) => {
                info!(unit = %id, signal = %signal, "Requesting managed unit termination");
                if running.termination.try_send(signal.clone()).is_err() {
                    // already asked, or the unit dropped its context
                    debug!(unit = %id, "Termination signal not delivered");
                }
            }
        }
    }

    /// Abort every unit, as a crashing process would.
    pub fn abort_all(&self) {
        for entry in self.units.iter() {
            warn!(unit = %entry.key(), "Aborting managed unit");
            entry.abort.abort();
        }
    }

    pub fn get(&self, id: UnitId) -> Option<UnitRef> {
        self.units.get(&id).map(|running| running.unit_ref.clone())
    }

    pub fn running_count(&self) -> usize {
        self.units.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Echo {
        seen: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ManagedUnit for Echo {
        async fn run(&mut self, mut ctx: UnitContext) -> anyhow::Result<()> {
            loop {
                match ctx.next().await {
                    UnitInput::Message(_) => {
                        self.seen.fetch_add(1, Ordering::SeqCst);
                    }
                    UnitInput::Terminate(_) | UnitInput::Closed => return Ok(()),
                }
            }
        }
    }

    struct Failing;

    #[async_trait]
    impl ManagedUnit for Failing {
        async fn run(&mut self, _ctx: UnitContext) -> anyhow::Result<()> {
            anyhow::bail!("boom")
        }
    }

    fn echo_supervisor(signal: TerminationSignal, seen: Arc<AtomicUsize>) -> UnitSupervisor {
        let factory = move |_id: UnitId| -> Box<dyn ManagedUnit> {
            Box::new(Echo { seen: seen.clone() })
        };
        UnitSupervisor::new("echo", Arc::new(factory), signal)
    }

    async fn expect_terminated(rx: &mut mpsc::Receiver<Inbound>, id: UnitId) {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(Inbound::Event(Event::UnitTerminated { unit }))) => assert_eq!(unit, id),
            other => panic!("expected termination of {}, got {:?}", id, other),
        }
    }

    #[tokio::test]
    async fn test_stop_now_aborts_and_reports() {
        let seen = Arc::new(AtomicUsize::new(0));
        let supervisor = echo_supervisor(TerminationSignal::StopNow, seen);
        let (tx, mut rx) = mpsc::channel(4);

        let id = UnitId::new();
        supervisor.start(id, tx);
        assert_eq!(supervisor.running_count(), 1);

        supervisor.terminate(id);
        expect_terminated(&mut rx, id).await;
        assert!(supervisor.get(id).is_none());
    }

    #[tokio::test]
    async fn test_graceful_signal_is_delivered() {
        let seen = Arc::new(AtomicUsize::new(0));
        let supervisor = echo_supervisor(TerminationSignal::Graceful("drain".into()), seen.clone());
        let (tx, mut rx) = mpsc::channel(4);

        let id = UnitId::new();
        let unit = supervisor.start(id, tx);
        unit.tell(json!({"op": "ping"})).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        supervisor.terminate(id);
        expect_terminated(&mut rx, id).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_supervisor_from_config_uses_configured_signal() {
        let mut config = SingletonConfig::default();
        config.singleton_name = "scheduler".to_string();
        config.termination_signal = TerminationSignal::Graceful("drain".into());

        let seen = Arc::new(AtomicUsize::new(0));
        let factory = move |_id: UnitId| -> Box<dyn ManagedUnit> {
            Box::new(Echo { seen: seen.clone() })
        };
        let supervisor = UnitSupervisor::from_config(&config, Arc::new(factory));
        assert_eq!(supervisor.signal(), &config.termination_signal);

        let (tx, mut rx) = mpsc::channel(4);
        let id = UnitId::new();
        let unit = supervisor.start(id, tx);
        assert_eq!(unit.name, "scheduler");

        supervisor.terminate(id);
        expect_terminated(&mut rx, id).await;
    }

    #[tokio::test]
    async fn test_failed_unit_is_reported() {
        let factory = |_id: UnitId| -> Box<dyn ManagedUnit> { Box::new(Failing) };
        let supervisor = UnitSupervisor::new("failing", Arc::new(factory), TerminationSignal::StopNow);
        let (tx, mut rx) = mpsc::channel(4);

        let id = UnitId::new();
        supervisor.start(id, tx);
        expect_terminated(&mut rx, id).await;
    }

    #[tokio::test]
    async fn test_abort_all_reports_every_unit() {
        let seen = Arc::new(AtomicUsize::new(0));
        let supervisor = echo_supervisor(TerminationSignal::StopNow, seen);
        let (tx, mut rx) = mpsc::channel(4);

        let first = UnitId::new();
        let second = UnitId::new();
        supervisor.start(first, tx.clone());
        supervisor.start(second, tx);
        supervisor.abort_all();

        let mut ended = Vec::new();
        for _ in 0..2 {
            if let Some(Inbound::Event(Event::UnitTerminated { unit })) = rx.recv().await {
                ended.push(unit);
            }
        }
        assert!(ended.contains(&first) && ended.contains(&second));
        assert_eq!(supervisor.running_count(), 0);
    }

    #[test]
    fn test_unit_ref_serializes_without_mailbox() {
        let (tx, _rx) = mpsc::channel(1);
        let unit = UnitRef {
            id: UnitId::new(),
            name: "echo".into(),
            started_at: now(),
            mailbox: tx,
        };
        let value = serde_json::to_value(&unit).unwrap();
        assert_eq!(value["name"], "echo");
        assert!(value.get("mailbox").is_none());
    }
}
