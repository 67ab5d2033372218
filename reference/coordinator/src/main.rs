//! Baton Node Binary
//!
//! Runs one coordinator against an in-process membership and hosts a
//! heartbeat unit until Ctrl+C, then leaves the cluster gracefully.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use baton_common::UnitId;
use baton_coordinator::{
    Coordinator, CoordinatorConfig, LocalMembership, LocalPeerRegistry, ManagedUnit,
    MembershipNotifierFactory, SingletonState, UnitContext, UnitFactory, UnitInput,
    UnitSupervisor,
};

struct Heartbeat;

#[async_trait]
impl ManagedUnit for Heartbeat {
    async fn run(&mut self, mut ctx: UnitContext) -> anyhow::Result<()> {
        let mut ticks = tokio::time::interval(Duration::from_secs(5));
        let mut beats = 0u64;
        loop {
            tokio::select! {
                _ = ticks.tick() => {
                    beats += 1;
                    info!(unit = %ctx.id, beats, "Singleton heartbeat");
                }
                input = ctx.next() => match input {
                    UnitInput::Message(message) => info!(unit = %ctx.id, %message, "Singleton message"),
                    UnitInput::Terminate(signal) => {
                        info!(unit = %ctx.id, %signal, "Singleton draining");
                        return Ok(());
                    }
                    UnitInput::Closed => return Ok(()),
                },
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting Baton node");

    let config = CoordinatorConfig::from_env();
    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(anyhow::anyhow!("Configuration error: {}", e));
    }

    let address = config.node.self_address.clone();
    let roles = config.node.roles.clone();

    let membership = LocalMembership::new();
    let registry = LocalPeerRegistry::new();
    let factory: Arc<dyn UnitFactory> =
        Arc::new(|_id: UnitId| -> Box<dyn ManagedUnit> { Box::new(Heartbeat) });
    let supervisor = Arc::new(UnitSupervisor::from_config(&config.singleton, factory));
    let notifier = Arc::new(MembershipNotifierFactory::new(
        address.clone(),
        config.singleton.role.clone(),
        membership.clone(),
    ));

    let (coordinator, handle) = Coordinator::new(config, supervisor, registry.clone(), notifier)?;
    registry.register(address.clone(), handle.mailbox());
    membership.attach(handle.clone());
    let mut task = tokio::spawn(coordinator.run_supervised(3));

    membership.join(address.clone(), roles);
    info!(node = %address, "Node joined");

    tokio::select! {
        result = &mut task => {
            let result = result?;
            info!(metrics = %handle.metrics().to_prometheus(), "Coordinator ended early");
            return result.map_err(Into::into);
        }
        signal = tokio::signal::ctrl_c() => signal?,
    }

    info!("Shutdown signal received, leaving cluster");
    membership.leave(&address)?;
    // a lone node has nobody to hand over to; removal stops it
    let handed_over = tokio::time::timeout(Duration::from_secs(10), async {
        while handle.status().state != SingletonState::End && !handle.status().stopped {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;
    if handed_over.is_err() {
        info!(node = %address, state = ?handle.status().state, "No hand-over, removing node");
    }
    membership.remove(&address)?;

    if let Err(e) = task.await? {
        error!(error = %e, "Coordinator failed during shutdown");
    }

    info!(metrics = %handle.metrics().to_prometheus(), "Node shutdown complete");
    Ok(())
}
