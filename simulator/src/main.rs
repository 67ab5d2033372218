//! Baton Simulator
//!
//! Runs an in-process cluster of singleton coordinators through hand-over,
//! failover and churn scenarios.

use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cluster;
mod controller;
mod metrics;
mod scenario;

use cluster::ClusterSettings;
use controller::SimulationController;
use scenario::Scenario;

/// Baton Simulator CLI
#[derive(Parser, Debug)]
#[command(name = "simulator")]
#[command(about = "Baton cluster singleton simulator")]
struct Args {
    /// Number of nodes to start
    #[arg(short, long, default_value = "3")]
    nodes: usize,

    /// Scenario to run, by name or path to a JSON file
    #[arg(short, long)]
    scenario: Option<String>,

    /// Simulation speed multiplier
    #[arg(long, default_value = "1.0")]
    speed: f64,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,

    /// Run duration in seconds (0 = until Ctrl+C)
    #[arg(long, default_value = "0")]
    duration: u64,

    /// Hand-over retry interval in milliseconds
    #[arg(long, default_value = "200")]
    retry_interval_ms: u64,

    /// Delay before a crashed node is removed, in milliseconds
    #[arg(long, default_value = "1000")]
    removal_margin_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    info!("Starting Baton Simulator");
    info!("Nodes: {}", args.nodes);
    info!("Speed: {}x", args.speed);

    let settings = ClusterSettings {
        retry_interval: Duration::from_millis(args.retry_interval_ms),
        failure_detection_margin: Duration::from_millis(args.removal_margin_ms),
        ..ClusterSettings::default()
    };
    let mut controller = SimulationController::new(args.nodes, args.speed, args.seed, settings);

    controller.initialize().await?;
    info!("Simulator initialized with {} nodes", args.nodes);

    let outcome = if let Some(scenario_name) = &args.scenario {
        info!("Running scenario: {}", scenario_name);
        let scenario = Scenario::load(scenario_name)?;
        controller.run_scenario(scenario).await
    } else {
        info!("Running in continuous mode");
        info!("Press Ctrl+C to stop");

        let duration = if args.duration > 0 {
            Some(Duration::from_secs(args.duration))
        } else {
            None
        };
        controller.run(duration).await
    };

    let metrics = controller.finish().await;
    info!("Simulation complete");
    info!("Joins: {}, leaves: {}, crashes: {}", metrics.joins, metrics.leaves, metrics.crashes);
    info!("Hand-overs: {}", metrics.hand_overs);
    info!("Retries: {}", metrics.retries);
    info!("Singleton starts: {}", metrics.unit_starts);
    info!("Max concurrent singletons: {}", metrics.max_concurrent_units);
    info!(
        "Unavailability: {} windows, max {}ms, average {}ms",
        metrics.unavailability_windows(),
        metrics.max_unavailability_ms(),
        metrics.average_unavailability_ms()
    );
    if metrics.stuck > 0 {
        warn!("Stuck coordinators: {}", metrics.stuck);
    }
    if metrics.singleton_violated() {
        return Err(anyhow::anyhow!("More than one singleton was running at once"));
    }

    outcome
}
