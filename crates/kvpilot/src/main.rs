//! Operator entry point
//!
//! Runs the reconciliation runtime and the failover pipeline against the
//! in-memory resource store and simulated node fleet, optionally seeding
//! cluster declarations from JSON files. Real deployments plug platform
//! and wire-protocol backends into the same `OperatorContext`.

use std::sync::Arc;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use kvpilot::node::sim::SimNodeClient;
use kvpilot::resource::KvCluster;
use kvpilot::store::memory::MemoryResourceStore;
use kvpilot::store::ResourceStore;
use kvpilot::{Controller, OperatorConfig, OperatorContext};

/// kvpilot - declarative operator for sharded key-value clusters
#[derive(Parser, Debug)]
#[command(name = "kvpilot")]
#[command(about = "Converges declared key-value clusters toward their declaration")]
struct Args {
    /// Cluster declarations (JSON) to seed at startup
    #[arg(short, long)]
    declare: Vec<String>,

    /// Concurrent reconciliation workers
    #[arg(long, default_value = "4")]
    workers: usize,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = OperatorConfig {
        workers: args.workers,
        ..Default::default()
    };
    let store = Arc::new(MemoryResourceStore::new());
    let nodes = Arc::new(SimNodeClient::new());
    let (ctx, failover_rx) = OperatorContext::new(store.clone(), nodes, config);

    info!("starting kvpilot operator");
    for path in &args.declare {
        let raw = tokio::fs::read_to_string(path).await?;
        let cluster: KvCluster = serde_json::from_str(&raw)?;
        info!(cluster = %cluster.key(), "seeding declared cluster");
        store.create_cluster_if_absent(&cluster).await?;
    }

    let mut handles = Controller::new(ctx.clone()).spawn();
    handles.extend(kvpilot::failover::spawn(ctx, failover_rx));

    // the dev harness plays the platform scheduler as well
    handles.push(tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_millis(500));
        loop {
            tick.tick().await;
            store.settle_pods();
        }
    }));

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    for handle in handles {
        handle.abort();
    }
    Ok(())
}
