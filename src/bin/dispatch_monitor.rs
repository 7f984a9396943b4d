//! Dispatch monitor binary
//!
//! Loads a dispatch config, pings every content node in the background and
//! periodically logs health, coverage and rotation status.

use searchdispatch::config::DispatchConfig;
use searchdispatch::dispatch::TcpRpcClient;
use searchdispatch::dispatcher::Dispatcher;
use searchdispatch::telemetry;
use searchdispatch::Error;

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};

/// Content cluster health monitor
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the dispatch config (JSON)
    #[arg(long, env = "DISPATCH_CONFIG")]
    config: PathBuf,

    /// Seconds between status reports
    #[arg(long, default_value = "10")]
    report_interval_secs: u64,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    telemetry::init_logging(&args.log_level, args.json_logs)?;

    let raw = tokio::fs::read_to_string(&args.config).await.map_err(|e| {
        Error::Config(format!("cannot read {}: {}", args.config.display(), e))
    })?;
    let config = DispatchConfig::from_json(&raw)?.with_env_overrides()?;

    info!(
        cluster = %config.cluster_name,
        nodes = config.nodes.len(),
        connections_per_node = config.num_rpc_connections,
        "Starting dispatch monitor"
    );

    let dispatcher = Dispatcher::new(config, &TcpRpcClient)?;
    dispatcher.start();

    let mut report = tokio::time::interval(Duration::from_secs(args.report_interval_secs.max(1)));
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = report.tick() => log_status(&dispatcher),
            _ = &mut shutdown => break,
        }
    }

    info!("Dispatch monitor shutting down");
    dispatcher.shutdown().await;
    Ok(())
}

fn log_status(dispatcher: &Dispatcher) {
    let cluster = dispatcher.cluster();
    for group in cluster.groups() {
        info!(
            group = group.id(),
            working = group.working_nodes(),
            nodes = group.nodes().len(),
            active_docs = group.active_documents(),
            coverage = cluster.group_coverage(group),
            "Group status"
        );
    }
    for node in cluster.nodes().iter().filter(|n| !n.is_working()) {
        warn!(node = %node, "Node out of service");
    }
    info!(
        in_rotation = cluster.in_rotation(),
        local_target = ?cluster.local_corpus_dispatch_target().map(|n| n.key()),
        "Cluster status"
    );
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
