//! pipebench: pipelined throughput benchmark for framed RPC servers
//!
//! Holds one persistent connection (or several) to a Thrift server and
//! pipelines requests over it:
//! - a producer sends bursts of requests, pausing between bursts
//! - a consumer drains responses in arrival order and counts them
//! - a monitor prints `QPS : <rate>` once per sampling period
//!
//! Features:
//! - Failures drain the run into an idle state that keeps reporting
//! - Built-in reply server (`--serve`) to benchmark against
//! - Configuration via CLI arguments or TOML file

mod config;
mod connection;
mod consumer;
mod coordinator;
mod error;
mod monitor;
mod peer;
mod producer;
mod protocol;
mod signal;

use config::Config;
use coordinator::Coordinator;
use monitor::StdoutSink;
use peer::ReplyPeer;
use protocol::thrift::ThriftCodec;
use signal::Latch;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    match config.serve.clone() {
        Some(listen) => runtime.block_on(run_peer(&listen, &config.reply)),
        None => runtime.block_on(run_harness(config)),
    }
}

/// Generate load until interrupted.
async fn run_harness(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        host = %config.host,
        port = config.port,
        connections = config.connections,
        batch_size = config.batch_size,
        sleep_ms = config.sleep_ms,
        sample_period_ms = config.sample_period_ms,
        "Starting pipebench"
    );

    let codec = ThriftCodec::new(config.method.clone());
    let coordinator = Coordinator::new(config);
    let state = coordinator.state();
    stop_on_ctrl_c(coordinator.shutdown_handle());

    let summary = coordinator.run(codec, StdoutSink::new()).await?;
    info!(
        state = ?state.get(),
        responses = summary.responses(),
        failures = summary.failures,
        first_failure = ?summary.first_failure,
        "Stopped"
    );
    Ok(())
}

/// Serve replies until interrupted.
async fn run_peer(listen: &str, reply: &str) -> Result<(), Box<dyn std::error::Error>> {
    let peer = ReplyPeer::bind(listen, reply).await?;
    let shutdown = Arc::new(Latch::new());
    stop_on_ctrl_c(Arc::clone(&shutdown));
    peer.run(shutdown).await?;
    Ok(())
}

fn stop_on_ctrl_c(shutdown: Arc<Latch>) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupted");
                shutdown.set();
            }
            Err(e) => warn!(error = %e, "Cannot listen for Ctrl-C"),
        }
    });
}
