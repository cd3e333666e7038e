//! Traffic generator control plane.
//!
//! HTTP API over the traffic core: profile CRUD, lifecycle, stats,
//! neighbor discovery, and RFC2544 sweeps.

mod routes;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use traffic_core::{Capabilities, ControlAdapter, Core, CoreOptions};

#[derive(Parser, Debug)]
#[command(name = "trafficd")]
#[command(about = "Multi-port traffic generator and impairment emulator")]
struct Args {
    /// HTTP API port
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Persisted configuration file (profiles are recreated from it and
    /// every successful mutation rewrites it)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Restrict to these interfaces (repeatable); all ports by default
    #[arg(short, long)]
    interface: Vec<String>,

    /// Neighbor scan interval in seconds
    #[arg(long, default_value = "10")]
    scan_interval: u64,

    /// Request hardware TX timestamping where the NIC offers it
    #[arg(long)]
    hardware_timestamps: bool,

    /// Disable the RFC2544 benchmark endpoints
    #[arg(long)]
    no_rfc2544: bool,

    /// Disable neighbor discovery
    #[arg(long)]
    no_discovery: bool,

    /// Log verbosity
    #[arg(long, default_value = "info")]
    log_level: Level,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("starting traffic generator control plane");

    let capabilities = Capabilities {
        fast_path: false,
        hardware_timestamps: args.hardware_timestamps,
        rfc2544: !args.no_rfc2544,
        neighbor_discovery: !args.no_discovery,
    };

    let core = Core::start(CoreOptions {
        config_path: args.config,
        interfaces: (!args.interface.is_empty()).then_some(args.interface),
        prober_interval: Duration::from_secs(args.scan_interval.max(1)),
        capabilities,
    })
    .await
    .context("core startup failed (raw sockets need root or CAP_NET_RAW)")?;

    let adapter = ControlAdapter::new(core.clone());
    let app = routes::router(adapter);

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    info!("listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind API listener")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("API server error")?;

    core.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
