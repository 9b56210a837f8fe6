//! geowatch gRPC Server
//!
//! A standalone server binary exposing the geowatch engine over gRPC.
//!
//! Usage:
//!   geowatch-server --port 50051 --config geowatch.json
//!
//! Location history is kept in memory; fences live for the process lifetime.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tonic::transport::Server;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use geowatch::history::InMemoryHistoryStore;
use geowatch::transport::GeowatchService;
use geowatch::{GeowatchConfig, GeowatchEngine};

#[derive(Parser, Debug)]
#[command(name = "geowatch-server")]
#[command(about = "Real-time geofence monitoring and alert broadcast server")]
#[command(version)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "50051")]
    port: u16,

    /// Address to bind to
    #[arg(short, long, default_value = "127.0.0.1")]
    bind: IpAddr,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Entries kept per entity by the in-memory history store
    #[arg(long, default_value = "10000")]
    history_limit: usize,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let level = if args.verbose { "debug" } else { "info" };
    // RUST_LOG wins over --verbose when set.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("geowatch server v{}", env!("CARGO_PKG_VERSION"));

    let cfg = match &args.config {
        Some(path) => {
            info!("loading config from {}", path.display());
            GeowatchConfig::from_json_file(path)?
        }
        None => GeowatchConfig::default(),
    };

    let history = Arc::new(InMemoryHistoryStore::with_limit(args.history_limit));
    let engine = Arc::new(GeowatchEngine::new(cfg, history)?);
    let svc = GeowatchService::new(engine).into_server();

    let addr = SocketAddr::new(args.bind, args.port);
    info!("starting gRPC server on {addr}");
    info!("press Ctrl+C to stop");

    Server::builder()
        .add_service(svc)
        .serve_with_shutdown(addr, async {
            let _ = signal::ctrl_c().await;
        })
        .await?;

    info!("shut down");
    Ok(())
}
