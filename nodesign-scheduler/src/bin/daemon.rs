//! Reference scheduler daemon binary.
//!
//! Serves registration, recovery and scheduling requests over mutual TLS,
//! using the development certificates written by `nodesign dev-certs`.

use clap::Parser;
use nodesign_scheduler::{DevCerts, SchedulerServer, ServerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Reference scheduler for nodesign clients.
#[derive(Parser, Debug)]
#[command(name = "nodesign-scheduler-daemon")]
#[command(about = "Reference scheduler serving nodesign clients")]
#[command(version)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "NODESIGN_LISTEN", default_value = "127.0.0.1:2601")]
    listen: String,

    /// Directory written by `nodesign dev-certs`
    #[arg(long, env = "NODESIGN_CERTS_DIR")]
    certs_dir: PathBuf,

    /// Path to the node registry file
    #[arg(long, default_value = "/var/lib/nodesign/registry.json")]
    state_file: PathBuf,

    /// Host nodes are scheduled onto (repeatable)
    #[arg(long = "node-host", default_value = "localhost:9736")]
    node_hosts: Vec<String>,

    /// Maximum number of scheduled nodes
    #[arg(long)]
    max_nodes: Option<usize>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    info!("Starting nodesign-scheduler-daemon");
    info!("Listen address: {}", args.listen);
    info!("Certificates: {:?}", args.certs_dir);
    info!("State file: {:?}", args.state_file);

    let certs = match DevCerts::load(&args.certs_dir) {
        Ok(certs) => certs,
        Err(e) => {
            error!("Failed to load certificates from {:?}: {}", args.certs_dir, e);
            std::process::exit(1);
        }
    };

    let mut config = ServerConfig::new(args.listen, certs.server, certs.ca, args.state_file);
    config.node_hosts = args.node_hosts;
    config.max_nodes = args.max_nodes;

    let server = match SchedulerServer::bind(config) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!("Failed to create server: {}", e);
            std::process::exit(1);
        }
    };

    info!("Scheduler ready, waiting for connections...");

    if let Err(e) = server.run() {
        error!("Server error: {}", e);
        std::process::exit(1);
    }
}
