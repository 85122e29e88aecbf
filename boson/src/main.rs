//! Boson network node daemon.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use boson::config::{load_config, Overrides};
use lib_dht::Node;

#[derive(Debug, Parser)]
#[command(name = "boson", about = "Boson Kademlia DHT node", version)]
struct Args {
    /// Configuration file (TOML).
    #[arg(short, long, default_value = "boson.toml")]
    config: PathBuf,

    /// IPv4 bind address override.
    #[arg(long)]
    host4: Option<String>,

    /// IPv6 bind address override.
    #[arg(long)]
    host6: Option<String>,

    /// UDP port override.
    #[arg(short, long)]
    port: Option<u16>,

    /// Data directory override.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Extra bootstrap node, `<id>@<host>:<port>`; repeatable.
    #[arg(long = "bootstrap")]
    bootstrap: Vec<String>,

    /// Accept non-global-unicast peers (local testing).
    #[arg(long)]
    developer_mode: bool,

    /// Periodically log engine metrics.
    #[arg(long)]
    metrics: bool,

    /// Log filter, e.g. `info` or `lib_dht=debug`.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    let config = load_config(&args.config)?;
    let config = Overrides {
        host4: args.host4,
        host6: args.host6,
        port: args.port,
        data_dir: args.data_dir,
        bootstrap: args.bootstrap,
        developer_mode: args.developer_mode,
        metrics: args.metrics,
    }
    .apply(config)?;

    let mut node = match Node::new(config) {
        Ok(node) => node,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };
    info!(id = %node.id(), "starting boson node");
    node.start().await?;
    for addr in node.addresses() {
        info!(%addr, "listening");
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    node.stop().await;
    Ok(())
}
