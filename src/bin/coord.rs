//! Coordinator binary

use clap::{Parser, Subcommand};
use fleetmgr::{Coordinator, CoordinatorConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "fleetmgr-coord")]
#[command(about = "fleetmgr coordinator for stateful entity host fleets")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the coordinator
    Serve {
        /// Config file (TOML); CLI flags take priority
        #[arg(long)]
        config: Option<PathBuf>,

        /// Bind address for the HTTP RPC/admin API
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Peer coordinator for the compute fleet
        #[arg(long)]
        peer: Option<SocketAddr>,

        /// Persistence service address
        #[arg(long)]
        db: Option<SocketAddr>,

        /// Client gateway address
        #[arg(long)]
        gateway: Option<SocketAddr>,

        /// Overload level override
        #[arg(long)]
        overload_level: Option<f32>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            bind,
            peer,
            db,
            gateway,
            overload_level,
        } => {
            let mut cfg = match &config {
                Some(path) => CoordinatorConfig::load(Some(path.as_path()))?,
                None => CoordinatorConfig::load(None).unwrap_or_default(),
            };

            // CLI has priority over file and environment.
            if let Some(bind) = bind {
                cfg.bind_addr = bind;
            }
            if peer.is_some() {
                cfg.peer_addr = peer;
            }
            if db.is_some() {
                cfg.db_addr = db;
            }
            if gateway.is_some() {
                cfg.gateway_addr = gateway;
            }
            if let Some(level) = overload_level {
                cfg.overload_level = level;
            }

            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| cfg.log_level.clone().into()),
                )
                .with(tracing_subscriber::fmt::layer())
                .init();

            Coordinator::serve(cfg).await?;
        }
    }

    Ok(())
}
