//! localnet CLI: run a node on the local network.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use localnet_daemon::setup::{default_config_path, load_config, write_config};
use localnet_daemon::{Config, Orchestrator};
use localnet_discovery::{BroadcastTransport, ElectionEngine, StaticConnectivity, UdpBroadcast};
use localnet_types::Envelope;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "localnet",
    about = "Discover peers, elect a host and share a session on the LAN",
    version,
    propagate_version = true
)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the network: elect a host, then host or connect to it.
    Start {
        /// Use this IPv4 address instead of detecting one.
        #[arg(short, long)]
        address: Option<Ipv4Addr>,
    },

    /// Run discovery only and print every host change.
    Elect {
        /// Use this IPv4 address instead of detecting one.
        #[arg(short, long)]
        address: Option<Ipv4Addr>,
    },

    /// Print the effective configuration as TOML.
    PrintConfig,

    /// Write the default configuration to the config path.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref()).context("loading configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.daemon.log_level)),
        )
        .init();

    match cli.command {
        Commands::Start { address } => run_node(config, transport(address)).await,
        Commands::Elect { address } => run_election(&config, transport(address)).await,
        Commands::PrintConfig => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::InitConfig { force } => {
            let path = cli.config.map_or_else(default_config_path, PathBuf::from);
            if path.exists() && !force {
                anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
            }
            write_config(&path, &Config::default())?;
            println!("wrote {}", path.display());
            Ok(())
        }
    }
}

fn transport(address: Option<Ipv4Addr>) -> Arc<dyn BroadcastTransport> {
    match address {
        Some(address) => Arc::new(UdpBroadcast::with_address(address)),
        None => Arc::new(UdpBroadcast::new()),
    }
}

async fn run_node(config: Config, transport: Arc<dyn BroadcastTransport>) -> anyhow::Result<()> {
    let orchestrator = Orchestrator::new(config, transport, Arc::new(StaticConnectivity::new()));
    let identity = orchestrator
        .identity()
        .await
        .context("no usable local network address")?;
    tracing::info!(address = %identity.address, id = %identity.id, "starting localnet node");

    let mut status = orchestrator.status();
    let mut server = orchestrator.server_messages();
    let mut client = orchestrator.client_messages();
    orchestrator.start();

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("waiting for ctrl-c")?;
                break;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let now = status.borrow_and_update().clone();
                tracing::info!(
                    role = %now.role,
                    host = now.host.as_deref().unwrap_or("-"),
                    sessions = now.session_count,
                    wifi = now.wifi_connected,
                    loading = now.loading,
                    "status changed"
                );
            }
            event = server.recv() => log_envelope("server", event),
            event = client.recv() => log_envelope("client", event),
        }
    }

    tracing::info!("shutting down");
    orchestrator.shutdown().await;
    Ok(())
}

fn log_envelope(side: &str, event: Result<Envelope, RecvError>) {
    match event {
        Ok(envelope) => tracing::info!(side, tag = envelope.tag(), envelope = ?envelope, "envelope"),
        Err(RecvError::Lagged(skipped)) => tracing::warn!(side, skipped, "envelopes lagged"),
        Err(RecvError::Closed) => {}
    }
}

async fn run_election(config: &Config, transport: Arc<dyn BroadcastTransport>) -> anyhow::Result<()> {
    let engine = ElectionEngine::new(transport, config.election_config());
    let mut hosts = engine.host_receiver();
    engine.start();
    tracing::info!(port = config.network.discovery_port, "listening for heartbeats");

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("waiting for ctrl-c")?;
                break;
            }
            changed = hosts.changed() => {
                if changed.is_err() {
                    break;
                }
                let host = hosts.borrow_and_update().clone();
                if host.is_empty() {
                    println!("host: (none)");
                } else {
                    println!("host: {host}");
                }
                for candidate in engine.candidates() {
                    println!(
                        "  {} rank={} host={} session={}",
                        candidate.address, candidate.rank, candidate.is_host, candidate.has_active_session
                    );
                }
            }
        }
    }

    engine.stop();
    Ok(())
}
