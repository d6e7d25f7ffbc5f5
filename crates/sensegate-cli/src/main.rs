//! Command-line interface for the SenseGate bridge.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sensegate_gateway::{DiscoveryService, Gateway, GatewayEvent, NodeIdCache};
use sensegate_protocol::SensorMessage;
use serde::Deserialize;

/// SenseGate - bridge a line-protocol sensor gateway into the host.
#[derive(Parser, Debug)]
#[command(name = "sensegate")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run the bridge until interrupted.
    Run {
        /// Path to the JSON configuration file.
        #[arg(short, long, default_value = "sensegate.json")]
        config: PathBuf,
    },
    /// Inspect or edit the node-id cache.
    Cache {
        /// Path to the cache file.
        #[arg(long, default_value = "sensegate-cache.redb")]
        path: PathBuf,
        #[command(subcommand)]
        cache_cmd: CacheCommand,
    },
    /// Parse one wire line and print it as JSON.
    Parse {
        /// The raw line, e.g. "5;0;1;0;0;21.5".
        line: String,
    },
}

/// Cache subcommands.
#[derive(Subcommand, Debug)]
enum CacheCommand {
    /// List reserved node ids.
    List,
    /// Drop one reservation.
    Remove {
        /// The node id to remove.
        node_id: u8,
    },
    /// Drop all reservations.
    Clear,
}

/// On-disk configuration: the gateway settings plus where the cache lives.
#[derive(Debug, Deserialize)]
struct AppConfig {
    #[serde(flatten)]
    gateway: sensegate_gateway::GatewayConfig,
    #[serde(default = "default_cache_path")]
    cache_path: PathBuf,
}

fn default_cache_path() -> PathBuf {
    PathBuf::from("sensegate-cache.redb")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    match args.command {
        Command::Run { config } => run_bridge(config).await,
        Command::Cache { path, cache_cmd } => run_cache_cmd(path, cache_cmd),
        Command::Parse { line } => parse_line(&line),
    }
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose {
        "sensegate=debug,info"
    } else {
        "sensegate=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

async fn run_bridge(config_path: PathBuf) -> Result<()> {
    let raw = std::fs::read_to_string(&config_path)
        .with_context(|| format!("reading config {}", config_path.display()))?;
    let config: AppConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parsing config {}", config_path.display()))?;

    let cache = NodeIdCache::open(&config.cache_path)
        .with_context(|| format!("opening cache {}", config.cache_path.display()))?;
    let gateway = Gateway::new(config.gateway, cache)?;

    let mut discovery = DiscoveryService::start(gateway.events());
    let mut announcements = discovery.announcements();
    tokio::spawn(async move {
        while let Ok(sensor) = announcements.recv().await {
            tracing::info!(
                node_id = sensor.node_id,
                child_id = ?sensor.child_id,
                thing_type = ?sensor.thing_type,
                description = %sensor.description,
                "new sensor"
            );
        }
    });

    let mut events = gateway.subscribe();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                GatewayEvent::ConnectionStatusChanged(status) => {
                    tracing::info!(?status, "bridge status");
                }
                GatewayEvent::VariableChanged {
                    node_id,
                    child_id,
                    variable,
                    value,
                    handler,
                } => {
                    tracing::debug!(node_id, child_id, ?variable, %value, ?handler, "variable changed");
                }
                _ => {}
            }
        }
    });

    gateway.startup().await?;
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;

    tracing::info!("shutting down");
    gateway.shutdown().await;
    discovery.stop().await;
    Ok(())
}

fn run_cache_cmd(path: PathBuf, command: CacheCommand) -> Result<()> {
    let cache =
        NodeIdCache::open(&path).with_context(|| format!("opening cache {}", path.display()))?;
    match command {
        CacheCommand::List => {
            let nodes = cache.load()?;
            if nodes.is_empty() {
                println!("no reserved node ids");
            }
            for node in nodes {
                let last_connected = node
                    .last_connected
                    .map(format_epoch)
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "{:>3}  reserved {}  last connected {}",
                    node.node_id,
                    format_epoch(node.reserved_at),
                    last_connected
                );
            }
        }
        CacheCommand::Remove { node_id } => {
            cache.remove(node_id)?;
            println!("removed node id {node_id}");
        }
        CacheCommand::Clear => {
            cache.clear()?;
            println!("cache cleared");
        }
    }
    Ok(())
}

fn parse_line(line: &str) -> Result<()> {
    let message = SensorMessage::parse(line).context("malformed line")?;
    println!("{}", serde_json::to_string_pretty(&message)?);
    Ok(())
}

fn format_epoch(secs: i64) -> String {
    match chrono::DateTime::from_timestamp(secs, 0) {
        Some(ts) => ts.to_rfc3339(),
        None => format!("@{secs}"),
    }
}
