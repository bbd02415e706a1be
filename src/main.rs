//! WolfMesh - Peer-to-Peer Transaction Log Replication
//!
//! Command line entry point for a replication node.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use wolfmesh::commit::TraceApplier;
use wolfmesh::config::WolfMeshConfig;
use wolfmesh::error::Result;
use wolfmesh::events::EventBus;
use wolfmesh::node::Node;
use wolfmesh::router::{compute_routes, spanning_forest, Topology};
use wolfmesh::trlog::TrLogs;

/// WolfMesh - Peer-to-Peer Transaction Log Replication
#[derive(Parser)]
#[command(name = "wolfmesh")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfmesh.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the replication node
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfmesh.toml")]
        output: PathBuf,

        /// Node ID (random if omitted)
        #[arg(long)]
        node_id: Option<Uuid>,
    },

    /// Validate configuration file
    Validate,

    /// Show node information and local transaction logs
    Info,

    /// Print the routes of a node for a topology snapshot
    Routes {
        /// Topology snapshot (JSON)
        #[arg(short, long)]
        topology: PathBuf,

        /// Node to compute routes for
        #[arg(short, long)]
        node: Uuid,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => {
            let config = load_config(&cli.config, cli.log_level.as_deref())?;
            run_start(config)
        }
        Commands::Init { output, node_id } => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"), "compact");
            run_init(output, node_id)
        }
        Commands::Validate => run_validate(cli.config),
        Commands::Info => {
            let config = load_config(&cli.config, cli.log_level.as_deref())?;
            run_info(config)
        }
        Commands::Routes { topology, node } => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"), "compact");
            run_routes(topology, node)
        }
    }
}

/// Load the configuration and initialize logging from it
fn load_config(path: &Path, level: Option<&str>) -> Result<WolfMeshConfig> {
    match WolfMeshConfig::from_file(path) {
        Ok(config) => {
            init_logging(level.unwrap_or(config.logging.level.as_str()), &config.logging.format);
            Ok(config)
        }
        Err(e) => {
            init_logging(level.unwrap_or("info"), "compact");
            tracing::error!("Failed to load configuration from {:?}: {}", path, e);
            Err(e)
        }
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        "compact" => registry
            .with(tracing_subscriber::fmt::layer().compact())
            .init(),
        _ => registry
            .with(tracing_subscriber::fmt::layer().pretty())
            .init(),
    }
}

/// Start the node and run until Ctrl+C
fn run_start(config: WolfMeshConfig) -> Result<()> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if config.runtime.worker_threads > 0 {
        builder.worker_threads(config.runtime.worker_threads);
    }
    let runtime = builder
        .max_blocking_threads(config.runtime.blocking_threads)
        .thread_name("wolfmesh")
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        tracing::info!("Starting WolfMesh node {}...", config.node.id);

        let topology = match &config.cluster.topology {
            Some(path) => match Topology::from_file(path) {
                Ok(topology) => Some(topology),
                Err(e) => {
                    tracing::error!("Failed to load topology from {:?}: {}", path, e);
                    return Err(e);
                }
            },
            None => None,
        };

        let node = match Node::open(config, Arc::new(TraceApplier)) {
            Ok(node) => node,
            Err(e) => {
                tracing::error!("Failed to open node: {}", e);
                return Err(e);
            }
        };

        if let Some(topology) = topology {
            tracing::info!(
                "Publishing static topology: {} nodes, {} links",
                topology.nodes.len(),
                topology.links.len()
            );
            node.publish_topology(topology)?;
        }

        tracing::info!("WolfMesh node {} running, press Ctrl+C to stop", node.id());
        tokio::signal::ctrl_c().await?;
        tracing::info!("Received shutdown signal");

        if !node.shutdown().await {
            tracing::warn!("Shutdown timed out, some transfers were abandoned");
        }
        tracing::info!("WolfMesh shutdown complete");
        Ok(())
    })
}

/// Write a default configuration file
fn run_init(output: PathBuf, node_id: Option<Uuid>) -> Result<()> {
    let node_id = node_id.unwrap_or_else(Uuid::new_v4);
    let config = WolfMeshConfig::new(node_id, PathBuf::from("/var/lib/wolfmesh"));

    let content = format!(
        "# WolfMesh Configuration\n# Generated configuration file\n\n{}",
        config.to_toml()?
    );
    std::fs::write(&output, content)?;

    println!("Configuration file created: {}", output.display());
    println!("  Node ID: {}", node_id);
    println!("\nSet [cluster] topology to a topology snapshot to enable replication.");
    println!("Then start with: wolfmesh --config {} start", output.display());

    Ok(())
}

/// Validate the configuration file
fn run_validate(config_path: PathBuf) -> Result<()> {
    match WolfMeshConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            println!("  Data Directory: {}", config.data_dir().display());
            println!("  Batch Size: {}", config.sync.batch_size);
            match &config.cluster.topology {
                Some(path) => match Topology::from_file(path) {
                    Ok(topology) => println!(
                        "  Topology: {} ({} nodes, {} links)",
                        path.display(),
                        topology.nodes.len(),
                        topology.links.len()
                    ),
                    Err(e) => {
                        eprintln!("✗ Topology error: {}", e);
                        return Err(e);
                    }
                },
                None => println!("  Topology: (none)"),
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Print node configuration and the state of every local log
fn run_info(config: WolfMeshConfig) -> Result<()> {
    let trlogs = TrLogs::open(config.trlog_dir(), Arc::new(EventBus::new()))?;

    println!("WolfMesh Node Information");
    println!("=========================");
    println!();
    println!("Node ID:          {}", config.node.id);
    println!("Data Directory:   {}", config.data_dir().display());
    println!();
    println!("Sync Configuration:");
    println!("  Batch Size:     {}", config.sync.batch_size);
    println!("  Apply Batch:    {}", config.sync.apply_batch_size);
    println!("  Shutdown Wait:  {} ms", config.sync.shutdown_timeout_ms);
    println!();
    println!("Transaction Logs:");

    let ids = trlogs.ids();
    if ids.is_empty() {
        println!("  (none)");
    }
    for id in ids {
        if let Some(log) = trlogs.get(&id) {
            println!(
                "  {}  top={:<10} applied={:<10} entries={}",
                id,
                log.top(),
                log.applied(),
                log.count()?
            );
        }
    }

    Ok(())
}

/// Print the route set of `node`
fn run_routes(topology_path: PathBuf, node: Uuid) -> Result<()> {
    let topology = Topology::from_file(&topology_path)?;
    let routes = compute_routes(&topology, &node)?;
    let tree = spanning_forest(&topology);

    println!(
        "Topology: {} nodes, {} links, {} tree links",
        topology.nodes.len(),
        topology.links.len(),
        tree.len()
    );

    match topology.node(&node) {
        Some(n) => println!("Routes of {} ({}):", node, n.addr),
        None => println!("Node {} is not part of the topology", node),
    }
    for peer in &routes {
        let addr = topology.node(peer).map(|n| n.addr.as_str()).unwrap_or("?");
        println!("  {}  {}", peer, addr);
    }

    Ok(())
}
