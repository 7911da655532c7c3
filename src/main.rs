//! ExamFleet - Distributed exam delivery
//!
//! Runs an exam node (clock sync, Bully election, exam API) or the
//! session-affine load balancer in front of a set of nodes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use examfleet::balancer::{self, Backend, HttpBackendClient, LoadBalancer};
use examfleet::config::{FleetConfig, LoggingConfig};
use examfleet::error::{Error, Result};
use examfleet::http;
use examfleet::node::NodeRuntime;
use examfleet::state::{NodeRecord, NodeRegistry};

/// ExamFleet - Distributed exam delivery cluster
#[derive(Parser)]
#[command(name = "examfleet")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "examfleet.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an exam node
    Node,

    /// Start the load balancer
    Balancer,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "examfleet.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "S1")]
        node_id: String,
    },

    /// Validate configuration file
    Validate,

    /// Query a running node's status
    Status {
        /// Node API address (host:port)
        #[arg(short, long, default_value = "127.0.0.1:6001")]
        address: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging settings come from the config when it parses
    let mut logging = FleetConfig::from_file(&cli.config)
        .map(|c| c.logging)
        .unwrap_or_default();
    if let Some(level) = &cli.log_level {
        logging.level = level.clone();
    }
    init_logging(&logging);

    match cli.command {
        Commands::Node => run_node(cli.config).await,
        Commands::Balancer => run_balancer(cli.config).await,
        Commands::Init { output, node_id } => run_init(output, node_id),
        Commands::Validate => run_validate(cli.config),
        Commands::Status { address } => run_status(address).await,
    }
}

/// Initialize logging
fn init_logging(logging: &LoggingConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| logging.level.as_str().into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn load_config(config_path: &Path) -> Result<FleetConfig> {
    match FleetConfig::from_file(config_path) {
        Ok(config) => Ok(config),
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            tracing::error!("Run `examfleet init` to create one");
            Err(e)
        }
    }
}

/// Start an exam node and run until Ctrl+C
async fn run_node(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    tracing::info!(
        "Starting node {} (priority {}, {} peers)",
        config.node.id,
        config.node.priority,
        config.cluster.peers.len()
    );

    let runtime = NodeRuntime::start(&config).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received Ctrl+C");
    runtime.shutdown().await;

    Ok(())
}

/// Start the load balancer and run until Ctrl+C
async fn run_balancer(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    let lb_config = config.balancer()?.clone();

    let backends: Vec<Backend> = lb_config.backends.iter().map(Backend::from).collect();
    tracing::info!("Starting load balancer with {} backends", backends.len());
    for b in &backends {
        tracing::info!("  {} -> {}", b.id, b.url);
    }

    // Backends age to dead after three missed health checks
    let registry = Arc::new(NodeRegistry::new(NodeRecord::new(
        config.node.id.as_str(),
        lb_config.bind_address.as_str(),
        config.node.priority,
    )));
    for b in &backends {
        registry.register(NodeRecord::new(b.id.as_str(), b.url.as_str(), 0)).await;
    }

    let client = Arc::new(HttpBackendClient::new(&lb_config)?);
    let lb = Arc::new(
        LoadBalancer::new(backends, client)
            .with_registry(registry, lb_config.health_check_interval() * 3),
    );

    let listener = tokio::net::TcpListener::bind(&lb_config.bind_address).await?;
    let (shutdown, shutdown_rx) = watch::channel(false);

    let checker = tokio::spawn(
        Arc::clone(&lb).run_health_checks(lb_config.health_check_interval(), shutdown_rx.clone()),
    );

    let app = http::with_layers(balancer::api::router(Arc::clone(&lb)), config.api.cors_enabled);
    let server = tokio::spawn(http::serve(listener, app, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received Ctrl+C, shutting down balancer");
    let _ = shutdown.send(true);

    if let Err(e) = checker.await {
        tracing::error!("Health checker task failed: {}", e);
    }
    match server.await {
        Ok(result) => result?,
        Err(e) => tracing::error!("HTTP task failed: {}", e),
    }

    Ok(())
}

/// Initialize configuration file
fn run_init(output: PathBuf, node_id: String) -> Result<()> {
    if output.exists() {
        return Err(Error::Config(format!("{} already exists", output.display())));
    }

    std::fs::write(&output, FleetConfig::sample(&node_id))?;
    println!("Configuration written to {:?}", output);
    println!("Edit [node], [[cluster.peers]] and [api] before starting the node.");
    Ok(())
}

/// Validate configuration file
fn run_validate(config_path: PathBuf) -> Result<()> {
    match FleetConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID:          {}", config.node.id);
            println!("  Priority:         {}", config.node.priority);
            println!("  Cluster address:  {}", config.advertise_address());
            println!("  API address:      {}", config.api.bind_address);
            println!("  Peers:            {}", config.cluster.peers.len());
            println!("  Election timeout: {:?}", config.election_timeout());
            println!("  Sync interval:    {:?}", config.sync_interval());
            if let Some(lb) = &config.balancer {
                println!("  Balancer:         {} ({} backends)", lb.bind_address, lb.backends.len());
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show a node's status
async fn run_status(address: String) -> Result<()> {
    let url = format!("http://{}/status", address);

    let response = reqwest::get(&url)
        .await
        .map_err(|e| Error::unreachable(&address, e))?;
    let status: serde_json::Value = response
        .json()
        .await
        .map_err(|e| Error::Protocol(e.to_string()))?;

    let pretty = serde_json::to_string_pretty(&status).map_err(|e| Error::Protocol(e.to_string()))?;
    println!("{}", pretty);
    Ok(())
}
