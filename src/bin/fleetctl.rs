//! FleetCtl - Command line tool for ExamFleet clusters
//!
//! Usage:
//!   fleetctl nodes            - Show the cluster as one node sees it
//!   fleetctl status           - Show clock and election state of a node
//!   fleetctl backends         - Show the balancer's backend table
//!   fleetctl configure FILE   - Push an exam definition to every backend
//!   fleetctl results          - Show finished exams across the fleet

use std::path::{Path, PathBuf};
use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Deserialize;

/// ExamFleet Cluster Control Tool
#[derive(Parser)]
#[command(name = "fleetctl")]
#[command(about = "Control and monitor ExamFleet clusters", long_about = None)]
struct Cli {
    /// Node HTTP API
    #[arg(long, default_value = "http://127.0.0.1:6001")]
    node: String,

    /// Balancer HTTP API
    #[arg(long, default_value = "http://127.0.0.1:5555")]
    balancer: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List nodes known to the target node
    Nodes,
    /// Show clock and election state of the target node
    Status,
    /// List balancer backends
    Backends,
    /// Push an exam definition (JSON) through the balancer
    Configure {
        /// Exam JSON: {title, questions, duration, capacity}
        file: PathBuf,
    },
    /// Show results aggregated by the balancer
    Results,
}

// ============ API Response Types ============

#[derive(Debug, Deserialize)]
struct NodeStatusResponse {
    node_id: String,
    clock: ClockView,
    election: ElectionView,
    nodes: Vec<NodeView>,
}

#[derive(Debug, Deserialize)]
struct ClockView {
    role: String,
    offset: f64,
    last_sync: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ElectionView {
    state: String,
    priority: i64,
    leader: Option<NodeView>,
}

#[derive(Debug, Deserialize)]
struct NodeView {
    id: String,
    address: String,
    priority: i64,
    status: String,
    #[serde(default)]
    active_load: u64,
}

#[derive(Debug, Deserialize)]
struct BalancerStatus {
    backends: Vec<BackendView>,
    healthy_backends: usize,
    sticky_sessions: usize,
    leader_hint: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BackendView {
    id: String,
    url: String,
    healthy: bool,
    active_sessions: usize,
    capacity: usize,
}

#[derive(Debug, Deserialize)]
struct ResultsView {
    results: Vec<ResultView>,
}

#[derive(Debug, Deserialize)]
struct ResultView {
    username: String,
    score: usize,
    total: usize,
    ended_reason: String,
    #[serde(default)]
    server_id: Option<String>,
}

// ============ Main ============

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let result = match &cli.command {
        Commands::Nodes => list_nodes(&client, &cli.node).await,
        Commands::Status => show_status(&client, &cli.node).await,
        Commands::Backends => list_backends(&client, &cli.balancer).await,
        Commands::Configure { file } => configure(&client, &cli.balancer, file).await,
        Commands::Results => show_results(&client, &cli.balancer).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn get<T: serde::de::DeserializeOwned>(client: &reqwest::Client, url: &str) -> anyhow::Result<T> {
    let response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("failed to reach {}", url))?;

    if !response.status().is_success() {
        bail!("API error from {}: {}", url, response.status());
    }

    Ok(response.json().await?)
}

// ============ Commands ============

async fn list_nodes(client: &reqwest::Client, endpoint: &str) -> anyhow::Result<()> {
    let status: NodeStatusResponse = get(client, &format!("{}/status", endpoint)).await?;
    let leader = status.election.leader.as_ref().map(|l| l.id.as_str());

    println!();
    println!("ExamFleet Cluster (as seen by {})", status.node_id);
    println!("Leader: {}", leader.unwrap_or("NONE"));
    println!();
    println!("{:<12} {:<24} {:<9} {:<10} {:<6}", "NODE ID", "ADDRESS", "PRIORITY", "STATUS", "LOAD");
    println!("{}", "-".repeat(65));

    for node in &status.nodes {
        let marker = if Some(node.id.as_str()) == leader { " *" } else { "" };
        println!(
            "{:<12} {:<24} {:<9} {:<10} {:<6}{}",
            node.id, node.address, node.priority, node.status, node.active_load, marker
        );
    }
    println!();

    Ok(())
}

async fn show_status(client: &reqwest::Client, endpoint: &str) -> anyhow::Result<()> {
    let status: NodeStatusResponse = get(client, &format!("{}/status", endpoint)).await?;

    println!("Node:          {}", status.node_id);
    println!("Priority:      {}", status.election.priority);
    println!("Election:      {}", status.election.state);
    println!(
        "Leader:        {}",
        status.election.leader.map(|l| l.id).unwrap_or_else(|| "NONE".into())
    );
    println!("Clock role:    {}", status.clock.role);
    println!("Clock offset:  {:+.6}s", status.clock.offset);
    match status.clock.last_sync {
        Some(at) => println!("Last sync:     {:.3}", at),
        None => println!("Last sync:     never"),
    }

    Ok(())
}

async fn list_backends(client: &reqwest::Client, endpoint: &str) -> anyhow::Result<()> {
    let status: BalancerStatus = get(client, &format!("{}/lb/status", endpoint)).await?;

    println!();
    println!(
        "Healthy: {}/{}  |  Sticky sessions: {}  |  Coordinator: {}",
        status.healthy_backends,
        status.backends.len(),
        status.sticky_sessions,
        status.leader_hint.as_deref().unwrap_or("unknown")
    );
    println!();
    println!("{:<8} {:<28} {:<10} {:<10}", "ID", "URL", "HEALTH", "SESSIONS");
    println!("{}", "-".repeat(60));

    for backend in &status.backends {
        let health = if backend.healthy {
            format!("\x1b[32m{:<10}\x1b[0m", "HEALTHY")
        } else {
            format!("\x1b[31m{:<10}\x1b[0m", "UNHEALTHY")
        };
        println!(
            "{:<8} {:<28} {} {}/{}",
            backend.id, backend.url, health, backend.active_sessions, backend.capacity
        );
    }
    println!();

    Ok(())
}

async fn configure(client: &reqwest::Client, endpoint: &str, file: &Path) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let exam: serde_json::Value =
        serde_json::from_str(&content).with_context(|| format!("{} is not valid JSON", file.display()))?;

    let url = format!("{}/configure_exam_all", endpoint);
    let response = client
        .post(&url)
        .json(&exam)
        .send()
        .await
        .with_context(|| format!("failed to reach {}", url))?;

    let status = response.status();
    let body: serde_json::Value = response.json().await?;
    if !status.is_success() {
        bail!("configuration rejected ({}): {}", status, body);
    }

    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

async fn show_results(client: &reqwest::Client, endpoint: &str) -> anyhow::Result<()> {
    let view: ResultsView = get(client, &format!("{}/results", endpoint)).await?;

    if view.results.is_empty() {
        println!("No finished exams");
        return Ok(());
    }

    println!("{:<20} {:<8} {:<10} {:<8}", "STUDENT", "SCORE", "ENDED", "SERVER");
    println!("{}", "-".repeat(50));
    for r in &view.results {
        println!(
            "{:<20} {:<8} {:<10} {:<8}",
            r.username,
            format!("{}/{}", r.score, r.total),
            r.ended_reason,
            r.server_id.as_deref().unwrap_or("-")
        );
    }

    Ok(())
}
