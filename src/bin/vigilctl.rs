//! VigilCtl - Command line tool for managing Vigil clusters
//!
//! Usage:
//!   vigilctl status            - Show node status
//!   vigilctl nodes             - List cluster nodes and their roles
//!   vigilctl add <addr>...     - Add nodes to the cluster
//!   vigilctl remove <addr>...  - Remove nodes from the cluster
//!   vigilctl idle              - Demote the node to the IDLE role
//!   vigilctl activate          - Activate a staged IDLE node
//!   vigilctl backup            - Run the configured backup command
//!
//! Membership changes must land on the leader. This tool owns the
//! discovery loop: a NotLeader response redirects the call to the reported
//! leader, and a Busy response (election in flight) is retried with a delay.

use std::time::Duration;
use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use serde::Deserialize;

/// Attempts before giving up on redirects/busy retries
const MAX_ATTEMPTS: u32 = 6;
/// Delay between retries after a Busy response
const BUSY_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Vigil Cluster Control Tool
#[derive(Parser)]
#[command(name = "vigilctl")]
#[command(about = "Control and monitor Vigil clusters", long_about = None)]
struct Cli {
    /// API endpoint to connect to
    #[arg(short, long, default_value = "localhost:8080")]
    endpoint: String,

    /// HTTP API port used when following a leader redirect
    #[arg(long, default_value_t = 8080)]
    api_port: u16,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show status of the node
    Status,
    /// List cluster nodes and their last-known roles
    Nodes,
    /// Show the external command execution history
    Commands,
    /// Add nodes to the cluster (leader-routed)
    Add {
        /// Cluster addresses to add (host:port)
        addresses: Vec<String>,
    },
    /// Remove nodes from the cluster (leader-routed)
    Remove {
        /// Cluster addresses to remove (host:port)
        addresses: Vec<String>,
    },
    /// Demote the node to the administrative IDLE role
    Idle,
    /// Activate a staged IDLE node into FOLLOWER
    Activate,
    /// Run the configured backup command on the node
    Backup,
}

// ============ API Response Types ============

#[derive(Debug, Deserialize)]
struct StatusResponse {
    node: String,
    role: String,
    term: u64,
    leader: Option<String>,
    config_version: u64,
    degraded: bool,
    replication_inconsistent: bool,
    #[serde(default)]
    peers: Vec<PeerResponse>,
}

#[derive(Debug, Deserialize)]
struct PeerResponse {
    address: String,
    role: String,
    voting: bool,
    suspected: bool,
    last_contact_ms: Option<u64>,
    joined_at: String,
}

#[derive(Debug, Deserialize)]
struct NodeResponse {
    address: String,
    role: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
    #[serde(default)]
    leader: Option<String>,
    #[serde(default)]
    message: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("Failed to create HTTP client")?;

    match cli.command {
        Commands::Status => show_status(&client, &cli.endpoint).await,
        Commands::Nodes => show_nodes(&client, &cli.endpoint).await,
        Commands::Commands => show_commands(&client, &cli.endpoint).await,
        Commands::Add { addresses } => {
            if addresses.is_empty() {
                bail!("add requires at least one address");
            }
            membership_change(&client, &cli.endpoint, cli.api_port, "/cluster/add", &addresses)
                .await
        }
        Commands::Remove { addresses } => {
            if addresses.is_empty() {
                bail!("remove requires at least one address");
            }
            membership_change(
                &client,
                &cli.endpoint,
                cli.api_port,
                "/cluster/remove",
                &addresses,
            )
            .await
        }
        Commands::Idle => simple_post(&client, &cli.endpoint, "/admin/idle").await,
        Commands::Activate => simple_post(&client, &cli.endpoint, "/admin/activate").await,
        Commands::Backup => simple_post(&client, &cli.endpoint, "/admin/backup").await,
    }
}

async fn show_status(client: &reqwest::Client, endpoint: &str) -> anyhow::Result<()> {
    let status: StatusResponse = client
        .get(format!("http://{}/status", endpoint))
        .send()
        .await
        .with_context(|| format!("Failed to reach {}", endpoint))?
        .json()
        .await
        .context("Malformed status response")?;

    println!("Node:       {}", status.node);
    println!("Role:       {}", status.role);
    println!("Term:       {}", status.term);
    println!(
        "Leader:     {}",
        status.leader.as_deref().unwrap_or("(unknown)")
    );
    println!("Config:     v{}", status.config_version);
    println!("Degraded:   {}", status.degraded);
    println!("Repl OK:    {}", !status.replication_inconsistent);

    if !status.peers.is_empty() {
        println!();
        println!(
            "{:<24} {:<10} {:>7} {:>10} {:>14} {:<25}",
            "PEER", "ROLE", "VOTING", "SUSPECTED", "LAST CONTACT", "JOINED"
        );
        for peer in status.peers {
            let contact = peer
                .last_contact_ms
                .map(|ms| format!("{}ms ago", ms))
                .unwrap_or_else(|| "never".to_string());
            println!(
                "{:<24} {:<10} {:>7} {:>10} {:>14} {:<25}",
                peer.address, peer.role, peer.voting, peer.suspected, contact, peer.joined_at
            );
        }
    }

    Ok(())
}

async fn show_nodes(client: &reqwest::Client, endpoint: &str) -> anyhow::Result<()> {
    let nodes: Vec<NodeResponse> = client
        .get(format!("http://{}/nodes", endpoint))
        .send()
        .await
        .with_context(|| format!("Failed to reach {}", endpoint))?
        .json()
        .await
        .context("Malformed nodes response")?;

    println!("{:<24} {:<10}", "ADDRESS", "ROLE");
    for node in nodes {
        println!("{:<24} {:<10}", node.address, node.role);
    }
    Ok(())
}

async fn show_commands(client: &reqwest::Client, endpoint: &str) -> anyhow::Result<()> {
    let records: serde_json::Value = client
        .get(format!("http://{}/commands", endpoint))
        .send()
        .await
        .with_context(|| format!("Failed to reach {}", endpoint))?
        .json()
        .await
        .context("Malformed commands response")?;

    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}

async fn simple_post(
    client: &reqwest::Client,
    endpoint: &str,
    path: &str,
) -> anyhow::Result<()> {
    let response = client
        .post(format!("http://{}{}", endpoint, path))
        .send()
        .await
        .with_context(|| format!("Failed to reach {}", endpoint))?;

    let status = response.status();
    let body: serde_json::Value = response.json().await.unwrap_or_default();
    if status.is_success() {
        println!("{}", serde_json::to_string_pretty(&body)?);
        Ok(())
    } else {
        bail!("{} failed ({}): {}", path, status, body)
    }
}

/// Leader-discovery loop for membership changes: follow NotLeader redirects,
/// retry Busy responses after a delay.
async fn membership_change(
    client: &reqwest::Client,
    endpoint: &str,
    api_port: u16,
    path: &str,
    addresses: &[String],
) -> anyhow::Result<()> {
    let body = serde_json::json!({ "addresses": addresses });
    let mut target = endpoint.to_string();

    for attempt in 1..=MAX_ATTEMPTS {
        let response = client
            .post(format!("http://{}{}", target, path))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", target))?;

        let status = response.status();
        if status.is_success() {
            let result: serde_json::Value = response.json().await.unwrap_or_default();
            println!(
                "OK: configuration version {}",
                result.get("version").and_then(|v| v.as_u64()).unwrap_or(0)
            );
            return Ok(());
        }

        let error: ErrorResponse = response
            .json()
            .await
            .unwrap_or_else(|_| ErrorResponse {
                error: "unknown".into(),
                leader: None,
                message: String::new(),
            });

        match error.error.as_str() {
            "not_leader" => {
                let leader = error
                    .leader
                    .ok_or_else(|| anyhow!("Not leader and no leader known; retry later"))?;
                target = api_endpoint_for(&leader, api_port)?;
                eprintln!("Redirected to leader at {} (attempt {})", target, attempt);
            }
            "busy" => {
                eprintln!(
                    "Election in flight, retrying in {:?} (attempt {})",
                    BUSY_RETRY_DELAY, attempt
                );
                tokio::time::sleep(BUSY_RETRY_DELAY).await;
            }
            _ => bail!("{} failed ({}): {}", path, status, error.message),
        }
    }

    bail!("Gave up after {} attempts", MAX_ATTEMPTS)
}

/// Map a cluster address (host:cluster_port) to its HTTP API endpoint
fn api_endpoint_for(cluster_address: &str, api_port: u16) -> anyhow::Result<String> {
    let host = cluster_address
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(cluster_address);
    if host.is_empty() {
        bail!("Malformed leader address: {}", cluster_address);
    }
    Ok(format!("{}:{}", host, api_port))
}
