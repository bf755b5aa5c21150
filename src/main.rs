//! Vigil - Automated MySQL Failover Manager
//!
//! Daemon entry point: configuration loading, logging setup, and the
//! lifecycle of a single cluster node.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vigil::config::VigilConfig;
use vigil::executor::MySqlAdmin;
use vigil::node::Node;
use vigil::replication::ShellRunner;
use vigil::error::{Error, Result};

/// Vigil - Automated MySQL Failover Manager
#[derive(Parser)]
#[command(name = "vigil")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "vigil.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the Vigil node
    Start {
        /// Force the administrative IDLE role at startup (staged node)
        #[arg(long)]
        idle: bool,
    },

    /// Check node status over the HTTP API
    Status {
        /// Node address to query
        #[arg(short, long, default_value = "localhost:8080")]
        address: String,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "vigil.toml")]
        output: PathBuf,

        /// This node's cluster address
        #[arg(long, default_value = "0.0.0.0:7650")]
        bind_address: String,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level);

    match cli.command {
        Commands::Start { idle } => run_start(cli.config, idle).await,
        Commands::Status { address } => run_status(address).await,
        Commands::Init {
            output,
            bind_address,
        } => run_init(output, bind_address),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Start the Vigil node
async fn run_start(config_path: PathBuf, idle: bool) -> Result<()> {
    tracing::info!("Starting Vigil node...");

    let mut config = match VigilConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            tracing::error!("Please check that the config file exists and is valid TOML");
            return Err(e);
        }
    };
    if idle {
        config.node.start_as_idle = true;
    }
    tracing::info!("Loaded configuration for node: {}", config.advertise_address());

    if let Err(e) = std::fs::create_dir_all(config.data_dir()) {
        tracing::error!("Failed to create data directory {:?}: {}", config.data_dir(), e);
        return Err(e.into());
    }

    tracing::info!(
        "Connecting to MySQL at {}:{}...",
        config.database.host,
        config.database.port
    );
    let executor = match MySqlAdmin::connect(&config.database).await {
        Ok(e) => Arc::new(e),
        Err(e) => {
            tracing::error!("Failed to connect to MySQL: {}", e);
            tracing::error!("  Host: {}:{}", config.database.host, config.database.port);
            tracing::error!("  User: {}", config.database.user);
            tracing::error!("Please check that MySQL is running and credentials are correct");
            return Err(e);
        }
    };
    match executor.ping().await {
        Ok(()) => tracing::info!("Database connection established"),
        Err(e) => {
            tracing::warn!("Database ping failed, starting degraded: {}", e);
        }
    }

    let node = Arc::new(Node::new(config, executor, Arc::new(ShellRunner))?);

    let runner = Arc::clone(&node);
    let mut handle = tokio::spawn(async move { runner.run().await });

    tokio::select! {
        result = &mut handle => {
            result.map_err(|e| Error::Internal(format!("Node task failed: {}", e)))??;
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
            node.shutdown();
        }
    }

    handle
        .await
        .map_err(|e| Error::Internal(format!("Node task failed: {}", e)))??;

    tracing::info!("Vigil shutdown complete");
    Ok(())
}

/// Check node status
async fn run_status(address: String) -> Result<()> {
    let url = format!("http://{}/status", address);

    match reqwest::get(&url).await {
        Ok(response) => {
            let status: serde_json::Value = response
                .json()
                .await
                .map_err(|e| Error::Network(e.to_string()))?;
            println!("{}", serde_json::to_string_pretty(&status).unwrap());
            Ok(())
        }
        Err(e) => {
            eprintln!("Failed to get status: {}", e);
            Err(Error::Network(e.to_string()))
        }
    }
}

/// Initialize configuration file
fn run_init(output: PathBuf, bind_address: String) -> Result<()> {
    let config_content = format!(r#"# Vigil Configuration

[node]
bind_address = "{bind_address}"
data_dir = "/var/lib/vigil"
# advertise_address = "my-public-ip:7650"
# start_as_idle = false

[database]
host = "localhost"
port = 3306
user = "vigil"
password = "changeme"
repl_user = "repl"
repl_password = "changeme"
pool_size = 5
connect_timeout_secs = 10

[cluster]
peers = []
# peers = ["db2.example.com:7650", "db3.example.com:7650"]
election_timeout_ms = 3000
heartbeat_timeout_ms = 1000
request_timeout_ms = 1000
suspect_threshold = 3

[replication]
leader_start_command = "/usr/local/bin/vigil-leader-start.sh"
leader_stop_command = "/usr/local/bin/vigil-leader-stop.sh"
# backup_command = "/usr/local/bin/vigil-backup.sh"
command_timeout_secs = 30
ping_interval_ms = 1000
max_ping_failures = 3
purge_binlog_interval_ms = 300000
purge_binlog_disabled = false

[api]
enabled = true
bind_address = "0.0.0.0:8080"
cors_enabled = false

[logging]
level = "info"
format = "pretty"
# file = "/var/log/vigil/vigil.log"
"#);

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to configure your database and cluster settings.");
    println!("Then start with: vigil start --config {}", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match VigilConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node Address:   {}", config.advertise_address());
            println!("  Database:       {}@{}:{}",
                config.database.user,
                config.database.host,
                config.database.port);
            println!("  Peers:          {}", config.cluster.peers.len());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show node information
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = VigilConfig::from_file(&config_path)?;

    println!("Vigil Node Information");
    println!("======================");
    println!();
    println!("Node Address:     {}", config.advertise_address());
    println!("Bind Address:     {}", config.node.bind_address);
    println!("Data Directory:   {}", config.data_dir().display());
    println!("Start As Idle:    {}", config.node.start_as_idle);
    println!();
    println!("Database Configuration:");
    println!("  Host:           {}:{}", config.database.host, config.database.port);
    println!("  User:           {}", config.database.user);
    println!("  Repl User:      {}", config.database.repl_user);
    println!();
    println!("Cluster Configuration:");
    println!("  Peers:          {:?}", config.cluster.peers);
    println!("  Election:       {} ms", config.cluster.election_timeout_ms);
    println!("  Heartbeat:      {} ms", config.cluster.heartbeat_timeout_ms);
    println!("  RPC Timeout:    {} ms", config.cluster.request_timeout_ms);
    println!();
    println!("Replication Configuration:");
    println!("  Leader Start:   {}", config.replication.leader_start_command);
    println!("  Leader Stop:    {}", config.replication.leader_stop_command);
    println!("  Ping Interval:  {} ms", config.replication.ping_interval_ms);
    println!("  Purge:          {}", if config.replication.purge_binlog_disabled {
        "disabled".to_string()
    } else {
        format!("every {} ms", config.replication.purge_binlog_interval_ms)
    });

    Ok(())
}
