//! replsetd - Replica-Set Member Daemon
//!
//! Runs one member of a replica set: heartbeats, elections and log
//! shipping over the peer protocol, plus the HTTP admin API.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use replset::api::HttpServer;
use replset::config::ReplSetConfig;
use replset::network::{MessageHandler, NetworkClient, NetworkServer, Transport};
use replset::node::ReplicaNode;
use replset::state::StateTracker;
use replset::topology::MemberId;

/// replsetd - Replica-Set Member Daemon
#[derive(Parser)]
#[command(name = "replsetd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "replset.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); defaults to [logging] level
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the replica-set member
    Start,

    /// Query a member's status over HTTP
    Status {
        /// API address to query
        #[arg(short, long, default_value = "localhost:8080")]
        address: String,
    },

    /// Write a sample configuration for one member of rs0
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "replset.toml")]
        output: PathBuf,

        /// Member id to configure
        #[arg(long, default_value_t = 0)]
        member_id: MemberId,
    },

    /// Validate configuration file
    Validate,

    /// Show member information
    Info,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = cli
        .log_level
        .clone()
        .or_else(|| {
            ReplSetConfig::from_file(&cli.config)
                .ok()
                .map(|c| c.logging.level)
        })
        .unwrap_or_else(|| "info".to_string());
    init_logging(&level);

    match cli.command {
        Commands::Start => run_start(cli.config).await,
        Commands::Status { address } => run_status(address).await,
        Commands::Init { output, member_id } => run_init(output, member_id),
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

/// Start the replica-set member
async fn run_start(config_path: PathBuf) -> anyhow::Result<()> {
    let config = ReplSetConfig::from_file(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;
    let descriptor = config.descriptor().context("Failed to resolve bootstrap descriptor")?;
    let member_id = config.node.member_id;
    tracing::info!(
        "Starting member {} of replica set {}",
        member_id,
        descriptor.set_name
    );

    std::fs::create_dir_all(config.data_dir())
        .with_context(|| format!("Failed to create data directory {}", config.data_dir().display()))?;

    let state_tracker = Arc::new(
        StateTracker::new(config.data_dir().clone(), member_id)
            .context("Failed to open election state")?,
    );

    let client = Arc::new(NetworkClient::new(
        config.heartbeat.timeout(),
        config.replication.write_timeout(),
    ));
    let transport: Arc<dyn Transport> = client.clone();

    let node = ReplicaNode::new(
        descriptor,
        member_id,
        state_tracker,
        transport,
        config.node_settings(),
    )
    .await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Peer protocol
    let handler: Arc<dyn MessageHandler> = node.clone();
    let server = NetworkServer::new(config.node.bind_address.clone(), handler);
    let rx = shutdown_rx.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run(rx).await {
            tracing::error!("Peer server error: {}", e);
        }
    });

    // HTTP API
    let http = HttpServer::new(config.api.clone(), Arc::clone(&node));
    let rx = shutdown_rx.clone();
    let http_handle = tokio::spawn(async move {
        if let Err(e) = http.start(rx).await {
            tracing::error!("HTTP API error: {}", e);
        }
    });

    // Idle peer connections
    let pool = Arc::clone(&client);
    let mut rx = shutdown_rx.clone();
    let cleanup_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = ticker.tick() => pool.cleanup_stale(Duration::from_secs(300)).await,
                _ = rx.changed() => break,
            }
        }
    });

    let running = Arc::clone(&node);
    let rx = shutdown_rx.clone();
    let node_handle = tokio::spawn(async move { running.run(rx).await });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal");
    let _ = shutdown_tx.send(true);

    node_handle.await??;
    let (server, http, cleanup) = tokio::join!(server_handle, http_handle, cleanup_handle);
    report_task_failures([server, http, cleanup]);

    tracing::info!("replsetd shutdown complete");
    Ok(())
}

/// Log tasks that panicked or were cancelled; returns how many did
fn report_task_failures(results: impl IntoIterator<Item = Result<(), tokio::task::JoinError>>) -> usize {
    let mut failed = 0;
    for result in results {
        if let Err(e) = result {
            tracing::error!("Task failed during shutdown: {}", e);
            failed += 1;
        }
    }
    failed
}

/// Query a member's status
async fn run_status(address: String) -> anyhow::Result<()> {
    let url = format!("http://{}/status", address);

    let response = reqwest::get(&url)
        .await
        .with_context(|| format!("Failed to get status from {}", address))?;
    let status: serde_json::Value = response.json().await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

/// Initialize configuration file
fn run_init(output: PathBuf, member_id: MemberId) -> anyhow::Result<()> {
    let config = ReplSetConfig::sample(member_id);
    config
        .descriptor()
        .with_context(|| format!("Member {} is not part of the sample replica set", member_id))?;

    let content = format!(
        "# replset configuration\n# Member {} of replica set rs0\n\n{}",
        member_id,
        config.to_toml()?
    );
    std::fs::write(&output, content)?;

    println!("Configuration file created: {}", output.display());
    println!("\nEdit [replica_set] to match your deployment.");
    println!("Then start with: replsetd --config {} start", output.display());
    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> anyhow::Result<()> {
    let checked = ReplSetConfig::from_file(&config_path).and_then(|config| {
        let descriptor = config.descriptor()?;
        Ok((config, descriptor))
    });

    match checked {
        Ok((config, descriptor)) => {
            println!("✓ Configuration is valid");
            println!("  Replica Set: {}", descriptor.set_name);
            println!("  Member ID: {}", config.node.member_id);
            println!("  Bind Address: {}", config.node.bind_address);
            println!("  Members: {}", descriptor.members.len());
            println!("  Majority: {}", descriptor.majority());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e.into())
        }
    }
}

/// Show member information
fn run_info(config_path: PathBuf) -> anyhow::Result<()> {
    let config = ReplSetConfig::from_file(&config_path)?;
    let descriptor = config.descriptor()?;

    println!("replset Member Information");
    println!("==========================");
    println!();
    println!("Replica Set:      {}", descriptor.set_name);
    println!("Member ID:        {}", config.node.member_id);
    println!("Bind Address:     {}", config.node.bind_address);
    println!("Data Directory:   {}", config.data_dir().display());
    println!();
    println!("Members:");
    for member in &descriptor.members {
        let kind = if member.arbiter_only { "arbiter" } else { "data" };
        println!(
            "  {:<3} {:<32} priority {:<4} {}",
            member.id,
            member.host,
            member.effective_priority(),
            kind
        );
    }
    println!("  Voting:         {}", descriptor.voting_count());
    println!("  Majority:       {}", descriptor.majority());
    println!();
    println!("Heartbeat:");
    println!("  Interval:       {} ms", config.heartbeat.interval_ms);
    println!("  Timeout:        {} ms", config.heartbeat.timeout_ms);
    println!("  Threshold:      {} failures", config.heartbeat.failure_threshold);
    println!();
    println!("Election:");
    println!(
        "  Timeout:        {}-{} ms",
        config.election.timeout_min_ms, config.election.timeout_max_ms
    );
    println!("  Max Attempts:   {}", config.election.max_attempts);
    println!();
    println!("Replication:");
    println!("  Write Concern:  {}", config.replication.default_write_concern);
    println!("  Write Timeout:  {} ms", config.replication.write_timeout_ms);
    println!("  Max Batch:      {}", config.replication.max_batch_entries);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_task_failures_are_reported() {
        let clean = tokio::spawn(async {});
        let panicked = tokio::spawn(async { panic!("listener crashed"); });
        let (clean, panicked) = tokio::join!(clean, panicked);
        assert_eq!(report_task_failures([clean, panicked]), 1);
    }
}
