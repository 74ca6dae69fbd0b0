//! ctlgroup - Redundant Controller Group Daemon
//!
//! Joins the controller group, keeps the elected master's control process
//! running, and serves the admin HTTP API.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ctlgroup::api::HttpServer;
use ctlgroup::config::CtlGroupConfig;
use ctlgroup::coordinator::{ClusterEvent, Coordinator};
use ctlgroup::error::Result;
use ctlgroup::supervisor::ProcessSupervisor;
use ctlgroup::transport::{UdpSettings, UdpTransport};

/// ctlgroup - Redundant Controller Group Daemon
#[derive(Parser)]
#[command(name = "ctlgroup")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "ctlgroup.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides [logging]
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the group and run until interrupted
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "ctlgroup.toml")]
        output: PathBuf,

        /// Node ID (lowest live id becomes master)
        #[arg(long, default_value_t = 1)]
        node_id: u64,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // The config file may carry the log level, but a broken file should
    // still be reported through the logger.
    let file_level = CtlGroupConfig::from_file(&cli.config)
        .ok()
        .map(|c| c.logging.level);
    let level = cli.log_level.or(file_level).unwrap_or_else(|| "info".to_string());
    init_logging(&level);

    match cli.command {
        Commands::Start => run_start(cli.config).await,
        Commands::Init { output, node_id } => run_init(output, node_id),
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

/// Log cluster events until the coordinator goes away
fn spawn_event_logger(coordinator: &Coordinator) {
    let mut events = coordinator.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ClusterEvent::ViewUpdated(view)) => {
                    tracing::debug!("View {} has {} member(s)", view.generation(), view.len());
                }
                Ok(ClusterEvent::MasterChanged(Some(master))) => {
                    tracing::info!("Master is now {}#{} at {}", master.name, master.id, master.address);
                }
                Ok(ClusterEvent::MasterChanged(None)) => {
                    tracing::warn!("Group has no master");
                }
                Ok(ClusterEvent::NodeSuspected(node)) => {
                    tracing::debug!("Suspected {}#{}", node.name, node.id);
                }
                Ok(ClusterEvent::Error { kind, message }) => {
                    tracing::error!("[{}] {}", kind, message);
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!("Event logger lagged, {} event(s) skipped", missed);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Start the node
async fn run_start(config_path: PathBuf) -> Result<()> {
    tracing::info!("Starting ctlgroup node...");

    let config = match CtlGroupConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            tracing::error!("Please check that the config file exists and is valid TOML");
            return Err(e);
        }
    };

    tracing::info!("Node: {}#{}", config.node.name, config.node.id);
    tracing::info!("Group: {} at {}", config.group.name, config.group.address);

    let transport = Arc::new(UdpTransport::new(UdpSettings::from_config(&config)));
    let supervisor = Arc::new(ProcessSupervisor::from_config(&config.control));
    let coordinator = Arc::new(Coordinator::new(transport, supervisor));
    spawn_event_logger(&coordinator);

    coordinator.start(&config).await?;
    tracing::info!("Node is active in view {}", coordinator.view().generation());

    let http_server = HttpServer::new(
        config.api.clone(),
        Arc::clone(&coordinator),
        config.refresh_timeout(),
    );
    let http_server_handle = tokio::spawn(async move {
        if let Err(e) = http_server.start().await {
            tracing::error!("HTTP server error: {}", e);
        }
    });

    let mut lifecycle = coordinator.watch_lifecycle();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
        _ = lifecycle.wait_for(|s| *s == ctlgroup::coordinator::LifecycleState::Detached) => {
            tracing::warn!("Node was detached from the group");
        }
    }

    coordinator.stop().await?;
    http_server_handle.abort();

    tracing::info!("ctlgroup shutdown complete");
    Ok(())
}

/// Create a new configuration file
fn run_init(output: PathBuf, node_id: u64) -> Result<()> {
    let config_content = format!(r#"# ctlgroup Configuration
# Generated configuration file

[node]
id = {node_id}
name = "ctl-{node_id}"
bind_address = "0.0.0.0:0"
# advertise_address = "10.0.0.{node_id}:7800"

[group]
name = "sdn-controllers"
address = "228.8.8.8:45588"
heartbeat_interval_ms = 1000
suspect_timeout_ms = 3000
view_timeout_ms = 6000
join_timeout_ms = 5000
# settle_ms = 2000
# interface = "10.0.0.{node_id}"

[control]
path = "/opt/pox"
program = "python"
script = "pox.py"
components = ["forwarding.l2_learning"]

[refresh]
timeout_ms = 2000

[api]
enabled = true
bind_address = "0.0.0.0:8080"
cors_enabled = false

[logging]
level = "info"
"#);

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to set the node identity and control process path.");
    println!("Then start with: ctlgroup start --config {}", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match CtlGroupConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node:          {}#{}", config.node.name, config.node.id);
            println!("  Group:         {} at {}", config.group.name, config.group.address);
            println!("  Control:       {} {} in {}",
                config.control.program,
                config.control.script,
                config.control.path.display());
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
    let config = CtlGroupConfig::from_file(&config_path)?;

    println!("ctlgroup Node Information");
    println!("=========================");
    println!();
    println!("Node ID:          {}", config.node.id);
    println!("Name:             {}", config.node.name);
    println!("Bind Address:     {}", config.node.bind_address);
    println!("Advertise:        {}", config.advertise_address());
    println!();
    println!("Group Configuration:");
    println!("  Name:           {}", config.group.name);
    println!("  Address:        {}", config.group.address);
    println!("  Heartbeat:      {} ms", config.group.heartbeat_interval_ms);
    println!("  Suspect After:  {} ms", config.group.suspect_timeout_ms);
    println!("  Remove After:   {} ms", config.group.view_timeout_ms);
    println!("  Join Timeout:   {} ms", config.group.join_timeout_ms);
    println!("  Settle Delay:   {} ms", config.settle_delay().as_millis());
    if let Some(interface) = config.group.interface {
        println!("  Interface:      {}", interface);
    }
    println!();
    println!("Control Process:");
    println!("  Command:        {} {} {}",
        config.control.program,
        config.control.script,
        config.control.components.join(" "));
    println!("  Directory:      {}", config.control.path.display());
    println!();
    println!("API:              {} (enabled: {})", config.api.bind_address, config.api.enabled);

    Ok(())
}
