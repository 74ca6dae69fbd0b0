//! ctlgroupctl - Command line tool for managing a controller group
//!
//! Usage:
//!   ctlgroupctl status             - Show local node status
//!   ctlgroupctl nodes              - Refresh and list group members
//!   ctlgroupctl detach <node-id>   - Ask a node to leave the group
//!   ctlgroupctl check-config       - Check a configuration file

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::Deserialize;

use ctlgroup::config::CtlGroupConfig;

/// Controller Group Control Tool
#[derive(Parser)]
#[command(name = "ctlgroupctl")]
#[command(about = "Control and monitor a ctlgroup controller group", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "/etc/ctlgroup/config.toml")]
    config: PathBuf,

    /// API endpoint to connect to (overrides config)
    #[arg(short, long)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show status of local node
    Status,
    /// Ask every group member for its info and list the answers
    Nodes {
        /// How long to collect answers (defaults to the node's refresh timeout)
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Ask a node to leave the group (not acknowledged)
    Detach {
        /// Numeric id of the node
        node_id: u64,
    },
    /// Check configuration file for errors
    CheckConfig {
        /// Path to config file to check (defaults to --config path)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

// ============ API Response Types ============

#[derive(Debug, Deserialize)]
struct NodeSummary {
    id: u64,
    name: String,
    address: String,
    #[serde(default)]
    is_master: bool,
    #[serde(default)]
    suspected: bool,
}

#[derive(Debug, Deserialize)]
struct ViewSummary {
    generation: u64,
    #[serde(default)]
    members: Vec<NodeSummary>,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    lifecycle: String,
    #[serde(default)]
    node_id: Option<u64>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    group: Option<String>,
    #[serde(default)]
    is_master: bool,
    #[serde(default)]
    control_running: bool,
    #[serde(default)]
    degraded: bool,
    view: ViewSummary,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeInfo {
    node_id: u64,
    name: String,
    address: String,
    cluster_name: String,
    is_master: bool,
}

#[derive(Debug, Deserialize)]
struct NodesResponse {
    timeout_ms: u64,
    master: Option<u64>,
    nodes: Vec<NodeInfo>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
    code: String,
    #[serde(default)]
    retryable: bool,
}

// ============ Config ============

#[derive(Debug, Deserialize)]
struct Config {
    #[serde(default)]
    api: ApiConfig,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfig {
    #[serde(default = "default_api_bind")]
    bind_address: String,
}

fn default_api_bind() -> String {
    "0.0.0.0:8080".to_string()
}

/// Where to reach the local node's admin API
fn resolve_endpoint(config_path: &PathBuf) -> String {
    let fallback = "http://127.0.0.1:8080".to_string();

    let Ok(content) = std::fs::read_to_string(config_path) else {
        return fallback;
    };
    let Ok(config) = toml::from_str::<Config>(&content) else {
        return fallback;
    };

    // A wildcard bind is reached through loopback
    let addr = config.api.bind_address;
    if addr.starts_with("0.0.0.0") {
        format!("http://127.0.0.1:{}", addr.rsplit(':').next().unwrap_or("8080"))
    } else {
        format!("http://{}", addr)
    }
}

// ============ Main ============

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let endpoint = cli
        .endpoint
        .clone()
        .unwrap_or_else(|| resolve_endpoint(&cli.config));

    let result = match &cli.command {
        Commands::Status => show_status(&endpoint).await,
        Commands::Nodes { timeout_ms } => list_nodes(&endpoint, *timeout_ms).await,
        Commands::Detach { node_id } => detach(&endpoint, *node_id).await,
        Commands::CheckConfig { file } => {
            let config_path = file.clone().unwrap_or_else(|| cli.config.clone());
            check_config(&config_path)
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

// ============ Commands ============

/// Turn a non-success response into an error carrying the API's message
async fn api_error(response: reqwest::Response) -> Box<dyn std::error::Error> {
    let status = response.status();
    match response.json::<ErrorResponse>().await {
        Ok(body) => {
            let hint = if body.retryable { " (may succeed if retried)" } else { "" };
            format!("API error {} [{}]: {}{}", status, body.code, body.error, hint).into()
        }
        Err(_) => format!("API error: {}", status).into(),
    }
}

async fn show_status(endpoint: &str) -> Result<(), Box<dyn std::error::Error>> {
    let url = format!("{}/status", endpoint);
    let client = reqwest::Client::new();

    let response = client.get(&url).send().await?;

    if !response.status().is_success() {
        return Err(api_error(response).await);
    }

    let status: StatusResponse = response.json().await?;

    println!();
    println!("Node Status");
    println!("===========");
    println!();
    println!("Node:         {}#{}",
        status.name.as_deref().unwrap_or("-"),
        status.node_id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string()));
    println!("Address:      {}", status.address.as_deref().unwrap_or("-"));
    println!("Group:        {}", status.group.as_deref().unwrap_or("-"));
    println!("Lifecycle:    {}", status.lifecycle.to_uppercase());
    println!("Role:         {}", if status.is_master { "MASTER" } else { "Standby" });
    println!("Control:      {}", if status.control_running { "running" } else { "stopped" });
    if status.degraded {
        println!("\x1b[1;31mDegraded:     control process failed to start\x1b[0m");
    }
    println!();
    println!("View {} ({} members)", status.view.generation, status.view.members.len());
    println!("{:<8} {:<20} {:<30} {:<10}", "ID", "NAME", "ADDRESS", "STATE");
    println!("{}", "-".repeat(70));
    for node in &status.view.members {
        let state = if node.is_master {
            "\x1b[1;34mmaster\x1b[0m"
        } else if node.suspected {
            "\x1b[33msuspected\x1b[0m"
        } else {
            ""
        };
        println!("{:<8} {:<20} {:<30} {}", node.id, node.name, node.address, state);
    }
    println!();

    Ok(())
}

async fn list_nodes(endpoint: &str, timeout_ms: Option<u64>) -> Result<(), Box<dyn std::error::Error>> {
    let url = match timeout_ms {
        Some(ms) => format!("{}/cluster/nodes?timeout_ms={}", endpoint, ms),
        None => format!("{}/cluster/nodes", endpoint),
    };
    let client = reqwest::Client::new();

    let response = client.get(&url).send().await?;

    if !response.status().is_success() {
        return Err(api_error(response).await);
    }

    let info: NodesResponse = response.json().await?;

    println!();
    println!("Controller Group (ctlgroupctl v{})", env!("CARGO_PKG_VERSION"));
    println!("========================================");
    println!();
    println!("Answered: {} node(s) within {} ms", info.nodes.len(), info.timeout_ms);
    match info.master {
        Some(master) => println!("Master: {}", master),
        None => println!("Master: NONE"),
    }
    println!();

    println!("{:<8} {:<20} {:<30} {:<20} {:<8}",
        "NODE ID", "NAME", "ADDRESS", "CLUSTER", "ROLE");
    println!("{}", "-".repeat(90));

    for node in &info.nodes {
        // Pad role to fixed width BEFORE adding color codes
        let role_padded = format!("{:<8}", if node.is_master { "Master" } else { "Standby" });
        let role_colored = if node.is_master {
            format!("\x1b[1;34m{}\x1b[0m", role_padded)
        } else {
            role_padded
        };

        println!("{:<8} {:<20} {:<30} {:<20} {}",
            node.node_id,
            node.name,
            node.address,
            node.cluster_name,
            role_colored
        );
    }
    println!();

    Ok(())
}

async fn detach(endpoint: &str, node_id: u64) -> Result<(), Box<dyn std::error::Error>> {
    let url = format!("{}/cluster/nodes/{}/detach", endpoint, node_id);
    let client = reqwest::Client::new();

    let response = client.post(&url).send().await?;

    if !response.status().is_success() {
        return Err(api_error(response).await);
    }

    println!("Terminate sent to node {}", node_id);
    println!("Delivery is not confirmed; check `ctlgroupctl status` to see it leave.");

    Ok(())
}

// ============ Config Check ============

fn check_config(path: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    println!();
    println!("\x1b[1;36mctlgroup Configuration Check\x1b[0m");
    println!();

    if !path.exists() {
        println!("\x1b[1;31m✗ ERROR:\x1b[0m Config file not found: {}", path.display());
        return Err(format!("{} not found", path.display()).into());
    }
    println!("\x1b[1;32m✓\x1b[0m Config file: {}", path.display());

    let config = match CtlGroupConfig::from_file(path) {
        Ok(c) => c,
        Err(e) => {
            println!("\x1b[1;31m✗ ERROR:\x1b[0m {}", e);
            return Err(e.into());
        }
    };
    println!("\x1b[1;32m✓\x1b[0m Config file is valid");
    println!("\x1b[1;32m✓\x1b[0m Node: {}#{}", config.node.name, config.node.id);
    println!("\x1b[1;32m✓\x1b[0m Group: {} at {}", config.group.name, config.group.address);

    let mut warnings = Vec::new();

    match config.node.advertise_address.as_deref() {
        None => {
            let bind = &config.node.bind_address;
            if bind.starts_with("0.0.0.0") {
                warnings.push(format!(
                    "[node] bind_address '{}' with no advertise_address: peers will be told a loopback address",
                    bind
                ));
            }
        }
        Some(addr) if addr.starts_with("0.0.0.0") || addr.starts_with("127.") => {
            warnings.push(format!("[node] advertise_address '{}' is not reachable from other hosts", addr));
        }
        Some(addr) => println!("\x1b[1;32m✓\x1b[0m Advertise address: {}", addr),
    }

    if !config.control.path.is_dir() {
        warnings.push(format!(
            "[control] path '{}' does not exist on this host",
            config.control.path.display()
        ));
    } else if !config.control.path.join(&config.control.script).exists() {
        warnings.push(format!(
            "[control] script '{}' not found in {}",
            config.control.script,
            config.control.path.display()
        ));
    }

    if config.control.components.is_empty() {
        warnings.push("[control] no components configured - the controller will start idle".to_string());
    }

    println!();
    if warnings.is_empty() {
        println!("\x1b[1;32m✓ Configuration looks good!\x1b[0m");
    } else {
        println!("\x1b[1;33mWarnings ({}):\x1b[0m", warnings.len());
        for w in &warnings {
            println!("  \x1b[33m⚠\x1b[0m  {}", w);
        }
    }
    println!();

    Ok(())
}
