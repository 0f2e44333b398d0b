//! meshd: the meshgrid daemon.
//!
//! One binary, two roles:
//! - `manager`: agent registry, service discovery, inactivity reaper,
//!   connection health sweep, traffic-driven scale-up
//! - `agent`: registers with a manager and hosts service instances
//!
//! # Usage
//!
//! ```text
//! meshd manager --port 9000
//! meshd agent --name agent-1 --port 8000 --manager 127.0.0.1:9000
//! meshd --config meshgrid.toml agent --services echo,reverse
//! ```

mod agent_mode;
mod manager_mode;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use mesh_core::MeshConfig;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,meshd=debug,meshgrid=debug";
const DEFAULT_CONFIG: &str = "meshgrid.toml";

#[derive(Parser)]
#[command(name = "meshd", about = "meshgrid daemon")]
struct Cli {
    /// Config file; `meshgrid.toml` in the working directory is used when
    /// present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the manager.
    Manager {
        /// Address to bind.
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run an agent.
    Agent {
        /// Agent name, unique within the mesh.
        #[arg(long)]
        name: Option<String>,

        /// Port for the agent's listener.
        #[arg(long)]
        port: Option<u16>,

        /// Manager address (host:port).
        #[arg(long)]
        manager: Option<String>,

        /// Service types to offer, comma separated.
        #[arg(long, value_delimiter = ',')]
        services: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut config = load_config(cli.config.as_deref())?;
    match apply_overrides(&mut config, cli.command) {
        Role::Manager => manager_mode::run_manager(config.manager, config.transport).await,
        Role::Agent => agent_mode::run_agent(config.agent, config.transport).await,
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<MeshConfig> {
    let config = match path {
        Some(path) => MeshConfig::from_file(path)?,
        None if Path::new(DEFAULT_CONFIG).exists() => {
            MeshConfig::from_file(Path::new(DEFAULT_CONFIG))?
        }
        None => MeshConfig::default(),
    };
    Ok(config)
}

#[derive(Debug, PartialEq, Eq)]
enum Role {
    Manager,
    Agent,
}

/// Command-line flags win over the config file.
fn apply_overrides(config: &mut MeshConfig, command: Command) -> Role {
    match command {
        Command::Manager { host, port } => {
            if let Some(host) = host {
                config.manager.host = host;
            }
            if let Some(port) = port {
                config.manager.port = port;
            }
            Role::Manager
        }
        Command::Agent {
            name,
            port,
            manager,
            services,
        } => {
            if let Some(name) = name {
                config.agent.name = name;
            }
            if let Some(port) = port {
                config.agent.port = port;
            }
            if let Some(manager) = manager {
                config.agent.manager_addr = manager;
            }
            if !services.is_empty() {
                config.agent.services = services;
            }
            Role::Agent
        }
    }
}

/// Resolves on Ctrl-C.
pub(crate) async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for Ctrl-C, stopping");
        return;
    }
    info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("meshd").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn agent_flags_override_config() {
        let cli = parse(&[
            "agent",
            "--name",
            "edge-7",
            "--manager",
            "10.0.0.1:9000",
            "--services",
            "echo,reverse",
        ]);
        let mut config = MeshConfig::default();
        assert_eq!(apply_overrides(&mut config, cli.command), Role::Agent);
        assert_eq!(config.agent.name, "edge-7");
        assert_eq!(config.agent.manager_addr, "10.0.0.1:9000");
        assert_eq!(config.agent.services, vec!["echo", "reverse"]);
        assert_eq!(config.agent.port, 8000);
    }

    #[test]
    fn manager_port_override() {
        let cli = parse(&["--log-json", "manager", "--port", "9100"]);
        assert!(cli.log_json);
        let mut config = MeshConfig::default();
        assert_eq!(apply_overrides(&mut config, cli.command), Role::Manager);
        assert_eq!(config.manager.port, 9100);
        assert_eq!(config.manager.host, "0.0.0.0");
    }

    #[test]
    fn config_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meshgrid.toml");
        std::fs::write(&path, "[manager]\nport = 9200\nreaper_interval = \"50ms\"\n").unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.manager.port, 9200);
        assert_eq!(config.manager.reaper_interval, std::time::Duration::from_millis(50));
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(Some(&dir.path().join("absent.toml"))).is_err());
    }
}
