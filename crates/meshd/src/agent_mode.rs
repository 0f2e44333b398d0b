//! Agent mode: hosts service instances for a manager.
//!
//! In this mode, the daemon:
//! 1. Builds the service catalog from the configured types
//! 2. Binds the agent listener and registers with the manager
//! 3. Serves lifecycle commands until shutdown
//!
//! Failing to register is fatal: the error is returned, no retry.

use mesh_core::{AgentConfig, TransportConfig};
use meshgrid_agent::{Agent, ServiceCatalog};
use tracing::info;

/// Run the agent until Ctrl-C.
pub async fn run_agent(config: AgentConfig, transport: TransportConfig) -> anyhow::Result<()> {
    info!(agent = %config.name, "meshgrid daemon starting in agent mode");

    let catalog = ServiceCatalog::builtin().restrict(&config.services);
    if catalog.is_empty() {
        anyhow::bail!("no runnable service types in {:?}", config.services);
    }

    let agent = Agent::new(config, transport, catalog);
    let running = agent.start().await?;
    info!(
        addr = %running.local_addr(),
        services = ?agent.catalog().names(),
        "agent ready"
    );

    crate::shutdown_signal().await;
    running.shutdown().await;

    info!("meshgrid daemon stopped");
    Ok(())
}
