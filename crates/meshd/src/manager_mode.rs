//! Manager mode: the central registry and discovery broker.
//!
//! In this mode, the daemon:
//! 1. Binds the manager listener (agents register, clients discover)
//! 2. Runs the reaper loop with its embedded health sweep
//! 3. Runs the traffic tracker window
//! 4. On shutdown, closes every agent control channel

use mesh_core::{ManagerConfig, TransportConfig, config::format_duration};
use meshgrid_manager::Manager;
use tracing::info;

/// Run the manager until Ctrl-C.
pub async fn run_manager(config: ManagerConfig, transport: TransportConfig) -> anyhow::Result<()> {
    info!("meshgrid daemon starting in manager mode");
    info!(
        reaper = %format_duration(config.reaper_interval),
        inactivity_threshold = %format_duration(config.inactivity_threshold),
        health_interval = %format_duration(config.health_interval),
        invoke_ratio = config.invoke_ratio,
        "manager configuration"
    );

    let manager = Manager::new(config, transport);
    let running = manager.start().await?;
    info!(addr = %running.local_addr(), "manager ready");

    crate::shutdown_signal().await;
    running.shutdown().await;

    info!("meshgrid daemon stopped");
    Ok(())
}
