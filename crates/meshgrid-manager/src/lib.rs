//! meshgrid-manager: the central authority of a meshgrid control plane.
//!
//! Agents register over a first-frame handshake that turns their socket
//! into a long-lived control channel. Clients ask for a service type and
//! get the address of a running instance; when none exists the Manager
//! asks a capable agent to start one.
//!
//! # Architecture
//!
//! ```text
//! Manager
//!   ├── Registry (agents + instances + LoadBalancer, one mutex)
//!   ├── control channels (agent name → ConnectionWorker)
//!   ├── TrafficTracker (invokes extra instances on rising traffic)
//!   └── reaper loop
//!       ├── ages RUNNING instances, sends closeService past the threshold
//!       └── every health_interval: probe, reconnect or drop agents
//! ```

pub mod error;
pub mod health;
pub mod manager;
pub mod reaper;
pub mod registry;

pub use error::{ManagerError, ManagerResult};
pub use health::{ChannelHealth, HealthStatus, ProbeResult};
pub use manager::{Manager, RunningManager};
pub use registry::{AgentSummary, CloseOrder, InstanceSummary, Registry};
