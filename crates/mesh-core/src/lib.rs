//! mesh-core: shared types for the meshgrid control plane.
//!
//! Holds the registry data model (agents, service instances, status
//! machine), the JSON wire envelope exchanged between the Manager, its
//! Agents and their services, and the `meshgrid.toml` config parser.

pub mod config;
pub mod error;
pub mod message;
pub mod protocol;
pub mod status;
pub mod types;

pub use config::{AgentConfig, ManagerConfig, MeshConfig, TransportConfig};
pub use error::{CoreError, CoreResult, RequestError};
pub use message::{Message, MessageKind};
pub use protocol::Action;
pub use status::ServiceStatus;
pub use types::*;
