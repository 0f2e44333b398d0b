//! Manager error types.

use mesh_core::{CoreError, InstanceId, RequestError};
use meshgrid_balancer::BalancerError;
use meshgrid_transport::TransportError;
use thiserror::Error;

/// Errors that can occur while brokering discovery or maintaining the
/// registry.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("agent not registered: {0}")]
    UnknownAgent(String),

    #[error("instance not registered: {0}")]
    UnknownInstance(InstanceId),

    #[error("instance id already used: {0}")]
    DuplicateInstance(InstanceId),

    #[error("no control channel to agent: {0}")]
    NoChannel(String),

    #[error("registry lock poisoned")]
    Poisoned,

    #[error("manager is shutting down")]
    ShuttingDown,

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("load balancer error: {0}")]
    Balancer(#[from] BalancerError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Request(#[from] RequestError),
}

pub type ManagerResult<T> = Result<T, ManagerError>;

impl From<ManagerError> for RequestError {
    fn from(err: ManagerError) -> Self {
        match err {
            ManagerError::ServiceNotFound(service) => {
                RequestError::not_found(format!("Service not found: {service}"))
            }
            ManagerError::Balancer(BalancerError::NoAgent(service)) => {
                RequestError::not_found(format!("Service not found: {service}"))
            }
            e @ (ManagerError::UnknownAgent(_) | ManagerError::UnknownInstance(_)) => {
                RequestError::not_found(e.to_string())
            }
            ManagerError::Balancer(e) => RequestError::not_found(e.to_string()),
            ManagerError::Transport(TransportError::Rejected(e)) => e,
            e @ (ManagerError::Transport(_)
            | ManagerError::NoChannel(_)
            | ManagerError::ShuttingDown) => {
                RequestError::unavailable(e.to_string())
            }
            ManagerError::Core(e @ CoreError::IllegalTransition { .. }) => {
                RequestError::bad_request(e.to_string())
            }
            ManagerError::Request(e) => e,
            e => RequestError::internal(e.to_string()),
        }
    }
}
