//! Load balancer error types.

use mesh_core::InstanceId;
use thiserror::Error;

/// Errors that can occur during selection or pool maintenance.
///
/// Every variant is recoverable: a missing instance triggers a start
/// attempt, a missing agent surfaces as "service not found".
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BalancerError {
    #[error("no running instance of service type: {0}")]
    NoInstance(String),

    #[error("no agent can run service type: {0}")]
    NoAgent(String),

    #[error("agent not in pool: {0}")]
    UnknownAgent(String),

    #[error("instance not in pool: {0}")]
    UnknownInstance(InstanceId),
}

pub type BalancerResult<T> = Result<T, BalancerError>;
