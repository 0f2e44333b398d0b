//! Agent error types.

use mesh_core::{CoreError, InstanceId, RequestError};
use meshgrid_transport::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("service type not in catalog: {0}")]
    UnknownService(String),

    #[error("instance not hosted here: {0}")]
    UnknownInstance(InstanceId),

    #[error("data channel to {0} unavailable")]
    DataChannel(InstanceId),

    #[error("no control channel to the manager")]
    NotRegistered,

    #[error("registration refused: {0}")]
    Registration(String),

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("agent state lock poisoned")]
    Poisoned,

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Request(#[from] RequestError),
}

pub type AgentResult<T> = Result<T, AgentError>;

impl From<AgentError> for RequestError {
    fn from(err: AgentError) -> Self {
        match err {
            e @ (AgentError::UnknownService(_) | AgentError::UnknownInstance(_)) => {
                RequestError::not_found(e.to_string())
            }
            e @ (AgentError::DataChannel(_)
            | AgentError::NotRegistered
            | AgentError::Transport(_)) => RequestError::unavailable(e.to_string()),
            AgentError::MissingField(field) => {
                RequestError::bad_request(format!("Malformed JSON request: {field} not found"))
            }
            AgentError::Request(e) => e,
            e => RequestError::internal(e.to_string()),
        }
    }
}
