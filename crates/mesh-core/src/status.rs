//! Service instance status machine.
//!
//! ```text
//! STARTING(0) → RUNNING(1) → CLOSING(2) → CLOSED(3)
//! ```
//!
//! Transitions only move forward one step at a time. CLOSED is terminal.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Lifecycle status of a service instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ServiceStatus {
    Starting,
    Running,
    Closing,
    Closed,
}

impl ServiceStatus {
    /// Numeric code used on the wire.
    pub fn code(self) -> u8 {
        match self {
            ServiceStatus::Starting => 0,
            ServiceStatus::Running => 1,
            ServiceStatus::Closing => 2,
            ServiceStatus::Closed => 3,
        }
    }

    /// The state that follows this one, `None` for CLOSED.
    pub fn successor(self) -> Option<ServiceStatus> {
        match self {
            ServiceStatus::Starting => Some(ServiceStatus::Running),
            ServiceStatus::Running => Some(ServiceStatus::Closing),
            ServiceStatus::Closing => Some(ServiceStatus::Closed),
            ServiceStatus::Closed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == ServiceStatus::Closed
    }

    /// Every intermediate state visited when moving from `self` to `target`,
    /// `target` included. Empty when already there.
    pub fn path_to(self, target: ServiceStatus) -> CoreResult<Vec<ServiceStatus>> {
        if target < self {
            return Err(CoreError::IllegalTransition {
                from: self,
                to: target,
            });
        }
        let mut path = Vec::new();
        let mut current = self;
        while current != target {
            // `target > current` so a successor always exists here.
            let Some(next) = current.successor() else {
                break;
            };
            path.push(next);
            current = next;
        }
        Ok(path)
    }
}

impl TryFrom<u8> for ServiceStatus {
    type Error = CoreError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(ServiceStatus::Starting),
            1 => Ok(ServiceStatus::Running),
            2 => Ok(ServiceStatus::Closing),
            3 => Ok(ServiceStatus::Closed),
            other => Err(CoreError::UnknownStatus(other)),
        }
    }
}

impl From<ServiceStatus> for u8 {
    fn from(status: ServiceStatus) -> u8 {
        status.code()
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ServiceStatus::Starting => "starting",
            ServiceStatus::Running => "running",
            ServiceStatus::Closing => "closing",
            ServiceStatus::Closed => "closed",
        };
        f.write_str(label)
    }
}
