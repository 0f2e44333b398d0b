//! Control-channel health tracking.
//!
//! Each agent gets a `ChannelHealth` tracker. A sweep probes the agent's
//! control channel; a failed probe triggers a reconnect, and only a failed
//! reconnect counts against the agent. After `unreachable_after` such
//! failures in a row the agent is declared unreachable.

use std::time::Duration;

use mesh_core::protocol::ServiceRef;
use mesh_core::{Action, InstanceId, Message};
use meshgrid_transport::{ConnectionWorker, TransportError, TransportResult};
use tracing::{debug, warn};

/// Result of one sweep for one agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The control channel answered `testConnection`.
    Alive,
    /// The probe failed but a fresh channel was opened.
    Reconnected,
    /// Probe and reconnect both failed.
    Failed,
}

/// Aggregate health of one agent's control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Unreachable,
}

/// Tracks consecutive sweep results for a single agent.
#[derive(Debug)]
pub struct ChannelHealth {
    status: HealthStatus,
    consecutive_failures: u32,
    /// Failed reconnects before the agent is dropped.
    unreachable_after: u32,
}

impl ChannelHealth {
    pub fn new(unreachable_after: u32) -> Self {
        Self {
            status: HealthStatus::Unknown,
            consecutive_failures: 0,
            unreachable_after: unreachable_after.max(1),
        }
    }

    /// Record a sweep result and return the new health status.
    pub fn record(&mut self, result: ProbeResult) -> HealthStatus {
        match result {
            ProbeResult::Alive | ProbeResult::Reconnected => {
                if self.status != HealthStatus::Healthy && self.consecutive_failures > 0 {
                    debug!(failures = self.consecutive_failures, "control channel recovered");
                }
                self.consecutive_failures = 0;
                self.status = HealthStatus::Healthy;
            }
            ProbeResult::Failed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.unreachable_after {
                    if self.status != HealthStatus::Unreachable {
                        warn!(
                            failures = self.consecutive_failures,
                            threshold = self.unreachable_after,
                            "control channel unreachable"
                        );
                    }
                    self.status = HealthStatus::Unreachable;
                }
            }
        }
        self.status
    }

}

/// `testConnection` on a control channel, bounded by `deadline`.
pub async fn probe_channel(worker: &ConnectionWorker, deadline: Duration) -> TransportResult<()> {
    worker
        .send_ok(Message::request(Action::TestConnection), deadline)
        .await
        .map(|_| ())
}

/// Outcome of asking an agent about one of its instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceProbe {
    Alive,
    /// The agent no longer knows the instance.
    Gone,
    /// The data channel failed; a reconnect was requested.
    Reconnecting,
    /// The control channel itself failed.
    ChannelDown,
}

/// `testServiceConnection` for one instance, falling back to
/// `reconnectService` when the agent reports the data channel broken.
pub async fn probe_service(
    worker: &ConnectionWorker,
    id: InstanceId,
    deadline: Duration,
) -> ServiceProbe {
    let target = ServiceRef { service_id: id };
    let request = match Message::request_with(Action::TestServiceConnection, &target) {
        Ok(request) => request,
        Err(e) => {
            warn!(%id, error = %e, "cannot encode service probe");
            return ServiceProbe::ChannelDown;
        }
    };

    match worker.send_ok(request, deadline).await {
        Ok(_) => ServiceProbe::Alive,
        Err(TransportError::Rejected(e)) if e.is_not_found() => ServiceProbe::Gone,
        Err(TransportError::Rejected(e)) => {
            debug!(%id, error = %e, "service connection broken, reconnecting");
            let Ok(reconnect) = Message::request_with(Action::ReconnectService, &target) else {
                return ServiceProbe::ChannelDown;
            };
            match worker.send_ok(reconnect, deadline).await {
                Ok(_) => ServiceProbe::Reconnecting,
                Err(TransportError::Rejected(e)) if e.is_not_found() => ServiceProbe::Gone,
                Err(TransportError::Rejected(e)) => {
                    warn!(%id, error = %e, "service reconnect refused");
                    ServiceProbe::Reconnecting
                }
                Err(e) => {
                    debug!(%id, error = %e, "control channel failed during reconnect");
                    ServiceProbe::ChannelDown
                }
            }
        }
        Err(e) => {
            debug!(%id, error = %e, "control channel failed during service probe");
            ServiceProbe::ChannelDown
        }
    }
}
