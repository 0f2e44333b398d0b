//! Client side of service discovery, as used by gateways.
//!
//! Every call asks the Manager where a service type lives, forwards the
//! request there, and renews the instance's inactivity timer afterwards.

use mesh_core::protocol::{AskForService, RenewTimer};
use mesh_core::{Action, Message, ServiceEndpoint, TransportConfig};
use meshgrid_transport::Connection;
use tracing::{debug, warn};

use crate::error::{AgentError, AgentResult};

#[derive(Debug, Clone)]
pub struct DiscoveryClient {
    manager_addr: String,
    transport: TransportConfig,
}

impl DiscoveryClient {
    pub fn new(manager_addr: impl Into<String>, transport: TransportConfig) -> Self {
        Self {
            manager_addr: manager_addr.into(),
            transport,
        }
    }

    pub fn manager_addr(&self) -> &str {
        &self.manager_addr
    }

    /// Where a running instance of `service_type` can be reached.
    pub async fn ask_for_service(&self, service_type: &str) -> AgentResult<ServiceEndpoint> {
        let request = Message::request_with(
            Action::AskForService,
            &AskForService {
                service: service_type.to_string(),
            },
        )?;
        let reply = Connection::request(&self.manager_addr, request, &self.transport)
            .await?
            .into_result()?;
        let endpoint: ServiceEndpoint = reply.decode()?;
        debug!(service = %service_type, addr = %endpoint.address(), "service discovered");
        Ok(endpoint)
    }

    /// Reset the inactivity timer of the instance behind `endpoint`.
    pub async fn renew_timer(&self, endpoint: &ServiceEndpoint) -> AgentResult<()> {
        let request = Message::request_with(
            Action::RenewTimer,
            &RenewTimer {
                agent: endpoint.agent.clone(),
                service: endpoint.service.clone(),
                service_id: endpoint.service_id,
            },
        )?;
        Connection::request(&self.manager_addr, request, &self.transport)
            .await?
            .into_result()?;
        Ok(())
    }

    /// Discover `service_type`, send `request` to it, renew its timer.
    ///
    /// Fields the instance requires are checked before anything is sent.
    pub async fn call_service(&self, service_type: &str, request: Message) -> AgentResult<Message> {
        let endpoint = self.ask_for_service(service_type).await?;
        if let Some(missing) = endpoint
            .required_fields
            .iter()
            .find(|field| request.get(field).is_none())
        {
            return Err(AgentError::MissingField(missing.clone()));
        }

        let reply = Connection::request(&endpoint.address(), request, &self.transport).await?;
        if let Err(e) = self.renew_timer(&endpoint).await {
            warn!(
                service = %service_type,
                id = %endpoint.service_id,
                error = %e,
                "timer renewal failed"
            );
        }
        Ok(reply)
    }
}
