//! The agent: hosts service instances on behalf of the Manager.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use mesh_core::protocol::{
    CloseService, RegisterAgent, RenewConnection, RunReply, RunService, ServiceRef,
    ServiceStatusChange,
};
use mesh_core::{
    Action, AgentConfig, AgentId, InstanceId, Message, RequestError, ServiceStatus,
    TransportConfig,
};
use meshgrid_transport::{
    ChannelAcceptor, ChannelGrant, Connection, ConnectionWorker, RefuseRequests, RequestHandler,
    ServeMode, Service, ServiceHandle, open_channel,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::ServiceCatalog;
use crate::error::{AgentError, AgentResult};

/// Bound on registration and on status reports sent to the Manager.
const MANAGER_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on a data-channel probe.
const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// One instance running on this agent.
struct HostedService {
    id: InstanceId,
    service_type: String,
    port: u16,
    listener: Mutex<Option<ServiceHandle>>,
    data: Mutex<Option<Arc<ConnectionWorker>>>,
}

impl HostedService {
    fn data_channel(&self) -> Option<Arc<ConnectionWorker>> {
        self.data.lock().ok().and_then(|slot| slot.clone())
    }

    fn replace_data_channel(
        &self,
        worker: Option<Arc<ConnectionWorker>>,
    ) -> Option<Arc<ConnectionWorker>> {
        match self.data.lock() {
            Ok(mut slot) => std::mem::replace(&mut *slot, worker),
            Err(_) => None,
        }
    }

    /// Drop the data channel and stop the listener.
    async fn shutdown(&self) {
        if let Some(data) = self.replace_data_channel(None) {
            data.close().await;
        }
        let listener = self.listener.lock().ok().and_then(|mut slot| slot.take());
        if let Some(listener) = listener {
            listener.shutdown().await;
        }
    }
}

pub struct Agent {
    me: Weak<Agent>,
    id: AgentId,
    config: AgentConfig,
    transport: TransportConfig,
    catalog: ServiceCatalog,
    services: Mutex<HashMap<InstanceId, Arc<HostedService>>>,
    manager: Mutex<Option<Arc<ConnectionWorker>>>,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        transport: TransportConfig,
        catalog: ServiceCatalog,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            id: Uuid::new_v4(),
            config,
            transport,
            catalog,
            services: Mutex::new(HashMap::new()),
            manager: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn id(&self) -> AgentId {
        self.id
    }

    pub fn catalog(&self) -> &ServiceCatalog {
        &self.catalog
    }

    /// Bind the agent's listener, then register with the Manager.
    ///
    /// A refused or failed registration stops the listener and is returned.
    pub async fn start(self: &Arc<Self>) -> AgentResult<RunningAgent> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let handler: Arc<dyn RequestHandler> = self.clone();
        let acceptor: Arc<dyn ChannelAcceptor> = self.clone();
        let service = Service::bind(
            &addr,
            handler,
            ServeMode::ControlPlane(acceptor),
            self.transport.clone(),
        )
        .await?;
        let listener = service.spawn()?;
        let local = listener.local_addr();
        info!(agent = %self.config.name, addr = %local, "agent listening");

        if let Err(e) = self.register(local.port()).await {
            warn!(agent = %self.config.name, error = %e, "registration failed, shutting down");
            listener.shutdown().await;
            return Err(e);
        }

        Ok(RunningAgent {
            addr: local,
            agent: self.clone(),
            listener,
        })
    }

    async fn register(&self, port: u16) -> AgentResult<()> {
        let registration = RegisterAgent {
            agent: self.config.name.clone(),
            agent_id: self.id,
            port,
            available_services: self.catalog.names(),
        };
        let opening = Message::request_with(Action::RegisterAgent, &registration)?;
        let worker = open_channel(
            "manager",
            &self.config.manager_addr,
            opening,
            self.handler()?,
            &self.transport,
            MANAGER_TIMEOUT,
        )
        .await
        .map_err(|e| AgentError::Registration(e.to_string()))?;

        self.install_manager_channel(worker).await;
        info!(
            agent = %self.config.name,
            manager = %self.config.manager_addr,
            services = ?registration.available_services,
            "registered with manager"
        );
        Ok(())
    }

    // ── Lifecycle commands ─────────────────────────────────────────

    /// Start an instance of `service_type` on `port` (0 lets the OS pick).
    pub async fn run_service(&self, service_type: &str, port: u16) -> AgentResult<RunReply> {
        let spec = self
            .catalog
            .get(service_type)
            .ok_or_else(|| AgentError::UnknownService(service_type.to_string()))?;

        let id = Uuid::new_v4();
        let service = Service::bind(
            &format!("{}:{}", self.config.host, port),
            spec.instantiate(),
            ServeMode::Plain,
            self.transport.clone(),
        )
        .await?;
        let listener = service.spawn()?;
        let port = listener.local_addr().port();

        let data = match self.dial_data_channel(id, port).await {
            Ok(data) => data,
            Err(e) => {
                listener.shutdown().await;
                return Err(e);
            }
        };

        let hosted = Arc::new(HostedService {
            id,
            service_type: spec.name.clone(),
            port,
            listener: Mutex::new(Some(listener)),
            data: Mutex::new(Some(data)),
        });
        self.services()?.insert(id, hosted);
        info!(agent = %self.config.name, service = %service_type, %id, port, "instance started");

        Ok(RunReply {
            service_id: id,
            service: spec.name.clone(),
            host: self.config.advertise_host.clone(),
            port,
            required_fields: spec.required_fields.clone(),
            additional_fields: spec.additional_fields.clone(),
        })
    }

    /// Report CLOSING, stop the instance, report CLOSED, forget it.
    pub async fn close_service(&self, id: InstanceId) -> AgentResult<()> {
        let hosted = self.hosted(id)?;
        self.notify_status(&hosted, ServiceStatus::Closing).await;
        hosted.shutdown().await;
        self.notify_status(&hosted, ServiceStatus::Closed).await;
        self.services()?.remove(&id);
        info!(agent = %self.config.name, service = %hosted.service_type, %id, "instance closed");
        Ok(())
    }

    /// Probe the data channel of an instance.
    pub async fn test_service(&self, id: InstanceId) -> AgentResult<()> {
        let hosted = self.hosted(id)?;
        let data = hosted
            .data_channel()
            .filter(|worker| !worker.is_closed())
            .ok_or(AgentError::DataChannel(id))?;
        data.send_ok(Message::request(Action::TestConnection), PROBE_TIMEOUT)
            .await
            .map_err(|e| {
                debug!(%id, error = %e, "data channel probe failed");
                AgentError::DataChannel(id)
            })?;
        Ok(())
    }

    /// Close and re-dial the data channel of an instance.
    pub async fn reconnect_service(&self, id: InstanceId) -> AgentResult<()> {
        let hosted = self.hosted(id)?;
        if let Some(stale) = hosted.replace_data_channel(None) {
            stale.close().await;
        }
        let data = self.dial_data_channel(id, hosted.port).await?;
        hosted.replace_data_channel(Some(data));
        info!(%id, port = hosted.port, "data channel reconnected");
        Ok(())
    }

    /// Ids of the instances hosted here.
    pub fn hosted_instances(&self) -> Vec<InstanceId> {
        self.services()
            .map(|services| services.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_registered(&self) -> bool {
        self.manager_channel().is_some()
    }

    /// Stop every instance and drop the manager channel.
    pub async fn shutdown(&self) {
        let hosted: Vec<Arc<HostedService>> = match self.services() {
            Ok(mut services) => services.drain().map(|(_, hosted)| hosted).collect(),
            Err(_) => Vec::new(),
        };
        for service in hosted {
            service.shutdown().await;
        }
        let manager = self.manager.lock().ok().and_then(|mut slot| slot.take());
        if let Some(manager) = manager {
            manager.close().await;
        }
    }

    // ── Helpers ────────────────────────────────────────────────────

    async fn dial_data_channel(
        &self,
        id: InstanceId,
        port: u16,
    ) -> AgentResult<Arc<ConnectionWorker>> {
        let addr = format!("{}:{}", local_dial_host(&self.config.host), port);
        let connection = Connection::connect(&addr, &self.transport).await?;
        let refuse: Arc<dyn RequestHandler> = Arc::new(RefuseRequests);
        let worker = ConnectionWorker::spawn(id.to_string(), connection.into_framed(), refuse)?;
        Ok(worker)
    }

    /// Best effort: a Manager that cannot be told will learn from the
    /// health sweep.
    async fn notify_status(&self, hosted: &HostedService, status: ServiceStatus) {
        let Some(manager) = self.manager_channel() else {
            warn!(id = %hosted.id, %status, "no manager channel, status not reported");
            return;
        };
        let change = ServiceStatusChange {
            agent: self.config.name.clone(),
            service_id: hosted.id,
            service: hosted.service_type.clone(),
            new_status: status,
        };
        let request = match Message::request_with(Action::ServiceStatusChange, &change) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "cannot encode status change");
                return;
            }
        };
        if let Err(e) = manager.send_ok(request, MANAGER_TIMEOUT).await {
            warn!(id = %hosted.id, %status, error = %e, "status report failed");
        }
    }

    async fn install_manager_channel(&self, worker: Arc<ConnectionWorker>) {
        let old = match self.manager.lock() {
            Ok(mut slot) => slot.replace(worker),
            Err(_) => None,
        };
        if let Some(old) = old {
            debug!("closing replaced manager channel");
            old.close().await;
        }
    }

    fn manager_channel(&self) -> Option<Arc<ConnectionWorker>> {
        self.manager
            .lock()
            .ok()
            .and_then(|slot| slot.clone())
            .filter(|worker| !worker.is_closed())
    }

    fn hosted(&self, id: InstanceId) -> AgentResult<Arc<HostedService>> {
        self.services()?
            .get(&id)
            .cloned()
            .ok_or(AgentError::UnknownInstance(id))
    }

    fn services(&self) -> AgentResult<MutexGuard<'_, HashMap<InstanceId, Arc<HostedService>>>> {
        self.services.lock().map_err(|_| AgentError::Poisoned)
    }

    fn handler(&self) -> AgentResult<Arc<dyn RequestHandler>> {
        let agent: Arc<dyn RequestHandler> = self.me.upgrade().ok_or(AgentError::NotRegistered)?;
        Ok(agent)
    }
}

/// Host to dial a listener bound on `bind_host` from this machine.
fn local_dial_host(bind_host: &str) -> &str {
    match bind_host {
        "" | "0.0.0.0" => "127.0.0.1",
        "::" | "[::]" => "[::1]",
        other => other,
    }
}

#[async_trait]
impl RequestHandler for Agent {
    async fn handle(&self, request: Message, _peer: SocketAddr) -> Result<Message, RequestError> {
        match request.action()? {
            Action::Run => {
                let run: RunService = request.decode()?;
                let reply = self.run_service(run.service.trim(), run.port).await?;
                Message::ok_with(&reply)
            }
            Action::CloseService => {
                let close: CloseService = request.decode()?;
                self.close_service(close.service_id).await?;
                Ok(Message::ok())
            }
            Action::TestServiceConnection => {
                let target: ServiceRef = request.decode()?;
                self.test_service(target.service_id).await?;
                Ok(Message::ok())
            }
            Action::ReconnectService => {
                let target: ServiceRef = request.decode()?;
                self.reconnect_service(target.service_id).await?;
                Ok(Message::ok())
            }
            Action::RenewConnection => Err(RequestError::bad_request(
                "renewConnection must be the first frame of a connection",
            )),
            other => Err(RequestError::bad_request(format!(
                "Unknown request action: {other}"
            ))),
        }
    }
}

#[async_trait]
impl ChannelAcceptor for Agent {
    fn opens_channel(&self, action: Action) -> bool {
        action == Action::RenewConnection
    }

    async fn open_channel(
        &self,
        request: &Message,
        peer: SocketAddr,
    ) -> Result<ChannelGrant, RequestError> {
        let renew: RenewConnection = request.decode()?;
        if renew.agent.trim() != self.config.name {
            return Err(RequestError::bad_request(format!(
                "renewConnection for {} reached agent {}",
                renew.agent, self.config.name
            )));
        }
        debug!(%peer, "manager reopening control channel");
        Ok(ChannelGrant {
            name: "manager".to_string(),
            handler: self.handler()?,
            response: Message::ok(),
        })
    }

    async fn attach_channel(&self, _name: String, worker: Arc<ConnectionWorker>) {
        info!(agent = %self.config.name, peer = %worker.peer(), "manager channel renewed");
        self.install_manager_channel(worker).await;
    }
}

/// A registered agent with its listener running.
pub struct RunningAgent {
    addr: SocketAddr,
    agent: Arc<Agent>,
    listener: ServiceHandle,
}

impl RunningAgent {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn agent(&self) -> &Arc<Agent> {
        &self.agent
    }

    /// Stop the listener, every instance and the manager channel.
    pub async fn shutdown(self) {
        self.listener.shutdown().await;
        self.agent.shutdown().await;
        info!(agent = %self.agent.name(), "agent stopped");
    }
}
