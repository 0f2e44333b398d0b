//! The Manager: registry owner, discovery broker and channel supervisor.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use mesh_core::protocol::{
    AskForService, CloseService, RegisterAgent, RenewConnection, RenewTimer, RunReply, RunService,
    ServiceStatusChange,
};
use mesh_core::{
    Action, AgentEndpoint, AgentRecord, ManagerConfig, Message, RequestError, ServiceEndpoint,
    ServiceInstance, ServiceStatus, TransportConfig,
};
use meshgrid_balancer::{LoadBalancer, RoundRobinBalancer};
use meshgrid_traffic::TrafficTracker;
use meshgrid_transport::{
    ChannelAcceptor, ChannelGrant, ConnectionWorker, RequestHandler, ServeMode, Service,
    TransportError, open_channel,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ManagerError, ManagerResult};
use crate::health::{
    ChannelHealth, HealthStatus, ProbeResult, ServiceProbe, probe_channel, probe_service,
};
use crate::reaper::run_reaper;
use crate::registry::{AgentSummary, CloseOrder, Registry, capability_set};

pub struct Manager {
    me: Weak<Manager>,
    config: ManagerConfig,
    transport: TransportConfig,
    /// Agents, instances and the balancer pool, always mutated together.
    registry: Mutex<Registry>,
    /// agent name → control channel.
    channels: Mutex<HashMap<String, Arc<ConnectionWorker>>>,
    health: Mutex<HashMap<String, ChannelHealth>>,
    traffic: TrafficTracker,
    sweeping: AtomicBool,
}

impl Manager {
    pub fn new(config: ManagerConfig, transport: TransportConfig) -> Arc<Self> {
        Self::with_balancer(config, transport, Box::new(RoundRobinBalancer::new()))
    }

    pub fn with_balancer(
        config: ManagerConfig,
        transport: TransportConfig,
        balancer: Box<dyn LoadBalancer>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<Manager>| {
            let invoker = me.clone();
            let traffic = TrafficTracker::new(config.invoke_ratio).with_invoke_fn(move |service| {
                let manager = invoker.upgrade();
                async move {
                    let Some(manager) = manager else {
                        return Ok(());
                    };
                    let endpoint = manager.start_instance(&service).await?;
                    info!(
                        service = %endpoint.service,
                        agent = %endpoint.agent,
                        port = endpoint.port,
                        "extra instance started for rising traffic"
                    );
                    anyhow::Ok(())
                }
            });

            Self {
                me: me.clone(),
                config,
                transport,
                registry: Mutex::new(Registry::new(balancer)),
                channels: Mutex::new(HashMap::new()),
                health: Mutex::new(HashMap::new()),
                traffic,
                sweeping: AtomicBool::new(false),
            }
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn traffic(&self) -> &TrafficTracker {
        &self.traffic
    }

    /// Bind the listener and start the background loops.
    pub async fn start(self: &Arc<Self>) -> ManagerResult<RunningManager> {
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
        let local = service.local_addr()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = vec![tokio::spawn(service.run(shutdown_rx.clone()))];
        tasks.push(tokio::spawn(run_reaper(self.clone(), shutdown_rx.clone())));

        let manager = self.clone();
        let window = self.config.traffic_window.max(Duration::from_millis(1));
        let traffic_rx = shutdown_rx;
        tasks.push(tokio::spawn(async move {
            manager.traffic.run(window, traffic_rx).await;
        }));

        info!(addr = %local, "manager started");
        Ok(RunningManager {
            addr: local,
            manager: self.clone(),
            shutdown_tx,
            tasks,
        })
    }

    // ── Discovery ──────────────────────────────────────────────────

    /// Route a client to a running instance of `service_type`, starting
    /// one when none is pooled.
    pub async fn ask_for_service(&self, service_type: &str) -> ManagerResult<ServiceEndpoint> {
        self.traffic.record_request(service_type);
        let selected = self.registry()?.select_instance(service_type);
        match selected {
            Ok(endpoint) => {
                debug!(
                    service = %service_type,
                    agent = %endpoint.agent,
                    port = endpoint.port,
                    "instance selected"
                );
                Ok(endpoint)
            }
            Err(_) => self.start_instance(service_type).await,
        }
    }

    /// Ask a capable agent to run a new instance and pool it.
    ///
    /// Every capable agent is tried at most once.
    pub async fn start_instance(&self, service_type: &str) -> ManagerResult<ServiceEndpoint> {
        let attempts = {
            let registry = self.registry()?;
            if !registry.is_offered(service_type) {
                return Err(ManagerError::ServiceNotFound(service_type.to_string()));
            }
            registry.agent_count()
        };

        let mut last_error = None;
        for _ in 0..attempts {
            let agent = self.registry()?.select_agent(service_type)?;
            match self.run_on(&agent, service_type).await {
                Ok(endpoint) => return Ok(endpoint),
                Err(e) => {
                    warn!(
                        agent = %agent.name,
                        service = %service_type,
                        error = %e,
                        "agent failed to start service"
                    );
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| ManagerError::ServiceNotFound(service_type.to_string())))
    }

    async fn run_on(
        &self,
        agent: &AgentEndpoint,
        service_type: &str,
    ) -> ManagerResult<ServiceEndpoint> {
        let worker = self.channel(&agent.name)?;
        let request = Message::request_with(
            Action::Run,
            &RunService {
                service: service_type.to_string(),
                port: 0,
            },
        )?;
        let reply: RunReply = worker
            .send_ok(request, self.config.run_timeout)
            .await?
            .decode()?;

        let id = reply.service_id;
        match self.pool_started(&agent.name, service_type, reply) {
            Ok(endpoint) => Ok(endpoint),
            Err(e) => {
                // The agent runs an instance nobody will route to; stop it.
                warn!(agent = %agent.name, %id, error = %e, "started instance rejected, closing");
                let order = CloseOrder {
                    agent: agent.name.clone(),
                    service: service_type.to_string(),
                    id,
                };
                if let Err(close) = self.close_instance(&order).await {
                    debug!(agent = %agent.name, %id, error = %close, "stray instance close failed");
                }
                Err(e)
            }
        }
    }

    /// Register a freshly started instance as RUNNING and pool it.
    fn pool_started(
        &self,
        agent: &str,
        service_type: &str,
        reply: RunReply,
    ) -> ManagerResult<ServiceEndpoint> {
        let id = reply.service_id;
        let instance = ServiceInstance::new(
            id,
            service_type,
            reply.port,
            reply.required_fields,
            reply.additional_fields,
        );
        let mut registry = self.registry()?;
        registry.insert_instance(agent, instance)?;
        let (endpoint, _) = registry.set_status(agent, service_type, &id, ServiceStatus::Running)?;
        info!(
            %agent,
            service = %service_type,
            %id,
            port = endpoint.port,
            pooled = registry.pool_size(service_type),
            "instance started"
        );
        Ok(endpoint)
    }

    // ── Registry updates ───────────────────────────────────────────

    /// Add an agent from its registration frame. Returns the channel name.
    pub fn register_agent(
        &self,
        registration: &RegisterAgent,
        peer: SocketAddr,
    ) -> ManagerResult<String> {
        let name = registration.agent.trim().to_string();
        if name.is_empty() {
            let err = RequestError::bad_request("Malformed JSON request: agent can't be empty");
            return Err(err.into());
        }
        let record = AgentRecord::new(
            registration.agent_id,
            name.clone(),
            peer.ip().to_string(),
            registration.port,
            capability_set(&registration.available_services),
        );

        let replaced = self.registry()?.register_agent(record);
        if let Some(old) = replaced {
            info!(
                agent = %name,
                dropped = old.instance_count(),
                "agent re-registered, old record replaced"
            );
        }
        if let Ok(mut health) = self.health.lock() {
            health.insert(name.clone(), ChannelHealth::new(self.config.unreachable_after));
        }
        Ok(name)
    }

    /// Apply a status report from an agent. Unknown targets are ignored.
    pub fn service_status_change(&self, change: &ServiceStatusChange) -> ManagerResult<()> {
        let applied = self.registry()?.set_status(
            &change.agent,
            &change.service,
            &change.service_id,
            change.new_status,
        );
        match applied {
            Ok(_) => Ok(()),
            Err(e @ (ManagerError::UnknownAgent(_) | ManagerError::UnknownInstance(_))) => {
                info!(
                    agent = %change.agent,
                    id = %change.service_id,
                    error = %e,
                    "status change for unknown instance ignored"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub fn renew_timer(&self, renew: &RenewTimer) -> ManagerResult<()> {
        self.registry()?
            .renew(&renew.agent, &renew.service, &renew.service_id)?;
        debug!(agent = %renew.agent, id = %renew.service_id, "inactivity timer renewed");
        Ok(())
    }

    // ── Reaper ─────────────────────────────────────────────────────

    /// One reaper period: age instances, send close orders, sweep CLOSED.
    pub fn reap(&self, elapsed: Duration) -> Vec<CloseOrder> {
        let orders = {
            let Ok(mut registry) = self.registry() else {
                warn!("registry poisoned, reaper skipped");
                return Vec::new();
            };
            let orders = registry.age(
                elapsed,
                self.config.inactivity_threshold,
                self.config.close_margin,
            );
            registry.sweep_closed();
            orders
        };

        if let Some(manager) = self.me.upgrade() {
            for order in orders.iter().cloned() {
                let manager = manager.clone();
                tokio::spawn(async move {
                    if let Err(e) = manager.close_instance(&order).await {
                        warn!(
                            agent = %order.agent,
                            id = %order.id,
                            error = %e,
                            "close command failed"
                        );
                    }
                });
            }
        }
        orders
    }

    async fn close_instance(&self, order: &CloseOrder) -> ManagerResult<()> {
        let worker = self.channel(&order.agent)?;
        let request = Message::request_with(
            Action::CloseService,
            &CloseService {
                service: order.service.clone(),
                service_id: order.id,
            },
        )?;
        match worker.send_ok(request, self.config.run_timeout).await {
            Ok(_) => Ok(()),
            Err(TransportError::Rejected(e)) if e.is_not_found() => {
                // Agent already forgot it; finish the transition here.
                self.registry()?
                    .set_status(&order.agent, &order.service, &order.id, ServiceStatus::Closed)?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    // ── Health sweep ───────────────────────────────────────────────

    /// Start a sweep on its own task unless one is still running.
    pub fn spawn_health_sweep(&self) {
        if self.sweeping.swap(true, Ordering::SeqCst) {
            debug!("previous health sweep still running");
            return;
        }
        let Some(manager) = self.me.upgrade() else {
            self.sweeping.store(false, Ordering::SeqCst);
            return;
        };
        tokio::spawn(async move {
            manager.clone().sweep_health().await;
            manager.sweeping.store(false, Ordering::SeqCst);
        });
    }

    /// Probe every control channel concurrently, repair or drop the broken
    /// ones, then probe the instances of every healthy agent.
    pub async fn sweep_health(self: Arc<Self>) {
        let agents = match self.registry() {
            Ok(registry) => registry.agent_endpoints(),
            Err(e) => {
                warn!(error = %e, "health sweep skipped");
                return;
            }
        };

        let probes: Vec<JoinHandle<ProbeResult>> = agents
            .iter()
            .cloned()
            .map(|agent| {
                let manager = self.clone();
                tokio::spawn(async move { manager.check_agent(&agent).await })
            })
            .collect();
        let results = join_all(probes).await;

        let mut healthy = Vec::new();
        for (agent, result) in agents.into_iter().zip(results) {
            let result = result.unwrap_or(ProbeResult::Failed);
            let unreachable = match self.health.lock() {
                Ok(mut health) => health
                    .entry(agent.name.clone())
                    .or_insert_with(|| ChannelHealth::new(self.config.unreachable_after))
                    .record(result)
                    == HealthStatus::Unreachable,
                Err(_) => false,
            };
            if unreachable {
                self.drop_agent(&agent.name).await;
            } else if result != ProbeResult::Failed {
                healthy.push(agent.name);
            }
        }

        let service_checks: Vec<JoinHandle<()>> = healthy
            .into_iter()
            .map(|agent| {
                let manager = self.clone();
                tokio::spawn(async move { manager.check_services(&agent).await })
            })
            .collect();
        join_all(service_checks).await;

        debug!(agents = ?self.snapshot(), "health sweep finished");
    }

    async fn check_agent(&self, agent: &AgentEndpoint) -> ProbeResult {
        let failure = match self.channel(&agent.name) {
            Ok(worker) => match probe_channel(&worker, self.config.probe_timeout).await {
                Ok(()) => return ProbeResult::Alive,
                Err(e) => e.to_string(),
            },
            Err(e) => e.to_string(),
        };

        warn!(agent = %agent.name, error = %failure, "control channel probe failed, reconnecting");
        match self.reconnect(agent).await {
            Ok(()) => ProbeResult::Reconnected,
            Err(e) => {
                warn!(agent = %agent.name, error = %e, "reconnect failed");
                ProbeResult::Failed
            }
        }
    }

    /// Replace the agent's control channel with a freshly dialed one.
    async fn reconnect(&self, agent: &AgentEndpoint) -> ManagerResult<()> {
        let stale = self.channels()?.remove(&agent.name);
        if let Some(stale) = stale {
            stale.close().await;
        }

        let opening = Message::request_with(
            Action::RenewConnection,
            &RenewConnection {
                agent: agent.name.clone(),
            },
        )?;
        let worker = open_channel(
            agent.name.clone(),
            &dial_addr(&agent.host, agent.port),
            opening,
            self.handler()?,
            &self.transport,
            self.config.probe_timeout,
        )
        .await?;
        self.install_channel(agent.name.clone(), worker).await;
        info!(agent = %agent.name, "control channel reconnected");
        Ok(())
    }

    async fn check_services(&self, agent: &str) {
        let instances = match self.registry() {
            Ok(registry) => registry.running_instances(agent),
            Err(_) => return,
        };
        if instances.is_empty() {
            return;
        }
        let Ok(worker) = self.channel(agent) else {
            return;
        };

        for (service, id) in instances {
            match probe_service(&worker, id, self.config.probe_timeout).await {
                ServiceProbe::Alive => {}
                ServiceProbe::Reconnecting => {
                    info!(%agent, %id, "service reconnect requested");
                }
                ServiceProbe::Gone => {
                    info!(%agent, %id, "agent no longer hosts instance, closing");
                    let closed = self.registry().map(|mut registry| {
                        registry.set_status(agent, &service, &id, ServiceStatus::Closed)
                    });
                    if let Ok(Err(e)) = closed {
                        debug!(%agent, %id, error = %e, "instance already gone");
                    }
                }
                ServiceProbe::ChannelDown => break,
            }
        }
    }

    /// Remove an unreachable agent together with its instances.
    async fn drop_agent(&self, name: &str) {
        let removed = self.registry().ok().and_then(|mut registry| registry.remove_agent(name));
        if let Ok(mut health) = self.health.lock() {
            health.remove(name);
        }
        let worker = self.channels().ok().and_then(|mut channels| channels.remove(name));
        if let Some(worker) = worker {
            worker.close().await;
        }
        if let Some(record) = removed {
            warn!(agent = %name, instances = record.instance_count(), "agent unreachable, removed");
        }
    }

    // ── Channels ───────────────────────────────────────────────────

    async fn install_channel(&self, name: String, worker: Arc<ConnectionWorker>) {
        let old = match self.channels() {
            Ok(mut channels) => channels.insert(name.clone(), worker),
            Err(e) => {
                warn!(agent = %name, error = %e, "cannot store control channel");
                None
            }
        };
        if let Some(old) = old {
            debug!(agent = %name, "closing replaced control channel");
            old.close().await;
        }
    }

    /// Close every control channel.
    pub async fn close_channels(&self) {
        let workers: Vec<Arc<ConnectionWorker>> = match self.channels() {
            Ok(mut channels) => channels.drain().map(|(_, worker)| worker).collect(),
            Err(_) => Vec::new(),
        };
        for worker in workers {
            worker.close().await;
        }
    }

    /// Agents with an open control channel, sorted by name.
    pub fn connected_agents(&self) -> Vec<String> {
        let mut names: Vec<String> = match self.channels() {
            Ok(channels) => channels
                .iter()
                .filter(|(_, worker)| !worker.is_closed())
                .map(|(name, _)| name.clone())
                .collect(),
            Err(_) => Vec::new(),
        };
        names.sort();
        names
    }

    pub fn snapshot(&self) -> Vec<AgentSummary> {
        self.registry()
            .map(|registry| registry.snapshot())
            .unwrap_or_default()
    }

    fn channel(&self, agent: &str) -> ManagerResult<Arc<ConnectionWorker>> {
        self.channels()?
            .get(agent)
            .filter(|worker| !worker.is_closed())
            .cloned()
            .ok_or_else(|| ManagerError::NoChannel(agent.to_string()))
    }

    fn registry(&self) -> ManagerResult<MutexGuard<'_, Registry>> {
        self.registry.lock().map_err(|_| ManagerError::Poisoned)
    }

    fn channels(&self) -> ManagerResult<MutexGuard<'_, HashMap<String, Arc<ConnectionWorker>>>> {
        self.channels.lock().map_err(|_| ManagerError::Poisoned)
    }

    fn handler(&self) -> ManagerResult<Arc<dyn RequestHandler>> {
        let manager: Arc<dyn RequestHandler> =
            self.me.upgrade().ok_or(ManagerError::ShuttingDown)?;
        Ok(manager)
    }
}

/// `host:port` usable with `TcpStream::connect`, bracketing IPv6 hosts.
fn dial_addr(host: &str, port: u16) -> String {
    match host.parse::<IpAddr>() {
        Ok(ip) => SocketAddr::new(ip, port).to_string(),
        Err(_) => format!("{host}:{port}"),
    }
}

#[async_trait]
impl RequestHandler for Manager {
    async fn handle(&self, request: Message, _peer: SocketAddr) -> Result<Message, RequestError> {
        match request.action()? {
            Action::AskForService => {
                let ask: AskForService = request.decode()?;
                let service = ask.service.trim();
                if service.is_empty() {
                    return Err(RequestError::bad_request(
                        "Malformed JSON request: service can't be empty",
                    ));
                }
                let endpoint = self.ask_for_service(service).await?;
                Message::ok_with(&endpoint)
            }
            Action::ServiceStatusChange => {
                let change: ServiceStatusChange = request.decode()?;
                self.service_status_change(&change)?;
                Ok(Message::ok())
            }
            Action::RenewTimer => {
                let renew: RenewTimer = request.decode()?;
                self.renew_timer(&renew)?;
                Ok(Message::ok())
            }
            Action::RegisterAgent => Err(RequestError::bad_request(
                "registerAgent must be the first frame of a connection",
            )),
            other => Err(RequestError::bad_request(format!(
                "Unknown request action: {other}"
            ))),
        }
    }
}

#[async_trait]
impl ChannelAcceptor for Manager {
    fn opens_channel(&self, action: Action) -> bool {
        action == Action::RegisterAgent
    }

    async fn open_channel(
        &self,
        request: &Message,
        peer: SocketAddr,
    ) -> Result<ChannelGrant, RequestError> {
        let registration: RegisterAgent = request.decode()?;
        let name = self.register_agent(&registration, peer)?;
        Ok(ChannelGrant {
            name,
            handler: self.handler()?,
            response: Message::ok(),
        })
    }

    async fn attach_channel(&self, name: String, worker: Arc<ConnectionWorker>) {
        info!(agent = %name, peer = %worker.peer(), "control channel attached");
        self.install_channel(name, worker).await;
    }
}

/// A started manager. Dropping it leaves the tasks running; call
/// [`RunningManager::shutdown`].
pub struct RunningManager {
    addr: SocketAddr,
    manager: Arc<Manager>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningManager {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    /// Stop the listener and background loops, then close every channel.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                debug!(error = %e, "manager task ended abnormally");
            }
        }
        self.manager.close_channels().await;
        info!("manager stopped");
    }
}
