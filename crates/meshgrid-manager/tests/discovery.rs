//! Manager integration tests.
//!
//! A scripted agent registers over a real socket and answers the
//! Manager's control commands, so discovery, status reporting, the
//! reaper and the health sweep run against the actual wire protocol.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mesh_core::protocol::{
    AskForService, CloseService, RegisterAgent, RenewTimer, RunReply, RunService, ServiceRef,
    ServiceStatusChange,
};
use mesh_core::{
    Action, InstanceId, ManagerConfig, Message, RequestError, ServiceEndpoint, ServiceStatus,
    TransportConfig,
};
use meshgrid_manager::{Manager, RunningManager};
use meshgrid_transport::{Connection, ConnectionWorker, RequestHandler, open_channel};
use uuid::Uuid;

/// Answers `run` with made-up ports and records close and reconnect
/// commands.
#[derive(Default)]
struct ScriptedAgent {
    runs: AtomicUsize,
    next_port: AtomicU16,
    /// Id to hand out instead of a fresh one.
    fixed_id: Mutex<Option<InstanceId>>,
    /// Status answered to `testServiceConnection`; 0 means healthy.
    service_status: AtomicU16,
    closed: Mutex<Vec<InstanceId>>,
    reconnected: Mutex<Vec<InstanceId>>,
}

#[async_trait]
impl RequestHandler for ScriptedAgent {
    async fn handle(&self, request: Message, _peer: SocketAddr) -> Result<Message, RequestError> {
        match request.action()? {
            Action::Run => {
                let run: RunService = request.decode()?;
                self.runs.fetch_add(1, Ordering::SeqCst);
                let port = 20_000 + self.next_port.fetch_add(1, Ordering::SeqCst);
                let service_id = self.fixed_id.lock().unwrap().unwrap_or_else(Uuid::new_v4);
                Message::ok_with(&RunReply {
                    service_id,
                    service: run.service,
                    host: "127.0.0.1".into(),
                    port,
                    required_fields: vec!["message".into()],
                    additional_fields: vec![],
                })
            }
            Action::CloseService => {
                let close: CloseService = request.decode()?;
                self.closed.lock().unwrap().push(close.service_id);
                Ok(Message::ok())
            }
            Action::TestServiceConnection => match self.service_status.load(Ordering::SeqCst) {
                0 | 200 => Ok(Message::ok()),
                status => Err(RequestError::new(status, "data channel down")),
            },
            Action::ReconnectService => {
                let target: ServiceRef = request.decode()?;
                self.reconnected.lock().unwrap().push(target.service_id);
                Ok(Message::ok())
            }
            other => Err(RequestError::bad_request(format!(
                "Unknown request action: {other}"
            ))),
        }
    }
}

fn config() -> ManagerConfig {
    ManagerConfig {
        host: "127.0.0.1".into(),
        port: 0,
        // Keep the traffic heuristic out of the way.
        traffic_window: Duration::from_secs(3600),
        invoke_ratio: 1000.0,
        ..ManagerConfig::default()
    }
}

async fn start(config: ManagerConfig) -> RunningManager {
    Manager::new(config, TransportConfig::default())
        .start()
        .await
        .unwrap()
}

async fn register(
    running: &RunningManager,
    name: &str,
    services: &[&str],
) -> (Arc<ScriptedAgent>, Arc<ConnectionWorker>) {
    let agent = Arc::new(ScriptedAgent::default());
    let registration = RegisterAgent {
        agent: name.into(),
        agent_id: Uuid::new_v4(),
        port: 1,
        available_services: services.iter().map(|s| s.to_string()).collect(),
    };
    let opening = Message::request_with(Action::RegisterAgent, &registration).unwrap();
    let worker = open_channel(
        "manager",
        &running.local_addr().to_string(),
        opening,
        agent.clone(),
        &TransportConfig::default(),
        Duration::from_secs(2),
    )
    .await
    .unwrap();

    for _ in 0..100 {
        if running.manager().connected_agents().contains(&name.to_string()) {
            return (agent, worker);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("agent {name} never attached");
}

async fn ask(running: &RunningManager, service: &str) -> Message {
    let request = Message::request_with(
        Action::AskForService,
        &AskForService {
            service: service.into(),
        },
    )
    .unwrap();
    Connection::request(
        &running.local_addr().to_string(),
        request,
        &TransportConfig::default(),
    )
    .await
    .unwrap()
}

async fn report(channel: &ConnectionWorker, id: InstanceId, status: ServiceStatus) -> Message {
    let change = ServiceStatusChange {
        agent: "agent-1".into(),
        service_id: id,
        service: "echo".into(),
        new_status: status,
    };
    let request = Message::request_with(Action::ServiceStatusChange, &change).unwrap();
    channel.send(request).await.unwrap()
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}

#[tokio::test]
async fn first_request_starts_instance_second_reuses_it() {
    let running = start(config()).await;
    let (agent, _channel) = register(&running, "agent-1", &["echo"]).await;

    let first = ask(&running, "echo").await;
    assert!(first.is_success(), "{first:?}");
    let first: ServiceEndpoint = first.decode().unwrap();
    assert_eq!(first.agent, "agent-1");
    assert_eq!(first.host, "127.0.0.1");
    assert_eq!(first.required_fields, vec!["message".to_string()]);
    assert_eq!(agent.runs.load(Ordering::SeqCst), 1);

    let second: ServiceEndpoint = ask(&running, "echo").await.decode().unwrap();
    assert_eq!(second, first);
    assert_eq!(agent.runs.load(Ordering::SeqCst), 1);

    running.shutdown().await;
}

#[tokio::test]
async fn unknown_type_is_not_found() {
    let running = start(config()).await;
    let _agent = register(&running, "agent-1", &["echo"]).await;

    let reply = ask(&running, "login").await;
    assert_eq!(reply.status(), 404);
    assert_eq!(reply.response_text(), Some("Service not found: login"));

    running.shutdown().await;
}

#[tokio::test]
async fn closed_instance_leaves_pool() {
    let running = start(config()).await;
    let (agent, channel) = register(&running, "agent-1", &["echo"]).await;

    let first: ServiceEndpoint = ask(&running, "echo").await.decode().unwrap();

    // The agent reports CLOSED directly; the Manager walks through CLOSING.
    let change = ServiceStatusChange {
        agent: "agent-1".into(),
        service_id: first.service_id,
        service: "echo".into(),
        new_status: ServiceStatus::Closed,
    };
    let request = Message::request_with(Action::ServiceStatusChange, &change).unwrap();
    let reply = channel.send(request).await.unwrap();
    assert!(reply.is_success());

    let second: ServiceEndpoint = ask(&running, "echo").await.decode().unwrap();
    assert_ne!(second.service_id, first.service_id);
    assert_eq!(agent.runs.load(Ordering::SeqCst), 2);

    // Backwards moves are protocol errors.
    let back = ServiceStatusChange {
        new_status: ServiceStatus::Starting,
        service_id: second.service_id,
        ..change
    };
    let request = Message::request_with(Action::ServiceStatusChange, &back).unwrap();
    assert_eq!(channel.send(request).await.unwrap().status(), 400);

    running.shutdown().await;
}

#[tokio::test]
async fn round_robin_across_agents() {
    let running = start(config()).await;
    let (a, _ca) = register(&running, "agent-a", &["echo"]).await;
    let (b, _cb) = register(&running, "agent-b", &["echo"]).await;

    // Each start goes to the next agent in turn.
    running.manager().start_instance("echo").await.unwrap();
    running.manager().start_instance("echo").await.unwrap();
    assert_eq!(a.runs.load(Ordering::SeqCst), 1);
    assert_eq!(b.runs.load(Ordering::SeqCst), 1);

    let picks: Vec<String> = {
        let mut picks = Vec::new();
        for _ in 0..4 {
            let endpoint: ServiceEndpoint = ask(&running, "echo").await.decode().unwrap();
            picks.push(endpoint.agent);
        }
        picks
    };
    assert_eq!(picks[0], picks[2]);
    assert_eq!(picks[1], picks[3]);
    assert_ne!(picks[0], picks[1]);

    running.shutdown().await;
}

#[tokio::test]
async fn idle_instance_is_closed_once() {
    let running = start(ManagerConfig {
        reaper_interval: Duration::from_millis(20),
        inactivity_threshold: Duration::from_millis(200),
        close_margin: Duration::from_millis(300),
        health_interval: Duration::from_secs(3600),
        ..config()
    })
    .await;
    let (agent, channel) = register(&running, "agent-1", &["echo"]).await;

    let endpoint: ServiceEndpoint = ask(&running, "echo").await.decode().unwrap();
    wait_until("close command", || !agent.closed.lock().unwrap().is_empty()).await;
    assert_eq!(
        running.manager().snapshot()[0].instances[0].status,
        ServiceStatus::Closing
    );

    // The agent confirms before the margin runs out.
    assert!(report(&channel, endpoint.service_id, ServiceStatus::Closed).await.is_success());
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(*agent.closed.lock().unwrap(), vec![endpoint.service_id]);
    assert!(running.manager().snapshot()[0].instances.is_empty());

    running.shutdown().await;
}

#[tokio::test]
async fn unconfirmed_close_is_resent() {
    let running = start(ManagerConfig {
        reaper_interval: Duration::from_millis(20),
        inactivity_threshold: Duration::from_millis(200),
        close_margin: Duration::from_millis(50),
        health_interval: Duration::from_secs(3600),
        ..config()
    })
    .await;
    let (agent, _channel) = register(&running, "agent-1", &["echo"]).await;

    let endpoint: ServiceEndpoint = ask(&running, "echo").await.decode().unwrap();
    wait_until("close resent", || agent.closed.lock().unwrap().len() >= 3).await;

    assert!(
        agent
            .closed
            .lock()
            .unwrap()
            .iter()
            .all(|id| *id == endpoint.service_id)
    );
    let snapshot = running.manager().snapshot();
    assert_eq!(snapshot[0].instances.len(), 1);
    assert_eq!(snapshot[0].instances[0].status, ServiceStatus::Closing);

    running.shutdown().await;
}

#[tokio::test]
async fn renewed_instance_stays_running() {
    let running = start(ManagerConfig {
        reaper_interval: Duration::from_millis(20),
        inactivity_threshold: Duration::from_millis(300),
        health_interval: Duration::from_secs(3600),
        ..config()
    })
    .await;
    let (agent, _channel) = register(&running, "agent-1", &["echo"]).await;
    let endpoint: ServiceEndpoint = ask(&running, "echo").await.decode().unwrap();

    let renew = RenewTimer {
        agent: "agent-1".into(),
        service: "echo".into(),
        service_id: endpoint.service_id,
    };
    for _ in 0..8 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let request = Message::request_with(Action::RenewTimer, &renew).unwrap();
        let reply = Connection::request(
            &running.local_addr().to_string(),
            request,
            &TransportConfig::default(),
        )
        .await
        .unwrap();
        assert!(reply.is_success());
    }

    assert!(agent.closed.lock().unwrap().is_empty());
    assert_eq!(
        running.manager().snapshot()[0].instances[0].status,
        ServiceStatus::Running
    );

    running.shutdown().await;
}

#[tokio::test]
async fn unreachable_agent_is_removed() {
    let running = start(ManagerConfig {
        probe_timeout: Duration::from_millis(200),
        unreachable_after: 2,
        health_interval: Duration::from_secs(3600),
        ..config()
    })
    .await;
    // Port 1 is never listening, so reconnects fail.
    let (_agent, channel) = register(&running, "agent-1", &["echo"]).await;
    ask(&running, "echo").await;
    channel.close().await;

    let manager = running.manager().clone();
    manager.clone().sweep_health().await;
    assert_eq!(manager.snapshot().len(), 1);
    manager.clone().sweep_health().await;
    assert!(manager.snapshot().is_empty());

    let reply = ask(&running, "echo").await;
    assert_eq!(reply.status(), 404);

    running.shutdown().await;
}

#[tokio::test]
async fn broken_data_channel_is_reconnected() {
    let running = start(ManagerConfig {
        health_interval: Duration::from_secs(3600),
        ..config()
    })
    .await;
    let (agent, _channel) = register(&running, "agent-1", &["echo"]).await;
    let endpoint: ServiceEndpoint = ask(&running, "echo").await.decode().unwrap();

    agent.service_status.store(503, Ordering::SeqCst);
    running.manager().clone().sweep_health().await;

    assert_eq!(*agent.reconnected.lock().unwrap(), vec![endpoint.service_id]);
    let snapshot = running.manager().snapshot();
    assert_eq!(snapshot[0].instances[0].status, ServiceStatus::Running);

    // A healthy data channel is left alone.
    agent.service_status.store(200, Ordering::SeqCst);
    running.manager().clone().sweep_health().await;
    assert_eq!(agent.reconnected.lock().unwrap().len(), 1);

    running.shutdown().await;
}

#[tokio::test]
async fn instance_unknown_to_agent_is_dropped() {
    let running = start(ManagerConfig {
        reaper_interval: Duration::from_millis(20),
        health_interval: Duration::from_secs(3600),
        ..config()
    })
    .await;
    let (agent, _channel) = register(&running, "agent-1", &["echo"]).await;
    let first: ServiceEndpoint = ask(&running, "echo").await.decode().unwrap();

    agent.service_status.store(404, Ordering::SeqCst);
    running.manager().clone().sweep_health().await;
    assert!(agent.reconnected.lock().unwrap().is_empty());

    let manager = running.manager().clone();
    wait_until("instance swept", || manager.snapshot()[0].instances.is_empty()).await;

    let second: ServiceEndpoint = ask(&running, "echo").await.decode().unwrap();
    assert_ne!(second.service_id, first.service_id);
    assert_eq!(agent.runs.load(Ordering::SeqCst), 2);

    running.shutdown().await;
}

#[tokio::test]
async fn rejected_run_reply_is_closed_on_agent() {
    let running = start(ManagerConfig {
        reaper_interval: Duration::from_millis(20),
        health_interval: Duration::from_secs(3600),
        ..config()
    })
    .await;
    let (agent, channel) = register(&running, "agent-1", &["echo"]).await;

    // The agent keeps answering with an id the Manager has already retired.
    let reused = Uuid::new_v4();
    *agent.fixed_id.lock().unwrap() = Some(reused);
    let first: ServiceEndpoint = ask(&running, "echo").await.decode().unwrap();
    assert_eq!(first.service_id, reused);
    assert!(report(&channel, reused, ServiceStatus::Closed).await.is_success());
    let manager = running.manager().clone();
    wait_until("instance swept", || manager.snapshot()[0].instances.is_empty()).await;

    let reply = ask(&running, "echo").await;
    assert_eq!(reply.status(), 500);
    assert_eq!(agent.runs.load(Ordering::SeqCst), 2);
    assert_eq!(*agent.closed.lock().unwrap(), vec![reused]);
    assert!(manager.snapshot()[0].instances.is_empty());

    running.shutdown().await;
}
