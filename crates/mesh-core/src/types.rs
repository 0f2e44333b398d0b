//! Registry data model shared by the Manager, the Load Balancer and Agents.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreResult;
use crate::status::ServiceStatus;

/// Globally unique identifier of a service instance.
pub type InstanceId = Uuid;

/// Unique identifier an agent announces at registration.
pub type AgentId = Uuid;

// ── Service instance ───────────────────────────────────────────────

/// One running (or starting/closing) instance of a service type.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceInstance {
    pub id: InstanceId,
    pub service_type: String,
    pub port: u16,
    /// Fields a request to this instance must contain.
    pub required_fields: Vec<String>,
    /// Fields the instance returns in addition to `responseText`.
    pub additional_fields: Vec<String>,
    status: ServiceStatus,
    /// Time elapsed since the instance was last used.
    inactivity: Duration,
}

impl ServiceInstance {
    /// Create a new instance record in `STARTING`.
    pub fn new(
        id: InstanceId,
        service_type: impl Into<String>,
        port: u16,
        required_fields: Vec<String>,
        additional_fields: Vec<String>,
    ) -> Self {
        Self {
            id,
            service_type: service_type.into(),
            port,
            required_fields,
            additional_fields,
            status: ServiceStatus::Starting,
            inactivity: Duration::ZERO,
        }
    }

    pub fn status(&self) -> ServiceStatus {
        self.status
    }

    pub fn is_running(&self) -> bool {
        self.status == ServiceStatus::Running
    }

    /// Move forward to `target`, stepping through every intermediate state.
    ///
    /// Returns the states visited (empty if already at `target`).
    pub fn advance_to(&mut self, target: ServiceStatus) -> CoreResult<Vec<ServiceStatus>> {
        let path = self.status.path_to(target)?;
        if let Some(last) = path.last() {
            self.status = *last;
        }
        Ok(path)
    }

    pub fn inactivity(&self) -> Duration {
        self.inactivity
    }

    pub fn add_inactivity(&mut self, elapsed: Duration) {
        self.inactivity = self.inactivity.saturating_add(elapsed);
    }

    pub fn reset_inactivity(&mut self) {
        self.inactivity = Duration::ZERO;
    }

    /// Pull the accumulator back by `margin` after a close command was sent.
    pub fn relieve_inactivity(&mut self, margin: Duration) {
        self.inactivity = self.inactivity.saturating_sub(margin);
    }
}

// ── Agent record ───────────────────────────────────────────────────

/// Everything the Manager knows about one registered agent.
#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub id: AgentId,
    pub name: String,
    /// Host observed on the registration socket.
    pub host: String,
    /// Port the agent listens on for reconnection handshakes.
    pub port: u16,
    pub available_services: BTreeSet<String>,
    /// service type → instance id → instance.
    services: HashMap<String, HashMap<InstanceId, ServiceInstance>>,
}

impl AgentRecord {
    pub fn new(
        id: AgentId,
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        available_services: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            host: host.into(),
            port,
            available_services: available_services.into_iter().collect(),
            services: HashMap::new(),
        }
    }

    pub fn can_run(&self, service_type: &str) -> bool {
        self.available_services.contains(service_type)
    }

    /// `host:port` of the agent's listener.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn endpoint(&self) -> AgentEndpoint {
        AgentEndpoint {
            name: self.name.clone(),
            host: self.host.clone(),
            port: self.port,
        }
    }

    pub fn insert_instance(&mut self, instance: ServiceInstance) {
        self.services
            .entry(instance.service_type.clone())
            .or_default()
            .insert(instance.id, instance);
    }

    pub fn instance(&self, service_type: &str, id: &InstanceId) -> Option<&ServiceInstance> {
        self.services.get(service_type)?.get(id)
    }

    pub fn instance_mut(
        &mut self,
        service_type: &str,
        id: &InstanceId,
    ) -> Option<&mut ServiceInstance> {
        self.services.get_mut(service_type)?.get_mut(id)
    }

    pub fn remove_instance(
        &mut self,
        service_type: &str,
        id: &InstanceId,
    ) -> Option<ServiceInstance> {
        let by_id = self.services.get_mut(service_type)?;
        let removed = by_id.remove(id);
        if by_id.is_empty() {
            self.services.remove(service_type);
        }
        removed
    }

    pub fn instances(&self) -> impl Iterator<Item = &ServiceInstance> {
        self.services.values().flat_map(|by_id| by_id.values())
    }

    pub fn instances_mut(&mut self) -> impl Iterator<Item = &mut ServiceInstance> {
        self.services.values_mut().flat_map(|by_id| by_id.values_mut())
    }

    pub fn instance_count(&self) -> usize {
        self.services.values().map(HashMap::len).sum()
    }

    /// Drop every CLOSED instance, returning what was removed.
    pub fn remove_closed(&mut self) -> Vec<ServiceInstance> {
        let mut removed = Vec::new();
        for by_id in self.services.values_mut() {
            let closed: Vec<InstanceId> = by_id
                .values()
                .filter(|inst| inst.status().is_terminal())
                .map(|inst| inst.id)
                .collect();
            for id in closed {
                if let Some(inst) = by_id.remove(&id) {
                    removed.push(inst);
                }
            }
        }
        self.services.retain(|_, by_id| !by_id.is_empty());
        removed
    }
}

// ── Endpoints ──────────────────────────────────────────────────────

/// Where an agent can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentEndpoint {
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl AgentEndpoint {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Where a running service instance can be reached, plus its contract.
///
/// This is also the body of a successful `askForService` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEndpoint {
    pub agent: String,
    #[serde(rename = "serviceID")]
    pub service_id: InstanceId,
    pub service: String,
    pub host: String,
    pub port: u16,
    pub required_fields: Vec<String>,
    pub additional_fields: Vec<String>,
}

impl ServiceEndpoint {
    /// Build the endpoint of `instance` hosted by `agent`.
    pub fn of(agent: &AgentRecord, instance: &ServiceInstance) -> Self {
        Self {
            agent: agent.name.clone(),
            service_id: instance.id,
            service: instance.service_type.clone(),
            host: agent.host.clone(),
            port: instance.port,
            required_fields: instance.required_fields.clone(),
            additional_fields: instance.additional_fields.clone(),
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_agent() -> AgentRecord {
        AgentRecord::new(
            Uuid::new_v4(),
            "agent-1",
            "127.0.0.1",
            8000,
            vec!["echo".to_string(), "reverse".to_string()],
        )
    }

    fn test_instance(service_type: &str, port: u16) -> ServiceInstance {
        ServiceInstance::new(Uuid::new_v4(), service_type, port, vec!["message".into()], vec![])
    }

    #[test]
    fn new_instance_starts_in_starting() {
        let inst = test_instance("echo", 1000);
        assert_eq!(inst.status(), ServiceStatus::Starting);
        assert_eq!(inst.inactivity(), Duration::ZERO);
    }

    #[test]
    fn advance_to_walks_forward() {
        let mut inst = test_instance("echo", 1000);
        let visited = inst.advance_to(ServiceStatus::Closing).unwrap();
        assert_eq!(visited, vec![ServiceStatus::Running, ServiceStatus::Closing]);
        assert_eq!(inst.status(), ServiceStatus::Closing);
        assert!(inst.advance_to(ServiceStatus::Running).is_err());
        assert_eq!(inst.status(), ServiceStatus::Closing);
    }

    #[test]
    fn inactivity_accumulates_and_resets() {
        let mut inst = test_instance("echo", 1000);
        inst.add_inactivity(Duration::from_millis(100));
        inst.add_inactivity(Duration::from_millis(150));
        assert_eq!(inst.inactivity(), Duration::from_millis(250));

        inst.relieve_inactivity(Duration::from_secs(1));
        assert_eq!(inst.inactivity(), Duration::ZERO);

        inst.add_inactivity(Duration::from_secs(3));
        inst.reset_inactivity();
        assert_eq!(inst.inactivity(), Duration::ZERO);
    }

    #[test]
    fn agent_tracks_instances_by_type() {
        let mut agent = test_agent();
        let a = test_instance("echo", 1000);
        let b = test_instance("reverse", 1001);
        let a_id = a.id;
        agent.insert_instance(a);
        agent.insert_instance(b);

        assert_eq!(agent.instance_count(), 2);
        assert!(agent.instance("echo", &a_id).is_some());
        assert!(agent.instance("reverse", &a_id).is_none());

        assert!(agent.remove_instance("echo", &a_id).is_some());
        assert_eq!(agent.instance_count(), 1);
    }

    #[test]
    fn remove_closed_only_drops_terminal() {
        let mut agent = test_agent();
        let mut closed = test_instance("echo", 1000);
        closed.advance_to(ServiceStatus::Closed).unwrap();
        let running_id = {
            let mut running = test_instance("echo", 1001);
            running.advance_to(ServiceStatus::Running).unwrap();
            let id = running.id;
            agent.insert_instance(running);
            id
        };
        agent.insert_instance(closed);

        let removed = agent.remove_closed();
        assert_eq!(removed.len(), 1);
        assert_eq!(agent.instance_count(), 1);
        assert!(agent.instance("echo", &running_id).is_some());
    }

    #[test]
    fn can_run_checks_capabilities() {
        let agent = test_agent();
        assert!(agent.can_run("echo"));
        assert!(!agent.can_run("login"));
        assert_eq!(agent.address(), "127.0.0.1:8000");
    }

    #[test]
    fn service_endpoint_wire_names() {
        let agent = test_agent();
        let inst = test_instance("echo", 4242);
        let endpoint = ServiceEndpoint::of(&agent, &inst);
        let json = serde_json::to_value(&endpoint).unwrap();
        assert_eq!(json["port"], 4242);
        assert_eq!(json["serviceID"], inst.id.to_string());
        assert_eq!(json["requiredFields"][0], "message");
        assert!(json.get("additionalFields").is_some());
    }
}
