//! Agent and instance registry.
//!
//! Agent records, the load balancer pool and the retired-id tombstones live
//! in one struct so the owner can guard them with a single lock. The pool
//! only ever holds RUNNING instances: every status change that enters or
//! leaves RUNNING updates both sides in the same call.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use mesh_core::{
    AgentEndpoint, AgentRecord, InstanceId, ServiceEndpoint, ServiceInstance, ServiceStatus,
};
use meshgrid_balancer::{BalancerError, LoadBalancer};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{ManagerError, ManagerResult};

/// An instance the reaper decided to close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseOrder {
    pub agent: String,
    pub service: String,
    pub id: InstanceId,
}

/// Point-in-time view of one agent, for logs and tests.
#[derive(Debug, Clone, Serialize)]
pub struct AgentSummary {
    pub name: String,
    pub address: String,
    pub services: Vec<String>,
    pub instances: Vec<InstanceSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceSummary {
    pub id: InstanceId,
    pub service: String,
    pub port: u16,
    pub status: ServiceStatus,
    pub inactive_ms: u64,
}

pub struct Registry {
    agents: HashMap<String, AgentRecord>,
    balancer: Box<dyn LoadBalancer>,
    /// Ids of instances that were removed; never accepted again.
    retired: HashSet<InstanceId>,
}

impl Registry {
    pub fn new(balancer: Box<dyn LoadBalancer>) -> Self {
        Self {
            agents: HashMap::new(),
            balancer,
            retired: HashSet::new(),
        }
    }

    // ── Agents ─────────────────────────────────────────────────────

    /// Add `record`, replacing any agent registered under the same name.
    ///
    /// The replaced record is returned; its instances leave the pool.
    pub fn register_agent(&mut self, record: AgentRecord) -> Option<AgentRecord> {
        let replaced = self.remove_agent(&record.name);
        self.balancer
            .add_agent(record.endpoint(), record.available_services.clone());
        info!(
            agent = %record.name,
            address = %record.address(),
            services = ?record.available_services,
            "agent registered"
        );
        self.agents.insert(record.name.clone(), record);
        replaced
    }

    /// Remove an agent and everything it hosts.
    pub fn remove_agent(&mut self, name: &str) -> Option<AgentRecord> {
        let record = self.agents.remove(name)?;
        match self.balancer.remove_agent(name) {
            Ok(dropped) => debug!(agent = %name, dropped = dropped.len(), "agent left pool"),
            Err(e) => warn!(agent = %name, error = %e, "agent missing from pool"),
        }
        self.retired.extend(record.instances().map(|inst| inst.id));
        Some(record)
    }

    pub fn agent_endpoints(&self) -> Vec<AgentEndpoint> {
        let mut endpoints: Vec<AgentEndpoint> =
            self.agents.values().map(AgentRecord::endpoint).collect();
        endpoints.sort_by(|a, b| a.name.cmp(&b.name));
        endpoints
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    // ── Instances ──────────────────────────────────────────────────

    /// Record a new instance under `agent`, in whatever status it carries.
    pub fn insert_instance(&mut self, agent: &str, instance: ServiceInstance) -> ManagerResult<()> {
        if self.retired.contains(&instance.id) || self.find(&instance.id).is_some() {
            return Err(ManagerError::DuplicateInstance(instance.id));
        }
        let record = self
            .agents
            .get_mut(agent)
            .ok_or_else(|| ManagerError::UnknownAgent(agent.to_string()))?;

        let running = instance.is_running();
        let endpoint = ServiceEndpoint::of(record, &instance);
        record.insert_instance(instance);
        if running {
            self.balancer.add_instance(endpoint)?;
        }
        Ok(())
    }

    /// Move an instance forward to `status`, walking intermediate states.
    ///
    /// Returns the endpoint of the instance and the states visited.
    pub fn set_status(
        &mut self,
        agent: &str,
        service_type: &str,
        id: &InstanceId,
        status: ServiceStatus,
    ) -> ManagerResult<(ServiceEndpoint, Vec<ServiceStatus>)> {
        let record = self
            .agents
            .get_mut(agent)
            .ok_or_else(|| ManagerError::UnknownAgent(agent.to_string()))?;
        let instance = record
            .instance_mut(service_type, id)
            .ok_or(ManagerError::UnknownInstance(*id))?;

        let was_running = instance.is_running();
        let visited = instance.advance_to(status)?;
        let now_running = instance.is_running();
        if now_running && !was_running {
            instance.reset_inactivity();
        }

        let Some(instance) = record.instance(service_type, id) else {
            return Err(ManagerError::UnknownInstance(*id));
        };
        let endpoint = ServiceEndpoint::of(record, instance);

        if now_running && !was_running {
            self.balancer.add_instance(endpoint.clone())?;
        } else if was_running && !now_running {
            self.leave_pool(service_type, id);
        }

        if !visited.is_empty() {
            debug!(%agent, service = %service_type, %id, ?visited, "instance status changed");
        }
        Ok((endpoint, visited))
    }

    /// Reset the inactivity accumulator of an instance.
    pub fn renew(&mut self, agent: &str, service_type: &str, id: &InstanceId) -> ManagerResult<()> {
        let instance = self
            .agents
            .get_mut(agent)
            .ok_or_else(|| ManagerError::UnknownAgent(agent.to_string()))?
            .instance_mut(service_type, id)
            .ok_or(ManagerError::UnknownInstance(*id))?;
        instance.reset_inactivity();
        Ok(())
    }

    /// `(service type, id)` of every RUNNING instance hosted by `agent`.
    pub fn running_instances(&self, agent: &str) -> Vec<(String, InstanceId)> {
        let Some(record) = self.agents.get(agent) else {
            return Vec::new();
        };
        record
            .instances()
            .filter(|inst| inst.is_running())
            .map(|inst| (inst.service_type.clone(), inst.id))
            .collect()
    }

    // ── Selection ──────────────────────────────────────────────────

    pub fn select_instance(&self, service_type: &str) -> Result<ServiceEndpoint, BalancerError> {
        self.balancer.select_instance(service_type)
    }

    pub fn select_agent(&self, service_type: &str) -> Result<AgentEndpoint, BalancerError> {
        self.balancer.select_agent(service_type)
    }

    /// Whether any registered agent advertises `service_type`.
    pub fn is_offered(&self, service_type: &str) -> bool {
        self.agents.values().any(|a| a.can_run(service_type))
    }

    pub fn pool_size(&self, service_type: &str) -> usize {
        self.balancer.instance_count(service_type)
    }

    // ── Reaping ────────────────────────────────────────────────────

    /// Age every RUNNING and CLOSING instance by `elapsed`.
    ///
    /// A RUNNING instance reaching `threshold` moves to CLOSING and leaves
    /// the pool. A CLOSING instance reaching it again had its close lost
    /// and is ordered closed once more. Either way `margin` is taken off
    /// its accumulator, so an unconfirmed close is re-sent every `margin`.
    pub fn age(
        &mut self,
        elapsed: Duration,
        threshold: Duration,
        margin: Duration,
    ) -> Vec<CloseOrder> {
        let mut orders = Vec::new();
        let mut closing = Vec::new();
        for record in self.agents.values_mut() {
            let agent = record.name.clone();
            for instance in record.instances_mut() {
                let status = instance.status();
                if status != ServiceStatus::Running && status != ServiceStatus::Closing {
                    continue;
                }
                instance.add_inactivity(elapsed);
                if instance.inactivity() < threshold {
                    continue;
                }
                if status == ServiceStatus::Running {
                    if let Err(e) = instance.advance_to(ServiceStatus::Closing) {
                        warn!(id = %instance.id, error = %e, "cannot close instance");
                        continue;
                    }
                    closing.push((instance.service_type.clone(), instance.id));
                    info!(
                        %agent,
                        service = %instance.service_type,
                        id = %instance.id,
                        "instance idle, closing"
                    );
                } else {
                    warn!(
                        %agent,
                        service = %instance.service_type,
                        id = %instance.id,
                        "close not confirmed, retrying"
                    );
                }
                instance.relieve_inactivity(margin);
                orders.push(CloseOrder {
                    agent: agent.clone(),
                    service: instance.service_type.clone(),
                    id: instance.id,
                });
            }
        }
        for (service, id) in &closing {
            self.leave_pool(service, id);
        }
        orders
    }

    /// Drop every CLOSED instance from the registry.
    pub fn sweep_closed(&mut self) -> Vec<InstanceId> {
        let mut removed = Vec::new();
        for record in self.agents.values_mut() {
            for instance in record.remove_closed() {
                debug!(agent = %record.name, id = %instance.id, "closed instance removed");
                removed.push(instance.id);
            }
        }
        self.retired.extend(removed.iter().copied());
        removed
    }

    pub fn snapshot(&self) -> Vec<AgentSummary> {
        let mut agents: Vec<AgentSummary> = self
            .agents
            .values()
            .map(|record| {
                let mut instances: Vec<InstanceSummary> = record
                    .instances()
                    .map(|inst| InstanceSummary {
                        id: inst.id,
                        service: inst.service_type.clone(),
                        port: inst.port,
                        status: inst.status(),
                        inactive_ms: inst.inactivity().as_millis() as u64,
                    })
                    .collect();
                instances.sort_by(|a, b| (&a.service, a.port).cmp(&(&b.service, b.port)));
                AgentSummary {
                    name: record.name.clone(),
                    address: record.address(),
                    services: record.available_services.iter().cloned().collect(),
                    instances,
                }
            })
            .collect();
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        agents
    }

    fn find(&self, id: &InstanceId) -> Option<(&AgentRecord, &ServiceInstance)> {
        self.agents.values().find_map(|record| {
            record
                .instances()
                .find(|inst| inst.id == *id)
                .map(|inst| (record, inst))
        })
    }

    fn leave_pool(&mut self, service_type: &str, id: &InstanceId) {
        if let Err(e) = self.balancer.remove_instance(service_type, id) {
            debug!(service = %service_type, %id, error = %e, "instance was not pooled");
        }
    }
}

/// Capabilities as the balancer stores them.
pub fn capability_set(services: &[String]) -> BTreeSet<String> {
    services.iter().map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect()
}
