//! The `LoadBalancer` seam and its round-robin implementation.

use std::collections::{BTreeSet, HashMap};

use mesh_core::{AgentEndpoint, InstanceId, ServiceEndpoint};
use tracing::debug;

use crate::cursor::Cursor;
use crate::error::{BalancerError, BalancerResult};

/// Chooses where discovery requests go.
///
/// Selection takes `&self`; the owner serializes mutation.
pub trait LoadBalancer: Send + Sync {
    /// A running instance of `service_type`.
    fn select_instance(&self, service_type: &str) -> BalancerResult<ServiceEndpoint>;

    /// An agent able to start `service_type`.
    fn select_agent(&self, service_type: &str) -> BalancerResult<AgentEndpoint>;

    /// Add (or replace, by name) an agent and the types it can run.
    fn add_agent(&mut self, agent: AgentEndpoint, services: BTreeSet<String>);

    /// Add a running instance. Its agent must already be in the pool.
    fn add_instance(&mut self, instance: ServiceEndpoint) -> BalancerResult<()>;

    /// Remove an agent together with all of its instances, returning the
    /// ids of the instances dropped.
    fn remove_agent(&mut self, name: &str) -> BalancerResult<Vec<InstanceId>>;

    fn remove_instance(&mut self, service_type: &str, id: &InstanceId) -> BalancerResult<()>;

    /// Number of selectable instances of `service_type`.
    fn instance_count(&self, service_type: &str) -> usize;
}

#[derive(Debug)]
struct AgentSlot {
    endpoint: AgentEndpoint,
    services: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct InstancePool {
    instances: Vec<ServiceEndpoint>,
    cursor: Cursor,
}

/// Strict insertion-order round robin, no load weighting.
///
/// One cursor walks the agent list; one cursor per service type walks that
/// type's instance list.
#[derive(Debug, Default)]
pub struct RoundRobinBalancer {
    agents: Vec<AgentSlot>,
    agent_cursor: Cursor,
    pools: HashMap<String, InstancePool>,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }
}

impl LoadBalancer for RoundRobinBalancer {
    fn select_instance(&self, service_type: &str) -> BalancerResult<ServiceEndpoint> {
        let pool = self
            .pools
            .get(service_type)
            .ok_or_else(|| BalancerError::NoInstance(service_type.to_string()))?;
        pool.cursor
            .next(pool.instances.len())
            .map(|idx| pool.instances[idx].clone())
            .ok_or_else(|| BalancerError::NoInstance(service_type.to_string()))
    }

    fn select_agent(&self, service_type: &str) -> BalancerResult<AgentEndpoint> {
        let len = self.agents.len();
        // Visit every agent at most once.
        for _ in 0..len {
            let Some(idx) = self.agent_cursor.next(len) else {
                break;
            };
            let slot = &self.agents[idx];
            if slot.services.contains(service_type) {
                return Ok(slot.endpoint.clone());
            }
        }
        Err(BalancerError::NoAgent(service_type.to_string()))
    }

    fn add_agent(&mut self, agent: AgentEndpoint, services: BTreeSet<String>) {
        debug!(agent = %agent.name, ?services, "adding agent to pool");
        let slot = AgentSlot {
            endpoint: agent,
            services,
        };
        match self
            .agents
            .iter_mut()
            .find(|existing| existing.endpoint.name == slot.endpoint.name)
        {
            Some(existing) => *existing = slot,
            None => self.agents.push(slot),
        }
    }

    fn add_instance(&mut self, instance: ServiceEndpoint) -> BalancerResult<()> {
        if !self.agents.iter().any(|a| a.endpoint.name == instance.agent) {
            return Err(BalancerError::UnknownAgent(instance.agent));
        }
        let pool = self.pools.entry(instance.service.clone()).or_default();
        if pool.instances.iter().any(|i| i.service_id == instance.service_id) {
            return Ok(());
        }
        debug!(service = %instance.service, id = %instance.service_id, "adding instance to pool");
        pool.instances.push(instance);
        Ok(())
    }

    fn remove_agent(&mut self, name: &str) -> BalancerResult<Vec<InstanceId>> {
        let before = self.agents.len();
        self.agents.retain(|a| a.endpoint.name != name);
        if self.agents.len() == before {
            return Err(BalancerError::UnknownAgent(name.to_string()));
        }

        let mut dropped = Vec::new();
        for pool in self.pools.values_mut() {
            pool.instances.retain(|i| {
                let keep = i.agent != name;
                if !keep {
                    dropped.push(i.service_id);
                }
                keep
            });
        }
        self.pools.retain(|_, pool| !pool.instances.is_empty());
        debug!(agent = %name, instances = dropped.len(), "removed agent from pool");
        Ok(dropped)
    }

    fn remove_instance(&mut self, service_type: &str, id: &InstanceId) -> BalancerResult<()> {
        let pool = self
            .pools
            .get_mut(service_type)
            .ok_or(BalancerError::UnknownInstance(*id))?;
        let before = pool.instances.len();
        pool.instances.retain(|i| i.service_id != *id);
        if pool.instances.len() == before {
            return Err(BalancerError::UnknownInstance(*id));
        }
        if pool.instances.is_empty() {
            self.pools.remove(service_type);
        }
        Ok(())
    }

    fn instance_count(&self, service_type: &str) -> usize {
        self.pools
            .get(service_type)
            .map(|pool| pool.instances.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use uuid::Uuid;

    fn agent(name: &str) -> AgentEndpoint {
        AgentEndpoint {
            name: name.to_string(),
            host: "127.0.0.1".to_string(),
            port: 8000,
        }
    }

    fn services(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn instance(agent: &str, service: &str, port: u16) -> ServiceEndpoint {
        ServiceEndpoint {
            agent: agent.to_string(),
            service_id: Uuid::new_v4(),
            service: service.to_string(),
            host: "127.0.0.1".to_string(),
            port,
            required_fields: vec![],
            additional_fields: vec![],
        }
    }

    #[test]
    fn empty_pool_is_not_found() {
        let lb = RoundRobinBalancer::new();
        assert_eq!(
            lb.select_instance("echo"),
            Err(BalancerError::NoInstance("echo".into()))
        );
        assert_eq!(lb.select_agent("echo"), Err(BalancerError::NoAgent("echo".into())));
    }

    #[test]
    fn instances_rotate_in_insertion_order() {
        let mut lb = RoundRobinBalancer::new();
        lb.add_agent(agent("a"), services(&["echo"]));
        let first = instance("a", "echo", 1);
        let second = instance("a", "echo", 2);
        lb.add_instance(first.clone()).unwrap();
        lb.add_instance(second.clone()).unwrap();

        let picks: Vec<u16> = (0..4).map(|_| lb.select_instance("echo").unwrap().port).collect();
        assert_eq!(picks, vec![1, 2, 1, 2]);
    }

    #[test]
    fn duplicate_instance_is_ignored() {
        let mut lb = RoundRobinBalancer::new();
        lb.add_agent(agent("a"), services(&["echo"]));
        let inst = instance("a", "echo", 1);
        lb.add_instance(inst.clone()).unwrap();
        lb.add_instance(inst).unwrap();
        assert_eq!(lb.instance_count("echo"), 1);
    }

    #[test]
    fn instance_needs_known_agent() {
        let mut lb = RoundRobinBalancer::new();
        let err = lb.add_instance(instance("ghost", "echo", 1)).unwrap_err();
        assert_eq!(err, BalancerError::UnknownAgent("ghost".into()));
    }

    #[test]
    fn agents_visited_once_before_repeating() {
        let mut lb = RoundRobinBalancer::new();
        for name in ["a", "b", "c"] {
            lb.add_agent(agent(name), services(&["echo"]));
        }

        let first_round: HashSet<String> =
            (0..3).map(|_| lb.select_agent("echo").unwrap().name).collect();
        assert_eq!(first_round.len(), 3);
        assert_eq!(lb.select_agent("echo").unwrap().name, "a");
    }

    #[test]
    fn incapable_agents_are_skipped() {
        let mut lb = RoundRobinBalancer::new();
        lb.add_agent(agent("a"), services(&["reverse"]));
        lb.add_agent(agent("b"), services(&["echo"]));
        lb.add_agent(agent("c"), services(&["reverse"]));

        for _ in 0..5 {
            assert_eq!(lb.select_agent("echo").unwrap().name, "b");
        }
        assert!(lb.select_agent("login").is_err());
    }

    #[test]
    fn re_adding_agent_replaces_capabilities() {
        let mut lb = RoundRobinBalancer::new();
        lb.add_agent(agent("a"), services(&["echo"]));
        lb.add_agent(agent("a"), services(&["reverse"]));
        assert_eq!(lb.agent_count(), 1);
        assert!(lb.select_agent("echo").is_err());
        assert!(lb.select_agent("reverse").is_ok());
    }

    #[test]
    fn removed_agent_takes_its_instances() {
        let mut lb = RoundRobinBalancer::new();
        lb.add_agent(agent("a"), services(&["echo"]));
        lb.add_agent(agent("b"), services(&["echo"]));
        let on_a = instance("a", "echo", 1);
        let on_b = instance("b", "echo", 2);
        lb.add_instance(on_a.clone()).unwrap();
        lb.add_instance(on_b.clone()).unwrap();

        let dropped = lb.remove_agent("a").unwrap();
        assert_eq!(dropped, vec![on_a.service_id]);
        for _ in 0..4 {
            assert_eq!(lb.select_instance("echo").unwrap().agent, "b");
            assert_eq!(lb.select_agent("echo").unwrap().name, "b");
        }
        assert!(lb.remove_agent("a").is_err());
    }

    #[test]
    fn removed_instance_is_never_selected() {
        let mut lb = RoundRobinBalancer::new();
        lb.add_agent(agent("a"), services(&["echo"]));
        let keep = instance("a", "echo", 1);
        let gone = instance("a", "echo", 2);
        lb.add_instance(keep.clone()).unwrap();
        lb.add_instance(gone.clone()).unwrap();

        lb.remove_instance("echo", &gone.service_id).unwrap();
        for _ in 0..4 {
            assert_eq!(lb.select_instance("echo").unwrap().service_id, keep.service_id);
        }

        lb.remove_instance("echo", &keep.service_id).unwrap();
        assert!(lb.select_instance("echo").is_err());
        assert_eq!(
            lb.remove_instance("echo", &keep.service_id),
            Err(BalancerError::UnknownInstance(keep.service_id))
        );
    }
}
