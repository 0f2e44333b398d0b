//! Control-plane actions and their typed payloads.
//!
//! Each action's body is decoded into one of the structs below with
//! `Message::decode`, so every field is parsed (or rejected) explicitly.

use serde::{Deserialize, Serialize};

use crate::status::ServiceStatus;
use crate::types::{AgentId, InstanceId};

/// Every action understood by a Manager, an Agent or a Service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    // Manager.
    RegisterAgent,
    ServiceStatusChange,
    RenewTimer,
    AskForService,
    // Agent.
    Run,
    CloseService,
    TestServiceConnection,
    ReconnectService,
    RenewConnection,
    // Every service.
    TestConnection,
    // Business services.
    Process,
}

impl Action {
    const ALL: [Action; 11] = [
        Action::RegisterAgent,
        Action::ServiceStatusChange,
        Action::RenewTimer,
        Action::AskForService,
        Action::Run,
        Action::CloseService,
        Action::TestServiceConnection,
        Action::ReconnectService,
        Action::RenewConnection,
        Action::TestConnection,
        Action::Process,
    ];

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Action::RegisterAgent => "registerAgent",
            Action::ServiceStatusChange => "serviceStatusChange",
            Action::RenewTimer => "renewTimer",
            Action::AskForService => "askForService",
            Action::Run => "run",
            Action::CloseService => "closeService",
            Action::TestServiceConnection => "testServiceConnection",
            Action::ReconnectService => "reconnectService",
            Action::RenewConnection => "renewConnection",
            Action::TestConnection => "testConnection",
            Action::Process => "process",
        }
    }

    /// Case-insensitive lookup of a wire name.
    pub fn parse(raw: &str) -> Option<Action> {
        let raw = raw.trim();
        Self::ALL
            .into_iter()
            .find(|action| action.as_str().eq_ignore_ascii_case(raw))
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Manager payloads ───────────────────────────────────────────────

/// `registerAgent`: first frame an agent sends on its control channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterAgent {
    pub agent: String,
    #[serde(rename = "serviceID")]
    pub agent_id: AgentId,
    pub port: u16,
    pub available_services: Vec<String>,
}

/// `serviceStatusChange`: agent reports a lifecycle step of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatusChange {
    pub agent: String,
    #[serde(rename = "serviceID")]
    pub service_id: InstanceId,
    pub service: String,
    pub new_status: ServiceStatus,
}

/// `renewTimer`: an instance was used; reset its inactivity accumulator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenewTimer {
    pub agent: String,
    pub service: String,
    #[serde(rename = "serviceID")]
    pub service_id: InstanceId,
}

/// `askForService`: discovery request for a service type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AskForService {
    pub service: String,
}

// ── Agent payloads ─────────────────────────────────────────────────

/// `run`: start an instance of `service` on `port` (0 lets the OS pick).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunService {
    pub service: String,
    #[serde(default)]
    pub port: u16,
}

/// Reply to `run`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReply {
    #[serde(rename = "serviceID")]
    pub service_id: InstanceId,
    pub service: String,
    pub host: String,
    pub port: u16,
    pub required_fields: Vec<String>,
    pub additional_fields: Vec<String>,
}

/// `closeService`: tear an instance down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseService {
    pub service: String,
    #[serde(rename = "serviceID")]
    pub service_id: InstanceId,
}

/// `testServiceConnection` / `reconnectService`: address one local instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRef {
    #[serde(rename = "serviceID")]
    pub service_id: InstanceId,
}

/// `renewConnection`: first frame of a manager-initiated control channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenewConnection {
    pub agent: String,
}
