//! meshgrid.toml configuration parser.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working single-host setup. Durations are written as strings such as
//! `"100ms"`, `"2s"` or `"5m"`.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub manager: ManagerConfig,
    pub agent: AgentConfig,
    pub transport: TransportConfig,
}

impl MeshConfig {
    pub fn from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| CoreError::ConfigRead {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> CoreResult<Self> {
        toml::from_str(content).map_err(|e| CoreError::ConfigParse(e.to_string()))
    }

    pub fn to_toml_string(&self) -> CoreResult<String> {
        toml::to_string_pretty(self).map_err(|e| CoreError::ConfigParse(e.to_string()))
    }
}

/// `[manager]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub host: String,
    pub port: u16,
    /// Period of the inactivity reaper.
    #[serde(with = "duration_str")]
    pub reaper_interval: Duration,
    /// Idle time after which an instance is closed.
    #[serde(with = "duration_str")]
    pub inactivity_threshold: Duration,
    /// Subtracted from the accumulator once a close command is sent.
    #[serde(with = "duration_str")]
    pub close_margin: Duration,
    /// Cadence of the connection-health sweep.
    #[serde(with = "duration_str")]
    pub health_interval: Duration,
    #[serde(with = "duration_str")]
    pub probe_timeout: Duration,
    /// Consecutive failed reconnects before an agent is dropped.
    pub unreachable_after: u32,
    #[serde(with = "duration_str")]
    pub traffic_window: Duration,
    pub invoke_ratio: f64,
    /// Deadline for an agent to answer `run`.
    #[serde(with = "duration_str")]
    pub run_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9000,
            reaper_interval: Duration::from_millis(100),
            inactivity_threshold: Duration::from_secs(120),
            close_margin: Duration::from_secs(5),
            health_interval: Duration::from_secs(2),
            probe_timeout: Duration::from_millis(500),
            unreachable_after: 3,
            traffic_window: Duration::from_secs(1),
            invoke_ratio: 1.2,
            run_timeout: Duration::from_secs(5),
        }
    }
}

/// `[agent]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
    /// Bind address of the agent's own listener.
    pub host: String,
    pub port: u16,
    /// Host the agent reports for the services it starts.
    pub advertise_host: String,
    pub manager_addr: String,
    /// Service types this agent offers; must exist in the catalog.
    pub services: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "agent-1".to_string(),
            host: "0.0.0.0".to_string(),
            port: 8000,
            advertise_host: "127.0.0.1".to_string(),
            manager_addr: "127.0.0.1:9000".to_string(),
            services: vec!["echo".to_string(), "reverse".to_string()],
        }
    }
}

/// `[transport]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Bound on waiting for the next request on a service socket.
    #[serde(with = "duration_str")]
    pub read_timeout: Duration,
    pub max_frame_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(180),
            max_frame_bytes: 1024 * 1024,
        }
    }
}

/// Parse `"250ms"`, `"2s"`, `"5m"` or a bare number of seconds.
pub fn parse_duration(raw: &str) -> CoreResult<Duration> {
    let s = raw.trim();
    let invalid = || CoreError::Duration(raw.to_string());
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().map(Duration::from_millis).map_err(|_| invalid())
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().map(Duration::from_secs).map_err(|_| invalid())
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim()
            .parse::<u64>()
            .map(|m| Duration::from_secs(m * 60))
            .map_err(|_| invalid())
    } else {
        s.parse::<u64>().map(Duration::from_secs).map_err(|_| invalid())
    }
}

/// Format a duration the way `parse_duration` reads it back.
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms % 1000 == 0 {
        format!("{}s", ms / 1000)
    } else {
        format!("{ms}ms")
    }
}

mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
