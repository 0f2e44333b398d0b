//! Service catalog: the service types an agent knows how to run.
//!
//! Each entry carries the request contract advertised to clients
//! (`requiredFields`, `additionalFields`) and a factory producing the
//! handler a fresh instance serves with.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use mesh_core::{Action, Message, RequestError};
use meshgrid_transport::RequestHandler;
use tracing::warn;

/// Builds the handler for one new instance.
pub type HandlerFactory = Arc<dyn Fn() -> Arc<dyn RequestHandler> + Send + Sync>;

#[derive(Clone)]
pub struct ServiceSpec {
    pub name: String,
    pub required_fields: Vec<String>,
    pub additional_fields: Vec<String>,
    factory: HandlerFactory,
}

impl ServiceSpec {
    pub fn instantiate(&self) -> Arc<dyn RequestHandler> {
        (self.factory)()
    }
}

impl std::fmt::Debug for ServiceSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceSpec")
            .field("name", &self.name)
            .field("required_fields", &self.required_fields)
            .field("additional_fields", &self.additional_fields)
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServiceCatalog {
    specs: BTreeMap<String, ServiceSpec>,
}

impl ServiceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// `echo` and `reverse`.
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        catalog.register("echo", &["message"], &["message"], || Arc::new(EchoService));
        catalog.register("reverse", &["message"], &["message"], || Arc::new(ReverseService));
        catalog
    }

    /// Add (or replace) a service type.
    pub fn register<F>(&mut self, name: &str, required: &[&str], additional: &[&str], factory: F)
    where
        F: Fn() -> Arc<dyn RequestHandler> + Send + Sync + 'static,
    {
        self.specs.insert(
            name.to_string(),
            ServiceSpec {
                name: name.to_string(),
                required_fields: required.iter().map(|s| s.to_string()).collect(),
                additional_fields: additional.iter().map(|s| s.to_string()).collect(),
                factory: Arc::new(factory),
            },
        );
    }

    /// Keep only the listed types. Names missing from the catalog are
    /// logged and skipped.
    pub fn restrict(mut self, names: &[String]) -> Self {
        for name in names {
            if !self.specs.contains_key(name.trim()) {
                warn!(service = %name, "configured service type not in catalog");
            }
        }
        self.specs
            .retain(|name, _| names.iter().any(|wanted| wanted.trim() == name));
        self
    }

    pub fn get(&self, name: &str) -> Option<&ServiceSpec> {
        self.specs.get(name)
    }

    /// Type names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.specs.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

// ── Demonstration services ─────────────────────────────────────────

/// Returns `message` unchanged.
pub struct EchoService;

#[async_trait]
impl RequestHandler for EchoService {
    async fn handle(&self, request: Message, _peer: SocketAddr) -> Result<Message, RequestError> {
        match request.action()? {
            Action::Process => {
                let message: String = request.field("message")?;
                Ok(Message::ok().with("message", message))
            }
            other => Err(RequestError::bad_request(format!(
                "Unknown request action: {other}"
            ))),
        }
    }
}

/// Returns `message` reversed.
pub struct ReverseService;

#[async_trait]
impl RequestHandler for ReverseService {
    async fn handle(&self, request: Message, _peer: SocketAddr) -> Result<Message, RequestError> {
        match request.action()? {
            Action::Process => {
                let message: String = request.field("message")?;
                let reversed: String = message.chars().rev().collect();
                Ok(Message::ok().with("message", reversed))
            }
            other => Err(RequestError::bad_request(format!(
                "Unknown request action: {other}"
            ))),
        }
    }
}
