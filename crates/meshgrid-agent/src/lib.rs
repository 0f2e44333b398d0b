//! meshgrid-agent: hosts service instances for a meshgrid Manager.
//!
//! An [`Agent`] binds its own listener, registers with the Manager and
//! keeps the registration socket as its control channel. Over it the
//! Manager sends lifecycle commands:
//!
//! - `run`: start an instance from the [`ServiceCatalog`]
//! - `closeService`: stop it, reporting CLOSING then CLOSED
//! - `testServiceConnection` / `reconnectService`: data channel upkeep
//!
//! When the Manager loses the control channel it dials the agent's
//! listener and sends `renewConnection` as the first frame.
//!
//! [`DiscoveryClient`] is the gateway side: discover, call, renew.

pub mod agent;
pub mod catalog;
pub mod discovery;
pub mod error;

pub use agent::{Agent, RunningAgent};
pub use catalog::{EchoService, HandlerFactory, ReverseService, ServiceCatalog, ServiceSpec};
pub use discovery::DiscoveryClient;
pub use error::{AgentError, AgentResult};
