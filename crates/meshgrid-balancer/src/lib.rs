//! meshgrid-balancer: load balancing for discovery requests.
//!
//! The Manager owns one [`LoadBalancer`] and consults it for every
//! `askForService`:
//!
//! - a running instance of the type, if any ([`LoadBalancer::select_instance`])
//! - otherwise an agent that can start one ([`LoadBalancer::select_agent`])
//!
//! [`RoundRobinBalancer`] walks both lists with lock-free [`Cursor`]s in
//! strict insertion order.

pub mod balancer;
pub mod cursor;
pub mod error;

pub use balancer::{LoadBalancer, RoundRobinBalancer};
pub use cursor::Cursor;
pub use error::{BalancerError, BalancerResult};
