//! meshgrid-transport: persistent framed channels between meshgrid nodes.
//!
//! Every socket carries a stream of JSON objects (see [`codec`]). On top of
//! that:
//!
//! - [`Connection`]: client side request/response, one exchange at a time
//! - [`ConnectionWorker`]: long-lived bidirectional channel with a reader
//!   task; used for manager↔agent control and agent↔service data channels
//! - [`Service`]: listener that serves each accepted socket on its own task
//!   and, in control-plane mode, upgrades first frames into channels
//!
//! # Architecture
//!
//! ```text
//! Service (accept loop)
//!   └── per connection task
//!       ├── plain request  → RequestHandler → response
//!       └── channel request → ChannelAcceptor → ConnectionWorker
//! ```

pub mod codec;
pub mod connection;
pub mod error;
pub mod handler;
pub mod service;
pub mod worker;

pub use codec::{JsonCodec, JsonFramed};
pub use connection::Connection;
pub use error::{TransportError, TransportResult};
pub use handler::{RefuseRequests, RequestHandler, dispatch};
pub use service::{ChannelAcceptor, ChannelGrant, ServeMode, Service, ServiceHandle, open_channel};
pub use worker::ConnectionWorker;
