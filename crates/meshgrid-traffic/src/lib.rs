//! meshgrid-traffic: per-service-type traffic tracking.
//!
//! The Manager records one request per `askForService` and runs the
//! tracker's tick loop. A service type whose request count grew by the
//! invoke ratio since the previous window gets one more instance.

pub mod tracker;

pub use tracker::{BoxFuture, InvokeCallback, TrafficCounter, TrafficTracker};
