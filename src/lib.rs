//! A client-side gRPC channel: name resolution, load balancing, and the
//! per-call pick/queue pipeline that sits between an application's call API
//! and the transport-level connections to individual backends.
//!
//! The wire transport, concrete resolvers (DNS, xDS, ...), and concrete LB
//! policies beyond `pick_first`/`round_robin` are collaborators with
//! documented contracts, not implementations this crate owns.

pub mod client;
pub mod rt;
pub mod server;
pub mod service;
pub mod service_config;
pub mod status;

pub mod credentials;

pub mod attributes;

pub mod inmemory;

pub use status::{Code, Status};
