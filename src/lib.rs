//! Flowgate — a firewall network-function endpoint.
//!
//! Single Rust binary. Sits in the data-plane connection path: accepts a
//! connection request, programs ACL filtering and interfaces into a
//! user-space forwarding engine, and forwards the request to the next hop.
//!
//! See `DESIGN.md` for full architecture documentation.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Crate version, logged at startup.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod acl;
pub mod chain;
pub mod config;
pub mod dataplane;
pub mod endpoint;
pub mod lifecycle;
pub mod logging;
pub mod registry;
pub mod stages;
pub mod transport;
pub mod types;
