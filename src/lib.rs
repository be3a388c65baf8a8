//! fronting-proxy: a domain-fronting forward proxy
//!
//! The same binary runs in one of two roles. The **client** role is a local
//! HTTP proxy: it intercepts CONNECT tunnels with its own CA, hides each
//! request's true destination in headers and sends it over TLS to a CDN
//! front-end, presenting an innocuous hostname. The **server** role sits
//! behind the front-end, restores the true destination and forwards the
//! request to the origin.
//!
//! # Architecture
//!
//! - **CA**: Persistent key, CA and server certificate with expiry-driven renewal
//! - **Protocol**: The disguise header scheme shared by both roles
//! - **Proxy**: Listeners, interception tunnel, relay and forwarding
//! - **Config**: Layered TOML configuration and CLI flags
//! - **Bootstrap**: Startup ordering and shutdown

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod bootstrap;
pub mod ca;
pub mod cli;
pub mod config;
pub mod protocol;
pub mod proxy;
