//! Listeners, interception tunnel and forwarding.
//!
//! This module provides:
//! - HTTP CONNECT handling with TLS interception (client role)
//! - Dynamic certificate issuance for intercepted hosts
//! - A minimal request-head codec for the decrypted tunnel
//! - A full-duplex relay with exactly-once close
//! - Per-request forwarding to the front-end or to origins
//!
//! # Architecture
//!
//! ```text
//!  browser ──CONNECT──▶ client role ──TLS (SNI = masquerade)──▶ CDN front-end
//!                       (intercept,                                  │
//!                        disguise)                                   ▼
//!                                      origin ◀──────────────── server role
//!                                                               (unwrap)
//! ```

pub mod codec;
pub mod error;
pub mod forward;
pub mod intercept;
pub mod relay;
pub mod server;
pub mod tls;

// Re-export main types for convenient access
pub use error::{ProxyError, ProxyResult};
pub use forward::{OriginConnector, ProxyBody};
pub use intercept::{intercept, ConnectTarget};
pub use relay::{relay, RelayStats};
pub use server::ProxyServer;
pub use tls::{create_tls_acceptor, create_tls_connector, CertificateCache};
