//! The host-rewriting protocol that disguises proxied requests as requests to
//! a CDN front-end.
//!
//! The client role applies [`ClientProtocol::rewrite`] before sending a
//! request to the front-end; the server role applies
//! [`ServerProtocol::rewrite`] to what arrives. For any request carrying a
//! destination the two are exact inverses:
//!
//! ```text
//! client:  GET http://origin.example/p         GET https://cdn.example.com/p
//!          Host: origin.example           ->   Host: cdn.example.com
//!                                              X-Lantern-Host: origin.example
//!                                              X-Lantern-Scheme: http
//!
//! server:  GET /p                              GET http://origin.example/p
//!          Host: cdn.example.com          ->   Host: origin.example
//!          X-Lantern-Host: origin.example
//!          X-Lantern-Scheme: http
//! ```

pub mod client;
pub mod headers;
pub mod server;

pub use client::{disguise, ClientProtocol, Dialer, FrontEndDialer};
pub use headers::{Disguise, HeaderNamespace};
pub use server::ServerProtocol;
