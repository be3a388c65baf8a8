//! Error types for proxy operations.
//!
//! This module defines structured error types for the proxy:
//! - Listener errors (binding, accept)
//! - TLS errors (handshakes, certificate resolution)
//! - Connection errors (dialing upstream, reading and writing tunnels)
//! - Request errors (malformed heads, missing destination)
//!
//! None of these are fatal to the process except [`ProxyError::Bind`]; each
//! affects only the connection it happened on.

use crate::ca::CaError;
use thiserror::Error;

/// Unified error type for proxy operations.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// I/O error outside a tunnel (socket setup, accept).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Hyper HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// Request that cannot be proxied.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// TLS error during handshake or configuration.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Issuing an interception certificate failed.
    #[error("Certificate error: {0}")]
    Certificate(#[from] CaError),

    /// Failed to connect to the upstream.
    #[error("Failed to connect to upstream '{addr}': {message}")]
    Dial {
        /// The address we tried to connect to.
        addr: String,
        /// Error message.
        message: String,
    },

    /// Reading from the local side of a tunnel failed.
    #[error("Read error: {0}")]
    Read(#[source] std::io::Error),

    /// Writing to the upstream side of a tunnel failed.
    #[error("Write error: {0}")]
    Write(#[source] std::io::Error),

    /// Binding the listener failed.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        /// The address we tried to listen on.
        addr: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Connection timeout.
    #[error("Connection timeout")]
    Timeout,
}

/// Result type for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

impl From<rustls::Error> for ProxyError {
    fn from(err: rustls::Error) -> Self {
        ProxyError::Tls(err.to_string())
    }
}

impl From<http::Error> for ProxyError {
    fn from(err: http::Error) -> Self {
        ProxyError::InvalidRequest(err.to_string())
    }
}

impl From<http::uri::InvalidUri> for ProxyError {
    fn from(err: http::uri::InvalidUri) -> Self {
        ProxyError::InvalidRequest(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for ProxyError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ProxyError::Timeout
    }
}

impl ProxyError {
    /// Whether this is a routine disconnect rather than something worth a warning.
    pub fn is_disconnect(&self) -> bool {
        use std::io::ErrorKind;

        let io = match self {
            ProxyError::Io(e) | ProxyError::Read(e) | ProxyError::Write(e) => e,
            ProxyError::Http(e) => return e.is_incomplete_message() || e.is_canceled(),
            _ => return false,
        };
        matches!(
            io.kind(),
            ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::BrokenPipe
                | ErrorKind::UnexpectedEof
        )
    }
}
