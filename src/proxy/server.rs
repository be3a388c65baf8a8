//! Listener and per-connection handling for both roles.
//!
//! This module provides the main proxy server that:
//! - Listens on TCP, plaintext for the client role and TLS for the server role
//! - Hands CONNECT requests to the interception tunnel (client role)
//! - Disguises and forwards plain HTTP requests (client role)
//! - Unwraps disguised requests and forwards them to origins (server role)
//!
//! # Architecture
//!
//! The proxy uses hyper's HTTP/1.1 server with upgrade support for CONNECT.
//! Each connection is handled in a separate Tokio task. Failures answer the
//! request with a `502` (or `400` for requests that cannot be proxied) and
//! never affect other connections.
//!
//! # Example
//!
//! ```ignore
//! use fronting_proxy::proxy::ProxyServer;
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let server = ProxyServer::new(&settings, credentials, shutdown_rx)?;
//! server.run().await?;
//!
//! // To shutdown:
//! shutdown_tx.send(true)?;
//! ```

use super::error::{ProxyError, ProxyResult};
use super::forward::{bad_gateway, error_response, send_request, OriginConnector, ProxyBody};
use super::intercept::handle_connect;
use super::tls::{
    connector_for_roots, create_server_acceptor, create_tls_connector, CertificateCache,
};
use crate::ca::Credentials;
use crate::config::{Mode, Settings, Timeouts};
use crate::protocol::{ClientProtocol, Disguise, ServerProtocol};
use http::StatusCode;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::{TokioIo, TokioTimer};
use rustls::RootCertStore;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// What a connection is served with, per role.
enum RoleHandler {
    Client {
        protocol: Arc<ClientProtocol>,
        cert_cache: Arc<CertificateCache>,
    },
    Server {
        acceptor: TlsAcceptor,
        origin: Arc<OriginConnector>,
    },
}

/// The main proxy server.
pub struct ProxyServer {
    listen_addr: String,
    timeouts: Timeouts,
    handler: Arc<RoleHandler>,
    /// Shutdown signal receiver.
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    /// Create a new proxy server for `settings`.
    ///
    /// # Arguments
    ///
    /// * `settings` - Validated runtime settings.
    /// * `credentials` - Credentials from bootstrap.
    /// * `shutdown_rx` - Receiver for shutdown signal.
    pub fn new(
        settings: &Settings,
        credentials: Arc<Credentials>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> ProxyResult<Self> {
        let timeouts = settings.timeouts;
        let handler = match &settings.mode {
            Mode::Client(upstream) => {
                let connector = create_tls_connector(upstream.ca_file.as_deref())?;
                let protocol = ClientProtocol::new(upstream.clone(), connector, timeouts.read)?;
                RoleHandler::Client {
                    protocol: Arc::new(protocol),
                    cert_cache: Arc::new(CertificateCache::new(credentials)),
                }
            }
            Mode::Server { .. } => {
                let connector = create_tls_connector(None).unwrap_or_else(|e| {
                    warn!("{}; only plain HTTP origins will be reachable", e);
                    connector_for_roots(RootCertStore::empty())
                });
                RoleHandler::Server {
                    acceptor: create_server_acceptor(&credentials)?,
                    origin: Arc::new(OriginConnector::new(connector, timeouts.read)),
                }
            }
        };

        Ok(Self {
            listen_addr: settings.listen_addr.clone(),
            timeouts,
            handler: Arc::new(handler),
            shutdown_rx,
        })
    }

    /// Bind the configured listen address.
    pub async fn bind(&self) -> ProxyResult<TcpListener> {
        TcpListener::bind(&self.listen_addr)
            .await
            .map_err(|source| ProxyError::Bind {
                addr: self.listen_addr.clone(),
                source,
            })
    }

    /// Bind and run until the shutdown signal is received.
    pub async fn run(self) -> ProxyResult<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until the shutdown signal is received.
    ///
    /// Connections already accepted keep running to completion.
    pub async fn serve(self, listener: TcpListener) -> ProxyResult<()> {
        let role = match self.handler.as_ref() {
            RoleHandler::Client { .. } => "client",
            RoleHandler::Server { .. } => "server",
        };
        info!("Proxy ({} role) listening on {}", role, listener.local_addr()?);

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => {
                            debug!("Accepted connection from {}", peer);
                            self.spawn_connection_handler(stream, peer);
                        }
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    // A dropped sender can never signal again; treat it as shutdown.
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Proxy shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Spawn a task to handle a single connection.
    fn spawn_connection_handler(&self, stream: TcpStream, peer: SocketAddr) {
        let handler = self.handler.clone();
        let timeouts = self.timeouts;

        tokio::spawn(async move {
            let result = match handler.as_ref() {
                RoleHandler::Client {
                    protocol,
                    cert_cache,
                } => serve_client(stream, protocol.clone(), cert_cache.clone(), timeouts).await,
                RoleHandler::Server { acceptor, origin } => {
                    serve_server(stream, acceptor, origin.clone(), timeouts).await
                }
            };

            match result {
                Ok(()) => debug!("Connection from {} closed", peer),
                Err(e) if e.is_disconnect() => debug!("Connection from {} ended: {}", peer, e),
                Err(e) => warn!("Connection from {} failed: {}", peer, e),
            }
        });
    }
}

/// Serve HTTP/1.1 on `io` with upgrades and a header-read timeout.
async fn serve_http<I, F, Fut>(io: I, timeouts: Timeouts, handle: F) -> ProxyResult<()>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    F: Fn(Request<Incoming>) -> Fut + Send + 'static,
    Fut: Future<Output = Response<ProxyBody>> + Send + 'static,
{
    let service = service_fn(move |req| {
        let response = handle(req);
        async move { Ok::<_, Infallible>(response.await) }
    });

    http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .timer(TokioTimer::new())
        .header_read_timeout(timeouts.read)
        .serve_connection(TokioIo::new(io), service)
        .with_upgrades()
        .await
        .map_err(ProxyError::from)
}

/// Client role: plaintext HTTP proxy listener.
async fn serve_client(
    stream: TcpStream,
    protocol: Arc<ClientProtocol>,
    cert_cache: Arc<CertificateCache>,
    timeouts: Timeouts,
) -> ProxyResult<()> {
    serve_http(stream, timeouts, move |req| {
        let protocol = protocol.clone();
        let cert_cache = cert_cache.clone();
        async move {
            client_request(req, protocol, cert_cache, timeouts)
                .await
                .unwrap_or_else(|e| failure_response(&e))
        }
    })
    .await
}

/// Process a single request on the client role's listener.
async fn client_request(
    mut req: Request<Incoming>,
    protocol: Arc<ClientProtocol>,
    cert_cache: Arc<CertificateCache>,
    timeouts: Timeouts,
) -> ProxyResult<Response<ProxyBody>> {
    if req.method() == Method::CONNECT {
        // HTTPS tunneling via CONNECT
        return handle_connect(req, protocol, cert_cache, timeouts);
    }

    protocol.rewrite(&mut req)?;
    let destination = Disguise::decode(req.headers())
        .map(|d| d.host)
        .unwrap_or_default();
    debug!("HTTP proxy request to {}", destination);

    let conn = protocol.dial(&destination).await?;
    send_request(conn, req, timeouts.write).await
}

/// Server role: TLS listener receiving disguised requests from the front-end.
async fn serve_server(
    stream: TcpStream,
    acceptor: &TlsAcceptor,
    origin: Arc<OriginConnector>,
    timeouts: Timeouts,
) -> ProxyResult<()> {
    let tls = tokio::time::timeout(timeouts.read, acceptor.accept(stream))
        .await?
        .map_err(|e| ProxyError::Tls(format!("Client TLS handshake failed: {}", e)))?;

    serve_http(tls, timeouts, move |req| {
        let origin = origin.clone();
        async move {
            server_request(req, &origin, timeouts)
                .await
                .unwrap_or_else(|e| failure_response(&e))
        }
    })
    .await
}

/// Process a single request on the server role's listener.
async fn server_request(
    mut req: Request<Incoming>,
    origin: &OriginConnector,
    timeouts: Timeouts,
) -> ProxyResult<Response<ProxyBody>> {
    ServerProtocol.rewrite(&mut req)?;
    origin.forward(req, timeouts.write).await
}

/// Response sent when a request could not be proxied.
fn failure_response(err: &ProxyError) -> Response<ProxyBody> {
    match err {
        ProxyError::InvalidRequest(message) => {
            debug!("Rejecting request: {}", message);
            error_response(StatusCode::BAD_REQUEST, &err.to_string())
        }
        _ => {
            warn!("Upstream failure: {}", err);
            bad_gateway(err)
        }
    }
}
