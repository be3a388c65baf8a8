//! Client side of the disguise: hide the true destination inside headers and
//! address every request to the front-end.
//!
//! A request for `http://origin.example/path` leaves the client as
//!
//! ```text
//! GET https://<outward host>/path
//! Host: <outward host>
//! X-Lantern-Host: origin.example
//! X-Lantern-Scheme: http
//! ```
//!
//! over a TLS connection to the front-end whose SNI is also the outward host.
//! The outward host is the masquerade when one is configured, otherwise the
//! front-end hostname itself.

use super::headers::Disguise;
use crate::config::UpstreamSettings;
use crate::proxy::error::{ProxyError, ProxyResult};
use crate::proxy::tls::domain_to_server_name;
use http::header::{HeaderValue, HOST};
use http::uri::{Authority, Scheme};
use http::{Request, Uri};
use rustls_pki_types::ServerName;
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

/// Opens connections toward the upstream.
///
/// The production implementation is [`FrontEndDialer`]; tests substitute
/// in-memory streams.
pub trait Dialer: Send + Sync + 'static {
    /// The connection type produced.
    type Conn: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open a connection on behalf of a request for `addr`.
    fn dial(&self, addr: &str) -> impl Future<Output = ProxyResult<Self::Conn>> + Send;
}

/// Dials the configured front-end over TLS regardless of the requested
/// address.
pub struct FrontEndDialer {
    address: String,
    server_name: ServerName<'static>,
    connector: TlsConnector,
    connect_timeout: Duration,
}

impl FrontEndDialer {
    /// Dial `upstream`'s front-end, presenting its outward host as SNI.
    pub fn new(
        upstream: &UpstreamSettings,
        connector: TlsConnector,
        connect_timeout: Duration,
    ) -> ProxyResult<Self> {
        Ok(Self {
            address: upstream.address(),
            server_name: domain_to_server_name(upstream.outward_host())?,
            connector,
            connect_timeout,
        })
    }

    fn dial_error(&self, message: impl ToString) -> ProxyError {
        ProxyError::Dial {
            addr: self.address.clone(),
            message: message.to_string(),
        }
    }
}

impl Dialer for FrontEndDialer {
    type Conn = TlsStream<TcpStream>;

    async fn dial(&self, addr: &str) -> ProxyResult<Self::Conn> {
        debug!(
            "Dialing front-end {} (sni {:?}) for {}",
            self.address, self.server_name, addr
        );

        let tcp = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| self.dial_error("connect timed out"))?
            .map_err(|e| self.dial_error(e))?;
        // Requests are small and latency-sensitive.
        tcp.set_nodelay(true).map_err(|e| self.dial_error(e))?;

        let tls = tokio::time::timeout(
            self.connect_timeout,
            self.connector.connect(self.server_name.clone(), tcp),
        )
        .await
        .map_err(|_| self.dial_error("TLS handshake timed out"))?
        .map_err(|e| self.dial_error(format!("TLS handshake failed: {}", e)))?;

        trace!("Connected to front-end {}", self.address);
        Ok(tls)
    }
}

/// The client variant of the disguise protocol.
pub struct ClientProtocol<D = FrontEndDialer> {
    upstream: UpstreamSettings,
    dialer: D,
}

impl ClientProtocol<FrontEndDialer> {
    /// Build the production protocol for `upstream`.
    pub fn new(
        upstream: UpstreamSettings,
        connector: TlsConnector,
        connect_timeout: Duration,
    ) -> ProxyResult<Self> {
        let dialer = FrontEndDialer::new(&upstream, connector, connect_timeout)?;
        Ok(Self { upstream, dialer })
    }
}

impl<D: Dialer> ClientProtocol<D> {
    /// Build the protocol around a custom dialer.
    pub fn with_dialer(upstream: UpstreamSettings, dialer: D) -> Self {
        Self { upstream, dialer }
    }

    /// The upstream this protocol targets.
    pub fn upstream(&self) -> &UpstreamSettings {
        &self.upstream
    }

    /// Disguise `req` as a request to the outward host.
    pub fn rewrite<B>(&self, req: &mut Request<B>) -> ProxyResult<()> {
        disguise(req, self.upstream.outward_host())
    }

    /// Connect to the upstream on behalf of a request for `addr`.
    pub async fn dial(&self, addr: &str) -> ProxyResult<D::Conn> {
        self.dialer.dial(addr).await
    }
}

/// Record the true destination of `req` in the disguise headers and point the
/// request at `outward_host`.
///
/// Requests that already carry a disguise are left as they are.
pub fn disguise<B>(req: &mut Request<B>, outward_host: &str) -> ProxyResult<()> {
    if Disguise::is_present(req.headers()) {
        trace!("Request already disguised, leaving it unchanged");
        return Ok(());
    }

    let disguise = Disguise {
        host: true_host(req)?,
        scheme: req.uri().scheme().cloned().unwrap_or(Scheme::HTTP),
    };
    disguise
        .encode(req.headers_mut())
        .map_err(|e| ProxyError::InvalidRequest(format!("bad destination host: {}", e)))?;

    let path = req
        .uri()
        .path_and_query()
        .map_or("/", |pq| pq.as_str())
        .to_string();
    *req.uri_mut() = Uri::builder()
        .scheme(Scheme::HTTPS)
        .authority(outward_host)
        .path_and_query(path)
        .build()?;

    let host = HeaderValue::from_str(outward_host)
        .map_err(|e| ProxyError::InvalidRequest(format!("bad outward host: {}", e)))?;
    req.headers_mut().insert(HOST, host);

    debug!(
        "Disguised {}://{} as {}",
        disguise.scheme, disguise.host, outward_host
    );
    Ok(())
}

/// Destination authority: from the URI, else the `Host` header.
fn true_host<B>(req: &Request<B>) -> ProxyResult<String> {
    if let Some(authority) = req.uri().authority() {
        return Ok(host_and_port(authority));
    }

    req.headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ProxyError::InvalidRequest("request has no destination host".into()))
}

/// `host[:port]` without any userinfo.
fn host_and_port(authority: &Authority) -> String {
    match authority.port_u16() {
        Some(port) => format!("{}:{}", authority.host(), port),
        None => authority.host().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::headers::{X_LANTERN_HOST, X_LANTERN_SCHEME};

    fn request(uri: &str) -> Request<()> {
        Request::builder().uri(uri).body(()).unwrap()
    }

    #[test]
    fn test_disguise_absolute_uri() {
        let mut req = request("http://origin.example/path?q=1");
        disguise(&mut req, "cdn.example.com").unwrap();

        assert_eq!(req.uri(), "https://cdn.example.com/path?q=1");
        assert_eq!(req.headers()[HOST], "cdn.example.com");
        assert_eq!(req.headers()[X_LANTERN_HOST], "origin.example");
        assert_eq!(req.headers()[X_LANTERN_SCHEME], "http");
    }

    #[test]
    fn test_disguise_keeps_port_drops_userinfo() {
        let mut req = request("https://user:pw@origin.example:8443/");
        disguise(&mut req, "cdn.example.com").unwrap();

        assert_eq!(req.headers()[X_LANTERN_HOST], "origin.example:8443");
        assert_eq!(req.headers()[X_LANTERN_SCHEME], "https");
    }

    #[test]
    fn test_disguise_origin_form_uses_host_header() {
        let mut req = Request::builder()
            .uri("/index.html")
            .header(HOST, "origin.example")
            .body(())
            .unwrap();
        disguise(&mut req, "front.example.net").unwrap();

        assert_eq!(req.uri(), "https://front.example.net/index.html");
        assert_eq!(req.headers()[X_LANTERN_HOST], "origin.example");
        assert_eq!(req.headers()[X_LANTERN_SCHEME], "http");
    }

    #[test]
    fn test_disguise_without_destination_fails() {
        let mut req = request("/index.html");
        assert!(matches!(
            disguise(&mut req, "cdn.example.com"),
            Err(ProxyError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_disguise_is_idempotent() {
        let mut req = request("http://origin.example/a");
        disguise(&mut req, "cdn.example.com").unwrap();
        let once = req.uri().clone();
        let headers_once = req.headers().clone();

        disguise(&mut req, "cdn.example.com").unwrap();

        assert_eq!(req.uri(), &once);
        assert_eq!(req.headers(), &headers_once);
        assert_eq!(req.headers().get_all(X_LANTERN_HOST).iter().count(), 1);
    }

    #[test]
    fn test_protocol_uses_masquerade_when_set() {
        struct NoDial;
        impl Dialer for NoDial {
            type Conn = tokio::io::DuplexStream;
            async fn dial(&self, addr: &str) -> ProxyResult<Self::Conn> {
                Err(ProxyError::Dial {
                    addr: addr.to_string(),
                    message: "unused".to_string(),
                })
            }
        }

        let upstream = UpstreamSettings {
            host: "proxy.example.net".to_string(),
            port: 443,
            masquerade: Some("cdn.example.com".to_string()),
            ca_file: None,
        };
        let protocol = ClientProtocol::with_dialer(upstream, NoDial);

        let mut req = request("http://origin.example/");
        protocol.rewrite(&mut req).unwrap();
        assert_eq!(req.headers()[HOST], "cdn.example.com");
    }
}
