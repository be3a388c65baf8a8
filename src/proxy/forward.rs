//! Forwarding a single request over a freshly dialed connection.
//!
//! Used by the plain-HTTP path of the client role (connection to the
//! front-end) and by the server role (connection to the origin). Each request
//! gets its own connection; hop-by-hop headers are stripped on the way out
//! and on the way back.

use super::error::{ProxyError, ProxyResult};
use super::tls::domain_to_server_name;
use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_TYPE};
use http::uri::Scheme;
use http::{Request, Response, StatusCode, Uri};
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Body;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use std::collections::HashSet;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

/// Response body type produced by every handler.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Remove hop-by-hop headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let mut blocked: HashSet<HeaderName> = HOP_BY_HOP_HEADERS
        .iter()
        .map(|h| HeaderName::from_static(h))
        .collect();

    for value in headers.get_all(CONNECTION) {
        let Ok(raw) = value.to_str() else {
            continue;
        };
        for token in raw.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            if let Ok(name) = HeaderName::from_bytes(token.to_ascii_lowercase().as_bytes()) {
                blocked.insert(name);
            }
        }
    }

    for name in blocked {
        headers.remove(name);
    }
}

/// Send `req` over `conn` and return the response.
///
/// The request line is written in origin-form. The exchange (up to the
/// response head) is bounded by `exchange_timeout`; the response body streams
/// afterwards.
pub async fn send_request<C, B>(
    conn: C,
    mut req: Request<B>,
    exchange_timeout: Duration,
) -> ProxyResult<Response<ProxyBody>>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    strip_hop_by_hop(req.headers_mut());
    let target = req
        .uri()
        .path_and_query()
        .map_or("/", |pq| pq.as_str())
        .to_string();
    *req.uri_mut() = Uri::try_from(target)?;

    let (mut sender, connection) = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .handshake(TokioIo::new(conn))
        .await?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!("Upstream connection ended: {}", e);
        }
    });

    let mut response = tokio::time::timeout(exchange_timeout, sender.send_request(req)).await??;
    strip_hop_by_hop(response.headers_mut());
    trace!("Upstream answered {}", response.status());

    Ok(response.map(|body| body.boxed()))
}

/// Dials origins on behalf of the server role.
pub struct OriginConnector {
    tls: TlsConnector,
    connect_timeout: Duration,
}

impl OriginConnector {
    /// Create a connector verifying origins with `tls`.
    pub fn new(tls: TlsConnector, connect_timeout: Duration) -> Self {
        Self {
            tls,
            connect_timeout,
        }
    }

    /// Dial the origin named by `req`'s URI and forward `req` to it.
    pub async fn forward<B>(
        &self,
        req: Request<B>,
        exchange_timeout: Duration,
    ) -> ProxyResult<Response<ProxyBody>>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let authority = req
            .uri()
            .authority()
            .ok_or_else(|| ProxyError::InvalidRequest("request has no destination".into()))?;
        let host = authority.host().trim_start_matches('[').trim_end_matches(']').to_string();
        let secure = req.uri().scheme() == Some(&Scheme::HTTPS);
        let port = authority.port_u16().unwrap_or(if secure { 443 } else { 80 });
        let addr = format!("{}:{}", authority.host(), port);

        let dial_error = |message: String| ProxyError::Dial {
            addr: addr.clone(),
            message,
        };

        debug!("Forwarding to origin {} (tls={})", addr, secure);
        let tcp = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| dial_error("connect timed out".into()))?
            .map_err(|e| dial_error(e.to_string()))?;

        if !secure {
            return send_request(tcp, req, exchange_timeout).await;
        }

        let server_name = domain_to_server_name(&host)?;
        let tls = tokio::time::timeout(self.connect_timeout, self.tls.connect(server_name, tcp))
            .await
            .map_err(|_| dial_error("TLS handshake timed out".into()))?
            .map_err(|e| dial_error(format!("TLS handshake failed: {}", e)))?;
        send_request(tls, req, exchange_timeout).await
    }
}

/// Create an empty response body.
pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

/// Create a response body with content.
pub fn full_body(content: String) -> ProxyBody {
    Full::new(Bytes::from(content))
        .map_err(|never| match never {})
        .boxed()
}

/// A plain-text error response that closes the connection.
pub fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(format!("{}\n", message)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("close"));
    response
}

/// A `502 Bad Gateway` carrying the error text.
pub fn bad_gateway(err: &ProxyError) -> Response<ProxyBody> {
    error_response(StatusCode::BAD_GATEWAY, &err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("origin.example"));
        headers.insert("connection", HeaderValue::from_static("keep-alive, X-Trace"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("proxy-connection", HeaderValue::from_static("keep-alive"));
        headers.insert("x-trace", HeaderValue::from_static("1"));
        headers.insert("x-lantern-host", HeaderValue::from_static("origin.example"));

        strip_hop_by_hop(&mut headers);

        assert!(headers.contains_key("host"));
        assert!(headers.contains_key("x-lantern-host"));
        assert!(!headers.contains_key("connection"));
        assert!(!headers.contains_key("keep-alive"));
        assert!(!headers.contains_key("proxy-connection"));
        assert!(!headers.contains_key("x-trace"));
    }

    #[tokio::test]
    async fn test_bad_gateway_response() {
        let err = ProxyError::Dial {
            addr: "proxy.example.net:443".into(),
            message: "connection refused".into(),
        };
        let response = bad_gateway(&err);

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers()[CONNECTION], "close");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&body).contains("connection refused"));
    }

    #[tokio::test]
    async fn test_send_request_uses_origin_form() {
        let (client, mut server) = tokio::io::duplex(4096);

        let upstream = tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let mut seen = Vec::new();
            while !seen.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = server.read(&mut buf).await.unwrap();
                seen.extend_from_slice(&buf[..n]);
            }
            server
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nKeep-Alive: timeout=5\r\n\r\nok")
                .await
                .unwrap();
            String::from_utf8(seen).unwrap()
        });

        let req = Request::builder()
            .uri("https://cdn.example.com/path?q=1")
            .header("host", "cdn.example.com")
            .header("proxy-connection", "keep-alive")
            .body(empty_body())
            .unwrap();
        let response = send_request(client, req, Duration::from_secs(5)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(!response.headers().contains_key("keep-alive"));
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");

        let head = upstream.await.unwrap();
        assert!(head.starts_with("GET /path?q=1 HTTP/1.1\r\n"));
        assert!(head.contains("Host: cdn.example.com\r\n"));
        assert!(!head.to_ascii_lowercase().contains("proxy-connection"));
    }
}
