//! CONNECT interception tunnel (client role).
//!
//! The flow for each CONNECT is:
//!
//! 1. Client sends: `CONNECT origin.example:443 HTTP/1.1`
//! 2. Proxy answers `200` and takes over the upgraded connection
//! 3. TLS is accepted locally with a leaf issued for the CONNECT host, while
//!    the front-end is dialed concurrently
//! 4. Request heads are decoded, disguised and written upstream
//! 5. Once the buffered requests are out, bytes are relayed opaquely
//!
//! If the front-end cannot be reached, or the decode phase fails, the local
//! client gets a `502 Bad Gateway` and the connection is closed.

use super::codec::{
    bad_gateway_bytes, body_length, encode_head, parse_head, read_head, BodyLength,
};
use super::error::{ProxyError, ProxyResult};
use super::forward::{empty_body, ProxyBody};
use super::relay::{relay, RelayStats};
use super::tls::{create_tls_acceptor, CertificateCache};
use crate::config::Timeouts;
use crate::protocol::{ClientProtocol, Dialer};
use bytes::{Buf, BytesMut};
use http::uri::Scheme;
use http::{Request, Response, Uri};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace, warn};

const HTTPS_PORT: u16 = 443;
const INITIAL_BUFFER: usize = 8 * 1024;

/// Destination named by a CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    host: String,
    port: u16,
}

impl ConnectTarget {
    /// Parse a CONNECT authority.
    ///
    /// Examples:
    /// - `api.example.com:443` -> ("api.example.com", 443)
    /// - `api.example.com` -> ("api.example.com", 443) (default port)
    /// - `[::1]:8443` -> ("::1", 8443)
    pub fn parse(authority: &str) -> ProxyResult<Self> {
        let invalid_port =
            |port: &str| ProxyError::InvalidRequest(format!("Invalid CONNECT port: {}", port));

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) if host.starts_with('[') && host.ends_with(']') => (
                &host[1..host.len() - 1],
                port.parse::<u16>().map_err(|_| invalid_port(port))?,
            ),
            // A bare IPv6 address has more than one colon and no brackets.
            Some((host, port)) if !host.contains(':') => {
                (host, port.parse::<u16>().map_err(|_| invalid_port(port))?)
            }
            _ => (authority.trim_start_matches('[').trim_end_matches(']'), HTTPS_PORT),
        };

        if host.is_empty() {
            return Err(ProxyError::InvalidRequest(
                "Missing host in CONNECT request".into(),
            ));
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    /// Host without brackets.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port, 443 when the CONNECT named none.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Authority for the rewritten request URI; the port is left out when it
    /// is 443.
    pub fn authority(&self) -> String {
        let host = self.bracketed_host();
        if self.port == HTTPS_PORT {
            host
        } else {
            format!("{}:{}", host, self.port)
        }
    }

    fn bracketed_host(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }
}

impl fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.bracketed_host(), self.port)
    }
}

/// Handle a CONNECT request.
///
/// Answers `200` right away; the tunnel itself runs in its own task once
/// hyper hands over the upgraded connection.
pub fn handle_connect<D: Dialer>(
    req: Request<Incoming>,
    protocol: Arc<ClientProtocol<D>>,
    cert_cache: Arc<CertificateCache>,
    timeouts: Timeouts,
) -> ProxyResult<Response<ProxyBody>> {
    let authority = req
        .uri()
        .authority()
        .ok_or_else(|| ProxyError::InvalidRequest("Missing authority in CONNECT request".into()))?;
    let target = ConnectTarget::parse(authority.as_str())?;
    debug!("CONNECT request to {}", target);

    let acceptor = create_tls_acceptor(cert_cache, Some(target.host().to_string()));

    tokio::spawn(async move {
        let upgraded = match hyper::upgrade::on(req).await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                warn!("HTTP upgrade failed for {}: {}", target, e);
                return;
            }
        };

        let accept = async {
            let handshake =
                tokio::time::timeout(timeouts.read, acceptor.accept(TokioIo::new(upgraded))).await;
            match handshake {
                Ok(Ok(tls)) => Ok(tls),
                Ok(Err(e)) => Err(ProxyError::Tls(format!("Client TLS handshake failed: {}", e))),
                Err(_) => Err(ProxyError::Timeout),
            }
        };

        match intercept(accept, &target, &protocol, timeouts).await {
            Ok(stats) => debug!(
                "Tunnel for {} closed ({} bytes up, {} bytes down)",
                target, stats.local_to_upstream, stats.upstream_to_local
            ),
            Err(e) if e.is_disconnect() => debug!("Tunnel for {} ended: {}", target, e),
            Err(e) => warn!("Tunnel for {} failed: {}", target, e),
        }
    });

    Ok(Response::new(empty_body()))
}

/// Run one interception tunnel.
///
/// `accept` yields the decrypted local connection; the upstream is dialed
/// concurrently with it. Returns the bytes moved once both sides are closed.
pub async fn intercept<L, A, D>(
    accept: A,
    target: &ConnectTarget,
    protocol: &ClientProtocol<D>,
    timeouts: Timeouts,
) -> ProxyResult<RelayStats>
where
    A: Future<Output = ProxyResult<L>>,
    L: AsyncRead + AsyncWrite + Unpin,
    D: Dialer,
{
    let addr = target.to_string();
    let (local, upstream) = tokio::join!(accept, protocol.dial(&addr));
    let mut local = local?;
    let mut upstream = match upstream {
        Ok(upstream) => upstream,
        Err(e) => {
            fail(&mut local, &e, timeouts.write).await;
            return Err(e);
        }
    };
    debug!("Tunnel for {} established", target);

    let mut buf = BytesMut::with_capacity(INITIAL_BUFFER);
    let sent = match forward_requests(
        &mut local,
        &mut upstream,
        &mut buf,
        target,
        protocol,
        timeouts.idle,
    )
    .await
    {
        Ok(Some(sent)) => sent,
        Ok(None) => {
            trace!("Client closed tunnel for {} before any request", target);
            let _ = upstream.shutdown().await;
            let _ = local.shutdown().await;
            return Ok(RelayStats::default());
        }
        Err(e) => {
            let _ = upstream.shutdown().await;
            fail(&mut local, &e, timeouts.write).await;
            return Err(e);
        }
    };

    let mut stats = relay(local, upstream, timeouts.idle).await;
    stats.local_to_upstream += sent;
    Ok(stats)
}

/// Decode, disguise and send every request already available, then any
/// leftover buffered bytes.
///
/// Returns `None` on a clean EOF before the first request, otherwise the
/// number of bytes written upstream.
async fn forward_requests<L, U, D>(
    local: &mut L,
    upstream: &mut U,
    buf: &mut BytesMut,
    target: &ConnectTarget,
    protocol: &ClientProtocol<D>,
    idle: Duration,
) -> ProxyResult<Option<u64>>
where
    L: AsyncRead + Unpin,
    U: AsyncWrite + Unpin,
    D: Dialer,
{
    let Some(first) = read_head(local, buf, idle).await? else {
        return Ok(None);
    };

    let mut out = BytesMut::new();
    let mut sent = 0u64;
    let mut next = Some(first);

    while let Some(head) = next.take() {
        let length = prepare(head, target, protocol, &mut out)?;
        upstream.write_all(&out).await.map_err(ProxyError::Write)?;
        sent += out.len() as u64;
        out.clear();

        match length {
            BodyLength::Empty => {}
            BodyLength::Fixed(len) => {
                copy_body(local, upstream, buf, len, idle).await?;
                sent += len;
            }
            // The rest of a chunked body goes through the relay untouched.
            BodyLength::Chunked => break,
        }

        if let Some((len, request)) = parse_head(buf)? {
            trace!("Pipelined request for {}", target);
            buf.advance(len);
            next = Some(request);
        }
    }

    if !buf.is_empty() {
        upstream.write_all(&buf[..]).await.map_err(ProxyError::Write)?;
        sent += buf.len() as u64;
        buf.clear();
    }
    upstream.flush().await.map_err(ProxyError::Write)?;

    Ok(Some(sent))
}

/// Point `head` at the CONNECT target, disguise it and encode it into `out`.
fn prepare<D: Dialer>(
    mut head: Request<()>,
    target: &ConnectTarget,
    protocol: &ClientProtocol<D>,
    out: &mut BytesMut,
) -> ProxyResult<BodyLength> {
    let length = body_length(head.headers())?;
    let path = head
        .uri()
        .path_and_query()
        .map_or("/", |pq| pq.as_str())
        .to_string();
    *head.uri_mut() = Uri::builder()
        .scheme(Scheme::HTTPS)
        .authority(target.authority().as_str())
        .path_and_query(path)
        .build()?;

    protocol.rewrite(&mut head)?;
    encode_head(&head, out);
    Ok(length)
}

/// Copy a fixed-length body, starting with whatever is already buffered.
/// Bytes past the body stay in `buf`.
async fn copy_body<L, U>(
    local: &mut L,
    upstream: &mut U,
    buf: &mut BytesMut,
    len: u64,
    idle: Duration,
) -> ProxyResult<()>
where
    L: AsyncRead + Unpin,
    U: AsyncWrite + Unpin,
{
    let mut remaining = len;
    loop {
        let take = remaining.min(buf.len() as u64) as usize;
        if take > 0 {
            let chunk = buf.split_to(take);
            upstream.write_all(&chunk).await.map_err(ProxyError::Write)?;
            remaining -= take as u64;
        }
        if remaining == 0 {
            return Ok(());
        }

        let read = tokio::time::timeout(idle, local.read_buf(buf))
            .await?
            .map_err(ProxyError::Read)?;
        if read == 0 {
            return Err(ProxyError::Read(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed mid-body",
            )));
        }
    }
}

/// Answer the local client with a 502 and close it.
async fn fail<L: AsyncWrite + Unpin>(local: &mut L, err: &ProxyError, limit: Duration) {
    let response = bad_gateway_bytes(&err.to_string());
    let write = async {
        local.write_all(&response).await?;
        local.flush().await?;
        local.shutdown().await
    };

    match tokio::time::timeout(limit, write).await {
        Ok(Ok(())) => trace!("Sent 502 to client"),
        Ok(Err(e)) => debug!("Could not send 502 to client: {}", e),
        Err(_) => debug!("Timed out sending 502 to client"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpstreamSettings;
    use std::sync::Mutex;
    use tokio::io::{duplex, DuplexStream};

    /// Hands out one prepared in-memory upstream.
    struct PipeDialer {
        upstream: Mutex<Option<DuplexStream>>,
    }

    impl Dialer for PipeDialer {
        type Conn = DuplexStream;

        async fn dial(&self, addr: &str) -> ProxyResult<DuplexStream> {
            let conn = self.upstream.lock().unwrap().take();
            conn.ok_or_else(|| ProxyError::Dial {
                addr: addr.to_string(),
                message: "already dialed".to_string(),
            })
        }
    }

    struct RefusingDialer;

    impl Dialer for RefusingDialer {
        type Conn = DuplexStream;

        async fn dial(&self, addr: &str) -> ProxyResult<DuplexStream> {
            Err(ProxyError::Dial {
                addr: addr.to_string(),
                message: "connection refused".to_string(),
            })
        }
    }

    fn upstream_settings() -> UpstreamSettings {
        UpstreamSettings {
            host: "proxy.example.net".to_string(),
            port: 443,
            masquerade: None,
            ca_file: None,
        }
    }

    fn timeouts() -> Timeouts {
        Timeouts {
            read: Duration::from_secs(5),
            write: Duration::from_secs(5),
            idle: Duration::from_secs(5),
        }
    }

    /// Returns (client end, upstream end, tunnel task).
    fn start_tunnel(
        target: &str,
    ) -> (
        DuplexStream,
        DuplexStream,
        tokio::task::JoinHandle<ProxyResult<RelayStats>>,
    ) {
        let (client, local) = duplex(64 * 1024);
        let (upstream, server) = duplex(64 * 1024);
        let protocol = ClientProtocol::with_dialer(
            upstream_settings(),
            PipeDialer {
                upstream: Mutex::new(Some(upstream)),
            },
        );
        let target = ConnectTarget::parse(target).unwrap();

        let task = tokio::spawn(async move {
            intercept(async { Ok(local) }, &target, &protocol, timeouts()).await
        });
        (client, server, task)
    }

    #[test]
    fn test_parse_connect_target() {
        let target = ConnectTarget::parse("api.example.com:8443").unwrap();
        assert_eq!(target.host(), "api.example.com");
        assert_eq!(target.port(), 8443);
        assert_eq!(target.authority(), "api.example.com:8443");

        let target = ConnectTarget::parse("api.example.com").unwrap();
        assert_eq!(target.port(), 443);
        assert_eq!(target.authority(), "api.example.com");
        assert_eq!(target.to_string(), "api.example.com:443");
    }

    #[test]
    fn test_parse_connect_target_ipv6() {
        let target = ConnectTarget::parse("[::1]:443").unwrap();
        assert_eq!(target.host(), "::1");
        assert_eq!(target.authority(), "[::1]");
        assert_eq!(target.to_string(), "[::1]:443");
    }

    #[test]
    fn test_parse_connect_target_invalid() {
        assert!(ConnectTarget::parse("api.example.com:invalid").is_err());
        assert!(ConnectTarget::parse(":443").is_err());
    }

    #[tokio::test]
    async fn test_connect_request_is_disguised() {
        let (mut client, mut server, task) = start_tunnel("origin.example:443");

        client
            .write_all(b"GET /index.html HTTP/1.1\r\nHost: origin.example\r\nAccept: */*\r\n\r\n")
            .await
            .unwrap();

        let mut seen = Vec::new();
        let mut chunk = [0u8; 1024];
        while !seen.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = server.read(&mut chunk).await.unwrap();
            assert!(n > 0, "upstream closed early");
            seen.extend_from_slice(&chunk[..n]);
        }
        let head = String::from_utf8(seen).unwrap();
        assert!(head.starts_with("GET /index.html HTTP/1.1\r\n"));
        assert!(head.contains("Host: proxy.example.net\r\n"));
        assert!(head.contains("X-Lantern-Host: origin.example\r\n"));
        assert!(head.contains("X-Lantern-Scheme: https\r\n"));
        assert!(head.contains("Accept: */*\r\n"));

        server
            .write_all(b"HTTP/1.1 204 No Content\r\n\r\n")
            .await
            .unwrap();
        let mut response = [0u8; 27];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(&response, b"HTTP/1.1 204 No Content\r\n\r\n");

        drop(client);
        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats.upstream_to_local, 27);
    }

    #[tokio::test]
    async fn test_non_default_port_kept_in_disguise() {
        let (mut client, mut server, task) = start_tunnel("origin.example:8443");

        client
            .write_all(b"GET / HTTP/1.1\r\nHost: origin.example:8443\r\n\r\n")
            .await
            .unwrap();
        drop(client);

        let mut forwarded = String::new();
        server.read_to_string(&mut forwarded).await.unwrap();
        assert!(forwarded.contains("X-Lantern-Host: origin.example:8443\r\n"));
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_pipelined_requests_keep_order() {
        let (mut client, mut server, task) = start_tunnel("origin.example:443");

        client
            .write_all(
                b"POST /a HTTP/1.1\r\nHost: origin.example\r\nContent-Length: 5\r\n\r\nhello\
                  GET /b HTTP/1.1\r\nHost: origin.example\r\n\r\n",
            )
            .await
            .unwrap();
        drop(client);

        let mut forwarded = String::new();
        server.read_to_string(&mut forwarded).await.unwrap();

        let post = forwarded.find("POST /a HTTP/1.1").unwrap();
        let body = forwarded.find("hello").unwrap();
        let get = forwarded.find("GET /b HTTP/1.1").unwrap();
        assert!(post < body && body < get);
        assert_eq!(forwarded.matches("X-Lantern-Host: origin.example\r\n").count(), 2);
        assert_eq!(forwarded.matches("\r\nHost: proxy.example.net\r\n").count(), 2);

        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats.local_to_upstream, forwarded.len() as u64);
    }

    #[tokio::test]
    async fn test_unreachable_upstream_gets_bad_gateway() {
        let (mut client, local) = duplex(4096);
        let protocol = ClientProtocol::with_dialer(upstream_settings(), RefusingDialer);
        let target = ConnectTarget::parse("origin.example:443").unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            intercept(async { Ok(local) }, &target, &protocol, timeouts()),
        )
        .await
        .expect("tunnel should fail promptly");
        assert!(matches!(result, Err(ProxyError::Dial { .. })));

        let mut response = String::new();
        tokio::time::timeout(Duration::from_secs(5), client.read_to_string(&mut response))
            .await
            .expect("local connection should be closed")
            .unwrap();
        assert!(response.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
        assert!(response.contains("Connection: close\r\n"));
        assert!(response.contains("connection refused"));
    }

    #[tokio::test]
    async fn test_malformed_request_gets_bad_gateway() {
        let (mut client, mut server, task) = start_tunnel("origin.example:443");

        client
            .write_all(b"NOT AN HTTP REQUEST\r\n\r\n")
            .await
            .unwrap();

        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));

        let mut forwarded = Vec::new();
        server.read_to_end(&mut forwarded).await.unwrap();
        assert!(forwarded.is_empty());
        assert!(matches!(
            task.await.unwrap(),
            Err(ProxyError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_clean_eof_closes_both_sides() {
        let (client, mut server, task) = start_tunnel("origin.example:443");
        drop(client);

        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats, RelayStats::default());

        let mut forwarded = Vec::new();
        server.read_to_end(&mut forwarded).await.unwrap();
        assert!(forwarded.is_empty());
    }
}
