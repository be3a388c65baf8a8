//! Minimal HTTP/1.1 request-head codec for the interception tunnel.
//!
//! Inside a decrypted CONNECT tunnel there is no hyper server to lean on:
//! request heads are parsed straight off the stream with `httparse`, turned
//! into `http::Request<()>` so the disguise protocol can rewrite them, and
//! written back out in origin-form. Bodies are never parsed, only measured.

use super::error::{ProxyError, ProxyResult};
use bytes::{Buf, BytesMut};
use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{Method, Request, Uri, Version};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest request head we are willing to buffer.
pub const MAX_HEAD_LEN: usize = 64 * 1024;

/// Maximum number of headers in one request.
const MAX_HEADERS: usize = 128;

/// How the body following a request head is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLength {
    /// No body.
    Empty,
    /// Exactly this many bytes.
    Fixed(u64),
    /// Chunked transfer coding; length unknown until the last chunk.
    Chunked,
}

/// Parse one request head from the front of `buf`.
///
/// Returns `None` while the head is incomplete, and the head length plus the
/// request once it is complete.
pub fn parse_head(buf: &[u8]) -> ProxyResult<Option<(usize, Request<()>)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);

    let len = match parsed.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => {
            if buf.len() > MAX_HEAD_LEN {
                return Err(ProxyError::InvalidRequest("request head too large".into()));
            }
            return Ok(None);
        }
        Err(e) => return Err(ProxyError::InvalidRequest(format!("malformed request: {}", e))),
    };

    let method = parsed
        .method
        .ok_or_else(|| ProxyError::InvalidRequest("missing method".into()))?;
    let method = Method::from_bytes(method.as_bytes())
        .map_err(|e| ProxyError::InvalidRequest(format!("invalid method: {}", e)))?;
    let path = parsed
        .path
        .ok_or_else(|| ProxyError::InvalidRequest("missing request target".into()))?;
    let uri: Uri = path
        .parse()
        .map_err(|e| ProxyError::InvalidRequest(format!("invalid request target: {}", e)))?;
    let version = match parsed.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };

    let mut request = Request::builder().method(method).uri(uri).version(version).body(())?;
    let map = request.headers_mut();
    for header in parsed.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|e| ProxyError::InvalidRequest(format!("invalid header name: {}", e)))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|e| ProxyError::InvalidRequest(format!("invalid header value: {}", e)))?;
        map.append(name, value);
    }

    Ok(Some((len, request)))
}

/// Determine how the body of a request with `headers` is delimited.
pub fn body_length(headers: &HeaderMap) -> ProxyResult<BodyLength> {
    if let Some(encoding) = headers.get_all(TRANSFER_ENCODING).iter().last() {
        let encoding = encoding
            .to_str()
            .map_err(|_| ProxyError::InvalidRequest("invalid Transfer-Encoding".into()))?;
        let last = encoding.rsplit(',').next().unwrap_or_default().trim();
        if last.eq_ignore_ascii_case("chunked") {
            return Ok(BodyLength::Chunked);
        }
        return Err(ProxyError::InvalidRequest(format!(
            "unsupported Transfer-Encoding: {}",
            encoding
        )));
    }

    let mut length = None;
    for value in headers.get_all(CONTENT_LENGTH) {
        let parsed = value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or_else(|| ProxyError::InvalidRequest("invalid Content-Length".into()))?;
        if length.is_some_and(|l| l != parsed) {
            return Err(ProxyError::InvalidRequest("conflicting Content-Length".into()));
        }
        length = Some(parsed);
    }

    Ok(match length {
        None | Some(0) => BodyLength::Empty,
        Some(n) => BodyLength::Fixed(n),
    })
}

/// Serialize a request head in origin-form.
pub fn encode_head<B>(request: &Request<B>, out: &mut BytesMut) {
    let target = request
        .uri()
        .path_and_query()
        .map_or("/", |pq| pq.as_str());
    let version = if request.version() == Version::HTTP_10 {
        "HTTP/1.0"
    } else {
        "HTTP/1.1"
    };

    out.extend_from_slice(request.method().as_str().as_bytes());
    out.extend_from_slice(b" ");
    out.extend_from_slice(target.as_bytes());
    out.extend_from_slice(b" ");
    out.extend_from_slice(version.as_bytes());
    out.extend_from_slice(b"\r\n");

    for (name, value) in request.headers() {
        write_title_case(name.as_str(), out);
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
}

fn write_title_case(name: &str, out: &mut BytesMut) {
    let mut upper = true;
    for byte in name.bytes() {
        out.extend_from_slice(&[if upper { byte.to_ascii_uppercase() } else { byte }]);
        upper = byte == b'-';
    }
}

/// A complete `502 Bad Gateway` response carrying `message`.
pub fn bad_gateway_bytes(message: &str) -> Vec<u8> {
    let body = format!("{}\n", message);
    format!(
        "HTTP/1.1 502 Bad Gateway\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        body.len(),
        body
    )
    .into_bytes()
}

/// Read the next request head from `reader`, buffering into `buf`.
///
/// Returns `None` on a clean EOF before any byte of a new head. Bytes past
/// the head stay in `buf`.
pub async fn read_head<R>(
    reader: &mut R,
    buf: &mut BytesMut,
    idle: Duration,
) -> ProxyResult<Option<Request<()>>>
where
    R: AsyncRead + Unpin,
{
    loop {
        if !buf.is_empty()
            && let Some((len, request)) = parse_head(buf)?
        {
            buf.advance(len);
            return Ok(Some(request));
        }

        let read = tokio::time::timeout(idle, reader.read_buf(buf))
            .await?
            .map_err(ProxyError::Read)?;
        if read == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(ProxyError::Read(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed mid-request",
            )));
        }
    }
}
