//! Server side of the disguise: restore the true destination of a request
//! that arrived through the front-end.

use super::headers::{front_end_headers, Disguise};
use crate::proxy::error::{ProxyError, ProxyResult};
use http::header::{HeaderValue, HOST};
use http::{Request, Uri};
use tracing::{debug, trace};

/// The server variant of the disguise protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerProtocol;

impl ServerProtocol {
    /// Undo the client's rewrite.
    ///
    /// Without disguise headers the request is left untouched; forwarding
    /// then has no destination to reach. Front-end routing headers are
    /// passed through as they are.
    pub fn rewrite<B>(&self, req: &mut Request<B>) -> ProxyResult<()> {
        for (name, value) in front_end_headers(req.headers()) {
            trace!("Front-end header {}: {:?}", name, value);
        }

        let Some(disguise) = Disguise::decode(req.headers()) else {
            debug!("Request for {} carries no disguise headers", req.uri());
            return Ok(());
        };

        let path = req
            .uri()
            .path_and_query()
            .map_or("/", |pq| pq.as_str())
            .to_string();
        *req.uri_mut() = Uri::builder()
            .scheme(disguise.scheme.clone())
            .authority(disguise.host.as_str())
            .path_and_query(path)
            .build()?;

        let host = HeaderValue::from_str(&disguise.host)
            .map_err(|e| ProxyError::InvalidRequest(format!("bad destination host: {}", e)))?;
        req.headers_mut().insert(HOST, host);
        Disguise::strip(req.headers_mut());

        debug!("Unwrapped request for {}", req.uri());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::client::disguise;
    use crate::protocol::headers::{X_LANTERN_HOST, X_LANTERN_SCHEME, X_LANTERN_URL};

    #[test]
    fn test_unwrap_restores_destination() {
        let mut req = Request::builder()
            .uri("/api/v1?x=2")
            .header(HOST, "cdn.example.com")
            .header("X-Lantern-Host", "origin.example")
            .header("X-Lantern-Scheme", "https")
            .body(())
            .unwrap();

        ServerProtocol.rewrite(&mut req).unwrap();

        assert_eq!(req.uri(), "https://origin.example/api/v1?x=2");
        assert_eq!(req.headers()[HOST], "origin.example");
        assert!(!req.headers().contains_key(X_LANTERN_HOST));
        assert!(!req.headers().contains_key(X_LANTERN_SCHEME));
    }

    #[test]
    fn test_request_without_disguise_is_unchanged() {
        let mut req = Request::builder()
            .uri("/plain")
            .header(HOST, "cdn.example.com")
            .body(())
            .unwrap();

        ServerProtocol.rewrite(&mut req).unwrap();

        assert_eq!(req.uri(), "/plain");
        assert_eq!(req.headers()[HOST], "cdn.example.com");
    }

    #[test]
    fn test_front_end_headers_untouched() {
        let mut req = Request::builder()
            .uri("/")
            .header("X-Lantern-Host", "origin.example")
            .header("X-Lantern-Scheme", "http")
            .header("X-Lantern-URL", "https://cdn.example.com/")
            .header("Cf-Connecting-IP", "203.0.113.7")
            .body(())
            .unwrap();

        ServerProtocol.rewrite(&mut req).unwrap();

        assert_eq!(req.headers()[X_LANTERN_URL], "https://cdn.example.com/");
        assert_eq!(req.headers()["cf-connecting-ip"], "203.0.113.7");
    }

    #[test]
    fn test_inverse_of_client_rewrite() {
        let mut req = Request::builder()
            .method("POST")
            .uri("http://origin.example:8080/submit?id=7")
            .header(HOST, "origin.example:8080")
            .header("content-type", "text/plain")
            .body(())
            .unwrap();
        let original_uri = req.uri().clone();
        let original_headers = req.headers().clone();

        disguise(&mut req, "cdn.example.com").unwrap();
        // The front-end delivers the request in origin-form.
        *req.uri_mut() = Uri::from_static("/submit?id=7");
        ServerProtocol.rewrite(&mut req).unwrap();

        assert_eq!(req.uri(), &original_uri);
        assert_eq!(req.headers(), &original_headers);
    }
}
