//! The header namespace shared by both roles.
//!
//! Two families of headers matter on a disguised request:
//!
//! - **Disguise headers** carry the true destination through the front-end:
//!   `X-Lantern-Host` and `X-Lantern-Scheme`. The client role writes them, the
//!   server role reads and strips them.
//! - **Front-end routing headers** are added by the CDN itself: anything with
//!   the `Cf-` prefix, plus `X-Lantern-URL`. They are never touched, only
//!   logged.
//!
//! Header names are case-insensitive on the wire; `http` stores them
//! lowercased, so the constants below are lowercase.

use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::uri::Scheme;

/// Prefix of headers owned by this proxy.
pub const X_LANTERN_PREFIX: &str = "x-lantern-";

/// Prefix of headers added by the CDN front-end.
pub const CF_PREFIX: &str = "cf-";

/// True destination authority (`host[:port]`).
pub const X_LANTERN_HOST: HeaderName = HeaderName::from_static("x-lantern-host");

/// True destination scheme (`http` or `https`).
pub const X_LANTERN_SCHEME: HeaderName = HeaderName::from_static("x-lantern-scheme");

/// Original URL as seen by the front-end.
pub const X_LANTERN_URL: HeaderName = HeaderName::from_static("x-lantern-url");

/// Which family a header belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderNamespace {
    /// `X-Lantern-Host` / `X-Lantern-Scheme`.
    Disguise,
    /// `Cf-*` / `X-Lantern-URL`.
    FrontEnd,
    /// Anything else.
    Other,
}

impl HeaderNamespace {
    /// Classify a header name.
    pub fn of(name: &HeaderName) -> Self {
        if *name == X_LANTERN_HOST || *name == X_LANTERN_SCHEME {
            HeaderNamespace::Disguise
        } else if *name == X_LANTERN_URL || name.as_str().starts_with(CF_PREFIX) {
            HeaderNamespace::FrontEnd
        } else {
            HeaderNamespace::Other
        }
    }
}

/// Iterate the front-end routing headers present on a request.
pub fn front_end_headers(
    headers: &HeaderMap,
) -> impl Iterator<Item = (&HeaderName, &HeaderValue)> {
    headers
        .iter()
        .filter(|(name, _)| HeaderNamespace::of(name) == HeaderNamespace::FrontEnd)
}

/// The true destination of a disguised request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disguise {
    /// Authority (`host[:port]`) of the real destination.
    pub host: String,
    /// Scheme of the real destination.
    pub scheme: Scheme,
}

impl Disguise {
    /// Write both disguise headers, replacing any previous values.
    pub fn encode(&self, headers: &mut HeaderMap) -> Result<(), http::header::InvalidHeaderValue> {
        headers.insert(X_LANTERN_HOST, HeaderValue::from_str(&self.host)?);
        headers.insert(X_LANTERN_SCHEME, HeaderValue::from_str(self.scheme.as_str())?);
        Ok(())
    }

    /// Read the disguise headers.
    ///
    /// Returns `None` unless `X-Lantern-Host` is present with a non-empty
    /// value. A missing or unparseable `X-Lantern-Scheme` reads as `http`.
    pub fn decode(headers: &HeaderMap) -> Option<Self> {
        let host = headers
            .get(&X_LANTERN_HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|h| !h.is_empty())?
            .to_string();

        let scheme = headers
            .get(&X_LANTERN_SCHEME)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| Scheme::try_from(s.trim()).ok())
            .unwrap_or(Scheme::HTTP);

        Some(Self { host, scheme })
    }

    /// Whether a request already carries a disguise.
    pub fn is_present(headers: &HeaderMap) -> bool {
        headers.contains_key(&X_LANTERN_HOST)
    }

    /// Remove exactly the two disguise headers.
    pub fn strip(headers: &mut HeaderMap) {
        headers.remove(&X_LANTERN_HOST);
        headers.remove(&X_LANTERN_SCHEME);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_classification() {
        assert_eq!(HeaderNamespace::of(&X_LANTERN_HOST), HeaderNamespace::Disguise);
        assert_eq!(HeaderNamespace::of(&X_LANTERN_SCHEME), HeaderNamespace::Disguise);
        assert_eq!(HeaderNamespace::of(&X_LANTERN_URL), HeaderNamespace::FrontEnd);
        assert_eq!(
            HeaderNamespace::of(&HeaderName::from_static("cf-connecting-ip")),
            HeaderNamespace::FrontEnd
        );
        assert_eq!(
            HeaderNamespace::of(&HeaderName::from_static("user-agent")),
            HeaderNamespace::Other
        );
    }

    #[test]
    fn test_names_match_wire_spelling() {
        // Title-cased on the wire, compared case-insensitively.
        assert_eq!(
            HeaderName::from_bytes(b"X-Lantern-Host").unwrap(),
            X_LANTERN_HOST
        );
        assert_eq!(
            HeaderName::from_bytes(b"X-Lantern-Scheme").unwrap(),
            X_LANTERN_SCHEME
        );
        assert_eq!(HeaderName::from_bytes(b"X-Lantern-URL").unwrap(), X_LANTERN_URL);
    }

    #[test]
    fn test_encode_then_decode() {
        let disguise = Disguise {
            host: "origin.example:8443".to_string(),
            scheme: Scheme::HTTPS,
        };
        let mut headers = HeaderMap::new();
        disguise.encode(&mut headers).unwrap();

        assert_eq!(headers.get("X-Lantern-Host").unwrap(), "origin.example:8443");
        assert_eq!(headers.get("X-Lantern-Scheme").unwrap(), "https");
        assert_eq!(Disguise::decode(&headers), Some(disguise));
    }

    #[test]
    fn test_decode_requires_host() {
        let mut headers = HeaderMap::new();
        assert_eq!(Disguise::decode(&headers), None);

        headers.insert(X_LANTERN_SCHEME, HeaderValue::from_static("https"));
        assert_eq!(Disguise::decode(&headers), None);

        headers.insert(X_LANTERN_HOST, HeaderValue::from_static(""));
        assert_eq!(Disguise::decode(&headers), None);
    }

    #[test]
    fn test_decode_defaults_scheme_to_http() {
        let mut headers = HeaderMap::new();
        headers.insert(X_LANTERN_HOST, HeaderValue::from_static("origin.example"));

        let disguise = Disguise::decode(&headers).unwrap();
        assert_eq!(disguise.scheme, Scheme::HTTP);
    }

    #[test]
    fn test_strip_leaves_front_end_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(X_LANTERN_HOST, HeaderValue::from_static("origin.example"));
        headers.insert(X_LANTERN_SCHEME, HeaderValue::from_static("https"));
        headers.insert(X_LANTERN_URL, HeaderValue::from_static("https://cdn/path"));
        headers.insert("cf-ray", HeaderValue::from_static("abc123"));

        Disguise::strip(&mut headers);

        assert!(!Disguise::is_present(&headers));
        assert!(!headers.contains_key(&X_LANTERN_SCHEME));
        assert_eq!(front_end_headers(&headers).count(), 2);
    }
}
