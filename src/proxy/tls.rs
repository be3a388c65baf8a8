//! TLS configuration for both roles.
//!
//! This module provides:
//! - Certificate caching to avoid re-issuing interception leaves
//! - Dynamic certificate resolution using SNI (client role, interception)
//! - A static acceptor for the server role's public certificate
//! - TLS connectors for the front-end and for origins
//!
//! # Critical ALPN Note
//!
//! Every acceptor and connector here **must** force HTTP/1.1 via ALPN. The
//! interception tunnel decodes HTTP/1.1 request heads and then relays bytes;
//! it does not understand HTTP/2 framing.

use super::error::ProxyError;
use crate::ca::Credentials;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pki_types::{CertificateDer, ServerName};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, error, trace, warn};

/// The only application protocol we speak.
const HTTP_1_1: &[u8] = b"http/1.1";

/// Certificate cache for TLS interception.
///
/// Leaves are issued by the CA on first use and cached by lowercased host.
pub struct CertificateCache {
    /// Cache of host -> certified key.
    cache: RwLock<HashMap<String, Arc<CertifiedKey>>>,
    /// Credentials used to issue new leaves.
    credentials: Arc<Credentials>,
}

impl CertificateCache {
    /// Create a new certificate cache issuing from `credentials`.
    pub fn new(credentials: Arc<Credentials>) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            credentials,
        }
    }

    /// Get or issue a certificate for the given host.
    pub fn get_or_generate(&self, host: &str) -> Result<Arc<CertifiedKey>, ProxyError> {
        let host_lower = host.to_lowercase();

        {
            let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(key) = cache.get(&host_lower) {
                trace!("Certificate cache hit for {}", host);
                return Ok(key.clone());
            }
        }

        debug!("Issuing interception certificate for {}", host);
        let leaf = self.credentials.issue_leaf(&host_lower)?;
        let certified_key = Arc::new(certified_key(
            vec![leaf.der().clone()],
            &self.credentials,
        )?);

        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(host_lower, certified_key.clone());

        Ok(certified_key)
    }

    /// Get the number of cached certificates.
    pub fn len(&self) -> usize {
        self.cache.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pair a certificate chain with the process private key.
fn certified_key(
    chain: Vec<CertificateDer<'static>>,
    credentials: &Credentials,
) -> Result<CertifiedKey, ProxyError> {
    let signing_key =
        rustls::crypto::aws_lc_rs::sign::any_supported_type(&credentials.private_key_der())
            .map_err(|e| ProxyError::Tls(format!("Failed to create signing key: {}", e)))?;
    Ok(CertifiedKey::new(chain, signing_key))
}

/// Certificate resolver that issues certificates on demand.
///
/// Implements rustls's `ResolvesServerCert` to pick the certificate from the
/// SNI in the ClientHello, falling back to the CONNECT host.
pub struct DynamicCertResolver {
    /// Certificate cache for on-demand issuance.
    cache: Arc<CertificateCache>,
    /// Host from the CONNECT request, for SNI-less clients.
    domain_hint: Option<String>,
}

impl DynamicCertResolver {
    /// Create a new resolver without a domain hint.
    pub fn new(cache: Arc<CertificateCache>) -> Self {
        Self {
            cache,
            domain_hint: None,
        }
    }

    /// Create a resolver with a domain hint.
    ///
    /// The hint is used when the client doesn't send SNI, which happens when
    /// it connects by IP address.
    pub fn with_domain_hint(cache: Arc<CertificateCache>, domain: String) -> Self {
        Self {
            cache,
            domain_hint: Some(domain),
        }
    }
}

impl ResolvesServerCert for DynamicCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let domain = client_hello
            .server_name()
            .map(|s| s.to_string())
            .or_else(|| self.domain_hint.clone())?;

        trace!("Resolving certificate for: {}", domain);

        match self.cache.get_or_generate(&domain) {
            Ok(key) => Some(key),
            Err(e) => {
                error!("Failed to issue certificate for {}: {}", domain, e);
                None
            }
        }
    }
}

// Required for Arc<DynamicCertResolver> to implement ResolvesServerCert
impl std::fmt::Debug for DynamicCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicCertResolver")
            .field("domain_hint", &self.domain_hint)
            .field("cache_size", &self.cache.len())
            .finish()
    }
}

/// Create the TLS acceptor for an intercepted CONNECT.
///
/// Certificates are issued per host, from SNI or `domain_hint`.
pub fn create_tls_acceptor(
    cert_cache: Arc<CertificateCache>,
    domain_hint: Option<String>,
) -> TlsAcceptor {
    let resolver: Arc<dyn ResolvesServerCert> = match domain_hint {
        Some(domain) => Arc::new(DynamicCertResolver::with_domain_hint(cert_cache, domain)),
        None => Arc::new(DynamicCertResolver::new(cert_cache)),
    };

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = vec![HTTP_1_1.to_vec()];

    TlsAcceptor::from(Arc::new(config))
}

/// Create the TLS acceptor for the server role's listener.
///
/// Presents the server certificate followed by the CA.
pub fn create_server_acceptor(credentials: &Credentials) -> Result<TlsAcceptor, ProxyError> {
    let server = credentials
        .server()
        .ok_or_else(|| ProxyError::Tls("No server certificate loaded".into()))?;

    let chain = vec![server.der().clone(), credentials.ca().der().clone()];
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, credentials.private_key_der())?;
    config.alpn_protocols = vec![HTTP_1_1.to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Create a TLS connector trusting the system roots plus, optionally, the
/// certificates in `extra_ca`.
pub fn create_tls_connector(extra_ca: Option<&Path>) -> Result<TlsConnector, ProxyError> {
    let mut root_store = RootCertStore::empty();

    let native_certs = rustls_native_certs::load_native_certs();

    // Log any errors but continue with successfully loaded certs
    for err in native_certs.errors {
        debug!("Warning loading native cert: {}", err);
    }

    for cert in native_certs.certs {
        if let Err(e) = root_store.add(cert) {
            debug!("Warning adding cert to store: {}", e);
        }
    }

    if let Some(path) = extra_ca {
        let added = add_pem_roots(&mut root_store, path)?;
        debug!("Trusting {} extra root(s) from {:?}", added, path);
    }

    if root_store.is_empty() {
        return Err(ProxyError::Tls("No root certificates found".into()));
    }

    debug!("Loaded {} root certificates", root_store.len());
    Ok(connector_for_roots(root_store))
}

/// Create a TLS connector trusting exactly `roots`.
pub fn connector_for_roots(roots: RootCertStore) -> TlsConnector {
    let mut config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![HTTP_1_1.to_vec()];

    TlsConnector::from(Arc::new(config))
}

fn add_pem_roots(store: &mut RootCertStore, path: &Path) -> Result<usize, ProxyError> {
    let pem = fs::read(path)
        .map_err(|e| ProxyError::Tls(format!("Failed to read CA file {:?}: {}", path, e)))?;

    let mut added = 0;
    for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
        let cert = cert
            .map_err(|e| ProxyError::Tls(format!("Failed to parse CA file {:?}: {}", path, e)))?;
        match store.add(cert) {
            Ok(()) => added += 1,
            Err(e) => warn!("Skipping certificate in {:?}: {}", path, e),
        }
    }

    if added == 0 {
        return Err(ProxyError::Tls(format!("No certificates in CA file {:?}", path)));
    }
    Ok(added)
}

/// Convert a domain string to a ServerName for TLS connection.
pub fn domain_to_server_name(domain: &str) -> Result<ServerName<'static>, ProxyError> {
    ServerName::try_from(domain.to_string())
        .map_err(|_| ProxyError::Tls(format!("Invalid server name: {}", domain)))
}
