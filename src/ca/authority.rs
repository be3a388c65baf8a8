//! Startup provisioning of the key pair, CA certificate and server certificate.
//!
//! Credentials are resolved once, synchronously, before any listener binds.
//! Each artifact is loaded from disk when present and still usable, otherwise
//! regenerated and persisted:
//!
//! | Artifact           | Regenerated when                                          |
//! |--------------------|-----------------------------------------------------------|
//! | private key        | missing or unreadable                                     |
//! | CA certificate     | missing, unreadable, not a CA, other key, expiring soon   |
//! | server certificate | missing, unreadable, CA regenerated, expiring soon,       |
//! |                    | hostname changed, or no longer verifies against the CA    |
//!
//! A freshly generated CA is installed into the local trust store when running
//! as the client.

use super::cert::{
    issue_certificate_for, PemCertificate, CA_COMMON_NAME, CA_VALIDITY, LEAF_VALIDITY,
    RENEWAL_WINDOW,
};
use super::error::CaError;
use super::trust::TrustStore;
use crate::config::ProxyRole;
use rcgen::KeyPair;
use rustls_pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

/// Default file name of the private key.
pub const PRIVATE_KEY_FILE: &str = "proxypk.pem";

/// Default file name of the CA certificate.
pub const CA_CERT_FILE: &str = "cacert.pem";

/// Default file name of the server certificate.
pub const SERVER_CERT_FILE: &str = "servercert.pem";

/// Where the three persisted credential files live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertPaths {
    /// PEM private key.
    pub private_key: PathBuf,
    /// PEM CA certificate.
    pub ca_cert: PathBuf,
    /// PEM server certificate (server role only).
    pub server_cert: PathBuf,
}

impl CertPaths {
    /// Default file names inside `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            private_key: dir.join(PRIVATE_KEY_FILE),
            ca_cert: dir.join(CA_CERT_FILE),
            server_cert: dir.join(SERVER_CERT_FILE),
        }
    }
}

/// A certificate plus whether it was generated during this startup.
#[derive(Debug, Clone)]
pub struct Provisioned {
    /// The loaded or generated certificate.
    pub cert: PemCertificate,
    /// True when the certificate was (re)generated rather than loaded.
    pub regenerated: bool,
}

/// Resolves credentials from disk, regenerating what is missing or stale.
pub struct CertManager<'a> {
    paths: &'a CertPaths,
    role: ProxyRole,
    trust: &'a dyn TrustStore,
    now: OffsetDateTime,
}

impl<'a> CertManager<'a> {
    /// Create a manager for `role` using the files in `paths`.
    pub fn new(paths: &'a CertPaths, role: ProxyRole, trust: &'a dyn TrustStore) -> Self {
        Self {
            paths,
            role,
            trust,
            now: OffsetDateTime::now_utc(),
        }
    }

    /// Resolve every credential the role needs.
    ///
    /// `hostname` is the externally visible name of the server role; the
    /// client role only uses it in diagnostics.
    pub fn provision(&self, hostname: &str) -> Result<Credentials, CaError> {
        let key = self.ensure_key_pair()?;
        let ca = self.ensure_ca(&key, hostname)?;

        let server = match self.role {
            ProxyRole::Server => Some(self.ensure_server_cert(&key, &ca, hostname)?.cert),
            ProxyRole::Client => None,
        };

        Ok(Credentials {
            key,
            ca: ca.cert,
            server,
        })
    }

    /// Load the persisted private key, or generate and persist a new one.
    pub fn ensure_key_pair(&self) -> Result<KeyPair, CaError> {
        let path = &self.paths.private_key;

        match fs::read_to_string(path) {
            Ok(pem) => match KeyPair::from_pem(&pem) {
                Ok(key) => {
                    debug!("Loaded private key from {:?}", path);
                    return Ok(key);
                }
                Err(e) => warn!("Private key at {:?} is unreadable: {}", path, e),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to read private key at {:?}: {}", path, e),
        }

        info!("Creating new private key at {:?}", path);
        let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384)
            .map_err(|e| CaError::KeyGeneration(e.to_string()))?;
        write_restricted_file(path, &key.serialize_pem())?;

        Ok(key)
    }

    /// Load the persisted CA certificate, or generate, persist and (client
    /// role) trust a new one.
    pub fn ensure_ca(&self, key: &KeyPair, host_hint: &str) -> Result<Provisioned, CaError> {
        let path = &self.paths.ca_cert;

        let reason = match PemCertificate::load(path) {
            Err(e) => {
                debug!("No usable CA certificate at {:?}: {}", path, e);
                "missing or unreadable"
            }
            Ok(ca) if !ca.is_ca() => "not a CA certificate",
            Ok(ca) if !ca.matches_key(key) => "signed with a different key",
            Ok(ca) if ca.expires_within(RENEWAL_WINDOW, self.now) => "about to expire",
            Ok(ca) => {
                debug!("Loaded CA certificate from {:?}, valid until {}", path, ca.not_after());
                return Ok(Provisioned {
                    cert: ca,
                    regenerated: false,
                });
            }
        };

        info!(
            "Creating new self-signed CA certificate at {:?} ({}, host {})",
            path, reason, host_hint
        );
        let ca = issue_certificate_for(key, CA_COMMON_NAME, self.now + CA_VALIDITY, true, None)?;

        // A CA only reaches disk once it is trusted, so a failed install is
        // retried with a fresh CA on the next start.
        if self.role == ProxyRole::Client {
            self.trust.install(&ca)?;
        }
        ca.write(path)?;

        Ok(Provisioned {
            cert: ca,
            regenerated: true,
        })
    }

    /// Load the persisted server certificate for `hostname`, or issue a new one
    /// signed by `ca`. Only the server role calls this.
    pub fn ensure_server_cert(
        &self,
        key: &KeyPair,
        ca: &Provisioned,
        hostname: &str,
    ) -> Result<Provisioned, CaError> {
        let path = &self.paths.server_cert;

        let reason = match PemCertificate::load(path) {
            Err(e) => {
                debug!("No usable server certificate at {:?}: {}", path, e);
                "missing or unreadable"
            }
            Ok(_) if ca.regenerated => "CA certificate was regenerated",
            Ok(cert) if cert.expires_within(RENEWAL_WINDOW, self.now) => "about to expire",
            Ok(cert) if !cert.common_name().eq_ignore_ascii_case(hostname) => "hostname changed",
            Ok(cert) if !cert.matches_key(key) => "signed with a different key",
            Ok(cert) if cert.verify_issued_by(&ca.cert).is_err() => "not issued by current CA",
            Ok(cert) => {
                debug!(
                    "Loaded server certificate for {} from {:?}, valid until {}",
                    hostname,
                    path,
                    cert.not_after()
                );
                return Ok(Provisioned {
                    cert,
                    regenerated: false,
                });
            }
        };

        info!("Creating new server certificate for {} at {:?} ({})", hostname, path, reason);
        let valid_until = (self.now + LEAF_VALIDITY).min(ca.cert.not_after());
        let cert = issue_certificate_for(key, hostname, valid_until, false, Some(&ca.cert))?;
        cert.write(path)?;

        Ok(Provisioned {
            cert,
            regenerated: true,
        })
    }
}

/// The credentials resolved at startup, shared read-only by every handshake.
pub struct Credentials {
    key: KeyPair,
    ca: PemCertificate,
    server: Option<PemCertificate>,
}

impl Credentials {
    /// The process key pair.
    pub fn key(&self) -> &KeyPair {
        &self.key
    }

    /// The current CA certificate.
    pub fn ca(&self) -> &PemCertificate {
        &self.ca
    }

    /// The server certificate (server role only).
    pub fn server(&self) -> Option<&PemCertificate> {
        self.server.as_ref()
    }

    /// The private key in the form rustls expects.
    pub fn private_key_der(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key.serialize_der()))
    }

    /// Issue an interception leaf for `host`, signed by the CA.
    pub fn issue_leaf(&self, host: &str) -> Result<PemCertificate, CaError> {
        let valid_until = (OffsetDateTime::now_utc() + LEAF_VALIDITY).min(self.ca.not_after());
        issue_certificate_for(&self.key, host, valid_until, false, Some(&self.ca))
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("ca", &self.ca.common_name())
            .field("server", &self.server.as_ref().map(|s| s.common_name()))
            .finish_non_exhaustive()
    }
}

/// Write a file with restricted permissions (0600 on Unix).
fn write_restricted_file(path: &Path, content: &str) -> Result<(), CaError> {
    let key_write = |source| CaError::KeyWrite {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(key_write)?;
    }

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path).map_err(key_write)?;
    file.write_all(content.as_bytes()).map_err(key_write)?;

    Ok(())
}
