//! Error types for certificate authority operations.
//!
//! Every variant here is fatal at startup: the proxy must not serve traffic
//! with missing or invalid credentials.
//! - Key errors (generation, loading, persistence of the private key)
//! - Certificate errors (issuance, parsing, persistence)
//! - Trust store errors (installing the CA as a trusted root on the client)

use std::path::PathBuf;
use thiserror::Error;

/// Errors related to key and certificate management.
#[derive(Debug, Error)]
pub enum CaError {
    /// Failed to generate the private key.
    #[error("Failed to generate key pair: {0}")]
    KeyGeneration(String),

    /// Failed to persist the private key.
    #[error("Failed to write private key to {path}: {source}")]
    KeyWrite {
        /// Destination of the key file.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to generate or sign a certificate.
    #[error("Failed to generate certificate for '{name}': {message}")]
    CertGeneration {
        /// Subject name of the certificate.
        name: String,
        /// Description of the failure.
        message: String,
    },

    /// A certificate could not be parsed.
    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),

    /// Failed to persist a certificate.
    #[error("Failed to write certificate to {path}: {source}")]
    CertWrite {
        /// Destination of the certificate file.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A certificate did not verify against the expected issuer.
    #[error("Certificate signature does not verify against issuer: {0}")]
    Verification(String),

    /// Installing the CA certificate into the trust store failed.
    #[error("Failed to install CA certificate into trust store ({operation}): {detail}")]
    TrustStore {
        /// The trust store operation that failed.
        operation: String,
        /// Error output or description.
        detail: String,
    },

    /// Trust installation is not available on this platform.
    #[error("Trust store installation is not supported on this platform")]
    TrustStoreUnsupported,
}

impl CaError {
    /// Whether this error came from key management.
    pub fn is_key_error(&self) -> bool {
        matches!(self, CaError::KeyGeneration(_) | CaError::KeyWrite { .. })
    }

    /// Whether this error came from trust store installation.
    pub fn is_trust_store_error(&self) -> bool {
        matches!(
            self,
            CaError::TrustStore { .. } | CaError::TrustStoreUnsupported
        )
    }
}

impl From<rcgen::Error> for CaError {
    fn from(err: rcgen::Error) -> Self {
        CaError::InvalidCertificate(err.to_string())
    }
}
