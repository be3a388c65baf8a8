//! Certificate authority and key management.
//!
//! Owns the single process key pair, the self-signed CA certificate, the
//! server-role certificate for the public hostname, and issuance of per-host
//! leaves for TLS interception on the client.
//!
//! All of it is resolved once at startup by [`CertManager::provision`]; the
//! resulting [`Credentials`] are then shared read-only by every handshake.

pub mod authority;
pub mod cert;
pub mod error;
pub mod trust;

pub use authority::{CertManager, CertPaths, Credentials, Provisioned};
pub use cert::{issue_certificate_for, PemCertificate};
pub use error::CaError;
pub use trust::{NoopTrustStore, SystemTrustStore, TrustStore};
