//! Certificate construction, parsing and persistence.
//!
//! Everything the proxy issues goes through [`issue_certificate_for`]: the
//! self-signed CA, the server-role certificate for the public hostname, and
//! the per-host leaves used by the interception tunnel. Issued certificates
//! are carried around as [`PemCertificate`], which keeps the PEM text next to
//! the handful of parsed fields the renewal policy needs.

use super::error::CaError;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, PublicKeyData, SanType,
    SerialNumber,
};
use rustls_pki_types::CertificateDer;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use time::{Duration, OffsetDateTime};
use tracing::debug;

/// Validity of the self-signed CA certificate (ten years).
pub const CA_VALIDITY: Duration = Duration::days(3650);

/// Validity of server and interception leaf certificates (one year).
pub const LEAF_VALIDITY: Duration = Duration::days(365);

/// Certificates whose not-after falls inside this window are regenerated.
pub const RENEWAL_WINDOW: Duration = Duration::days(30);

/// Not-before is back-dated by this much to tolerate relying-party clock skew.
pub const BACKDATE: Duration = Duration::days(30);

/// Organization placed in the subject of every issued certificate.
pub const ORGANIZATION: &str = "Lantern";

/// Common name of the CA certificate.
pub const CA_COMMON_NAME: &str = "Lantern";

/// A parsed certificate together with its PEM encoding.
#[derive(Debug, Clone)]
pub struct PemCertificate {
    pem: String,
    der: CertificateDer<'static>,
    common_name: String,
    serial: Vec<u8>,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
    is_ca: bool,
    public_key: Vec<u8>,
}

impl PemCertificate {
    /// Parse the first certificate in a PEM document.
    pub fn from_pem(pem: &str) -> Result<Self, CaError> {
        let der = rustls_pemfile::certs(&mut pem.as_bytes())
            .next()
            .ok_or_else(|| CaError::InvalidCertificate("no certificate in PEM".into()))?
            .map_err(|e| CaError::InvalidCertificate(e.to_string()))?;

        let (_, parsed) = x509_parser::parse_x509_certificate(der.as_ref())
            .map_err(|e| CaError::InvalidCertificate(e.to_string()))?;

        let common_name = parsed
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or_default()
            .to_string();
        let validity = parsed.validity();

        Ok(Self {
            pem: pem.to_string(),
            common_name,
            serial: parsed.raw_serial().to_vec(),
            not_before: validity.not_before.to_datetime(),
            not_after: validity.not_after.to_datetime(),
            is_ca: parsed.is_ca(),
            public_key: parsed.public_key().raw.to_vec(),
            der: der.clone(),
        })
    }

    /// Load a certificate from a PEM file.
    pub fn load(path: &Path) -> Result<Self, CaError> {
        let pem = fs::read_to_string(path).map_err(|e| {
            CaError::InvalidCertificate(format!("{}: {}", path.display(), e))
        })?;
        Self::from_pem(&pem)
    }

    /// Persist the PEM encoding to `path`, creating parent directories.
    pub fn write(&self, path: &Path) -> Result<(), CaError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| CaError::CertWrite {
                path: path.to_path_buf(),
                source,
            })?;
        }
        fs::write(path, &self.pem).map_err(|source| CaError::CertWrite {
            path: path.to_path_buf(),
            source,
        })
    }

    /// PEM text.
    pub fn pem(&self) -> &str {
        &self.pem
    }

    /// DER encoding, ready for rustls.
    pub fn der(&self) -> &CertificateDer<'static> {
        &self.der
    }

    /// Subject common name.
    pub fn common_name(&self) -> &str {
        &self.common_name
    }

    /// Raw big-endian serial number.
    pub fn serial(&self) -> &[u8] {
        &self.serial
    }

    /// Start of the validity period.
    pub fn not_before(&self) -> OffsetDateTime {
        self.not_before
    }

    /// End of the validity period.
    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    /// Whether basic constraints mark this as a CA.
    pub fn is_ca(&self) -> bool {
        self.is_ca
    }

    /// Whether not-after falls within `window` of `now`.
    pub fn expires_within(&self, window: Duration, now: OffsetDateTime) -> bool {
        self.not_after < now + window
    }

    /// Whether this certificate carries the public half of `key`.
    pub fn matches_key(&self, key: &KeyPair) -> bool {
        self.public_key == key.subject_public_key_info()
    }

    /// Check that this certificate's signature was made by `issuer`'s key.
    pub fn verify_issued_by(&self, issuer: &PemCertificate) -> Result<(), CaError> {
        let (_, cert) = x509_parser::parse_x509_certificate(self.der.as_ref())
            .map_err(|e| CaError::InvalidCertificate(e.to_string()))?;
        let (_, issuer_cert) = x509_parser::parse_x509_certificate(issuer.der.as_ref())
            .map_err(|e| CaError::InvalidCertificate(e.to_string()))?;

        if cert.issuer() != issuer_cert.subject() {
            return Err(CaError::Verification(format!(
                "issuer '{}' does not match '{}'",
                cert.issuer(),
                issuer_cert.subject()
            )));
        }

        cert.verify_signature(Some(issuer_cert.public_key()))
            .map_err(|e| CaError::Verification(e.to_string()))
    }
}

/// Build a certificate for `name`, valid until `valid_until`.
///
/// With no `issuer` the certificate is self-signed. CA certificates get
/// cert-sign, digital-signature and key-encipherment usages; leaves get
/// digital-signature and key-encipherment, server-auth, and a SAN for `name`.
/// The signing key is the process key pair, which is also the key the CA was
/// created with.
pub fn issue_certificate_for(
    key: &KeyPair,
    name: &str,
    valid_until: OffsetDateTime,
    is_ca: bool,
    issuer: Option<&PemCertificate>,
) -> Result<PemCertificate, CaError> {
    let generation_error = |e: rcgen::Error| CaError::CertGeneration {
        name: name.to_string(),
        message: e.to_string(),
    };

    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(ORGANIZATION.to_string()),
    );
    dn.push(DnType::CommonName, DnValue::Utf8String(name.to_string()));
    params.distinguished_name = dn;

    params.serial_number = Some(random_serial());
    params.not_before = OffsetDateTime::now_utc() - BACKDATE;
    params.not_after = valid_until;

    if is_ca {
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
    } else {
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.subject_alt_names = vec![subject_alt_name(name).map_err(generation_error)?];
    }

    let cert = match issuer {
        None => params.self_signed(key).map_err(generation_error)?,
        Some(issuer) => {
            let issuer = Issuer::from_ca_cert_pem(issuer.pem(), key).map_err(generation_error)?;
            params.signed_by(key, &issuer).map_err(generation_error)?
        }
    };

    debug!(
        "Issued certificate for '{}' (ca={}, self_signed={}, not_after={})",
        name,
        is_ca,
        issuer.is_none(),
        valid_until
    );

    PemCertificate::from_pem(&cert.pem())
}

/// SAN entry for a hostname or IP literal.
fn subject_alt_name(name: &str) -> Result<SanType, rcgen::Error> {
    if let Ok(ip) = name.parse::<IpAddr>() {
        return Ok(SanType::IpAddress(ip));
    }
    Ok(SanType::DnsName(name.try_into()?))
}

/// Random positive 128-bit serial; the top bit is cleared so the DER integer
/// stays positive, and the first byte is never zero.
fn random_serial() -> SerialNumber {
    let mut bytes = uuid::Uuid::new_v4().into_bytes();
    bytes[0] = (bytes[0] & 0x7f).max(1);
    SerialNumber::from(bytes.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn test_key() -> KeyPair {
        KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384).unwrap()
    }

    #[test]
    fn test_self_signed_ca() {
        let key = test_key();
        let now = OffsetDateTime::now_utc();
        let ca = issue_certificate_for(&key, CA_COMMON_NAME, now + CA_VALIDITY, true, None)
            .unwrap();

        assert!(ca.is_ca());
        assert_eq!(ca.common_name(), CA_COMMON_NAME);
        assert!(ca.pem().contains("-----BEGIN CERTIFICATE-----"));
        assert!(ca.matches_key(&key));
        ca.verify_issued_by(&ca).unwrap();
    }

    #[test]
    fn test_matches_key_rejects_other_key() {
        let key = test_key();
        let now = OffsetDateTime::now_utc();
        let ca = issue_certificate_for(&key, CA_COMMON_NAME, now + CA_VALIDITY, true, None)
            .unwrap();

        assert!(!ca.matches_key(&test_key()));
    }

    #[test]
    fn test_leaf_issued_from_pem_ca_carries_lantern_identity() {
        let key = test_key();
        let now = OffsetDateTime::now_utc();
        let ca = issue_certificate_for(&key, CA_COMMON_NAME, now + CA_VALIDITY, true, None)
            .unwrap();
        let reloaded = PemCertificate::from_pem(ca.pem()).unwrap();
        let leaf = issue_certificate_for(
            &key,
            "origin.example",
            now + LEAF_VALIDITY,
            false,
            Some(&reloaded),
        )
        .unwrap();

        let (_, parsed) = x509_parser::parse_x509_certificate(leaf.der().as_ref()).unwrap();
        let issuer_org = parsed
            .issuer()
            .iter_organization()
            .next()
            .and_then(|o| o.as_str().ok());
        assert_eq!(issuer_org, Some("Lantern"));
        leaf.verify_issued_by(&ca).unwrap();
    }

    #[test]
    fn test_not_before_is_backdated() {
        let key = test_key();
        let now = OffsetDateTime::now_utc();
        let cert = issue_certificate_for(&key, "example.com", now + LEAF_VALIDITY, false, None)
            .unwrap();

        assert!(cert.not_before() <= now - BACKDATE + Duration::minutes(1));
        assert!(cert.not_before() >= now - BACKDATE - Duration::minutes(1));
    }

    #[test]
    fn test_leaf_signed_by_ca_verifies() {
        let key = test_key();
        let now = OffsetDateTime::now_utc();
        let ca = issue_certificate_for(&key, CA_COMMON_NAME, now + CA_VALIDITY, true, None)
            .unwrap();
        let leaf =
            issue_certificate_for(&key, "proxy.example.com", now + LEAF_VALIDITY, false, Some(&ca))
                .unwrap();

        assert!(!leaf.is_ca());
        assert_eq!(leaf.common_name(), "proxy.example.com");
        leaf.verify_issued_by(&ca).unwrap();
    }

    #[test]
    fn test_leaf_fails_against_other_ca() {
        let now = OffsetDateTime::now_utc();
        let old_key = test_key();
        let old_ca =
            issue_certificate_for(&old_key, CA_COMMON_NAME, now + CA_VALIDITY, true, None)
                .unwrap();
        let leaf = issue_certificate_for(
            &old_key,
            "proxy.example.com",
            now + LEAF_VALIDITY,
            false,
            Some(&old_ca),
        )
        .unwrap();

        let new_key = test_key();
        let new_ca =
            issue_certificate_for(&new_key, CA_COMMON_NAME, now + CA_VALIDITY, true, None)
                .unwrap();

        assert!(matches!(
            leaf.verify_issued_by(&new_ca),
            Err(CaError::Verification(_))
        ));
    }

    #[test]
    fn test_ip_literal_leaf() {
        let key = test_key();
        let now = OffsetDateTime::now_utc();
        let cert =
            issue_certificate_for(&key, "127.0.0.1", now + LEAF_VALIDITY, false, None).unwrap();
        assert_eq!(cert.common_name(), "127.0.0.1");
    }

    #[test]
    fn test_serials_are_unique() {
        let key = test_key();
        let now = OffsetDateTime::now_utc();
        let serials: HashSet<Vec<u8>> = (0..16)
            .map(|_| {
                issue_certificate_for(&key, "example.com", now + LEAF_VALIDITY, false, None)
                    .unwrap()
                    .serial()
                    .to_vec()
            })
            .collect();
        assert_eq!(serials.len(), 16);
    }

    #[test]
    fn test_expires_within() {
        let key = test_key();
        let now = OffsetDateTime::now_utc();
        let soon =
            issue_certificate_for(&key, "a.example", now + Duration::days(10), false, None)
                .unwrap();
        let later =
            issue_certificate_for(&key, "b.example", now + Duration::days(90), false, None)
                .unwrap();

        assert!(soon.expires_within(RENEWAL_WINDOW, now));
        assert!(!later.expires_within(RENEWAL_WINDOW, now));
    }

    #[test]
    fn test_write_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cert.pem");
        let key = test_key();
        let now = OffsetDateTime::now_utc();
        let cert = issue_certificate_for(&key, "example.com", now + LEAF_VALIDITY, false, None)
            .unwrap();

        cert.write(&path).unwrap();
        let loaded = PemCertificate::load(&path).unwrap();
        assert_eq!(loaded.pem(), cert.pem());
        assert_eq!(loaded.serial(), cert.serial());
    }

    #[test]
    fn test_from_pem_rejects_garbage() {
        assert!(PemCertificate::from_pem("not a certificate").is_err());
    }
}
