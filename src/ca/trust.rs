//! Installing the CA certificate as a trusted root on the client machine.
//!
//! The client role terminates TLS locally with leaves signed by our CA, so the
//! CA has to be trusted by the browser/OS or every intercepted connection
//! shows a certificate warning. Installation happens once, right after a new
//! CA certificate is generated.
//!
//! Platform backends shell out to the native tooling:
//! - Linux: copy into `/usr/local/share/ca-certificates/` and run
//!   `update-ca-certificates`
//! - macOS: `security add-trusted-cert` into the login keychain
//! - Windows: `certutil -addstore -user ROOT`

use super::cert::PemCertificate;
use super::error::CaError;
use std::ffi::OsStr;
use std::path::PathBuf;
use std::process::Command;
use tracing::{debug, info};

/// File name used when staging the CA certificate for installation.
pub const STAGED_CERT_NAME: &str = "fronting-proxy-ca.crt";

/// Somewhere a CA certificate can be installed as a trusted root.
pub trait TrustStore: Send + Sync {
    /// Install `ca` as a trusted root.
    fn install(&self, ca: &PemCertificate) -> Result<(), CaError>;
}

/// The operating system's trust store for the current user.
#[derive(Debug, Clone)]
pub struct SystemTrustStore {
    staging_dir: PathBuf,
}

impl SystemTrustStore {
    /// Create a trust store that stages certificates in `staging_dir`.
    pub fn new(staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
        }
    }

    fn stage(&self, ca: &PemCertificate) -> Result<PathBuf, CaError> {
        let path = self.staging_dir.join(STAGED_CERT_NAME);
        ca.write(&path)?;
        Ok(path)
    }
}

impl TrustStore for SystemTrustStore {
    fn install(&self, ca: &PemCertificate) -> Result<(), CaError> {
        let staged = self.stage(ca)?;
        info!("Adding CA certificate to the user trust store as a trusted root");
        install_platform(&staged, ca)
    }
}

/// Trust store that does nothing, for `install_trust = false`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTrustStore;

impl TrustStore for NoopTrustStore {
    fn install(&self, _ca: &PemCertificate) -> Result<(), CaError> {
        debug!("Trust store installation disabled, skipping");
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn install_platform(_staged: &std::path::Path, ca: &PemCertificate) -> Result<(), CaError> {
    let target = PathBuf::from("/usr/local/share/ca-certificates").join(STAGED_CERT_NAME);
    ca.write(&target).map_err(|e| CaError::TrustStore {
        operation: "copy_ca_certificate".to_string(),
        detail: e.to_string(),
    })?;
    run_command("update-ca-certificates", std::iter::empty::<&str>())
}

#[cfg(target_os = "macos")]
fn install_platform(staged: &std::path::Path, _ca: &PemCertificate) -> Result<(), CaError> {
    let keychain = dirs::home_dir()
        .map(|home| home.join("Library/Keychains/login.keychain-db"))
        .ok_or_else(|| CaError::TrustStore {
            operation: "locate_login_keychain".to_string(),
            detail: "home directory not found".to_string(),
        })?;
    run_command(
        "security",
        [
            OsStr::new("add-trusted-cert"),
            OsStr::new("-d"),
            OsStr::new("-r"),
            OsStr::new("trustRoot"),
            OsStr::new("-k"),
            keychain.as_os_str(),
            staged.as_os_str(),
        ],
    )
}

#[cfg(target_os = "windows")]
fn install_platform(staged: &std::path::Path, _ca: &PemCertificate) -> Result<(), CaError> {
    run_command(
        "certutil",
        [
            OsStr::new("-addstore"),
            OsStr::new("-user"),
            OsStr::new("-f"),
            OsStr::new("ROOT"),
            staged.as_os_str(),
        ],
    )
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn install_platform(_staged: &std::path::Path, _ca: &PemCertificate) -> Result<(), CaError> {
    Err(CaError::TrustStoreUnsupported)
}

/// Run a trust store command, mapping spawn failures and non-zero exits.
fn run_command<I, S>(program: &str, args: I) -> Result<(), CaError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| CaError::TrustStore {
            operation: program.to_string(),
            detail: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(CaError::TrustStore {
            operation: program.to_string(),
            detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    debug!("{} completed", program);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_command_missing_program() {
        let result = run_command("definitely-not-a-real-trust-tool", ["--help"]);
        assert!(matches!(result, Err(CaError::TrustStore { .. })));
    }

    #[test]
    fn test_noop_trust_store() {
        let key = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384).unwrap();
        let ca = super::super::cert::issue_certificate_for(
            &key,
            "test",
            time::OffsetDateTime::now_utc() + time::Duration::days(1),
            true,
            None,
        )
        .unwrap();
        assert!(NoopTrustStore.install(&ca).is_ok());
    }
}
