//! Process startup and lifecycle.
//!
//! Credentials are provisioned synchronously before anything listens, then
//! the proxy runs on a multi-threaded Tokio runtime until Ctrl-C.

use crate::ca::{CaError, CertManager, Credentials, NoopTrustStore, SystemTrustStore, TrustStore};
use crate::config::{Config, ConfigError, Settings};
use crate::proxy::{ProxyError, ProxyServer};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Errors that stop the process before or while serving.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// The configuration does not describe a runnable proxy.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The certificate directory could not be created.
    #[error("Failed to create certificate directory {path}: {source}")]
    CertDir {
        /// Directory we tried to create.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Key or certificate provisioning failed.
    #[error(transparent)]
    Certificates(#[from] CaError),

    /// The listener could not be set up or failed.
    #[error(transparent)]
    Proxy(#[from] ProxyError),

    /// The async runtime could not be started.
    #[error("Failed to create tokio runtime: {0}")]
    Runtime(#[source] std::io::Error),
}

/// Make sure the credentials for `settings` exist and are current.
///
/// Creates the certificate directory when missing. In the client role a newly
/// generated CA is installed into the platform trust store unless
/// installation is disabled.
pub fn bootstrap(settings: &Settings) -> Result<Arc<Credentials>, BootstrapError> {
    std::fs::create_dir_all(&settings.cert_dir).map_err(|source| BootstrapError::CertDir {
        path: settings.cert_dir.clone(),
        source,
    })?;
    debug!("Certificate directory: {:?}", settings.cert_dir);

    let system;
    let trust: &dyn TrustStore = if settings.install_trust {
        system = SystemTrustStore::new(&settings.cert_dir);
        &system
    } else {
        &NoopTrustStore
    };

    let credentials =
        CertManager::new(&settings.certs, settings.role(), trust).provision(settings.hostname())?;
    info!(
        "Credentials ready (CA valid until {})",
        credentials.ca().not_after()
    );
    Ok(Arc::new(credentials))
}

/// Resolve `config`, provision credentials and serve until Ctrl-C.
pub fn run(config: &Config) -> Result<(), BootstrapError> {
    let settings = config.resolve()?;
    debug!("Resolved settings: {:?}", settings);

    let credentials = bootstrap(&settings)?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(BootstrapError::Runtime)?;

    rt.block_on(async move {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = ProxyServer::new(&settings, credentials, shutdown_rx)?;
        let listener = server.bind().await?;

        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl-C: {}", e);
                // Keep the sender alive so the server keeps running.
                std::future::pending::<()>().await;
            }
            info!("Interrupt received");
            // The server may already be gone.
            let _ = shutdown_tx.send(true);
        });

        server.serve(listener).await?;
        Ok::<(), BootstrapError>(())
    })
}
