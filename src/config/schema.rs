//! Configuration schema definitions.
//!
//! This module defines the structure of the fronting-proxy configuration
//! files. Configuration is loaded from multiple sources and merged in order:
//!
//! 1. Embedded defaults
//! 2. User config: `~/.config/fronting-proxy/config.toml`
//! 3. Additional config file (via `--config` flag)
//! 4. CLI flags (highest priority)
//!
//! Every field is optional in the files; unset scalars fall back to the
//! defaults applied by [`Config::resolve`](super::settings).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Local listener settings.
    #[serde(default)]
    pub listen: ListenConfig,

    /// Upstream (server-role proxy) settings. Presence of `server` selects
    /// the client role.
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Certificate and key file locations.
    #[serde(default)]
    pub certs: CertsConfig,
}

impl Config {
    /// Merge another config into this one.
    ///
    /// Scalars are overridden when the other value is non-default.
    pub fn merge(&mut self, other: Config) {
        self.general.merge(other.general);
        self.listen.merge(other.listen);
        self.upstream.merge(other.upstream);
        self.certs.merge(other.certs);
    }
}

/// General application settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct GeneralConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default)]
    pub log_level: String,
}

impl GeneralConfig {
    fn merge(&mut self, other: GeneralConfig) {
        if !other.log_level.is_empty() {
            self.log_level = other.log_level;
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ListenConfig {
    /// `ip:port` to listen on. Plain HTTP in the client role, HTTPS in the
    /// server role.
    #[serde(default)]
    pub addr: String,

    /// Public hostname of the server role, used for its certificate.
    /// Defaults to the host part of `addr`.
    #[serde(default)]
    pub hostname: String,

    /// Seconds allowed for reading a request head.
    #[serde(default)]
    pub read_timeout_secs: u64,

    /// Seconds allowed for an upstream request/response exchange.
    #[serde(default)]
    pub write_timeout_secs: u64,

    /// Seconds a relayed connection may stay silent before it is closed.
    #[serde(default)]
    pub idle_timeout_secs: u64,
}

impl ListenConfig {
    fn merge(&mut self, other: ListenConfig) {
        if !other.addr.is_empty() {
            self.addr = other.addr;
        }
        if !other.hostname.is_empty() {
            self.hostname = other.hostname;
        }
        if other.read_timeout_secs != 0 {
            self.read_timeout_secs = other.read_timeout_secs;
        }
        if other.write_timeout_secs != 0 {
            self.write_timeout_secs = other.write_timeout_secs;
        }
        if other.idle_timeout_secs != 0 {
            self.idle_timeout_secs = other.idle_timeout_secs;
        }
    }
}

/// Upstream configuration (client role only).
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct UpstreamConfig {
    /// Hostname of the front-end that reaches the server-role proxy.
    #[serde(default)]
    pub server: String,

    /// Port on the front-end (0 = default 443).
    #[serde(default)]
    pub port: u16,

    /// Hostname presented as SNI and Host to the network in place of the
    /// front-end.
    #[serde(default)]
    pub masquerade: String,

    /// Extra CA certificate (PEM) trusted when dialing the front-end.
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
}

impl UpstreamConfig {
    fn merge(&mut self, other: UpstreamConfig) {
        if !other.server.is_empty() {
            self.server = other.server;
        }
        if other.port != 0 {
            self.port = other.port;
        }
        if !other.masquerade.is_empty() {
            self.masquerade = other.masquerade;
        }
        if other.ca_file.is_some() {
            self.ca_file = other.ca_file;
        }
    }
}

/// Certificate and key storage.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct CertsConfig {
    /// Directory holding the key and certificates (default: current directory).
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// Override for the private key path.
    #[serde(default)]
    pub key_file: Option<PathBuf>,

    /// Override for the CA certificate path.
    #[serde(default)]
    pub ca_cert_file: Option<PathBuf>,

    /// Override for the server certificate path.
    #[serde(default)]
    pub server_cert_file: Option<PathBuf>,

    /// Install a newly generated CA into the OS trust store (client role).
    #[serde(default)]
    pub install_trust: Option<bool>,
}

impl CertsConfig {
    fn merge(&mut self, other: CertsConfig) {
        if other.dir.is_some() {
            self.dir = other.dir;
        }
        if other.key_file.is_some() {
            self.key_file = other.key_file;
        }
        if other.ca_cert_file.is_some() {
            self.ca_cert_file = other.ca_cert_file;
        }
        if other.server_cert_file.is_some() {
            self.server_cert_file = other.server_cert_file;
        }
        if other.install_trust.is_some() {
            self.install_trust = other.install_trust;
        }
    }
}
