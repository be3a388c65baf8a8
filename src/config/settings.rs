//! Resolved, immutable runtime settings.
//!
//! [`Config`] is the merged file/CLI view where everything is optional;
//! [`Config::resolve`] validates it once at startup and produces [`Settings`],
//! which is then shared read-only for the life of the process.

use super::error::ConfigError;
use super::schema::Config;
use crate::ca::CertPaths;
use std::path::PathBuf;
use std::time::Duration;

/// Front-end port used when none is configured.
pub const DEFAULT_UPSTREAM_PORT: u16 = 443;

/// Default time allowed to read a request head.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time allowed for an upstream exchange.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default idle timeout for relayed connections.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Log level used when neither CLI nor config set one.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Which side of the disguise this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyRole {
    /// Accepts local proxy requests and disguises them toward the front-end.
    Client,
    /// Sits behind the front-end, unwraps the disguise and reaches the origin.
    Server,
}

/// Where and how the client role reaches the server role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamSettings {
    /// Front-end hostname; TCP connections always go here.
    pub host: String,
    /// Front-end port.
    pub port: u16,
    /// Hostname presented to the network instead of the front-end.
    pub masquerade: Option<String>,
    /// Extra CA certificate trusted when dialing.
    pub ca_file: Option<PathBuf>,
}

impl UpstreamSettings {
    /// The hostname visible on the wire: SNI and the rewritten `Host`.
    pub fn outward_host(&self) -> &str {
        self.masquerade.as_deref().unwrap_or(&self.host)
    }

    /// `host:port` of the front-end.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Role plus the data only that role needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Client role.
    Client(UpstreamSettings),
    /// Server role.
    Server {
        /// Hostname the server certificate is issued for.
        public_host: String,
    },
}

impl Mode {
    /// The plain role.
    pub fn role(&self) -> ProxyRole {
        match self {
            Mode::Client(_) => ProxyRole::Client,
            Mode::Server { .. } => ProxyRole::Server,
        }
    }
}

/// Connection timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Reading a request head.
    pub read: Duration,
    /// One upstream request/response exchange.
    pub write: Duration,
    /// Silence on a relayed connection.
    pub idle: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            read: DEFAULT_READ_TIMEOUT,
            write: DEFAULT_WRITE_TIMEOUT,
            idle: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// Everything the process needs at runtime, validated.
#[derive(Debug, Clone)]
pub struct Settings {
    /// `host:port` to listen on.
    pub listen_addr: String,
    /// Role-specific settings.
    pub mode: Mode,
    /// Directory holding the credential files.
    pub cert_dir: PathBuf,
    /// Credential file locations.
    pub certs: CertPaths,
    /// Whether a new CA is installed into the OS trust store.
    pub install_trust: bool,
    /// Connection timeouts.
    pub timeouts: Timeouts,
    /// Log level from config.
    pub log_level: String,
}

impl Settings {
    /// The configured role.
    pub fn role(&self) -> ProxyRole {
        self.mode.role()
    }

    /// Hostname used for credentials: the public host in the server role,
    /// the listen host otherwise.
    pub fn hostname(&self) -> &str {
        match &self.mode {
            Mode::Server { public_host } => public_host,
            Mode::Client(_) => listen_host(&self.listen_addr),
        }
    }
}

impl Config {
    /// Validate the merged configuration and freeze it into [`Settings`].
    pub fn resolve(&self) -> Result<Settings, ConfigError> {
        let listen_addr = self.listen.addr.trim().to_string();
        if listen_addr.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "listen.addr".to_string(),
                message: "an ip:port to listen on is required".to_string(),
            });
        }
        if !has_port(&listen_addr) {
            return Err(ConfigError::InvalidValue {
                field: "listen.addr".to_string(),
                message: format!("'{}' is not of the form host:port", listen_addr),
            });
        }

        let upstream = &self.upstream;
        let mode = if upstream.server.trim().is_empty() {
            let public_host = if self.listen.hostname.trim().is_empty() {
                listen_host(&listen_addr).to_string()
            } else {
                self.listen.hostname.trim().to_string()
            };
            if public_host.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "listen.hostname".to_string(),
                    message: "the server role needs a public hostname; set --hostname or \
                              listen on an explicit host"
                        .to_string(),
                });
            }
            Mode::Server { public_host }
        } else {
            let masquerade = Some(upstream.masquerade.trim())
                .filter(|m| !m.is_empty())
                .map(str::to_string);
            Mode::Client(UpstreamSettings {
                host: upstream.server.trim().to_string(),
                port: if upstream.port == 0 {
                    DEFAULT_UPSTREAM_PORT
                } else {
                    upstream.port
                },
                masquerade,
                ca_file: upstream.ca_file.clone(),
            })
        };

        let cert_dir = self.certs.dir.clone().unwrap_or_else(|| PathBuf::from("."));
        let mut certs = CertPaths::in_dir(&cert_dir);
        if let Some(path) = &self.certs.key_file {
            certs.private_key = path.clone();
        }
        if let Some(path) = &self.certs.ca_cert_file {
            certs.ca_cert = path.clone();
        }
        if let Some(path) = &self.certs.server_cert_file {
            certs.server_cert = path.clone();
        }

        let secs_or = |secs: u64, default: Duration| {
            if secs == 0 {
                default
            } else {
                Duration::from_secs(secs)
            }
        };
        let timeouts = Timeouts {
            read: secs_or(self.listen.read_timeout_secs, DEFAULT_READ_TIMEOUT),
            write: secs_or(self.listen.write_timeout_secs, DEFAULT_WRITE_TIMEOUT),
            idle: secs_or(self.listen.idle_timeout_secs, DEFAULT_IDLE_TIMEOUT),
        };

        let log_level = if self.general.log_level.is_empty() {
            DEFAULT_LOG_LEVEL.to_string()
        } else {
            self.general.log_level.clone()
        };

        Ok(Settings {
            listen_addr,
            mode,
            cert_dir,
            certs,
            install_trust: self.certs.install_trust.unwrap_or(true),
            timeouts,
            log_level,
        })
    }
}

/// Host part of `host:port`, without IPv6 brackets.
fn listen_host(addr: &str) -> &str {
    let host = addr.rsplit_once(':').map_or(addr, |(host, _)| host);
    host.trim_start_matches('[').trim_end_matches(']')
}

fn has_port(addr: &str) -> bool {
    addr.rsplit_once(':')
        .is_some_and(|(_, port)| port.parse::<u16>().is_ok())
}
