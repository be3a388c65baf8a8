//! Configuration loading with hierarchy merging.
//!
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. Embedded defaults (compiled into binary)
//! 2. User config: `~/.config/fronting-proxy/config.toml`
//! 3. Additional config file (via `--config` flag)
//! 4. CLI flags (highest priority)
//!
//! Scalars are **overridden** when the later source sets them.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::error::ConfigError;
use super::schema::{CertsConfig, Config, ListenConfig, UpstreamConfig};
use crate::cli::Cli;

/// User configuration directory name.
pub const USER_CONFIG_DIR: &str = "fronting-proxy";

/// User configuration filename.
pub const USER_CONFIG_FILE: &str = "config.toml";

/// Configuration shipped with the binary.
const EMBEDDED_DEFAULTS: &str = include_str!("../../config/default.toml");

/// Configuration loader with support for hierarchy merging.
pub struct ConfigLoader {
    /// Path to user configuration.
    user_path: PathBuf,
}

impl ConfigLoader {
    /// Create a new ConfigLoader with default paths.
    #[must_use]
    pub fn new() -> Self {
        let user_config_dir = dirs::config_dir()
            .map(|p| p.join(USER_CONFIG_DIR))
            .unwrap_or_else(|| PathBuf::from(".config").join(USER_CONFIG_DIR));

        Self {
            user_path: user_config_dir.join(USER_CONFIG_FILE),
        }
    }

    /// Create a ConfigLoader with a custom user config path (for testing).
    #[must_use]
    pub fn with_path(user_path: PathBuf) -> Self {
        Self { user_path }
    }

    /// Load and merge configuration from all sources.
    ///
    /// Missing config files are not errors - they are simply skipped, except
    /// an explicit `--config` file. Invalid TOML is an error.
    pub fn load(&self, cli: &Cli) -> Result<Config, ConfigError> {
        let mut config: Config =
            toml::from_str(EMBEDDED_DEFAULTS).map_err(|e| ConfigError::ParseError {
                path: PathBuf::from("<embedded:default.toml>"),
                source: e,
            })?;
        debug!("Loaded embedded default configuration");

        if let Some(user_config) = self.load_file(&self.user_path)? {
            config.merge(user_config);
            debug!("Loaded user config from {:?}", self.user_path);
        } else {
            debug!("No user config found at {:?}", self.user_path);
        }

        if let Some(ref cli_config_path) = cli.config {
            match self.load_file(cli_config_path)? {
                Some(cli_config) => {
                    config.merge(cli_config);
                    debug!("Loaded additional config from {:?}", cli_config_path);
                }
                None => {
                    // Unlike the user config, a missing CLI-specified config is an error
                    return Err(ConfigError::ReadError {
                        path: cli_config_path.clone(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "Specified config file not found",
                        ),
                    });
                }
            }
        }

        config.merge(Self::from_cli(cli));

        Ok(config)
    }

    /// The layer contributed by CLI flags.
    fn from_cli(cli: &Cli) -> Config {
        Config {
            listen: ListenConfig {
                addr: cli.addr.clone().unwrap_or_default(),
                hostname: cli.hostname.clone().unwrap_or_default(),
                ..Default::default()
            },
            upstream: UpstreamConfig {
                server: cli.server.clone().unwrap_or_default(),
                port: cli.server_port.unwrap_or_default(),
                masquerade: cli.masquerade.clone().unwrap_or_default(),
                ca_file: None,
            },
            certs: CertsConfig {
                dir: cli.config_dir.clone(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Load a config file, returning None if it doesn't exist.
    fn load_file(&self, path: &Path) -> Result<Option<Config>, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let config: Config =
                    toml::from_str(&contents).map_err(|e| ConfigError::ParseError {
                        path: path.to_path_buf(),
                        source: e,
                    })?;
                Ok(Some(config))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ConfigError::ReadError {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
