//! Configuration system for fronting-proxy.
//!
//! This module provides TOML configuration loading with hierarchy merging,
//! and validation into the immutable [`Settings`] used at runtime.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. Embedded defaults
//! 2. User config: `~/.config/fronting-proxy/config.toml`
//! 3. Additional config file (via `--config` flag)
//! 4. CLI flags (highest priority)
//!
//! Missing files are skipped, except an explicit `--config` file.
//!
//! # Role selection
//!
//! Setting `upstream.server` (or `--server`) runs the client role; otherwise
//! the process runs the server role:
//!
//! ```toml
//! [listen]
//! addr = "127.0.0.1:8080"
//!
//! [upstream]
//! server = "proxy.example.net"
//! masquerade = "cdn.example.com"
//! ```

mod error;
mod loader;
mod schema;
mod settings;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use schema::{CertsConfig, Config, GeneralConfig, ListenConfig, UpstreamConfig};
pub use settings::{
    Mode, ProxyRole, Settings, Timeouts, UpstreamSettings, DEFAULT_IDLE_TIMEOUT,
    DEFAULT_READ_TIMEOUT, DEFAULT_UPSTREAM_PORT, DEFAULT_WRITE_TIMEOUT,
};
