//! Command-line interface definitions for fronting-proxy.
//!
//! Uses clap's derive API for type-safe argument parsing. Every flag is
//! optional so that unset flags never override the config files.

use clap::Parser;
use std::path::PathBuf;

/// Domain-fronting forward proxy.
///
/// Run with --server to act as the client role: listen for local HTTP proxy
/// requests (including CONNECT) and forward them, disguised as requests to a
/// CDN front-end, to a server-role instance. Without --server the process is
/// the server role: it listens with HTTPS, removes the disguise and forwards
/// to the real destination.
#[derive(Parser, Debug)]
#[command(name = "fronting-proxy")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// ip:port on which to listen for requests.
    ///
    /// The client role listens with plain HTTP, the server role with HTTPS.
    #[arg(long = "addr", value_name = "IP:PORT")]
    pub addr: Option<String>,

    /// Front-end hostname at which to reach a server-role proxy (always HTTPS).
    ///
    /// When given, this process runs as the client role; otherwise it runs as
    /// the server role.
    #[arg(long = "server", value_name = "HOST")]
    pub server: Option<String>,

    /// Port on which to connect to the front-end [default: 443].
    #[arg(long = "server-port", alias = "serverPort", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Hostname presented as TLS SNI and Host header instead of the front-end.
    ///
    /// Connections still go to the front-end's address.
    #[arg(long = "masquerade", value_name = "HOST")]
    pub masquerade: Option<String>,

    /// Public hostname of the server role, used for its certificate.
    ///
    /// Defaults to the host part of --addr.
    #[arg(long = "hostname", value_name = "HOST")]
    pub hostname: Option<String>,

    /// Directory in which to store the key and certificates.
    ///
    /// Defaults to the current directory.
    #[arg(long = "config-dir", alias = "configDir", value_name = "DIR")]
    pub config_dir: Option<PathBuf>,

    /// Path to additional config file.
    ///
    /// This config file is merged on top of the user config, giving it the
    /// highest priority (except for CLI flags).
    #[arg(short = 'c', long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Increase log verbosity.
    ///
    /// Can be specified multiple times:
    /// -v    = info level
    /// -vv   = debug level
    /// -vvv  = trace level
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}
