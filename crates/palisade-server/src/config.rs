//! CLI arguments with an optional TOML file overlay.
//!
//! Precedence: explicit command-line flags always win; a `--config` file
//! fills in anything left at its default.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use crate::firewall::FirewallConfig;

/// Connection runtime server.
#[derive(Parser, Debug)]
#[command(name = "palisade-server")]
#[command(about = "Connection runtime server: handshake, packet dispatch, firewall")]
#[command(version)]
pub struct Args {
    /// Address to bind to.
    #[arg(short, long, default_value = "0.0.0.0:7878")]
    pub bind: String,

    /// Optional TOML config file overlaying the defaults below.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Largest single frame accepted from a peer, in bytes.
    #[arg(long, default_value = "65536")]
    pub max_frame: usize,

    /// Maximum concurrent connections.
    #[arg(long, default_value = "10000")]
    pub max_connections: usize,

    /// Bandwidth budget per endpoint per reset window, in bytes.
    #[arg(long, default_value = "1000000")]
    pub bytes_per_second: u32,

    /// Burst size (concurrent in-flight charges) per endpoint.
    #[arg(long, default_value = "65536")]
    pub burst_size: u32,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML overlay; every field is optional so a config file can set just one
/// value and leave the rest at the CLI defaults.
#[derive(Debug, Default, Deserialize)]
pub struct FileOverlay {
    /// Overrides the listen address.
    pub bind: Option<String>,
    /// Overrides the maximum frame size.
    pub max_frame: Option<usize>,
    /// Overrides the maximum concurrent connection count.
    pub max_connections: Option<usize>,
    /// Overrides the bandwidth limiter's sustained rate.
    pub bytes_per_second: Option<u32>,
    /// Overrides the bandwidth limiter's burst size.
    pub burst_size: Option<u32>,
    /// Overrides the tracing log level.
    pub log_level: Option<String>,
}

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the listener binds to.
    pub bind: String,
    /// Maximum frame size the stream handler accepts.
    pub max_frame: usize,
    /// Maximum number of concurrently open connections.
    pub max_connections: usize,
    /// Bandwidth limiter configuration.
    pub firewall: FirewallConfig,
    /// Tracing log level (e.g. `"info"`, `"debug"`).
    pub log_level: String,
}

impl ServerConfig {
    /// Resolve final configuration from CLI args, applying a TOML overlay
    /// (if `--config` was given) under the CLI's explicit values.
    ///
    /// # Errors
    ///
    /// Returns an error message if the config file can't be read or parsed.
    pub fn resolve(args: Args) -> Result<Self, String> {
        let overlay = match &args.config {
            Some(path) => {
                let contents =
                    std::fs::read_to_string(path).map_err(|err| format!("reading {}: {err}", path.display()))?;
                toml::from_str::<FileOverlay>(&contents)
                    .map_err(|err| format!("parsing {}: {err}", path.display()))?
            },
            None => FileOverlay::default(),
        };

        Ok(Self {
            bind: overlay.bind.unwrap_or(args.bind),
            max_frame: overlay.max_frame.unwrap_or(args.max_frame),
            max_connections: overlay.max_connections.unwrap_or(args.max_connections),
            firewall: FirewallConfig {
                bytes_per_second: overlay.bytes_per_second.unwrap_or(args.bytes_per_second),
                burst_size: overlay.burst_size.unwrap_or(args.burst_size),
                reset_interval: Duration::from_secs(1),
            },
            log_level: overlay.log_level.unwrap_or(args.log_level),
        })
    }
}
