use clap::Parser;
use std::path::PathBuf;

/// Forwarding HTTP/HTTPS caching proxy with MITM TLS interception.
#[derive(Debug, Parser)]
#[command(name = "relay-proxy", version)]
pub struct Cli {
    /// TOML config file; overridden field-by-field by env vars and flags below.
    #[arg(long, env = "CONFIG_PATH")]
    pub config: Option<PathBuf>,

    /// Listener port. Overrides the config file and the PORT env var.
    #[arg(long)]
    pub port: Option<u16>,

    /// Log verbosity: ERROR, WARN, INFO, or DEBUG.
    #[arg(long = "log-level")]
    pub log_level: Option<String>,

    /// Root directory for the on-disk cache.
    #[arg(long = "cache-root")]
    pub cache_root: Option<PathBuf>,
}
