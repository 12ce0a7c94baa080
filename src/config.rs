use serde::Deserialize;
use std::path::PathBuf;

use crate::cli::Cli;

fn default_port() -> u16 {
    8000
}

fn default_cache_root() -> PathBuf {
    PathBuf::from("./cache")
}

fn default_cert_path() -> PathBuf {
    PathBuf::from("./certs/ca-cert.pem")
}

fn default_key_path() -> PathBuf {
    PathBuf::from("./certs/ca-key.pem")
}

fn default_log_level() -> String {
    "ERROR".to_string()
}

/// TLS material location for the MITM certificate authority.
#[derive(Debug, Deserialize, Clone)]
pub struct HttpsConfig {
    #[serde(default = "default_cert_path")]
    pub cert_path: PathBuf,
    #[serde(default = "default_key_path")]
    pub key_path: PathBuf,
}

impl Default for HttpsConfig {
    fn default() -> Self {
        Self {
            cert_path: default_cert_path(),
            key_path: default_key_path(),
        }
    }
}

/// Process configuration, merged from (in ascending precedence) built-in
/// defaults, a TOML config file, environment variables, and CLI flags.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    #[serde(default = "default_port")]
    pub proxy_port: u16,
    #[serde(default)]
    pub whitelisted_domains: Vec<String>,
    #[serde(default)]
    pub https: HttpsConfig,
    #[serde(default = "default_cache_root")]
    pub cache_root: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proxy_port: default_port(),
            whitelisted_domains: Vec::new(),
            https: HttpsConfig::default(),
            cache_root: default_cache_root(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load the config file named by `cli.config` (if any), then overlay
    /// environment variables and explicit CLI flags, in that precedence.
    pub fn load(cli: &Cli) -> anyhow::Result<Self> {
        let mut config = match &cli.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .map_err(|e| anyhow::anyhow!("reading config file {path:?}: {e}"))?;
                toml::from_str(&raw)
                    .map_err(|e| anyhow::anyhow!("parsing config file {path:?}: {e}"))?
            }
            None => Config::default(),
        };

        if let Ok(port) = std::env::var("PORT") {
            config.proxy_port = port
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid PORT env var {port:?}: {e}"))?;
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.log_level = level;
        }

        if let Some(port) = cli.port {
            config.proxy_port = port;
        }
        if let Some(level) = &cli.log_level {
            config.log_level = level.clone();
        }
        if let Some(root) = &cli.cache_root {
            config.cache_root = root.clone();
        }

        Ok(config)
    }
}
