use anyhow::{Context, Result};
use fleetaudit_core::logging::LogConfig;
use report::TlsPolicy;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG: &str = "fleetaudit.yaml";
pub const DEFAULT_DATABASE: &str = "fleetaudit.db";

#[derive(Debug, Default, Deserialize, Clone)]
#[serde(default)]
pub struct ScanConfig {
    pub user: Option<String>,
    pub identity_file: Option<PathBuf>,
    pub ssh_port: Option<u16>,
    pub use_sudo: bool,
    pub command_timeout_secs: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    pub handshake_timeout_ms: Option<u64>,
    /// CIDR preferred when a host has several addresses.
    pub preferred_network: Option<String>,
    pub exclude_paths: Vec<String>,
}

#[derive(Debug, Default, Deserialize, Clone)]
#[serde(default)]
pub struct DirectoryConfig {
    pub url: String,
    pub deployment: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout_secs: Option<u64>,
    pub gateway_host: Option<String>,
    pub gateway_user: Option<String>,
    pub gateway_identity_file: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    pub database: Option<PathBuf>,
    pub scan: ScanConfig,
    pub tls: TlsPolicy,
    pub directory: Option<DirectoryConfig>,
    pub logging: LogConfig,
}

/// Explicit path must exist; otherwise `./fleetaudit.yaml` is read when present. A file that
/// does not parse is an error, never silently ignored.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let p = Path::new(DEFAULT_CONFIG);
            if p.exists() { p.to_path_buf() } else { return Ok(Config::default()); }
        }
    };
    let s = fs::read_to_string(&path).with_context(|| format!("reading config {}", path.display()))?;
    parse_config(&s).with_context(|| format!("parsing config {}", path.display()))
}

pub fn parse_config(text: &str) -> Result<Config> {
    if text.trim().is_empty() {
        return Ok(Config::default());
    }
    Ok(serde_yaml::from_str(text)?)
}
