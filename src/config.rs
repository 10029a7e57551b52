//! Configuration loader and validator for the ASP exchange jobs.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::formatter::is_valid_siret;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub sftp: SftpSettings,
    pub exchange: Exchange,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
}

/// ASP SFTP endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SftpSettings {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    pub private_key_path: String,
    #[serde(default)]
    pub private_key_passphrase: Option<String>,
    /// Hex SHA-256 of the server host key; checked when set.
    #[serde(default)]
    pub host_fingerprint: Option<String>,
    pub upload_dir: String,
    pub download_dir: String,
    pub connect_timeout_ms: u64,
}

fn default_port() -> u16 {
    22
}

/// Limits and sandbox settings of the exchange itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Exchange {
    pub max_batches_per_run: usize,
    pub max_sweep_notifications: usize,
    pub max_archive_per_run: usize,
    /// Measure code -> SIRET accepted by ASP's test platform.
    #[serde(default)]
    pub test_sirets: BTreeMap<String, String>,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// `DATABASE_URL` if set, otherwise the SQLite file under `app.data_dir`.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL").unwrap_or_else(|_| {
            format!(
                "sqlite://{}/exchange.db",
                self.app.data_dir.trim_end_matches('/')
            )
        })
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }

    let s = &cfg.sftp;
    if s.host.trim().is_empty() {
        return Err(ConfigError::Invalid("sftp.host must be non-empty"));
    }
    if s.user.trim().is_empty() {
        return Err(ConfigError::Invalid("sftp.user must be non-empty"));
    }
    if s.private_key_path.trim().is_empty() {
        return Err(ConfigError::Invalid("sftp.private_key_path must be non-empty"));
    }
    if s.upload_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("sftp.upload_dir must be non-empty"));
    }
    if s.download_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("sftp.download_dir must be non-empty"));
    }
    if s.connect_timeout_ms == 0 {
        return Err(ConfigError::Invalid("sftp.connect_timeout_ms must be > 0"));
    }

    if cfg.exchange.max_batches_per_run == 0 {
        return Err(ConfigError::Invalid("exchange.max_batches_per_run must be > 0"));
    }
    if cfg.exchange.test_sirets.values().any(|siret| !is_valid_siret(siret)) {
        return Err(ConfigError::Invalid(
            "exchange.test_sirets values must be 14-digit SIRETs",
        ));
    }

    Ok(())
}

/// Returns the example YAML content.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

sftp:
  host: "sftp.asp.example"
  port: 22
  user: "itou"
  private_key_path: "./keys/asp"
  upload_dir: "depot"
  download_dir: "retrait"
  connect_timeout_ms: 5000

exchange:
  max_batches_per_run: 5
  max_sweep_notifications: 100
  max_archive_per_run: 1000
  test_sirets:
    ACI_DC: "33055039301440"
    EI_DC: "25250191101231"
"#
}
