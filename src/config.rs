// src/config.rs
//! Configuration file parsing for catalog-sync
//!
//! Supports TOML configuration files with the following sections:
//! - [artifact] - Live file location and integrity rules
//! - [remote] - Version endpoint, mirrors, HTTP timeouts
//! - [sync] - Check interval, lock staleness, state storage
//! - [trigger] - Manual trigger secret, trusted proxies, abuse limits
//! - [logging] - Log file location and rotation
//!
//! `CATALOG_SYNC_SECRET_KEY` and `CATALOG_SYNC_TRUSTED_PROXIES` override
//! the trigger section when set.

use crate::error::Error;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Secret shipped in sample configs; refusing it keeps unconfigured installs closed
pub const PLACEHOLDER_SECRET: &str = "your_secret_key_here_change_me";

/// Environment variable overriding `trigger.secret_key`
pub const SECRET_KEY_ENV: &str = "CATALOG_SYNC_SECRET_KEY";

/// Environment variable overriding `trigger.trusted_proxies`
pub const TRUSTED_PROXIES_ENV: &str = "CATALOG_SYNC_TRUSTED_PROXIES";

/// TOML configuration file structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub artifact: ArtifactSection,

    #[serde(default)]
    pub remote: RemoteSection,

    #[serde(default)]
    pub sync: SyncSection,

    #[serde(default)]
    pub trigger: TriggerSection,

    #[serde(default)]
    pub logging: LoggingSection,
}

/// Managed artifact and its integrity rules
#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactSection {
    /// Canonical path of the live artifact
    #[serde(default = "default_artifact_path")]
    pub path: PathBuf,

    /// Minimum acceptable candidate size in bytes
    #[serde(default = "default_min_size")]
    pub min_size: u64,

    /// Tables that must exist in a candidate
    #[serde(default = "default_required_tables")]
    pub required_tables: Vec<String>,

    /// Table whose columns are checked
    #[serde(default = "default_primary_table")]
    pub primary_table: String,

    /// Columns that must exist on the primary table
    #[serde(default = "default_required_columns")]
    pub required_columns: Vec<String>,
}

impl Default for ArtifactSection {
    fn default() -> Self {
        Self {
            path: default_artifact_path(),
            min_size: default_min_size(),
            required_tables: default_required_tables(),
            primary_table: default_primary_table(),
            required_columns: default_required_columns(),
        }
    }
}

fn default_artifact_path() -> PathBuf {
    PathBuf::from("data/cards.cdb")
}

fn default_min_size() -> u64 {
    1024
}

fn default_required_tables() -> Vec<String> {
    vec!["datas".to_string(), "texts".to_string()]
}

fn default_primary_table() -> String {
    "datas".to_string()
}

fn default_required_columns() -> Vec<String> {
    ["id", "type", "atk", "def", "level"]
        .iter()
        .map(|c| c.to_string())
        .collect()
}

/// Remote source settings
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteSection {
    /// Repository in `owner/name` form
    #[serde(default = "default_repository")]
    pub repository: String,

    /// Branch whose history is tracked
    #[serde(default = "default_branch")]
    pub branch: String,

    /// Path of the artifact inside the repository
    #[serde(default = "default_tracked_path")]
    pub tracked_path: String,

    /// Base URL of the version metadata API
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Download mirrors, tried strictly in order
    #[serde(default = "default_mirrors")]
    pub mirrors: Vec<String>,

    /// User-Agent sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Total timeout for the version query (e.g., "10s")
    #[serde(default = "default_oracle_timeout")]
    pub oracle_timeout: String,

    /// Connect timeout per mirror attempt
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: String,

    /// Total timeout per mirror attempt
    #[serde(default = "default_download_timeout")]
    pub download_timeout: String,

    /// Maximum redirect hops followed per request
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
}

impl Default for RemoteSection {
    fn default() -> Self {
        Self {
            repository: default_repository(),
            branch: default_branch(),
            tracked_path: default_tracked_path(),
            api_base: default_api_base(),
            mirrors: default_mirrors(),
            user_agent: default_user_agent(),
            oracle_timeout: default_oracle_timeout(),
            connect_timeout: default_connect_timeout(),
            download_timeout: default_download_timeout(),
            max_redirects: default_max_redirects(),
        }
    }
}

fn default_repository() -> String {
    "FogMoe/galaxycardgame".to_string()
}

fn default_branch() -> String {
    "master".to_string()
}

fn default_tracked_path() -> String {
    "cards.cdb".to_string()
}

fn default_api_base() -> String {
    "https://api.github.com".to_string()
}

fn default_mirrors() -> Vec<String> {
    vec![
        "https://raw.githubusercontent.com/FogMoe/galaxycardgame/master/cards.cdb".to_string(),
        "https://github.com/FogMoe/galaxycardgame/raw/refs/heads/master/cards.cdb".to_string(),
    ]
}

fn default_user_agent() -> String {
    format!("catalog-sync/{}", env!("CARGO_PKG_VERSION"))
}

fn default_oracle_timeout() -> String {
    "10s".to_string()
}

fn default_connect_timeout() -> String {
    "10s".to_string()
}

fn default_download_timeout() -> String {
    "30s".to_string()
}

fn default_max_redirects() -> usize {
    5
}

/// Scheduling and local state settings
#[derive(Debug, Clone, Deserialize)]
pub struct SyncSection {
    /// Minimum time between version checks (e.g., "1h")
    #[serde(default = "default_check_interval")]
    pub check_interval: String,

    /// Age after which an update lock is considered abandoned
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout: String,

    /// SQLite file holding sync state and rate-limit records
    #[serde(default = "default_state_db")]
    pub state_db: PathBuf,

    /// Directory holding the update lock marker
    #[serde(default = "default_lock_dir")]
    pub lock_dir: PathBuf,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            check_interval: default_check_interval(),
            lock_timeout: default_lock_timeout(),
            state_db: default_state_db(),
            lock_dir: default_lock_dir(),
        }
    }
}

fn default_check_interval() -> String {
    "1h".to_string()
}

fn default_lock_timeout() -> String {
    "5m".to_string()
}

fn default_state_db() -> PathBuf {
    PathBuf::from("data/sync-state.db")
}

fn default_lock_dir() -> PathBuf {
    PathBuf::from("data")
}

/// Manual trigger settings
#[derive(Debug, Clone, Deserialize)]
pub struct TriggerSection {
    /// Address the trigger server listens on
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Shared secret required by the trigger
    #[serde(default)]
    pub secret_key: Option<String>,

    /// Intermediaries whose X-Forwarded-For header is believed
    #[serde(default)]
    pub trusted_proxies: Vec<String>,

    /// Failed attempts within the window that trigger a block
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Sliding window for counting failures (e.g., "5m")
    #[serde(default = "default_attempt_window")]
    pub attempt_window: String,

    /// How long a blocked client stays blocked (e.g., "15m")
    #[serde(default = "default_block_duration")]
    pub block_duration: String,
}

impl Default for TriggerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            secret_key: None,
            trusted_proxies: Vec::new(),
            max_attempts: default_max_attempts(),
            attempt_window: default_attempt_window(),
            block_duration: default_block_duration(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8090".to_string()
}

fn default_max_attempts() -> u32 {
    5
}

fn default_attempt_window() -> String {
    "5m".to_string()
}

fn default_block_duration() -> String {
    "15m".to_string()
}

/// Log file settings
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSection {
    /// Append-only log file; stderr only when absent
    #[serde(default = "default_log_file")]
    pub file: Option<PathBuf>,

    /// Rotate once the live file grows past this size (e.g., "1MB")
    #[serde(default = "default_log_max_size")]
    pub max_size: String,

    /// Rotated generations kept on disk
    #[serde(default = "default_log_keep")]
    pub keep: usize,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            file: default_log_file(),
            max_size: default_log_max_size(),
            keep: default_log_keep(),
        }
    }
}

fn default_log_file() -> Option<PathBuf> {
    Some(PathBuf::from("data/update.log"))
}

fn default_log_max_size() -> String {
    "1MB".to_string()
}

fn default_log_keep() -> usize {
    5
}

impl SyncConfig {
    /// Load configuration from a TOML file and apply environment overrides
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config: SyncConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a file
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(key) = std::env::var(SECRET_KEY_ENV) {
            self.trigger.secret_key = Some(key.trim().to_string());
        }
        if let Ok(list) = std::env::var(TRUSTED_PROXIES_ENV) {
            self.trigger.trusted_proxies = split_list(&list);
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.trigger
            .bind
            .parse::<SocketAddr>()
            .with_context(|| format!("Invalid trigger.bind address: {}", self.trigger.bind))?;

        if self.remote.mirrors.is_empty() {
            anyhow::bail!("remote.mirrors must list at least one URL");
        }
        for mirror in &self.remote.mirrors {
            url::Url::parse(mirror)
                .with_context(|| format!("Invalid mirror URL: {}", mirror))?;
        }
        url::Url::parse(&self.remote.api_base)
            .with_context(|| format!("Invalid remote.api_base: {}", self.remote.api_base))?;

        if self.trigger.max_attempts == 0 {
            anyhow::bail!("trigger.max_attempts must be at least 1");
        }

        for proxy in &self.trigger.trusted_proxies {
            proxy
                .parse::<IpAddr>()
                .with_context(|| format!("Invalid trusted proxy address: {}", proxy))?;
        }

        // Surface bad duration strings at load time rather than first use
        self.check_interval()?;
        self.lock_timeout()?;
        self.oracle_timeout()?;
        self.connect_timeout()?;
        self.download_timeout()?;
        self.attempt_window()?;
        self.block_duration()?;
        self.log_max_bytes()?;

        Ok(())
    }

    pub fn check_interval(&self) -> Result<Duration> {
        parse_duration(&self.sync.check_interval)
    }

    pub fn lock_timeout(&self) -> Result<Duration> {
        parse_duration(&self.sync.lock_timeout)
    }

    pub fn oracle_timeout(&self) -> Result<Duration> {
        parse_duration(&self.remote.oracle_timeout)
    }

    pub fn connect_timeout(&self) -> Result<Duration> {
        parse_duration(&self.remote.connect_timeout)
    }

    pub fn download_timeout(&self) -> Result<Duration> {
        parse_duration(&self.remote.download_timeout)
    }

    pub fn attempt_window(&self) -> Result<Duration> {
        parse_duration(&self.trigger.attempt_window)
    }

    pub fn block_duration(&self) -> Result<Duration> {
        parse_duration(&self.trigger.block_duration)
    }

    pub fn log_max_bytes(&self) -> Result<u64> {
        parse_size(&self.logging.max_size)
    }

    /// Trusted proxy list as parsed addresses
    pub fn trusted_proxies(&self) -> Vec<IpAddr> {
        self.trigger
            .trusted_proxies
            .iter()
            .filter_map(|p| p.parse().ok())
            .collect()
    }

    /// The trigger secret, refusing missing and placeholder values
    pub fn secret_key(&self) -> std::result::Result<&str, Error> {
        match self.trigger.secret_key.as_deref().map(str::trim) {
            None | Some("") => Err(Error::ConfigFailure(format!(
                "no trigger secret configured; set trigger.secret_key or {}",
                SECRET_KEY_ENV
            ))),
            Some(PLACEHOLDER_SECRET) => Err(Error::ConfigFailure(
                "trigger secret is still the placeholder value; change it before enabling the trigger"
                    .to_string(),
            )),
            Some(key) => Ok(key),
        }
    }

    /// Trigger bind address
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.trigger
            .bind
            .parse()
            .with_context(|| format!("Invalid trigger bind address: {}", self.trigger.bind))
    }
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse a human-readable size string (e.g., "1MB", "512KB", "2048")
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim().to_uppercase();

    let (num_str, multiplier) = if let Some(n) = s.strip_suffix("GB") {
        (n, 1024u64 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix("MB") {
        (n, 1024u64 * 1024)
    } else if let Some(n) = s.strip_suffix("KB") {
        (n, 1024u64)
    } else if let Some(n) = s.strip_suffix('B') {
        (n, 1u64)
    } else {
        // Assume bytes
        (s.as_str(), 1u64)
    };

    let num: f64 = num_str
        .trim()
        .parse()
        .with_context(|| format!("Invalid size number: {}", num_str))?;

    Ok((num * multiplier as f64) as u64)
}

/// Parse a human-readable duration string (e.g., "15m", "1h", "30s")
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim().to_lowercase();

    let (num_str, multiplier) = if let Some(n) = s.strip_suffix('d') {
        (n, 24 * 60 * 60)
    } else if let Some(n) = s.strip_suffix('h') {
        (n, 60 * 60)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 60)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1)
    } else {
        // Assume seconds
        (s.as_str(), 1)
    };

    let num: u64 = num_str
        .trim()
        .parse()
        .with_context(|| format!("Invalid duration number: {}", num_str))?;

    Ok(Duration::from_secs(num * multiplier))
}
