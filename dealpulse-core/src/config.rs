//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/dealpulse/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/dealpulse/` (~/.config/dealpulse/)
//! - Data: `$XDG_DATA_HOME/dealpulse/` (~/.local/share/dealpulse/)
//! - State/Logs: `$XDG_STATE_HOME/dealpulse/` (~/.local/state/dealpulse/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Remote ingestion and draft endpoints
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Circuit breaker tuning
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Autosave behaviour
    #[serde(default)]
    pub autosave: AutosaveConfig,

    /// Identity and referrer handling
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Local persistent storage
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Remote endpoint configuration
///
/// Remote writes only happen when `enabled` is set and a `base_url` is present.
#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Enable/disable remote writes
    #[serde(default)]
    pub enabled: bool,

    /// Backend base URL (e.g., `https://backend.example.com`)
    pub base_url: Option<String>,

    /// API key sent with every request
    pub api_key: Option<String>,

    /// Path of the event ingestion endpoint
    #[serde(default = "default_events_path")]
    pub events_path: String,

    /// Path of the draft create-or-update endpoint
    #[serde(default = "default_drafts_path")]
    pub drafts_path: String,

    /// Hard timeout for every remote call, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: None,
            api_key: None,
            events_path: default_events_path(),
            drafts_path: default_drafts_path(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl IngestConfig {
    /// Check if remote writes are enabled and configured
    pub fn is_ready(&self) -> bool {
        self.enabled && self.base_url.is_some()
    }

    /// Hard timeout as a `Duration`
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(Error::Config(
                "ingest.timeout_ms must be greater than zero".to_string(),
            ));
        }
        if !self.enabled {
            return Ok(());
        }
        match &self.base_url {
            None => Err(Error::Config(
                "ingest.base_url is required when ingest is enabled".to_string(),
            )),
            Some(url) => url::Url::parse(url)
                .map(|_| ())
                .map_err(|e| Error::Config(format!("ingest.base_url is invalid: {}", e))),
        }
    }
}

fn default_events_path() -> String {
    "/events".to_string()
}

fn default_drafts_path() -> String {
    "/valuation-drafts".to_string()
}

fn default_timeout_ms() -> u64 {
    3000
}

/// Circuit breaker configuration
#[derive(Debug, Deserialize, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker
    #[serde(default = "default_trip_threshold")]
    pub trip_threshold: u32,

    /// Failures after which tracking is disabled for the process lifetime
    #[serde(default = "default_disable_threshold")]
    pub disable_threshold: u32,

    /// Backoff base; doubled per recorded failure
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,

    /// Backoff ceiling
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            trip_threshold: default_trip_threshold(),
            disable_threshold: default_disable_threshold(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl BreakerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.trip_threshold == 0 {
            return Err(Error::Config(
                "breaker.trip_threshold must be at least 1".to_string(),
            ));
        }
        if self.disable_threshold < self.trip_threshold {
            return Err(Error::Config(
                "breaker.disable_threshold must not be lower than breaker.trip_threshold"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

fn default_trip_threshold() -> u32 {
    2
}

fn default_disable_threshold() -> u32 {
    10
}

fn default_base_backoff_ms() -> u64 {
    10_000
}

fn default_max_backoff_ms() -> u64 {
    600_000
}

/// Autosave configuration
#[derive(Debug, Deserialize, Clone)]
pub struct AutosaveConfig {
    /// Quiet period of the debounce coalescer
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Lifetime of a persisted session token
    #[serde(default = "default_token_ttl_hours")]
    pub token_ttl_hours: i64,

    /// Fields that always bypass the debounce window
    #[serde(default = "default_immediate_fields")]
    pub immediate_fields: Vec<String>,
}

impl Default for AutosaveConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            token_ttl_hours: default_token_ttl_hours(),
            immediate_fields: default_immediate_fields(),
        }
    }
}

impl AutosaveConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn token_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.token_ttl_hours)
    }
}

fn default_debounce_ms() -> u64 {
    300
}

fn default_token_ttl_hours() -> i64 {
    48
}

fn default_immediate_fields() -> Vec<String> {
    vec!["email".to_string(), "contact_email".to_string()]
}

/// Identity configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct IdentityConfig {
    /// Host of the site itself; never adopted as a visitor's company domain
    pub site_host: Option<String>,

    /// Extra referrer domains that never identify a company
    #[serde(default)]
    pub blocked_referrer_domains: Vec<String>,
}

/// Persistent storage configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct StorageConfig {
    /// Override path for the SQLite store
    pub path: Option<PathBuf>,
}

impl StorageConfig {
    /// Configured path, or the default under the XDG data directory
    pub fn resolved_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(Config::storage_path)
    }
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate all sections
    pub fn validate(&self) -> Result<()> {
        self.ingest.validate()?;
        self.breaker.validate()
    }

    /// `$XDG_CONFIG_HOME/dealpulse/config.toml` (~/.config/dealpulse/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("dealpulse").join("config.toml")
    }

    /// `$XDG_DATA_HOME/dealpulse/` (~/.local/share/dealpulse/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("dealpulse")
    }

    /// `$XDG_STATE_HOME/dealpulse/` (~/.local/state/dealpulse/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("dealpulse")
    }

    /// `$XDG_DATA_HOME/dealpulse/storage.db`
    pub fn storage_path() -> PathBuf {
        Self::data_dir().join("storage.db")
    }

    /// `$XDG_STATE_HOME/dealpulse/dealpulse.log`
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("dealpulse.log")
    }

    /// Ensure XDG base directory environment variables are set.
    ///
    /// This is mainly for CLI binaries that want explicit, stable path behavior
    /// before invoking other components that read these env vars.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(!config.ingest.enabled);
        assert_eq!(config.ingest.timeout(), Duration::from_secs(3));
        assert_eq!(config.breaker.trip_threshold, 2);
        assert_eq!(config.breaker.disable_threshold, 10);
        assert_eq!(config.breaker.max_backoff_ms, 600_000);
        assert_eq!(config.autosave.debounce(), Duration::from_millis(300));
        assert_eq!(config.autosave.token_ttl(), chrono::Duration::hours(48));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[ingest]
enabled = true
base_url = "https://backend.example.com"
api_key = "anon-key"
timeout_ms = 1500

[autosave]
debounce_ms = 500
immediate_fields = ["email", "phone"]

[identity]
site_host = "advisors.example.com"

[logging]
level = "debug"
"#;
        let config: Config = toml::from_str(toml).unwrap();

        assert!(config.ingest.is_ready());
        assert_eq!(config.ingest.events_path, "/events");
        assert_eq!(config.ingest.timeout(), Duration::from_millis(1500));
        assert_eq!(config.autosave.debounce_ms, 500);
        assert_eq!(config.autosave.immediate_fields, vec!["email", "phone"]);
        assert_eq!(config.autosave.token_ttl_hours, 48);
        assert_eq!(
            config.identity.site_host.as_deref(),
            Some("advisors.example.com")
        );
        assert_eq!(config.logging.level, "debug");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ingest_validation() {
        // Disabled config is valid without a URL
        assert!(IngestConfig::default().validate().is_ok());

        let config = IngestConfig {
            enabled: true,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(!config.is_ready());

        let config = IngestConfig {
            enabled: true,
            base_url: Some("not a url".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = IngestConfig {
            timeout_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_breaker_validation() {
        let config = BreakerConfig {
            trip_threshold: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = BreakerConfig {
            trip_threshold: 5,
            disable_threshold: 3,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_storage_path_override() {
        let config = StorageConfig {
            path: Some(PathBuf::from("/tmp/dealpulse-test.db")),
        };
        assert_eq!(
            config.resolved_path(),
            PathBuf::from("/tmp/dealpulse-test.db")
        );
        assert!(StorageConfig::default()
            .resolved_path()
            .ends_with("dealpulse/storage.db"));
    }
}
