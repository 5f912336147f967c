//! # Pipeline Configuration
//!
//! Configuration management for the delivery engine.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     TALLY_EVENTS_ENDPOINT=https://collector.example.com/track          │
//! │     TALLY_FLUSH_INTERVAL_MS=30000                                      │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/tally/tally.toml (Linux)                                 │
//! │     ~/Library/Application Support/com.tally.tally/tally.toml (macOS)   │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     bulk limit 40, flush every 60 s, batches of 50                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # tally.toml
//! [delivery]
//! events_endpoints = [
//!     "https://collector.example.com/track",
//!     "https://fallback.example.com/track",
//! ]
//! profile_endpoints = ["https://collector.example.com/engage"]
//! remote_config_endpoint = "https://collector.example.com/decide"
//! bulk_upload_limit = 40
//! flush_interval_ms = 60000
//! batch_size = 50
//!
//! [storage]
//! database_path = "/var/lib/tally/tally.db"
//! data_expiration_secs = 432000
//!
//! [client]
//! offline = false
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{SyncError, SyncResult};

/// Config file name inside the platform config directory.
pub const CONFIG_FILE_NAME: &str = "tally.toml";

// =============================================================================
// Delivery Settings
// =============================================================================

/// Endpoints, thresholds, and timeouts for delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliverySettings {
    /// Event collector URLs: primary first, then fallbacks.
    #[serde(default)]
    pub events_endpoints: Vec<String>,

    /// Profile collector URLs: primary first, then fallbacks.
    /// Empty disables profile delivery.
    #[serde(default)]
    pub profile_endpoints: Vec<String>,

    /// Remote config (decide) endpoint.
    #[serde(default)]
    pub remote_config_endpoint: Option<String>,

    /// Queue depth that triggers an immediate delivery.
    #[serde(default = "default_bulk_upload_limit")]
    pub bulk_upload_limit: u64,

    /// Delay before a scheduled flush. Zero or negative disables them.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: i64,

    /// Maximum records per delivered batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Connection timeout (seconds).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Total request timeout (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Sends the debug header so the collector logs verbosely.
    #[serde(default)]
    pub debug: bool,
}

fn default_bulk_upload_limit() -> u64 {
    40
}
fn default_flush_interval_ms() -> i64 {
    60_000
}
fn default_batch_size() -> u32 {
    50
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_request_timeout() -> u64 {
    30
}

impl Default for DeliverySettings {
    fn default() -> Self {
        DeliverySettings {
            events_endpoints: Vec::new(),
            profile_endpoints: Vec::new(),
            remote_config_endpoint: None,
            bulk_upload_limit: default_bulk_upload_limit(),
            flush_interval_ms: default_flush_interval_ms(),
            batch_size: default_batch_size(),
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
            debug: false,
        }
    }
}

// =============================================================================
// Storage Settings
// =============================================================================

/// Where and how long records are kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// SQLite file. Defaults to the platform data directory.
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// Records older than this are purged when a worker starts.
    #[serde(default = "default_data_expiration")]
    pub data_expiration_secs: u64,

    /// Queue depth at which new records are refused with the
    /// out-of-memory signal. Unlimited when unset.
    #[serde(default)]
    pub max_queue_depth: Option<u64>,
}

fn default_data_expiration() -> u64 {
    5 * 24 * 60 * 60
}

impl Default for StorageSettings {
    fn default() -> Self {
        StorageSettings {
            database_path: None,
            data_expiration_secs: default_data_expiration(),
            max_queue_depth: None,
        }
    }
}

// =============================================================================
// Client Settings
// =============================================================================

/// Host-level switches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Starts the transport in offline mode when no override is supplied.
    #[serde(default)]
    pub offline: bool,
}

// =============================================================================
// Main Configuration
// =============================================================================

/// Complete pipeline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TallyConfig {
    #[serde(default)]
    pub delivery: DeliverySettings,

    #[serde(default)]
    pub storage: StorageSettings,

    #[serde(default)]
    pub client: ClientSettings,
}

impl TallyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (tally.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        let endpoints = self
            .delivery
            .events_endpoints
            .iter()
            .chain(self.delivery.profile_endpoints.iter())
            .chain(self.delivery.remote_config_endpoint.iter());

        for endpoint in endpoints {
            validate_endpoint(endpoint)?;
        }

        if self.delivery.bulk_upload_limit == 0 {
            return Err(SyncError::InvalidConfig(
                "bulk_upload_limit must be greater than 0".into(),
            ));
        }

        if self.delivery.batch_size == 0 {
            return Err(SyncError::InvalidConfig(
                "batch_size must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Applies overrides from any key lookup (the process environment in
    /// production).
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("TALLY_EVENTS_ENDPOINT") {
            debug!(url = %url, "Overriding events endpoint from environment");
            set_primary(&mut self.delivery.events_endpoints, url);
        }

        if let Some(url) = lookup("TALLY_PROFILE_ENDPOINT") {
            debug!(url = %url, "Overriding profile endpoint from environment");
            set_primary(&mut self.delivery.profile_endpoints, url);
        }

        if let Some(url) = lookup("TALLY_REMOTE_CONFIG_ENDPOINT") {
            self.delivery.remote_config_endpoint = Some(url);
        }

        if let Some(interval) = lookup("TALLY_FLUSH_INTERVAL_MS") {
            match interval.parse::<i64>() {
                Ok(ms) => self.delivery.flush_interval_ms = ms,
                Err(_) => warn!(value = %interval, "Ignoring invalid TALLY_FLUSH_INTERVAL_MS"),
            }
        }

        if let Some(limit) = lookup("TALLY_BULK_UPLOAD_LIMIT") {
            match limit.parse::<u64>() {
                Ok(n) => self.delivery.bulk_upload_limit = n,
                Err(_) => warn!(value = %limit, "Ignoring invalid TALLY_BULK_UPLOAD_LIMIT"),
            }
        }

        if let Some(path) = lookup("TALLY_DATABASE_PATH") {
            self.storage.database_path = Some(PathBuf::from(path));
        }

        if let Some(offline) = lookup("TALLY_OFFLINE") {
            self.client.offline = matches!(
                offline.to_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "tally", "tally")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Delay before a scheduled flush, or `None` when disabled.
    pub fn flush_interval(&self) -> Option<Duration> {
        u64::try_from(self.delivery.flush_interval_ms)
            .ok()
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    pub fn data_expiration(&self) -> Duration {
        Duration::from_secs(self.storage.data_expiration_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery.request_timeout_secs)
    }

    /// The database file, falling back to the platform data directory.
    pub fn database_path(&self) -> PathBuf {
        self.storage.database_path.clone().unwrap_or_else(|| {
            directories::ProjectDirs::from("com", "tally", "tally")
                .map(|dirs| dirs.data_dir().join("tally.db"))
                .unwrap_or_else(|| PathBuf::from("tally.db"))
        })
    }
}

fn set_primary(endpoints: &mut Vec<String>, url: String) {
    match endpoints.first_mut() {
        Some(primary) => *primary = url,
        None => endpoints.push(url),
    }
}

fn validate_endpoint(endpoint: &str) -> SyncResult<()> {
    let url = Url::parse(endpoint)
        .map_err(|e| SyncError::InvalidUrl(format!("{}: {}", endpoint, e)))?;

    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(SyncError::InvalidUrl(format!(
            "Endpoint must use http or https, got {}: {}",
            other, endpoint
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = TallyConfig::default();
        assert_eq!(config.delivery.bulk_upload_limit, 40);
        assert_eq!(config.delivery.batch_size, 50);
        assert_eq!(config.flush_interval(), Some(Duration::from_secs(60)));
        assert_eq!(config.data_expiration(), Duration::from_secs(432_000));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_non_positive_interval_disables_scheduling() {
        let mut config = TallyConfig::default();
        config.delivery.flush_interval_ms = 0;
        assert_eq!(config.flush_interval(), None);
        config.delivery.flush_interval_ms = -5;
        assert_eq!(config.flush_interval(), None);
    }

    #[test]
    fn test_config_validation() {
        let mut config = TallyConfig::default();

        config.delivery.events_endpoints = vec!["ftp://collector".into()];
        assert!(config.validate().unwrap_err().is_config_error());

        config.delivery.events_endpoints = vec!["not a url".into()];
        assert!(config.validate().is_err());

        config.delivery.events_endpoints = vec!["https://collector.example.com/track".into()];
        assert!(config.validate().is_ok());

        config.delivery.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("TALLY_EVENTS_ENDPOINT", "https://primary.example.com/track"),
            ("TALLY_FLUSH_INTERVAL_MS", "1500"),
            ("TALLY_BULK_UPLOAD_LIMIT", "not-a-number"),
            ("TALLY_OFFLINE", "true"),
        ]);

        let mut config = TallyConfig::default();
        config.delivery.events_endpoints = vec![
            "https://old.example.com/track".into(),
            "https://fallback.example.com/track".into(),
        ];
        config.apply_overrides_from(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(
            config.delivery.events_endpoints,
            vec![
                "https://primary.example.com/track".to_string(),
                "https://fallback.example.com/track".to_string(),
            ]
        );
        assert_eq!(config.delivery.flush_interval_ms, 1500);
        assert_eq!(config.delivery.bulk_upload_limit, 40);
        assert!(config.client.offline);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);

        let mut config = TallyConfig::default();
        config.delivery.events_endpoints = vec!["https://collector.example.com/track".into()];
        config.delivery.flush_interval_ms = 5000;
        config.save(Some(path.clone())).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("[delivery]"));

        let loaded: TallyConfig = toml::from_str(&contents).unwrap();
        assert_eq!(loaded.delivery.flush_interval_ms, 5000);
        assert_eq!(loaded.delivery.events_endpoints.len(), 1);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: TallyConfig = toml::from_str("[delivery]\nbatch_size = 10\n").unwrap();
        assert_eq!(config.delivery.batch_size, 10);
        assert_eq!(config.delivery.bulk_upload_limit, 40);
        assert!(!config.client.offline);
    }
}
