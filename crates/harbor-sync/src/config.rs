//! # Sync Configuration
//!
//! Configuration for pairing, backend access and the sync scheduler.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     HARBOR_BACKEND_URL=https://api.example.com                         │
//! │     HARBOR_SYNC_INTERVAL_SECS=30                                       │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/harbor/sync.toml (Linux)                                 │
//! │     ~/Library/Application Support/com.harbor.pos/sync.toml (macOS)     │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [device]
//! client_id = "harbor-pos"
//! nickname = "Front till"
//!
//! [backend]
//! base_url = "https://api.harbor.example"
//! request_timeout_secs = 15
//! probe_path = "/health/"
//!
//! [sync]
//! interval_secs = 60
//! max_order_attempts = 10
//! retention_days = 30
//!
//! [pairing]
//! max_wait_secs = 900
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Device Configuration
// =============================================================================

/// How this terminal introduces itself during pairing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// OAuth-style client id sent with device-authorization requests.
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Optional label shown to the approving operator.
    #[serde(default)]
    pub nickname: Option<String>,
}

fn default_client_id() -> String {
    "harbor-pos".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            client_id: default_client_id(),
            nickname: None,
        }
    }
}

// =============================================================================
// Backend Settings
// =============================================================================

/// Where the backend lives and how long to wait for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSettings {
    /// Base URL; endpoint paths are joined onto it.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Per-request timeout (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Path probed to decide whether the terminal is online.
    #[serde(default = "default_probe_path")]
    pub probe_path: String,

    /// Timeout for the reachability probe (seconds).
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://localhost:8000".to_string()
}
fn default_request_timeout() -> u64 {
    30
}
fn default_probe_path() -> String {
    "/health/".to_string()
}
fn default_probe_timeout() -> u64 {
    3
}

impl Default for BackendSettings {
    fn default() -> Self {
        BackendSettings {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout(),
            probe_path: default_probe_path(),
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

/// Scheduler and queue behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Interval between scheduled cycles (seconds).
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// First backoff step after a failed cycle (milliseconds).
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Ceiling for the failure backoff (seconds).
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// Orders that reached this many attempts are left for the operator.
    #[serde(default = "default_max_order_attempts")]
    pub max_order_attempts: u32,

    /// Orders sent per flush.
    #[serde(default = "default_order_batch_size")]
    pub order_batch_size: u32,

    /// SYNCED orders older than this are swept (days). 0 disables the sweep.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_interval() -> u64 {
    60
}
fn default_initial_backoff() -> u64 {
    2_000
}
fn default_max_backoff() -> u64 {
    600
}
fn default_max_order_attempts() -> u32 {
    10
}
fn default_order_batch_size() -> u32 {
    50
}
fn default_retention_days() -> u32 {
    30
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            interval_secs: default_interval(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            max_order_attempts: default_max_order_attempts(),
            order_batch_size: default_order_batch_size(),
            retention_days: default_retention_days(),
        }
    }
}

// =============================================================================
// Pairing Settings
// =============================================================================

/// Limits on the device-authorization poll loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingSettings {
    /// Hard ceiling on how long a pairing attempt may poll, even when the
    /// server grants a longer `expires_in` (seconds).
    #[serde(default = "default_max_wait")]
    pub max_wait_secs: u64,
}

fn default_max_wait() -> u64 {
    900
}

impl Default for PairingSettings {
    fn default() -> Self {
        PairingSettings {
            max_wait_secs: default_max_wait(),
        }
    }
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

/// Complete sync configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub backend: BackendSettings,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub pairing: PairingSettings,
}

impl SyncConfig {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (sync.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading sync config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load sync config: {}. Using defaults.", e);
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

        info!(?path, "Sync config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        let url = Url::parse(&self.backend.base_url)?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(SyncError::InvalidUrl(format!(
                "Backend URL must start with http:// or https://, got: {}",
                self.backend.base_url
            )));
        }

        if self.device.client_id.trim().is_empty() {
            return Err(SyncError::InvalidConfig("client_id must not be empty".into()));
        }

        if self.sync.interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "interval_secs must be greater than 0".into(),
            ));
        }

        if self.backend.request_timeout_secs == 0 || self.backend.probe_timeout_secs == 0 {
            return Err(SyncError::InvalidConfig("timeouts must be greater than 0".into()));
        }

        if self.sync.order_batch_size == 0 || self.sync.max_order_attempts == 0 {
            return Err(SyncError::InvalidConfig(
                "order_batch_size and max_order_attempts must be greater than 0".into(),
            ));
        }

        if self.sync.initial_backoff_ms > self.sync.max_backoff_secs.saturating_mul(1000) {
            return Err(SyncError::InvalidConfig(
                "initial_backoff_ms must not exceed max_backoff_secs".into(),
            ));
        }

        Ok(())
    }

    /// Applies `HARBOR_*` overrides using `lookup` to read variables.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("HARBOR_BACKEND_URL") {
            debug!(url = %url, "Overriding backend URL from environment");
            self.backend.base_url = url;
        }

        if let Some(client_id) = lookup("HARBOR_CLIENT_ID") {
            self.device.client_id = client_id;
        }

        if let Some(raw) = lookup("HARBOR_SYNC_INTERVAL_SECS") {
            match raw.parse::<u64>() {
                Ok(secs) => self.sync.interval_secs = secs,
                Err(_) => warn!(value = %raw, "Ignoring invalid HARBOR_SYNC_INTERVAL_SECS"),
            }
        }

        if let Some(raw) = lookup("HARBOR_REQUEST_TIMEOUT_SECS") {
            match raw.parse::<u64>() {
                Ok(secs) => self.backend.request_timeout_secs = secs,
                Err(_) => warn!(value = %raw, "Ignoring invalid HARBOR_REQUEST_TIMEOUT_SECS"),
            }
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "harbor", "pos")
            .map(|dirs| dirs.config_dir().join("sync.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Parsed backend base URL.
    pub fn base_url(&self) -> SyncResult<Url> {
        Ok(Url::parse(&self.backend.base_url)?)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.backend.request_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.backend.probe_timeout_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.sync.interval_secs)
    }

    pub fn pairing_max_wait(&self) -> Duration {
        Duration::from_secs(self.pairing.max_wait_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config_is_valid() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sync.interval_secs, 60);
        assert_eq!(config.device.client_id, "harbor-pos");
    }

    #[test]
    fn test_config_validation() {
        let mut config = SyncConfig::default();

        config.backend.base_url = "ws://localhost".into();
        assert!(matches!(config.validate(), Err(SyncError::InvalidUrl(_))));

        config.backend.base_url = "not a url".into();
        assert!(config.validate().is_err());

        config.backend.base_url = "https://api.example.com".into();
        config.sync.interval_secs = 0;
        assert!(config.validate().unwrap_err().is_config_error());

        config.sync.interval_secs = 30;
        config.sync.initial_backoff_ms = 10_000;
        config.sync.max_backoff_secs = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("HARBOR_BACKEND_URL", "https://pos.example.com"),
            ("HARBOR_SYNC_INTERVAL_SECS", "15"),
            ("HARBOR_REQUEST_TIMEOUT_SECS", "abc"),
        ]
        .into_iter()
        .collect();

        let mut config = SyncConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.backend.base_url, "https://pos.example.com");
        assert_eq!(config.sync.interval_secs, 15);
        // Invalid value keeps the default.
        assert_eq!(config.backend.request_timeout_secs, 30);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: SyncConfig = toml::from_str(
            r#"
            [backend]
            base_url = "https://api.example.com"

            [sync]
            interval_secs = 120
            "#,
        )
        .unwrap();

        assert_eq!(config.sync.interval_secs, 120);
        assert_eq!(config.sync.max_order_attempts, 10);
        assert_eq!(config.pairing.max_wait_secs, 900);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_serialization() {
        let toml_str = toml::to_string_pretty(&SyncConfig::default()).unwrap();
        assert!(toml_str.contains("[backend]"));
        assert!(toml_str.contains("[sync]"));
        assert!(toml_str.contains("[pairing]"));
    }
}
