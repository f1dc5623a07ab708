//! chatter-cache configuration file handling
//!
//! Loads and saves ~/.config/chatter-cache/config.yaml.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

fn config_dir() -> PathBuf {
    // Always use ~/.config for consistency across platforms (macOS, Linux)
    let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push(".config");
    path.push("chatter-cache");
    path
}

/// What `resolve` does when the storage read itself fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageErrorPolicy {
    /// Log the error and fall through to the external lookup
    #[default]
    Advisory,
    /// Return `StorageUnavailable` without calling the external lookup
    FailFast,
}

/// SQLite storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database file
    #[serde(default = "default_db_path")]
    pub path: PathBuf,

    /// Enable WAL mode for better concurrency
    #[serde(default = "default_wal_mode")]
    pub wal_mode: bool,
}

fn default_db_path() -> PathBuf {
    config_dir().join("profiles.db")
}

fn default_wal_mode() -> bool {
    true
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            wal_mode: default_wal_mode(),
        }
    }
}

/// Twitch Helix settings for the user lookup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwitchConfig {
    /// Application client id
    #[serde(default)]
    pub client_id: String,

    /// Name of the environment variable holding the client secret
    #[serde(default = "default_secret_env")]
    pub client_secret_env: String,

    /// OAuth host (token endpoint lives at `{auth_url}/oauth2/token`)
    #[serde(default = "default_auth_url")]
    pub auth_url: String,

    /// Helix host (users endpoint lives at `{api_url}/helix/users`)
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_secret_env() -> String {
    "TWITCH_CLIENT_SECRET".to_string()
}

fn default_auth_url() -> String {
    "https://id.twitch.tv".to_string()
}

fn default_api_url() -> String {
    "https://api.twitch.tv".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

impl Default for TwitchConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret_env: default_secret_env(),
            auth_url: default_auth_url(),
            api_url: default_api_url(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Retry settings for the external lookup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    true
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

/// chatter-cache configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatterCacheConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub twitch: TwitchConfig,

    #[serde(default)]
    pub retry: RetrySettings,

    /// Behaviour when the storage read fails during `resolve`
    #[serde(default)]
    pub on_storage_error: StorageErrorPolicy,
}

impl ChatterCacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from the default path
    pub fn load_default() -> Result<Self> {
        Self::load(Self::default_path())
    }

    /// Load configuration from a specific path
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(crate::CacheError::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        tracing::info!(path = %path.display(), "Loading chatter-cache configuration");

        let content = fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;

        tracing::debug!(
            db = %config.storage.path.display(),
            policy = ?config.on_storage_error,
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Save configuration to a specific path, creating parent directories
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        tracing::info!(path = %path.display(), "Saving chatter-cache configuration");

        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml)?;

        Ok(())
    }

    /// ~/.config/chatter-cache/config.yaml
    pub fn default_path() -> PathBuf {
        config_dir().join("config.yaml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = ChatterCacheConfig::new();
        assert!(config.storage.path.ends_with("chatter-cache/profiles.db"));
        assert!(config.storage.wal_mode);
        assert_eq!(config.twitch.api_url, "https://api.twitch.tv");
        assert_eq!(config.twitch.client_secret_env, "TWITCH_CLIENT_SECRET");
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.on_storage_error, StorageErrorPolicy::Advisory);
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.yaml");

        let mut config = ChatterCacheConfig::new();
        config.twitch.client_id = "abc123".to_string();
        config.on_storage_error = StorageErrorPolicy::FailFast;
        config.save(&path).unwrap();

        let loaded = ChatterCacheConfig::load(&path).unwrap();
        assert_eq!(loaded.twitch.client_id, "abc123");
        assert_eq!(loaded.on_storage_error, StorageErrorPolicy::FailFast);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
twitch:
  client_id: my-client
on_storage_error: fail_fast
"#;
        let config: ChatterCacheConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.twitch.client_id, "my-client");
        assert_eq!(config.twitch.auth_url, "https://id.twitch.tv");
        assert_eq!(config.twitch.request_timeout_secs, 10);
        assert_eq!(config.retry, RetrySettings::default());
        assert_eq!(config.on_storage_error, StorageErrorPolicy::FailFast);
    }

    #[test]
    fn test_load_missing_file() {
        let result = ChatterCacheConfig::load("/nonexistent/chatter-cache.yaml");
        assert!(matches!(result, Err(crate::CacheError::Config(_))));
    }

    #[test]
    fn test_default_path() {
        let path = ChatterCacheConfig::default_path();
        assert!(path.ends_with("chatter-cache/config.yaml"));
    }
}
