//! Configuration system
//!
//! Loads ~/.config/chatter-cache/config.yaml with support for:
//! - SQLite storage location and journal mode
//! - Twitch application credentials and endpoints
//! - Retry/backoff for the external lookup
//! - The storage read error policy

mod cache_config;
pub mod validation;

pub use cache_config::{
    ChatterCacheConfig, RetrySettings, StorageConfig, StorageErrorPolicy, TwitchConfig,
};
pub use validation::{validate_config, validate_config_result, ValidationError};
