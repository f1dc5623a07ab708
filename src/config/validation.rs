//! Configuration validation
//!
//! Catches settings that would only blow up on the first cache miss:
//! missing Twitch credentials, non-HTTP endpoints, nonsensical backoff.

use super::cache_config::ChatterCacheConfig;
use crate::CacheError;

/// Validation error details
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validation result
pub type ValidationResult = std::result::Result<(), Vec<ValidationError>>;

/// Validate a configuration, collecting every problem found
pub fn validate_config(config: &ChatterCacheConfig) -> ValidationResult {
    let mut errors = Vec::new();

    let twitch = &config.twitch;
    if twitch.client_id.trim().is_empty() {
        errors.push(ValidationError::new(
            "twitch.client_id",
            "A Twitch application client id is required",
        ));
    }

    if twitch.client_secret_env.trim().is_empty() {
        errors.push(ValidationError::new(
            "twitch.client_secret_env",
            "Name of the client secret environment variable cannot be empty",
        ));
    } else if std::env::var(&twitch.client_secret_env).is_err() {
        tracing::warn!(
            env_var = %twitch.client_secret_env,
            "Client secret environment variable not set (lookups will fail until it is)"
        );
    }

    for (field, url) in [("twitch.auth_url", &twitch.auth_url), ("twitch.api_url", &twitch.api_url)] {
        if !is_http_url(url) {
            errors.push(ValidationError::new(field, format!("Invalid URL: {}", url)));
        }
    }

    if twitch.request_timeout_secs == 0 {
        errors.push(ValidationError::new(
            "twitch.request_timeout_secs",
            "Timeout must be greater than 0",
        ));
    }

    let retry = &config.retry;
    if retry.multiplier < 1.0 {
        errors.push(ValidationError::new(
            "retry.multiplier",
            "Multiplier must be at least 1.0",
        ));
    }
    if retry.initial_backoff_ms > retry.max_backoff_ms {
        errors.push(ValidationError::new(
            "retry.initial_backoff_ms",
            "Initial backoff cannot exceed max_backoff_ms",
        ));
    }

    if config.storage.path.as_os_str().is_empty() {
        errors.push(ValidationError::new("storage.path", "Database path cannot be empty"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate and fold all problems into a single `CacheError::Config`
pub fn validate_config_result(config: &ChatterCacheConfig) -> crate::Result<()> {
    validate_config(config).map_err(|errors| {
        let joined = errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        CacheError::Config(joined)
    })
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("https://") || url.starts_with("http://")
}
