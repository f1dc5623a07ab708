//! External identity lookup
//!
//! The authoritative (slow, rate-limited) source the cache falls back to on a
//! miss. Timeouts, retries and auth belong to the implementation; the cache
//! only sees a record or a [`LookupError`].

pub mod twitch;

pub use twitch::{HelixUser, TwitchLookup};

use crate::profile::ProfileRecord;
use crate::retry::{RetryDecision, RetryableError};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Lookup errors.
///
/// `Clone` so one failed lookup can be handed to every caller waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    #[error("User not found: {0}")]
    NotFound(String),

    /// Upstream asked us to back off for this many seconds
    #[error("Rate limited, retry after {0} seconds")]
    RateLimited(u64),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("API error: HTTP {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Request timed out")]
    Timeout,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Malformed response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for LookupError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LookupError::Timeout
        } else if err.is_decode() {
            LookupError::Decode(err.to_string())
        } else {
            LookupError::Network(err.to_string())
        }
    }
}

impl RetryableError for LookupError {
    fn retry_decision(&self) -> RetryDecision {
        match self {
            LookupError::Timeout | LookupError::Network(_) => RetryDecision::Retry,
            LookupError::RateLimited(secs) => RetryDecision::RetryAfter(Duration::from_secs(*secs)),
            LookupError::Api { status, .. } if (500..=599).contains(status) => RetryDecision::Retry,
            LookupError::Api { .. }
            | LookupError::NotFound(_)
            | LookupError::Auth(_)
            | LookupError::Decode(_) => RetryDecision::NoRetry,
        }
    }
}

/// Source of truth for profile records
#[async_trait]
pub trait ExternalLookup: Send + Sync {
    /// Resolve `key` to a full record
    async fn lookup(&self, key: &str) -> Result<ProfileRecord, LookupError>;
}
