//! The cached profile record

use serde::{Deserialize, Serialize};

/// Display name and avatar for one external identity.
///
/// `key` is the identity exactly as received (e.g. a chat login); it is
/// case-sensitive and unique in storage. Records are never updated once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub key: String,
    pub display_name: String,
    pub avatar_url: String,
}

impl ProfileRecord {
    pub fn new(
        key: impl Into<String>,
        display_name: impl Into<String>,
        avatar_url: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            display_name: display_name.into(),
            avatar_url: avatar_url.into(),
        }
    }

    /// Same record filed under a different key
    pub fn rekeyed(self, key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..self
        }
    }
}
