//! Twitch Helix user lookup
//!
//! Resolves a chat login to display name and profile image through
//! `GET /helix/users?login=...`, authenticated with an app access token from
//! the client-credentials grant.
//!
//! # Token handling
//!
//! The app token is fetched lazily, shared by all lookups, and refreshed a
//! minute before it expires. A 401 from Helix drops the token and the request
//! is retried once with a fresh one.

use super::{ExternalLookup, LookupError};
use crate::config::TwitchConfig;
use crate::profile::ProfileRecord;
use crate::retry::{retry_with_backoff, RetryPolicy};
use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Tokens closer than this to expiry are treated as expired
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Wait used when a 429 carries no usable reset header
const DEFAULT_RATE_LIMIT_WAIT: u64 = 60;

/// Helix user object (only the fields we keep)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelixUser {
    pub id: String,
    pub login: String,
    pub display_name: String,
    pub profile_image_url: String,
}

impl HelixUser {
    /// Record filed under the key the caller asked for
    pub fn into_record(self, key: &str) -> ProfileRecord {
        ProfileRecord::new(key, self.display_name, self.profile_image_url)
    }
}

#[derive(Debug, Deserialize)]
struct HelixUsersResponse {
    data: Vec<HelixUser>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Clone)]
struct AppToken {
    access_token: String,
    expires_at: Instant,
}

impl AppToken {
    fn is_fresh(&self) -> bool {
        Instant::now() + TOKEN_EXPIRY_MARGIN < self.expires_at
    }
}

/// Helix client implementing [`ExternalLookup`]
pub struct TwitchLookup {
    client: Client,
    client_id: String,
    client_secret: String,
    token_url: String,
    users_url: String,
    retry: RetryPolicy,
    token: RwLock<Option<AppToken>>,
}

impl TwitchLookup {
    /// Create a client with an explicit client secret
    pub fn new(
        config: &TwitchConfig,
        client_secret: impl Into<String>,
        retry: RetryPolicy,
    ) -> crate::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .default_headers({
                let mut headers = header::HeaderMap::new();
                headers.insert(
                    header::USER_AGENT,
                    header::HeaderValue::from_static(concat!(
                        "chatter-cache/",
                        env!("CARGO_PKG_VERSION")
                    )),
                );
                headers
            })
            .build()?;

        Ok(Self {
            client,
            client_id: config.client_id.clone(),
            client_secret: client_secret.into(),
            token_url: format!("{}/oauth2/token", config.auth_url.trim_end_matches('/')),
            users_url: format!("{}/helix/users", config.api_url.trim_end_matches('/')),
            retry,
            token: RwLock::new(None),
        })
    }

    /// Create a client reading the secret from `config.client_secret_env`
    pub fn from_env(config: &TwitchConfig, retry: RetryPolicy) -> crate::Result<Self> {
        let secret = std::env::var(&config.client_secret_env).map_err(|_| {
            crate::CacheError::Config(format!(
                "Environment variable {} is not set",
                config.client_secret_env
            ))
        })?;
        Self::new(config, secret, retry)
    }

    /// Current app token, requesting a new one if needed
    async fn app_token(&self) -> Result<String, LookupError> {
        if let Some(token) = self.token.read().await.as_ref().filter(|t| t.is_fresh()) {
            return Ok(token.access_token.clone());
        }

        let mut slot = self.token.write().await;
        // Another task may have refreshed while we waited for the write lock
        if let Some(token) = slot.as_ref().filter(|t| t.is_fresh()) {
            return Ok(token.access_token.clone());
        }

        let fresh = self.request_token().await?;
        let access_token = fresh.access_token.clone();
        *slot = Some(fresh);
        Ok(access_token)
    }

    /// Drop `rejected` if it is still the cached token
    async fn invalidate_token(&self, rejected: &str) {
        let mut slot = self.token.write().await;
        if slot.as_ref().is_some_and(|t| t.access_token == rejected) {
            *slot = None;
        }
    }

    async fn request_token(&self) -> Result<AppToken, LookupError> {
        debug!(url = %self.token_url, "Requesting Twitch app access token");

        let response = self
            .client
            .post(&self.token_url)
            .query(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {
                let body: TokenResponse = response.json().await?;
                info!(expires_in = body.expires_in, "Obtained Twitch app access token");
                Ok(AppToken {
                    access_token: body.access_token,
                    expires_at: Instant::now() + Duration::from_secs(body.expires_in),
                })
            }
            StatusCode::TOO_MANY_REQUESTS => Err(LookupError::RateLimited(retry_after_secs(
                response.headers(),
            ))),
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                let body = response.text().await.unwrap_or_default();
                Err(LookupError::Auth(format!("token request rejected: {}", body)))
            }
            status => Err(LookupError::Api {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            }),
        }
    }

    /// `Ok(None)` when Helix answers but knows no such login
    async fn get_user(&self, login: &str, token: &str) -> Result<Option<HelixUser>, LookupError> {
        let response = self
            .client
            .get(&self.users_url)
            .query(&[("login", login)])
            .header("Client-Id", &self.client_id)
            .bearer_auth(token)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {
                let body: HelixUsersResponse = response.json().await?;
                Ok(body.data.into_iter().next())
            }
            StatusCode::UNAUTHORIZED => Err(LookupError::Auth(
                response.text().await.unwrap_or_default(),
            )),
            StatusCode::TOO_MANY_REQUESTS => {
                let wait = retry_after_secs(response.headers());
                warn!(login, wait_secs = wait, "Twitch rate limit hit");
                Err(LookupError::RateLimited(wait))
            }
            // Helix answers 400 for logins that can't exist (bad characters, too long)
            StatusCode::BAD_REQUEST => Ok(None),
            status => Err(LookupError::Api {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            }),
        }
    }

    async fn lookup_once(&self, key: &str) -> Result<ProfileRecord, LookupError> {
        let token = self.app_token().await?;

        let user = match self.get_user(key, &token).await {
            Err(LookupError::Auth(reason)) => {
                debug!(%reason, "App token rejected, requesting a new one");
                self.invalidate_token(&token).await;
                let token = self.app_token().await?;
                self.get_user(key, &token).await?
            }
            other => other?,
        };

        user.map(|u| u.into_record(key))
            .ok_or_else(|| LookupError::NotFound(key.to_string()))
    }
}

#[async_trait]
impl ExternalLookup for TwitchLookup {
    async fn lookup(&self, key: &str) -> Result<ProfileRecord, LookupError> {
        debug!(key, "Looking up Twitch user");
        retry_with_backoff(&self.retry, "twitch.get_user", || self.lookup_once(key)).await
    }
}

/// Seconds until the `Ratelimit-Reset` epoch, at least one
fn retry_after_secs(headers: &header::HeaderMap) -> u64 {
    headers
        .get("ratelimit-reset")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())
        .map(|reset| (reset - chrono::Utc::now().timestamp()).max(1) as u64)
        .unwrap_or(DEFAULT_RATE_LIMIT_WAIT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::{Query, State},
        http::HeaderMap,
        response::{IntoResponse, Response},
        routing::{get, post},
        Json, Router,
    };
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Scripted Helix stand-in
    #[derive(Default)]
    struct MockHelix {
        token_requests: AtomicUsize,
        user_requests: AtomicUsize,
        /// Reject this many user requests with 401 before answering
        reject_auth: AtomicUsize,
        /// Answer this many user requests with 503 before answering
        fail_server: AtomicUsize,
        /// Always answer user requests with 429
        rate_limited: bool,
    }

    fn take_one(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    async fn token(State(mock): State<Arc<MockHelix>>) -> Json<serde_json::Value> {
        let n = mock.token_requests.fetch_add(1, Ordering::SeqCst) + 1;
        Json(json!({
            "access_token": format!("token-{}", n),
            "expires_in": 3600,
            "token_type": "bearer"
        }))
    }

    async fn users(
        State(mock): State<Arc<MockHelix>>,
        Query(query): Query<HashMap<String, String>>,
        headers: HeaderMap,
    ) -> Response {
        mock.user_requests.fetch_add(1, Ordering::SeqCst);

        if headers.get("client-id").and_then(|v| v.to_str().ok()) != Some("test-client") {
            return (axum::http::StatusCode::BAD_REQUEST, "missing client id").into_response();
        }
        if mock.rate_limited {
            return (
                axum::http::StatusCode::TOO_MANY_REQUESTS,
                [("ratelimit-reset", "0")],
                "slow down",
            )
                .into_response();
        }
        if take_one(&mock.reject_auth) {
            return (axum::http::StatusCode::UNAUTHORIZED, "invalid token").into_response();
        }
        if take_one(&mock.fail_server) {
            return (axum::http::StatusCode::SERVICE_UNAVAILABLE, "try later").into_response();
        }

        let login = query.get("login").cloned().unwrap_or_default();
        let data = match login.as_str() {
            "alice" => vec![json!({
                "id": "1",
                "login": "alice",
                "display_name": "Alice",
                "profile_image_url": "https://x/a.png"
            })],
            _ => vec![],
        };
        Json(json!({ "data": data })).into_response()
    }

    async fn spawn_mock(mock: MockHelix) -> (Arc<MockHelix>, TwitchConfig) {
        let mock = Arc::new(mock);
        let app = Router::new()
            .route("/oauth2/token", post(token))
            .route("/helix/users", get(users))
            .with_state(Arc::clone(&mock));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let config = TwitchConfig {
            client_id: "test-client".to_string(),
            auth_url: base.clone(),
            api_url: base,
            request_timeout_secs: 5,
            ..Default::default()
        };
        (mock, config)
    }

    #[tokio::test]
    async fn test_lookup_maps_user() {
        let (_mock, config) = spawn_mock(MockHelix::default()).await;
        let lookup = TwitchLookup::new(&config, "secret", RetryPolicy::none()).unwrap();

        let record = lookup.lookup("alice").await.unwrap();
        assert_eq!(record, ProfileRecord::new("alice", "Alice", "https://x/a.png"));
    }

    #[tokio::test]
    async fn test_unknown_login_is_not_found() {
        let (mock, config) = spawn_mock(MockHelix::default()).await;
        let lookup = TwitchLookup::new(&config, "secret", RetryPolicy::quick()).unwrap();

        let err = lookup.lookup("ghost").await.unwrap_err();
        assert_eq!(err, LookupError::NotFound("ghost".to_string()));
        // Not found is permanent, so no retries
        assert_eq!(mock.user_requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_token_is_reused() {
        let (mock, config) = spawn_mock(MockHelix::default()).await;
        let lookup = TwitchLookup::new(&config, "secret", RetryPolicy::none()).unwrap();

        lookup.lookup("alice").await.unwrap();
        lookup.lookup("alice").await.unwrap();

        assert_eq!(mock.token_requests.load(Ordering::SeqCst), 1);
        assert_eq!(mock.user_requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rejected_token_is_refreshed_once() {
        let (mock, config) = spawn_mock(MockHelix {
            reject_auth: AtomicUsize::new(1),
            ..Default::default()
        })
        .await;
        let lookup = TwitchLookup::new(&config, "secret", RetryPolicy::none()).unwrap();

        let record = lookup.lookup("alice").await.unwrap();
        assert_eq!(record.display_name, "Alice");
        assert_eq!(mock.token_requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let (mock, config) = spawn_mock(MockHelix {
            fail_server: AtomicUsize::new(2),
            ..Default::default()
        })
        .await;
        let lookup = TwitchLookup::new(&config, "secret", RetryPolicy::quick()).unwrap();

        let record = lookup.lookup("alice").await.unwrap();
        assert_eq!(record.avatar_url, "https://x/a.png");
        assert_eq!(mock.user_requests.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_rate_limit_surfaces_after_retries() {
        let (mock, config) = spawn_mock(MockHelix {
            rate_limited: true,
            ..Default::default()
        })
        .await;
        let policy = RetryPolicy {
            max_retries: 1,
            max_backoff: Duration::from_millis(10),
            ..RetryPolicy::quick()
        };
        let lookup = TwitchLookup::new(&config, "secret", policy).unwrap();

        let err = lookup.lookup("alice").await.unwrap_err();
        assert_eq!(err, LookupError::RateLimited(1));
        assert_eq!(mock.user_requests.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_retry_after_header_parsing() {
        let mut headers = header::HeaderMap::new();
        assert_eq!(retry_after_secs(&headers), DEFAULT_RATE_LIMIT_WAIT);

        let reset = chrono::Utc::now().timestamp() + 30;
        headers.insert("ratelimit-reset", reset.to_string().parse().unwrap());
        let wait = retry_after_secs(&headers);
        assert!((29..=30).contains(&wait));

        headers.insert("ratelimit-reset", "0".parse().unwrap());
        assert_eq!(retry_after_secs(&headers), 1);
    }

    #[test]
    fn test_from_env_requires_secret() {
        let config = TwitchConfig {
            client_secret_env: "CHATTER_CACHE_TEST_SECRET_THAT_IS_NEVER_SET".to_string(),
            ..Default::default()
        };
        let result = TwitchLookup::from_env(&config, RetryPolicy::none());
        assert!(matches!(result, Err(crate::CacheError::Config(_))));
    }

    #[test]
    fn test_endpoint_urls() {
        let config = TwitchConfig {
            auth_url: "https://id.example/".to_string(),
            api_url: "https://api.example".to_string(),
            ..Default::default()
        };
        let lookup = TwitchLookup::new(&config, "s", RetryPolicy::none()).unwrap();
        assert_eq!(lookup.token_url, "https://id.example/oauth2/token");
        assert_eq!(lookup.users_url, "https://api.example/helix/users");
    }
}
