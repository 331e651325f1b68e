//! Stargate token providers.
//!
//! Unique responsibility: hand out the value of the `X-Cassandra-Token` header.
//!
//! - [`StaticTokenProvider`]: fixed token, e.g. an Astra application token.
//! - [`TableTokenProvider`]: `POST {auth_url}/v1/auth` with username/password,
//!   cached for a TTL. Auth endpoints are load balanced; failing endpoints are
//!   quarantined like data nodes.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use url::Url;

use crate::loadbalancer::{LoadBalancer, LoadBalancerError};
use crate::stargate_client::StargateError;

/// Source of Stargate auth tokens.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Current token, fetching a new one if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if no token can be obtained.
    async fn token(&self) -> Result<String, StargateError>;

    /// Drop any cached token so the next call fetches a fresh one.
    async fn invalidate(&self) {}
}

/// Fixed token.
#[derive(Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    /// Wrap a token.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for StaticTokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTokenProvider").finish_non_exhaustive()
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn token(&self) -> Result<String, StargateError> {
        Ok(self.token.clone())
    }
}

#[derive(Serialize)]
struct AuthRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthResponse {
    auth_token: String,
}

struct CachedToken {
    value: String,
    fetched_at: Instant,
}

/// Username/password token provider backed by the Stargate auth API.
pub struct TableTokenProvider {
    http: reqwest::Client,
    endpoints: LoadBalancer<Url>,
    username: String,
    password: String,
    ttl: Duration,
    cache: Mutex<Option<CachedToken>>,
}

impl TableTokenProvider {
    /// Create a provider over the given auth endpoints.
    #[must_use]
    pub fn new(
        http: reqwest::Client,
        endpoints: LoadBalancer<Url>,
        username: String,
        password: String,
        ttl: Duration,
    ) -> Self {
        Self {
            http,
            endpoints,
            username,
            password,
            ttl,
            cache: Mutex::new(None),
        }
    }

    async fn fetch(&self) -> Result<String, StargateError> {
        let body = AuthRequest {
            username: &self.username,
            password: &self.password,
        };
        let mut last_error: Option<String> = None;

        for _ in 0..self.endpoints.len() {
            let endpoint = match self.endpoints.select() {
                Ok(e) => e,
                Err(LoadBalancerError::NoResourceAvailable) => break,
                Err(e) => return Err(e.into()),
            };
            let url = endpoint
                .resource
                .join("v1/auth")
                .map_err(|e| StargateError::InvalidArgument(e.to_string()))?;

            match self.http.post(url).json(&body).send().await {
                Err(e) if e.is_connect() || e.is_timeout() => {
                    self.endpoints
                        .mark_unavailable(&endpoint.id, "auth endpoint unreachable", Some(e.to_string()))?;
                    last_error = Some(format!("{}: {e}", endpoint.id));
                }
                Err(e) => return Err(StargateError::Http(e)),
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();

                    if status == StatusCode::UNAUTHORIZED {
                        return Err(StargateError::InvalidCredentials);
                    }
                    if status.is_server_error() {
                        self.endpoints.mark_unavailable(
                            &endpoint.id,
                            format!("HTTP {}", status.as_u16()),
                            Some(text),
                        )?;
                        last_error = Some(format!("{}: HTTP {status}", endpoint.id));
                        continue;
                    }
                    if !status.is_success() {
                        return Err(StargateError::Api { status, body: text });
                    }

                    let parsed: AuthResponse = serde_json::from_str(&text)
                        .map_err(|source| StargateError::Json { source, body: text })?;
                    tracing::debug!(endpoint = %endpoint.id, "stargate token renewed");
                    return Ok(parsed.auth_token);
                }
            }
        }

        Err(StargateError::NoNodeAvailable { last_error })
    }
}

impl std::fmt::Debug for TableTokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableTokenProvider")
            .field("username", &self.username)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl TokenProvider for TableTokenProvider {
    async fn token(&self) -> Result<String, StargateError> {
        // Held across the fetch so concurrent callers share one renewal.
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref()
            && cached.fetched_at.elapsed() < self.ttl
        {
            return Ok(cached.value.clone());
        }

        let value = self.fetch().await?;
        *cache = Some(CachedToken {
            value: value.clone(),
            fetched_at: Instant::now(),
        });
        Ok(value)
    }

    async fn invalidate(&self) {
        *self.cache.lock().await = None;
    }
}
