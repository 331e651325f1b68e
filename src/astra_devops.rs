//! Astra DevOps API client.
//!
//! Unique responsibility: authenticated, retrying access to the Astra control
//! plane REST API. Resource-specific calls live in `astra_databases` and
//! `astra_organization`; both are `impl` blocks on [`AstraDevopsClient`].
//!
//! API endpoint:
//! - <https://api.astra.datastax.com/v2>
//! - Header: Authorization: Bearer <application token>
//!
//! Status codes are mapped once, here:
//! - 2xx → success
//! - 401 / 403 → [`DevopsError::Unauthorized`]
//! - 400 / 422 → [`DevopsError::InvalidRequest`] (Astra error messages extracted)
//! - 404 → `None` on lookups, [`DevopsError::NotFound`] elsewhere
//! - anything else → [`DevopsError::Api`]

use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use url::Url;

use crate::env_config::{EnvError, EnvReader, process_env};

/// Default DevOps API base URL.
pub const DEFAULT_DEVOPS_URL: &str = "https://api.astra.datastax.com/v2";

/// Configuration for the Astra DevOps client.
#[derive(Clone, Debug)]
pub struct AstraDevopsConfig {
    /// Astra application token (`AstraCS:...`).
    /// Env: `ASTRA_DB_APPLICATION_TOKEN` (required)
    pub token: String,

    /// DevOps API base URL.
    /// Env: `ASTRA_DEVOPS_URL` (default: "<https://api.astra.datastax.com/v2>")
    pub devops_url: String,

    /// HTTP request timeout in milliseconds.
    /// Env: `ASTRA_HTTP_TIMEOUT_MS` (default: 30000)
    pub timeout_ms: u64,

    /// Maximum number of retry attempts.
    /// Env: `ASTRA_HTTP_RETRY_MAX` (default: 3)
    pub retry_max: u32,

    /// Backoff time between retries in milliseconds.
    /// Env: `ASTRA_HTTP_RETRY_BACKOFF_MS` (default: 500)
    pub retry_backoff_ms: u64,

    /// User agent for HTTP requests.
    /// Env: `ASTRA_USER_AGENT` (default: "astra-stargate-sdk/<version>")
    pub user_agent: String,
}

impl AstraDevopsConfig {
    /// Build a configuration with defaults for everything but the token.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            devops_url: DEFAULT_DEVOPS_URL.to_string(),
            timeout_ms: 30_000,
            retry_max: 3,
            retry_backoff_ms: 500,
            user_agent: default_user_agent(),
        }
    }

    /// Override the DevOps API base URL.
    #[must_use]
    pub fn with_devops_url(mut self, url: impl Into<String>) -> Self {
        self.devops_url = url.into();
        self
    }

    /// Override the retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry_max: u32, retry_backoff_ms: u64) -> Self {
        self.retry_max = retry_max;
        self.retry_backoff_ms = retry_backoff_ms;
        self
    }

    /// Load configuration from environment variables.
    ///
    /// In local dev, this will also attempt to load `.env` from the current directory.
    /// If `.env` is missing, it does not fail.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing or invalid.
    pub fn from_env() -> Result<Self, DevopsError> {
        Self::from_lookup(process_env())
    }

    /// Load configuration through an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if required keys are missing or invalid.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, DevopsError> {
        let env = EnvReader::new(lookup);
        Ok(Self {
            token: env.required("ASTRA_DB_APPLICATION_TOKEN")?,
            devops_url: env.string_or("ASTRA_DEVOPS_URL", DEFAULT_DEVOPS_URL),
            timeout_ms: env.u64_or("ASTRA_HTTP_TIMEOUT_MS", 30_000)?,
            retry_max: env.u32_or("ASTRA_HTTP_RETRY_MAX", 3)?,
            retry_backoff_ms: env.u64_or("ASTRA_HTTP_RETRY_BACKOFF_MS", 500)?,
            user_agent: env
                .get("ASTRA_USER_AGENT")
                .unwrap_or_else(default_user_agent),
        })
    }
}

fn default_user_agent() -> String {
    format!("astra-stargate-sdk/{}", env!("CARGO_PKG_VERSION"))
}

/// Client for the Astra DevOps API.
pub struct AstraDevopsClient {
    cfg: AstraDevopsConfig,
    base: Url,
    http: reqwest::Client,
}

impl AstraDevopsClient {
    /// Create a new DevOps client.
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL is invalid or the HTTP client cannot be built.
    pub fn new(cfg: AstraDevopsConfig) -> Result<Self, DevopsError> {
        if cfg.token.trim().is_empty() {
            return Err(DevopsError::InvalidArgument("token must not be empty".into()));
        }

        // Trailing slash so that `join` appends instead of replacing the last segment.
        let base = Url::parse(&format!("{}/", cfg.devops_url.trim_end_matches('/')))
            .map_err(|e| DevopsError::InvalidArgument(format!("invalid devops url: {e}")))?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .user_agent(cfg.user_agent.clone())
            .build()
            .map_err(DevopsError::Http)?;

        Ok(Self { cfg, base, http })
    }

    /// Get a reference to the current configuration.
    #[must_use]
    pub const fn config(&self) -> &AstraDevopsConfig {
        &self.cfg
    }

    /// Resolve a path relative to the API base URL.
    pub(crate) fn url(&self, path: &str) -> Result<Url, DevopsError> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|e| DevopsError::InvalidArgument(format!("invalid path {path:?}: {e}")))
    }

    /// GET a JSON resource, mapping 404 to `None`.
    pub(crate) async fn get_optional<T: DeserializeOwned>(&self, url: Url) -> Result<Option<T>, DevopsError> {
        let resp = self.send(Method::GET, url, None).await?;
        if resp.status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        resp.ensure_success()?.json().map(Some)
    }

    /// GET a JSON resource that must exist.
    pub(crate) async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, DevopsError> {
        self.send(Method::GET, url, None).await?.ensure_success()?.json()
    }

    /// Send a request and require one exact success status.
    pub(crate) async fn expect_status(
        &self,
        method: Method,
        url: Url,
        body: Option<serde_json::Value>,
        expected: StatusCode,
    ) -> Result<ApiResponse, DevopsError> {
        self.send(method, url, body)
            .await?
            .ensure_success()?
            .require(expected)
    }

    /// POST a creation request. Only rate limiting and refused connections are
    /// retried, so a slow or failing server never receives the same create twice.
    pub(crate) async fn create(&self, url: Url, body: serde_json::Value) -> Result<ApiResponse, DevopsError> {
        self.send_with(Method::POST, url, Some(body), RetryPolicy::RateLimitOnly)
            .await?
            .ensure_success()
    }

    /// HTTP client carrying the configured timeout and user agent.
    pub(crate) const fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Send a request with retry logic. Only transport errors fail here.
    pub(crate) async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<serde_json::Value>,
    ) -> Result<ApiResponse, DevopsError> {
        self.send_with(method, url, body, RetryPolicy::Transient).await
    }

    async fn send_with(
        &self,
        method: Method,
        url: Url,
        body: Option<serde_json::Value>,
        retry: RetryPolicy,
    ) -> Result<ApiResponse, DevopsError> {
        let mut attempt: u32 = 0;
        let mut backoff = Duration::from_millis(self.cfg.retry_backoff_ms);

        loop {
            attempt = attempt.saturating_add(1);

            let mut req = self
                .http
                .request(method.clone(), url.clone())
                .bearer_auth(&self.cfg.token)
                .header(reqwest::header::ACCEPT, "application/json");
            if let Some(b) = &body {
                req = req.json(b);
            }

            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let location = resp
                        .headers()
                        .get(reqwest::header::LOCATION)
                        .and_then(|v| v.to_str().ok())
                        .map(ToString::to_string);
                    let text = resp.text().await.unwrap_or_default();

                    if attempt <= self.cfg.retry_max && retry.retries_status(status) {
                        tracing::debug!(%method, %url, %status, attempt, "retrying devops call");
                        tokio::time::sleep(backoff).await;
                        backoff = next_backoff(backoff);
                        continue;
                    }

                    tracing::debug!(%method, %url, %status, "devops call completed");
                    return Ok(ApiResponse {
                        status,
                        location,
                        body: text,
                    });
                }
                Err(e) => {
                    if attempt <= self.cfg.retry_max && retry.retries_error(&e) {
                        tracing::debug!(%method, %url, error = %e, attempt, "retrying devops call");
                        tokio::time::sleep(backoff).await;
                        backoff = next_backoff(backoff);
                        continue;
                    }
                    return Err(DevopsError::Http(e));
                }
            }
        }
    }
}

/// Buffered API response.
#[derive(Debug, Clone)]
pub(crate) struct ApiResponse {
    pub(crate) status: StatusCode,
    pub(crate) location: Option<String>,
    pub(crate) body: String,
}

impl ApiResponse {
    /// Map non-2xx statuses to categorized errors.
    pub(crate) fn ensure_success(self) -> Result<Self, DevopsError> {
        let status = self.status;
        if status.is_success() {
            return Ok(self);
        }
        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => DevopsError::Unauthorized {
                status,
                message: error_messages(&self.body).unwrap_or(self.body),
            },
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => DevopsError::InvalidRequest {
                status,
                message: error_messages(&self.body).unwrap_or(self.body),
            },
            StatusCode::NOT_FOUND => DevopsError::NotFound(self.body),
            _ => DevopsError::Api {
                status,
                body: self.body,
            },
        })
    }

    /// Require one exact success status.
    pub(crate) fn require(self, expected: StatusCode) -> Result<Self, DevopsError> {
        if self.status == expected {
            return Ok(self);
        }
        Err(DevopsError::Api {
            status: self.status,
            body: format!("expected status {expected}, got: {}", self.body),
        })
    }

    pub(crate) fn json<T: DeserializeOwned>(self) -> Result<T, DevopsError> {
        serde_json::from_str(&self.body).map_err(|source| DevopsError::Json {
            source,
            body: self.body,
        })
    }
}

/// Astra error payload: `{"errors":[{"description":"...","ID":123}]}`.
#[derive(Debug, Deserialize)]
struct AstraErrorBody {
    #[serde(default)]
    errors: Vec<AstraErrorItem>,
}

#[derive(Debug, Deserialize)]
struct AstraErrorItem {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(rename = "ID", default)]
    id: Option<i64>,
}

fn error_messages(body: &str) -> Option<String> {
    let parsed: AstraErrorBody = serde_json::from_str(body).ok()?;
    let msgs: Vec<String> = parsed
        .errors
        .into_iter()
        .filter_map(|e| {
            let text = e.description.or(e.message)?;
            Some(e.id.map_or_else(|| text.clone(), |id| format!("{text} (code {id})")))
        })
        .collect();
    if msgs.is_empty() {
        None
    } else {
        Some(msgs.join("; "))
    }
}

/// Error type for DevOps API operations.
#[derive(Debug, Error)]
pub enum DevopsError {
    /// Configuration could not be read from the environment.
    #[error(transparent)]
    Env(#[from] EnvError),
    /// Argument rejected before any call was made.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// HTTP client error.
    #[error("http error: {0}")]
    Http(#[source] reqwest::Error),
    /// JSON deserialization error.
    #[error("json decode error: {source}")]
    Json {
        /// The JSON parsing error.
        #[source]
        source: serde_json::Error,
        /// The response body.
        body: String,
    },
    /// Token rejected (401/403).
    #[error("unauthorized ({status}): {message}")]
    Unauthorized {
        /// HTTP status code.
        status: StatusCode,
        /// Error messages returned by Astra.
        message: String,
    },
    /// Request rejected as invalid (400/422).
    #[error("invalid request ({status}): {message}")]
    InvalidRequest {
        /// HTTP status code.
        status: StatusCode,
        /// Error messages returned by Astra.
        message: String,
    },
    /// Resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// API error response.
    #[error("astra api error: status={status}, body={body}")]
    Api {
        /// HTTP status code.
        status: StatusCode,
        /// Response body.
        body: String,
    },
    /// A polled resource did not reach the expected state in time.
    #[error("timeout waiting for {0}")]
    Timeout(String),
    /// A polled resource reached a state it cannot leave.
    #[error("unexpected status {actual} while waiting for {expected}")]
    UnexpectedStatus {
        /// Target status.
        expected: String,
        /// Status reached instead.
        actual: String,
    },
    /// Local I/O error (e.g. writing a secure bundle).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Validate a value that goes into the URL path as one segment.
///
/// Ids are UUIDs or plain tokens: ASCII letters, digits, `-`, `_` and `.`,
/// excluding the `.` and `..` path components.
pub(crate) fn path_segment<'a>(what: &str, value: &'a str) -> Result<&'a str, DevopsError> {
    let trimmed = value.trim();
    let ok = !matches!(trimmed, "" | "." | "..")
        && trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !ok {
        return Err(DevopsError::InvalidArgument(format!("invalid {what}: {value:?}")));
    }
    Ok(trimmed)
}

pub(crate) fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<serde_json::Value, DevopsError> {
    serde_json::to_value(value).map_err(|source| DevopsError::Json {
        source,
        body: String::new(),
    })
}

/// Which failures a call may be retried on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryPolicy {
    /// Idempotent calls: transient statuses, timeouts and connect errors.
    Transient,
    /// Creations: 429 and refused connections only.
    RateLimitOnly,
}

impl RetryPolicy {
    const fn retries_status(self, status: StatusCode) -> bool {
        match self {
            Self::Transient => is_retryable_status(status),
            Self::RateLimitOnly => status.as_u16() == 429,
        }
    }

    fn retries_error(self, e: &reqwest::Error) -> bool {
        match self {
            Self::Transient => is_retryable_reqwest(e),
            Self::RateLimitOnly => e.is_connect() && !e.is_timeout(),
        }
    }
}

#[inline]
const fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status.as_u16(),
        408 | 409 | 425 | 429 | 500 | 502 | 503 | 504
    )
}

#[inline]
fn is_retryable_reqwest(e: &reqwest::Error) -> bool {
    e.is_timeout() || e.is_connect()
}

#[inline]
fn next_backoff(current: Duration) -> Duration {
    let next = current.saturating_mul(2);
    next.min(Duration::from_secs(10))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Client against a mock server, with fast retries.
    pub(crate) fn client_for(server: &MockServer) -> AstraDevopsClient {
        let cfg = AstraDevopsConfig::new("AstraCS:test")
            .with_devops_url(format!("{}/v2", server.uri()))
            .with_retry(2, 1);
        AstraDevopsClient::new(cfg).unwrap()
    }

    #[test]
    fn config_from_lookup_applies_defaults() {
        let vars: HashMap<&str, &str> = [("ASTRA_DB_APPLICATION_TOKEN", "AstraCS:abc")].into();
        let cfg = AstraDevopsConfig::from_lookup(|k| vars.get(k).map(|v| (*v).to_string())).unwrap();
        assert_eq!(cfg.token, "AstraCS:abc");
        assert_eq!(cfg.devops_url, DEFAULT_DEVOPS_URL);
        assert_eq!(cfg.timeout_ms, 30_000);
        assert_eq!(cfg.retry_max, 3);
        assert!(cfg.user_agent.starts_with("astra-stargate-sdk/"));
    }

    #[test]
    fn config_requires_token() {
        let err = AstraDevopsConfig::from_lookup(|_| None).unwrap_err();
        assert!(matches!(
            err,
            DevopsError::Env(EnvError::Missing("ASTRA_DB_APPLICATION_TOKEN"))
        ));
    }

    #[test]
    fn extracts_astra_error_descriptions() {
        let body = r#"{"errors":[{"description":"bad tier","ID":2000},{"message":"no region"}]}"#;
        assert_eq!(
            error_messages(body).as_deref(),
            Some("bad tier (code 2000); no region")
        );
        assert_eq!(error_messages("not json"), None);
    }

    #[tokio::test]
    async fn sends_bearer_token_and_maps_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/currentOrg"))
            .and(header("authorization", "Bearer AstraCS:test"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "errors": [{"description": "token expired", "ID": 401}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client
            .get_json::<serde_json::Value>(client.url("currentOrg").unwrap())
            .await
            .unwrap_err();
        match err {
            DevopsError::Unauthorized { status, message } => {
                assert_eq!(status, StatusCode::UNAUTHORIZED);
                assert_eq!(message, "token expired (code 401)");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn retries_transient_statuses_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/currentOrg"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/currentOrg"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "o1"})))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let v: serde_json::Value = client.get_json(client.url("/currentOrg").unwrap()).await.unwrap();
        assert_eq!(v["id"], "o1");
    }

    #[test]
    fn path_segments_reject_traversal_and_query() {
        for bad in ["", " ", ".", "..", "a/b", "a?b=1", "a#frag", "a b", "%2e%2e"] {
            assert!(path_segment("id", bad).is_err(), "{bad:?} accepted");
        }
        assert_eq!(path_segment("id", " 3fa85f64-5717-4562-b3fc-2c963f66afa6 ").unwrap(), "3fa85f64-5717-4562-b3fc-2c963f66afa6");
        assert_eq!(path_segment("id", "scb_v1.2").unwrap(), "scb_v1.2");
    }

    #[tokio::test]
    async fn create_is_not_retried_on_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/things"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v2/things"))
            .respond_with(ResponseTemplate::new(201))
            .expect(0)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client
            .create(client.url("things").unwrap(), serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, DevopsError::Api { status, .. } if status == StatusCode::SERVICE_UNAVAILABLE));
    }

    #[tokio::test]
    async fn create_is_retried_when_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/things"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v2/things"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let resp = client
            .create(client.url("things").unwrap(), serde_json::json!({}))
            .await
            .unwrap()
            .require(StatusCode::CREATED)
            .unwrap();
        assert_eq!(resp.status, StatusCode::CREATED);
    }

    #[tokio::test]
    async fn gives_up_after_retry_budget() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/currentOrg"))
            .respond_with(ResponseTemplate::new(500).set_body_string("down"))
            .expect(3)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client
            .get_json::<serde_json::Value>(client.url("currentOrg").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, DevopsError::Api { status, ref body } if status.as_u16() == 500 && body == "down"));
    }
}
