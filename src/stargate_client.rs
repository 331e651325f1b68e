//! Load-balanced Stargate HTTP client.
//!
//! Unique responsibility: send authenticated requests to a set of Stargate
//! nodes, spreading them with a [`LoadBalancer`] and failing over when a node
//! misbehaves.
//!
//! ```text
//! execute(method, path)
//!     → nodes.select()                         (weighted, quarantine-aware)
//!     → send with X-Cassandra-Token
//!         - connect error / timeout / 5xx      → quarantine node, try next node
//!         - 401 (first time)                   → invalidate token, retry
//!         - anything else                      → return response
//!     → NoNodeAvailable once every node has been tried or quarantined
//! ```
//!
//! API-specific calls (Document API) are `impl` blocks on [`StargateClient`]
//! in `stargate_document`.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use url::Url;

use crate::env_config::{EnvError, EnvReader, process_env};
use crate::loadbalancer::{LoadBalancer, LoadBalancerError, LoadBalancingPolicy, ResourceSnapshot};
use crate::stargate_auth::{StaticTokenProvider, TableTokenProvider, TokenProvider};

/// Header carrying the Stargate auth token.
pub const TOKEN_HEADER: &str = "X-Cassandra-Token";

/// Configuration for the Stargate client.
#[derive(Clone, Debug)]
pub struct StargateConfig {
    /// Base URLs of the Stargate REST/Document nodes.
    /// Env: `STARGATE_NODES` (comma-separated, default: "<http://localhost:8082>")
    pub nodes: Vec<String>,

    /// Base URLs of the Stargate auth service.
    /// Env: `STARGATE_AUTH_URLS` (comma-separated, default: "<http://localhost:8081>")
    pub auth_urls: Vec<String>,

    /// Username for table-based auth.
    /// Env: `STARGATE_USERNAME` (default: "cassandra")
    pub username: String,

    /// Password for table-based auth.
    /// Env: `STARGATE_PASSWORD` (default: "cassandra")
    pub password: String,

    /// Fixed token; when set, table-based auth is skipped.
    /// Env: `STARGATE_TOKEN` (optional)
    pub static_token: Option<String>,

    /// Node selection policy.
    /// Env: `STARGATE_LB_POLICY` (default: "round_robin")
    pub policy: LoadBalancingPolicy,

    /// How long a failing node stays out of rotation, in milliseconds.
    /// Env: `STARGATE_QUARANTINE_MS` (default: 10000)
    pub quarantine_ms: u64,

    /// Lifetime of a table-based auth token, in milliseconds.
    /// Env: `STARGATE_TOKEN_TTL_MS` (default: 300000)
    pub token_ttl_ms: u64,

    /// HTTP request timeout in milliseconds.
    /// Env: `STARGATE_HTTP_TIMEOUT_MS` (default: 15000)
    pub timeout_ms: u64,
}

impl Default for StargateConfig {
    fn default() -> Self {
        Self {
            nodes: vec!["http://localhost:8082".to_string()],
            auth_urls: vec!["http://localhost:8081".to_string()],
            username: "cassandra".to_string(),
            password: "cassandra".to_string(),
            static_token: None,
            policy: LoadBalancingPolicy::RoundRobin,
            quarantine_ms: 10_000,
            token_ttl_ms: 300_000,
            timeout_ms: 15_000,
        }
    }
}

impl StargateConfig {
    /// Client for an Astra database data endpoint, authenticated with an application token.
    pub fn astra(data_endpoint_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            nodes: vec![data_endpoint_url.into()],
            auth_urls: Vec::new(),
            static_token: Some(token.into()),
            ..Self::default()
        }
    }

    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable holds an invalid value.
    pub fn from_env() -> Result<Self, StargateError> {
        Self::from_lookup(process_env())
    }

    /// Load configuration through an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if a key holds an invalid value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, StargateError> {
        let env = EnvReader::new(lookup);

        let policy = match env.get("STARGATE_LB_POLICY") {
            None => LoadBalancingPolicy::RoundRobin,
            Some(raw) => LoadBalancingPolicy::parse(&raw).ok_or(EnvError::Invalid {
                key: "STARGATE_LB_POLICY",
                value: raw,
                reason: "expected round_robin or random",
            })?,
        };

        Ok(Self {
            nodes: env.csv_or("STARGATE_NODES", "http://localhost:8082"),
            auth_urls: env.csv_or("STARGATE_AUTH_URLS", "http://localhost:8081"),
            username: env.string_or("STARGATE_USERNAME", "cassandra"),
            password: env.string_or("STARGATE_PASSWORD", "cassandra"),
            static_token: env.get("STARGATE_TOKEN"),
            policy,
            quarantine_ms: env.u64_or("STARGATE_QUARANTINE_MS", 10_000)?,
            token_ttl_ms: env.u64_or("STARGATE_TOKEN_TTL_MS", 300_000)?,
            timeout_ms: env.u64_or("STARGATE_HTTP_TIMEOUT_MS", 15_000)?,
        })
    }
}

/// Buffered response from a Stargate node.
#[derive(Debug, Clone)]
pub struct StargateResponse {
    /// HTTP status.
    pub status: StatusCode,
    /// Raw body.
    pub body: String,
}

impl StargateResponse {
    fn ensure_success(self) -> Result<Self, StargateError> {
        if self.status.is_success() {
            Ok(self)
        } else {
            Err(StargateError::Api {
                status: self.status,
                body: self.body,
            })
        }
    }

    fn json<T: DeserializeOwned>(self) -> Result<T, StargateError> {
        serde_json::from_str(&self.body).map_err(|source| StargateError::Json {
            source,
            body: self.body,
        })
    }
}

/// HTTP client spreading calls over several Stargate nodes.
pub struct StargateClient {
    http: reqwest::Client,
    nodes: LoadBalancer<Url>,
    tokens: Arc<dyn TokenProvider>,
}

impl StargateClient {
    /// Create a client from configuration.
    ///
    /// Uses [`StaticTokenProvider`] when a static token is configured and
    /// [`TableTokenProvider`] otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if a URL is invalid or the HTTP client cannot be built.
    pub fn new(cfg: &StargateConfig) -> Result<Self, StargateError> {
        if cfg.static_token.is_none() && cfg.auth_urls.is_empty() {
            return Err(StargateError::InvalidArgument(
                "either a static token or at least one auth url is required".to_string(),
            ));
        }
        let http = build_http(cfg)?;
        let tokens: Arc<dyn TokenProvider> = match &cfg.static_token {
            Some(token) => Arc::new(StaticTokenProvider::new(token.clone())),
            None => Arc::new(TableTokenProvider::new(
                http.clone(),
                balancer(&cfg.auth_urls, cfg.policy, cfg.quarantine_ms)?,
                cfg.username.clone(),
                cfg.password.clone(),
                Duration::from_millis(cfg.token_ttl_ms),
            )),
        };
        Self::with_token_provider(cfg, tokens)
    }

    /// Create a client with a caller-supplied token provider.
    ///
    /// # Errors
    ///
    /// Returns an error if no node is configured, a URL is invalid, or the HTTP
    /// client cannot be built.
    pub fn with_token_provider(
        cfg: &StargateConfig,
        tokens: Arc<dyn TokenProvider>,
    ) -> Result<Self, StargateError> {
        if cfg.nodes.is_empty() {
            return Err(StargateError::InvalidArgument(
                "at least one stargate node is required".to_string(),
            ));
        }
        Ok(Self {
            http: build_http(cfg)?,
            nodes: balancer(&cfg.nodes, cfg.policy, cfg.quarantine_ms)?,
            tokens,
        })
    }

    /// State of every node (weights, usage, quarantine).
    #[must_use]
    pub fn node_snapshot(&self) -> Vec<ResourceSnapshot> {
        self.nodes.snapshot()
    }

    /// Send a request, failing over between nodes.
    ///
    /// `path` is relative to the node base URL (e.g. `v2/schemas/namespaces`).
    ///
    /// # Errors
    ///
    /// Returns [`StargateError::NoNodeAvailable`] once every node failed or is
    /// quarantined, [`StargateError::Unauthorized`] if the token is rejected twice.
    pub async fn execute(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&serde_json::Value>,
    ) -> Result<StargateResponse, StargateError> {
        let max_attempts = self.nodes.len();
        let mut attempts = 0;
        let mut token_refreshed = false;
        let mut last_error: Option<String> = None;

        while attempts < max_attempts {
            let node = match self.nodes.select() {
                Ok(node) => node,
                Err(LoadBalancerError::NoResourceAvailable) => break,
                Err(e) => return Err(e.into()),
            };
            attempts += 1;

            let mut url = node
                .resource
                .join(path.trim_start_matches('/'))
                .map_err(|e| StargateError::InvalidArgument(format!("invalid path {path:?}: {e}")))?;
            if !query.is_empty() {
                url.query_pairs_mut().extend_pairs(query);
            }

            let token = self.tokens.token().await?;
            let mut req = self
                .http
                .request(method.clone(), url.clone())
                .header(TOKEN_HEADER, token)
                .header(reqwest::header::ACCEPT, "application/json");
            if let Some(b) = body {
                req = req.json(b);
            }

            let resp = match req.send().await {
                Ok(resp) => resp,
                Err(e) if e.is_connect() || e.is_timeout() => {
                    let cause = if e.is_timeout() { "timeout" } else { "connect error" };
                    self.nodes.mark_unavailable(&node.id, cause, Some(e.to_string()))?;
                    last_error = Some(format!("{}: {e}", node.id));
                    continue;
                }
                Err(e) => return Err(StargateError::Http(e)),
            };

            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();

            if status.is_server_error() {
                self.nodes
                    .mark_unavailable(&node.id, format!("HTTP {}", status.as_u16()), Some(text.clone()))?;
                last_error = Some(format!("{}: HTTP {status}", node.id));
                continue;
            }

            if status == StatusCode::UNAUTHORIZED {
                if token_refreshed {
                    return Err(StargateError::Unauthorized(text));
                }
                tracing::debug!(node = %node.id, "token rejected, refreshing");
                self.tokens.invalidate().await;
                token_refreshed = true;
                attempts -= 1;
                continue;
            }

            tracing::debug!(%method, %url, %status, "stargate call completed");
            return Ok(StargateResponse { status, body: text });
        }

        Err(StargateError::NoNodeAvailable { last_error })
    }

    /// GET a JSON resource, mapping 404 to `None`.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure, non-2xx status, or invalid JSON.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Option<T>, StargateError> {
        let resp = self.execute(Method::GET, path, query, None).await?;
        if resp.status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        resp.ensure_success()?.json().map(Some)
    }

    /// POST a JSON body and decode the JSON answer.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure, non-2xx status, or invalid JSON.
    pub async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, StargateError> {
        let value = to_json(body)?;
        self.execute(Method::POST, path, &[], Some(&value))
            .await?
            .ensure_success()?
            .json()
    }

    /// PUT a JSON body and decode the JSON answer.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure, non-2xx status, or invalid JSON.
    pub async fn put_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, StargateError> {
        let value = to_json(body)?;
        self.execute(Method::PUT, path, &[], Some(&value))
            .await?
            .ensure_success()?
            .json()
    }

    /// Send a request and only check for a 2xx status.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or non-2xx status.
    pub async fn send_ok(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<(), StargateError> {
        self.execute(method, path, &[], body)
            .await?
            .ensure_success()?;
        Ok(())
    }

    /// DELETE a resource.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or non-2xx status.
    pub async fn delete(&self, path: &str) -> Result<(), StargateError> {
        self.send_ok(Method::DELETE, path, None).await
    }
}

fn build_http(cfg: &StargateConfig) -> Result<reqwest::Client, StargateError> {
    reqwest::Client::builder()
        .timeout(Duration::from_millis(cfg.timeout_ms))
        .user_agent(format!("astra-stargate-sdk/{}", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(StargateError::Http)
}

/// Balancer over base URLs, using the URL itself as resource id.
pub(crate) fn balancer(
    urls: &[String],
    policy: LoadBalancingPolicy,
    quarantine_ms: u64,
) -> Result<LoadBalancer<Url>, StargateError> {
    let parsed = urls
        .iter()
        .map(|raw| {
            let base = Url::parse(&format!("{}/", raw.trim_end_matches('/')))
                .map_err(|e| StargateError::InvalidArgument(format!("invalid url {raw:?}: {e}")))?;
            Ok((raw.trim_end_matches('/').to_string(), base))
        })
        .collect::<Result<Vec<_>, StargateError>>()?;

    Ok(LoadBalancer::new(policy, parsed)?.with_quarantine(Duration::from_millis(quarantine_ms)))
}

fn to_json<B: Serialize + ?Sized>(body: &B) -> Result<serde_json::Value, StargateError> {
    serde_json::to_value(body).map_err(|source| StargateError::Json {
        source,
        body: String::new(),
    })
}

/// Error type for Stargate operations.
#[derive(Debug, Error)]
pub enum StargateError {
    /// Configuration could not be read from the environment.
    #[error(transparent)]
    Env(#[from] EnvError),
    /// Argument rejected before any call was made.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Load balancer misuse (duplicate node, unknown id, ...).
    #[error("load balancer error: {0}")]
    LoadBalancer(#[from] LoadBalancerError),
    /// Every node failed or is quarantined.
    #[error("no stargate node available (last error: {})", .last_error.as_deref().unwrap_or("none"))]
    NoNodeAvailable {
        /// Last failure observed before giving up.
        last_error: Option<String>,
    },
    /// Username/password rejected by the auth service.
    #[error("invalid credentials")]
    InvalidCredentials,
    /// Token rejected by a data node, even after refresh.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// HTTP client error.
    #[error("http error: {0}")]
    Http(#[source] reqwest::Error),
    /// JSON (de)serialization error.
    #[error("json decode error: {source}")]
    Json {
        /// The JSON parsing error.
        #[source]
        source: serde_json::Error,
        /// The response body.
        body: String,
    },
    /// API error response.
    #[error("stargate api error: status={status}, body={body}")]
    Api {
        /// HTTP status code.
        status: StatusCode,
        /// Response body.
        body: String,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Client over the given mock nodes with a fixed token.
    pub(crate) fn client_for(servers: &[&MockServer]) -> StargateClient {
        let cfg = StargateConfig {
            nodes: servers.iter().map(|s| s.uri()).collect(),
            static_token: Some("tok".to_string()),
            ..StargateConfig::default()
        };
        StargateClient::new(&cfg).unwrap()
    }

    #[test]
    fn config_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("STARGATE_NODES", "http://n1:8082,http://n2:8082"),
            ("STARGATE_LB_POLICY", "random"),
            ("STARGATE_QUARANTINE_MS", "250"),
        ]
        .into();
        let cfg = StargateConfig::from_lookup(|k| vars.get(k).map(|v| (*v).to_string())).unwrap();
        assert_eq!(cfg.nodes, vec!["http://n1:8082", "http://n2:8082"]);
        assert_eq!(cfg.auth_urls, vec!["http://localhost:8081"]);
        assert_eq!(cfg.policy, LoadBalancingPolicy::Random);
        assert_eq!(cfg.quarantine_ms, 250);
        assert_eq!(cfg.username, "cassandra");
        assert!(cfg.static_token.is_none());

        let bad: HashMap<&str, &str> = [("STARGATE_LB_POLICY", "sticky")].into();
        assert!(matches!(
            StargateConfig::from_lookup(|k| bad.get(k).map(|v| (*v).to_string())),
            Err(StargateError::Env(EnvError::Invalid { key: "STARGATE_LB_POLICY", .. }))
        ));
    }

    #[test]
    fn rejects_duplicate_nodes() {
        let cfg = StargateConfig {
            nodes: vec!["http://n1:1".into(), "http://n1:1/".into()],
            static_token: Some("t".into()),
            ..StargateConfig::default()
        };
        assert!(matches!(
            StargateClient::new(&cfg),
            Err(StargateError::LoadBalancer(LoadBalancerError::DuplicateResource(_)))
        ));
    }

    #[tokio::test]
    async fn sends_token_header_and_spreads_calls() {
        let n1 = MockServer::start().await;
        let n2 = MockServer::start().await;
        for server in [&n1, &n2] {
            Mock::given(method("GET"))
                .and(path("/v2/schemas/namespaces"))
                .and(header(TOKEN_HEADER, "tok"))
                .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": []})))
                .expect(2)
                .mount(server)
                .await;
        }

        let client = client_for(&[&n1, &n2]);
        for _ in 0..4 {
            let v: Option<serde_json::Value> = client.get_json("v2/schemas/namespaces", &[]).await.unwrap();
            assert!(v.is_some());
        }
    }

    #[tokio::test]
    async fn fails_over_and_quarantines_failing_node() {
        let bad = MockServer::start().await;
        let good = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .expect(1)
            .mount(&bad)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/thing"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .expect(3)
            .mount(&good)
            .await;

        let client = client_for(&[&bad, &good]);
        for _ in 0..3 {
            let v: serde_json::Value = client.get_json("/v2/thing", &[]).await.unwrap().unwrap();
            assert_eq!(v["ok"], true);
        }

        let snap = client.node_snapshot();
        assert!(!snap[0].available);
        assert_eq!(snap[0].unavailability.as_ref().unwrap().cause, "HTTP 503");
        assert!(snap[1].available);
    }

    #[tokio::test]
    async fn reports_no_node_when_all_fail() {
        let n1 = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&n1)
            .await;

        let client = client_for(&[&n1]);
        let err = client.get_json::<serde_json::Value>("v2/x", &[]).await.unwrap_err();
        assert!(matches!(err, StargateError::NoNodeAvailable { last_error: Some(_) }));

        // Quarantined: no further call reaches the node.
        let err = client.get_json::<serde_json::Value>("v2/x", &[]).await.unwrap_err();
        assert!(matches!(err, StargateError::NoNodeAvailable { last_error: None }));
    }

    #[test]
    fn rejects_blank_node_list() {
        let vars: HashMap<&str, &str> = [("STARGATE_NODES", " , "), ("STARGATE_TOKEN", "t")].into();
        let cfg = StargateConfig::from_lookup(|k| vars.get(k).map(|v| (*v).to_string())).unwrap();
        assert!(cfg.nodes.is_empty());
        assert!(matches!(
            StargateClient::new(&cfg),
            Err(StargateError::InvalidArgument(_))
        ));

        let no_auth = StargateConfig {
            auth_urls: Vec::new(),
            ..StargateConfig::default()
        };
        assert!(matches!(
            StargateClient::new(&no_auth),
            Err(StargateError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_node_is_quarantined_as_connect_error() {
        // Bind then drop to get a local port nobody listens on.
        let closed = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            format!("http://{}", listener.local_addr().unwrap())
        };
        let good = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/thing"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .expect(1)
            .mount(&good)
            .await;

        let cfg = StargateConfig {
            nodes: vec![closed, good.uri()],
            static_token: Some("tok".to_string()),
            ..StargateConfig::default()
        };
        let client = StargateClient::new(&cfg).unwrap();
        let v: serde_json::Value = client.get_json("v2/thing", &[]).await.unwrap().unwrap();
        assert_eq!(v["ok"], true);

        let snap = client.node_snapshot();
        assert!(!snap[0].available);
        let info = snap[0].unavailability.as_ref().unwrap();
        assert_eq!(info.cause, "connect error");
        assert!(info.error.is_some());
        assert!(snap[1].available);
    }

    #[tokio::test]
    async fn token_rejected_twice_is_unauthorized() {
        let n1 = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad token"))
            .expect(2)
            .mount(&n1)
            .await;

        let client = client_for(&[&n1]);
        let err = client.get_json::<serde_json::Value>("v2/x", &[]).await.unwrap_err();
        assert!(matches!(err, StargateError::Unauthorized(ref body) if body == "bad token"));
        assert!(client.node_snapshot()[0].available);
    }

    #[tokio::test]
    async fn client_errors_do_not_quarantine() {
        let n1 = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad where clause"))
            .mount(&n1)
            .await;

        let client = client_for(&[&n1]);
        let err = client.get_json::<serde_json::Value>("v2/x", &[]).await.unwrap_err();
        assert!(matches!(err, StargateError::Api { status, .. } if status == StatusCode::BAD_REQUEST));
        assert!(client.node_snapshot()[0].available);
    }
}
