//! Remote call execution for both platforms.
//!
//! Every call goes through [`Transport::issue`], which applies the retry
//! policy, the target API version, authentication, the one-shot TLS fallback
//! and redacted call logging.

mod fallback;
mod retry;
mod version;

pub use fallback::{
    is_tls_failure, parse_curl_output, CurlFallback, FallbackExecutor, PreparedRequest, RawResponse,
};
pub use retry::RetryPolicy;
pub use version::ApiVersionCache;

use crate::config::EndpointConfig;
use crate::error::{ErrorKind, MigrationError, NormalizedError, Result, Side};
use crate::normalize::{normalize, RawFailure};
use crate::redact::{redact, redact_url};
use base64::Engine;
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use url::Url;

/// Query parameter carrying the target API version.
pub const API_VERSION_PARAM: &str = "api-version";

/// Cheap idempotent endpoint used to probe API versions.
const VERSION_PROBE_PATH: &str = "/_apis/projects";

/// Percent-encode a single path segment (`/` included).
pub fn encode_segment(segment: &str) -> String {
    url::form_urlencoded::byte_serialize(segment.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

/// A remote call to issue.
#[derive(Debug, Clone)]
pub struct Operation {
    pub method: Method,
    /// Path relative to the side's base URL, starting with `/`.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    pub side: Side,
}

impl Operation {
    pub fn new(side: Side, method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            side,
        }
    }

    pub fn get(side: Side, path: impl Into<String>) -> Self {
        Self::new(side, Method::GET, path)
    }

    pub fn post(side: Side, path: impl Into<String>, body: Value) -> Self {
        Self::new(side, Method::POST, path).with_body(body)
    }

    pub fn put(side: Side, path: impl Into<String>, body: Value) -> Self {
        Self::new(side, Method::PUT, path).with_body(body)
    }

    pub fn patch(side: Side, path: impl Into<String>, body: Value) -> Self {
        Self::new(side, Method::PATCH, path).with_body(body)
    }

    pub fn delete(side: Side, path: impl Into<String>) -> Self {
        Self::new(side, Method::DELETE, path)
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Whether the call can change remote state.
    pub fn is_mutating(&self) -> bool {
        !matches!(self.method, Method::GET | Method::HEAD | Method::OPTIONS)
    }
}

/// A successful remote response.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub body: String,
}

impl Response {
    /// Decode the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.body).map_err(MigrationError::from)
    }
}

/// Why one attempt failed, and whether another attempt may follow.
#[derive(Debug)]
struct AttemptFailure {
    error: NormalizedError,
    terminal: bool,
}

impl AttemptFailure {
    fn retryable(error: NormalizedError) -> Self {
        Self {
            error,
            terminal: false,
        }
    }

    fn terminal(error: NormalizedError) -> Self {
        Self {
            error,
            terminal: true,
        }
    }
}

impl std::fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.error.fmt(f)
    }
}

/// Executes operations against the source and target platforms.
pub struct Transport {
    config: Arc<EndpointConfig>,
    client: Client,
    fallback: Option<Arc<dyn FallbackExecutor>>,
    api_version: ApiVersionCache,
}

impl Transport {
    /// Create a transport. Installs the `curl` fallback when enabled.
    pub fn new(config: Arc<EndpointConfig>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("ferry-migrate/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        let fallback: Option<Arc<dyn FallbackExecutor>> = if config.tls_fallback {
            Some(Arc::new(CurlFallback::new(config.request_timeout_secs)))
        } else {
            None
        };

        Ok(Self {
            config,
            client,
            fallback,
            api_version: ApiVersionCache::new(),
        })
    }

    /// Replace the TLS fallback executor.
    pub fn with_fallback(mut self, fallback: Arc<dyn FallbackExecutor>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    /// Issue an operation with retries.
    pub async fn issue(&self, op: &Operation) -> std::result::Result<Response, NormalizedError> {
        let version = match op.side {
            Side::Target => Some(self.api_version().await?),
            Side::Source => None,
        };
        self.dispatch(op, version.as_deref()).await
    }

    /// Target API version: pinned, cached, or negotiated now.
    pub async fn api_version(&self) -> std::result::Result<String, NormalizedError> {
        if let Some(pinned) = &self.config.target.api_version {
            return Ok(pinned.clone());
        }
        if let Some(cached) = self.api_version.get() {
            return Ok(cached);
        }
        let negotiated = self.negotiate_api_version().await?;
        self.api_version.set(negotiated.clone());
        Ok(negotiated)
    }

    /// Forget the negotiated version; the next target call probes again.
    pub fn refresh_api_version(&self) {
        self.api_version.clear();
    }

    async fn negotiate_api_version(&self) -> std::result::Result<String, NormalizedError> {
        let probe = Operation::get(Side::Target, VERSION_PROBE_PATH).with_query("$top", "1");
        let mut last_error = None;

        for candidate in &self.config.target.api_versions {
            match self.dispatch(&probe, Some(candidate)).await {
                Ok(_) => {
                    info!(api_version = %candidate, "Negotiated target API version");
                    return Ok(candidate.clone());
                }
                Err(e) if e.status == 400 || e.status == 404 => {
                    debug!(api_version = %candidate, status = e.status, "API version not supported");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        let tried = self.config.target.api_versions.join(", ");
        Err(match last_error {
            Some(mut e) => {
                e.message = format!("no mutually supported API version among [{tried}]: {}", e.message);
                e
            }
            None => NormalizedError {
                side: Side::Target,
                endpoint: redact(self.config.base_url(Side::Target)).into_owned(),
                status: 0,
                kind: ErrorKind::Client,
                message: "no candidate API versions configured".to_string(),
                raw_body: None,
            },
        })
    }

    async fn dispatch(
        &self,
        op: &Operation,
        version: Option<&str>,
    ) -> std::result::Result<Response, NormalizedError> {
        let url = self.build_url(op, version)?;
        let endpoint = redact_url(&url);
        let attempts = AtomicU32::new(0);
        let fallback_used = AtomicBool::new(false);
        let started = Instant::now();

        let result = self
            .config
            .retry
            .execute(
                || {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    self.attempt(op, &url, &endpoint, &fallback_used)
                },
                |failure: &AttemptFailure| {
                    !failure.terminal && self.config.retry.is_retryable(&failure.error)
                },
            )
            .await
            .map_err(|failure| failure.error);

        if self.config.log_calls {
            let status = match &result {
                Ok(response) => response.status,
                Err(e) => e.status,
            };
            let path = match url.query() {
                Some(query) => format!("{}?{query}", url.path()),
                None => url.path().to_string(),
            };
            info!(
                target: "ferry_migrate::calls",
                side = %op.side,
                method = %op.method,
                path = %redact(&path),
                status = status,
                attempts = attempts.load(Ordering::SeqCst),
                duration_ms = started.elapsed().as_millis() as u64,
                "remote call"
            );
        }

        result
    }

    async fn attempt(
        &self,
        op: &Operation,
        url: &Url,
        endpoint: &str,
        fallback_used: &AtomicBool,
    ) -> std::result::Result<Response, AttemptFailure> {
        let mut request = self
            .client
            .request(op.method.clone(), url.clone())
            .header("Authorization", self.authorization(op.side))
            .header("Accept", "application/json");
        if let Some(body) = &op.body {
            request = request.json(body);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                if is_tls_failure(&err) {
                    if let Some(fallback) = &self.fallback {
                        if !fallback_used.swap(true, Ordering::SeqCst) {
                            return self.attempt_fallback(op, url, endpoint, fallback.as_ref()).await;
                        }
                    }
                    return Err(AttemptFailure::terminal(transport_failure(
                        op.side, endpoint, &err,
                    )));
                }
                return Err(AttemptFailure::retryable(transport_failure(
                    op.side, endpoint, &err,
                )));
            }
        };

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|err| AttemptFailure::retryable(transport_failure(op.side, endpoint, &err)))?;

        check_status(op.side, endpoint, status, body).map_err(AttemptFailure::retryable)
    }

    async fn attempt_fallback(
        &self,
        op: &Operation,
        url: &Url,
        endpoint: &str,
        fallback: &dyn FallbackExecutor,
    ) -> std::result::Result<Response, AttemptFailure> {
        tracing::warn!(
            side = %op.side,
            endpoint = %endpoint,
            "TLS failure, retrying once through the external HTTP client"
        );

        let mut headers = vec![
            ("Authorization".to_string(), self.authorization(op.side)),
            ("Accept".to_string(), "application/json".to_string()),
        ];
        if op.body.is_some() {
            headers.push(("Content-Type".to_string(), "application/json".to_string()));
        }
        let prepared = PreparedRequest {
            method: op.method.to_string(),
            url: url.to_string(),
            headers,
            body: op.body.as_ref().map(Value::to_string),
        };

        match fallback.execute(&prepared).await {
            Ok(raw) => check_status(op.side, endpoint, raw.status, raw.body)
                .map_err(AttemptFailure::terminal),
            Err(message) => Err(AttemptFailure::terminal(normalize(
                RawFailure::Transport {
                    message: format!("TLS fallback failed: {message}"),
                    kind: ErrorKind::Tls,
                },
                op.side,
                endpoint,
            ))),
        }
    }

    fn build_url(
        &self,
        op: &Operation,
        version: Option<&str>,
    ) -> std::result::Result<Url, NormalizedError> {
        let raw = format!("{}{}", self.config.base_url(op.side), op.path);
        let mut url = Url::parse(&raw).map_err(|e| NormalizedError {
            side: op.side,
            endpoint: redact(&raw).into_owned(),
            status: 0,
            kind: ErrorKind::Client,
            message: format!("invalid URL: {e}"),
            raw_body: None,
        })?;

        if !op.query.is_empty() || version.is_some() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &op.query {
                pairs.append_pair(key, value);
            }
            if let Some(version) = version {
                pairs.append_pair(API_VERSION_PARAM, version);
            }
        }
        Ok(url)
    }

    fn authorization(&self, side: Side) -> String {
        match side {
            Side::Source => format!("Bearer {}", self.config.source.token.expose()),
            Side::Target => {
                let credential = format!(":{}", self.config.target.pat.expose());
                format!(
                    "Basic {}",
                    base64::engine::general_purpose::STANDARD.encode(credential)
                )
            }
        }
    }
}

fn check_status(
    side: Side,
    endpoint: &str,
    status: u16,
    body: String,
) -> std::result::Result<Response, NormalizedError> {
    if (200..300).contains(&status) {
        return Ok(Response { status, body });
    }
    Err(normalize(RawFailure::Http { status, body: &body }, side, endpoint))
}

fn transport_failure(side: Side, endpoint: &str, err: &reqwest::Error) -> NormalizedError {
    let kind = if is_tls_failure(err) {
        ErrorKind::Tls
    } else {
        ErrorKind::Network
    };
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    normalize(RawFailure::Transport { message, kind }, side, endpoint)
}
