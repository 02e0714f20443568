//! Endpoint configuration, loaded once and shared read-only.

use crate::error::{MigrationError, Result, Side};
use crate::poll::PollSettings;
use crate::transport::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Environment variable overriding the source token.
pub const ENV_SOURCE_TOKEN: &str = "FERRY_SOURCE_TOKEN";
/// Environment variable overriding the target PAT.
pub const ENV_TARGET_PAT: &str = "FERRY_TARGET_PAT";
/// Environment variable pinning the target API version.
pub const ENV_TARGET_API_VERSION: &str = "FERRY_TARGET_API_VERSION";
/// Environment variable overriding the working directory root.
pub const ENV_WORK_DIR: &str = "FERRY_WORK_DIR";

/// A credential that never shows up in Debug or Display output.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretString {
    inner: String,
}

impl SecretString {
    /// Creates a new secret string.
    pub fn new(s: impl Into<String>) -> Self {
        Self { inner: s.into() }
    }

    /// Exposes the secret value.
    pub fn expose(&self) -> &str {
        &self.inner
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

/// Source platform endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceEndpoint {
    /// Instance URL, e.g. `https://gitlab.example.com`.
    pub base_url: String,
    /// Bearer token.
    #[serde(default)]
    pub token: SecretString,
}

/// Target platform endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetEndpoint {
    /// Organization URL, e.g. `https://dev.example.com/acme-org`.
    pub organization_url: String,
    /// Personal access token, sent as basic auth.
    #[serde(default)]
    pub pat: SecretString,
    /// Pinned API version. Skips negotiation when set.
    #[serde(default)]
    pub api_version: Option<String>,
    /// Candidate versions for negotiation, highest first.
    #[serde(default = "default_api_versions")]
    pub api_versions: Vec<String>,
}

fn default_api_versions() -> Vec<String> {
    vec!["7.1".to_string(), "7.0".to_string(), "6.0".to_string()]
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("./ferry-work")
}

fn default_parallelism() -> usize {
    4
}

/// Process-wide endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub source: SourceEndpoint,
    pub target: TargetEndpoint,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub poll: PollSettings,
    /// Per-request timeout.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Emit one structured record per remote call.
    #[serde(default)]
    pub log_calls: bool,
    /// Retry once through `curl` on TLS failures.
    #[serde(default = "default_true")]
    pub tls_fallback: bool,
    /// Root for per-entity working directories and run manifests.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Concurrent source-side preparations in a bulk run.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
}

impl EndpointConfig {
    /// Create a configuration with default tunables.
    pub fn new(source: SourceEndpoint, target: TargetEndpoint, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            source,
            target,
            retry: RetryPolicy::default(),
            poll: PollSettings::default(),
            request_timeout_secs: default_request_timeout_secs(),
            log_calls: false,
            tls_fallback: true,
            work_dir: work_dir.into(),
            parallelism: default_parallelism(),
        }
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the operation poll bounds.
    pub fn with_poll(mut self, poll: PollSettings) -> Self {
        self.poll = poll;
        self
    }

    /// Enable or disable per-call logging.
    pub fn with_call_logging(mut self, enabled: bool) -> Self {
        self.log_calls = enabled;
        self
    }

    /// Enable or disable the TLS fallback path.
    pub fn with_tls_fallback(mut self, enabled: bool) -> Self {
        self.tls_fallback = enabled;
        self
    }

    /// Set bulk parallelism.
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Loads configuration from a YAML or JSON file, applies environment
    /// overrides, and validates the result.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            MigrationError::InvalidConfig(format!("failed to read {}: {e}", path.display()))
        })?;

        let mut config: EndpointConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            _ => serde_yaml::from_str(&content)?,
        };
        config.apply_env_overrides(std::env::vars());
        config.validate()?;

        tracing::debug!(
            path = %path.display(),
            source = %config.source.base_url,
            target = %config.target.organization_url,
            "Loaded endpoint configuration"
        );
        Ok(config)
    }

    /// Apply `FERRY_*` overrides from the given variables.
    pub fn apply_env_overrides<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            match key.as_str() {
                ENV_SOURCE_TOKEN => self.source.token = SecretString::new(value),
                ENV_TARGET_PAT => self.target.pat = SecretString::new(value),
                ENV_TARGET_API_VERSION => self.target.api_version = Some(value),
                ENV_WORK_DIR => self.work_dir = PathBuf::from(value),
                _ => {}
            }
        }
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        for (name, raw) in [
            ("source.base_url", &self.source.base_url),
            ("target.organization_url", &self.target.organization_url),
        ] {
            let url = url::Url::parse(raw)
                .map_err(|e| MigrationError::InvalidConfig(format!("{name} is not a URL: {e}")))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(MigrationError::InvalidConfig(format!(
                    "{name} must be http or https"
                )));
            }
        }

        if self.source.token.is_empty() {
            return Err(MigrationError::InvalidConfig(format!(
                "source token is empty (set it in the file or {ENV_SOURCE_TOKEN})"
            )));
        }
        if self.target.pat.is_empty() {
            return Err(MigrationError::InvalidConfig(format!(
                "target PAT is empty (set it in the file or {ENV_TARGET_PAT})"
            )));
        }
        if self.target.api_version.is_none() && self.target.api_versions.is_empty() {
            return Err(MigrationError::InvalidConfig(
                "no target api_version and no api_versions to negotiate".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(MigrationError::InvalidConfig(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.poll.max_attempts == 0 {
            return Err(MigrationError::InvalidConfig(
                "poll.max_attempts must be at least 1".into(),
            ));
        }
        if self.parallelism == 0 {
            return Err(MigrationError::InvalidConfig(
                "parallelism must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Base URL for a side, without a trailing slash.
    pub fn base_url(&self, side: Side) -> &str {
        match side {
            Side::Source => self.source.base_url.trim_end_matches('/'),
            Side::Target => self.target.organization_url.trim_end_matches('/'),
        }
    }
}

/// Configuration pointing at example hosts, with a pinned API version.
#[cfg(test)]
pub(crate) fn test_config() -> EndpointConfig {
    EndpointConfig::new(
        SourceEndpoint {
            base_url: "https://gitlab.example.com".into(),
            token: SecretString::new("glpat-test"),
        },
        TargetEndpoint {
            organization_url: "https://dev.example.com/org".into(),
            pat: SecretString::new("pat-test"),
            api_version: Some("7.1".into()),
            api_versions: default_api_versions(),
        },
        "/tmp/ferry",
    )
}
