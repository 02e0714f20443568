//! Error types for migration operations.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Which platform a remote call (or failure) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// The platform repositories are migrated from.
    Source,
    /// The platform repositories are migrated to.
    Target,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source => write!(f, "source"),
            Self::Target => write!(f, "target"),
        }
    }
}

/// Classification of a normalized remote failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connection reset, DNS failure, connect timeout.
    Network,
    /// TLS handshake or certificate validation failure.
    Tls,
    /// HTTP 429.
    RateLimited,
    /// HTTP 5xx.
    Server,
    /// HTTP 401 or 403.
    Auth,
    /// HTTP 404.
    NotFound,
    /// HTTP 409.
    Conflict,
    /// Any other 4xx.
    Client,
}

impl ErrorKind {
    /// Classify an HTTP status. Status 0 means no response was received.
    pub fn from_status(status: u16) -> Self {
        match status {
            0 => Self::Network,
            401 | 403 => Self::Auth,
            404 => Self::NotFound,
            409 => Self::Conflict,
            429 => Self::RateLimited,
            500..=599 => Self::Server,
            _ => Self::Client,
        }
    }
}

/// Remediation class shown to operators alongside a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Remediation {
    /// Check the token and its scopes.
    Auth,
    /// Connectivity or TLS; retry once the link is back.
    Network,
    /// Wait for the quota window, then rerun.
    RateLimit,
    /// The platform answered 5xx.
    Server,
    /// Something with the same identity already exists.
    Conflict,
    NotFound,
    /// An async operation did not finish within the poll budget.
    Timeout,
    /// Fix the request or endpoint settings.
    Configuration,
    /// Git clone or push failed.
    Transfer,
    /// Work dir or history file could not be written.
    Persistence,
}

impl fmt::Display for Remediation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Auth => "auth",
            Self::Network => "network",
            Self::RateLimit => "rate-limit",
            Self::Server => "server",
            Self::Conflict => "conflict",
            Self::NotFound => "not-found",
            Self::Timeout => "timeout",
            Self::Configuration => "configuration",
            Self::Transfer => "transfer",
            Self::Persistence => "persistence",
        };
        f.write_str(s)
    }
}

/// A remote failure from either platform, reduced to one shape.
///
/// `endpoint` and `raw_body` are always redacted before they are stored here.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{side} request to {endpoint} failed (status {status}): {message}")]
pub struct NormalizedError {
    pub side: Side,
    pub endpoint: String,
    /// HTTP status, or 0 when no response was received.
    pub status: u16,
    pub kind: ErrorKind,
    pub message: String,
    pub raw_body: Option<String>,
}

impl NormalizedError {
    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }

    pub fn remediation(&self) -> Remediation {
        match self.kind {
            ErrorKind::Network | ErrorKind::Tls => Remediation::Network,
            ErrorKind::RateLimited => Remediation::RateLimit,
            ErrorKind::Server => Remediation::Server,
            ErrorKind::Auth => Remediation::Auth,
            ErrorKind::NotFound => Remediation::NotFound,
            ErrorKind::Conflict => Remediation::Conflict,
            ErrorKind::Client => Remediation::Configuration,
        }
    }
}

/// Migration-specific errors.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// A remote call failed after the transport gave up.
    #[error(transparent)]
    Remote(#[from] NormalizedError),

    /// Desired and observed state differ and no override was requested.
    #[error("Conflict on {side} {entity}: {detail}")]
    Conflict {
        side: Side,
        entity: String,
        detail: String,
    },

    /// The credentials lack permission for the operation.
    #[error("Permission denied on {side} {entity}: {message}")]
    PermissionDenied {
        side: Side,
        entity: String,
        message: String,
    },

    /// An entity that must exist does not.
    #[error("Not found on {side}: {entity}")]
    NotFound { side: Side, entity: String },

    /// A bounded poll ran out of attempts.
    #[error("Timed out waiting for {operation} after {attempts} polls")]
    Timeout { operation: String, attempts: u32 },

    /// A remote long-running operation reported failure.
    #[error("Remote operation {operation} ended with status {status}")]
    OperationFailed { operation: String, status: String },

    /// Preflight found conditions that block migration.
    #[error("Preflight blocked {entity}: {}", reasons.join("; "))]
    PreflightBlocked { entity: String, reasons: Vec<String> },

    /// Failed to fetch the source mirror.
    #[error("Git fetch failed: {0}")]
    GitFetchFailed(String),

    /// Failed to push to the target.
    #[error("Git push failed: {0}")]
    GitPushFailed(String),

    /// Entity type does not support the requested mutation.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Local persisted state could not be read or written.
    #[error("Persistence error at {}: {message}", path.display())]
    Persistence { path: PathBuf, message: String },

    /// The run was cancelled before this entity started.
    #[error("Cancelled before start")]
    Cancelled,

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// YAML parsing error.
    #[error("YAML parsing error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// HTTP client construction error.
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

impl MigrationError {
    /// The platform the failure originated on, when there is one.
    pub fn side(&self) -> Option<Side> {
        match self {
            Self::Remote(e) => Some(e.side),
            Self::Conflict { side, .. }
            | Self::PermissionDenied { side, .. }
            | Self::NotFound { side, .. } => Some(*side),
            Self::Timeout { .. } | Self::OperationFailed { .. } | Self::GitPushFailed(_) => {
                Some(Side::Target)
            }
            Self::GitFetchFailed(_) | Self::PreflightBlocked { .. } => Some(Side::Source),
            _ => None,
        }
    }

    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Remote(e) => e.remediation(),
            Self::Conflict { .. } => Remediation::Conflict,
            Self::PermissionDenied { .. } => Remediation::Auth,
            Self::NotFound { .. } => Remediation::NotFound,
            Self::Timeout { .. } => Remediation::Timeout,
            Self::OperationFailed { .. } => Remediation::Server,
            Self::PreflightBlocked { .. } | Self::Unsupported(_) | Self::InvalidConfig(_) => {
                Remediation::Configuration
            }
            Self::GitFetchFailed(_) | Self::GitPushFailed(_) => Remediation::Transfer,
            Self::Persistence { .. } | Self::IoError(_) => Remediation::Persistence,
            Self::JsonError(_) | Self::YamlError(_) => Remediation::Configuration,
            Self::HttpError(_) => Remediation::Network,
            Self::Cancelled => Remediation::Configuration,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Operator-facing summary of a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub side: Option<Side>,
    pub remediation: Remediation,
    pub message: String,
}

impl From<&MigrationError> for FailureInfo {
    fn from(err: &MigrationError) -> Self {
        Self {
            side: err.side(),
            remediation: err.remediation(),
            message: crate::redact::redact(&err.to_string()).into_owned(),
        }
    }
}

impl fmt::Display for FailureInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.side {
            Some(side) => write!(f, "[{side}/{}] {}", self.remediation, self.message),
            None => write!(f, "[{}] {}", self.remediation, self.message),
        }
    }
}

/// Result type for migration operations.
pub type Result<T> = std::result::Result<T, MigrationError>;
