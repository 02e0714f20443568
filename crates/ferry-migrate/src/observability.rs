//! Structured logging initialization.
//!
//! Per-call records are emitted on the `ferry_migrate::calls` target, so they
//! can be filtered separately (e.g. `RUST_LOG=ferry_migrate=warn,ferry_migrate::calls=info`).

use crate::config::EndpointConfig;
use crate::error::{MigrationError, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable pretty format.
    Pretty,
    /// JSON lines for log aggregation.
    Json,
}

impl LogFormat {
    /// Parse log format from string.
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }
}

/// Filter used when `RUST_LOG` is not set.
pub fn default_filter(level: &str) -> String {
    format!("ferry_migrate={level},reqwest=warn,hyper=warn")
}

/// How the global subscriber is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: String,
    pub format: LogFormat,
    /// Include file and line of each event.
    pub source_locations: bool,
    /// Keep per-call records at `info` even when `level` is quieter.
    pub call_records: bool,
}

impl LogSettings {
    pub fn new(level: impl Into<String>, format: LogFormat) -> Self {
        Self {
            level: level.into(),
            format,
            source_locations: false,
            call_records: false,
        }
    }

    /// Settings that keep call records visible whenever `log_calls` is on.
    pub fn for_endpoints(
        level: impl Into<String>,
        format: LogFormat,
        config: &EndpointConfig,
    ) -> Self {
        Self::new(level, format).with_call_records(config.log_calls)
    }

    pub fn with_source_locations(mut self, enabled: bool) -> Self {
        self.source_locations = enabled;
        self
    }

    pub fn with_call_records(mut self, enabled: bool) -> Self {
        self.call_records = enabled;
        self
    }

    /// Filter directives used when `RUST_LOG` is not set.
    pub fn filter(&self) -> String {
        let mut filter = default_filter(&self.level);
        if self.call_records {
            filter.push_str(",ferry_migrate::calls=info");
        }
        filter
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `level`.
///
/// ```rust,no_run
/// use ferry_migrate::observability::{init_logging, LogFormat};
///
/// init_logging("info", LogFormat::Json).unwrap();
/// ```
pub fn init_logging(level: &str, format: LogFormat) -> Result<()> {
    init_with(&LogSettings::new(level, format))
}

/// Install the global subscriber from explicit settings.
pub fn init_with(settings: &LogSettings) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| settings.filter().into());
    let registry = tracing_subscriber::registry().with(env_filter);
    let locations = settings.source_locations;

    let installed = match settings.format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_file(locations)
                    .with_line_number(locations),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .compact()
                    .with_file(locations)
                    .with_line_number(locations),
            )
            .try_init(),
    };
    installed.map_err(|e| MigrationError::InvalidConfig(format!("logging: {e}")))?;

    tracing::debug!(
        level = %settings.level,
        format = ?settings.format,
        call_records = settings.call_records,
        "Logging initialized"
    );
    Ok(())
}
