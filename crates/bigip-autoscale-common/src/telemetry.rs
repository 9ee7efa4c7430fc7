//! Logging initialization
//!
//! Sets up JSON structured logging through `tracing-subscriber`. Each
//! convergence pass is a short-lived process on the device, so there is no
//! exporter; everything goes to stdout where the host's log collector picks
//! it up.

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Errors that can occur during logging initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The directive string could not be parsed
    #[error("invalid log filter: {0}")]
    InvalidFilter(String),

    /// Failed to initialize tracing subscriber
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Default filter used when neither the config nor `RUST_LOG` names one
pub const DEFAULT_FILTER: &str = "info,bigip_autoscale=debug";

/// Configuration for logging initialization
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Explicit filter directives (e.g., "info,bigip_autoscale_cluster=trace")
    /// If None, `RUST_LOG` is used, then [`DEFAULT_FILTER`]
    pub filter: Option<String>,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: None,
            json: true,
        }
    }
}

impl LoggingConfig {
    /// Resolve the filter this config describes
    pub fn env_filter(&self) -> Result<EnvFilter, TelemetryError> {
        match &self.filter {
            Some(directives) => EnvFilter::try_new(directives)
                .map_err(|e| TelemetryError::InvalidFilter(e.to_string())),
            None => Ok(EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))),
        }
    }
}

/// Initialize logging with the given configuration
///
/// Fails if a global subscriber is already installed.
///
/// # Example
///
/// ```ignore
/// use bigip_autoscale_common::telemetry::{init_logging, LoggingConfig};
///
/// init_logging(LoggingConfig::default())?;
/// ```
pub fn init_logging(config: LoggingConfig) -> Result<(), TelemetryError> {
    let env_filter = config.env_filter()?;

    let result = if config.json {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .with_file(false)
            .with_line_number(false);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
    };

    result.map_err(|e: tracing_subscriber::util::TryInitError| {
        TelemetryError::SubscriberInit(e.to_string())
    })
}
