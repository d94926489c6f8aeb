//! Tracing subscriber initialization
//!
//! Installs an `EnvFilter` driven by `RUST_LOG` and a `fmt` layer that emits
//! either JSON (for in-cluster log shipping) or human-readable lines.

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "info,testbed_operator=debug,kube=info,tower=warn,hyper=warn";

/// Errors that can occur during telemetry initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Failed to initialize tracing subscriber
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line
    #[default]
    Json,
    /// Human-readable output for local runs
    Text,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "text" | "pretty" => Ok(Self::Text),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// Configuration for telemetry initialization
#[derive(Debug, Clone, Default)]
pub struct TelemetryConfig {
    /// Output format for the fmt layer
    pub format: LogFormat,
    /// Filter directive used when `RUST_LOG` is unset
    pub default_filter: Option<String>,
}

/// Initialize the global tracing subscriber.
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    let fallback = config
        .default_filter
        .unwrap_or_else(|| DEFAULT_FILTER.to_string());
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    let registry = tracing_subscriber::registry().with(env_filter);

    let result = match config.format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(true),
            )
            .try_init(),
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init(),
    };

    result.map_err(|e| TelemetryError::SubscriberInit(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_parses_case_insensitively() {
        assert_eq!("JSON".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert_eq!("text".parse::<LogFormat>(), Ok(LogFormat::Text));
        assert_eq!("pretty".parse::<LogFormat>(), Ok(LogFormat::Text));
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn default_config_is_json() {
        let config = TelemetryConfig::default();
        assert_eq!(config.format, LogFormat::Json);
        assert!(config.default_filter.is_none());
    }
}
