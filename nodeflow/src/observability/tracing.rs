//! Subscriber installation and node-scoped spans.

use crate::ambiance::Ambiance;
use crate::errors::NodeflowError;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "nodeflow=info";

/// Output format of the installed subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Plain,
    /// One JSON object per line.
    Json,
}

/// Installs a global `tracing` subscriber.
///
/// The filter comes from `RUST_LOG`, falling back to [`DEFAULT_FILTER`].
///
/// # Errors
///
/// Returns `Internal` if a global subscriber is already installed.
pub fn init_tracing(format: LogFormat) -> Result<(), NodeflowError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let registry = tracing_subscriber::registry().with(filter);
    let installed = match format {
        LogFormat::Plain => registry.with(fmt::layer().with_target(true)).try_init(),
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
    };
    installed.map_err(|e| NodeflowError::Internal(format!("Failed to install subscriber: {e}")))
}

/// Creates a span carrying the node's addressing fields.
#[must_use]
pub fn node_span(ambiance: &Ambiance) -> tracing::Span {
    tracing::info_span!(
        "node",
        plan_execution_id = ambiance.plan_execution_id(),
        runtime_id = ambiance.current_runtime_id().unwrap_or_default(),
        fqn = %ambiance.fqn(),
    )
}

/// Measures how long a node spent between two lifecycle points.
#[derive(Debug)]
pub struct SpanTimer {
    start: Instant,
    name: String,
}

impl SpanTimer {
    /// Starts a timer.
    #[must_use]
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            name: name.into(),
        }
    }

    /// Returns the elapsed time in milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    /// Returns the timer name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_serde() {
        assert_eq!(serde_json::to_string(&LogFormat::Json).unwrap(), r#""json""#);
        let parsed: LogFormat = serde_json::from_str(r#""plain""#).unwrap();
        assert_eq!(parsed, LogFormat::Plain);
    }

    #[test]
    fn test_second_init_fails() {
        let _ = init_tracing(LogFormat::Plain);
        assert!(init_tracing(LogFormat::Json).is_err());
    }

    #[test]
    fn test_span_timer() {
        let timer = SpanTimer::start("dispatch");
        assert_eq!(timer.name(), "dispatch");
        assert!(timer.elapsed_ms() >= 0.0);
    }
}
