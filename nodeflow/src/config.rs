//! Engine configuration.

use crate::correlation::RetryConfig;
use crate::errors::NodeflowError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the [`OrchestrationEngine`](crate::engine::OrchestrationEngine).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of worker tasks consuming node events.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Deadline for nodes that do not configure one, in milliseconds.
    #[serde(default = "default_node_timeout_ms")]
    pub default_node_timeout_ms: u64,
    /// Retry policy for handing tasks to the task executor.
    #[serde(default)]
    pub dispatch_retry: RetryConfig,
    /// Ancestor hops walked when resolving failure strategies.
    #[serde(default = "default_max_failure_strategy_depth")]
    pub max_failure_strategy_depth: usize,
    /// Age after which a response for an unregistered wait-id is dropped,
    /// in milliseconds.
    #[serde(default = "default_orphan_max_age_ms")]
    pub orphan_max_age_ms: u64,
    /// How often buffered orphan responses are purged, in milliseconds.
    #[serde(default = "default_orphan_purge_interval_ms")]
    pub orphan_purge_interval_ms: u64,
}

fn default_worker_count() -> usize {
    4
}

fn default_node_timeout_ms() -> u64 {
    60 * 60 * 1000 // 1 hour
}

fn default_max_failure_strategy_depth() -> usize {
    crate::failure::MAX_DEPTH
}

fn default_orphan_max_age_ms() -> u64 {
    10 * 60 * 1000
}

fn default_orphan_purge_interval_ms() -> u64 {
    60 * 1000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            default_node_timeout_ms: default_node_timeout_ms(),
            dispatch_retry: RetryConfig::default(),
            max_failure_strategy_depth: default_max_failure_strategy_depth(),
            orphan_max_age_ms: default_orphan_max_age_ms(),
            orphan_purge_interval_ms: default_orphan_purge_interval_ms(),
        }
    }
}

impl EngineConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a configuration from JSON; missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns a serialization error for malformed JSON.
    pub fn from_json(json: &str) -> Result<Self, NodeflowError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Sets the worker count. Zero is raised to one.
    #[must_use]
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count.max(1);
        self
    }

    /// Sets the default node deadline.
    #[must_use]
    pub fn with_default_node_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.default_node_timeout_ms = timeout_ms;
        self
    }

    /// Sets the dispatch retry policy.
    #[must_use]
    pub fn with_dispatch_retry(mut self, retry: RetryConfig) -> Self {
        self.dispatch_retry = retry;
        self
    }

    /// Sets the failure strategy depth bound.
    #[must_use]
    pub fn with_max_failure_strategy_depth(mut self, depth: usize) -> Self {
        self.max_failure_strategy_depth = depth;
        self
    }

    /// Sets how long orphan responses are kept and how often they are purged.
    /// A zero interval is raised to one millisecond.
    #[must_use]
    pub fn with_orphan_purge(mut self, max_age_ms: u64, interval_ms: u64) -> Self {
        self.orphan_max_age_ms = max_age_ms;
        self.orphan_purge_interval_ms = interval_ms.max(1);
        self
    }

    /// Returns the default node deadline as a duration.
    #[must_use]
    pub fn default_node_timeout(&self) -> Duration {
        Duration::from_millis(self.default_node_timeout_ms)
    }
}
