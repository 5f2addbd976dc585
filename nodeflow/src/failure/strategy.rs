//! Failure strategy configuration and runtime action selection.

use crate::core::FailureType;
use crate::errors::{ContractErrorInfo, PlanValidationError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// What to do with a node that failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionConfig {
    /// Record the failure and continue as `IGNORE_FAILED`.
    Ignore,
    /// Re-run the node.
    #[serde(rename_all = "camelCase")]
    Retry {
        /// Number of extra attempts.
        retry_count: u32,
        /// Wait before each attempt in milliseconds; the last value repeats.
        #[serde(default)]
        retry_intervals: Vec<u64>,
        /// Applied once the attempts are used up.
        on_retry_failure: Box<ActionConfig>,
    },
    /// Turn the failure into `SUCCEEDED`.
    MarkAsSuccess,
    /// Keep the node `FAILED`.
    MarkAsFailure,
    /// End the node as `ABORTED`.
    Abort,
    /// Run the enclosing stage's rollback section.
    StageRollback,
    /// Run the enclosing step group's rollback section.
    StepGroupRollback,
    /// Pause the node until someone intervenes.
    #[serde(rename_all = "camelCase")]
    ManualIntervention {
        /// How long to wait for an intervention.
        timeout_ms: u64,
        /// Applied when nobody intervened in time.
        on_timeout: Box<ActionConfig>,
    },
}

impl ActionConfig {
    /// Creates a retry action.
    #[must_use]
    pub fn retry(retry_count: u32, retry_intervals: Vec<u64>, on_retry_failure: ActionConfig) -> Self {
        Self::Retry {
            retry_count,
            retry_intervals,
            on_retry_failure: Box::new(on_retry_failure),
        }
    }

    /// Creates a manual intervention action.
    #[must_use]
    pub fn manual_intervention(timeout_ms: u64, on_timeout: ActionConfig) -> Self {
        Self::ManualIntervention {
            timeout_ms,
            on_timeout: Box::new(on_timeout),
        }
    }

    /// Returns the action name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ignore => "IGNORE",
            Self::Retry { .. } => "RETRY",
            Self::MarkAsSuccess => "MARK_AS_SUCCESS",
            Self::MarkAsFailure => "MARK_AS_FAILURE",
            Self::Abort => "ABORT",
            Self::StageRollback => "STAGE_ROLLBACK",
            Self::StepGroupRollback => "STEP_GROUP_ROLLBACK",
            Self::ManualIntervention { .. } => "MANUAL_INTERVENTION",
        }
    }

    /// Returns the retry interval before attempt `attempt` (1-based).
    #[must_use]
    pub fn retry_interval_ms(&self, attempt: u32) -> u64 {
        let Self::Retry { retry_intervals, .. } = self else {
            return 0;
        };
        let index = (attempt.saturating_sub(1) as usize).min(retry_intervals.len().saturating_sub(1));
        retry_intervals.get(index).copied().unwrap_or(0)
    }

    /// Checks that nested actions are neither retries nor interventions.
    ///
    /// # Errors
    ///
    /// Returns a `PlanValidationError` naming the offending nested action.
    pub fn validate(&self) -> Result<(), PlanValidationError> {
        let nested = match self {
            Self::Retry { on_retry_failure, .. } => on_retry_failure.as_ref(),
            Self::ManualIntervention { on_timeout, .. } => on_timeout.as_ref(),
            _ => return Ok(()),
        };
        if matches!(nested, Self::Retry { .. } | Self::ManualIntervention { .. }) {
            return Err(PlanValidationError::new(format!(
                "{} cannot be nested inside {}",
                nested.name(),
                self.name()
            ))
            .with_error_info(
                ContractErrorInfo::new("PLAN-004-NESTED_ACTION", "Invalid nested failure action")
                    .with_fix_hint("Use IGNORE, ABORT, MARK_AS_* or a rollback action"),
            ));
        }
        Ok(())
    }
}

/// The failure-handling clause of a strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnFailureConfig {
    /// Failure types the action applies to.
    pub errors: Vec<FailureType>,
    /// The action to apply.
    pub action: ActionConfig,
}

/// One declared failure strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureStrategyConfig {
    /// The failure clause.
    pub on_failure: OnFailureConfig,
}

impl FailureStrategyConfig {
    /// Creates a strategy applying `action` to `errors`.
    #[must_use]
    pub fn new(errors: impl IntoIterator<Item = FailureType>, action: ActionConfig) -> Self {
        Self {
            on_failure: OnFailureConfig {
                errors: errors.into_iter().collect(),
                action,
            },
        }
    }
}

/// Resolved strategies: actions in priority order with the failure types
/// each one handles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureStrategyMap {
    entries: Vec<(ActionConfig, BTreeSet<FailureType>)>,
}

impl FailureStrategyMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a map from declared strategies, first declaration first.
    #[must_use]
    pub fn from_configs(configs: &[FailureStrategyConfig]) -> Self {
        let mut map = Self::new();
        for config in configs {
            map.insert(
                config.on_failure.action.clone(),
                config.on_failure.errors.iter().copied(),
            );
        }
        map
    }

    /// Adds an entry after the existing ones. Types join the last entry
    /// when it holds the same action; an earlier entry is never widened,
    /// so a later declaration cannot jump ahead of entries before it.
    pub fn insert(&mut self, action: ActionConfig, types: impl IntoIterator<Item = FailureType>) {
        match self.entries.last_mut() {
            Some((last, existing)) if *last == action => existing.extend(types),
            _ => self.entries.push((action, types.into_iter().collect())),
        }
    }

    /// Returns every failure type routed to an action, across all of its
    /// entries.
    #[must_use]
    pub fn get(&self, action: &ActionConfig) -> Option<BTreeSet<FailureType>> {
        self.entries
            .iter()
            .filter(|(a, _)| a == action)
            .map(|(_, types)| types.clone())
            .reduce(|mut all, types| {
                all.extend(types);
                all
            })
    }

    /// Iterates entries in priority order.
    pub fn iter(&self) -> impl Iterator<Item = (&ActionConfig, &BTreeSet<FailureType>)> {
        self.entries.iter().map(|(a, t)| (a, t))
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if there are no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn retain_non_empty(&mut self) {
        self.entries.retain(|(_, types)| !types.is_empty());
    }
}

/// Picks the action for a failure: the first entry that holds one of the
/// failure's types, or `ALL_ERRORS`.
#[must_use]
pub fn select_action<'a>(
    map: &'a FailureStrategyMap,
    failure_types: &BTreeSet<FailureType>,
) -> Option<&'a ActionConfig> {
    map.iter()
        .find(|(_, types)| {
            types.contains(&FailureType::AllErrors)
                || types.iter().any(|t| failure_types.contains(t))
        })
        .map(|(action, _)| action)
}
