//! Result of a finished plan execution.

use crate::core::{FailureData, Status};
use serde::{Deserialize, Serialize};

/// Terminal status of a plan execution plus the failures behind it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanExecutionResult {
    /// The plan execution id.
    pub plan_execution_id: String,
    /// Terminal status of the root node.
    pub status: Status,
    /// Failures of every failed node that was not replaced by a retry.
    #[serde(default)]
    pub failures: Vec<FailureData>,
    /// Completion time, epoch milliseconds.
    pub end_ts: i64,
}

impl PlanExecutionResult {
    /// Returns true if the plan ended in a positive status.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_positive()
    }
}
