//! A single addressing level of an ambiance.

use crate::core::StepType;
use crate::utils::now_millis;
use serde::{Deserialize, Serialize};

/// One entry of the ambiance stack: identifies a node in the execution DAG.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Level {
    /// Static plan-node identity.
    pub setup_id: String,
    /// Unique id of this execution instance.
    pub runtime_id: String,
    /// Retry attempt index, zero for the first attempt.
    #[serde(default)]
    pub retry_index: u32,
    /// Identifier of the plan node.
    pub identifier: String,
    /// Optional classification tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Step type of the node.
    pub step_type: StepType,
    /// Whether the level is left out of fully qualified names.
    #[serde(default)]
    pub skip_expression_chain: bool,
    /// Start time in epoch milliseconds.
    pub start_ts: i64,
}

impl Level {
    /// Creates a level starting now.
    #[must_use]
    pub fn new(
        setup_id: impl Into<String>,
        runtime_id: impl Into<String>,
        identifier: impl Into<String>,
        step_type: StepType,
    ) -> Self {
        Self {
            setup_id: setup_id.into(),
            runtime_id: runtime_id.into(),
            retry_index: 0,
            identifier: identifier.into(),
            group: None,
            step_type,
            skip_expression_chain: false,
            start_ts: now_millis(),
        }
    }

    /// Sets the retry index.
    #[must_use]
    pub fn with_retry_index(mut self, retry_index: u32) -> Self {
        self.retry_index = retry_index;
        self
    }

    /// Sets the group.
    #[must_use]
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Sets whether the level is skipped in expression chains.
    #[must_use]
    pub fn with_skip_expression_chain(mut self, skip: bool) -> Self {
        self.skip_expression_chain = skip;
        self
    }

    /// Sets the start timestamp.
    #[must_use]
    pub fn with_start_ts(mut self, start_ts: i64) -> Self {
        self.start_ts = start_ts;
        self
    }
}
