//! The node execution record.

use crate::ambiance::Ambiance;
use crate::core::{FailureData, Status, StepType};
use crate::errors::NodeflowError;
use crate::failure::ActionConfig;
use crate::steps::PassThroughData;
use crate::utils::now_millis;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Progress of a task chain or child chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChainState {
    /// The first link is being produced. A chain node with no recorded
    /// state is here.
    Started,
    /// A link is in flight and more may follow.
    Chaining,
    /// The chain has ended; finalization is pending.
    Finalizing,
    /// Finalization ran.
    Done,
}

impl ChainState {
    /// Returns the state after a link reports `chain_end`.
    #[must_use]
    pub fn advance(self, chain_end: bool) -> Self {
        match (self, chain_end) {
            (Self::Done, _) => Self::Done,
            (_, true) => Self::Finalizing,
            (Self::Started | Self::Chaining, false) => Self::Chaining,
            (Self::Finalizing, false) => Self::Finalizing,
        }
    }

    /// Returns true once the chain has ended.
    #[must_use]
    pub fn is_finalizing(self) -> bool {
        matches!(self, Self::Finalizing | Self::Done)
    }
}

/// One runtime instantiation of a plan node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecution {
    /// Unique runtime id.
    pub runtime_id: String,
    /// Plan execution the node belongs to.
    pub plan_execution_id: String,
    /// Static plan-node id.
    pub setup_id: String,
    /// Plan-node identifier.
    pub identifier: String,
    /// Runtime id of the parent node.
    pub parent_id: Option<String>,
    /// Addressing of the node.
    pub ambiance: Ambiance,
    /// Current status.
    pub status: Status,
    /// Step type of the node.
    pub step_type: StepType,
    /// First transition to running, epoch milliseconds.
    pub start_ts: Option<i64>,
    /// Transition to a terminal status, epoch milliseconds.
    pub end_ts: Option<i64>,
    /// Failures recorded on the node.
    #[serde(default)]
    pub failure_info: Vec<FailureData>,
    /// Chain-scoped state capsule.
    pub pass_through: Option<PassThroughData>,
    /// Chain progress, for chain kinds.
    pub chain_state: Option<ChainState>,
    /// Wait-ids of the current suspension.
    #[serde(default)]
    pub wait_ids: Vec<String>,
    /// Executor task ids of dispatched tasks.
    #[serde(default)]
    pub task_ids: Vec<String>,
    /// Runtime ids of earlier attempts of this node.
    #[serde(default)]
    pub retry_ids: Vec<String>,
    /// True once a newer attempt replaced this one.
    #[serde(default)]
    pub old_retry: bool,
    /// Wait-id this node's completion resolves in its parent.
    pub notify_id: Option<String>,
    /// Runtime id of the failed node this rollback branch runs for.
    #[serde(default)]
    pub rollback_of: Option<String>,
    /// Outcomes published by the step.
    #[serde(default)]
    pub outcomes: HashMap<String, serde_json::Value>,
    /// Action applied if a manual intervention times out.
    pub intervention_timeout_action: Option<ActionConfig>,
    /// Optimistic concurrency counter, bumped on each update.
    pub version: u64,
    /// Creation time, epoch milliseconds.
    pub created_at: i64,
    /// Last update time, epoch milliseconds.
    pub updated_at: i64,
}

impl NodeExecution {
    /// Creates a queued node addressed by the ambiance's current level.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` if the ambiance has no levels.
    pub fn new(ambiance: Ambiance) -> Result<Self, NodeflowError> {
        let level = ambiance
            .current_level()
            .ok_or_else(|| NodeflowError::invalid_request("Node ambiance has no levels"))?
            .clone();
        let now = now_millis();
        Ok(Self {
            runtime_id: level.runtime_id,
            plan_execution_id: ambiance.plan_execution_id().to_string(),
            setup_id: level.setup_id,
            identifier: level.identifier,
            parent_id: ambiance.parent_runtime_id().map(str::to_string),
            status: Status::Queued,
            step_type: level.step_type,
            ambiance,
            start_ts: None,
            end_ts: None,
            failure_info: Vec::new(),
            pass_through: None,
            chain_state: None,
            wait_ids: Vec::new(),
            task_ids: Vec::new(),
            retry_ids: Vec::new(),
            old_retry: false,
            notify_id: None,
            rollback_of: None,
            outcomes: HashMap::new(),
            intervention_timeout_action: None,
            version: 0,
            created_at: now,
            updated_at: now,
        })
    }

    /// Sets the wait-id resolved in the parent on completion.
    #[must_use]
    pub fn with_notify_id(mut self, notify_id: impl Into<String>) -> Self {
        self.notify_id = Some(notify_id.into());
        self
    }

    /// Sets the runtime ids of earlier attempts.
    #[must_use]
    pub fn with_retry_ids(mut self, retry_ids: Vec<String>) -> Self {
        self.retry_ids = retry_ids;
        self
    }

    /// Marks the node as the rollback branch of a failed node.
    #[must_use]
    pub fn with_rollback_of(mut self, runtime_id: Option<String>) -> Self {
        self.rollback_of = runtime_id;
        self
    }

    /// Returns the retry index of this attempt.
    #[must_use]
    pub fn retry_index(&self) -> u32 {
        self.ambiance.current_level().map_or(0, |l| l.retry_index)
    }

    /// Returns true if the node is terminal.
    #[must_use]
    pub fn is_final(&self) -> bool {
        self.status.is_final()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ambiance::Level;
    use crate::core::StepCategory;

    #[test]
    fn test_chain_state_transitions() {
        assert_eq!(ChainState::Started.advance(false), ChainState::Chaining);
        assert_eq!(ChainState::Chaining.advance(false), ChainState::Chaining);
        assert_eq!(ChainState::Started.advance(true), ChainState::Finalizing);
        assert_eq!(ChainState::Chaining.advance(true), ChainState::Finalizing);
        assert_eq!(ChainState::Done.advance(false), ChainState::Done);
        assert!(ChainState::Finalizing.is_finalizing());
        assert!(!ChainState::Chaining.is_finalizing());
    }

    #[test]
    fn test_new_node_from_ambiance() {
        let ambiance = Ambiance::new("pe1", "plan1")
            .clone_for_child(Level::new(
                "s-stage",
                "r-stage",
                "deploy",
                StepType::new("DEPLOY", StepCategory::Stage),
            ))
            .clone_for_child(
                Level::new("s-step", "r-step", "apply", StepType::step("K8S")).with_retry_index(1),
            );

        let node = NodeExecution::new(ambiance).unwrap().with_notify_id("r-step");
        assert_eq!(node.runtime_id, "r-step");
        assert_eq!(node.parent_id.as_deref(), Some("r-stage"));
        assert_eq!(node.status, Status::Queued);
        assert_eq!(node.retry_index(), 1);
        assert_eq!(node.notify_id.as_deref(), Some("r-step"));
    }

    #[test]
    fn test_new_node_requires_level() {
        assert!(NodeExecution::new(Ambiance::new("pe1", "plan1")).is_err());
    }
}
