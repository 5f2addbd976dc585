//! Execution addressing: the ambiance level stack.
//!
//! An [`Ambiance`] identifies where in the execution DAG a unit of work runs.
//! Level *i* is always an ancestor scope of level *i+1*, and the last level is
//! the current node. Ambiances are never mutated: every derivation returns a
//! new value.

mod level;

pub use level::Level;

use crate::core::{StepCategory, StepType};
use crate::errors::NodeflowError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identifiers that never appear in a fully qualified name.
const FQN_IGNORED_IDENTIFIERS: &[&str] = &["parallel"];

/// The ordered addressing stack of a node execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ambiance {
    plan_execution_id: String,
    plan_id: String,
    #[serde(default)]
    levels: Vec<Level>,
    #[serde(default)]
    setup_abstractions: BTreeMap<String, String>,
}

impl Ambiance {
    /// Creates an ambiance with no levels.
    #[must_use]
    pub fn new(plan_execution_id: impl Into<String>, plan_id: impl Into<String>) -> Self {
        Self {
            plan_execution_id: plan_execution_id.into(),
            plan_id: plan_id.into(),
            levels: Vec::new(),
            setup_abstractions: BTreeMap::new(),
        }
    }

    /// Sets the setup abstractions (account, org, project, ...).
    #[must_use]
    pub fn with_setup_abstractions(mut self, abstractions: BTreeMap<String, String>) -> Self {
        self.setup_abstractions = abstractions;
        self
    }

    /// Returns the plan execution id.
    #[must_use]
    pub fn plan_execution_id(&self) -> &str {
        &self.plan_execution_id
    }

    /// Returns the plan id.
    #[must_use]
    pub fn plan_id(&self) -> &str {
        &self.plan_id
    }

    /// Returns the levels, outermost first.
    #[must_use]
    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    /// Returns a setup abstraction value.
    #[must_use]
    pub fn setup_abstraction(&self, key: &str) -> Option<&str> {
        self.setup_abstractions.get(key).map(String::as_str)
    }

    /// Returns the ambiance of a child: this stack plus `level`.
    #[must_use]
    pub fn clone_for_child(&self, level: Level) -> Self {
        let mut child = self.clone();
        child.levels.push(level);
        child
    }

    /// Returns the ambiance of the parent: this stack minus the current level.
    #[must_use]
    pub fn clone_for_finish(&self) -> Self {
        let mut parent = self.clone();
        parent.levels.pop();
        parent
    }

    /// Returns an ambiance keeping at most the first `depth` levels.
    #[must_use]
    pub fn clone_to_depth(&self, depth: usize) -> Self {
        let mut truncated = self.clone();
        truncated.levels.truncate(depth);
        truncated
    }

    /// Returns the current level.
    #[must_use]
    pub fn current_level(&self) -> Option<&Level> {
        self.levels.last()
    }

    /// Returns the runtime id of the current node.
    #[must_use]
    pub fn current_runtime_id(&self) -> Option<&str> {
        self.current_level().map(|l| l.runtime_id.as_str())
    }

    /// Returns the setup id of the current node.
    #[must_use]
    pub fn current_setup_id(&self) -> Option<&str> {
        self.current_level().map(|l| l.setup_id.as_str())
    }

    /// Returns the identifier of the current node.
    #[must_use]
    pub fn step_identifier(&self) -> Option<&str> {
        self.current_level().map(|l| l.identifier.as_str())
    }

    /// Returns the step type of the current node.
    #[must_use]
    pub fn current_step_type(&self) -> Option<&StepType> {
        self.current_level().map(|l| &l.step_type)
    }

    /// Returns the group of the current node.
    #[must_use]
    pub fn current_group(&self) -> Option<&str> {
        self.current_level().and_then(|l| l.group.as_deref())
    }

    /// Returns the start timestamp of the current level.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` when the ambiance has no levels.
    pub fn current_level_start_ts(&self) -> Result<i64, NodeflowError> {
        self.current_level()
            .map(|l| l.start_ts)
            .ok_or_else(|| NodeflowError::invalid_request("Ambiance has no levels"))
    }

    /// Returns the runtime id of the parent node.
    #[must_use]
    pub fn parent_runtime_id(&self) -> Option<&str> {
        let len = self.levels.len();
        if len < 2 {
            return None;
        }
        Some(self.levels[len - 2].runtime_id.as_str())
    }

    /// Returns the innermost level with the given category.
    #[must_use]
    pub fn innermost_level_of(&self, category: StepCategory) -> Option<&Level> {
        self.levels
            .iter()
            .rev()
            .find(|l| l.step_type.category == category)
    }

    /// Returns the enclosing stage level.
    #[must_use]
    pub fn stage_level(&self) -> Option<&Level> {
        self.innermost_level_of(StepCategory::Stage)
    }

    /// Returns the enclosing strategy level.
    #[must_use]
    pub fn strategy_level(&self) -> Option<&Level> {
        self.innermost_level_of(StepCategory::Strategy)
    }

    /// Returns true if the current node is a retry attempt.
    #[must_use]
    pub fn is_retry(&self) -> bool {
        self.current_level().is_some_and(|l| l.retry_index > 0)
    }

    /// Returns the fully qualified name of the current node.
    ///
    /// Levels that skip the expression chain are left out.
    #[must_use]
    pub fn fqn(&self) -> String {
        fqn_from_levels(&self.levels)
    }
}

/// Builds a dotted fully qualified name from a level stack.
#[must_use]
pub fn fqn_from_levels(levels: &[Level]) -> String {
    levels
        .iter()
        .filter(|l| !l.skip_expression_chain)
        .filter(|l| !FQN_IGNORED_IDENTIFIERS.contains(&l.identifier.as_str()))
        .map(|l| l.identifier.as_str())
        .collect::<Vec<_>>()
        .join(".")
}
