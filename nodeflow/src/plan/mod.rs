//! Compiled plans consumed by the engine.
//!
//! A [`Plan`] is the static graph a plan compiler produces: plan nodes keyed
//! by setup id, each naming its step type, parameters and failure
//! strategies. Parent/child structure is not stored here. It emerges at
//! runtime from the children a step asks for.

use crate::ambiance::Ambiance;
use crate::core::{StepCategory, StepType};
use crate::errors::{ContractErrorInfo, PlanValidationError};
use crate::failure::{FailureStrategyConfig, FieldScope, ScopeNode};
use crate::steps::{StepInputPackage, StepParameters};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, OnceLock};

const IDENTIFIER_PATTERN: &str = "^[a-zA-Z_][0-9a-zA-Z_$]{0,127}$";

fn identifier_regex() -> Option<&'static Regex> {
    static REGEX: OnceLock<Option<Regex>> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(IDENTIFIER_PATTERN).ok()).as_ref()
}

/// One node of a compiled plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanNode {
    /// Unique static id.
    pub setup_id: String,
    /// User-facing identifier.
    pub identifier: String,
    /// Display name.
    pub name: String,
    /// Step type used to look up the implementation.
    pub step_type: StepType,
    /// Group label copied into the node's level.
    #[serde(default)]
    pub group: Option<String>,
    /// Step-specific parameters.
    #[serde(default)]
    pub step_parameters: serde_json::Value,
    /// Resolved inputs handed to the step.
    #[serde(default)]
    pub inputs: HashMap<String, serde_json::Value>,
    /// Leave the node's identifier out of the fully qualified name.
    #[serde(default)]
    pub skip_expression_chain: bool,
    /// Finish the node as `SKIPPED` without running it.
    #[serde(default)]
    pub skip: bool,
    /// Node deadline; the engine default applies when absent.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Declared failure strategies.
    #[serde(default)]
    pub failure_strategies: Vec<FailureStrategyConfig>,
    /// True if the node belongs to a rollback section.
    #[serde(default)]
    pub in_rollback_section: bool,
    /// Setup id of the node's rollback section (stages and step groups).
    #[serde(default)]
    pub rollback_setup_id: Option<String>,
    /// Sibling started after this node completes positively.
    #[serde(default)]
    pub next_id: Option<String>,
}

impl PlanNode {
    /// Creates a plan node with no parameters or strategies.
    #[must_use]
    pub fn new(
        setup_id: impl Into<String>,
        identifier: impl Into<String>,
        step_type: StepType,
    ) -> Self {
        let identifier = identifier.into();
        Self {
            setup_id: setup_id.into(),
            name: identifier.clone(),
            identifier,
            step_type,
            group: None,
            step_parameters: serde_json::Value::Null,
            inputs: HashMap::new(),
            skip_expression_chain: false,
            skip: false,
            timeout_ms: None,
            failure_strategies: Vec::new(),
            in_rollback_section: false,
            rollback_setup_id: None,
            next_id: None,
        }
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the group label.
    #[must_use]
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Sets the step parameters.
    #[must_use]
    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.step_parameters = parameters;
        self
    }

    /// Adds an input.
    #[must_use]
    pub fn with_input(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.inputs.insert(key.into(), value);
        self
    }

    /// Excludes the node from fully qualified names.
    #[must_use]
    pub fn skip_expression_chain(mut self) -> Self {
        self.skip_expression_chain = true;
        self
    }

    /// Marks the node to be skipped.
    #[must_use]
    pub fn skipped(mut self) -> Self {
        self.skip = true;
        self
    }

    /// Sets the node deadline.
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Adds a failure strategy.
    #[must_use]
    pub fn with_failure_strategy(mut self, strategy: FailureStrategyConfig) -> Self {
        self.failure_strategies.push(strategy);
        self
    }

    /// Marks the node as part of a rollback section.
    #[must_use]
    pub fn in_rollback_section(mut self) -> Self {
        self.in_rollback_section = true;
        self
    }

    /// Sets the rollback section of a stage or step group.
    #[must_use]
    pub fn with_rollback(mut self, setup_id: impl Into<String>) -> Self {
        self.rollback_setup_id = Some(setup_id.into());
        self
    }

    /// Sets the next sibling.
    #[must_use]
    pub fn with_next(mut self, setup_id: impl Into<String>) -> Self {
        self.next_id = Some(setup_id.into());
        self
    }

    /// Builds the parameters handed to the step.
    #[must_use]
    pub fn to_parameters(&self) -> StepParameters {
        let mut params = StepParameters::new(&self.identifier, self.step_parameters.clone());
        params.name.clone_from(&self.name);
        params.timeout_ms = self.timeout_ms;
        params
    }

    /// Builds the input package handed to the step.
    #[must_use]
    pub fn to_inputs(&self) -> StepInputPackage {
        StepInputPackage::new(self.inputs.clone())
    }

    fn field_scope(&self) -> Option<FieldScope> {
        match self.step_type.category {
            StepCategory::Step => Some(FieldScope::Step),
            StepCategory::StepGroup => Some(FieldScope::StepGroup),
            StepCategory::Stage => Some(FieldScope::Stage),
            _ => None,
        }
    }
}

/// A compiled plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    /// Plan id.
    pub plan_id: String,
    /// Setup id of the root node.
    pub start_node_id: String,
    /// Nodes keyed by setup id.
    pub nodes: BTreeMap<String, PlanNode>,
    /// Values copied into every ambiance.
    #[serde(default)]
    pub setup_abstractions: BTreeMap<String, String>,
}

impl Plan {
    /// Creates a plan from its root node id and nodes.
    #[must_use]
    pub fn new(
        plan_id: impl Into<String>,
        start_node_id: impl Into<String>,
        nodes: impl IntoIterator<Item = PlanNode>,
    ) -> Self {
        Self {
            plan_id: plan_id.into(),
            start_node_id: start_node_id.into(),
            nodes: nodes.into_iter().map(|n| (n.setup_id.clone(), n)).collect(),
            setup_abstractions: BTreeMap::new(),
        }
    }

    /// Adds a setup abstraction.
    #[must_use]
    pub fn with_setup_abstraction(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.setup_abstractions.insert(key.into(), value.into());
        self
    }

    /// Returns a node by setup id.
    #[must_use]
    pub fn node(&self, setup_id: &str) -> Option<&PlanNode> {
        self.nodes.get(setup_id)
    }

    /// Returns the root node.
    #[must_use]
    pub fn start_node(&self) -> Option<&PlanNode> {
        self.node(&self.start_node_id)
    }

    /// Builds the failure-strategy scope chain for the node an ambiance
    /// addresses.
    ///
    /// Levels whose plan node is not a step, step group or stage are left
    /// out of the chain.
    #[must_use]
    pub fn scope_for(&self, ambiance: &Ambiance) -> Option<ScopeNode> {
        let mut parent: Option<Arc<ScopeNode>> = None;
        let mut current: Option<ScopeNode> = None;
        for level in ambiance.levels() {
            let Some(node) = self.node(&level.setup_id) else {
                continue;
            };
            let Some(kind) = node.field_scope() else {
                continue;
            };
            if let Some(previous) = current.take() {
                parent = Some(Arc::new(previous));
            }
            let mut scope = ScopeNode::new(kind, &node.identifier)
                .with_strategies(node.failure_strategies.clone())
                .in_rollback_section(node.in_rollback_section);
            if let Some(rollback) = &node.rollback_setup_id {
                scope = scope.with_rollback_setup_id(rollback);
            }
            if let Some(parent) = &parent {
                scope = scope.with_parent(Arc::clone(parent));
            }
            current = Some(scope);
        }
        current
    }

    /// Validates identifiers, references and failure strategies.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), PlanValidationError> {
        if self.start_node().is_none() {
            return Err(PlanValidationError::new(format!(
                "Start node '{}' is not part of the plan",
                self.start_node_id
            ))
            .with_nodes(vec![self.start_node_id.clone()])
            .with_error_info(ContractErrorInfo::new(
                "PLAN-001-MISSING_START",
                "Missing start node",
            )));
        }

        let regex = identifier_regex();
        for node in self.nodes.values() {
            if regex.is_some_and(|re| !re.is_match(&node.identifier)) {
                return Err(PlanValidationError::new(format!(
                    "Identifier '{}' of node '{}' is invalid",
                    node.identifier, node.setup_id
                ))
                .with_nodes(vec![node.setup_id.clone()])
                .with_error_info(
                    ContractErrorInfo::new("PLAN-003-INVALID_IDENTIFIER", "Invalid identifier")
                        .with_fix_hint(format!("Identifiers must match {IDENTIFIER_PATTERN}")),
                ));
            }

            for reference in node.next_id.iter().chain(node.rollback_setup_id.iter()) {
                if !self.nodes.contains_key(reference) {
                    return Err(PlanValidationError::new(format!(
                        "Node '{}' references unknown node '{reference}'",
                        node.setup_id
                    ))
                    .with_nodes(vec![node.setup_id.clone(), reference.clone()])
                    .with_error_info(ContractErrorInfo::new(
                        "PLAN-002-MISSING_NODE",
                        "Reference to a missing node",
                    )));
                }
            }

            for strategy in &node.failure_strategies {
                strategy
                    .on_failure
                    .action
                    .validate()
                    .map_err(|e| e.with_nodes(vec![node.setup_id.clone()]))?;
            }
        }

        self.detect_next_cycles()
    }

    fn detect_next_cycles(&self) -> Result<(), PlanValidationError> {
        for start in self.nodes.keys() {
            let mut seen = HashSet::new();
            let mut path = Vec::new();
            let mut cursor = Some(start.as_str());
            while let Some(id) = cursor {
                if !seen.insert(id) {
                    path.push(id.to_string());
                    return Err(PlanValidationError::new(format!(
                        "Sibling chain contains a cycle: {}",
                        path.join(" -> ")
                    ))
                    .with_nodes(path)
                    .with_error_info(ContractErrorInfo::new(
                        "PLAN-005-CYCLE",
                        "Cyclic next references",
                    )));
                }
                path.push(id.to_string());
                cursor = self.node(id).and_then(|n| n.next_id.as_deref());
            }
        }
        Ok(())
    }
}
