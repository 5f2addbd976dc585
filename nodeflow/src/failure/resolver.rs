//! Multi-level failure strategy resolution.
//!
//! Strategies are declared on steps, step groups and stages. For a given
//! plan node the effective strategies are merged with priority
//! step > step group > stage: once a scope claims a failure type, scopes
//! further out cannot claim it again.

use super::strategy::{FailureStrategyConfig, FailureStrategyMap};
use crate::core::FailureType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Maximum number of ancestor hops walked from the current node.
pub const MAX_DEPTH: usize = 5;

/// The kind of scope a failure strategy is declared on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldScope {
    /// A single step.
    Step,
    /// A step group.
    StepGroup,
    /// A stage.
    Stage,
}

/// A node of the plan's scope ancestry.
#[derive(Debug, Clone)]
pub struct ScopeNode {
    /// Scope kind.
    pub kind: FieldScope,
    /// Plan identifier of the scope.
    pub identifier: String,
    /// Strategies declared on the scope, in declaration order.
    pub failure_strategies: Vec<FailureStrategyConfig>,
    /// True if the scope sits inside a rollback section.
    pub in_rollback_section: bool,
    /// Setup id of the scope's rollback section, if it has one.
    pub rollback_setup_id: Option<String>,
    /// Enclosing scope.
    pub parent: Option<Arc<ScopeNode>>,
}

impl ScopeNode {
    /// Creates a scope with no strategies and no parent.
    #[must_use]
    pub fn new(kind: FieldScope, identifier: impl Into<String>) -> Self {
        Self {
            kind,
            identifier: identifier.into(),
            failure_strategies: Vec::new(),
            in_rollback_section: false,
            rollback_setup_id: None,
            parent: None,
        }
    }

    /// Sets the declared strategies.
    #[must_use]
    pub fn with_strategies(mut self, strategies: Vec<FailureStrategyConfig>) -> Self {
        self.failure_strategies = strategies;
        self
    }

    /// Marks the scope as part of a rollback section.
    #[must_use]
    pub fn in_rollback_section(mut self, value: bool) -> Self {
        self.in_rollback_section = value;
        self
    }

    /// Sets the setup id of the scope's rollback section.
    #[must_use]
    pub fn with_rollback_setup_id(mut self, setup_id: impl Into<String>) -> Self {
        self.rollback_setup_id = Some(setup_id.into());
        self
    }

    /// Sets the enclosing scope.
    #[must_use]
    pub fn with_parent(mut self, parent: Arc<ScopeNode>) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Returns the identifiers from the outermost scope down to this one.
    #[must_use]
    pub fn identifier_path(&self) -> String {
        let mut parts = vec![self.identifier.as_str()];
        let mut cursor = self.parent.as_deref();
        while let Some(node) = cursor {
            parts.push(node.identifier.as_str());
            cursor = node.parent.as_deref();
        }
        parts.reverse();
        parts.join(".")
    }

    /// Iterates the ancestors, innermost first.
    pub fn ancestors(&self) -> impl Iterator<Item = &ScopeNode> {
        std::iter::successors(self.parent.as_deref(), |node| node.parent.as_deref())
    }
}

/// Resolves the effective strategies for `current` with [`MAX_DEPTH`].
#[must_use]
pub fn resolve_failure_strategies(current: &ScopeNode) -> FailureStrategyMap {
    resolve_failure_strategies_with_depth(current, MAX_DEPTH)
}

/// Resolves the effective strategies for `current`, walking at most
/// `max_depth` ancestors.
#[must_use]
pub fn resolve_failure_strategies_with_depth(
    current: &ScopeNode,
    max_depth: usize,
) -> FailureStrategyMap {
    let mut layers: Vec<&[FailureStrategyConfig]> = Vec::new();
    if current.kind == FieldScope::Step || current.kind == FieldScope::StepGroup {
        layers.push(&current.failure_strategies);
    }

    let mut stage = (current.kind == FieldScope::Stage).then_some(current);
    if stage.is_none() {
        for (hops, ancestor) in current.ancestors().enumerate() {
            if hops >= max_depth {
                tracing::debug!(
                    identifier = %current.identifier,
                    max_depth,
                    "Failure strategy lookup hit the depth bound"
                );
                break;
            }
            if ancestor.in_rollback_section != current.in_rollback_section {
                continue;
            }
            match ancestor.kind {
                FieldScope::StepGroup => layers.push(&ancestor.failure_strategies),
                FieldScope::Stage => {
                    stage = Some(ancestor);
                    break;
                }
                FieldScope::Step => {}
            }
        }
    }
    if let Some(stage) = stage {
        layers.push(&stage.failure_strategies);
    }

    merge_layers(&layers)
}

/// Merges strategy layers given in priority order.
#[must_use]
pub fn merge_layers(layers: &[&[FailureStrategyConfig]]) -> FailureStrategyMap {
    let mut claimed: BTreeSet<FailureType> = BTreeSet::new();
    let mut merged = FailureStrategyMap::new();

    for layer in layers {
        let mut claimed_here: BTreeSet<FailureType> = BTreeSet::new();
        for config in *layer {
            let types: Vec<FailureType> = config
                .on_failure
                .errors
                .iter()
                .copied()
                .filter(|t| !is_claimed(&claimed, *t) && !is_claimed(&claimed_here, *t))
                .collect();
            claimed_here.extend(types.iter().copied());
            merged.insert(config.on_failure.action.clone(), types);
        }
        claimed.extend(claimed_here);
    }

    merged.retain_non_empty();
    merged
}

fn is_claimed(claimed: &BTreeSet<FailureType>, failure_type: FailureType) -> bool {
    claimed.contains(&FailureType::AllErrors) || claimed.contains(&failure_type)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::{select_action, ActionConfig};
    use pretty_assertions::assert_eq;

    fn strategy(types: &[FailureType], action: ActionConfig) -> FailureStrategyConfig {
        FailureStrategyConfig::new(types.iter().copied(), action)
    }

    fn stage(strategies: Vec<FailureStrategyConfig>) -> Arc<ScopeNode> {
        Arc::new(ScopeNode::new(FieldScope::Stage, "deploy").with_strategies(strategies))
    }

    #[test]
    fn test_step_claim_wins_over_stage() {
        let stage = stage(vec![strategy(&[FailureType::TimeoutError], ActionConfig::Abort)]);
        let step = ScopeNode::new(FieldScope::Step, "apply")
            .with_strategies(vec![strategy(&[FailureType::TimeoutError], ActionConfig::Ignore)])
            .with_parent(stage);

        let resolved = resolve_failure_strategies(&step);
        assert_eq!(resolved.len(), 1);
        assert_eq!(
            resolved.get(&ActionConfig::Ignore),
            Some(BTreeSet::from([FailureType::TimeoutError]))
        );
        assert_eq!(resolved.get(&ActionConfig::Abort), None);
    }

    #[test]
    fn test_merge_is_independent_of_stage_declaration_order() {
        let step_layer = vec![strategy(&[FailureType::TimeoutError], ActionConfig::Ignore)];
        let stage_a = vec![
            strategy(&[FailureType::TimeoutError], ActionConfig::Abort),
            strategy(&[FailureType::Unknown], ActionConfig::MarkAsFailure),
        ];
        let stage_b: Vec<_> = stage_a.iter().rev().cloned().collect();

        let a = merge_layers(&[&step_layer, &stage_a]);
        let b = merge_layers(&[&step_layer, &stage_b]);
        assert_eq!(a.get(&ActionConfig::Ignore), b.get(&ActionConfig::Ignore));
        assert_eq!(
            a.get(&ActionConfig::MarkAsFailure),
            Some(BTreeSet::from([FailureType::Unknown]))
        );
        assert_eq!(b.get(&ActionConfig::Abort), None);
    }

    #[test]
    fn test_first_declared_wins_within_scope() {
        let layer = vec![
            strategy(&[FailureType::ConnectivityError], ActionConfig::Ignore),
            strategy(&[FailureType::ConnectivityError, FailureType::Unknown], ActionConfig::Abort),
        ];
        let merged = merge_layers(&[&layer]);
        assert_eq!(
            merged.get(&ActionConfig::Ignore),
            Some(BTreeSet::from([FailureType::ConnectivityError]))
        );
        assert_eq!(
            merged.get(&ActionConfig::Abort),
            Some(BTreeSet::from([FailureType::Unknown]))
        );
    }

    #[test]
    fn test_all_errors_blocks_outer_scopes() {
        let stage = stage(vec![strategy(&[FailureType::Unknown], ActionConfig::Abort)]);
        let step = ScopeNode::new(FieldScope::Step, "apply")
            .with_strategies(vec![strategy(&[FailureType::AllErrors], ActionConfig::Ignore)])
            .with_parent(stage);

        let resolved = resolve_failure_strategies(&step);
        assert_eq!(resolved.len(), 1);
        assert!(resolved.get(&ActionConfig::Ignore).is_some());
    }

    #[test]
    fn test_step_groups_merge_innermost_first() {
        let stage = stage(vec![strategy(&[FailureType::AllErrors], ActionConfig::Abort)]);
        let outer = Arc::new(
            ScopeNode::new(FieldScope::StepGroup, "outer")
                .with_strategies(vec![
                    strategy(&[FailureType::TimeoutError], ActionConfig::MarkAsSuccess),
                    strategy(&[FailureType::Unknown], ActionConfig::MarkAsSuccess),
                ])
                .with_parent(stage),
        );
        let inner = Arc::new(
            ScopeNode::new(FieldScope::StepGroup, "inner")
                .with_strategies(vec![strategy(&[FailureType::TimeoutError], ActionConfig::Ignore)])
                .with_parent(outer),
        );
        let step = ScopeNode::new(FieldScope::Step, "apply").with_parent(inner);

        let resolved = resolve_failure_strategies(&step);
        let actions: Vec<&str> = resolved.iter().map(|(a, _)| a.name()).collect();
        assert_eq!(actions, vec!["IGNORE", "MARK_AS_SUCCESS", "ABORT"]);
        assert_eq!(
            resolved.get(&ActionConfig::MarkAsSuccess),
            Some(BTreeSet::from([FailureType::Unknown]))
        );
        assert_eq!(step.identifier_path(), "deploy.outer.inner.apply");
    }

    #[test]
    fn test_outer_scope_keeps_its_own_declaration_order() {
        let stage = stage(vec![
            strategy(&[FailureType::TimeoutError], ActionConfig::MarkAsFailure),
            strategy(&[FailureType::AllErrors], ActionConfig::Ignore),
        ]);
        let step = ScopeNode::new(FieldScope::Step, "apply")
            .with_strategies(vec![strategy(&[FailureType::ConnectivityError], ActionConfig::Ignore)])
            .with_parent(stage);

        let resolved = resolve_failure_strategies(&step);
        let actions: Vec<&str> = resolved.iter().map(|(a, _)| a.name()).collect();
        assert_eq!(actions, vec!["IGNORE", "MARK_AS_FAILURE", "IGNORE"]);

        let timeout = BTreeSet::from([FailureType::TimeoutError]);
        let connectivity = BTreeSet::from([FailureType::ConnectivityError]);
        let unknown = BTreeSet::from([FailureType::Unknown]);
        assert_eq!(select_action(&resolved, &timeout), Some(&ActionConfig::MarkAsFailure));
        assert_eq!(select_action(&resolved, &connectivity), Some(&ActionConfig::Ignore));
        assert_eq!(select_action(&resolved, &unknown), Some(&ActionConfig::Ignore));
    }

    #[test]
    fn test_rollback_section_membership_is_respected() {
        let stage = stage(vec![strategy(&[FailureType::Unknown], ActionConfig::Abort)]);
        let group = Arc::new(
            ScopeNode::new(FieldScope::StepGroup, "main")
                .with_strategies(vec![strategy(&[FailureType::Unknown], ActionConfig::Ignore)])
                .with_parent(stage),
        );
        let rollback_step = ScopeNode::new(FieldScope::Step, "undo")
            .in_rollback_section(true)
            .with_parent(group);

        let resolved = resolve_failure_strategies(&rollback_step);
        assert!(resolved.is_empty());
    }

    #[test]
    fn test_depth_bound_returns_collected_strategies() {
        let mut parent = stage(vec![strategy(&[FailureType::Unknown], ActionConfig::Abort)]);
        for i in 0..7 {
            let failure_type = if i == 6 {
                FailureType::TimeoutError
            } else {
                FailureType::ConnectivityError
            };
            parent = Arc::new(
                ScopeNode::new(FieldScope::StepGroup, format!("group{i}"))
                    .with_strategies(vec![strategy(&[failure_type], ActionConfig::Ignore)])
                    .with_parent(parent),
            );
        }
        let step = ScopeNode::new(FieldScope::Step, "deep").with_parent(parent);

        let resolved = resolve_failure_strategies(&step);
        assert_eq!(
            resolved.get(&ActionConfig::Ignore),
            Some(BTreeSet::from([FailureType::ConnectivityError, FailureType::TimeoutError]))
        );
        assert_eq!(resolved.get(&ActionConfig::Abort), None);
    }

    #[test]
    fn test_empty_actions_are_dropped() {
        let layer = vec![
            strategy(&[FailureType::AllErrors], ActionConfig::Ignore),
            strategy(&[FailureType::Unknown], ActionConfig::Abort),
        ];
        let merged = merge_layers(&[&layer]);
        assert_eq!(merged.len(), 1);
    }
}
