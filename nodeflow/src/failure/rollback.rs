//! Rollback target resolution.

use super::resolver::{FieldScope, ScopeNode};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Which rollback section a rollback action runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RollbackStrategy {
    /// The enclosing stage's rollback section.
    StageRollback,
    /// The innermost enclosing step group's rollback section.
    StepGroupRollback,
}

/// Rollback strategy to the setup id of the node that runs it.
pub type RollbackStrategyMap = BTreeMap<RollbackStrategy, String>;

/// Per-plan cache of derived values computed while building a plan.
#[derive(Debug, Default)]
pub struct PlanCreationContext {
    rollback_maps: RwLock<HashMap<String, Arc<RollbackStrategyMap>>>,
}

impl PlanCreationContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the rollback targets for a scope, computing them once per
    /// identifier path.
    pub fn rollback_strategy_map(&self, scope: &ScopeNode) -> Arc<RollbackStrategyMap> {
        let key = scope.identifier_path();
        if let Some(cached) = self.rollback_maps.read().get(&key) {
            return Arc::clone(cached);
        }

        let computed = Arc::new(compute_rollback_strategy_map(scope));
        let mut maps = self.rollback_maps.write();
        Arc::clone(maps.entry(key).or_insert(computed))
    }

    /// Returns the number of cached scopes.
    #[must_use]
    pub fn cached_scopes(&self) -> usize {
        self.rollback_maps.read().len()
    }
}

fn compute_rollback_strategy_map(scope: &ScopeNode) -> RollbackStrategyMap {
    let mut map = RollbackStrategyMap::new();
    for node in std::iter::once(scope).chain(scope.ancestors()) {
        let Some(setup_id) = node.rollback_setup_id.as_ref() else {
            continue;
        };
        let strategy = match node.kind {
            FieldScope::StepGroup => RollbackStrategy::StepGroupRollback,
            FieldScope::Stage => RollbackStrategy::StageRollback,
            FieldScope::Step => continue,
        };
        map.entry(strategy).or_insert_with(|| setup_id.clone());
    }
    map
}
