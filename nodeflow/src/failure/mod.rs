//! Failure strategies: configuration, multi-level resolution and rollback
//! targets.

mod resolver;
mod rollback;
mod strategy;

pub use resolver::{
    merge_layers, resolve_failure_strategies, resolve_failure_strategies_with_depth, FieldScope,
    ScopeNode, MAX_DEPTH,
};
pub use rollback::{PlanCreationContext, RollbackStrategy, RollbackStrategyMap};
pub use strategy::{
    select_action, ActionConfig, FailureStrategyConfig, FailureStrategyMap, OnFailureConfig,
};
