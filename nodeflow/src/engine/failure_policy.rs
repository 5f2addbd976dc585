//! Applying resolved failure strategies to failed nodes.

use super::{EngineInner, PlanExecutionState, Trigger};
use crate::core::{FailureData, Status, StepResponse};
use crate::execution::NodeExecution;
use crate::failure::{resolve_failure_strategies_with_depth, select_action, ActionConfig, RollbackStrategy};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What to do with a failed attempt once retries are accounted for.
#[derive(Debug, PartialEq)]
enum Decision {
    Retry { delay_ms: u64 },
    Apply(Option<ActionConfig>),
}

/// Resolves a retry action against the attempt's retry index. An exhausted
/// retry yields its nested action.
fn decide(action: Option<ActionConfig>, retry_index: u32) -> Decision {
    let Some(action) = action else {
        return Decision::Apply(None);
    };
    let delay_ms = action.retry_interval_ms(retry_index + 1);
    match action {
        ActionConfig::Retry { retry_count, .. } if retry_index < retry_count => {
            Decision::Retry { delay_ms }
        }
        ActionConfig::Retry {
            on_retry_failure, ..
        } => Decision::Apply(Some(*on_retry_failure)),
        other => Decision::Apply(Some(other)),
    }
}

impl EngineInner {
    /// Picks the action for a failed step response and applies it.
    pub(super) async fn apply_failure_policy(
        self: &Arc<Self>,
        node: &NodeExecution,
        state: &Arc<PlanExecutionState>,
        response: StepResponse,
    ) {
        let action = if state.is_aborting() || !Self::applies_failure_strategies(node) {
            None
        } else {
            let failure_types = Self::failure_types_of(&response);
            let strategies = state
                .plan
                .scope_for(&node.ambiance)
                .map(|scope| {
                    resolve_failure_strategies_with_depth(
                        &scope,
                        self.config.max_failure_strategy_depth,
                    )
                })
                .unwrap_or_default();
            select_action(&strategies, &failure_types).cloned()
        };
        debug!(
            runtime_id = %node.runtime_id,
            action = action.as_ref().map_or("NONE", ActionConfig::name),
            "Resolved failure action"
        );
        self.apply_action(node, state, action, response.failures, response.outcomes)
            .await;
    }

    /// Applies an action to a running node that failed.
    pub(super) async fn apply_action(
        self: &Arc<Self>,
        node: &NodeExecution,
        state: &Arc<PlanExecutionState>,
        action: Option<ActionConfig>,
        failures: Vec<FailureData>,
        outcomes: HashMap<String, serde_json::Value>,
    ) {
        let runtime_id = node.runtime_id.as_str();
        let action = match decide(action, node.retry_index()) {
            Decision::Retry { delay_ms } => {
                self.retry_node(node, state, &failures, delay_ms);
                return;
            }
            Decision::Apply(action) => action,
        };
        match action {
            None | Some(ActionConfig::MarkAsFailure | ActionConfig::Retry { .. }) => {
                self.conclude(runtime_id, Status::Failed, failures, outcomes)
                    .await;
            }
            Some(ActionConfig::Ignore) => {
                self.conclude(runtime_id, Status::IgnoreFailed, failures, outcomes)
                    .await;
            }
            Some(ActionConfig::MarkAsSuccess) => {
                self.conclude(runtime_id, Status::Succeeded, failures, outcomes)
                    .await;
            }
            Some(ActionConfig::Abort) => {
                self.conclude(runtime_id, Status::Aborted, failures, outcomes)
                    .await;
            }
            Some(ActionConfig::StageRollback) => {
                self.rollback(node, state, RollbackStrategy::StageRollback, failures)
                    .await;
            }
            Some(ActionConfig::StepGroupRollback) => {
                self.rollback(node, state, RollbackStrategy::StepGroupRollback, failures)
                    .await;
            }
            Some(ActionConfig::ManualIntervention {
                timeout_ms,
                on_timeout,
            }) => self.pause_for_intervention(node, timeout_ms, *on_timeout, &failures),
        }
    }

    /// Fails the current attempt and queues a fresh one after `delay_ms`.
    fn retry_node(
        self: &Arc<Self>,
        node: &NodeExecution,
        state: &Arc<PlanExecutionState>,
        failures: &[FailureData],
        delay_ms: u64,
    ) {
        let Some(failed) = self.close_node(&node.runtime_id, Status::Failed, failures, &HashMap::new())
        else {
            return;
        };
        self.store.mark_retried(&failed.runtime_id);

        let attempt = state
            .plan
            .node(&failed.setup_id)
            .ok_or_else(|| format!("Plan node '{}' not found", failed.setup_id))
            .and_then(|plan_node| {
                Self::new_node(
                    &failed.ambiance.clone_for_finish(),
                    plan_node,
                    failed.retry_index() + 1,
                )
                .map_err(|e| e.to_string())
            });
        let attempt = match attempt {
            Ok(attempt) => attempt,
            Err(error) => {
                warn!(runtime_id = %failed.runtime_id, error = %error, "Failed to create retry attempt");
                return;
            }
        };

        let mut retry_ids = failed.retry_ids.clone();
        retry_ids.push(failed.runtime_id.clone());
        let attempt = attempt
            .with_retry_ids(retry_ids)
            .with_rollback_of(failed.rollback_of.clone());
        let attempt = match &failed.notify_id {
            Some(notify_id) => attempt.with_notify_id(notify_id),
            None => attempt,
        };
        let attempt_id = attempt.runtime_id.clone();
        if let Err(e) = self.store.save(attempt) {
            warn!(runtime_id = %failed.runtime_id, error = %e, "Failed to save retry attempt");
            return;
        }
        info!(
            runtime_id = %failed.runtime_id,
            attempt = %attempt_id,
            retry_index = failed.retry_index() + 1,
            delay_ms,
            "Retrying node"
        );
        if delay_ms == 0 {
            self.enqueue(&attempt_id, Trigger::Start);
        } else {
            self.schedule_timer(&attempt_id, Duration::from_millis(delay_ms), Trigger::Start);
        }
    }

    /// Fails the node and starts the rollback section of the innermost
    /// matching scope. Without one, the node just fails.
    async fn rollback(
        self: &Arc<Self>,
        node: &NodeExecution,
        state: &Arc<PlanExecutionState>,
        strategy: RollbackStrategy,
        failures: Vec<FailureData>,
    ) {
        let target = state
            .plan
            .scope_for(&node.ambiance)
            .and_then(|scope| {
                state
                    .creation_context
                    .rollback_strategy_map(&scope)
                    .get(&strategy)
                    .cloned()
            })
            .and_then(|setup_id| state.plan.node(&setup_id));
        let Some(target) = target else {
            warn!(runtime_id = %node.runtime_id, ?strategy, "No rollback section in scope");
            self.conclude(&node.runtime_id, Status::Failed, failures, HashMap::new())
                .await;
            return;
        };

        let rollback = match Self::new_node(&node.ambiance.clone_for_finish(), target, 0) {
            Ok(rollback) => rollback.with_rollback_of(Some(node.runtime_id.clone())),
            Err(e) => {
                warn!(runtime_id = %node.runtime_id, error = %e, "Failed to create rollback node");
                self.conclude(&node.runtime_id, Status::Failed, failures, HashMap::new())
                    .await;
                return;
            }
        };
        let rollback = match &node.notify_id {
            Some(notify_id) => rollback.with_notify_id(notify_id),
            None => rollback,
        };
        if self
            .close_node(&node.runtime_id, Status::Failed, &failures, &HashMap::new())
            .is_none()
        {
            return;
        }

        let rollback_id = rollback.runtime_id.clone();
        if let Err(e) = self.store.save(rollback) {
            warn!(runtime_id = %node.runtime_id, error = %e, "Failed to save rollback node");
            return;
        }
        info!(
            runtime_id = %node.runtime_id,
            rollback = %rollback_id,
            section = %target.setup_id,
            ?strategy,
            "Starting rollback"
        );
        self.sink
            .emit(
                "rollback.started",
                Some(serde_json::json!({
                    "runtime_id": node.runtime_id,
                    "rollback_runtime_id": rollback_id,
                    "section": target.setup_id,
                    "strategy": strategy,
                })),
            )
            .await;
        self.enqueue(&rollback_id, Trigger::Start);
    }

    /// Parks the node until an intervention arrives or `timeout_ms` passes.
    fn pause_for_intervention(
        self: &Arc<Self>,
        node: &NodeExecution,
        timeout_ms: u64,
        on_timeout: ActionConfig,
        failures: &[FailureData],
    ) {
        let paused = self.transition(
            &node.runtime_id,
            Status::Paused,
            &[Status::Running],
            &mut |n| {
                n.failure_info.extend(failures.iter().cloned());
                n.intervention_timeout_action = Some(on_timeout.clone());
            },
        );
        if paused.is_none() {
            return;
        }
        warn!(
            runtime_id = %node.runtime_id,
            timeout_ms,
            on_timeout = on_timeout.name(),
            "Node paused for manual intervention"
        );
        self.schedule_timer(
            &node.runtime_id,
            Duration::from_millis(timeout_ms),
            Trigger::Intervene(on_timeout),
        );
    }

    /// Resumes a paused node with the chosen action.
    pub(super) async fn handle_intervene(self: &Arc<Self>, runtime_id: &str, action: ActionConfig) {
        let Some(node) = self.store.get(runtime_id) else {
            return;
        };
        if node.status != Status::Paused {
            debug!(runtime_id, status = %node.status, "Ignoring intervention for node that is not paused");
            return;
        }
        let Ok(state) = self.plan_state(&node.plan_execution_id) else {
            return;
        };
        self.cancel_timer(runtime_id);
        let Some(node) = self.transition(runtime_id, Status::Running, &[Status::Paused], &mut |n| {
            n.intervention_timeout_action = None;
        }) else {
            return;
        };
        info!(runtime_id, action = action.name(), "Applying intervention");
        // Failures were recorded when the node paused.
        self.apply_action(&node, &state, Some(action), Vec::new(), HashMap::new())
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_decide_retries_until_count() {
        let retry = ActionConfig::retry(2, vec![10, 20], ActionConfig::Ignore);
        assert_eq!(
            decide(Some(retry.clone()), 0),
            Decision::Retry { delay_ms: 10 }
        );
        assert_eq!(
            decide(Some(retry.clone()), 1),
            Decision::Retry { delay_ms: 20 }
        );
        assert_eq!(
            decide(Some(retry), 2),
            Decision::Apply(Some(ActionConfig::Ignore))
        );
    }

    #[test]
    fn test_decide_passes_other_actions_through() {
        assert_eq!(decide(None, 0), Decision::Apply(None));
        assert_eq!(
            decide(Some(ActionConfig::Abort), 3),
            Decision::Apply(Some(ActionConfig::Abort))
        );
    }
}
