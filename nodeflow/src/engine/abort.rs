//! Abort, expiry and node timers.

use super::{EngineInner, Trigger};
use crate::capabilities::CallContext;
use crate::core::{FailureData, Status};
use crate::execution::NodeExecution;
use crate::observers::NodeStatusUpdate;
use crate::plan::PlanNode;
use crate::steps::StepParameters;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

impl EngineInner {
    /// Ends a node as `target`, releasing its waits, cancelling its tasks
    /// and aborting its unfinished children.
    pub(super) async fn handle_abort(self: &Arc<Self>, runtime_id: &str, target: Status) {
        let Some(node) = self.store.get(runtime_id) else {
            return;
        };
        if node.is_final() {
            debug!(runtime_id, status = %node.status, "Node already terminal, abort ignored");
            return;
        }
        self.report_discontinued(&node);

        if node.start_ts.is_some() {
            self.run_abort_hook(&node).await;
        }
        let released = self.waits.release_node(runtime_id);
        self.cancel_timer(runtime_id);

        let children: Vec<String> = self
            .store
            .fetch_children(runtime_id)
            .into_iter()
            .filter(|child| !child.is_final())
            .map(|child| child.runtime_id)
            .collect();
        for child_id in &children {
            self.enqueue(
                child_id,
                Trigger::Abort {
                    target: Status::Aborted,
                },
            );
        }
        info!(
            runtime_id,
            target = %target,
            released = released.len(),
            children = children.len(),
            "Aborting node"
        );

        let failures = if target == Status::Expired {
            vec![FailureData::timeout(format!(
                "Node '{}' exceeded its deadline",
                node.identifier
            ))]
        } else {
            Vec::new()
        };
        // Task ids recorded after this point are cancelled by record_task.
        let Some(aborted) = self.close_node(runtime_id, target, &failures, &HashMap::new()) else {
            return;
        };
        self.cancel_tasks(&aborted.task_ids);
        self.on_terminal(aborted).await;
    }

    /// Announces the `DISCONTINUING` mark a plan abort left on `node`. Runs
    /// under the node lock so observers see it before the terminal status.
    fn report_discontinued(&self, node: &NodeExecution) {
        let Ok(state) = self.plan_state(&node.plan_execution_id) else {
            return;
        };
        let Some((_, previous_status)) = state.discontinued_from.remove(&node.runtime_id) else {
            return;
        };
        if node.status == Status::Discontinuing {
            self.observers.notify_status(NodeStatusUpdate {
                node: node.clone(),
                previous_status,
            });
        }
    }

    async fn run_abort_hook(&self, node: &NodeExecution) {
        let Some(registered) = self.steps.get(&node.step_type) else {
            return;
        };
        let Some(hook) = registered.abort.clone() else {
            return;
        };
        let params = self
            .plans
            .get(&node.plan_execution_id)
            .and_then(|state| state.plan.node(&node.setup_id).map(PlanNode::to_parameters))
            .unwrap_or_else(|| StepParameters::new(&node.identifier, serde_json::Value::Null));
        let call = CallContext {
            ambiance: &node.ambiance,
            params: &params,
            step_type: &node.step_type,
            callback: "handle_abort",
        };
        let result = registered
            .capabilities
            .invoke(
                &call,
                hook.handle_abort(&node.ambiance, &params, node.pass_through.as_ref()),
            )
            .await;
        if let Err(failure) = result {
            warn!(
                runtime_id = %node.runtime_id,
                error = %failure.message,
                "Abort hook failed"
            );
        }
    }

    /// Cancels executor tasks in the background. Failures are logged.
    pub(super) fn cancel_tasks(&self, task_ids: &[String]) {
        for task_id in task_ids {
            let executor = Arc::clone(&self.executor);
            let task_id = task_id.clone();
            tokio::spawn(async move {
                if let Err(e) = executor.cancel_task(&task_id).await {
                    warn!(task_id = %task_id, error = %e, "Failed to cancel task");
                }
            });
        }
    }

    /// Enqueues `trigger` for the node after `delay`. A node holds at most
    /// one timer; scheduling replaces the previous one.
    pub(super) fn schedule_timer(self: &Arc<Self>, runtime_id: &str, delay: Duration, trigger: Trigger) {
        let engine = Arc::downgrade(self);
        let id = runtime_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(engine) = engine.upgrade() {
                engine.enqueue(&id, trigger);
            }
        })
        .abort_handle();
        if let Some(previous) = self.deadlines.insert(runtime_id.to_string(), handle) {
            previous.abort();
        }
    }

    /// Cancels the node's pending timer, if any.
    pub(super) fn cancel_timer(&self, runtime_id: &str) {
        if let Some((_, handle)) = self.deadlines.remove(runtime_id) {
            handle.abort();
        }
    }
}
