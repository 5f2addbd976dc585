//! Driving the six step protocols: start, suspend, resume and conclude.

use super::{EngineInner, PlanExecutionResult, PlanExecutionState, Trigger};
use crate::capabilities::CallContext;
use crate::core::{
    child_outcomes, ChildOutcome, ChildOutcomes, FailureData, FailureType, ResponseData,
    ResponseMap, Status, StepCategory, StepResponse,
};
use crate::correlation::{dispatch_with_retry, Delivery, ResponseKind, ResponseSupplier};
use crate::errors::NodeflowError;
use crate::execution::{ChainState, NodeExecution};
use crate::plan::PlanNode;
use crate::steps::{
    ChildChainExecutable, ChildChainResponse, RegisteredStep, StepInputPackage, StepKind,
    StepParameters, TaskChainExecutable, TaskChainResponse, TaskRequest,
};
use crate::utils::{generate_wait_id, now_millis};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn, Instrument};

/// Everything a step callback needs, resolved once per event.
pub(super) struct StepCall {
    pub(super) node: NodeExecution,
    pub(super) registered: RegisteredStep,
    pub(super) params: StepParameters,
    pub(super) input: StepInputPackage,
    pub(super) state: Arc<PlanExecutionState>,
}

impl StepCall {
    pub(super) fn context(&self, callback: &'static str) -> CallContext<'_> {
        CallContext {
            ambiance: &self.node.ambiance,
            params: &self.params,
            step_type: &self.node.step_type,
            callback,
        }
    }
}

fn engine_failure(message: impl Into<String>) -> FailureData {
    FailureData::with_types(message, [FailureType::Unknown])
}

impl EngineInner {
    pub(super) fn step_call(
        &self,
        node: &NodeExecution,
        state: &Arc<PlanExecutionState>,
    ) -> Result<StepCall, FailureData> {
        let plan_node = state
            .plan
            .node(&node.setup_id)
            .ok_or_else(|| engine_failure(format!("Plan node '{}' not found", node.setup_id)))?;
        let registered = self.steps.get(&node.step_type).ok_or_else(|| {
            engine_failure(NodeflowError::StepNotRegistered(node.step_type.to_string()).to_string())
        })?;
        Ok(StepCall {
            node: node.clone(),
            registered,
            params: plan_node.to_parameters(),
            input: plan_node.to_inputs(),
            state: Arc::clone(state),
        })
    }

    pub(super) async fn handle_start(self: &Arc<Self>, runtime_id: &str) {
        let Some(node) = self.store.get(runtime_id) else {
            warn!(runtime_id, "Start for unknown node");
            return;
        };
        if node.status != Status::Queued {
            debug!(runtime_id, status = %node.status, "Node already started");
            return;
        }
        let Ok(state) = self.plan_state(&node.plan_execution_id) else {
            warn!(runtime_id, "Start for node of unknown plan execution");
            return;
        };
        if state.is_aborting() {
            self.conclude(runtime_id, Status::Aborted, Vec::new(), HashMap::new())
                .await;
            return;
        }
        let plan_node: Option<PlanNode> = state.plan.node(&node.setup_id).cloned();
        if plan_node.as_ref().is_some_and(|p| p.skip) {
            self.conclude(runtime_id, Status::Skipped, Vec::new(), HashMap::new())
                .await;
            return;
        }

        let Some(node) = self.transition(runtime_id, Status::Running, &[Status::Queued], &mut |_| {})
        else {
            return;
        };
        let timeout_ms = plan_node
            .as_ref()
            .and_then(|p| p.timeout_ms)
            .unwrap_or(self.config.default_node_timeout_ms);
        self.schedule_timer(
            runtime_id,
            Duration::from_millis(timeout_ms),
            Trigger::Abort {
                target: Status::Expired,
            },
        );

        let call = match self.step_call(&node, &state) {
            Ok(call) => call,
            Err(failure) => {
                self.apply_failure_policy(&node, &state, StepResponse::failed(failure))
                    .await;
                return;
            }
        };
        debug!(runtime_id, kind = call.registered.kind.name(), "Starting step");

        let chain = &call.registered.capabilities;
        let ambiance = &call.node.ambiance;
        match call.registered.kind.clone() {
            StepKind::Sync(step) => {
                let result = chain
                    .invoke(
                        &call.context("execute_sync"),
                        step.execute_sync(
                            ambiance,
                            &call.params,
                            &call.input,
                            call.node.pass_through.as_ref(),
                        ),
                    )
                    .await;
                self.finish(&call, "execute_sync", result).await;
            }
            StepKind::Async(step) => {
                let result = chain
                    .invoke(
                        &call.context("execute_async"),
                        step.execute_async(ambiance, &call.params, &call.input),
                    )
                    .await;
                match result {
                    Ok(response) => {
                        if let Some(timeout_ms) = response.timeout_ms {
                            self.schedule_timer(
                                runtime_id,
                                Duration::from_millis(timeout_ms),
                                Trigger::Abort {
                                    target: Status::Expired,
                                },
                            );
                        }
                        self.suspend(runtime_id, ResponseKind::Async, response.wait_ids, &mut |_| {});
                    }
                    Err(failure) => self.finish(&call, "execute_async", Err(failure)).await,
                }
            }
            StepKind::Task(step) => {
                let result = chain
                    .invoke(
                        &call.context("obtain_task"),
                        step.obtain_task(ambiance, &call.params, &call.input),
                    )
                    .await;
                match result {
                    Ok(request) => self.dispatch_task(&call, request, &mut |_| {}),
                    Err(failure) => self.finish(&call, "obtain_task", Err(failure)).await,
                }
            }
            StepKind::TaskChain(step) => {
                let result = chain
                    .invoke(
                        &call.context("start_chain_link"),
                        step.start_chain_link(ambiance, &call.params, &call.input),
                    )
                    .await;
                match result {
                    Ok(link) => self.apply_chain_link(&call, &step, link).await,
                    Err(failure) => self.finish(&call, "start_chain_link", Err(failure)).await,
                }
            }
            StepKind::Child(step) => {
                let result = chain
                    .invoke(
                        &call.context("obtain_child"),
                        step.obtain_child(ambiance, &call.params, &call.input),
                    )
                    .await;
                match result {
                    Ok(response) => self.spawn_children(&call, response.children, &mut |_| {}).await,
                    Err(failure) => self.finish(&call, "obtain_child", Err(failure)).await,
                }
            }
            StepKind::ChildChain(step) => {
                let result = chain
                    .invoke(
                        &call.context("execute_first_child"),
                        step.execute_first_child(ambiance, &call.params, &call.input),
                    )
                    .await;
                match result {
                    Ok(response) => {
                        self.apply_child_chain(&call, &step, response, ChildOutcomes::new())
                            .await;
                    }
                    Err(failure) => self.finish(&call, "execute_first_child", Err(failure)).await,
                }
            }
        }
    }

    pub(super) async fn handle_resume(
        self: &Arc<Self>,
        runtime_id: &str,
        kind: ResponseKind,
        responses: ResponseMap,
    ) {
        let Some(node) = self.store.get(runtime_id) else {
            warn!(runtime_id, "Resume for unknown node");
            return;
        };
        if node.status != Status::Running {
            debug!(runtime_id, status = %node.status, "Ignoring resume of node that is not running");
            return;
        }
        let Ok(state) = self.plan_state(&node.plan_execution_id) else {
            return;
        };
        if state.is_aborting() {
            self.handle_abort(runtime_id, Status::Aborted).await;
            return;
        }
        let call = match self.step_call(&node, &state) {
            Ok(call) => call,
            Err(failure) => {
                self.apply_failure_policy(&node, &state, StepResponse::failed(failure))
                    .await;
                return;
            }
        };
        if call.registered.kind.response_kind() != Some(kind) {
            let failure = engine_failure(format!(
                "{kind:?} response delivered to {} step",
                call.registered.kind.name()
            ));
            self.finish(&call, "resume", Err(failure)).await;
            return;
        }
        debug!(runtime_id, responses = responses.len(), "Resuming step");

        let chain = &call.registered.capabilities;
        let ambiance = &call.node.ambiance;
        let finalizing = call.node.chain_state.is_some_and(ChainState::is_finalizing);
        match call.registered.kind.clone() {
            StepKind::Sync(_) => {
                warn!(runtime_id, "Sync step cannot be resumed");
            }
            StepKind::Async(step) => {
                let result = chain
                    .invoke(
                        &call.context("handle_async_response"),
                        step.handle_async_response(ambiance, &call.params, &responses),
                    )
                    .await;
                self.finish(&call, "handle_async_response", result).await;
            }
            StepKind::Task(step) => {
                let result = chain
                    .invoke(
                        &call.context("handle_task_result"),
                        step.handle_task_result(
                            ambiance,
                            &call.params,
                            ResponseSupplier::new(responses),
                        ),
                    )
                    .await;
                self.finish(&call, "handle_task_result", result).await;
            }
            StepKind::TaskChain(step) if finalizing => {
                let result = chain
                    .invoke(
                        &call.context("finalize_execution"),
                        step.finalize_execution(
                            ambiance,
                            &call.params,
                            call.node.pass_through.clone(),
                            ResponseSupplier::new(responses),
                        ),
                    )
                    .await;
                self.finish(&call, "finalize_execution", result).await;
            }
            StepKind::TaskChain(step) => {
                let result = chain
                    .invoke(
                        &call.context("execute_next_link"),
                        step.execute_next_link(
                            ambiance,
                            &call.params,
                            &call.input,
                            call.node.pass_through.clone(),
                            ResponseSupplier::new(responses),
                        ),
                    )
                    .await;
                match result {
                    Ok(link) => self.apply_chain_link(&call, &step, link).await,
                    Err(failure) => self.finish(&call, "execute_next_link", Err(failure)).await,
                }
            }
            StepKind::Child(step) => {
                let outcomes = child_outcomes(&responses);
                let result = chain
                    .invoke(
                        &call.context("handle_child_response"),
                        step.handle_child_response(ambiance, &call.params, &outcomes),
                    )
                    .await;
                self.finish(&call, "handle_child_response", result).await;
            }
            StepKind::ChildChain(step) if finalizing => {
                let outcomes = child_outcomes(&responses);
                let result = chain
                    .invoke(
                        &call.context("finalize_execution"),
                        step.finalize_execution(
                            ambiance,
                            &call.params,
                            call.node.pass_through.clone(),
                            &outcomes,
                        ),
                    )
                    .await;
                self.finish(&call, "finalize_execution", result).await;
            }
            StepKind::ChildChain(step) => {
                let outcomes = child_outcomes(&responses);
                let result = chain
                    .invoke(
                        &call.context("execute_next_child"),
                        step.execute_next_child(
                            ambiance,
                            &call.params,
                            &call.input,
                            call.node.pass_through.clone(),
                            &outcomes,
                        ),
                    )
                    .await;
                match result {
                    Ok(response) => self.apply_child_chain(&call, &step, response, outcomes).await,
                    Err(failure) => self.finish(&call, "execute_next_child", Err(failure)).await,
                }
            }
        }
    }

    /// Applies one task-chain link: dispatch its task or finalize.
    async fn apply_chain_link(
        self: &Arc<Self>,
        call: &StepCall,
        step: &Arc<dyn TaskChainExecutable>,
        link: TaskChainResponse,
    ) {
        let (chain_end, pass_through, request) = link.into_parts();
        let next_state = call
            .node
            .chain_state
            .unwrap_or(ChainState::Started)
            .advance(chain_end);
        debug!(
            runtime_id = %call.node.runtime_id,
            chain_end,
            state = ?next_state,
            "Task chain link"
        );

        if let Some(request) = request {
            self.dispatch_task(call, request, &mut |node| {
                node.pass_through.clone_from(&pass_through);
                node.chain_state = Some(next_state);
            });
            return;
        }

        if let Err(e) = self.store.update(&call.node.runtime_id, &mut |node| {
            node.pass_through.clone_from(&pass_through);
            node.chain_state = Some(ChainState::Finalizing);
        }) {
            warn!(runtime_id = %call.node.runtime_id, error = %e, "Failed to persist chain state");
        }
        let result = call
            .registered
            .capabilities
            .invoke(
                &call.context("finalize_execution"),
                step.finalize_execution(
                    &call.node.ambiance,
                    &call.params,
                    pass_through.clone(),
                    ResponseSupplier::empty(),
                ),
            )
            .await;
        self.finish(call, "finalize_execution", result).await;
    }

    /// Applies one child-chain link: spawn the next child or finalize.
    async fn apply_child_chain(
        self: &Arc<Self>,
        call: &StepCall,
        step: &Arc<dyn ChildChainExecutable>,
        response: ChildChainResponse,
        outcomes: ChildOutcomes,
    ) {
        let (next_child, last_link, pass_through) = response.into_parts();
        if let Some(child) = next_child {
            let next_state = call
                .node
                .chain_state
                .unwrap_or(ChainState::Started)
                .advance(last_link);
            self.spawn_children(call, vec![child], &mut |node| {
                node.pass_through.clone_from(&pass_through);
                node.chain_state = Some(next_state);
            })
            .await;
            return;
        }

        if let Err(e) = self.store.update(&call.node.runtime_id, &mut |node| {
            node.pass_through.clone_from(&pass_through);
            node.chain_state = Some(ChainState::Finalizing);
        }) {
            warn!(runtime_id = %call.node.runtime_id, error = %e, "Failed to persist chain state");
        }
        let result = call
            .registered
            .capabilities
            .invoke(
                &call.context("finalize_execution"),
                step.finalize_execution(
                    &call.node.ambiance,
                    &call.params,
                    pass_through.clone(),
                    &outcomes,
                ),
            )
            .await;
        self.finish(call, "finalize_execution", result).await;
    }

    /// Persists the node's barrier and registers it with the wait registry.
    pub(super) fn suspend(
        &self,
        runtime_id: &str,
        kind: ResponseKind,
        wait_ids: Vec<String>,
        ops: &mut (dyn FnMut(&mut NodeExecution) + Send),
    ) {
        if let Err(e) = self.store.update(runtime_id, &mut |node| {
            ops(node);
            node.wait_ids.clone_from(&wait_ids);
        }) {
            warn!(runtime_id, error = %e, "Failed to persist suspension");
        }
        if let Delivery::Ready {
            node_runtime_id,
            kind,
            responses,
        } = self.waits.register(runtime_id, kind, wait_ids)
        {
            self.enqueue(&node_runtime_id, Trigger::Resume { kind, responses });
        }
    }

    /// Suspends the node on a fresh wait-id and hands the task to the
    /// executor in the background.
    fn dispatch_task(
        self: &Arc<Self>,
        call: &StepCall,
        request: TaskRequest,
        ops: &mut (dyn FnMut(&mut NodeExecution) + Send),
    ) {
        let runtime_id = call.node.runtime_id.clone();
        let wait_id = generate_wait_id();
        self.suspend(&runtime_id, ResponseKind::Task, vec![wait_id.clone()], ops);

        let inner = Arc::clone(self);
        let ambiance = call.node.ambiance.clone();
        let span = tracing::debug_span!("dispatch", runtime_id = %runtime_id, wait_id = %wait_id);
        tokio::spawn(
            async move {
                let executor = Arc::clone(&inner.executor);
                let result = dispatch_with_retry(&inner.config.dispatch_retry, &wait_id, || {
                    let executor = Arc::clone(&executor);
                    let wait_id = wait_id.clone();
                    let ambiance = ambiance.clone();
                    let request = request.clone();
                    async move { executor.queue_task(&wait_id, &ambiance, &request).await }
                })
                .await;
                match result {
                    Ok(task_id) => inner.record_task(&runtime_id, task_id),
                    Err(error) => {
                        warn!(error = %error, "Task could not be dispatched");
                        inner.deliver(
                            &wait_id,
                            ResponseData::error(
                                error.to_string(),
                                [FailureType::DelegateProvisioning],
                            ),
                        );
                    }
                }
            }
            .instrument(span),
        );
    }

    fn record_task(&self, runtime_id: &str, task_id: String) {
        debug!(runtime_id, task_id = %task_id, "Task queued");
        let recorded = self.store.update(runtime_id, &mut |node| {
            node.task_ids.push(task_id.clone());
        });
        match recorded {
            Ok(node) if node.is_final() => self.cancel_tasks(&[task_id]),
            Ok(_) => {}
            Err(e) => warn!(runtime_id, error = %e, "Failed to record task id"),
        }
    }

    /// Creates child nodes, suspends the parent on them and starts them.
    async fn spawn_children(
        self: &Arc<Self>,
        call: &StepCall,
        setup_ids: Vec<String>,
        ops: &mut (dyn FnMut(&mut NodeExecution) + Send),
    ) {
        let mut children = Vec::with_capacity(setup_ids.len());
        for setup_id in &setup_ids {
            let Some(plan_node) = call.state.plan.node(setup_id) else {
                let failure = engine_failure(format!("Child node '{setup_id}' not found in plan"));
                self.finish(call, "obtain_child", Err(failure)).await;
                return;
            };
            match Self::new_node(&call.node.ambiance, plan_node, 0) {
                Ok(child) => {
                    let notify_id = child.runtime_id.clone();
                    children.push(child.with_notify_id(notify_id));
                }
                Err(e) => {
                    self.finish(call, "obtain_child", Err(engine_failure(e.to_string())))
                        .await;
                    return;
                }
            }
        }

        let child_ids: Vec<String> = children.iter().map(|c| c.runtime_id.clone()).collect();
        for child in children {
            if let Err(e) = self.store.save(child) {
                warn!(error = %e, "Failed to save child node");
            }
        }
        self.suspend(&call.node.runtime_id, ResponseKind::Child, child_ids.clone(), ops);
        info!(
            runtime_id = %call.node.runtime_id,
            children = child_ids.len(),
            "Spawned child nodes"
        );
        for child_id in &child_ids {
            self.enqueue(child_id, Trigger::Start);
        }
    }

    /// Runs the `after` hooks over a terminal step result and routes it.
    pub(super) async fn finish(
        self: &Arc<Self>,
        call: &StepCall,
        callback: &'static str,
        result: Result<StepResponse, FailureData>,
    ) {
        let response = match result {
            Ok(response) => response,
            Err(failure) => StepResponse::failed(failure),
        };
        let response = call
            .registered
            .capabilities
            .complete(&call.context(callback), response)
            .await;

        match response.status {
            Status::Failed => {
                self.apply_failure_policy(&call.node, &call.state, response)
                    .await;
            }
            status if status.is_final() => {
                self.conclude(
                    &call.node.runtime_id,
                    status,
                    response.failures,
                    response.outcomes,
                )
                .await;
            }
            status => {
                let failure =
                    engine_failure(format!("Step returned non-terminal status {status}"));
                self.apply_failure_policy(&call.node, &call.state, StepResponse::failed(failure))
                    .await;
            }
        }
    }

    /// Moves a node to a terminal status and reports it upward.
    pub(super) async fn conclude(
        self: &Arc<Self>,
        runtime_id: &str,
        status: Status,
        failures: Vec<FailureData>,
        outcomes: HashMap<String, serde_json::Value>,
    ) {
        let Some(node) = self.close_node(runtime_id, status, &failures, &outcomes) else {
            return;
        };
        self.on_terminal(node).await;
    }

    /// Moves a node to a terminal status without reporting it upward.
    pub(super) fn close_node(
        &self,
        runtime_id: &str,
        status: Status,
        failures: &[FailureData],
        outcomes: &HashMap<String, serde_json::Value>,
    ) -> Option<NodeExecution> {
        let node = self.transition(runtime_id, status, &[], &mut |node| {
            node.failure_info.extend(failures.iter().cloned());
            node.outcomes
                .extend(outcomes.iter().map(|(k, v)| (k.clone(), v.clone())));
            node.wait_ids.clear();
            if node.chain_state.is_some() {
                node.chain_state = Some(ChainState::Done);
            }
        });
        if node.is_none() {
            debug!(runtime_id, status = %status, "Node already terminal");
            return None;
        }
        self.cancel_timer(runtime_id);
        self.waits.release_node(runtime_id);
        self.node_locks.remove(runtime_id);
        node
    }

    /// Continues the sibling chain, notifies the parent, or completes the
    /// plan when a root-level node ends.
    pub(super) async fn on_terminal(self: &Arc<Self>, node: NodeExecution) {
        let Ok(state) = self.plan_state(&node.plan_execution_id) else {
            return;
        };

        if node.status.is_positive() && !state.is_aborting() {
            let next = state
                .plan
                .node(&node.setup_id)
                .and_then(|p| p.next_id.as_deref())
                .and_then(|id| state.plan.node(id));
            if let Some(next) = next {
                if self.start_sibling(&node, next) {
                    return;
                }
            }
        }

        if let Some(notify_id) = &node.notify_id {
            let outcome = self.outcome_of(&node);
            self.deliver(notify_id, ResponseData::Child(outcome));
        }
        if node.parent_id.is_none() {
            self.complete_plan(&state, &node).await;
        }
    }

    fn start_sibling(&self, node: &NodeExecution, next: &PlanNode) -> bool {
        let sibling = match Self::new_node(&node.ambiance.clone_for_finish(), next, 0) {
            Ok(sibling) => sibling.with_rollback_of(node.rollback_of.clone()),
            Err(e) => {
                warn!(runtime_id = %node.runtime_id, error = %e, "Failed to create next node");
                return false;
            }
        };
        let sibling = match &node.notify_id {
            Some(notify_id) => sibling.with_notify_id(notify_id),
            None => sibling,
        };
        let sibling_id = sibling.runtime_id.clone();
        if let Err(e) = self.store.save(sibling) {
            warn!(runtime_id = %node.runtime_id, error = %e, "Failed to save next node");
            return false;
        }
        debug!(runtime_id = %node.runtime_id, next = %sibling_id, "Starting next node");
        self.enqueue(&sibling_id, Trigger::Start);
        true
    }

    /// Builds the outcome a parent sees. A rollback branch reports the node
    /// it rolled back, which stays failed.
    fn outcome_of(&self, node: &NodeExecution) -> ChildOutcome {
        let rolled_back = node
            .rollback_of
            .as_deref()
            .and_then(|id| self.store.get(id));
        match rolled_back {
            Some(failed) => {
                let mut failures = failed.failure_info;
                if node.status.is_broke() {
                    failures.extend(node.failure_info.iter().cloned());
                }
                ChildOutcome {
                    runtime_id: failed.runtime_id,
                    setup_id: failed.setup_id,
                    identifier: failed.identifier,
                    status: Status::Failed,
                    failures,
                }
            }
            None => ChildOutcome {
                runtime_id: node.runtime_id.clone(),
                setup_id: node.setup_id.clone(),
                identifier: node.identifier.clone(),
                status: node.status,
                failures: node.failure_info.clone(),
            },
        }
    }

    async fn complete_plan(self: &Arc<Self>, state: &PlanExecutionState, root: &NodeExecution) {
        let status = if root.rollback_of.is_some() {
            Status::Failed
        } else {
            root.status
        };
        let failures: Vec<FailureData> = self
            .store
            .fetch_by_plan_execution(&root.plan_execution_id)
            .into_iter()
            .filter(|n| n.status.is_broke() && !n.old_retry)
            .flat_map(|n| n.failure_info)
            .collect();
        let result = PlanExecutionResult {
            plan_execution_id: root.plan_execution_id.clone(),
            status,
            failures,
            end_ts: now_millis(),
        };
        info!(
            plan_execution_id = %result.plan_execution_id,
            status = %result.status,
            failures = result.failures.len(),
            "Plan execution completed"
        );

        state.result_tx.send_replace(Some(result.clone()));
        self.sink
            .emit(
                "plan.completed",
                Some(serde_json::json!({
                    "plan_execution_id": result.plan_execution_id,
                    "status": result.status,
                    "failures": result.failures.len(),
                })),
            )
            .await;
        self.observers.notify_end(result);
    }

    /// Returns true for nodes whose own failure strategies apply. Container
    /// nodes take the status their step derives from the children.
    pub(super) fn applies_failure_strategies(node: &NodeExecution) -> bool {
        node.step_type.category == StepCategory::Step
    }

    /// Collects the failure types of a response; untyped failures count as
    /// `UNKNOWN`.
    pub(super) fn failure_types_of(response: &StepResponse) -> BTreeSet<FailureType> {
        let mut types: BTreeSet<FailureType> = response
            .failures
            .iter()
            .flat_map(|f| f.failure_types.iter().copied())
            .collect();
        if types.is_empty() {
            types.insert(FailureType::Unknown);
        }
        types
    }
}
