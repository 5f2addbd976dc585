//! Mock steps, task executor and observers for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::ambiance::Ambiance;
use crate::core::status::aggregate_status;
use crate::core::{ChildOutcomes, FailureData, FailureType, ResponseMap, Status, StepResponse};
use crate::correlation::{ResponseSupplier, TaskExecutor};
use crate::engine::PlanExecutionResult;
use crate::errors::DispatchError;
use crate::observers::{NodeStatusUpdate, NodeStatusUpdateObserver, OrchestrationEndObserver};
use crate::steps::{
    Abortable, AsyncExecutable, AsyncExecutableResponse, ChildChainExecutable,
    ChildChainResponse, ChildExecutable, ChildExecutableResponse, PassThroughData,
    StepInputPackage, StepParameters, SyncExecutable, TaskChainExecutable, TaskChainResponse,
    TaskExecutable, TaskRequest,
};

fn runtime_id(ambiance: &Ambiance) -> String {
    ambiance.current_runtime_id().unwrap_or_default().to_string()
}

fn string_list(params: &StepParameters, key: &str) -> Vec<String> {
    params
        .get(key)
        .and_then(serde_json::Value::as_array)
        .map(|values| {
            values
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// A sync step that always succeeds and counts its calls.
#[derive(Debug, Default)]
pub struct SucceedingStep {
    calls: Mutex<Vec<String>>,
}

impl SucceedingStep {
    /// Creates a new succeeding step.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the identifiers of the executed nodes, in call order.
    #[must_use]
    pub fn executed(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl SyncExecutable for SucceedingStep {
    async fn execute_sync(
        &self,
        ambiance: &Ambiance,
        params: &StepParameters,
        _input: &StepInputPackage,
        _pass_through: Option<&PassThroughData>,
    ) -> anyhow::Result<StepResponse> {
        self.calls.lock().push(params.identifier.clone());
        Ok(StepResponse::succeeded().with_outcome("runtimeId", serde_json::json!(runtime_id(ambiance))))
    }
}

/// A sync step that fails.
///
/// Parameters: `failureType` (defaults to `APPLICATION_ERROR`) and
/// `failTimes`, the number of attempts per identifier that fail before the
/// step succeeds. Without `failTimes` it always fails.
#[derive(Debug, Default)]
pub struct FailingStep {
    attempts: Mutex<HashMap<String, u32>>,
}

impl FailingStep {
    /// Creates a new failing step.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns how often the step ran for an identifier.
    #[must_use]
    pub fn attempts(&self, identifier: &str) -> u32 {
        self.attempts.lock().get(identifier).copied().unwrap_or(0)
    }
}

#[async_trait]
impl SyncExecutable for FailingStep {
    async fn execute_sync(
        &self,
        _ambiance: &Ambiance,
        params: &StepParameters,
        _input: &StepInputPackage,
        _pass_through: Option<&PassThroughData>,
    ) -> anyhow::Result<StepResponse> {
        let attempt = {
            let mut attempts = self.attempts.lock();
            let count = attempts.entry(params.identifier.clone()).or_insert(0);
            *count += 1;
            *count
        };
        let fail_times = params
            .get("failTimes")
            .and_then(serde_json::Value::as_u64)
            .map_or(u32::MAX, |n| u32::try_from(n).unwrap_or(u32::MAX));
        if attempt > fail_times {
            return Ok(StepResponse::succeeded());
        }
        let failure_type: FailureType = params
            .get("failureType")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or(FailureType::ApplicationError);
        Ok(StepResponse::failed(FailureData::with_types(
            format!("{} failed on attempt {attempt}", params.identifier),
            [failure_type],
        )))
    }
}

/// A sync step that panics.
#[derive(Debug, Default)]
pub struct PanickingStep;

#[async_trait]
impl SyncExecutable for PanickingStep {
    async fn execute_sync(
        &self,
        _ambiance: &Ambiance,
        _params: &StepParameters,
        _input: &StepInputPackage,
        _pass_through: Option<&PassThroughData>,
    ) -> anyhow::Result<StepResponse> {
        panic!("step exploded");
    }
}

/// A task step echoing the task result as an outcome.
#[derive(Debug, Default)]
pub struct EchoTaskStep;

#[async_trait]
impl TaskExecutable for EchoTaskStep {
    async fn obtain_task(
        &self,
        _ambiance: &Ambiance,
        params: &StepParameters,
        _input: &StepInputPackage,
    ) -> anyhow::Result<TaskRequest> {
        Ok(TaskRequest::new("echo", params.spec.clone()))
    }

    async fn handle_task_result(
        &self,
        _ambiance: &Ambiance,
        _params: &StepParameters,
        response: ResponseSupplier,
    ) -> anyhow::Result<StepResponse> {
        let payload = response.get()?;
        Ok(StepResponse::succeeded().with_outcome("result", payload))
    }
}

/// One recorded task-chain callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainCall {
    /// Runtime id of the node.
    pub runtime_id: String,
    /// Callback name.
    pub callback: &'static str,
    /// Link number the callback saw, starting at 1.
    pub link: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChainProgress {
    runtime_id: String,
    link: u32,
}

/// A task chain of `links` tasks (overridable by the `links` parameter)
/// that records every callback.
///
/// Each link's progress travels in the pass-through capsule, tagged with the
/// node that created it, so tests can check chains never see each other's
/// state.
#[derive(Debug)]
pub struct RecordingTaskChainStep {
    links: u32,
    calls: Mutex<Vec<ChainCall>>,
    leaked: AtomicBool,
}

impl RecordingTaskChainStep {
    /// Creates a chain of `links` tasks.
    #[must_use]
    pub fn new(links: u32) -> Self {
        Self {
            links: links.max(1),
            calls: Mutex::new(Vec::new()),
            leaked: AtomicBool::new(false),
        }
    }

    /// Returns every recorded call.
    #[must_use]
    pub fn calls(&self) -> Vec<ChainCall> {
        self.calls.lock().clone()
    }

    /// Returns the callbacks recorded for one node.
    #[must_use]
    pub fn callbacks_of(&self, runtime_id: &str) -> Vec<&'static str> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.runtime_id == runtime_id)
            .map(|c| c.callback)
            .collect()
    }

    /// Returns true if a node ever received another node's capsule.
    #[must_use]
    pub fn saw_foreign_state(&self) -> bool {
        self.leaked.load(Ordering::SeqCst)
    }

    fn links_for(&self, params: &StepParameters) -> u32 {
        params
            .get("links")
            .and_then(serde_json::Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(self.links)
            .max(1)
    }

    fn record(&self, ambiance: &Ambiance, callback: &'static str, link: u32) {
        self.calls.lock().push(ChainCall {
            runtime_id: runtime_id(ambiance),
            callback,
            link,
        });
    }

    fn progress(&self, ambiance: &Ambiance, pass_through: Option<&PassThroughData>) -> anyhow::Result<u32> {
        let Some(capsule) = pass_through else {
            anyhow::bail!("missing chain progress");
        };
        let progress: ChainProgress = capsule.decode()?;
        if progress.runtime_id != runtime_id(ambiance) {
            self.leaked.store(true, Ordering::SeqCst);
        }
        Ok(progress.link)
    }

    fn link(ambiance: &Ambiance, link: u32, last: bool) -> anyhow::Result<TaskChainResponse> {
        let capsule = PassThroughData::new(
            "chain",
            &ChainProgress {
                runtime_id: runtime_id(ambiance),
                link,
            },
        )?;
        let request = TaskRequest::new("chain-link", serde_json::json!({ "link": link }));
        Ok(if last {
            TaskChainResponse::end(Some(capsule), Some(request))
        } else {
            TaskChainResponse::link(request, Some(capsule))
        })
    }
}

#[async_trait]
impl TaskChainExecutable for RecordingTaskChainStep {
    async fn start_chain_link(
        &self,
        ambiance: &Ambiance,
        params: &StepParameters,
        _input: &StepInputPackage,
    ) -> anyhow::Result<TaskChainResponse> {
        self.record(ambiance, "start_chain_link", 1);
        Self::link(ambiance, 1, self.links_for(params) == 1)
    }

    async fn execute_next_link(
        &self,
        ambiance: &Ambiance,
        params: &StepParameters,
        _input: &StepInputPackage,
        pass_through: Option<PassThroughData>,
        response: ResponseSupplier,
    ) -> anyhow::Result<TaskChainResponse> {
        let link = self.progress(ambiance, pass_through.as_ref())? + 1;
        self.record(ambiance, "execute_next_link", link);
        response.get()?;
        Self::link(ambiance, link, link >= self.links_for(params))
    }

    async fn finalize_execution(
        &self,
        ambiance: &Ambiance,
        _params: &StepParameters,
        pass_through: Option<PassThroughData>,
        response: ResponseSupplier,
    ) -> anyhow::Result<StepResponse> {
        let link = self.progress(ambiance, pass_through.as_ref())?;
        self.record(ambiance, "finalize_execution", link);
        if !response.is_empty() {
            response.get()?;
        }
        Ok(StepResponse::succeeded().with_outcome("links", serde_json::json!(link)))
    }
}

/// An async step suspending on the wait-ids named by its `waitIds`
/// parameter. Fails if any delivered response carries an error.
#[derive(Debug, Default)]
pub struct BarrierAsyncStep {
    handled: Mutex<Vec<(String, usize)>>,
    aborted: Mutex<Vec<String>>,
}

impl BarrierAsyncStep {
    /// Creates a new barrier step.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `(runtime_id, response_count)` for every resumption.
    #[must_use]
    pub fn handled(&self) -> Vec<(String, usize)> {
        self.handled.lock().clone()
    }

    /// Returns the runtime ids whose abort hook ran.
    #[must_use]
    pub fn aborted(&self) -> Vec<String> {
        self.aborted.lock().clone()
    }
}

#[async_trait]
impl AsyncExecutable for BarrierAsyncStep {
    async fn execute_async(
        &self,
        _ambiance: &Ambiance,
        params: &StepParameters,
        _input: &StepInputPackage,
    ) -> anyhow::Result<AsyncExecutableResponse> {
        Ok(AsyncExecutableResponse::new(string_list(params, "waitIds")))
    }

    async fn handle_async_response(
        &self,
        ambiance: &Ambiance,
        _params: &StepParameters,
        responses: &ResponseMap,
    ) -> anyhow::Result<StepResponse> {
        self.handled
            .lock()
            .push((runtime_id(ambiance), responses.len()));
        for response in responses.values() {
            response.payload()?;
        }
        Ok(StepResponse::succeeded().with_outcome("responses", serde_json::json!(responses.len())))
    }
}

#[async_trait]
impl Abortable for BarrierAsyncStep {
    async fn handle_abort(
        &self,
        ambiance: &Ambiance,
        _params: &StepParameters,
        _pass_through: Option<&PassThroughData>,
    ) -> anyhow::Result<()> {
        self.aborted.lock().push(runtime_id(ambiance));
        Ok(())
    }
}

fn aggregate(outcomes: &ChildOutcomes) -> StepResponse {
    let status = aggregate_status(outcomes.values().map(|o| o.status));
    if status.is_positive() {
        return StepResponse::new(status);
    }
    let failed: Vec<&str> = outcomes
        .values()
        .filter(|o| !o.status.is_positive())
        .map(|o| o.identifier.as_str())
        .collect();
    let mut response = StepResponse::new(status);
    if status == Status::Failed {
        response = response.with_failure(FailureData::with_types(
            format!("Children failed: {}", failed.join(", ")),
            [FailureType::ApplicationError],
        ));
    }
    response
}

/// A child step spawning every setup id of its `children` parameter
/// concurrently.
#[derive(Debug, Default)]
pub struct ForkStep {
    resumed: AtomicUsize,
}

impl ForkStep {
    /// Creates a new fork step.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns how often the step was resumed.
    #[must_use]
    pub fn resumed(&self) -> usize {
        self.resumed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChildExecutable for ForkStep {
    async fn obtain_child(
        &self,
        _ambiance: &Ambiance,
        params: &StepParameters,
        _input: &StepInputPackage,
    ) -> anyhow::Result<ChildExecutableResponse> {
        Ok(ChildExecutableResponse::fork(string_list(params, "children")))
    }

    async fn handle_child_response(
        &self,
        _ambiance: &Ambiance,
        _params: &StepParameters,
        outcomes: &ChildOutcomes,
    ) -> anyhow::Result<StepResponse> {
        self.resumed.fetch_add(1, Ordering::SeqCst);
        Ok(aggregate(outcomes))
    }
}

/// A child chain running the setup ids of its `children` parameter one after
/// another, stopping at the first child that did not end positively.
#[derive(Debug, Default)]
pub struct SequenceStep;

impl SequenceStep {
    fn next(params: &StepParameters, index: usize) -> anyhow::Result<ChildChainResponse> {
        let children = string_list(params, "children");
        let capsule = PassThroughData::new("sequence", &index)?;
        let Some(child) = children.get(index) else {
            return Ok(ChildChainResponse::finish(Some(capsule)));
        };
        Ok(if index + 1 == children.len() {
            ChildChainResponse::last_child(child, Some(capsule))
        } else {
            ChildChainResponse::next(child, Some(capsule))
        })
    }
}

#[async_trait]
impl ChildChainExecutable for SequenceStep {
    async fn execute_first_child(
        &self,
        _ambiance: &Ambiance,
        params: &StepParameters,
        _input: &StepInputPackage,
    ) -> anyhow::Result<ChildChainResponse> {
        Self::next(params, 0)
    }

    async fn execute_next_child(
        &self,
        _ambiance: &Ambiance,
        params: &StepParameters,
        _input: &StepInputPackage,
        pass_through: Option<PassThroughData>,
        outcomes: &ChildOutcomes,
    ) -> anyhow::Result<ChildChainResponse> {
        if outcomes.values().any(|o| !o.status.is_positive()) {
            return Ok(ChildChainResponse::finish(pass_through));
        }
        let index: usize = match &pass_through {
            Some(capsule) => capsule.decode()?,
            None => 0,
        };
        Self::next(params, index + 1)
    }

    async fn finalize_execution(
        &self,
        _ambiance: &Ambiance,
        _params: &StepParameters,
        _pass_through: Option<PassThroughData>,
        outcomes: &ChildOutcomes,
    ) -> anyhow::Result<StepResponse> {
        Ok(aggregate(outcomes))
    }
}

/// One task handed to the [`RecordingTaskExecutor`].
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchedTask {
    /// Wait-id the result must be delivered against.
    pub wait_id: String,
    /// Runtime id of the dispatching node.
    pub runtime_id: String,
    /// The task request.
    pub request: TaskRequest,
    /// Task id returned to the engine.
    pub task_id: String,
}

/// A task executor that records dispatched tasks and never runs them.
#[derive(Debug, Default)]
pub struct RecordingTaskExecutor {
    dispatched: Mutex<Vec<DispatchedTask>>,
    cancelled: Mutex<Vec<String>>,
    failure: Mutex<Option<DispatchError>>,
    attempts: AtomicUsize,
}

impl RecordingTaskExecutor {
    /// Creates an executor accepting every task.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an executor rejecting every task with `error`.
    #[must_use]
    pub fn failing(error: DispatchError) -> Self {
        let executor = Self::default();
        *executor.failure.lock() = Some(error);
        executor
    }

    /// Returns the accepted tasks in dispatch order.
    #[must_use]
    pub fn dispatched(&self) -> Vec<DispatchedTask> {
        self.dispatched.lock().clone()
    }

    /// Returns the accepted tasks of one node.
    #[must_use]
    pub fn dispatched_by(&self, runtime_id: &str) -> Vec<DispatchedTask> {
        self.dispatched
            .lock()
            .iter()
            .filter(|t| t.runtime_id == runtime_id)
            .cloned()
            .collect()
    }

    /// Returns the cancelled task ids.
    #[must_use]
    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().clone()
    }

    /// Returns how many `queue_task` calls were made, accepted or not.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskExecutor for RecordingTaskExecutor {
    async fn queue_task(
        &self,
        wait_id: &str,
        ambiance: &Ambiance,
        request: &TaskRequest,
    ) -> Result<String, DispatchError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(error) = self.failure.lock().clone() {
            return Err(error);
        }
        let task_id = format!("task-{attempt}");
        self.dispatched.lock().push(DispatchedTask {
            wait_id: wait_id.to_string(),
            runtime_id: runtime_id(ambiance),
            request: request.clone(),
            task_id: task_id.clone(),
        });
        Ok(task_id)
    }

    async fn cancel_task(&self, task_id: &str) -> Result<(), DispatchError> {
        self.cancelled.lock().push(task_id.to_string());
        Ok(())
    }
}

/// Collects every status update it observes.
#[derive(Debug, Default)]
pub struct CollectingStatusObserver {
    updates: Mutex<Vec<(String, Status)>>,
}

impl CollectingStatusObserver {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the statuses observed for one node, in order.
    #[must_use]
    pub fn statuses_of(&self, runtime_id: &str) -> Vec<Status> {
        self.updates
            .lock()
            .iter()
            .filter(|(id, _)| id == runtime_id)
            .map(|(_, status)| *status)
            .collect()
    }

    /// Returns the number of observed updates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.updates.lock().len()
    }

    /// Returns true if nothing was observed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.updates.lock().is_empty()
    }
}

#[async_trait]
impl NodeStatusUpdateObserver for CollectingStatusObserver {
    async fn on_node_status_update(&self, update: &NodeStatusUpdate) -> anyhow::Result<()> {
        self.updates
            .lock()
            .push((update.node.runtime_id.clone(), update.node.status));
        Ok(())
    }
}

/// Collects every plan result it observes.
#[derive(Debug, Default)]
pub struct CollectingEndObserver {
    results: Mutex<Vec<PlanExecutionResult>>,
}

impl CollectingEndObserver {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the observed results.
    #[must_use]
    pub fn results(&self) -> Vec<PlanExecutionResult> {
        self.results.lock().clone()
    }
}

#[async_trait]
impl OrchestrationEndObserver for CollectingEndObserver {
    async fn on_end(&self, result: &PlanExecutionResult) -> anyhow::Result<()> {
        self.results.lock().push(result.clone());
        Ok(())
    }
}
