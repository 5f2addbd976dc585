//! The orchestration engine.
//!
//! The engine walks a [`Plan`] node by node. Every node is driven by events
//! on a shared queue consumed by a fixed pool of workers; a per-node lock
//! serializes the events of one node while siblings progress in parallel.
//! A suspended node is persisted state (wait-ids, pass-through data, chain
//! state), never a parked task: it resumes when the wait registry reports
//! its barrier complete.

mod abort;
mod failure_policy;
mod protocol;
mod result;

#[cfg(test)]
mod integration_tests;

pub use result::PlanExecutionResult;

use crate::ambiance::{Ambiance, Level};
use crate::config::EngineConfig;
use crate::core::{ResponseData, ResponseMap, Status};
use crate::correlation::{Delivery, ResponseKind, TaskExecutor, WaitRegistry};
use crate::errors::{DispatchError, NodeflowError};
use crate::events::{EventSink, LoggingEventSink};
use crate::execution::{InMemoryNodeExecutionStore, NodeExecution, NodeExecutionStore};
use crate::failure::{ActionConfig, PlanCreationContext};
use crate::observability::{node_span, SpanTimer};
use crate::observers::{NodeStatusUpdate, ObserverRegistry};
use crate::plan::{Plan, PlanNode};
use crate::steps::{StepRegistry, TaskRequest};
use crate::utils::generate_runtime_id;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn, Instrument};

/// What a node event asks the engine to do.
#[derive(Debug, Clone)]
pub(crate) enum Trigger {
    /// Run a queued node.
    Start,
    /// Continue a suspended node with its delivered responses.
    Resume {
        kind: ResponseKind,
        responses: ResponseMap,
    },
    /// End the node as `ABORTED` or `EXPIRED`.
    Abort { target: Status },
    /// Apply an action to a paused node.
    Intervene(ActionConfig),
}

impl Trigger {
    fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Resume { .. } => "resume",
            Self::Abort { .. } => "abort",
            Self::Intervene(_) => "intervene",
        }
    }
}

/// A unit of work on the engine queue.
#[derive(Debug, Clone)]
pub(crate) struct NodeEvent {
    runtime_id: String,
    trigger: Trigger,
}

struct PlanExecutionState {
    plan: Arc<Plan>,
    root_runtime_id: String,
    creation_context: PlanCreationContext,
    aborting: AtomicBool,
    /// Status each node held before a plan abort marked it `DISCONTINUING`.
    discontinued_from: DashMap<String, Status>,
    result_tx: watch::Sender<Option<PlanExecutionResult>>,
}

impl PlanExecutionState {
    fn is_aborting(&self) -> bool {
        self.aborting.load(Ordering::Acquire)
    }
}

struct EngineInner {
    config: EngineConfig,
    steps: Arc<StepRegistry>,
    store: Arc<dyn NodeExecutionStore>,
    waits: WaitRegistry,
    observers: Arc<ObserverRegistry>,
    executor: Arc<dyn TaskExecutor>,
    sink: Arc<dyn EventSink>,
    plans: DashMap<String, Arc<PlanExecutionState>>,
    node_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    deadlines: DashMap<String, AbortHandle>,
    queue: Mutex<Option<mpsc::UnboundedSender<NodeEvent>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    orphan_purger: Mutex<Option<AbortHandle>>,
}

/// Task executor used when none is configured: rejects every task.
struct UnconfiguredTaskExecutor;

#[async_trait]
impl TaskExecutor for UnconfiguredTaskExecutor {
    async fn queue_task(
        &self,
        _wait_id: &str,
        _ambiance: &Ambiance,
        request: &TaskRequest,
    ) -> Result<String, DispatchError> {
        Err(DispatchError::permanent(
            &request.task_type,
            "No task executor configured",
        ))
    }

    async fn cancel_task(&self, _task_id: &str) -> Result<(), DispatchError> {
        Ok(())
    }
}

/// Builder for [`OrchestrationEngine`].
pub struct EngineBuilder {
    config: EngineConfig,
    steps: Arc<StepRegistry>,
    store: Option<Arc<dyn NodeExecutionStore>>,
    executor: Option<Arc<dyn TaskExecutor>>,
    observers: Option<Arc<ObserverRegistry>>,
    sink: Option<Arc<dyn EventSink>>,
}

impl EngineBuilder {
    /// Sets the configuration.
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the node store. Defaults to [`InMemoryNodeExecutionStore`].
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn NodeExecutionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the task executor.
    #[must_use]
    pub fn with_task_executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Sets the observer registry.
    #[must_use]
    pub fn with_observers(mut self, observers: Arc<ObserverRegistry>) -> Self {
        self.observers = Some(observers);
        self
    }

    /// Sets the event sink. Defaults to [`LoggingEventSink`].
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Builds the engine and starts its workers.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn build(self) -> OrchestrationEngine {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(EngineInner {
            config: self.config,
            steps: self.steps,
            store: self
                .store
                .unwrap_or_else(|| Arc::new(InMemoryNodeExecutionStore::new())),
            waits: WaitRegistry::new(),
            observers: self
                .observers
                .unwrap_or_else(|| Arc::new(ObserverRegistry::new())),
            executor: self
                .executor
                .unwrap_or_else(|| Arc::new(UnconfiguredTaskExecutor)),
            sink: self
                .sink
                .unwrap_or_else(|| Arc::new(LoggingEventSink::default())),
            plans: DashMap::new(),
            node_locks: DashMap::new(),
            deadlines: DashMap::new(),
            queue: Mutex::new(Some(tx)),
            workers: Mutex::new(Vec::new()),
            orphan_purger: Mutex::new(None),
        });

        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let worker_count = inner.config.worker_count.max(1);
        let handles: Vec<JoinHandle<()>> = (0..worker_count)
            .map(|index| tokio::spawn(run_worker(Arc::clone(&inner), Arc::clone(&rx), index)))
            .collect();
        *inner.workers.lock() = handles;
        let purger = tokio::spawn(run_orphan_purger(Arc::downgrade(&inner))).abort_handle();
        *inner.orphan_purger.lock() = Some(purger);
        info!(workers = worker_count, "Orchestration engine started");

        OrchestrationEngine { inner }
    }
}

/// Drops responses for wait-ids nobody registered once they outlive
/// `orphan_max_age_ms`. Stops when the engine is dropped or shut down.
async fn run_orphan_purger(engine: Weak<EngineInner>) {
    let Some(period) = engine
        .upgrade()
        .map(|inner| Duration::from_millis(inner.config.orphan_purge_interval_ms.max(1)))
    else {
        return;
    };
    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    loop {
        interval.tick().await;
        let Some(inner) = engine.upgrade() else {
            break;
        };
        let max_age_ms = i64::try_from(inner.config.orphan_max_age_ms).unwrap_or(i64::MAX);
        let purged = inner.waits.purge_orphans(max_age_ms);
        if purged > 0 {
            debug!(purged, "Purged orphan responses");
        }
    }
}

async fn run_worker(
    inner: Arc<EngineInner>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<NodeEvent>>>,
    index: usize,
) {
    loop {
        let event = rx.lock().await.recv().await;
        let Some(event) = event else {
            break;
        };
        inner.handle_event(event).await;
    }
    debug!(worker = index, "Engine worker stopped");
}

/// Drives plan executions to completion.
///
/// Cheap to clone; clones share the same workers and state.
#[derive(Clone)]
pub struct OrchestrationEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for OrchestrationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestrationEngine")
            .field("config", &self.inner.config)
            .field("plans", &self.inner.plans.len())
            .finish_non_exhaustive()
    }
}

impl OrchestrationEngine {
    /// Starts building an engine around a step registry.
    #[must_use]
    pub fn builder(steps: Arc<StepRegistry>) -> EngineBuilder {
        EngineBuilder {
            config: EngineConfig::default(),
            steps,
            store: None,
            executor: None,
            observers: None,
            sink: None,
        }
    }

    /// Validates a plan and starts executing it. Returns the plan execution id.
    ///
    /// `setup_abstractions` are merged over the plan's own and copied into
    /// every node's ambiance.
    ///
    /// # Errors
    ///
    /// Returns `PlanValidation` for an invalid plan and `ShutDown` once the
    /// engine stopped.
    pub fn start_plan(
        &self,
        plan: Plan,
        setup_abstractions: BTreeMap<String, String>,
    ) -> Result<String, NodeflowError> {
        plan.validate()?;
        if self.inner.queue.lock().is_none() {
            return Err(NodeflowError::ShutDown);
        }
        let start = plan
            .start_node()
            .cloned()
            .ok_or_else(|| NodeflowError::invalid_request("Plan has no start node"))?;

        let plan_execution_id = generate_runtime_id();
        let mut abstractions = plan.setup_abstractions.clone();
        abstractions.extend(setup_abstractions);
        let ambiance = Ambiance::new(&plan_execution_id, &plan.plan_id)
            .with_setup_abstractions(abstractions);

        let root = EngineInner::new_node(&ambiance, &start, 0)?;
        let root_runtime_id = root.runtime_id.clone();
        let (result_tx, _) = watch::channel(None);
        self.inner.plans.insert(
            plan_execution_id.clone(),
            Arc::new(PlanExecutionState {
                plan: Arc::new(plan),
                root_runtime_id: root_runtime_id.clone(),
                creation_context: PlanCreationContext::new(),
                aborting: AtomicBool::new(false),
                discontinued_from: DashMap::new(),
                result_tx,
            }),
        );
        self.inner.store.save(root)?;
        info!(
            plan_execution_id = %plan_execution_id,
            root = %root_runtime_id,
            "Plan execution started"
        );
        self.inner.enqueue(&root_runtime_id, Trigger::Start);
        Ok(plan_execution_id)
    }

    /// Delivers a correlated response.
    ///
    /// Duplicates are reported and ignored; a response for a wait-id not yet
    /// registered is buffered until its node registers it.
    ///
    /// # Errors
    ///
    /// Returns `ShutDown` once the engine stopped.
    pub fn deliver_response(
        &self,
        wait_id: &str,
        response: ResponseData,
    ) -> Result<Delivery, NodeflowError> {
        if self.inner.queue.lock().is_none() {
            return Err(NodeflowError::ShutDown);
        }
        Ok(self.inner.deliver(wait_id, response))
    }

    /// Aborts one node and its unfinished descendants.
    ///
    /// # Errors
    ///
    /// Returns `NodeNotFound` for an unknown node.
    pub fn abort_node(&self, runtime_id: &str) -> Result<(), NodeflowError> {
        let node = self
            .inner
            .store
            .get(runtime_id)
            .ok_or_else(|| NodeflowError::NodeNotFound(runtime_id.to_string()))?;
        if !node.is_final() {
            self.inner.enqueue(
                runtime_id,
                Trigger::Abort {
                    target: Status::Aborted,
                },
            );
        }
        Ok(())
    }

    /// Aborts a whole plan execution. Returns how many leaves were marked.
    ///
    /// # Errors
    ///
    /// Returns `PlanExecutionNotFound` for an unknown plan execution.
    pub fn abort_plan(&self, plan_execution_id: &str) -> Result<usize, NodeflowError> {
        let state = self.inner.plan_state(plan_execution_id)?;
        state.aborting.store(true, Ordering::Release);

        for node in self.inner.store.fetch_by_status(
            plan_execution_id,
            &[Status::Queued, Status::Running, Status::Paused],
        ) {
            state.discontinued_from.insert(node.runtime_id, node.status);
        }
        let marked = self.inner.store.mark_all_leaves_and_queued_discontinuing(
            plan_execution_id,
            &[Status::Running, Status::Paused],
        );
        for node in self
            .inner
            .store
            .fetch_by_status(plan_execution_id, &[Status::Discontinuing])
        {
            self.inner.enqueue(
                &node.runtime_id,
                Trigger::Abort {
                    target: Status::Aborted,
                },
            );
        }
        info!(plan_execution_id, marked, "Plan execution abort requested");
        Ok(marked)
    }

    /// Applies an action to a node paused for manual intervention.
    ///
    /// # Errors
    ///
    /// Returns `NodeNotFound` for an unknown node and `InvalidRequest` if the
    /// node is not paused or the action is itself a manual intervention.
    pub fn intervene(&self, runtime_id: &str, action: ActionConfig) -> Result<(), NodeflowError> {
        let node = self
            .inner
            .store
            .get(runtime_id)
            .ok_or_else(|| NodeflowError::NodeNotFound(runtime_id.to_string()))?;
        if node.status != Status::Paused {
            return Err(NodeflowError::invalid_request(format!(
                "Node '{runtime_id}' is {} and cannot take an intervention",
                node.status
            )));
        }
        if matches!(action, ActionConfig::ManualIntervention { .. }) {
            return Err(NodeflowError::invalid_request(
                "An intervention cannot request another intervention",
            ));
        }
        self.inner.enqueue(runtime_id, Trigger::Intervene(action));
        Ok(())
    }

    /// Waits until the plan execution's root node is terminal.
    ///
    /// # Errors
    ///
    /// Returns `PlanExecutionNotFound` for an unknown plan execution and
    /// `ShutDown` if the engine stopped first.
    pub async fn await_plan(
        &self,
        plan_execution_id: &str,
    ) -> Result<PlanExecutionResult, NodeflowError> {
        let mut rx = self.inner.plan_state(plan_execution_id)?.result_tx.subscribe();
        let result = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| NodeflowError::ShutDown)?;
        result
            .clone()
            .ok_or_else(|| NodeflowError::Internal("Plan result vanished".to_string()))
    }

    /// Returns a node execution record.
    #[must_use]
    pub fn node(&self, runtime_id: &str) -> Option<NodeExecution> {
        self.inner.store.get(runtime_id)
    }

    /// Returns every node of a plan execution.
    #[must_use]
    pub fn nodes(&self, plan_execution_id: &str) -> Vec<NodeExecution> {
        self.inner.store.fetch_by_plan_execution(plan_execution_id)
    }

    /// Returns the runtime id of a plan execution's root node.
    #[must_use]
    pub fn root_runtime_id(&self, plan_execution_id: &str) -> Option<String> {
        self.inner
            .plans
            .get(plan_execution_id)
            .map(|state| state.root_runtime_id.clone())
    }

    /// Returns the wait-ids a node still waits on.
    #[must_use]
    pub fn pending_wait_ids(&self, runtime_id: &str) -> Vec<String> {
        self.inner.waits.pending_for(runtime_id)
    }

    /// Stops the workers, cancels timers and drains the observers.
    ///
    /// Events still queued are processed before the workers exit.
    pub async fn shutdown(&self) {
        let Some(tx) = self.inner.queue.lock().take() else {
            return;
        };
        drop(tx);
        let workers: Vec<JoinHandle<()>> = self.inner.workers.lock().drain(..).collect();
        for handle in workers {
            if let Err(e) = handle.await {
                warn!(error = %e, "Engine worker did not stop cleanly");
            }
        }
        if let Some(purger) = self.inner.orphan_purger.lock().take() {
            purger.abort();
        }
        for entry in self.inner.deadlines.iter() {
            entry.value().abort();
        }
        self.inner.deadlines.clear();
        self.inner.observers.shutdown().await;
        info!("Orchestration engine stopped");
    }
}

impl EngineInner {
    fn enqueue(&self, runtime_id: &str, trigger: Trigger) {
        let queue = self.queue.lock();
        let Some(tx) = queue.as_ref() else {
            debug!(runtime_id, trigger = trigger.name(), "Engine stopped, event dropped");
            return;
        };
        let event = NodeEvent {
            runtime_id: runtime_id.to_string(),
            trigger,
        };
        if tx.send(event).is_err() {
            tracing::error!(runtime_id, "Engine queue closed, event dropped");
        }
    }

    fn deliver(&self, wait_id: &str, response: ResponseData) -> Delivery {
        let delivery = self.waits.deliver(wait_id, response);
        if let Delivery::Ready {
            node_runtime_id,
            kind,
            responses,
        } = &delivery
        {
            self.enqueue(
                node_runtime_id,
                Trigger::Resume {
                    kind: *kind,
                    responses: responses.clone(),
                },
            );
        }
        delivery
    }

    fn plan_state(&self, plan_execution_id: &str) -> Result<Arc<PlanExecutionState>, NodeflowError> {
        self.plans
            .get(plan_execution_id)
            .map(|state| Arc::clone(state.value()))
            .ok_or_else(|| NodeflowError::PlanExecutionNotFound(plan_execution_id.to_string()))
    }

    fn node_lock(&self, runtime_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.node_locks.entry(runtime_id.to_string()).or_default().value())
    }

    /// Builds a queued node for `plan_node` under `parent`.
    fn new_node(
        parent: &Ambiance,
        plan_node: &PlanNode,
        retry_index: u32,
    ) -> Result<NodeExecution, NodeflowError> {
        let mut level = Level::new(
            &plan_node.setup_id,
            generate_runtime_id(),
            &plan_node.identifier,
            plan_node.step_type.clone(),
        )
        .with_retry_index(retry_index)
        .with_skip_expression_chain(plan_node.skip_expression_chain);
        if let Some(group) = &plan_node.group {
            level = level.with_group(group);
        }
        NodeExecution::new(parent.clone_for_child(level))
    }

    /// Transitions a node and notifies status observers.
    fn transition(
        &self,
        runtime_id: &str,
        status: Status,
        allowed_from: &[Status],
        ops: &mut (dyn FnMut(&mut NodeExecution) + Send),
    ) -> Option<NodeExecution> {
        let mut previous = None;
        let updated = self.store.update_status_with_ops(
            runtime_id,
            status,
            allowed_from,
            &mut |node: &mut NodeExecution| {
                previous = Some(node.status);
                ops(node);
            },
        )?;
        let previous_status = previous.unwrap_or(Status::Queued);
        info!(
            runtime_id,
            plan_execution_id = %updated.plan_execution_id,
            from = %previous_status,
            status = %status,
            "Node status changed"
        );
        self.observers.notify_status(NodeStatusUpdate {
            node: updated.clone(),
            previous_status,
        });
        Some(updated)
    }

    async fn handle_event(self: &Arc<Self>, event: NodeEvent) {
        let lock = self.node_lock(&event.runtime_id);
        let _guard = lock.lock().await;
        let span = self.store.get(&event.runtime_id).map_or_else(
            || tracing::debug_span!("node", runtime_id = %event.runtime_id),
            |node| node_span(&node.ambiance),
        );
        let timer = SpanTimer::start(event.trigger.name());
        let runtime_id = event.runtime_id;
        async {
            match event.trigger {
                Trigger::Start => self.handle_start(&runtime_id).await,
                Trigger::Resume { kind, responses } => {
                    self.handle_resume(&runtime_id, kind, responses).await;
                }
                Trigger::Abort { target } => self.handle_abort(&runtime_id, target).await,
                Trigger::Intervene(action) => self.handle_intervene(&runtime_id, action).await,
            }
        }
        .instrument(span)
        .await;
        debug!(
            runtime_id = %runtime_id,
            trigger = timer.name(),
            elapsed_ms = timer.elapsed_ms(),
            "Node event handled"
        );
    }
}
