//! Instrumentation observers.
//!
//! Observers are notified off the engine's workers: each registered observer
//! owns an unbounded queue drained by its own task, so one observer sees
//! notifications in transition order and a slow or failing observer never
//! stalls node progression.

use crate::core::Status;
use crate::engine::PlanExecutionResult;
use crate::execution::NodeExecution;
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// A status transition of one node.
#[derive(Debug, Clone)]
pub struct NodeStatusUpdate {
    /// The node after the transition.
    pub node: NodeExecution,
    /// The status before the transition.
    pub previous_status: Status,
}

/// Receives node status transitions.
#[async_trait]
pub trait NodeStatusUpdateObserver: Send + Sync {
    /// Observer name used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Called after a node changed status.
    async fn on_node_status_update(&self, update: &NodeStatusUpdate) -> anyhow::Result<()>;
}

/// Receives the end of a plan execution.
#[async_trait]
pub trait OrchestrationEndObserver: Send + Sync {
    /// Observer name used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Called once the root node of a plan execution is terminal.
    async fn on_end(&self, result: &PlanExecutionResult) -> anyhow::Result<()>;
}

struct Worker<T> {
    name: String,
    tx: mpsc::UnboundedSender<Arc<T>>,
    handle: JoinHandle<()>,
}

impl<T: Send + Sync + 'static> Worker<T> {
    fn spawn<F, Fut>(name: String, mut handler: F) -> Self
    where
        F: FnMut(Arc<T>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Arc<T>>();
        let worker_name = name.clone();
        let handle = tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                match AssertUnwindSafe(handler(item)).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(observer = %worker_name, error = %e, "Observer failed");
                    }
                    Err(_) => {
                        error!(observer = %worker_name, "Observer panicked");
                    }
                }
            }
            debug!(observer = %worker_name, "Observer worker stopped");
        });
        Self { name, tx, handle }
    }

    fn send(&self, item: Arc<T>) {
        if self.tx.send(item).is_err() {
            error!(observer = %self.name, "Observer queue closed, notification dropped");
        }
    }
}

/// Holds observers and their worker tasks.
///
/// Constructed explicitly and handed to the engine. Call
/// [`shutdown`](Self::shutdown) to drain the queues and join the workers.
#[derive(Default)]
pub struct ObserverRegistry {
    status_workers: Mutex<Vec<Worker<NodeStatusUpdate>>>,
    end_workers: Mutex<Vec<Worker<PlanExecutionResult>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for ObserverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverRegistry")
            .field("status_observers", &self.status_workers.lock().len())
            .field("end_observers", &self.end_workers.lock().len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl ObserverRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a status observer and starts its worker.
    ///
    /// Must be called from within a tokio runtime.
    pub fn add_status_observer(&self, observer: Arc<dyn NodeStatusUpdateObserver>) {
        let name = observer.name().to_string();
        let worker = Worker::spawn(name, move |update: Arc<NodeStatusUpdate>| {
            let observer = Arc::clone(&observer);
            async move { observer.on_node_status_update(&update).await }
        });
        self.status_workers.lock().push(worker);
    }

    /// Adds an end observer and starts its worker.
    ///
    /// Must be called from within a tokio runtime.
    pub fn add_end_observer(&self, observer: Arc<dyn OrchestrationEndObserver>) {
        let name = observer.name().to_string();
        let worker = Worker::spawn(name, move |result: Arc<PlanExecutionResult>| {
            let observer = Arc::clone(&observer);
            async move { observer.on_end(&result).await }
        });
        self.end_workers.lock().push(worker);
    }

    /// Queues a status update for every status observer.
    pub fn notify_status(&self, update: NodeStatusUpdate) {
        if self.closed.load(Ordering::Acquire) {
            debug!(runtime_id = %update.node.runtime_id, "Observer registry closed");
            return;
        }
        let update = Arc::new(update);
        for worker in self.status_workers.lock().iter() {
            worker.send(Arc::clone(&update));
        }
    }

    /// Queues a plan result for every end observer.
    pub fn notify_end(&self, result: PlanExecutionResult) {
        if self.closed.load(Ordering::Acquire) {
            debug!(plan_execution_id = %result.plan_execution_id, "Observer registry closed");
            return;
        }
        let result = Arc::new(result);
        for worker in self.end_workers.lock().iter() {
            worker.send(Arc::clone(&result));
        }
    }

    /// Returns the number of registered observers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.status_workers.lock().len() + self.end_workers.lock().len()
    }

    /// Returns true if no observer is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops accepting notifications, drains the queues and joins the
    /// workers.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let status: Vec<_> = self.status_workers.lock().drain(..).collect();
        let end: Vec<_> = self.end_workers.lock().drain(..).collect();

        let mut handles = Vec::new();
        for worker in status {
            drop(worker.tx);
            handles.push((worker.name, worker.handle));
        }
        for worker in end {
            drop(worker.tx);
            handles.push((worker.name, worker.handle));
        }
        for (name, handle) in handles {
            if let Err(e) = handle.await {
                warn!(observer = %name, error = %e, "Observer worker did not stop cleanly");
            }
        }
    }
}
