//! Outbound boundary to the external task executor.

use crate::ambiance::Ambiance;
use crate::errors::DispatchError;
use crate::steps::TaskRequest;
use async_trait::async_trait;

/// Hands tasks to the delegate layer.
///
/// The executor reports the task result later by calling
/// [`OrchestrationEngine::deliver_response`](crate::engine::OrchestrationEngine::deliver_response)
/// with the same wait-id.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Queues a task and returns the executor's task id.
    async fn queue_task(
        &self,
        wait_id: &str,
        ambiance: &Ambiance,
        request: &TaskRequest,
    ) -> Result<String, DispatchError>;

    /// Requests best-effort cancellation. The engine never waits on the result.
    async fn cancel_task(&self, task_id: &str) -> Result<(), DispatchError>;
}
