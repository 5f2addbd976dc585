//! The six step interaction shapes.
//!
//! Every step implements exactly one of these traits. The engine drives it
//! through the matching protocol after looking it up as a [`StepKind`].

use super::data::{
    AsyncExecutableResponse, ChildChainResponse, ChildExecutableResponse, PassThroughData,
    StepInputPackage, StepParameters, TaskChainResponse, TaskRequest,
};
use crate::ambiance::Ambiance;
use crate::core::{ChildOutcomes, ResponseMap, StepResponse};
use crate::correlation::{ResponseKind, ResponseSupplier};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// A step that completes inline without suspending.
#[async_trait]
pub trait SyncExecutable: Send + Sync {
    /// Runs the step to completion.
    async fn execute_sync(
        &self,
        ambiance: &Ambiance,
        params: &StepParameters,
        input: &StepInputPackage,
        pass_through: Option<&PassThroughData>,
    ) -> anyhow::Result<StepResponse>;
}

/// A step that suspends on callback wait-ids and resumes once all deliver.
#[async_trait]
pub trait AsyncExecutable: Send + Sync {
    /// Starts the work and returns the wait-ids to suspend on.
    async fn execute_async(
        &self,
        ambiance: &Ambiance,
        params: &StepParameters,
        input: &StepInputPackage,
    ) -> anyhow::Result<AsyncExecutableResponse>;

    /// Consumes every delivered response.
    async fn handle_async_response(
        &self,
        ambiance: &Ambiance,
        params: &StepParameters,
        responses: &ResponseMap,
    ) -> anyhow::Result<StepResponse>;
}

/// A step that hands one task to the external executor.
#[async_trait]
pub trait TaskExecutable: Send + Sync {
    /// Builds the task to dispatch.
    async fn obtain_task(
        &self,
        ambiance: &Ambiance,
        params: &StepParameters,
        input: &StepInputPackage,
    ) -> anyhow::Result<TaskRequest>;

    /// Consumes the task result.
    async fn handle_task_result(
        &self,
        ambiance: &Ambiance,
        params: &StepParameters,
        response: ResponseSupplier,
    ) -> anyhow::Result<StepResponse>;
}

/// A step that dispatches a strictly sequential chain of tasks.
#[async_trait]
pub trait TaskChainExecutable: Send + Sync {
    /// Produces the first link.
    async fn start_chain_link(
        &self,
        ambiance: &Ambiance,
        params: &StepParameters,
        input: &StepInputPackage,
    ) -> anyhow::Result<TaskChainResponse>;

    /// Produces the next link from the previous link's result.
    async fn execute_next_link(
        &self,
        ambiance: &Ambiance,
        params: &StepParameters,
        input: &StepInputPackage,
        pass_through: Option<PassThroughData>,
        response: ResponseSupplier,
    ) -> anyhow::Result<TaskChainResponse>;

    /// Produces the terminal response once the chain has ended.
    async fn finalize_execution(
        &self,
        ambiance: &Ambiance,
        params: &StepParameters,
        pass_through: Option<PassThroughData>,
        response: ResponseSupplier,
    ) -> anyhow::Result<StepResponse>;
}

/// A step that spawns child nodes and resumes once they all terminate.
#[async_trait]
pub trait ChildExecutable: Send + Sync {
    /// Names the children to spawn.
    async fn obtain_child(
        &self,
        ambiance: &Ambiance,
        params: &StepParameters,
        input: &StepInputPackage,
    ) -> anyhow::Result<ChildExecutableResponse>;

    /// Derives the step result from the children's outcomes.
    async fn handle_child_response(
        &self,
        ambiance: &Ambiance,
        params: &StepParameters,
        outcomes: &ChildOutcomes,
    ) -> anyhow::Result<StepResponse>;
}

/// A step that runs children strictly one after another.
#[async_trait]
pub trait ChildChainExecutable: Send + Sync {
    /// Names the first child.
    async fn execute_first_child(
        &self,
        ambiance: &Ambiance,
        params: &StepParameters,
        input: &StepInputPackage,
    ) -> anyhow::Result<ChildChainResponse>;

    /// Names the next child from the previous child's outcome.
    async fn execute_next_child(
        &self,
        ambiance: &Ambiance,
        params: &StepParameters,
        input: &StepInputPackage,
        pass_through: Option<PassThroughData>,
        outcomes: &ChildOutcomes,
    ) -> anyhow::Result<ChildChainResponse>;

    /// Produces the terminal response once the chain has ended.
    async fn finalize_execution(
        &self,
        ambiance: &Ambiance,
        params: &StepParameters,
        pass_through: Option<PassThroughData>,
        outcomes: &ChildOutcomes,
    ) -> anyhow::Result<StepResponse>;
}

/// Optional hook run when a suspended node is aborted or expires.
#[async_trait]
pub trait Abortable: Send + Sync {
    /// Releases step-owned resources. Errors are logged and ignored.
    async fn handle_abort(
        &self,
        ambiance: &Ambiance,
        params: &StepParameters,
        pass_through: Option<&PassThroughData>,
    ) -> anyhow::Result<()>;
}

/// A step implementation tagged with its interaction shape.
#[derive(Clone)]
pub enum StepKind {
    /// Inline completion.
    Sync(Arc<dyn SyncExecutable>),
    /// Callback barrier.
    Async(Arc<dyn AsyncExecutable>),
    /// Single external task.
    Task(Arc<dyn TaskExecutable>),
    /// Sequential external tasks.
    TaskChain(Arc<dyn TaskChainExecutable>),
    /// Concurrent children.
    Child(Arc<dyn ChildExecutable>),
    /// Sequential children.
    ChildChain(Arc<dyn ChildChainExecutable>),
}

impl StepKind {
    /// Returns the kind name used in logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sync(_) => "sync",
            Self::Async(_) => "async",
            Self::Task(_) => "task",
            Self::TaskChain(_) => "task_chain",
            Self::Child(_) => "child",
            Self::ChildChain(_) => "child_chain",
        }
    }

    /// Returns the response kind the node suspends on, if it ever suspends.
    #[must_use]
    pub fn response_kind(&self) -> Option<ResponseKind> {
        match self {
            Self::Sync(_) => None,
            Self::Async(_) => Some(ResponseKind::Async),
            Self::Task(_) | Self::TaskChain(_) => Some(ResponseKind::Task),
            Self::Child(_) | Self::ChildChain(_) => Some(ResponseKind::Child),
        }
    }
}

impl fmt::Debug for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StepKind").field(&self.name()).finish()
    }
}
