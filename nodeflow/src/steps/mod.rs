//! Step execution strategies and their data model.
//!
//! A step is registered under a [`StepType`](crate::core::StepType) as one
//! of six [`StepKind`]s. The engine owns suspension, correlation, retries and
//! abort propagation; steps only produce requests and consume responses.

mod data;
mod kinds;
mod registry;

pub use data::{
    AsyncExecutableResponse, ChildChainResponse, ChildExecutableResponse, PassThroughData,
    StepInputPackage, StepParameters, TaskChainResponse, TaskRequest,
};
pub use kinds::{
    Abortable, AsyncExecutable, ChildChainExecutable, ChildExecutable, StepKind, SyncExecutable,
    TaskChainExecutable, TaskExecutable,
};
pub use registry::{RegisteredStep, StepRegistry};
