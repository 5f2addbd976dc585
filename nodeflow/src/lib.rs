//! # Nodeflow
//!
//! The execution core of a pipeline orchestrator.
//!
//! A [`Plan`](plan::Plan) is a tree of nodes (pipeline, stages, step groups,
//! forks and steps). The [`OrchestrationEngine`](engine::OrchestrationEngine)
//! walks that tree one node at a time:
//!
//! - **Six step kinds**: sync, async, task, task chain, child and child chain
//! - **Wait-id correlation**: suspended nodes resume when every awaited
//!   response has been delivered, in any order
//! - **Failure strategies**: retry, ignore, mark as success or failure,
//!   abort, rollback and manual intervention, resolved from the nearest scope
//! - **Observers**: status updates and plan completion fan out to
//!   independent subscribers
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use nodeflow::prelude::*;
//!
//! let engine = OrchestrationEngine::builder(registry)
//!     .with_task_executor(executor)
//!     .build();
//!
//! let plan_execution_id = engine.start_plan(plan, BTreeMap::new())?;
//! let result = engine.await_plan(&plan_execution_id).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod ambiance;
pub mod capabilities;
pub mod config;
pub mod core;
pub mod correlation;
pub mod engine;
pub mod errors;
pub mod events;
pub mod execution;
pub mod failure;
pub mod observability;
pub mod observers;
pub mod plan;
pub mod steps;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::ambiance::{Ambiance, Level};
    pub use crate::capabilities::{Capability, CapabilityChain};
    pub use crate::config::EngineConfig;
    pub use crate::core::{
        ChildOutcome, FailureData, FailureType, ResponseData, Status, StepCategory, StepResponse,
        StepType,
    };
    pub use crate::correlation::{Delivery, ResponseSupplier, TaskExecutor};
    pub use crate::engine::{EngineBuilder, OrchestrationEngine, PlanExecutionResult};
    pub use crate::errors::{DispatchError, NodeflowError, PlanValidationError};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::execution::{NodeExecution, NodeExecutionStore};
    pub use crate::failure::{ActionConfig, FailureStrategyConfig, OnFailureConfig};
    pub use crate::observers::{
        NodeStatusUpdate, NodeStatusUpdateObserver, ObserverRegistry, OrchestrationEndObserver,
    };
    pub use crate::plan::{Plan, PlanNode};
    pub use crate::steps::{
        AsyncExecutable, ChildChainExecutable, ChildExecutable, StepKind, StepParameters,
        StepRegistry, SyncExecutable, TaskChainExecutable, TaskExecutable, TaskRequest,
    };
}
