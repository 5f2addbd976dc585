//! Testing utilities for nodeflow plans.
//!
//! This module provides:
//! - Mock steps for each of the six step kinds
//! - A recording task executor and collecting observers
//! - Plan builders and polling helpers

mod fixtures;
mod mocks;

pub use fixtures::{
    eventually, fork, pipeline, single_node_plan, stage, staged_plan, step, step_group, types,
    within, TestSteps,
};
pub use mocks::{
    BarrierAsyncStep, ChainCall, CollectingEndObserver, CollectingStatusObserver, DispatchedTask,
    EchoTaskStep, FailingStep, ForkStep, PanickingStep, RecordingTaskChainStep,
    RecordingTaskExecutor, SequenceStep, SucceedingStep,
};
