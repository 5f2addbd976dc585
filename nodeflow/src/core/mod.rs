//! Core domain model types for nodeflow.
//!
//! This module contains the fundamental types used throughout the engine:
//! - Node status and the status utilities
//! - Step type and category
//! - Failure types and captured failure data
//! - Step responses and correlated response payloads

mod failure;
mod response;
pub mod status;
mod step_type;

pub use failure::{FailureData, FailureType};
pub use response::{
    child_outcomes, ChildOutcome, ChildOutcomes, ResponseData, ResponseMap, StepResponse,
};
pub use status::Status;
pub use step_type::{StepCategory, StepType};
