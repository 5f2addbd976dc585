//! Error types for the nodeflow engine.
//!
//! Errors here describe engine and contract problems. Step-logic failures are
//! not errors at this level: they are captured as
//! [`FailureData`](crate::core::FailureData) on the node and flow through the
//! failure-strategy resolver instead.

use crate::core::{FailureType, Status};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;

/// The main error type for nodeflow operations.
#[derive(Debug, Error)]
pub enum NodeflowError {
    /// A structurally invalid request or value was constructed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// No node execution exists for the runtime id.
    #[error("Node execution not found: {0}")]
    NodeNotFound(String),

    /// No plan execution exists for the id.
    #[error("Plan execution not found: {0}")]
    PlanExecutionNotFound(String),

    /// No step implementation is registered for the step type.
    #[error("No step registered for type {0}")]
    StepNotRegistered(String),

    /// A status transition was rejected.
    #[error("{0}")]
    IllegalTransition(#[from] IllegalTransitionError),

    /// A plan failed validation.
    #[error("{0}")]
    PlanValidation(#[from] PlanValidationError),

    /// A correlated response carried an error.
    #[error("{0}")]
    Response(#[from] ResponseError),

    /// Handing a task to the task executor failed.
    #[error("{0}")]
    Dispatch(#[from] DispatchError),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The engine is no longer accepting work.
    #[error("Engine is shut down")]
    ShutDown,

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl NodeflowError {
    /// Creates an invalid request error.
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }
}

/// Error raised when a status update is not a legal transition.
#[derive(Debug, Clone, Error)]
#[error("Illegal status transition for node '{runtime_id}': {from} -> {to}")]
pub struct IllegalTransitionError {
    /// The node runtime id.
    pub runtime_id: String,
    /// The current status.
    pub from: Status,
    /// The requested status.
    pub to: Status,
}

impl IllegalTransitionError {
    /// Creates a new illegal transition error.
    #[must_use]
    pub fn new(runtime_id: impl Into<String>, from: Status, to: Status) -> Self {
        Self {
            runtime_id: runtime_id.into(),
            from,
            to,
        }
    }
}

/// Metadata about a plan validation error for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContractErrorInfo {
    /// Error code (e.g., "PLAN-002-MISSING_NODE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
}

impl ContractErrorInfo {
    /// Creates a new contract error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }
}

/// Error raised when a plan fails validation.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PlanValidationError {
    /// The error message.
    pub message: String,
    /// The plan nodes involved in the error.
    pub nodes: Vec<String>,
    /// Optional contract error info.
    pub error_info: Option<ContractErrorInfo>,
}

impl PlanValidationError {
    /// Creates a new plan validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            nodes: Vec::new(),
            error_info: None,
        }
    }

    /// Sets the nodes involved.
    #[must_use]
    pub fn with_nodes(mut self, nodes: Vec<String>) -> Self {
        self.nodes = nodes;
        self
    }

    /// Sets the contract error info.
    #[must_use]
    pub fn with_error_info(mut self, info: ContractErrorInfo) -> Self {
        self.error_info = Some(info);
        self
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("message".to_string(), serde_json::json!(self.message));
        map.insert("nodes".to_string(), serde_json::json!(self.nodes));
        if let Some(ref info) = self.error_info {
            map.insert("code".to_string(), serde_json::json!(info.code));
            if let Some(ref hint) = info.fix_hint {
                map.insert("fix_hint".to_string(), serde_json::json!(hint));
            }
        }
        map
    }
}

/// Error surfaced when a step reads a correlated response that carries a
/// failure, or reads a response that never arrived.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct ResponseError {
    /// The error message.
    pub message: String,
    /// Failure types carried by the response.
    pub failure_types: BTreeSet<FailureType>,
}

impl ResponseError {
    /// Creates a new response error.
    #[must_use]
    pub fn new(message: impl Into<String>, failure_types: BTreeSet<FailureType>) -> Self {
        Self {
            message: message.into(),
            failure_types,
        }
    }

    /// Creates the error returned when no response was delivered.
    #[must_use]
    pub fn missing() -> Self {
        Self::new("No response data was delivered", BTreeSet::from([FailureType::Unknown]))
    }
}

/// Error raised when the task executor rejects or fails to accept a task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Failed to dispatch task '{task_type}': {reason}")]
pub struct DispatchError {
    /// The task type.
    pub task_type: String,
    /// The failure reason.
    pub reason: String,
    /// Whether dispatch may be retried.
    pub retryable: bool,
}

impl DispatchError {
    /// Creates a retryable dispatch error.
    #[must_use]
    pub fn retryable(task_type: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            reason: reason.into(),
            retryable: true,
        }
    }

    /// Creates a permanent dispatch error.
    #[must_use]
    pub fn permanent(task_type: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            reason: reason.into(),
            retryable: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_validation_error_to_dict() {
        let err = PlanValidationError::new("Unknown node")
            .with_nodes(vec!["step1".to_string()])
            .with_error_info(
                ContractErrorInfo::new("PLAN-002-MISSING_NODE", "Unknown node")
                    .with_fix_hint("Add the node to the plan"),
            );

        let dict = err.to_dict();
        assert_eq!(dict.get("message").unwrap(), "Unknown node");
        assert_eq!(dict.get("code").unwrap(), "PLAN-002-MISSING_NODE");
        assert_eq!(dict.get("nodes").unwrap(), &serde_json::json!(["step1"]));
    }

    #[test]
    fn test_illegal_transition_message() {
        let err = IllegalTransitionError::new("n1", Status::Succeeded, Status::Running);
        assert_eq!(
            err.to_string(),
            "Illegal status transition for node 'n1': SUCCEEDED -> RUNNING"
        );
    }

    #[test]
    fn test_response_error_missing() {
        let err = ResponseError::missing();
        assert!(err.failure_types.contains(&FailureType::Unknown));
    }

    #[test]
    fn test_dispatch_error_into_nodeflow_error() {
        let err: NodeflowError = DispatchError::retryable("HTTP", "no delegate").into();
        assert!(matches!(err, NodeflowError::Dispatch(ref e) if e.retryable));
        assert!(err.to_string().contains("no delegate"));
    }
}
