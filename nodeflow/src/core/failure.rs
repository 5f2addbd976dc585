//! Failure types and captured failure data.

use crate::errors::ResponseError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Classification of a node failure, used to match failure strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureType {
    /// Matches every failure type.
    AllErrors,
    /// Unclassified failure.
    Unknown,
    /// Failure reported by the step's own logic.
    ApplicationError,
    /// Credentials were rejected.
    AuthenticationError,
    /// The principal lacks a permission.
    AuthorizationError,
    /// A remote endpoint could not be reached.
    ConnectivityError,
    /// The node or a task exceeded its deadline.
    TimeoutError,
    /// No delegate could accept the task.
    DelegateProvisioning,
    /// A policy evaluation rejected the step outcome.
    PolicyEvaluationFailure,
    /// A verification step failed.
    VerificationFailure,
    /// A manual input timed out.
    InputTimeoutFailure,
    /// An approval was rejected.
    ApprovalRejection,
    /// A user marked the node as failed.
    UserMarkedFailure,
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = serde_json::to_value(self).map_err(|_| fmt::Error)?;
        f.write_str(value.as_str().unwrap_or_default())
    }
}

/// A captured failure: message plus the failure types it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureData {
    /// Human-readable failure message.
    pub message: String,
    /// Failure classification.
    #[serde(default)]
    pub failure_types: BTreeSet<FailureType>,
    /// Optional machine-readable error code.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl FailureData {
    /// Creates failure data with the `APPLICATION_ERROR` type.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            failure_types: BTreeSet::from([FailureType::ApplicationError]),
            code: None,
        }
    }

    /// Creates failure data with an explicit type set.
    #[must_use]
    pub fn with_types(
        message: impl Into<String>,
        failure_types: impl IntoIterator<Item = FailureType>,
    ) -> Self {
        Self {
            message: message.into(),
            failure_types: failure_types.into_iter().collect(),
            code: None,
        }
    }

    /// Creates failure data for an expired node.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::with_types(message, [FailureType::TimeoutError])
    }

    /// Adds a failure type.
    #[must_use]
    pub fn and_type(mut self, failure_type: FailureType) -> Self {
        self.failure_types.insert(failure_type);
        self
    }

    /// Sets the error code.
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Captures an error returned from a step callback.
    ///
    /// A [`ResponseError`] anywhere in the chain keeps its failure types, so a
    /// step that propagates a failed task response with `?` reports the
    /// response's classification.
    #[must_use]
    pub fn from_error(error: &anyhow::Error) -> Self {
        if let Some(response) = error.chain().find_map(|e| e.downcast_ref::<ResponseError>()) {
            return Self::with_types(format!("{error:#}"), response.failure_types.clone());
        }
        Self::with_types(format!("{error:#}"), [FailureType::ApplicationError])
    }

    /// Captures a panic payload from a step callback.
    #[must_use]
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "step panicked".to_string());
        Self::with_types(format!("step panicked: {message}"), [FailureType::Unknown])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_type_display() {
        assert_eq!(FailureType::AllErrors.to_string(), "ALL_ERRORS");
        assert_eq!(FailureType::DelegateProvisioning.to_string(), "DELEGATE_PROVISIONING");
    }

    #[test]
    fn test_failure_data_from_error() {
        let err = anyhow::anyhow!("connection refused");
        let data = FailureData::from_error(&err);
        assert_eq!(data.message, "connection refused");
        assert!(data.failure_types.contains(&FailureType::ApplicationError));
    }

    #[test]
    fn test_failure_data_keeps_response_types() {
        let response = ResponseError::new(
            "delegate unavailable",
            BTreeSet::from([FailureType::DelegateProvisioning]),
        );
        let err = anyhow::Error::new(response).context("while handling task result");
        let data = FailureData::from_error(&err);

        assert_eq!(
            data.failure_types,
            BTreeSet::from([FailureType::DelegateProvisioning])
        );
        assert!(data.message.contains("delegate unavailable"));
    }

    #[test]
    fn test_failure_data_from_panic() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        let data = FailureData::from_panic(payload.as_ref());
        assert_eq!(data.message, "step panicked: boom");
        assert!(data.failure_types.contains(&FailureType::Unknown));
    }
}
