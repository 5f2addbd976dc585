//! Step responses and correlated response payloads.

use super::{FailureData, Status};
use crate::errors::ResponseError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// The terminal result of a step strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResponse {
    /// The status the node should reach.
    pub status: Status,
    /// Captured failures, empty on success.
    #[serde(default)]
    pub failures: Vec<FailureData>,
    /// Named outcomes published by the step.
    #[serde(default)]
    pub outcomes: HashMap<String, serde_json::Value>,
}

impl StepResponse {
    /// Creates a response with the given status.
    #[must_use]
    pub fn new(status: Status) -> Self {
        Self {
            status,
            failures: Vec::new(),
            outcomes: HashMap::new(),
        }
    }

    /// Creates a successful response.
    #[must_use]
    pub fn succeeded() -> Self {
        Self::new(Status::Succeeded)
    }

    /// Creates a skipped response.
    #[must_use]
    pub fn skipped() -> Self {
        Self::new(Status::Skipped)
    }

    /// Creates a failed response carrying one failure.
    #[must_use]
    pub fn failed(failure: FailureData) -> Self {
        Self {
            status: Status::Failed,
            failures: vec![failure],
            outcomes: HashMap::new(),
        }
    }

    /// Adds a named outcome.
    #[must_use]
    pub fn with_outcome(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.outcomes.insert(name.into(), value);
        self
    }

    /// Adds a failure.
    #[must_use]
    pub fn with_failure(mut self, failure: FailureData) -> Self {
        self.failures.push(failure);
        self
    }

    /// Returns true if the response is a success-like terminal status.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_positive()
    }

    /// Returns true if the response represents a broken node.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.status.is_broke()
    }
}

/// The terminal outcome of a child node, delivered to its parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildOutcome {
    /// Runtime id of the child node.
    pub runtime_id: String,
    /// Setup id of the child's plan node.
    pub setup_id: String,
    /// Identifier of the child's plan node.
    pub identifier: String,
    /// Terminal status of the child.
    pub status: Status,
    /// Failures recorded on the child.
    #[serde(default)]
    pub failures: Vec<FailureData>,
}

/// A response delivered against a wait-id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponseData {
    /// Result payload of an external task or async callback.
    Task {
        /// The payload.
        payload: serde_json::Value,
    },
    /// The external executor reported a failure.
    Error {
        /// The failure message.
        message: String,
        /// Failure classification.
        #[serde(default)]
        failure_types: BTreeSet<super::FailureType>,
    },
    /// A child node reached a terminal status.
    Child(ChildOutcome),
}

impl ResponseData {
    /// Creates a task payload response.
    #[must_use]
    pub fn task(payload: serde_json::Value) -> Self {
        Self::Task { payload }
    }

    /// Creates an error response.
    #[must_use]
    pub fn error(
        message: impl Into<String>,
        failure_types: impl IntoIterator<Item = super::FailureType>,
    ) -> Self {
        Self::Error {
            message: message.into(),
            failure_types: failure_types.into_iter().collect(),
        }
    }

    /// Returns the payload, or the carried error.
    pub fn payload(&self) -> Result<serde_json::Value, ResponseError> {
        match self {
            Self::Task { payload } => Ok(payload.clone()),
            Self::Error {
                message,
                failure_types,
            } => Err(ResponseError::new(message.clone(), failure_types.clone())),
            Self::Child(outcome) => serde_json::to_value(outcome).map_err(|e| {
                ResponseError::new(e.to_string(), BTreeSet::from([super::FailureType::Unknown]))
            }),
        }
    }

    /// Returns the child outcome, if this is a child response.
    #[must_use]
    pub fn as_child(&self) -> Option<&ChildOutcome> {
        match self {
            Self::Child(outcome) => Some(outcome),
            _ => None,
        }
    }
}

/// Responses keyed by wait-id, ordered for deterministic iteration.
pub type ResponseMap = BTreeMap<String, ResponseData>;

/// Child outcomes keyed by child runtime id.
pub type ChildOutcomes = BTreeMap<String, ChildOutcome>;

/// Extracts the child outcomes out of a response map, dropping other kinds.
#[must_use]
pub fn child_outcomes(responses: &ResponseMap) -> ChildOutcomes {
    responses
        .values()
        .filter_map(ResponseData::as_child)
        .map(|outcome| (outcome.runtime_id.clone(), outcome.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::FailureType;

    #[test]
    fn test_step_response_builders() {
        let response = StepResponse::succeeded().with_outcome("url", serde_json::json!("x"));
        assert!(response.is_success());
        assert_eq!(response.outcomes["url"], serde_json::json!("x"));

        let failed = StepResponse::failed(FailureData::new("bad"));
        assert!(failed.is_failure());
        assert_eq!(failed.failures.len(), 1);
    }

    #[test]
    fn test_response_data_payload() {
        let ok = ResponseData::task(serde_json::json!({"code": 200}));
        assert_eq!(ok.payload().unwrap()["code"], 200);

        let err = ResponseData::error("delegate lost", [FailureType::ConnectivityError]);
        let e = err.payload().unwrap_err();
        assert_eq!(e.message, "delegate lost");
        assert!(e.failure_types.contains(&FailureType::ConnectivityError));
    }

    #[test]
    fn test_response_data_tagged_serialization() {
        let json = serde_json::to_value(ResponseData::task(serde_json::json!(1))).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "task", "payload": 1}));
    }

    #[test]
    fn test_child_outcomes_extraction() {
        let mut responses = ResponseMap::new();
        responses.insert(
            "c1".to_string(),
            ResponseData::Child(ChildOutcome {
                runtime_id: "c1".to_string(),
                setup_id: "s1".to_string(),
                identifier: "step1".to_string(),
                status: Status::Succeeded,
                failures: Vec::new(),
            }),
        );
        responses.insert("w1".to_string(), ResponseData::task(serde_json::json!(null)));

        let outcomes = child_outcomes(&responses);
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes["c1"].status, Status::Succeeded);
    }
}
