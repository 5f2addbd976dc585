//! Typed data passed into steps and threaded between chain links.

use crate::errors::NodeflowError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Resolved parameters of a plan node, handed read-only to step callbacks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepParameters {
    /// The node identifier.
    pub identifier: String,
    /// The node display name.
    pub name: String,
    /// The step-specific parameter document.
    #[serde(default)]
    pub spec: serde_json::Value,
    /// Node timeout in milliseconds, if configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl StepParameters {
    /// Creates parameters with the given spec document.
    #[must_use]
    pub fn new(identifier: impl Into<String>, spec: serde_json::Value) -> Self {
        let identifier = identifier.into();
        Self {
            name: identifier.clone(),
            identifier,
            spec,
            timeout_ms: None,
        }
    }

    /// Returns a field of the spec document.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.spec.get(key)
    }

    /// Deserializes the spec document into a typed struct.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the spec does not match `T`.
    pub fn spec_as<T: DeserializeOwned>(&self) -> Result<T, NodeflowError> {
        Ok(serde_json::from_value(self.spec.clone())?)
    }
}

/// Resolved inputs available to a step when it starts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepInputPackage {
    inputs: HashMap<String, serde_json::Value>,
}

impl StepInputPackage {
    /// Creates an input package from resolved values.
    #[must_use]
    pub fn new(inputs: HashMap<String, serde_json::Value>) -> Self {
        Self { inputs }
    }

    /// Gets an input by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.inputs.get(name)
    }

    /// Deserializes an input into a typed value.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` if the input is missing, or a serialization
    /// error if it does not match `T`.
    pub fn get_as<T: DeserializeOwned>(&self, name: &str) -> Result<T, NodeflowError> {
        let value = self
            .inputs
            .get(name)
            .ok_or_else(|| NodeflowError::invalid_request(format!("Missing input '{name}'")))?;
        Ok(serde_json::from_value(value.clone())?)
    }

    /// Returns true if no inputs are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }
}

/// Versioned, serializable state capsule threaded between chain links.
///
/// The capsule is owned by the node record. Each link receives the previous
/// link's capsule as its sole input and returns a replacement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassThroughData {
    version: u32,
    kind: String,
    payload: serde_json::Value,
}

impl PassThroughData {
    /// Schema version written by this build.
    pub const CURRENT_VERSION: u32 = 1;

    /// Wraps a serializable value under a kind tag.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if `value` cannot be serialized.
    pub fn new<T: Serialize>(kind: impl Into<String>, value: &T) -> Result<Self, NodeflowError> {
        Ok(Self {
            version: Self::CURRENT_VERSION,
            kind: kind.into(),
            payload: serde_json::to_value(value)?,
        })
    }

    /// Wraps a raw JSON payload under a kind tag.
    #[must_use]
    pub fn from_value(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            kind: kind.into(),
            payload,
        }
    }

    /// Returns the schema version.
    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Returns the kind tag.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Returns the raw payload.
    #[must_use]
    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    /// Decodes the payload into a typed value.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the payload does not match `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, NodeflowError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// Serializes the capsule for a checkpoint.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the payload cannot be encoded.
    pub fn to_checkpoint(&self) -> Result<String, NodeflowError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Restores a capsule from a checkpoint.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` when the checkpoint was written by a newer
    /// schema version, or a serialization error when it is malformed.
    pub fn from_checkpoint(checkpoint: &str) -> Result<Self, NodeflowError> {
        let capsule: Self = serde_json::from_str(checkpoint)?;
        if capsule.version > Self::CURRENT_VERSION {
            return Err(NodeflowError::invalid_request(format!(
                "Unsupported pass-through version {} (max {})",
                capsule.version,
                Self::CURRENT_VERSION
            )));
        }
        Ok(capsule)
    }
}

/// An outbound unit of work for the external task executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    /// The task type understood by the executor.
    pub task_type: String,
    /// Task parameters.
    #[serde(default)]
    pub parameters: serde_json::Value,
    /// Execution timeout for the task, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Delegate selectors.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selectors: Vec<String>,
}

impl TaskRequest {
    /// Creates a task request.
    #[must_use]
    pub fn new(task_type: impl Into<String>, parameters: serde_json::Value) -> Self {
        Self {
            task_type: task_type.into(),
            parameters,
            timeout_ms: None,
            selectors: Vec::new(),
        }
    }

    /// Sets the task timeout.
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Adds a delegate selector.
    #[must_use]
    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.selectors.push(selector.into());
        self
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTaskChainResponse {
    chain_end: bool,
    #[serde(default)]
    pass_through_data: Option<PassThroughData>,
    #[serde(default)]
    task_request: Option<TaskRequest>,
}

/// The result of one task-chain link.
///
/// A non-terminal link always carries a task request: the invariant is
/// checked by every constructor, including deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawTaskChainResponse")]
pub struct TaskChainResponse {
    chain_end: bool,
    pass_through_data: Option<PassThroughData>,
    task_request: Option<TaskRequest>,
}

impl TaskChainResponse {
    /// Creates a response, validating the chain invariant.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` when `chain_end` is false and no task request
    /// is given.
    pub fn new(
        chain_end: bool,
        pass_through_data: Option<PassThroughData>,
        task_request: Option<TaskRequest>,
    ) -> Result<Self, NodeflowError> {
        if !chain_end && task_request.is_none() {
            return Err(NodeflowError::invalid_request(
                "Task request cannot be null when chain end is false",
            ));
        }
        Ok(Self {
            chain_end,
            pass_through_data,
            task_request,
        })
    }

    /// Creates a non-terminal link that dispatches `request`.
    #[must_use]
    pub fn link(request: TaskRequest, pass_through_data: Option<PassThroughData>) -> Self {
        Self {
            chain_end: false,
            pass_through_data,
            task_request: Some(request),
        }
    }

    /// Creates the terminal link, optionally dispatching a final task.
    #[must_use]
    pub fn end(pass_through_data: Option<PassThroughData>, request: Option<TaskRequest>) -> Self {
        Self {
            chain_end: true,
            pass_through_data,
            task_request: request,
        }
    }

    /// Returns true if this is the last link.
    #[must_use]
    pub fn chain_end(&self) -> bool {
        self.chain_end
    }

    /// Returns the pass-through capsule.
    #[must_use]
    pub fn pass_through_data(&self) -> Option<&PassThroughData> {
        self.pass_through_data.as_ref()
    }

    /// Returns the task request.
    #[must_use]
    pub fn task_request(&self) -> Option<&TaskRequest> {
        self.task_request.as_ref()
    }

    /// Splits the response into its parts.
    #[must_use]
    pub fn into_parts(self) -> (bool, Option<PassThroughData>, Option<TaskRequest>) {
        (self.chain_end, self.pass_through_data, self.task_request)
    }
}

impl TryFrom<RawTaskChainResponse> for TaskChainResponse {
    type Error = NodeflowError;

    fn try_from(raw: RawTaskChainResponse) -> Result<Self, Self::Error> {
        Self::new(raw.chain_end, raw.pass_through_data, raw.task_request)
    }
}

/// The result of starting an async step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AsyncExecutableResponse {
    /// Wait-ids the node suspends on. All must deliver before resumption.
    pub wait_ids: Vec<String>,
    /// Deadline override for this suspension.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl AsyncExecutableResponse {
    /// Creates a response suspending on `wait_ids`.
    #[must_use]
    pub fn new<I, S>(wait_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            wait_ids: wait_ids.into_iter().map(Into::into).collect(),
            timeout_ms: None,
        }
    }

    /// Sets the suspension deadline.
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// The children a child step spawns, addressed by plan-node setup id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildExecutableResponse {
    /// Setup ids of the children. Several children run concurrently.
    pub children: Vec<String>,
}

impl ChildExecutableResponse {
    /// Spawns a single child.
    #[must_use]
    pub fn single(child_id: impl Into<String>) -> Self {
        Self {
            children: vec![child_id.into()],
        }
    }

    /// Spawns several children concurrently.
    #[must_use]
    pub fn fork<I, S>(child_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            children: child_ids.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawChildChainResponse {
    #[serde(default)]
    next_child_id: Option<String>,
    last_link: bool,
    #[serde(default)]
    pass_through_data: Option<PassThroughData>,
}

/// The result of one child-chain link.
///
/// A link that is not the last always names the next child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawChildChainResponse")]
pub struct ChildChainResponse {
    next_child_id: Option<String>,
    last_link: bool,
    pass_through_data: Option<PassThroughData>,
}

impl ChildChainResponse {
    /// Creates a response, validating the chain invariant.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` when `last_link` is false and no child id is
    /// given.
    pub fn new(
        next_child_id: Option<String>,
        last_link: bool,
        pass_through_data: Option<PassThroughData>,
    ) -> Result<Self, NodeflowError> {
        if !last_link && next_child_id.is_none() {
            return Err(NodeflowError::invalid_request(
                "Next child id cannot be null when last link is false",
            ));
        }
        Ok(Self {
            next_child_id,
            last_link,
            pass_through_data,
        })
    }

    /// Runs `child_id` and continues the chain afterwards.
    #[must_use]
    pub fn next(child_id: impl Into<String>, pass_through_data: Option<PassThroughData>) -> Self {
        Self {
            next_child_id: Some(child_id.into()),
            last_link: false,
            pass_through_data,
        }
    }

    /// Runs `child_id` and finalizes afterwards.
    #[must_use]
    pub fn last_child(
        child_id: impl Into<String>,
        pass_through_data: Option<PassThroughData>,
    ) -> Self {
        Self {
            next_child_id: Some(child_id.into()),
            last_link: true,
            pass_through_data,
        }
    }

    /// Finalizes without running another child.
    #[must_use]
    pub fn finish(pass_through_data: Option<PassThroughData>) -> Self {
        Self {
            next_child_id: None,
            last_link: true,
            pass_through_data,
        }
    }

    /// Returns the next child's setup id.
    #[must_use]
    pub fn next_child_id(&self) -> Option<&str> {
        self.next_child_id.as_deref()
    }

    /// Returns true if this is the last link.
    #[must_use]
    pub fn last_link(&self) -> bool {
        self.last_link
    }

    /// Splits the response into its parts.
    #[must_use]
    pub fn into_parts(self) -> (Option<String>, bool, Option<PassThroughData>) {
        (self.next_child_id, self.last_link, self.pass_through_data)
    }
}

impl TryFrom<RawChildChainResponse> for ChildChainResponse {
    type Error = NodeflowError;

    fn try_from(raw: RawChildChainResponse) -> Result<Self, Self::Error> {
        Self::new(raw.next_child_id, raw.last_link, raw.pass_through_data)
    }
}
