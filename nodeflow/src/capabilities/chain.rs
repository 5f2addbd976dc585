//! Capability chain applied around every step callback.

use super::security::{with_principal, Principal};
use crate::ambiance::Ambiance;
use crate::core::{FailureData, StepResponse, StepType};
use crate::steps::StepParameters;
use async_trait::async_trait;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Describes the step callback being invoked.
#[derive(Debug, Clone, Copy)]
pub struct CallContext<'a> {
    /// Ambiance of the node.
    pub ambiance: &'a Ambiance,
    /// Parameters of the node.
    pub params: &'a StepParameters,
    /// Step type of the node.
    pub step_type: &'a StepType,
    /// Name of the callback (`execute_sync`, `finalize_execution`, ...).
    pub callback: &'static str,
}

impl CallContext<'_> {
    /// Returns the runtime id of the node, or an empty string.
    #[must_use]
    pub fn runtime_id(&self) -> &str {
        self.ambiance.current_runtime_id().unwrap_or_default()
    }
}

/// A cross-cutting concern applied uniformly to every step kind.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Returns the capability name used in logs.
    fn name(&self) -> &str;

    /// Returns the capability's priority (lower = earlier `before`).
    fn priority(&self) -> i32 {
        0
    }

    /// Returns the principal to scope the callback under.
    fn principal(&self, _call: &CallContext<'_>) -> Option<Principal> {
        None
    }

    /// Called before every step callback.
    ///
    /// Returning an error fails the callback without running it.
    async fn before(&self, _call: &CallContext<'_>) -> Result<(), FailureData> {
        Ok(())
    }

    /// Called on every terminal step response, successful or not.
    async fn after(&self, _call: &CallContext<'_>, response: StepResponse) -> StepResponse {
        response
    }
}

/// An ordered chain of capabilities.
#[derive(Clone, Default)]
pub struct CapabilityChain {
    capabilities: Vec<Arc<dyn Capability>>,
}

impl CapabilityChain {
    /// Creates a new empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a capability to the chain.
    pub fn add(&mut self, capability: Arc<dyn Capability>) {
        self.capabilities.push(capability);
        self.capabilities.sort_by_key(|c| c.priority());
    }

    /// Adds a capability, builder style.
    #[must_use]
    pub fn with(mut self, capability: Arc<dyn Capability>) -> Self {
        self.add(capability);
        self
    }

    /// Runs a step callback inside the chain.
    ///
    /// `before` hooks run in priority order, then the callback runs scoped
    /// under the first principal any capability provides. Errors and panics
    /// from the callback are captured as [`FailureData`].
    pub async fn invoke<T, F>(&self, call: &CallContext<'_>, callback: F) -> Result<T, FailureData>
    where
        F: Future<Output = anyhow::Result<T>> + Send,
    {
        for capability in &self.capabilities {
            if let Err(failure) = capability.before(call).await {
                tracing::debug!(
                    capability = capability.name(),
                    runtime_id = call.runtime_id(),
                    callback = call.callback,
                    "Capability rejected step callback"
                );
                return Err(failure);
            }
        }

        let principal = self.capabilities.iter().find_map(|c| c.principal(call));
        let guarded = AssertUnwindSafe(callback).catch_unwind();
        match with_principal(principal, guarded).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(FailureData::from_error(&error)),
            Err(panic) => {
                tracing::warn!(
                    runtime_id = call.runtime_id(),
                    callback = call.callback,
                    "Step callback panicked"
                );
                Err(FailureData::from_panic(panic.as_ref()))
            }
        }
    }

    /// Runs `after` hooks over a terminal response, in reverse order.
    pub async fn complete(&self, call: &CallContext<'_>, mut response: StepResponse) -> StepResponse {
        for capability in self.capabilities.iter().rev() {
            response = capability.after(call, response).await;
        }
        response
    }

    /// Iterates over the capabilities in priority order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Capability>> {
        self.capabilities.iter()
    }

    /// Returns the number of capabilities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    /// Returns true if the chain is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }
}

impl std::fmt::Debug for CapabilityChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.capabilities.iter().map(|c| c.name().to_string()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{FailureType, Status, StepCategory};
    use parking_lot::Mutex;

    struct RecordingCapability {
        name: String,
        priority: i32,
        log: Arc<Mutex<Vec<String>>>,
        reject: bool,
    }

    impl RecordingCapability {
        fn new(name: &str, priority: i32, log: Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name: name.to_string(),
                priority,
                log,
                reject: false,
            }
        }
    }

    #[async_trait]
    impl Capability for RecordingCapability {
        fn name(&self) -> &str {
            &self.name
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        async fn before(&self, _call: &CallContext<'_>) -> Result<(), FailureData> {
            self.log.lock().push(format!("before:{}", self.name));
            if self.reject {
                return Err(FailureData::with_types(
                    "rejected",
                    [FailureType::AuthorizationError],
                ));
            }
            Ok(())
        }

        async fn after(&self, _call: &CallContext<'_>, response: StepResponse) -> StepResponse {
            self.log.lock().push(format!("after:{}", self.name));
            response
        }
    }

    fn fixtures() -> (Ambiance, StepParameters, StepType) {
        (
            Ambiance::new("pe1", "plan1"),
            StepParameters::new("step1", serde_json::json!({})),
            StepType::new("HTTP", StepCategory::Step),
        )
    }

    #[tokio::test]
    async fn test_chain_ordering() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = CapabilityChain::new()
            .with(Arc::new(RecordingCapability::new("late", 10, log.clone())))
            .with(Arc::new(RecordingCapability::new("early", -5, log.clone())));
        assert_eq!(chain.len(), 2);

        let (ambiance, params, step_type) = fixtures();
        let call = CallContext {
            ambiance: &ambiance,
            params: &params,
            step_type: &step_type,
            callback: "execute_sync",
        };

        let value = chain.invoke(&call, async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
        chain.complete(&call, StepResponse::succeeded()).await;

        assert_eq!(
            *log.lock(),
            vec!["before:early", "before:late", "after:late", "after:early"]
        );
    }

    #[tokio::test]
    async fn test_before_rejection_skips_callback() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut rejecting = RecordingCapability::new("gate", 0, log.clone());
        rejecting.reject = true;
        let chain = CapabilityChain::new().with(Arc::new(rejecting));

        let (ambiance, params, step_type) = fixtures();
        let call = CallContext {
            ambiance: &ambiance,
            params: &params,
            step_type: &step_type,
            callback: "execute_sync",
        };

        let ran = Arc::new(Mutex::new(false));
        let ran_clone = ran.clone();
        let result = chain
            .invoke(&call, async move {
                *ran_clone.lock() = true;
                Ok(())
            })
            .await;

        let failure = result.unwrap_err();
        assert!(failure.failure_types.contains(&FailureType::AuthorizationError));
        assert!(!*ran.lock());
    }

    #[tokio::test]
    async fn test_errors_and_panics_become_failure_data() {
        let chain = CapabilityChain::new();
        let (ambiance, params, step_type) = fixtures();
        let call = CallContext {
            ambiance: &ambiance,
            params: &params,
            step_type: &step_type,
            callback: "handle_task_result",
        };

        let err = chain
            .invoke::<(), _>(&call, async { Err(anyhow::anyhow!("bad gateway")) })
            .await
            .unwrap_err();
        assert_eq!(err.message, "bad gateway");

        let panicked = chain
            .invoke::<(), _>(&call, async {
                if ambiance.levels().is_empty() {
                    panic!("exploded");
                }
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(panicked.message.contains("exploded"));

        let response = chain
            .complete(&call, StepResponse::failed(err))
            .await;
        assert_eq!(response.status, Status::Failed);
    }
}
