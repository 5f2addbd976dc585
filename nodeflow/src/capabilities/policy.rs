//! Post-execution policy validation.

use super::{CallContext, Capability};
use crate::core::{FailureData, FailureType, Status, StepResponse};
use crate::events::EventSink;
use async_trait::async_trait;
use std::sync::Arc;

/// Evaluates a step's terminal response against policy.
#[async_trait]
pub trait PolicyEvaluator: Send + Sync {
    /// Returns `Err(reason)` when the response violates policy.
    async fn evaluate(&self, call: &CallContext<'_>, response: &StepResponse) -> Result<(), String>;
}

/// Fails successful step responses that violate policy.
pub struct PolicyValidationCapability {
    evaluator: Arc<dyn PolicyEvaluator>,
    sink: Option<Arc<dyn EventSink>>,
}

impl PolicyValidationCapability {
    /// Creates the capability.
    #[must_use]
    pub fn new(evaluator: Arc<dyn PolicyEvaluator>) -> Self {
        Self {
            evaluator,
            sink: None,
        }
    }

    /// Publishes `policy.violation` events to `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }
}

#[async_trait]
impl Capability for PolicyValidationCapability {
    fn name(&self) -> &str {
        "policy_validation"
    }

    fn priority(&self) -> i32 {
        100
    }

    async fn after(&self, call: &CallContext<'_>, response: StepResponse) -> StepResponse {
        if !response.is_success() {
            return response;
        }
        let Err(reason) = self.evaluator.evaluate(call, &response).await else {
            return response;
        };

        tracing::info!(
            runtime_id = call.runtime_id(),
            reason = %reason,
            "Step response rejected by policy"
        );
        if let Some(sink) = &self.sink {
            sink.try_emit(
                "policy.violation",
                Some(serde_json::json!({
                    "runtime_id": call.runtime_id(),
                    "reason": reason,
                })),
            );
        }

        let mut failed = response;
        failed.status = Status::Failed;
        failed.failures.push(FailureData::with_types(
            reason,
            [FailureType::PolicyEvaluationFailure],
        ));
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ambiance::Ambiance;
    use crate::core::StepType;
    use crate::events::CollectingEventSink;
    use crate::steps::StepParameters;

    struct DenyOutcome(&'static str);

    #[async_trait]
    impl PolicyEvaluator for DenyOutcome {
        async fn evaluate(
            &self,
            _call: &CallContext<'_>,
            response: &StepResponse,
        ) -> Result<(), String> {
            if response.outcomes.contains_key(self.0) {
                return Err(format!("outcome '{}' is not allowed", self.0));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_violation_fails_response() {
        let sink = Arc::new(CollectingEventSink::new());
        let capability =
            PolicyValidationCapability::new(Arc::new(DenyOutcome("secret"))).with_sink(sink.clone());

        let ambiance = Ambiance::new("pe1", "plan1");
        let params = StepParameters::default();
        let step_type = StepType::step("SHELL");
        let call = CallContext {
            ambiance: &ambiance,
            params: &params,
            step_type: &step_type,
            callback: "execute_sync",
        };

        let allowed = capability.after(&call, StepResponse::succeeded()).await;
        assert_eq!(allowed.status, Status::Succeeded);

        let denied = capability
            .after(
                &call,
                StepResponse::succeeded().with_outcome("secret", serde_json::json!("x")),
            )
            .await;
        assert_eq!(denied.status, Status::Failed);
        assert!(denied.failures[0]
            .failure_types
            .contains(&FailureType::PolicyEvaluationFailure));
        assert_eq!(sink.events_of_type("policy.").len(), 1);
    }
}
