//! Publishes rollback information when a step fails.

use super::{CallContext, Capability};
use crate::core::StepResponse;
use crate::events::EventSink;
use async_trait::async_trait;
use std::sync::Arc;

/// Emits a `rollback.info` event for every failed step response.
///
/// The event carries the addressing a rollback collaborator needs to find the
/// failed node and its enclosing stage.
pub struct RollbackInfoCapability {
    sink: Arc<dyn EventSink>,
}

impl RollbackInfoCapability {
    /// Creates the capability publishing to `sink`.
    #[must_use]
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl Capability for RollbackInfoCapability {
    fn name(&self) -> &str {
        "rollback_info"
    }

    async fn after(&self, call: &CallContext<'_>, response: StepResponse) -> StepResponse {
        if response.is_failure() {
            let stage = call.ambiance.stage_level().map(|l| l.identifier.clone());
            self.sink
                .emit(
                    "rollback.info",
                    Some(serde_json::json!({
                        "plan_execution_id": call.ambiance.plan_execution_id(),
                        "runtime_id": call.runtime_id(),
                        "fqn": call.ambiance.fqn(),
                        "stage": stage,
                        "step_type": call.step_type.to_string(),
                        "failures": response.failures,
                    })),
                )
                .await;
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ambiance::{Ambiance, Level};
    use crate::core::{FailureData, StepCategory, StepType};
    use crate::events::CollectingEventSink;
    use crate::steps::StepParameters;

    #[tokio::test]
    async fn test_publishes_only_on_failure() {
        let sink = Arc::new(CollectingEventSink::new());
        let capability = RollbackInfoCapability::new(sink.clone());

        let ambiance = Ambiance::new("pe1", "plan1")
            .clone_for_child(Level::new(
                "s-stage",
                "r-stage",
                "deploy",
                StepType::new("DEPLOY", StepCategory::Stage),
            ))
            .clone_for_child(Level::new("s-step", "r-step", "apply", StepType::step("K8S")));
        let params = StepParameters::default();
        let step_type = StepType::step("K8S");
        let call = CallContext {
            ambiance: &ambiance,
            params: &params,
            step_type: &step_type,
            callback: "handle_task_result",
        };

        capability.after(&call, StepResponse::succeeded()).await;
        assert!(sink.is_empty());

        capability
            .after(&call, StepResponse::failed(FailureData::new("apply failed")))
            .await;
        let events = sink.events_of_type("rollback.");
        assert_eq!(events.len(), 1);
        let data = events[0].data.clone().unwrap();
        assert_eq!(data["runtime_id"], "r-step");
        assert_eq!(data["stage"], "deploy");
    }
}
