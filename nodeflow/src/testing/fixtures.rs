//! Plan builders and a registry of mock steps.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::mocks::{
    BarrierAsyncStep, EchoTaskStep, FailingStep, ForkStep, PanickingStep,
    RecordingTaskChainStep, SequenceStep, SucceedingStep,
};
use crate::core::{StepCategory, StepType};
use crate::plan::{Plan, PlanNode};
use crate::steps::{RegisteredStep, StepKind, StepRegistry};

/// Step type names registered by [`TestSteps`].
pub mod types {
    /// Sequential container ([`SequenceStep`](super::SequenceStep)).
    pub const SEQUENCE: &str = "SEQUENCE";
    /// Parallel container ([`ForkStep`](super::ForkStep)).
    pub const FORK: &str = "FORK";
    /// [`SucceedingStep`](super::SucceedingStep).
    pub const SUCCEED: &str = "SUCCEED";
    /// [`FailingStep`](super::FailingStep).
    pub const FAIL: &str = "FAIL";
    /// [`PanickingStep`](super::PanickingStep).
    pub const PANIC: &str = "PANIC";
    /// [`EchoTaskStep`](super::EchoTaskStep).
    pub const TASK: &str = "TASK";
    /// [`RecordingTaskChainStep`](super::RecordingTaskChainStep).
    pub const TASK_CHAIN: &str = "TASK_CHAIN";
    /// [`BarrierAsyncStep`](super::BarrierAsyncStep).
    pub const BARRIER: &str = "BARRIER";
}

/// The mock steps behind a test registry, kept for inspection.
#[derive(Debug)]
pub struct TestSteps {
    /// Sync step that succeeds.
    pub succeed: Arc<SucceedingStep>,
    /// Sync step that fails.
    pub fail: Arc<FailingStep>,
    /// Task step.
    pub task: Arc<EchoTaskStep>,
    /// Three-link task chain.
    pub chain: Arc<RecordingTaskChainStep>,
    /// Async barrier step with an abort hook.
    pub barrier: Arc<BarrierAsyncStep>,
    /// Parallel container.
    pub fork: Arc<ForkStep>,
}

impl Default for TestSteps {
    fn default() -> Self {
        Self::new()
    }
}

impl TestSteps {
    /// Creates fresh mock steps.
    #[must_use]
    pub fn new() -> Self {
        Self {
            succeed: Arc::new(SucceedingStep::new()),
            fail: Arc::new(FailingStep::new()),
            task: Arc::new(EchoTaskStep),
            chain: Arc::new(RecordingTaskChainStep::new(3)),
            barrier: Arc::new(BarrierAsyncStep::new()),
            fork: Arc::new(ForkStep::new()),
        }
    }

    /// Builds a registry with every mock step registered.
    #[must_use]
    pub fn registry(&self) -> Arc<StepRegistry> {
        let registry = StepRegistry::new();
        let sequence = Arc::new(SequenceStep);
        for category in [
            StepCategory::Pipeline,
            StepCategory::Stage,
            StepCategory::StepGroup,
        ] {
            registry.register_child_chain(StepType::new(types::SEQUENCE, category), sequence.clone());
        }
        registry.register_child(
            StepType::new(types::FORK, StepCategory::Fork),
            self.fork.clone(),
        );
        registry.register_sync(StepType::step(types::SUCCEED), self.succeed.clone());
        registry.register_sync(StepType::step(types::FAIL), self.fail.clone());
        registry.register_sync(StepType::step(types::PANIC), Arc::new(PanickingStep));
        registry.register_task(StepType::step(types::TASK), self.task.clone());
        registry.register_task_chain(StepType::step(types::TASK_CHAIN), self.chain.clone());
        registry.register(
            StepType::step(types::BARRIER),
            RegisteredStep::new(StepKind::Async(self.barrier.clone()))
                .with_abort(self.barrier.clone()),
        );
        Arc::new(registry)
    }
}

/// Creates a leaf step whose setup id doubles as its identifier.
#[must_use]
pub fn step(setup_id: &str, step_type: &str) -> PlanNode {
    PlanNode::new(setup_id, setup_id, StepType::step(step_type))
}

fn container(setup_id: &str, type_name: &str, category: StepCategory, children: &[&str]) -> PlanNode {
    PlanNode::new(setup_id, setup_id, StepType::new(type_name, category))
        .with_parameters(serde_json::json!({ "children": children }))
}

/// Creates a step group running `children` in order.
#[must_use]
pub fn step_group(setup_id: &str, children: &[&str]) -> PlanNode {
    container(setup_id, types::SEQUENCE, StepCategory::StepGroup, children)
}

/// Creates a stage running `children` in order.
#[must_use]
pub fn stage(setup_id: &str, children: &[&str]) -> PlanNode {
    container(setup_id, types::SEQUENCE, StepCategory::Stage, children)
}

/// Creates a fork running `children` concurrently.
#[must_use]
pub fn fork(setup_id: &str, children: &[&str]) -> PlanNode {
    container(setup_id, types::FORK, StepCategory::Fork, children)
}

/// Creates a pipeline root running `children` in order.
#[must_use]
pub fn pipeline(setup_id: &str, children: &[&str]) -> PlanNode {
    container(setup_id, types::SEQUENCE, StepCategory::Pipeline, children)
}

/// Wraps `steps` in a `pipeline` → `stage` hierarchy running them in order.
/// `extra` nodes (children of containers among `steps`, rollback sections)
/// are added to the plan without being run by the stage.
#[must_use]
pub fn staged_plan(stage_node: PlanNode, steps: Vec<PlanNode>, extra: Vec<PlanNode>) -> Plan {
    let stage_id = stage_node.setup_id.clone();
    let mut nodes = vec![pipeline("pipeline", &[stage_id.as_str()]), stage_node];
    nodes.extend(steps);
    nodes.extend(extra);
    Plan::new("test_plan", "pipeline", nodes)
}

/// Creates a plan whose root is a single node.
#[must_use]
pub fn single_node_plan(node: PlanNode) -> Plan {
    let start = node.setup_id.clone();
    Plan::new("test_plan", start, [node])
}

/// Polls `condition` until it holds, for at most five seconds.
pub async fn eventually<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let poll = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), poll).await.is_ok()
}

/// Awaits `future` for at most five seconds.
///
/// # Panics
///
/// Panics if the future does not complete in time.
pub async fn within<F: Future>(future: F) -> F::Output {
    match tokio::time::timeout(Duration::from_secs(5), future).await {
        Ok(output) => output,
        Err(_) => panic!("future did not complete within five seconds"),
    }
}
