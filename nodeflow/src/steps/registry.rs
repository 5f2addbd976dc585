//! Registry of step implementations keyed by step type.

use super::kinds::{
    Abortable, AsyncExecutable, ChildChainExecutable, ChildExecutable, StepKind, SyncExecutable,
    TaskChainExecutable, TaskExecutable,
};
use crate::capabilities::{Capability, CapabilityChain};
use crate::core::StepType;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// A step implementation plus its abort hook and capabilities.
#[derive(Clone)]
pub struct RegisteredStep {
    /// The step implementation.
    pub kind: StepKind,
    /// Hook run when the node is aborted or expires.
    pub abort: Option<Arc<dyn Abortable>>,
    /// Capabilities wrapped around every callback of this step.
    pub capabilities: CapabilityChain,
}

impl RegisteredStep {
    /// Creates a registration with no abort hook and no capabilities.
    #[must_use]
    pub fn new(kind: StepKind) -> Self {
        Self {
            kind,
            abort: None,
            capabilities: CapabilityChain::new(),
        }
    }

    /// Sets the abort hook.
    #[must_use]
    pub fn with_abort(mut self, abort: Arc<dyn Abortable>) -> Self {
        self.abort = Some(abort);
        self
    }

    /// Adds a capability.
    #[must_use]
    pub fn with_capability(mut self, capability: Arc<dyn Capability>) -> Self {
        self.capabilities.add(capability);
        self
    }
}

impl std::fmt::Debug for RegisteredStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredStep")
            .field("kind", &self.kind)
            .field("abortable", &self.abort.is_some())
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

/// Registry of step implementations.
///
/// Capabilities registered with [`add_capability`](Self::add_capability)
/// apply to every step registered afterwards.
#[derive(Default)]
pub struct StepRegistry {
    steps: RwLock<HashMap<StepType, RegisteredStep>>,
    shared_capabilities: RwLock<CapabilityChain>,
}

impl StepRegistry {
    /// Creates a new empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a capability applied to all subsequently registered steps.
    pub fn add_capability(&self, capability: Arc<dyn Capability>) {
        self.shared_capabilities.write().add(capability);
    }

    /// Registers a fully configured step.
    pub fn register(&self, step_type: StepType, mut step: RegisteredStep) {
        let shared = self.shared_capabilities.read().clone();
        for capability in shared.iter() {
            step.capabilities.add(capability.clone());
        }
        tracing::debug!(step_type = %step_type, kind = step.kind.name(), "Registered step");
        self.steps.write().insert(step_type, step);
    }

    /// Registers a sync step.
    pub fn register_sync(&self, step_type: StepType, step: Arc<dyn SyncExecutable>) {
        self.register(step_type, RegisteredStep::new(StepKind::Sync(step)));
    }

    /// Registers an async step.
    pub fn register_async(&self, step_type: StepType, step: Arc<dyn AsyncExecutable>) {
        self.register(step_type, RegisteredStep::new(StepKind::Async(step)));
    }

    /// Registers a task step.
    pub fn register_task(&self, step_type: StepType, step: Arc<dyn TaskExecutable>) {
        self.register(step_type, RegisteredStep::new(StepKind::Task(step)));
    }

    /// Registers a task-chain step.
    pub fn register_task_chain(&self, step_type: StepType, step: Arc<dyn TaskChainExecutable>) {
        self.register(step_type, RegisteredStep::new(StepKind::TaskChain(step)));
    }

    /// Registers a child step.
    pub fn register_child(&self, step_type: StepType, step: Arc<dyn ChildExecutable>) {
        self.register(step_type, RegisteredStep::new(StepKind::Child(step)));
    }

    /// Registers a child-chain step.
    pub fn register_child_chain(&self, step_type: StepType, step: Arc<dyn ChildChainExecutable>) {
        self.register(step_type, RegisteredStep::new(StepKind::ChildChain(step)));
    }

    /// Looks up a registration.
    #[must_use]
    pub fn get(&self, step_type: &StepType) -> Option<RegisteredStep> {
        self.steps.read().get(step_type).cloned()
    }

    /// Returns true if a step is registered for the type.
    #[must_use]
    pub fn contains(&self, step_type: &StepType) -> bool {
        self.steps.read().contains_key(step_type)
    }

    /// Returns the registered step types.
    #[must_use]
    pub fn step_types(&self) -> Vec<StepType> {
        self.steps.read().keys().cloned().collect()
    }
}
