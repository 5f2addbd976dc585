//! Step type and category.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The structural category of a plan node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepCategory {
    /// A leaf step.
    Step,
    /// A single stage.
    Stage,
    /// The container of all stages.
    Stages,
    /// A group of steps.
    StepGroup,
    /// A parallel fan-out.
    Fork,
    /// The pipeline root.
    Pipeline,
    /// A looping/matrix strategy wrapper.
    Strategy,
}

impl fmt::Display for StepCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Step => "STEP",
            Self::Stage => "STAGE",
            Self::Stages => "STAGES",
            Self::StepGroup => "STEP_GROUP",
            Self::Fork => "FORK",
            Self::Pipeline => "PIPELINE",
            Self::Strategy => "STRATEGY",
        };
        f.write_str(s)
    }
}

/// Identifies a step implementation: a type name plus its category.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepType {
    /// The step type name (e.g. `HTTP`, `K8sRollingDeploy`).
    #[serde(rename = "type")]
    pub type_name: String,
    /// The step category.
    pub category: StepCategory,
}

impl StepType {
    /// Creates a new step type.
    #[must_use]
    pub fn new(type_name: impl Into<String>, category: StepCategory) -> Self {
        Self {
            type_name: type_name.into(),
            category,
        }
    }

    /// Creates a step type in the `STEP` category.
    #[must_use]
    pub fn step(type_name: impl Into<String>) -> Self {
        Self::new(type_name, StepCategory::Step)
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.type_name, self.category)
    }
}
