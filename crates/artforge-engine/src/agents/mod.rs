mod director;
mod prompts;
mod roles;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use director::{ChainInput, ChainResult, ChainStep, Director, DirectorSettings};
pub use roles::{
    default_roles, AgentRole, CharacterGenerator, Critic, Ideator, MetadataGenerator, Refiner,
    Stylist,
};

/// What the director does when a step's transformation fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop the chain and report the step as the failure.
    PropagateOnFailure,
    /// Continue with the untransformed input and log the substitution.
    SubstituteOnFailure,
}

impl FailurePolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "propagate" | "propagate_on_failure" => Some(FailurePolicy::PropagateOnFailure),
            "substitute" | "substitute_on_failure" => Some(FailurePolicy::SubstituteOnFailure),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailurePolicy::PropagateOnFailure => "propagate",
            FailurePolicy::SubstituteOnFailure => "substitute",
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
