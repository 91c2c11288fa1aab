use std::fmt;

use serde::Serialize;

/// Identifies a step of the agent chain in errors and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepId {
    Ideator,
    Stylist,
    Refiner,
    CharacterGenerator,
    Critic,
    MetadataGenerator,
}

impl StepId {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepId::Ideator => "ideator",
            StepId::Stylist => "stylist",
            StepId::Refiner => "refiner",
            StepId::CharacterGenerator => "character_generator",
            StepId::Critic => "critic",
            StepId::MetadataGenerator => "metadata_generator",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "ideator" => Some(StepId::Ideator),
            "stylist" => Some(StepId::Stylist),
            "refiner" => Some(StepId::Refiner),
            "character_generator" | "character" => Some(StepId::CharacterGenerator),
            "critic" => Some(StepId::Critic),
            "metadata_generator" | "metadata" => Some(StepId::MetadataGenerator),
            _ => None,
        }
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One failed rung of the fallback ladder.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptFailure {
    pub backend: String,
    pub kind: String,
    pub message: String,
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]: {}", self.backend, self.kind, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GenerationError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("backend '{backend}' rejected the request{}: {reason}", status_suffix(.status))]
    BackendRejected {
        backend: String,
        status: Option<u16>,
        reason: String,
    },

    #[error("network failure talking to '{backend}': {message}")]
    Network {
        backend: String,
        message: String,
        retryable: bool,
    },

    #[error("prediction {prediction_id} failed: {reason}")]
    BackendFailure {
        prediction_id: String,
        reason: String,
    },

    #[error("prediction {prediction_id} still unresolved after {attempts} status checks")]
    PollTimeout { prediction_id: String, attempts: u32 },

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("unexpected response shape from '{backend}': {message}")]
    Decode { backend: String, message: String },

    #[error("all image backends failed: {}", join_attempts(.attempts))]
    Exhausted { attempts: Vec<AttemptFailure> },

    #[error("step '{step}' failed: {message}")]
    TextStep { step: StepId, message: String },
}

impl GenerationError {
    /// Stable tag used in events and aggregated failures.
    pub fn kind(&self) -> &'static str {
        match self {
            GenerationError::Validation(_) => "validation",
            GenerationError::Configuration(_) => "configuration",
            GenerationError::BackendRejected { .. } => "backend_rejected",
            GenerationError::Network { .. } => "network",
            GenerationError::BackendFailure { .. } => "backend_failure",
            GenerationError::PollTimeout { .. } => "poll_timeout",
            GenerationError::Cancelled(_) => "cancelled",
            GenerationError::Decode { .. } => "decode",
            GenerationError::Exhausted { .. } => "exhausted",
            GenerationError::TextStep { .. } => "text_step",
        }
    }

    /// Errors that stop the fallback ladder instead of advancing it.
    pub fn is_fatal_for_ladder(&self) -> bool {
        matches!(
            self,
            GenerationError::Validation(_) | GenerationError::Cancelled(_)
        )
    }

    pub fn is_retryable_network(&self) -> bool {
        matches!(
            self,
            GenerationError::Network {
                retryable: true,
                ..
            }
        )
    }

    pub fn to_attempt(&self, backend: &str) -> AttemptFailure {
        AttemptFailure {
            backend: backend.to_string(),
            kind: self.kind().to_string(),
            message: self.to_string(),
        }
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|code| format!(" ({code})")).unwrap_or_default()
}

fn join_attempts(attempts: &[AttemptFailure]) -> String {
    if attempts.is_empty() {
        return "no backends attempted".to_string();
    }
    attempts
        .iter()
        .map(AttemptFailure::to_string)
        .collect::<Vec<String>>()
        .join("; ")
}
