use serde::{Deserialize, Serialize};

use crate::request::GenerationRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictionStatus {
    Pending,
    Succeeded,
    Failed,
}

impl PredictionStatus {
    /// Maps a backend-reported status string. Anything not terminal counts as
    /// pending (`starting`, `processing`, `queued`, ...).
    pub fn from_backend(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "succeeded" | "success" | "completed" => PredictionStatus::Succeeded,
            "failed" | "canceled" | "cancelled" | "error" => PredictionStatus::Failed,
            _ => PredictionStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PredictionStatus::Pending)
    }
}

/// A job submitted to an async backend. Status, output and error only move
/// forward; once terminal the prediction is frozen.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub id: String,
    pub backend_id: String,
    pub request: GenerationRequest,
    status: PredictionStatus,
    output: Option<Vec<String>>,
    error: Option<String>,
}

impl Prediction {
    pub fn new(
        id: impl Into<String>,
        backend_id: impl Into<String>,
        request: GenerationRequest,
    ) -> Self {
        Self {
            id: id.into(),
            backend_id: backend_id.into(),
            request,
            status: PredictionStatus::Pending,
            output: None,
            error: None,
        }
    }

    pub fn status(&self) -> PredictionStatus {
        self.status
    }

    pub fn output(&self) -> Option<&[String]> {
        self.output.as_deref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Returns false when the prediction was already terminal and the update
    /// was ignored.
    pub fn mark_succeeded(&mut self, output: Vec<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = PredictionStatus::Succeeded;
        self.output = Some(output);
        true
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = PredictionStatus::Failed;
        self.error = Some(error.into());
        true
    }
}
