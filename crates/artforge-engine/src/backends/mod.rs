mod openai;
mod replicate;

use artforge_contracts::prediction::{Prediction, PredictionStatus};
use artforge_contracts::GenerationError;
use reqwest::blocking::Response as HttpResponse;
use serde_json::Value;

use crate::normalize::NormalizedInput;

pub use openai::{closest_size, OpenAiImages};
pub use replicate::ReplicateApi;

/// Backend view of a prediction at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionSnapshot {
    pub id: String,
    pub status: PredictionStatus,
    pub output: Value,
    pub error: Option<String>,
}

impl PredictionSnapshot {
    pub fn pending(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: PredictionStatus::Pending,
            output: Value::Null,
            error: None,
        }
    }

    pub fn succeeded(id: impl Into<String>, output: Value) -> Self {
        Self {
            id: id.into(),
            status: PredictionStatus::Succeeded,
            output,
            error: None,
        }
    }

    pub fn failed(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: PredictionStatus::Failed,
            output: Value::Null,
            error: Some(error.into()),
        }
    }
}

/// Async job API shared by every ladder backend: submit returns a job, the
/// poller drives it to a terminal state through `fetch`.
pub trait PredictionApi: Send + Sync {
    fn name(&self) -> &str;
    fn submit(&self, input: &NormalizedInput) -> Result<PredictionSnapshot, GenerationError>;
    fn fetch(&self, prediction: &Prediction) -> Result<PredictionSnapshot, GenerationError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastResortRequest {
    pub model: String,
    pub prompt: String,
    pub size: String,
}

/// Synchronous image API used as the final rung. Returns image URLs.
pub trait LastResortApi: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, request: &LastResortRequest) -> Result<Vec<String>, GenerationError>;
}

pub(crate) fn network_error(backend: &str, err: &reqwest::Error) -> GenerationError {
    GenerationError::Network {
        backend: backend.to_string(),
        message: error_chain_text(err, 512),
        retryable: err.is_timeout() || err.is_connect() || err.is_request(),
    }
}

/// Non-2xx responses become `BackendRejected`; bodies must be JSON.
pub(crate) fn response_json_or_error(
    backend: &str,
    response: HttpResponse,
) -> Result<Value, GenerationError> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .map_err(|err| network_error(backend, &err))?;
    if !status.is_success() {
        return Err(GenerationError::BackendRejected {
            backend: backend.to_string(),
            status: Some(code),
            reason: rejection_reason(&body),
        });
    }
    serde_json::from_str(&body).map_err(|err| GenerationError::Decode {
        backend: backend.to_string(),
        message: format!("invalid JSON payload: {err}"),
    })
}

/// Prefers the provider's `detail` / `error.message` over the raw body.
pub(crate) fn rejection_reason(body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<Value>(body) {
        let detail = parsed
            .get("detail")
            .and_then(Value::as_str)
            .or_else(|| parsed.pointer("/error/message").and_then(Value::as_str))
            .or_else(|| parsed.get("error").and_then(Value::as_str))
            .or_else(|| parsed.get("title").and_then(Value::as_str));
        if let Some(detail) = detail.map(str::trim).filter(|value| !value.is_empty()) {
            return truncate_text(detail, 512);
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "empty response body".to_string();
    }
    truncate_text(trimmed, 512)
}

fn error_chain_text(err: &(dyn std::error::Error + 'static), max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(cause) = current {
        let text = cause.to_string();
        let trimmed = text.trim();
        if !trimmed.is_empty() && parts.last().map(|last| last != trimmed).unwrap_or(true) {
            parts.push(trimmed.to_string());
        }
        current = cause.source();
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

pub(crate) fn http_client(
    backend: &str,
    timeout: std::time::Duration,
) -> Result<reqwest::blocking::Client, GenerationError> {
    reqwest::blocking::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|err| {
            GenerationError::Configuration(format!("failed building HTTP client for {backend}: {err}"))
        })
}
