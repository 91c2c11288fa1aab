use std::time::Duration;

use artforge_contracts::prediction::{Prediction, PredictionStatus};
use artforge_contracts::GenerationError;
use reqwest::blocking::Client as HttpClient;
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Value};

use super::{http_client, network_error, response_json_or_error, PredictionApi, PredictionSnapshot};
use crate::config::EngineConfig;
use crate::normalize::NormalizedInput;

const NAME: &str = "replicate";

/// Replicate-style async prediction API. Submission asks the server to hold
/// the request briefly (`Prefer: wait`) so fast models come back terminal.
#[derive(Debug, Clone)]
pub struct ReplicateApi {
    api_base: String,
    api_token: Option<String>,
    http: HttpClient,
}

impl ReplicateApi {
    pub fn new(
        api_base: impl Into<String>,
        api_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, GenerationError> {
        Ok(Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_token,
            http: http_client(NAME, timeout)?,
        })
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self, GenerationError> {
        Self::new(
            config.replicate_api_base.clone(),
            config.replicate_api_token.clone(),
            config.http_timeout,
        )
    }

    fn predictions_endpoint(&self) -> String {
        format!("{}/predictions", self.api_base)
    }

    fn api_token(&self) -> Result<&str, GenerationError> {
        self.api_token
            .as_deref()
            .ok_or_else(|| GenerationError::Configuration("REPLICATE_API_TOKEN not set".to_string()))
    }

    fn submission_payload(input: &NormalizedInput) -> Value {
        match &input.version {
            Some(version) => json!({ "version": version, "input": input.input }),
            None => json!({ "model": input.model, "input": input.input }),
        }
    }
}

impl PredictionApi for ReplicateApi {
    fn name(&self) -> &str {
        NAME
    }

    fn submit(&self, input: &NormalizedInput) -> Result<PredictionSnapshot, GenerationError> {
        let token = self.api_token()?;
        let response = self
            .http
            .post(self.predictions_endpoint())
            .bearer_auth(token)
            .header(CONTENT_TYPE, "application/json")
            .header("Prefer", "wait")
            .json(&Self::submission_payload(input))
            .send()
            .map_err(|err| network_error(&input.backend_id, &err))?;
        let payload = response_json_or_error(&input.backend_id, response)?;
        parse_snapshot(&input.backend_id, &payload)
    }

    fn fetch(&self, prediction: &Prediction) -> Result<PredictionSnapshot, GenerationError> {
        let token = self.api_token()?;
        let endpoint = format!("{}/{}", self.predictions_endpoint(), prediction.id);
        let response = self
            .http
            .get(&endpoint)
            .bearer_auth(token)
            .send()
            .map_err(|err| network_error(&prediction.backend_id, &err))?;
        let payload = response_json_or_error(&prediction.backend_id, response)?;
        parse_snapshot(&prediction.backend_id, &payload)
    }
}

fn parse_snapshot(backend: &str, payload: &Value) -> Result<PredictionSnapshot, GenerationError> {
    let id = payload
        .get("id")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| GenerationError::Decode {
            backend: backend.to_string(),
            message: "prediction response missing id".to_string(),
        })?;
    let status = payload
        .get("status")
        .and_then(Value::as_str)
        .map(PredictionStatus::from_backend)
        .unwrap_or(PredictionStatus::Pending);
    let error = match payload.get("error") {
        None | Some(Value::Null) => None,
        Some(Value::String(text)) => Some(text.trim().to_string()).filter(|text| !text.is_empty()),
        Some(other) => Some(other.to_string()),
    };
    Ok(PredictionSnapshot {
        id: id.to_string(),
        status,
        output: payload.get("output").cloned().unwrap_or(Value::Null),
        error,
    })
}
