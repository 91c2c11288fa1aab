use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::GenerationError;

pub const DEFAULT_DIMENSION: u32 = 1024;

/// Backend-agnostic image request. Built per call and discarded once the
/// prediction resolves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default = "default_dimension")]
    pub width: u32,
    #[serde(default = "default_dimension")]
    pub height: u32,
    #[serde(default)]
    pub steps: Option<u32>,
    #[serde(default)]
    pub guidance_scale: Option<f64>,
    #[serde(default)]
    pub extra_params: Map<String, Value>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: None,
            width: DEFAULT_DIMENSION,
            height: DEFAULT_DIMENSION,
            steps: None,
            guidance_scale: None,
            extra_params: Map::new(),
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_negative_prompt(mut self, negative_prompt: impl Into<String>) -> Self {
        let value = negative_prompt.into();
        self.negative_prompt = if value.trim().is_empty() {
            None
        } else {
            Some(value)
        };
        self
    }

    pub fn with_steps(mut self, steps: u32) -> Self {
        self.steps = Some(steps);
        self
    }

    pub fn with_guidance_scale(mut self, guidance_scale: f64) -> Self {
        self.guidance_scale = Some(guidance_scale);
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra_params.insert(key.into(), value);
        self
    }

    /// Parses an untyped request. Dimensions may be numbers or numeric strings;
    /// anything else is rejected before the request reaches a backend.
    pub fn from_value(value: &Value) -> Result<Self, GenerationError> {
        let Some(obj) = value.as_object() else {
            return Err(GenerationError::Validation(
                "request must be a JSON object".to_string(),
            ));
        };
        let prompt = obj
            .get("prompt")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| GenerationError::Validation("prompt is required".to_string()))?;
        let width = match obj.get("width") {
            Some(raw) => parse_dimension("width", raw)?,
            None => DEFAULT_DIMENSION,
        };
        let height = match obj.get("height") {
            Some(raw) => parse_dimension("height", raw)?,
            None => DEFAULT_DIMENSION,
        };
        let steps = match obj.get("steps") {
            Some(Value::Null) | None => None,
            Some(raw) => Some(parse_dimension("steps", raw)?),
        };
        let guidance_scale = match obj
            .get("guidanceScale")
            .or_else(|| obj.get("guidance_scale"))
        {
            Some(Value::Null) | None => None,
            Some(raw) => Some(parse_number("guidanceScale", raw)?),
        };
        let negative_prompt = obj
            .get("negativePrompt")
            .or_else(|| obj.get("negative_prompt"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .filter(|value| !value.trim().is_empty());
        let extra_params = obj
            .get("extraParams")
            .or_else(|| obj.get("extra_params"))
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let request = Self {
            prompt,
            negative_prompt,
            width,
            height,
            steps,
            guidance_scale,
            extra_params,
        };
        request.validate()?;
        Ok(request)
    }

    pub fn validate(&self) -> Result<(), GenerationError> {
        if self.prompt.trim().is_empty() {
            return Err(GenerationError::Validation(
                "prompt must not be empty".to_string(),
            ));
        }
        if self.width == 0 || self.height == 0 {
            return Err(GenerationError::Validation(format!(
                "dimensions must be positive (got {}x{})",
                self.width, self.height
            )));
        }
        if self.steps == Some(0) {
            return Err(GenerationError::Validation(
                "steps must be positive".to_string(),
            ));
        }
        if let Some(guidance) = self.guidance_scale {
            if !guidance.is_finite() || guidance < 0.0 {
                return Err(GenerationError::Validation(format!(
                    "guidanceScale must be a non-negative number (got {guidance})"
                )));
            }
        }
        Ok(())
    }
}

/// Parses `"WIDTHxHEIGHT"`.
pub fn parse_size(raw: &str) -> Result<(u32, u32), GenerationError> {
    let lowered = raw.trim().to_ascii_lowercase();
    let Some((w, h)) = lowered.split_once('x') else {
        return Err(GenerationError::Validation(format!(
            "size '{raw}' must look like 1024x1024"
        )));
    };
    let width = parse_dimension("width", &Value::String(w.trim().to_string()))?;
    let height = parse_dimension("height", &Value::String(h.trim().to_string()))?;
    Ok((width, height))
}

fn parse_dimension(field: &str, value: &Value) -> Result<u32, GenerationError> {
    let parsed = match value {
        Value::Number(num) => num.as_u64(),
        Value::String(text) => text.trim().parse::<u64>().ok(),
        _ => None,
    };
    let Some(parsed) = parsed else {
        return Err(GenerationError::Validation(format!(
            "{field} must be a positive integer (got {value})"
        )));
    };
    u32::try_from(parsed)
        .ok()
        .filter(|value| *value > 0)
        .ok_or_else(|| {
            GenerationError::Validation(format!("{field} out of range (got {parsed})"))
        })
}

fn parse_number(field: &str, value: &Value) -> Result<f64, GenerationError> {
    let parsed = match value {
        Value::Number(num) => num.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|value| value.is_finite()).ok_or_else(|| {
        GenerationError::Validation(format!("{field} must be a number (got {value})"))
    })
}

fn default_dimension() -> u32 {
    DEFAULT_DIMENSION
}
