use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::GenerationError;

/// Where a missing trigger keyword is inserted into the prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerPlacement {
    Prepend,
    #[default]
    Append,
}

/// Backend-specific names for the generic request fields. `None` means the
/// backend does not accept the field and it is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamNames {
    #[serde(default = "default_prompt_name")]
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default = "default_width_name")]
    pub width: Option<String>,
    #[serde(default = "default_height_name")]
    pub height: Option<String>,
    #[serde(default)]
    pub steps: Option<String>,
    #[serde(default)]
    pub guidance: Option<String>,
}

impl Default for ParamNames {
    fn default() -> Self {
        Self {
            prompt: default_prompt_name(),
            negative_prompt: None,
            width: default_width_name(),
            height: default_height_name(),
            steps: None,
            guidance: None,
        }
    }
}

/// Declared shape of a succeeded prediction's `output` field.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputShape {
    /// `"output": ["https://...", ...]`
    #[default]
    UrlList,
    /// `"output": "https://..."`
    SingleUrl,
    /// `"output": [{"<field>": "https://..."}, ...]`
    ObjectList { field: String },
}

/// Static description of one async image backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendDescriptor {
    pub id: String,
    /// `owner/name` of the hosted model.
    pub model: String,
    #[serde(default)]
    pub version: Option<String>,
    pub min_dimension: u32,
    pub max_dimension: u32,
    #[serde(default = "default_dimension_step")]
    pub dimension_step: u32,
    #[serde(default)]
    pub params: ParamNames,
    #[serde(default)]
    pub trigger_words: Vec<String>,
    #[serde(default)]
    pub trigger_placement: TriggerPlacement,
    #[serde(default)]
    pub default_steps: Option<u32>,
    #[serde(default)]
    pub default_guidance: Option<f64>,
    #[serde(default)]
    pub fixed_params: Map<String, Value>,
    #[serde(default)]
    pub accepted_extras: Vec<String>,
    #[serde(default)]
    pub output: OutputShape,
}

impl BackendDescriptor {
    pub fn new(id: impl Into<String>, model: impl Into<String>, min: u32, max: u32) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            version: None,
            min_dimension: min,
            max_dimension: max,
            dimension_step: 1,
            params: ParamNames::default(),
            trigger_words: Vec::new(),
            trigger_placement: TriggerPlacement::Append,
            default_steps: None,
            default_guidance: None,
            fixed_params: Map::new(),
            accepted_extras: Vec::new(),
            output: OutputShape::UrlList,
        }
    }

    pub fn validate(&self) -> Result<(), GenerationError> {
        let invalid = |reason: String| {
            Err(GenerationError::Configuration(format!(
                "backend '{}': {reason}",
                self.id
            )))
        };
        if self.id.trim().is_empty() {
            return Err(GenerationError::Configuration(
                "backend id must not be empty".to_string(),
            ));
        }
        if self.model.trim().is_empty() {
            return invalid("model must not be empty".to_string());
        }
        if self.dimension_step == 0 {
            return invalid("dimension_step must be positive".to_string());
        }
        if self.min_dimension == 0 || self.min_dimension > self.max_dimension {
            return invalid(format!(
                "dimension bounds [{}, {}] are not a valid range",
                self.min_dimension, self.max_dimension
            ));
        }
        if self.min_dimension % self.dimension_step != 0
            || self.max_dimension % self.dimension_step != 0
        {
            return invalid(format!(
                "dimension bounds must be multiples of {}",
                self.dimension_step
            ));
        }
        if self.params.prompt.trim().is_empty() {
            return invalid("prompt parameter name must not be empty".to_string());
        }
        if let Some(guidance) = self.default_guidance {
            if !guidance.is_finite() || guidance < 0.0 {
                return invalid(format!("default_guidance {guidance} is not valid"));
            }
        }
        Ok(())
    }
}

/// The synchronous provider tried once after every async backend failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastResortDescriptor {
    pub id: String,
    pub model: String,
    /// Sizes the provider accepts, as `WIDTHxHEIGHT`.
    pub sizes: Vec<String>,
}

impl LastResortDescriptor {
    pub fn validate(&self) -> Result<(), GenerationError> {
        if self.model.trim().is_empty() {
            return Err(GenerationError::Configuration(format!(
                "last resort '{}': model must not be empty",
                self.id
            )));
        }
        if self.sizes.is_empty() {
            return Err(GenerationError::Configuration(format!(
                "last resort '{}': at least one size is required",
                self.id
            )));
        }
        for size in &self.sizes {
            crate::request::parse_size(size).map_err(|err| {
                GenerationError::Configuration(format!("last resort '{}': {err}", self.id))
            })?;
        }
        Ok(())
    }
}

fn default_prompt_name() -> String {
    "prompt".to_string()
}

fn default_width_name() -> Option<String> {
    Some("width".to_string())
}

fn default_height_name() -> Option<String> {
    Some("height".to_string())
}

fn default_dimension_step() -> u32 {
    1
}
