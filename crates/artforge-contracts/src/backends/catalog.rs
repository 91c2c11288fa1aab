use std::path::Path;

use anyhow::Context;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::descriptor::{
    BackendDescriptor, LastResortDescriptor, OutputShape, ParamNames, TriggerPlacement,
};
use crate::error::GenerationError;

/// Fixed order in which the fallback ladder tries backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LadderPlan {
    pub primary: String,
    #[serde(default)]
    pub alternates: Vec<String>,
    #[serde(default)]
    pub last_resort: Option<LastResortDescriptor>,
}

/// Immutable backend configuration, built once at startup and handed to the
/// normalizer and the ladder.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendCatalog {
    backends: IndexMap<String, BackendDescriptor>,
    ladder: LadderPlan,
}

#[derive(Debug, Default, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    backends: Vec<BackendDescriptor>,
    #[serde(default)]
    ladder: Option<LadderPlan>,
}

impl BackendCatalog {
    pub fn new(
        backends: Vec<BackendDescriptor>,
        ladder: LadderPlan,
    ) -> Result<Self, GenerationError> {
        let mut map = IndexMap::new();
        for backend in backends {
            if map.contains_key(&backend.id) {
                return Err(GenerationError::Configuration(format!(
                    "backend '{}' declared twice",
                    backend.id
                )));
            }
            map.insert(backend.id.clone(), backend);
        }
        let catalog = Self {
            backends: map,
            ladder,
        };
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn defaults() -> Self {
        Self {
            backends: default_backends(),
            ladder: default_ladder(),
        }
    }

    /// Overlays a catalog file on the defaults: backends are replaced by id
    /// (new ids are appended), and a `ladder` section replaces the plan.
    pub fn from_json(raw: &str) -> Result<Self, GenerationError> {
        let file: CatalogFile = serde_json::from_str(raw)
            .map_err(|err| GenerationError::Configuration(format!("invalid catalog: {err}")))?;
        let mut catalog = Self::defaults();
        for backend in file.backends {
            catalog.backends.insert(backend.id.clone(), backend);
        }
        if let Some(ladder) = file.ladder {
            catalog.ladder = ladder;
        }
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading backend catalog {}", path.display()))?;
        Self::from_json(&raw)
            .with_context(|| format!("failed loading backend catalog {}", path.display()))
    }

    pub fn get(&self, id: &str) -> Option<&BackendDescriptor> {
        self.backends.get(id)
    }

    pub fn list(&self) -> impl Iterator<Item = &BackendDescriptor> {
        self.backends.values()
    }

    pub fn ladder(&self) -> &LadderPlan {
        &self.ladder
    }

    /// Primary first, then alternates, in configured order.
    pub fn ladder_backends(&self) -> Vec<&BackendDescriptor> {
        std::iter::once(&self.ladder.primary)
            .chain(self.ladder.alternates.iter())
            .filter_map(|id| self.backends.get(id))
            .collect()
    }

    pub fn validate(&self) -> Result<(), GenerationError> {
        for backend in self.backends.values() {
            backend.validate()?;
        }
        let mut seen: Vec<&str> = Vec::new();
        for id in std::iter::once(&self.ladder.primary).chain(self.ladder.alternates.iter()) {
            if !self.backends.contains_key(id) {
                return Err(GenerationError::Configuration(format!(
                    "ladder references unknown backend '{id}'"
                )));
            }
            if seen.contains(&id.as_str()) {
                return Err(GenerationError::Configuration(format!(
                    "ladder lists backend '{id}' more than once"
                )));
            }
            seen.push(id.as_str());
        }
        if let Some(last_resort) = &self.ladder.last_resort {
            last_resort.validate()?;
        }
        Ok(())
    }

    pub fn to_json(&self) -> Value {
        json!({
            "backends": self.backends.values().collect::<Vec<&BackendDescriptor>>(),
            "ladder": self.ladder,
        })
    }
}

fn default_backends() -> IndexMap<String, BackendDescriptor> {
    let mut map = IndexMap::new();

    let mut flux_pro = BackendDescriptor::new(
        "flux-pro",
        "black-forest-labs/flux-1.1-pro",
        256,
        1440,
    );
    flux_pro.dimension_step = 32;
    flux_pro.fixed_params = fixed(&[
        ("output_format", json!("png")),
        ("prompt_upsampling", json!(false)),
    ]);
    flux_pro.accepted_extras = vec!["seed".to_string(), "safety_tolerance".to_string()];
    flux_pro.output = OutputShape::SingleUrl;
    map.insert(flux_pro.id.clone(), flux_pro);

    let mut flux_dev = BackendDescriptor::new("flux-dev", "black-forest-labs/flux-dev", 256, 1024);
    flux_dev.dimension_step = 16;
    flux_dev.params = ParamNames {
        steps: Some("num_inference_steps".to_string()),
        guidance: Some("guidance".to_string()),
        ..ParamNames::default()
    };
    flux_dev.default_steps = Some(28);
    flux_dev.default_guidance = Some(3.5);
    flux_dev.fixed_params = fixed(&[("output_format", json!("png")), ("num_outputs", json!(1))]);
    flux_dev.accepted_extras = vec!["seed".to_string()];
    map.insert(flux_dev.id.clone(), flux_dev);

    let mut flux_lora = BackendDescriptor::new("flux-lora", "lucataco/flux-dev-lora", 256, 1024);
    flux_lora.dimension_step = 16;
    flux_lora.params = ParamNames {
        steps: Some("num_inference_steps".to_string()),
        guidance: Some("guidance_scale".to_string()),
        ..ParamNames::default()
    };
    flux_lora.trigger_words = vec!["TOK".to_string()];
    flux_lora.trigger_placement = TriggerPlacement::Prepend;
    flux_lora.default_steps = Some(28);
    flux_lora.default_guidance = Some(3.5);
    flux_lora.accepted_extras = vec!["seed".to_string(), "hf_lora".to_string()];
    map.insert(flux_lora.id.clone(), flux_lora);

    let mut sdxl = BackendDescriptor::new("sdxl", "stability-ai/sdxl", 512, 1024);
    sdxl.dimension_step = 8;
    sdxl.params = ParamNames {
        negative_prompt: Some("negative_prompt".to_string()),
        steps: Some("num_inference_steps".to_string()),
        guidance: Some("guidance_scale".to_string()),
        ..ParamNames::default()
    };
    sdxl.default_steps = Some(30);
    sdxl.default_guidance = Some(7.5);
    sdxl.fixed_params = fixed(&[("num_outputs", json!(1))]);
    sdxl.accepted_extras = vec!["seed".to_string(), "scheduler".to_string()];
    map.insert(sdxl.id.clone(), sdxl);

    map
}

fn default_ladder() -> LadderPlan {
    LadderPlan {
        primary: "flux-pro".to_string(),
        alternates: vec!["flux-dev".to_string(), "sdxl".to_string()],
        last_resort: Some(LastResortDescriptor {
            id: "openai".to_string(),
            model: "dall-e-3".to_string(),
            sizes: vec![
                "1024x1024".to_string(),
                "1792x1024".to_string(),
                "1024x1792".to_string(),
            ],
        }),
    }
}

fn fixed(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(key, value)| ((*key).to_string(), value.clone()))
        .collect()
}
