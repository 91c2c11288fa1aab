use artforge_contracts::backends::{BackendDescriptor, TriggerPlacement};
use artforge_contracts::request::GenerationRequest;
use artforge_contracts::GenerationError;
use serde::Serialize;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

/// Request translated into one backend's parameter shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedInput {
    pub backend_id: String,
    pub model: String,
    pub version: Option<String>,
    pub input: Map<String, Value>,
}

impl NormalizedInput {
    /// Hex sha256 of the serialized input; identical requests normalize to
    /// identical fingerprints.
    pub fn fingerprint(&self) -> String {
        let bytes = serde_json::to_vec(&self.input).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(self.backend_id.as_bytes());
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }
}

/// Translates a generic request for `backend`. Pure; fails only when the
/// request itself is invalid.
pub fn normalize(
    request: &GenerationRequest,
    backend: &BackendDescriptor,
) -> Result<NormalizedInput, GenerationError> {
    request.validate()?;
    let params = &backend.params;
    let mut input = Map::new();

    input.insert(
        params.prompt.clone(),
        Value::String(inject_trigger_words(
            &request.prompt,
            &backend.trigger_words,
            backend.trigger_placement,
        )),
    );
    if let Some(name) = &params.width {
        input.insert(name.clone(), json!(clamp_dimension(request.width, backend)));
    }
    if let Some(name) = &params.height {
        input.insert(name.clone(), json!(clamp_dimension(request.height, backend)));
    }
    if let Some(name) = &params.negative_prompt {
        if let Some(negative) = request
            .negative_prompt
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            input.insert(name.clone(), Value::String(negative.to_string()));
        }
    }
    if let Some(name) = &params.steps {
        if let Some(steps) = request.steps.or(backend.default_steps) {
            input.insert(name.clone(), json!(steps));
        }
    }
    if let Some(name) = &params.guidance {
        if let Some(guidance) = request.guidance_scale.or(backend.default_guidance) {
            input.insert(name.clone(), json!(guidance));
        }
    }
    for (key, value) in &backend.fixed_params {
        input.entry(key.clone()).or_insert_with(|| value.clone());
    }
    for (key, value) in &request.extra_params {
        if input.contains_key(key) {
            continue;
        }
        if backend.accepted_extras.iter().any(|accepted| accepted == key) {
            input.insert(key.clone(), value.clone());
        }
    }

    Ok(NormalizedInput {
        backend_id: backend.id.clone(),
        model: backend.model.clone(),
        version: backend.version.clone(),
        input,
    })
}

/// Clamps into the backend's bounds, then snaps to its dimension step.
/// Bounds are multiples of the step, so the result stays inside them.
pub fn clamp_dimension(value: u32, backend: &BackendDescriptor) -> u32 {
    let clamped = value.clamp(backend.min_dimension, backend.max_dimension);
    let step = backend.dimension_step.max(1);
    if step == 1 {
        return clamped;
    }
    let step = u64::from(step);
    let snapped = ((u64::from(clamped) + step / 2) / step) * step;
    let snapped = u32::try_from(snapped).unwrap_or(backend.max_dimension);
    snapped.clamp(backend.min_dimension, backend.max_dimension)
}

/// Adds every trigger keyword the prompt does not already contain
/// (case-insensitive). Already-normalized prompts come back unchanged.
pub fn inject_trigger_words(
    prompt: &str,
    trigger_words: &[String],
    placement: TriggerPlacement,
) -> String {
    let base = prompt.trim();
    let lowered = base.to_lowercase();
    let mut missing: Vec<&str> = Vec::new();
    for word in trigger_words {
        let word = word.trim();
        if word.is_empty() {
            continue;
        }
        let needle = word.to_lowercase();
        if lowered.contains(&needle) {
            continue;
        }
        if missing.iter().any(|existing| existing.to_lowercase() == needle) {
            continue;
        }
        missing.push(word);
    }
    if missing.is_empty() {
        return base.to_string();
    }
    let keywords = missing.join(", ");
    match placement {
        TriggerPlacement::Prepend => format!("{keywords}, {base}"),
        TriggerPlacement::Append => format!("{base}, {keywords}"),
    }
}
