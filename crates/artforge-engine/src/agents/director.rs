use std::collections::HashMap;
use std::sync::Arc;

use artforge_contracts::artifacts::Artwork;
use artforge_contracts::context::{AgentContext, ContextKey};
use artforge_contracts::events::{EventLevel, EventLog, EventPayload};
use artforge_contracts::request::GenerationRequest;
use artforge_contracts::{GenerationError, StepId};
use serde::Serialize;
use serde_json::{json, Map, Value};

use super::roles::{default_roles, AgentRole};
use super::FailurePolicy;
use crate::cancel::CancelToken;
use crate::ladder::{AttemptRecord, FallbackLadder, LadderOutcome};
use crate::text::TextCompleter;

/// A role plus the failure policy the director applies to it.
pub struct ChainStep {
    pub role: Box<dyn AgentRole>,
    pub policy: FailurePolicy,
}

impl ChainStep {
    pub fn new(role: Box<dyn AgentRole>) -> Self {
        let policy = role.default_policy();
        Self { role, policy }
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn id(&self) -> StepId {
        self.role.id()
    }
}

/// Image parameters and per-step policy overrides for a chain run.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectorSettings {
    pub width: u32,
    pub height: u32,
    pub steps: Option<u32>,
    pub guidance_scale: Option<f64>,
    pub negative_prompt: Option<String>,
    pub extra_params: Map<String, Value>,
    pub policy_overrides: HashMap<StepId, FailurePolicy>,
}

impl Default for DirectorSettings {
    fn default() -> Self {
        Self {
            width: 1024,
            height: 1024,
            steps: None,
            guidance_scale: None,
            negative_prompt: Some("text, watermark, signature, blurry".to_string()),
            extra_params: Map::new(),
            policy_overrides: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChainInput {
    pub concept: String,
    pub forced_attributes: Map<String, Value>,
    pub series: Option<String>,
    pub category: Option<String>,
}

impl ChainInput {
    pub fn new(concept: impl Into<String>) -> Self {
        Self {
            concept: concept.into(),
            ..Self::default()
        }
    }
}

/// Binary outcome of one chain run. Failures are reported here, never
/// raised past the director.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainResult {
    pub success: bool,
    pub artwork: Option<Artwork>,
    pub error: Option<String>,
    pub failed_step: Option<StepId>,
    pub messages: Vec<String>,
    pub attempts: Vec<AttemptRecord>,
    #[serde(skip)]
    pub context: AgentContext,
}

impl ChainResult {
    pub fn image_url(&self) -> Option<&str> {
        self.artwork.as_ref().map(|artwork| artwork.image_url.as_str())
    }

    fn failed(context: AgentContext, error: &GenerationError, step: Option<StepId>) -> Self {
        Self {
            success: false,
            artwork: None,
            error: Some(error.to_string()),
            failed_step: step,
            messages: context.messages().to_vec(),
            attempts: Vec::new(),
            context,
        }
    }
}

/// Runs the fixed role sequence, then hands the accumulated prompt to the
/// fallback ladder.
pub struct Director {
    steps: Vec<ChainStep>,
    text: Arc<dyn TextCompleter>,
    ladder: FallbackLadder,
    settings: DirectorSettings,
    events: EventLog,
}

impl Director {
    pub fn new(
        text: Arc<dyn TextCompleter>,
        ladder: FallbackLadder,
        settings: DirectorSettings,
        events: EventLog,
    ) -> Self {
        let steps = default_roles()
            .into_iter()
            .map(ChainStep::new)
            .collect();
        Self::with_steps(steps, text, ladder, settings, events)
    }

    /// Overrides in `settings.policy_overrides` win over each step's policy.
    pub fn with_steps(
        steps: Vec<ChainStep>,
        text: Arc<dyn TextCompleter>,
        ladder: FallbackLadder,
        settings: DirectorSettings,
        events: EventLog,
    ) -> Self {
        let steps = steps
            .into_iter()
            .map(|step| match settings.policy_overrides.get(&step.id()) {
                Some(policy) => step.with_policy(*policy),
                None => step,
            })
            .collect();
        Self {
            steps,
            text,
            ladder,
            settings,
            events,
        }
    }

    pub fn run(&self, input: &ChainInput, cancel: &CancelToken) -> ChainResult {
        let mut context = initial_context(input);
        let concept = input.concept.trim();
        if concept.is_empty() {
            let err = GenerationError::Validation("concept must not be empty".to_string());
            return self.chain_failed(context, &err, None);
        }

        let mut payload = EventPayload::new();
        payload.insert("concept".to_string(), json!(concept));
        payload.insert(
            "steps".to_string(),
            json!(self
                .steps
                .iter()
                .map(|step| json!({ "step": step.id(), "policy": step.policy }))
                .collect::<Vec<Value>>()),
        );
        self.events
            .record(EventLevel::Info, "chain_started", payload);

        for step in &self.steps {
            if let Err(err) = cancel.check() {
                return self.chain_failed(context, &err, Some(step.id()));
            }
            match step.role.transform(&context, self.text.as_ref()) {
                Ok(mut next) => {
                    next.push_message(format!("{}: done", step.id()));
                    self.step_event(EventLevel::Info, "step_completed", step, None);
                    context = next;
                }
                Err(err) => match step.policy {
                    FailurePolicy::SubstituteOnFailure => {
                        let mut next = step.role.substitute(context);
                        next.push_message(format!(
                            "{}: substituted untransformed input ({err})",
                            step.id()
                        ));
                        self.step_event(EventLevel::Warn, "step_substituted", step, Some(&err));
                        context = next;
                    }
                    FailurePolicy::PropagateOnFailure => {
                        let err = match err {
                            GenerationError::TextStep { .. } | GenerationError::Cancelled(_) => err,
                            other => GenerationError::TextStep {
                                step: step.id(),
                                message: other.to_string(),
                            },
                        };
                        context.push_message(format!("{}: failed ({err})", step.id()));
                        self.step_event(EventLevel::Error, "step_failed", step, Some(&err));
                        return self.chain_failed(context, &err, Some(step.id()));
                    }
                },
            }
        }

        let request = self.image_request(&context);
        match self.ladder.generate(&request, cancel) {
            Ok(outcome) => self.chain_completed(context, request, outcome),
            Err(err) => {
                context.push_message(format!("image: failed ({err})"));
                self.chain_failed(context, &err, None)
            }
        }
    }

    fn image_request(&self, context: &AgentContext) -> GenerationRequest {
        let mut request = GenerationRequest::new(context.current_prompt())
            .with_size(self.settings.width, self.settings.height);
        let negative = context
            .get_str(ContextKey::NegativePrompt)
            .map(str::to_string)
            .or_else(|| self.settings.negative_prompt.clone());
        if let Some(negative) = negative {
            request = request.with_negative_prompt(negative);
        }
        if let Some(steps) = self.settings.steps {
            request = request.with_steps(steps);
        }
        if let Some(guidance) = self.settings.guidance_scale {
            request = request.with_guidance_scale(guidance);
        }
        for (key, value) in &self.settings.extra_params {
            request = request.with_extra(key.clone(), value.clone());
        }
        request
    }

    fn chain_completed(
        &self,
        mut context: AgentContext,
        request: GenerationRequest,
        outcome: LadderOutcome,
    ) -> ChainResult {
        let mut metadata = context
            .get_object(ContextKey::Metadata)
            .cloned()
            .unwrap_or_default();
        for key in [ContextKey::Character, ContextKey::Critique, ContextKey::Style] {
            if let Some(value) = context.get(key) {
                metadata
                    .entry(key.as_str().to_string())
                    .or_insert_with(|| value.clone());
            }
        }
        metadata.insert("rung".to_string(), json!(outcome.rung.to_string()));
        if let Some(prediction_id) = &outcome.prediction_id {
            metadata.insert("prediction_id".to_string(), json!(prediction_id));
        }

        let artwork = Artwork {
            image_url: outcome.image_url.clone(),
            prompt: request.prompt,
            negative_prompt: request.negative_prompt,
            backend: outcome.backend.clone(),
            metadata,
        };
        context.push_message(format!("image: {} via {}", artwork.image_url, artwork.backend));

        let mut payload = EventPayload::new();
        payload.insert("image_url".to_string(), json!(artwork.image_url));
        payload.insert("backend".to_string(), json!(artwork.backend));
        payload.insert("attempt_count".to_string(), json!(outcome.attempts.len()));
        self.events
            .record(EventLevel::Info, "chain_completed", payload);

        ChainResult {
            success: true,
            artwork: Some(artwork),
            error: None,
            failed_step: None,
            messages: context.messages().to_vec(),
            attempts: outcome.attempts,
            context,
        }
    }

    fn chain_failed(
        &self,
        context: AgentContext,
        err: &GenerationError,
        step: Option<StepId>,
    ) -> ChainResult {
        let mut payload = EventPayload::new();
        payload.insert("kind".to_string(), json!(err.kind()));
        payload.insert("error".to_string(), json!(err.to_string()));
        if let Some(step) = step {
            payload.insert("step".to_string(), json!(step));
        }
        self.events
            .record(EventLevel::Error, "chain_failed", payload);
        ChainResult::failed(context, err, step)
    }

    fn step_event(
        &self,
        level: EventLevel,
        event_type: &str,
        step: &ChainStep,
        err: Option<&GenerationError>,
    ) {
        let mut payload = EventPayload::new();
        payload.insert("step".to_string(), json!(step.id()));
        payload.insert("policy".to_string(), json!(step.policy));
        if let Some(err) = err {
            payload.insert("error".to_string(), json!(err.to_string()));
        }
        if event_type == "step_substituted" {
            let requested: Vec<&str> = step.role.produces().iter().map(ContextKey::as_str).collect();
            payload.insert("requested".to_string(), json!(requested));
            payload.insert("delivered".to_string(), json!("untransformed input"));
        }
        self.events.record(level, event_type, payload);
    }
}

fn initial_context(input: &ChainInput) -> AgentContext {
    let mut context = AgentContext::new(input.concept.trim());
    if !input.forced_attributes.is_empty() {
        context.set(
            ContextKey::ForcedAttributes,
            Value::Object(input.forced_attributes.clone()),
        );
    }
    for (key, value) in [
        (ContextKey::Series, &input.series),
        (ContextKey::Category, &input.category),
    ] {
        if let Some(value) = value.as_deref().map(str::trim).filter(|value| !value.is_empty()) {
            context.set(key, Value::String(value.to_string()));
        }
    }
    context
}
