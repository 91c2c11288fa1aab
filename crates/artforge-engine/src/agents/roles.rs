use artforge_contracts::context::{AgentContext, ContextKey};
use artforge_contracts::{GenerationError, StepId};
use serde_json::{json, Map, Value};

use super::{prompts, FailurePolicy};
use crate::text::{ChatMessage, CompletionRequest, TextCompleter};

/// One step of the agent chain: a function from context to context that may
/// call the text collaborator.
pub trait AgentRole: Send + Sync {
    fn id(&self) -> StepId;

    fn default_policy(&self) -> FailurePolicy;

    /// Keys this role writes; reported when a substitution happens.
    fn produces(&self) -> &'static [ContextKey];

    fn transform(
        &self,
        context: &AgentContext,
        text: &dyn TextCompleter,
    ) -> Result<AgentContext, GenerationError>;

    /// Fallback when `transform` failed: hand the input on untransformed,
    /// filling only what later steps need to read.
    fn substitute(&self, context: AgentContext) -> AgentContext {
        context
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Ideator;

#[derive(Debug, Clone, Copy, Default)]
pub struct Stylist;

#[derive(Debug, Clone, Copy, Default)]
pub struct Refiner;

#[derive(Debug, Clone, Copy, Default)]
pub struct CharacterGenerator;

#[derive(Debug, Clone, Copy, Default)]
pub struct Critic;

#[derive(Debug, Clone, Copy, Default)]
pub struct MetadataGenerator;

impl AgentRole for Ideator {
    fn id(&self) -> StepId {
        StepId::Ideator
    }

    fn default_policy(&self) -> FailurePolicy {
        FailurePolicy::PropagateOnFailure
    }

    fn produces(&self) -> &'static [ContextKey] {
        &[ContextKey::Prompt]
    }

    fn transform(
        &self,
        context: &AgentContext,
        text: &dyn TextCompleter,
    ) -> Result<AgentContext, GenerationError> {
        let messages = prompts::ideator(context.concept(), &context.forced_attributes());
        let prompt = complete_text(self.id(), text, messages, 0.9)?;
        Ok(context.clone().with(ContextKey::Prompt, Value::String(prompt)))
    }
}

impl AgentRole for Stylist {
    fn id(&self) -> StepId {
        StepId::Stylist
    }

    fn default_policy(&self) -> FailurePolicy {
        FailurePolicy::SubstituteOnFailure
    }

    fn produces(&self) -> &'static [ContextKey] {
        &[ContextKey::Style, ContextKey::Prompt]
    }

    fn transform(
        &self,
        context: &AgentContext,
        text: &dyn TextCompleter,
    ) -> Result<AgentContext, GenerationError> {
        let prompt = context.current_prompt().to_string();
        let style = complete_text(self.id(), text, prompts::stylist(&prompt), 0.8)?;
        let styled = format!("{prompt}, {style}");
        Ok(context
            .clone()
            .with(ContextKey::Style, Value::String(style))
            .with(ContextKey::Prompt, Value::String(styled)))
    }
}

impl AgentRole for Refiner {
    fn id(&self) -> StepId {
        StepId::Refiner
    }

    fn default_policy(&self) -> FailurePolicy {
        FailurePolicy::SubstituteOnFailure
    }

    fn produces(&self) -> &'static [ContextKey] {
        &[ContextKey::RefinedPrompt, ContextKey::NegativePrompt]
    }

    fn transform(
        &self,
        context: &AgentContext,
        text: &dyn TextCompleter,
    ) -> Result<AgentContext, GenerationError> {
        let messages = prompts::refiner(
            context.current_prompt(),
            context.get_str(ContextKey::Style),
        );
        let reply = complete_text(self.id(), text, messages, 0.4)?;
        let mut next = context.clone();
        match RoleReply::find(self.id(), &reply) {
            Some(parsed) => {
                next.set(ContextKey::RefinedPrompt, Value::String(parsed.require("prompt")?));
                if let Some(negative) = parsed.text("negative_prompt") {
                    next.set(ContextKey::NegativePrompt, Value::String(negative));
                }
            }
            None => next.set(
                ContextKey::RefinedPrompt,
                Value::String(strip_code_fence(&reply).to_string()),
            ),
        }
        Ok(next)
    }

    fn substitute(&self, context: AgentContext) -> AgentContext {
        let prompt = context.current_prompt().to_string();
        context.with(ContextKey::RefinedPrompt, Value::String(prompt))
    }
}

impl AgentRole for CharacterGenerator {
    fn id(&self) -> StepId {
        StepId::CharacterGenerator
    }

    fn default_policy(&self) -> FailurePolicy {
        FailurePolicy::SubstituteOnFailure
    }

    fn produces(&self) -> &'static [ContextKey] {
        &[ContextKey::Character]
    }

    fn transform(
        &self,
        context: &AgentContext,
        text: &dyn TextCompleter,
    ) -> Result<AgentContext, GenerationError> {
        let forced = context.forced_attributes();
        let reply = complete_text(
            self.id(),
            text,
            prompts::character(context.current_prompt(), &forced),
            0.9,
        )?;
        let parsed = RoleReply::parse(self.id(), &reply)?;
        parsed.require("name")?;
        let mut character = parsed.object;
        if !forced.is_empty() {
            character.insert("attributes".to_string(), Value::Object(forced));
        }
        Ok(context
            .clone()
            .with(ContextKey::Character, Value::Object(character)))
    }

    fn substitute(&self, context: AgentContext) -> AgentContext {
        let forced = context.forced_attributes();
        if forced.is_empty() {
            return context;
        }
        context.with(ContextKey::Character, json!({ "attributes": forced }))
    }
}

impl AgentRole for Critic {
    fn id(&self) -> StepId {
        StepId::Critic
    }

    fn default_policy(&self) -> FailurePolicy {
        FailurePolicy::SubstituteOnFailure
    }

    fn produces(&self) -> &'static [ContextKey] {
        &[ContextKey::Critique, ContextKey::RefinedPrompt]
    }

    fn transform(
        &self,
        context: &AgentContext,
        text: &dyn TextCompleter,
    ) -> Result<AgentContext, GenerationError> {
        let reply = complete_text(
            self.id(),
            text,
            prompts::critic(context.current_prompt(), context.concept()),
            0.2,
        )?;
        let parsed = RoleReply::parse(self.id(), &reply)?;
        let score = parsed
            .object
            .get("score")
            .and_then(|value| {
                value
                    .as_f64()
                    .or_else(|| value.as_str().and_then(|raw| raw.trim().parse().ok()))
            })
            .map(|score| score.clamp(0.0, 10.0));
        let mut critique = Map::new();
        critique.insert("score".to_string(), json!(score));
        critique.insert(
            "feedback".to_string(),
            json!(parsed.text("feedback").unwrap_or_default()),
        );

        let mut next = context.clone();
        if let Some(revised) = parsed.text("revised_prompt") {
            critique.insert("revised".to_string(), Value::Bool(true));
            next.set(ContextKey::RefinedPrompt, Value::String(revised));
        }
        next.set(ContextKey::Critique, Value::Object(critique));
        Ok(next)
    }
}

impl AgentRole for MetadataGenerator {
    fn id(&self) -> StepId {
        StepId::MetadataGenerator
    }

    fn default_policy(&self) -> FailurePolicy {
        FailurePolicy::PropagateOnFailure
    }

    fn produces(&self) -> &'static [ContextKey] {
        &[ContextKey::Metadata]
    }

    fn transform(
        &self,
        context: &AgentContext,
        text: &dyn TextCompleter,
    ) -> Result<AgentContext, GenerationError> {
        let reply = complete_text(
            self.id(),
            text,
            prompts::metadata(
                context.current_prompt(),
                context.get_object(ContextKey::Character),
            ),
            0.3,
        )?;
        let parsed = RoleReply::parse(self.id(), &reply)?;
        let title = parsed.require("title")?;
        let description = parsed.text("description").unwrap_or_default();
        let tags = string_list(parsed.object.get("tags"), 12);

        let metadata = base_metadata(context, title, description, tags);
        Ok(context
            .clone()
            .with(ContextKey::Metadata, Value::Object(metadata)))
    }

    fn substitute(&self, context: AgentContext) -> AgentContext {
        let title = context.concept().to_string();
        let description = context.current_prompt().to_string();
        let metadata = base_metadata(&context, title, description, Vec::new());
        context.with(ContextKey::Metadata, Value::Object(metadata))
    }
}

/// The six roles in chain order.
pub fn default_roles() -> Vec<Box<dyn AgentRole>> {
    vec![
        Box::new(Ideator),
        Box::new(Stylist),
        Box::new(Refiner),
        Box::new(CharacterGenerator),
        Box::new(Critic),
        Box::new(MetadataGenerator),
    ]
}

fn base_metadata(
    context: &AgentContext,
    title: String,
    description: String,
    tags: Vec<String>,
) -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert("title".to_string(), Value::String(title));
    metadata.insert("description".to_string(), Value::String(description));
    metadata.insert("tags".to_string(), json!(tags));
    metadata.insert(
        "concept".to_string(),
        Value::String(context.concept().to_string()),
    );
    let forced = context.forced_attributes();
    if !forced.is_empty() {
        metadata.insert("attributes".to_string(), Value::Object(forced));
    }
    for key in [ContextKey::Series, ContextKey::Category] {
        if let Some(value) = context.get_str(key) {
            metadata.insert(key.as_str().to_string(), Value::String(value.to_string()));
        }
    }
    metadata
}

fn complete_text(
    step: StepId,
    text: &dyn TextCompleter,
    messages: Vec<ChatMessage>,
    temperature: f64,
) -> Result<String, GenerationError> {
    let completion = text.complete(&CompletionRequest {
        messages,
        temperature,
        model: None,
    })?;
    let content = completion.content.trim();
    if content.is_empty() {
        return Err(step_error(step, "empty completion"));
    }
    Ok(content.to_string())
}

fn step_error(step: StepId, message: &str) -> GenerationError {
    GenerationError::TextStep {
        step,
        message: message.to_string(),
    }
}

fn string_field(object: &Map<String, Value>, key: &str) -> Option<String> {
    object
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn string_list(value: Option<&Value>, max_items: usize) -> Vec<String> {
    let mut items: Vec<String> = Vec::new();
    let raw: Vec<&str> = match value {
        Some(Value::Array(rows)) => rows.iter().filter_map(Value::as_str).collect(),
        Some(Value::String(text)) => text.split(',').collect(),
        _ => Vec::new(),
    };
    for item in raw {
        let item = item.trim();
        if item.is_empty() || items.iter().any(|existing| existing.eq_ignore_ascii_case(item)) {
            continue;
        }
        items.push(item.to_string());
        if items.len() >= max_items {
            break;
        }
    }
    items
}

/// A role's completion read as a JSON object. Errors name the step.
struct RoleReply {
    step: StepId,
    object: Map<String, Value>,
}

impl RoleReply {
    fn find(step: StepId, reply: &str) -> Option<Self> {
        json_object_in(reply).map(|object| Self { step, object })
    }

    fn parse(step: StepId, reply: &str) -> Result<Self, GenerationError> {
        Self::find(step, reply).ok_or_else(|| step_error(step, "reply was not a JSON object"))
    }

    fn text(&self, key: &str) -> Option<String> {
        string_field(&self.object, key)
    }

    fn require(&self, key: &str) -> Result<String, GenerationError> {
        self.text(key).ok_or_else(|| GenerationError::TextStep {
            step: self.step,
            message: format!("reply is missing '{key}'"),
        })
    }
}

/// Body of a fenced block without its info string; other text is only trimmed.
fn strip_code_fence(text: &str) -> &str {
    let raw = text.trim();
    let Some(inner) = raw
        .strip_prefix("```")
        .and_then(|rest| rest.strip_suffix("```"))
    else {
        return raw;
    };
    inner.split_once('\n').map_or(inner, |(_, body)| body).trim()
}

/// The whole reply as an object, or else the outermost `{..}` span in it.
fn json_object_in(text: &str) -> Option<Map<String, Value>> {
    let raw = strip_code_fence(text);
    let braced = match (raw.find('{'), raw.rfind('}')) {
        (Some(start), Some(end)) if end > start => Some(&raw[start..=end]),
        _ => None,
    };
    [Some(raw), braced]
        .into_iter()
        .flatten()
        .find_map(|candidate| match serde_json::from_str(candidate) {
            Ok(Value::Object(object)) => Some(object),
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use artforge_contracts::context::{AgentContext, ContextKey};
    use artforge_contracts::{GenerationError, StepId};
    use serde_json::json;

    use super::{
        json_object_in, strip_code_fence, AgentRole, CharacterGenerator, Critic, MetadataGenerator,
        Refiner, Stylist,
    };
    use crate::text::testing::ScriptedCompleter;

    #[test]
    fn json_is_found_inside_fences_and_prose() {
        let fenced = "```json\n{\"prompt\": \"bear\"}\n```";
        assert_eq!(json_object_in(fenced).unwrap()["prompt"], json!("bear"));
        let prose = "Sure! Here it is: {\"title\": \"Bruno\"} Enjoy.";
        assert_eq!(json_object_in(prose).unwrap()["title"], json!("Bruno"));
        assert!(json_object_in("no json here").is_none());
        assert!(json_object_in("").is_none());
        assert!(json_object_in("[1, 2]").is_none());
    }

    #[test]
    fn code_fence_info_string_is_dropped() {
        assert_eq!(strip_code_fence("```text\na bear\n```"), "a bear");
        assert_eq!(strip_code_fence("```a bear```"), "a bear");
        assert_eq!(strip_code_fence("  plain reply  "), "plain reply");
    }

    #[test]
    fn missing_required_field_names_the_step_and_key() {
        let text = ScriptedCompleter::ok(&[r#"{"description": "no title"}"#]);
        let err = MetadataGenerator
            .transform(&AgentContext::new("bear"), &text)
            .unwrap_err();
        let GenerationError::TextStep { step, message } = err else {
            panic!("expected a text step error, got {err:?}");
        };
        assert_eq!(step, StepId::MetadataGenerator);
        assert!(message.contains("'title'"));
    }

    #[test]
    fn stylist_concatenates_style_onto_prompt() {
        let text = ScriptedCompleter::ok(&["oil painting, warm light"]);
        let context = AgentContext::new("a bear portrait")
            .with(ContextKey::Prompt, json!("a regal bear"));
        let next = Stylist.transform(&context, &text).unwrap();
        assert_eq!(
            next.get_str(ContextKey::Prompt),
            Some("a regal bear, oil painting, warm light")
        );
        assert_eq!(next.get_str(ContextKey::Style), Some("oil painting, warm light"));
        assert_eq!(text.requests.lock().unwrap()[0].temperature, 0.8);
    }

    #[test]
    fn refiner_reads_prompt_and_negative_prompt() {
        let text = ScriptedCompleter::ok(&[
            "```json\n{\"prompt\": \"regal bear, oil\", \"negative_prompt\": \"blurry\"}\n```",
        ]);
        let next = Refiner
            .transform(&AgentContext::new("a bear portrait"), &text)
            .unwrap();
        assert_eq!(next.get_str(ContextKey::RefinedPrompt), Some("regal bear, oil"));
        assert_eq!(next.get_str(ContextKey::NegativePrompt), Some("blurry"));
    }

    #[test]
    fn refiner_substitution_keeps_current_prompt() {
        let context = AgentContext::new("a bear portrait")
            .with(ContextKey::Prompt, json!("a regal bear"));
        let next = Refiner.substitute(context);
        assert_eq!(next.get_str(ContextKey::RefinedPrompt), Some("a regal bear"));
    }

    #[test]
    fn character_honors_forced_attributes() {
        let text = ScriptedCompleter::ok(&[
            r#"{"name": "Bruno", "backstory": "Raised by monks.", "traits": ["wise"]}"#,
        ]);
        let context = AgentContext::new("a bear portrait")
            .with(ContextKey::ForcedAttributes, json!({ "hat": "crown" }));
        let next = CharacterGenerator.transform(&context, &text).unwrap();
        let character = next.get_object(ContextKey::Character).unwrap();
        assert_eq!(character["name"], json!("Bruno"));
        assert_eq!(character["attributes"], json!({ "hat": "crown" }));
        let sent = &text.requests.lock().unwrap()[0].messages[1].content;
        assert!(sent.contains("hat=crown"));
    }

    #[test]
    fn character_without_name_is_a_step_error() {
        let text = ScriptedCompleter::ok(&[r#"{"backstory": "?"}"#]);
        let err = CharacterGenerator
            .transform(&AgentContext::new("bear"), &text)
            .unwrap_err();
        assert!(matches!(
            err,
            GenerationError::TextStep {
                step: StepId::CharacterGenerator,
                ..
            }
        ));
    }

    #[test]
    fn critic_revision_replaces_refined_prompt() {
        let text = ScriptedCompleter::ok(&[
            r#"{"score": "7", "feedback": "needs light", "revised_prompt": "regal bear, golden hour"}"#,
        ]);
        let context = AgentContext::new("a bear portrait")
            .with(ContextKey::RefinedPrompt, json!("regal bear"));
        let next = Critic.transform(&context, &text).unwrap();
        assert_eq!(
            next.get_str(ContextKey::RefinedPrompt),
            Some("regal bear, golden hour")
        );
        assert_eq!(next.get_object(ContextKey::Critique).unwrap()["score"], json!(7.0));
    }

    #[test]
    fn metadata_carries_series_category_and_attributes() {
        let text = ScriptedCompleter::ok(&[
            r#"{"title": "Bruno", "description": "A bear.", "tags": ["bear", "Bear", "oil"]}"#,
        ]);
        let context = AgentContext::new("a bear portrait")
            .with(ContextKey::Series, json!("forest-kings"))
            .with(ContextKey::Category, json!("animals"))
            .with(ContextKey::ForcedAttributes, json!({ "hat": "crown" }));
        let next = MetadataGenerator.transform(&context, &text).unwrap();
        let metadata = next.get_object(ContextKey::Metadata).unwrap();
        assert_eq!(metadata["title"], json!("Bruno"));
        assert_eq!(metadata["tags"], json!(["bear", "oil"]));
        assert_eq!(metadata["series"], json!("forest-kings"));
        assert_eq!(metadata["category"], json!("animals"));
        assert_eq!(metadata["attributes"], json!({ "hat": "crown" }));
    }
}
