use serde::Serialize;
use serde_json::{Map, Value};

/// Keys the agent chain reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextKey {
    Concept,
    Prompt,
    Style,
    RefinedPrompt,
    NegativePrompt,
    Character,
    Critique,
    Metadata,
    ForcedAttributes,
    Series,
    Category,
}

impl ContextKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextKey::Concept => "concept",
            ContextKey::Prompt => "prompt",
            ContextKey::Style => "style",
            ContextKey::RefinedPrompt => "refinedPrompt",
            ContextKey::NegativePrompt => "negativePrompt",
            ContextKey::Character => "character",
            ContextKey::Critique => "critique",
            ContextKey::Metadata => "metadata",
            ContextKey::ForcedAttributes => "forcedAttributes",
            ContextKey::Series => "series",
            ContextKey::Category => "category",
        }
    }
}

/// Accumulating state threaded through the agent chain. Each step receives
/// the context by value and hands back the updated one, so exactly one
/// step owns it at a time.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AgentContext {
    entries: Map<String, Value>,
    messages: Vec<String>,
}

impl AgentContext {
    pub fn new(concept: impl Into<String>) -> Self {
        let mut context = Self::default();
        context.set(ContextKey::Concept, Value::String(concept.into()));
        context
    }

    pub fn get(&self, key: ContextKey) -> Option<&Value> {
        self.entries.get(key.as_str())
    }

    pub fn get_str(&self, key: ContextKey) -> Option<&str> {
        self.get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn get_object(&self, key: ContextKey) -> Option<&Map<String, Value>> {
        self.get(key).and_then(Value::as_object)
    }

    pub fn set(&mut self, key: ContextKey, value: Value) {
        self.entries.insert(key.as_str().to_string(), value);
    }

    pub fn with(mut self, key: ContextKey, value: Value) -> Self {
        self.set(key, value);
        self
    }

    pub fn concept(&self) -> &str {
        self.get_str(ContextKey::Concept).unwrap_or_default()
    }

    /// Latest prompt text available: refined, then ideated, then the concept.
    pub fn current_prompt(&self) -> &str {
        self.get_str(ContextKey::RefinedPrompt)
            .or_else(|| self.get_str(ContextKey::Prompt))
            .unwrap_or_else(|| self.concept())
    }

    pub fn forced_attributes(&self) -> Map<String, Value> {
        self.get_object(ContextKey::ForcedAttributes)
            .cloned()
            .unwrap_or_default()
    }

    pub fn push_message(&mut self, message: impl Into<String>) {
        self.messages.push(message.into());
    }

    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    pub fn entries(&self) -> &Map<String, Value> {
        &self.entries
    }
}
