use serde_json::{Map, Value};

use crate::text::ChatMessage;

pub(super) fn ideator(concept: &str, forced: &Map<String, Value>) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(
            "You turn a short art concept into one vivid image prompt. \
             Reply with the prompt only.",
        ),
        ChatMessage::user(format!(
            "Concept: {concept}{}",
            forced_suffix(forced)
        )),
    ]
}

pub(super) fn stylist(prompt: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(
            "You pick an art style for an image prompt: medium, palette, lighting. \
             Reply with a short comma-separated style phrase only.",
        ),
        ChatMessage::user(format!("Prompt: {prompt}")),
    ]
}

pub(super) fn refiner(prompt: &str, style: Option<&str>) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(
            "You tighten image prompts for diffusion models. Reply with JSON: \
             {\"prompt\": string, \"negative_prompt\": string}.",
        ),
        ChatMessage::user(format!(
            "Prompt: {prompt}\nStyle: {}",
            style.unwrap_or("none")
        )),
    ]
}

pub(super) fn character(prompt: &str, forced: &Map<String, Value>) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(
            "You invent the character shown in an artwork. Reply with JSON: \
             {\"name\": string, \"backstory\": string, \"traits\": [string]}.",
        ),
        ChatMessage::user(format!("Artwork: {prompt}{}", forced_suffix(forced))),
    ]
}

pub(super) fn critic(prompt: &str, concept: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(
            "You review an image prompt against its concept. Reply with JSON: \
             {\"score\": number 1-10, \"feedback\": string, \"revised_prompt\": string or null}.",
        ),
        ChatMessage::user(format!("Concept: {concept}\nPrompt: {prompt}")),
    ]
}

pub(super) fn metadata(prompt: &str, character: Option<&Map<String, Value>>) -> Vec<ChatMessage> {
    let character = character
        .and_then(|value| serde_json::to_string(value).ok())
        .unwrap_or_else(|| "none".to_string());
    vec![
        ChatMessage::system(
            "You write collection metadata for an artwork. Reply with JSON: \
             {\"title\": string, \"description\": string, \"tags\": [string]}.",
        ),
        ChatMessage::user(format!("Prompt: {prompt}\nCharacter: {character}")),
    ]
}

fn forced_suffix(forced: &Map<String, Value>) -> String {
    if forced.is_empty() {
        return String::new();
    }
    let pairs: Vec<String> = forced
        .iter()
        .map(|(key, value)| match value {
            Value::String(text) => format!("{key}={text}"),
            other => format!("{key}={other}"),
        })
        .collect();
    format!("\nRequired attributes: {}", pairs.join(", "))
}
