use std::time::Duration;

use artforge_contracts::GenerationError;
use reqwest::blocking::Client as HttpClient;
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::backends::{http_client, network_error, response_json_or_error};
use crate::config::EngineConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: f64,
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub content: String,
}

/// Text-completion collaborator used by the agent roles.
pub trait TextCompleter: Send + Sync {
    fn complete(&self, request: &CompletionRequest) -> Result<Completion, GenerationError>;
}

/// OpenAI-style `/chat/completions` client.
#[derive(Debug, Clone)]
pub struct OpenAiChat {
    api_base: String,
    api_key: Option<String>,
    default_model: String,
    http: HttpClient,
}

const NAME: &str = "openai-chat";

impl OpenAiChat {
    pub fn new(
        api_base: impl Into<String>,
        api_key: Option<String>,
        default_model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, GenerationError> {
        Ok(Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key,
            default_model: default_model.into(),
            http: http_client(NAME, timeout)?,
        })
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self, GenerationError> {
        Self::new(
            config.openai_api_base.clone(),
            config.openai_api_key.clone(),
            config.text_model.clone(),
            config.http_timeout,
        )
    }
}

impl TextCompleter for OpenAiChat {
    fn complete(&self, request: &CompletionRequest) -> Result<Completion, GenerationError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| GenerationError::Configuration("OPENAI_API_KEY not set".to_string()))?;
        let model = request
            .model
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(&self.default_model);
        let payload = json!({
            "model": model,
            "messages": request.messages,
            "temperature": request.temperature,
        });
        let endpoint = format!("{}/chat/completions", self.api_base);
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(api_key)
            .header(CONTENT_TYPE, "application/json")
            .json(&payload)
            .send()
            .map_err(|err| network_error(NAME, &err))?;
        let body = response_json_or_error(NAME, response)?;
        let content = extract_message_text(&body).ok_or_else(|| GenerationError::Decode {
            backend: NAME.to_string(),
            message: "completion returned no message content".to_string(),
        })?;
        Ok(Completion { content })
    }
}

fn extract_message_text(body: &Value) -> Option<String> {
    body.pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use artforge_contracts::GenerationError;

    use super::{Completion, CompletionRequest, TextCompleter};

    /// Replies in order; records every request it saw.
    #[derive(Default)]
    pub struct ScriptedCompleter {
        replies: Mutex<VecDeque<Result<String, GenerationError>>>,
        pub requests: Mutex<Vec<CompletionRequest>>,
    }

    impl ScriptedCompleter {
        pub fn new(replies: Vec<Result<String, GenerationError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn ok(replies: &[&str]) -> Self {
            Self::new(replies.iter().map(|reply| Ok(reply.to_string())).collect())
        }

        pub fn call_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    impl TextCompleter for ScriptedCompleter {
        fn complete(&self, request: &CompletionRequest) -> Result<Completion, GenerationError> {
            self.requests.lock().unwrap().push(request.clone());
            let reply = self.replies.lock().unwrap().pop_front().unwrap_or_else(|| {
                Err(GenerationError::Network {
                    backend: "scripted".to_string(),
                    message: "no scripted reply left".to_string(),
                    retryable: false,
                })
            });
            reply.map(|content| Completion { content })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use artforge_contracts::GenerationError;
    use serde_json::{json, Value};

    use super::{ChatMessage, CompletionRequest, OpenAiChat, TextCompleter};
    use crate::backends::stub::StubServer;

    fn request() -> CompletionRequest {
        CompletionRequest {
            messages: vec![
                ChatMessage::system("You are an art director."),
                ChatMessage::user("a bear portrait"),
            ],
            temperature: 0.4,
            model: None,
        }
    }

    #[test]
    fn complete_posts_messages_and_reads_first_choice() {
        let server = StubServer::start(vec![(
            200,
            json!({ "choices": [{ "message": { "role": "assistant", "content": " A regal bear. " } }] })
                .to_string(),
        )]);
        let chat = OpenAiChat::new(
            server.base.clone(),
            Some("sk-test".to_string()),
            "gpt-4o-mini",
            Duration::from_secs(5),
        )
        .unwrap();
        let completion = chat.complete(&request()).unwrap();
        let requests = server.finish();

        assert_eq!(completion.content, "A regal bear.");
        assert!(requests[0].request_line.starts_with("POST /chat/completions"));
        let body: Value = serde_json::from_str(&requests[0].body).unwrap();
        assert_eq!(body["model"], json!("gpt-4o-mini"));
        assert_eq!(body["temperature"], json!(0.4));
        assert_eq!(body["messages"][1]["content"], json!("a bear portrait"));
    }

    #[test]
    fn server_error_is_a_rejection() {
        let server = StubServer::start(vec![(
            500,
            json!({ "error": { "message": "overloaded" } }).to_string(),
        )]);
        let chat = OpenAiChat::new(
            server.base.clone(),
            Some("sk-test".to_string()),
            "gpt-4o-mini",
            Duration::from_secs(5),
        )
        .unwrap();
        let err = chat.complete(&request()).unwrap_err();
        server.finish();
        assert!(matches!(
            err,
            GenerationError::BackendRejected { status: Some(500), ref reason, .. } if reason == "overloaded"
        ));
    }
}
