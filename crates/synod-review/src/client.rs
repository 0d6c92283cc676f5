use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use synod_core::{ModelEntry, SynodError};

/// A message in a chat conversation with an AI model.
///
/// # Examples
///
/// ```
/// use synod_review::client::{ChatMessage, Role};
///
/// let msg = ChatMessage {
///     role: Role::User,
///     content: "Review this code".into(),
/// };
/// assert!(matches!(msg.role, Role::User));
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    /// Role of the message sender.
    pub role: Role,
    /// Text content of the message.
    pub content: String,
}

/// Role in the chat conversation.
///
/// # Examples
///
/// ```
/// use synod_review::client::Role;
///
/// let role = Role::System;
/// assert_eq!(serde_json::to_string(&role).unwrap(), "\"system\"");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System-level instructions.
    System,
    /// User input.
    User,
    /// Assistant response.
    Assistant,
}

/// One member of the review panel.
///
/// The reviewer stage only depends on this trait, so tests can substitute
/// scripted backends for live HTTP clients.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Model identifier, used as the `ai:<model>` finding source.
    fn name(&self) -> &str;

    /// Upper bound on one completion call.
    fn call_timeout(&self) -> Duration {
        Duration::from_secs(120)
    }

    /// Send a chat completion request and return the text response.
    async fn complete(&self, messages: Vec<ChatMessage>) -> Result<String, SynodError>;
}

/// OpenAI-compatible chat completions client for one panel model.
///
/// Works with any provider that exposes the `/v1/chat/completions` endpoint:
/// OpenAI, Ollama, vLLM, LiteLLM, etc. The API key is read from the
/// environment variable named in the model entry when the client is built.
///
/// # Examples
///
/// ```
/// use synod_core::ModelEntry;
/// use synod_review::client::ModelClient;
///
/// let client = ModelClient::new(&ModelEntry::default()).unwrap();
/// ```
pub struct ModelClient {
    client: reqwest::Client,
    entry: ModelEntry,
    api_key: Option<String>,
}

impl ModelClient {
    /// Create a client for one model entry.
    ///
    /// # Errors
    ///
    /// Returns [`SynodError::Model`] if the HTTP client cannot be built.
    pub fn new(entry: &ModelEntry) -> Result<Self, SynodError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(entry.timeout_secs))
            .build()
            .map_err(|e| SynodError::Model(format!("failed to create HTTP client: {e}")))?;
        let api_key = std::env::var(&entry.api_key_env)
            .ok()
            .filter(|k| !k.is_empty());
        Ok(Self {
            client,
            entry: entry.clone(),
            api_key,
        })
    }
}

#[async_trait]
impl ModelBackend for ModelClient {
    fn name(&self) -> &str {
        &self.entry.name
    }

    fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.entry.timeout_secs)
    }

    /// Send a chat completion request and return the text response.
    ///
    /// Builds a request to `{base_url}/v1/chat/completions` with the given
    /// messages, the entry's temperature, and JSON response format.
    ///
    /// # Errors
    ///
    /// Returns [`SynodError::Model`] on HTTP errors or response parsing
    /// failures.
    async fn complete(&self, messages: Vec<ChatMessage>) -> Result<String, SynodError> {
        let url = format!(
            "{}/v1/chat/completions",
            self.entry.base_url.trim_end_matches('/')
        );

        let body = serde_json::json!({
            "model": self.entry.name,
            "messages": messages,
            "temperature": self.entry.temperature,
            "response_format": { "type": "json_object" },
        });

        let mut request = self.client.post(&url);
        if let Some(api_key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {api_key}"));
        }
        request = request.header("Content-Type", "application/json");

        let response = request
            .json(&body)
            .send()
            .await
            .map_err(|e| SynodError::Model(format!("{}: request failed: {e}", self.entry.name)))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(SynodError::Model(format!(
                "{}: API error {status}: {body_text}",
                self.entry.name
            )));
        }

        let response_body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| SynodError::Model(format!("{}: failed to parse response: {e}", self.entry.name)))?;

        let content = response_body
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| {
                SynodError::Model(format!(
                    "{}: unexpected response structure: {response_body}",
                    self.entry.name
                ))
            })?;

        Ok(content.to_string())
    }
}
