//! Model endpoint client
//!
//! OpenAI-compatible chat-completions client. Every capability goes
//! through the `ModelInvoker` trait so tests can substitute canned
//! completions instead of a live endpoint.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use crate::capability::CapabilityConfig;
use crate::error::ModelError;

/// One turn of a chat-completions conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
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

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
}

/// Black-box completion capability.
#[async_trait]
pub trait ModelInvoker: Send + Sync {
    /// Run a chat completion and return the assistant text.
    async fn complete(
        &self,
        cfg: &CapabilityConfig,
        messages: &[ChatMessage],
    ) -> Result<String, ModelError>;

    /// Describe an image (base64-encoded) for prompt injection.
    async fn describe_image(
        &self,
        cfg: &CapabilityConfig,
        image_base64: &str,
        instruction: &str,
    ) -> Result<String, ModelError>;
}

/// HTTP client against an OpenAI-compatible `/chat/completions`
/// endpoint.
pub struct HttpModelClient {
    client: reqwest::Client,
}

impl HttpModelClient {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self { client }
    }

    async fn post_completion(
        &self,
        cfg: &CapabilityConfig,
        body: serde_json::Value,
    ) -> Result<String, ModelError> {
        let url = format!("{}/chat/completions", cfg.base_url.trim_end_matches('/'));
        debug!(scope = cfg.scope.as_str(), model = %cfg.model, "model call");

        let mut request = self.client.post(&url).json(&body);
        // Local endpoints run without a key.
        if !cfg.api_key.is_empty() {
            request = request.header("Authorization", format!("Bearer {}", cfg.api_key));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Endpoint { status, body });
        }

        let raw = response.text().await?;
        let parsed: ChatCompletionResponse =
            serde_json::from_str(&raw).map_err(|e| ModelError::Malformed(e.to_string()))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();

        if content.trim().is_empty() {
            return Err(ModelError::EmptyCompletion);
        }
        Ok(content)
    }
}

impl Default for HttpModelClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelInvoker for HttpModelClient {
    async fn complete(
        &self,
        cfg: &CapabilityConfig,
        messages: &[ChatMessage],
    ) -> Result<String, ModelError> {
        let body = json!({
            "model": cfg.model,
            "messages": messages,
            "temperature": cfg.temperature,
            "max_tokens": cfg.max_tokens,
        });
        self.post_completion(cfg, body).await
    }

    async fn describe_image(
        &self,
        cfg: &CapabilityConfig,
        image_base64: &str,
        instruction: &str,
    ) -> Result<String, ModelError> {
        let body = json!({
            "model": cfg.model,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": instruction },
                    {
                        "type": "image_url",
                        "image_url": { "url": format!("data:image/jpeg;base64,{}", image_base64) }
                    }
                ]
            }],
            "temperature": cfg.temperature,
            "max_tokens": cfg.max_tokens,
        });
        self.post_completion(cfg, body).await
    }
}

/// Pull a JSON object out of a model completion. Models wrap JSON in
/// prose or markdown fences more often than not; try strict parsing
/// first, then a fenced block, then the outermost brace pair.
pub(crate) fn extract_json(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if serde_json::from_str::<serde_json::Value>(trimmed).is_ok() {
        return Some(trimmed.to_string());
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if !inner.is_empty() {
                return Some(inner.to_string());
            }
        }
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end > start {
        return Some(trimmed[start..=end].to_string());
    }
    None
}
