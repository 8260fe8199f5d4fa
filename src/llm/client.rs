//! OpenAI-compatible chat completions client (OpenRouter by default)

use anyhow::{bail, Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: String,
    /// Extra headers (X-Title, HTTP-Referer)
    pub extra_headers: Vec<(String, String)>,
}

impl ProviderConfig {
    pub fn openrouter(api_key: String) -> Self {
        Self {
            base_url: OPENROUTER_BASE_URL.to_string(),
            api_key,
            extra_headers: vec![("X-Title".to_string(), "postline".to_string())],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: Value,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system",
            content: Value::String(content.into()),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user",
            content: Value::String(content.into()),
        }
    }

    /// User message carrying a base64 image alongside the text
    pub fn user_with_image(text: impl Into<String>, image_base64: &str, media_type: &str) -> Self {
        Self {
            role: "user",
            content: serde_json::json!([
                { "type": "text", "text": text.into() },
                { "type": "image_url", "image_url": { "url": format!("data:{};base64,{}", media_type, image_base64) } }
            ]),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<Value>,
    #[serde(default)]
    refusal: Option<Value>,
}

/// Reply of one completion
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Text(String),
    Refused(String),
}

#[derive(Clone)]
pub struct LlmClient {
    client: Client,
    provider: ProviderConfig,
}

impl LlmClient {
    pub fn new(provider: ProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client, provider })
    }

    /// Client keyed from the environment, keyring or key file
    pub fn from_stored_key() -> Result<Self> {
        Self::new(ProviderConfig::openrouter(super::keys::get_api_key()?))
    }

    pub async fn complete(&self, model: &str, messages: &[ChatMessage], max_tokens: Option<u32>) -> Result<Completion> {
        let request = ChatRequest {
            model,
            messages,
            max_tokens,
            temperature: 0.2,
        };

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.provider.base_url))
            .bearer_auth(&self.provider.api_key);
        for (key, value) in &self.provider.extra_headers {
            builder = builder.header(key.as_str(), value.as_str());
        }

        let response = builder
            .json(&request)
            .send()
            .await
            .context("Failed to send request to LLM provider")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("LLM API error ({}): {}", status, truncate(&body, 300));
        }

        let body: ChatResponse = response.json().await.context("Failed to parse LLM response")?;
        let message = body
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .context("LLM response had no choices")?;

        if let Some(refusal) = message.refusal.as_ref().and_then(content_text) {
            if !refusal.trim().is_empty() {
                return Ok(Completion::Refused(refusal));
            }
        }
        let text = message.content.as_ref().and_then(content_text).unwrap_or_default();
        debug!("LLM {} replied with {} chars", model, text.len());
        Ok(Completion::Text(text))
    }
}

/// Content arrives as a string or as an array of typed parts
fn content_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(parts) => {
            let texts: Vec<&str> = parts
                .iter()
                .filter(|p| p.get("type").and_then(|t| t.as_str()) == Some("text"))
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect();
            if texts.is_empty() {
                None
            } else {
                Some(texts.join(""))
            }
        }
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Truncate on a char boundary
pub(crate) fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
