//! LLM-backed helpers: caption adaptation, rule parsing, UI questions
//!
//! Every reply is asked for as a single JSON object. Replies are parsed
//! leniently ([`extract_json`]) because models like to wrap JSON in prose
//! or code fences.

pub mod client;
pub mod keys;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::browser::PageSnapshot;
use crate::config::LlmConfig;
use crate::executor::{NoOracle, UiAction, UiAnswer, UiOracle};
use crate::rules::{CommunityMetadata, PolicyParser};
use crate::scheduler::{CaptionAdapter, ContentAdapter};
use crate::types::{AdaptedContent, ContentItem, Destination, Policy};

pub use client::{ChatMessage, Completion, LlmClient, ProviderConfig};

const MAX_TITLE_CHARS: usize = 300;
/// Snapshot text sent with a UI question
const MAX_TREE_CHARS: usize = 12_000;

/// Pull the first JSON object out of a model reply
pub fn extract_json(reply: &str) -> Option<Value> {
    let trimmed = reply.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if value.is_object() {
            return Some(value);
        }
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(&trimmed[start..=end])
        .ok()
        .filter(Value::is_object)
}

/// The model-facing services, all sharing one client
pub struct LlmServices {
    client: LlmClient,
    text_model: String,
    vision_model: String,
}

impl LlmServices {
    pub fn new(client: LlmClient, config: &LlmConfig) -> Self {
        Self {
            client,
            text_model: config.text_model.clone(),
            vision_model: config.vision_model.clone(),
        }
    }

    async fn ask_json(&self, model: &str, system: &str, user: String, max_tokens: u32) -> Result<Option<Value>> {
        let messages = [ChatMessage::system(system), ChatMessage::user(user)];
        match self.client.complete(model, &messages, Some(max_tokens)).await? {
            Completion::Refused(reason) => {
                debug!("Model declined: {}", client::truncate(&reason, 120));
                Ok(None)
            }
            Completion::Text(text) => {
                let value = extract_json(&text)
                    .with_context(|| format!("Model reply was not JSON: {}", client::truncate(&text, 120)))?;
                Ok(Some(value))
            }
        }
    }
}

const CAPTION_PROMPT: &str = "You write post titles for online communities. \
Given a creator's caption, the community and the creator's persona, reply with \
one JSON object {\"title\": string, \"body\": string or null}. Keep the title \
under 300 characters, in the community's tone, without hashtags. If you will not \
write it, reply {\"refused\": true}.";

#[derive(Debug, Deserialize)]
struct CaptionReply {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    refused: bool,
}

fn caption_from_reply(value: Value) -> Result<Option<AdaptedContent>> {
    let reply: CaptionReply = serde_json::from_value(value).context("Unexpected caption reply shape")?;
    if reply.refused {
        return Ok(None);
    }
    let title: String = match reply.title.as_deref().map(str::trim) {
        Some(t) if !t.is_empty() => t.chars().take(MAX_TITLE_CHARS).collect(),
        _ => return Ok(None),
    };
    let body = reply.body.map(|b| b.trim().to_string()).filter(|b| !b.is_empty());
    Ok(Some(AdaptedContent { title, body }))
}

#[async_trait]
impl ContentAdapter for LlmServices {
    async fn adapt(
        &self,
        content: &ContentItem,
        destination: &Destination,
        persona: &str,
    ) -> Result<Option<AdaptedContent>> {
        let user = format!(
            "Community: r/{}{}\nPersona: {}\nStyle: {}\nCaption:\n{}",
            destination.name,
            if destination.nsfw { " (adult)" } else { "" },
            if persona.is_empty() { "(none)" } else { persona },
            content.style.as_deref().unwrap_or("(any)"),
            content.caption
        );
        match self.ask_json(&self.text_model, CAPTION_PROMPT, user, 400).await? {
            Some(value) => caption_from_reply(value),
            None => Ok(None),
        }
    }
}

const POLICY_PROMPT: &str = "You read community rules and extract posting policy. \
Reply with one JSON object with keys nsfw_allowed (bool), requires_flair (bool), \
requires_verification (bool), banned_terms (array of strings, words or phrases the \
rules forbid in titles), max_posts_per_day (integer or null). Use false, [] and null \
when the rules say nothing.";

#[derive(Debug, Deserialize)]
struct PolicyReply {
    #[serde(default = "yes")]
    nsfw_allowed: bool,
    #[serde(default)]
    requires_flair: bool,
    #[serde(default)]
    requires_verification: bool,
    #[serde(default)]
    banned_terms: Vec<String>,
    #[serde(default)]
    max_posts_per_day: Option<u32>,
}

fn yes() -> bool {
    true
}

fn policy_from_reply(value: Value, metadata: &CommunityMetadata) -> Result<Policy> {
    let reply: PolicyReply = serde_json::from_value(value).context("Unexpected policy reply shape")?;
    Ok(Policy {
        nsfw_allowed: reply.nsfw_allowed,
        requires_flair: reply.requires_flair,
        requires_verification: reply.requires_verification,
        banned_terms: reply.banned_terms,
        max_posts_per_day: reply.max_posts_per_day.filter(|n| *n > 0),
        rules_text: metadata.rules.clone(),
        fetched_at: Utc::now(),
    })
}

#[async_trait]
impl PolicyParser for LlmServices {
    async fn parse_policy(&self, metadata: &CommunityMetadata) -> Result<Policy> {
        let mut user = format!("Community: r/{}\nDescription:\n{}\nRules:\n", metadata.name, metadata.description);
        for (i, rule) in metadata.rules.iter().enumerate() {
            user.push_str(&format!("{}. {}\n", i + 1, rule));
        }
        match self.ask_json(&self.text_model, POLICY_PROMPT, user, 500).await? {
            Some(value) => policy_from_reply(value, metadata),
            None => bail!("Model declined to read the rules of r/{}", metadata.name),
        }
    }
}

const UI_PROMPT: &str = "You operate a web page through an accessibility snapshot. \
Interactive nodes carry refs like [@e3]. Answer the question with one JSON object \
{\"action\": \"click\"|\"fill\"|\"select\"|\"none\", \"target\": ref or visible text or null, \
\"options\": [visible choices, if the question is about a list]}. Use \"none\" when \
nothing on the page fits.";

#[derive(Debug, Deserialize)]
struct UiReply {
    #[serde(default)]
    action: String,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    options: Vec<String>,
}

fn ui_answer_from_reply(value: Value) -> Result<UiAnswer> {
    let reply: UiReply = serde_json::from_value(value).context("Unexpected UI reply shape")?;
    let action = UiAction::parse(&reply.action);
    let target = reply
        .target
        .map(|t| t.trim().trim_start_matches('[').trim_end_matches(']').to_string())
        .filter(|t| !t.is_empty());
    if action != UiAction::None && target.is_none() {
        return Ok(UiAnswer {
            options: reply.options,
            ..UiAnswer::nothing()
        });
    }
    Ok(UiAnswer {
        action,
        target,
        options: reply.options,
    })
}

#[async_trait]
impl UiOracle for LlmServices {
    async fn ask_ui(&self, question: &str, snapshot: &PageSnapshot) -> Result<UiAnswer> {
        let user = format!(
            "Page: {} ({})\nSnapshot:\n{}\n\nQuestion: {}",
            snapshot.title,
            snapshot.url,
            client::truncate(&snapshot.tree_text, MAX_TREE_CHARS),
            question
        );
        match self.ask_json(&self.vision_model, UI_PROMPT, user, 200).await? {
            Some(value) => ui_answer_from_reply(value),
            None => Ok(UiAnswer::nothing()),
        }
    }
}

/// Parser used when no model is available; the rule cache then fails open
pub struct NoParser;

#[async_trait]
impl PolicyParser for NoParser {
    async fn parse_policy(&self, metadata: &CommunityMetadata) -> Result<Policy> {
        bail!("No rule parser available for r/{}", metadata.name)
    }
}

/// The three model-backed roles, or their offline stand-ins
pub struct ModelRoles {
    pub adapter: Arc<dyn ContentAdapter>,
    pub parser: Arc<dyn PolicyParser>,
    pub oracle: Arc<dyn UiOracle>,
}

impl ModelRoles {
    pub fn offline() -> Self {
        Self {
            adapter: Arc::new(CaptionAdapter),
            parser: Arc::new(NoParser),
            oracle: Arc::new(NoOracle),
        }
    }

    pub fn from_config(config: &LlmConfig) -> Self {
        if config.disabled {
            return Self::offline();
        }
        match LlmClient::from_stored_key() {
            Ok(client) => {
                let services = Arc::new(LlmServices::new(client, config));
                Self {
                    adapter: services.clone(),
                    parser: services.clone(),
                    oracle: services,
                }
            }
            Err(e) => {
                warn!("LLM unavailable, using caption fallback: {}", e);
                Self::offline()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_json_from_fenced_reply() {
        let reply = "Sure! Here it is:\n```json\n{\"title\": \"Golden hour\", \"body\": null}\n```";
        let value = extract_json(reply).unwrap();
        assert_eq!(value["title"], "Golden hour");
        assert!(extract_json("no json here").is_none());
        assert!(extract_json("[1, 2]").is_none());
    }

    #[test]
    fn test_caption_reply() {
        let adapted = caption_from_reply(json!({"title": "  Morning light  ", "body": ""})).unwrap().unwrap();
        assert_eq!(adapted.title, "Morning light");
        assert!(adapted.body.is_none());

        assert!(caption_from_reply(json!({"refused": true})).unwrap().is_none());
        assert!(caption_from_reply(json!({"title": ""})).unwrap().is_none());

        let long = "x".repeat(400);
        let adapted = caption_from_reply(json!({ "title": long })).unwrap().unwrap();
        assert_eq!(adapted.title.chars().count(), MAX_TITLE_CHARS);
    }

    #[test]
    fn test_policy_reply_defaults() {
        let metadata = CommunityMetadata {
            name: "pics".into(),
            rules: vec!["No selfies".into()],
            ..Default::default()
        };
        let policy = policy_from_reply(
            json!({"requires_flair": true, "banned_terms": ["selfie"], "max_posts_per_day": 0}),
            &metadata,
        )
        .unwrap();
        assert!(policy.nsfw_allowed);
        assert!(policy.requires_flair);
        assert!(!policy.requires_verification);
        assert_eq!(policy.banned_terms, vec!["selfie".to_string()]);
        assert_eq!(policy.max_posts_per_day, None);
        assert_eq!(policy.rules_text, vec!["No selfies".to_string()]);
    }

    #[test]
    fn test_ui_reply() {
        let answer = ui_answer_from_reply(json!({"action": "click", "target": "[@e7]"})).unwrap();
        assert_eq!(answer.action, UiAction::Click);
        assert_eq!(answer.target.as_deref(), Some("@e7"));

        let answer = ui_answer_from_reply(json!({"action": "click", "target": null, "options": ["OC"]})).unwrap();
        assert_eq!(answer.action, UiAction::None);
        assert_eq!(answer.options, vec!["OC".to_string()]);
    }

    #[tokio::test]
    async fn test_offline_roles() {
        let roles = ModelRoles::offline();
        let metadata = CommunityMetadata::default();
        assert!(roles.parser.parse_policy(&metadata).await.is_err());
        let answer = roles.oracle.ask_ui("where?", &PageSnapshot::default()).await.unwrap();
        assert_eq!(answer.action, UiAction::None);
    }
}
