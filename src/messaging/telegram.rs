//! Telegram notices through the Bot API
//!
//! Token from TELEGRAM_BOT_TOKEN or `[telegram] bot_token`; each actor
//! that wants notices sets `telegram_chat_id`.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use super::{Notice, Notifier, Priority};
use crate::types::ActorId;

const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Bot API limit for one message
const MAX_MESSAGE_CHARS: usize = 4096;

/// Longest flood-control wait honoured before giving up
const MAX_RETRY_AFTER_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    /// Self-hosted Bot API servers
    pub api_base: String,
}

impl TelegramConfig {
    pub fn new(bot_token: impl Into<String>) -> Self {
        Self {
            bot_token: bot_token.into(),
            api_base: DEFAULT_API_BASE.to_string(),
        }
    }

    /// Tokens look like `<bot id>:<secret>`
    pub fn is_configured(&self) -> bool {
        match self.bot_token.split_once(':') {
            Some((id, secret)) => !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()) && !secret.is_empty(),
            None => false,
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base.trim_end_matches('/'), self.bot_token, method)
    }
}

#[derive(Debug, Deserialize)]
struct ApiReply {
    ok: bool,
    description: Option<String>,
    parameters: Option<ReplyParameters>,
}

#[derive(Debug, Deserialize)]
struct ReplyParameters {
    retry_after: Option<u64>,
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'static str,
    disable_web_page_preview: bool,
    disable_notification: bool,
}

#[derive(Debug, Clone)]
pub struct TelegramClient {
    config: TelegramConfig,
    http: reqwest::Client,
}

impl TelegramClient {
    pub fn new(config: TelegramConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .context("Failed to create Telegram HTTP client")?;
        Ok(Self { config, http })
    }

    /// Send one HTML message, waiting out a single flood-control reply
    pub async fn send(&self, chat_id: &str, html: &str, silent: bool) -> Result<()> {
        let body = SendMessage {
            chat_id,
            text: html,
            parse_mode: "HTML",
            disable_web_page_preview: true,
            disable_notification: silent,
        };

        for attempt in 0..2 {
            let reply: ApiReply = self
                .http
                .post(self.config.method_url("sendMessage"))
                .json(&body)
                .send()
                .await
                .context("Telegram request failed")?
                .json()
                .await
                .context("Unreadable Telegram reply")?;

            if reply.ok {
                return Ok(());
            }

            let wait = reply.parameters.and_then(|p| p.retry_after);
            match wait {
                Some(secs) if attempt == 0 && secs <= MAX_RETRY_AFTER_SECS => {
                    debug!("Telegram flood control, retrying in {}s", secs);
                    tokio::time::sleep(Duration::from_secs(secs)).await;
                }
                _ => bail!(
                    "Telegram rejected the message: {}",
                    reply.description.unwrap_or_else(|| "no description".to_string())
                ),
            }
        }
        bail!("Telegram kept rate limiting")
    }
}

pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Render a notice for one actor's chat
pub fn render(actor: &ActorId, notice: &Notice) -> String {
    let marker = match notice.priority {
        Priority::Urgent => "🚨 ",
        Priority::High => "⚠️ ",
        Priority::Normal | Priority::Low => "",
    };
    format!("{}<b>{}</b>\n{}", marker, escape_html(actor.as_str()), escape_html(&notice.text))
}

/// Split on line boundaries so no part exceeds the message limit
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    for line in text.split_inclusive('\n') {
        let mut line = line;
        while line.chars().count() > limit {
            if !current.is_empty() {
                parts.push(std::mem::take(&mut current));
            }
            let cut = line.char_indices().nth(limit).map(|(i, _)| i).unwrap_or(line.len());
            parts.push(line[..cut].to_string());
            line = &line[cut..];
        }
        if current.chars().count() + line.chars().count() > limit {
            parts.push(std::mem::take(&mut current));
        }
        current.push_str(line);
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

/// Routes each actor's notices to that actor's chat
pub struct TelegramNotifier {
    client: TelegramClient,
    chats: HashMap<ActorId, String>,
}

impl TelegramNotifier {
    pub fn new(client: TelegramClient, chats: HashMap<ActorId, String>) -> Self {
        Self { client, chats }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, actor: &ActorId, notice: &Notice) -> Result<()> {
        let Some(chat_id) = self.chats.get(actor) else {
            debug!("No Telegram chat for {}, dropping: {}", actor, notice.text);
            return Ok(());
        };
        let silent = notice.priority == Priority::Low;
        let parts = split_message(&render(actor, notice), MAX_MESSAGE_CHARS);
        let count = parts.len();
        for (i, part) in parts.iter().enumerate() {
            if let Err(e) = self.client.send(chat_id, part, silent).await {
                warn!("Telegram part {}/{} for {} failed", i + 1, count, actor);
                return Err(e);
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "telegram"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_shape() {
        assert!(TelegramConfig::new("123456:AAbb-cc").is_configured());
        assert!(!TelegramConfig::new("abc:def").is_configured());
        assert!(!TelegramConfig::new("123456:").is_configured());
        assert!(!TelegramConfig::new("no-colon").is_configured());
    }

    #[test]
    fn test_method_url_ignores_trailing_slash() {
        let mut config = TelegramConfig::new("1:t");
        config.api_base = "http://localhost:8081/".to_string();
        assert_eq!(config.method_url("sendMessage"), "http://localhost:8081/bot1:t/sendMessage");
    }

    #[test]
    fn test_render_escapes_and_marks_priority() {
        let actor = ActorId::new("ana");
        let urgent = render(&actor, &Notice::urgent("Session for <ana> expired"));
        assert!(urgent.starts_with("🚨 <b>ana</b>\n"));
        assert!(urgent.contains("&lt;ana&gt;"));
        assert_eq!(render(&actor, &Notice::normal("r/a & r/b")), "<b>ana</b>\nr/a &amp; r/b");
    }

    #[test]
    fn test_split_keeps_lines_whole() {
        let text = "aaaa\nbbbb\ncccc\n";
        assert_eq!(split_message(text, 10), vec!["aaaa\nbbbb\n", "cccc\n"]);
        assert_eq!(split_message("short", 10), vec!["short"]);
    }

    #[test]
    fn test_split_cuts_overlong_lines() {
        let parts = split_message(&"é".repeat(25), 10);
        assert_eq!(parts.len(), 3);
        assert!(parts.iter().all(|p| p.chars().count() <= 10));
        assert_eq!(parts.concat(), "é".repeat(25));
    }

    #[tokio::test]
    async fn test_actor_without_chat_is_skipped() {
        let client = TelegramClient::new(TelegramConfig::new("123456:token")).unwrap();
        let notifier = TelegramNotifier::new(client, HashMap::new());
        notifier
            .notify(&ActorId::new("nobody"), &Notice::normal("hi"))
            .await
            .unwrap();
    }
}
