//! Actor notifications
//!
//! Notifications are fire-and-forget: a failed send is logged and never
//! blocks the pipeline. Supported channels:
//! - Telegram: one chat per actor
//! - Log: fallback when no channel is configured

pub mod telegram;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;
use crate::types::ActorId;

pub use telegram::{TelegramClient, TelegramConfig, TelegramNotifier};

/// Message priority level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notice {
    pub text: String,
    pub priority: Priority,
}

impl Notice {
    pub fn normal(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            priority: Priority::Normal,
        }
    }

    pub fn high(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            priority: Priority::High,
        }
    }

    pub fn urgent(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            priority: Priority::Urgent,
        }
    }
}

/// Outbound channel to the people behind an actor
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, actor: &ActorId, notice: &Notice) -> Result<()>;

    fn name(&self) -> &'static str;
}

/// Send and swallow failures
pub async fn notify_quietly(notifier: &dyn Notifier, actor: &ActorId, notice: Notice) {
    if let Err(e) = notifier.notify(actor, &notice).await {
        warn!("{} notification to {} failed: {}", notifier.name(), actor, e);
    }
}

/// Writes notices to the log only
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, actor: &ActorId, notice: &Notice) -> Result<()> {
        info!("[notice:{:?}] {}: {}", notice.priority, actor, notice.text);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

/// Telegram when a bot token is available, the log otherwise
pub fn build_notifier(config: &Config) -> Result<Arc<dyn Notifier>> {
    let token = std::env::var("TELEGRAM_BOT_TOKEN")
        .ok()
        .or_else(|| config.telegram.bot_token.clone())
        .filter(|t| !t.trim().is_empty());

    let Some(token) = token else {
        info!("No Telegram bot token configured; notifications go to the log");
        return Ok(Arc::new(LogNotifier));
    };

    let telegram = TelegramConfig::new(token);
    if !telegram.is_configured() {
        warn!("Telegram bot token looks malformed; notifications go to the log");
        return Ok(Arc::new(LogNotifier));
    }

    let chats: HashMap<ActorId, String> = config
        .actors
        .iter()
        .filter_map(|a| a.telegram_chat_id.clone().map(|chat| (a.actor_id(), chat)))
        .collect();

    Ok(Arc::new(TelegramNotifier::new(TelegramClient::new(telegram)?, chats)))
}
