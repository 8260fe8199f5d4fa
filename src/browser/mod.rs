//! Headless browser driving over the Chrome DevTools Protocol (CDP)
//!
//! One Chrome process hosts every actor. Each actor gets its own
//! browser context (separate cookie jar and storage) with a single page,
//! so sessions never share cookies across actors.
//!
//! The submission executor only sees the [`BrowserDriver`] trait; the CDP
//! implementation lives in [`session`] and the wire client in [`cdp`].

pub mod cdp;
pub mod session;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::types::ActorId;

pub use session::{ActorSession, BrowserPool};

/// Browser automation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    /// Chrome/Chromium executable path (auto-detect if None)
    #[serde(default)]
    pub chrome_path: Option<String>,
    #[serde(default = "default_headless")]
    pub headless: bool,
    #[serde(default = "default_width")]
    pub window_width: u32,
    #[serde(default = "default_height")]
    pub window_height: u32,
    /// Bound on document readiness after a navigation
    #[serde(default = "default_load_timeout")]
    pub load_timeout_secs: u64,
    /// Bound on a single CDP round trip
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    /// User agent string (None = browser default)
    #[serde(default)]
    pub user_agent: Option<String>,
}

fn default_headless() -> bool {
    true
}

fn default_width() -> u32 {
    1366
}

fn default_height() -> u32 {
    900
}

fn default_load_timeout() -> u64 {
    30
}

fn default_command_timeout() -> u64 {
    20
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            chrome_path: None,
            headless: default_headless(),
            window_width: default_width(),
            window_height: default_height(),
            load_timeout_secs: default_load_timeout(),
            command_timeout_secs: default_command_timeout(),
            user_agent: None,
        }
    }
}

impl BrowserConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.window_width == 0 || self.window_height == 0 {
            bail!("Window dimensions must be greater than 0");
        }

        if self.load_timeout_secs == 0 || self.command_timeout_secs == 0 {
            bail!("Browser timeouts must be greater than 0");
        }

        Ok(())
    }
}

/// A structural way of finding one element on the page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Locator {
    /// ARIA role (explicit or implicit), optionally with an accessible name
    /// that must contain `name` (case-insensitive)
    Role { role: String, name: Option<String> },
    /// Visible text, exact or substring (case-insensitive)
    Text { text: String, exact: bool },
    /// Attribute equality, or presence when `value` is None
    Attribute { name: String, value: Option<String> },
    Css { selector: String },
    /// `inner` searched only below the first match of `scope`
    Within { scope: Box<Locator>, inner: Box<Locator> },
}

impl Locator {
    pub fn role(role: &str, name: &str) -> Self {
        Locator::Role {
            role: role.to_string(),
            name: Some(name.to_string()),
        }
    }

    pub fn any_role(role: &str) -> Self {
        Locator::Role {
            role: role.to_string(),
            name: None,
        }
    }

    pub fn text(text: &str) -> Self {
        Locator::Text {
            text: text.to_string(),
            exact: false,
        }
    }

    pub fn exact_text(text: &str) -> Self {
        Locator::Text {
            text: text.to_string(),
            exact: true,
        }
    }

    pub fn attr(name: &str, value: &str) -> Self {
        Locator::Attribute {
            name: name.to_string(),
            value: Some(value.to_string()),
        }
    }

    pub fn has_attr(name: &str) -> Self {
        Locator::Attribute {
            name: name.to_string(),
            value: None,
        }
    }

    pub fn css(selector: &str) -> Self {
        Locator::Css {
            selector: selector.to_string(),
        }
    }

    pub fn within(scope: Locator, inner: Locator) -> Self {
        Locator::Within {
            scope: Box::new(scope),
            inner: Box::new(inner),
        }
    }
}

impl std::fmt::Display for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Locator::Role { role, name: Some(name) } => write!(f, "role={}[{}]", role, name),
            Locator::Role { role, name: None } => write!(f, "role={}", role),
            Locator::Text { text, exact } => {
                write!(f, "text{}\"{}\"", if *exact { "=" } else { "~" }, text)
            }
            Locator::Attribute { name, value: Some(v) } => write!(f, "[{}=\"{}\"]", name, v),
            Locator::Attribute { name, value: None } => write!(f, "[{}]", name),
            Locator::Css { selector } => write!(f, "css={}", selector),
            Locator::Within { scope, inner } => write!(f, "{} >> {}", scope, inner),
        }
    }
}

/// Opaque reference to an element found on the current page.
/// Handles go stale on navigation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementHandle {
    pub id: String,
    /// Accessible name or visible text at the time it was located
    pub label: String,
}

/// Accessibility snapshot handed to the UI oracle
#[derive(Debug, Clone, Default)]
pub struct PageSnapshot {
    pub url: String,
    pub title: String,
    /// One line per node, interactive nodes prefixed with a `[@eN]` ref
    pub tree_text: String,
    /// Ref id to element handle
    pub refs: HashMap<String, ElementHandle>,
}

impl PageSnapshot {
    pub fn element(&self, ref_id: &str) -> Option<&ElementHandle> {
        self.refs.get(ref_id.trim())
    }
}

/// Browser primitives the submission executor depends on
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<()>;

    /// First visible match, if any
    async fn locate(&self, locator: &Locator) -> Result<Option<ElementHandle>>;

    /// Every visible match in document order
    async fn locate_all(&self, locator: &Locator) -> Result<Vec<ElementHandle>>;

    async fn click(&self, element: &ElementHandle) -> Result<()>;

    /// Replace the element's value with `text`
    async fn fill(&self, element: &ElementHandle, text: &str) -> Result<()>;

    async fn upload_file(&self, element: &ElementHandle, path: &Path) -> Result<()>;

    /// Checkbox, switch or toggle-button state
    async fn is_checked(&self, element: &ElementHandle) -> Result<bool>;

    /// PNG screenshot of the viewport
    async fn screenshot(&self) -> Result<Vec<u8>>;

    async fn current_url(&self) -> Result<String>;

    async fn page_text(&self) -> Result<String>;

    async fn snapshot(&self) -> Result<PageSnapshot>;
}

/// Hands out the browser session of an actor
#[async_trait]
pub trait BrowserProvider: Send + Sync {
    async fn driver(&self, actor: &ActorId) -> Result<Arc<dyn BrowserDriver>>;

    /// Forget the actor's session so the next use starts fresh
    async fn reset(&self, _actor: &ActorId) -> Result<()> {
        Ok(())
    }
}

/// Escape string for embedding in a single-quoted JavaScript literal
pub(crate) fn escape_js_string(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('\'', "\\'")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
        .replace('\t', "\\t")
}
