//! Injectable "what do I click" oracle for pages the locators do not cover

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::browser::PageSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UiAction {
    Click,
    Fill,
    Select,
    /// Nothing on the page answers the question
    None,
}

impl UiAction {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "click" | "press" | "tap" => UiAction::Click,
            "fill" | "type" => UiAction::Fill,
            "select" | "choose" => UiAction::Select,
            _ => UiAction::None,
        }
    }
}

/// Oracle reply: act on `target` (a snapshot ref like `@e3`, or visible text)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiAnswer {
    pub action: UiAction,
    pub target: Option<String>,
    /// Choices the oracle saw, when the question was about a list
    #[serde(default)]
    pub options: Vec<String>,
}

impl UiAnswer {
    pub fn nothing() -> Self {
        Self {
            action: UiAction::None,
            target: None,
            options: Vec::new(),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UiOracle: Send + Sync {
    async fn ask_ui(&self, question: &str, snapshot: &PageSnapshot) -> Result<UiAnswer>;
}

/// Oracle that never knows; used when the LLM is disabled
pub struct NoOracle;

#[async_trait]
impl UiOracle for NoOracle {
    async fn ask_ui(&self, _question: &str, _snapshot: &PageSnapshot) -> Result<UiAnswer> {
        Ok(UiAnswer::nothing())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_parse_is_lenient() {
        assert_eq!(UiAction::parse(" Click "), UiAction::Click);
        assert_eq!(UiAction::parse("type"), UiAction::Fill);
        assert_eq!(UiAction::parse("wave"), UiAction::None);
    }

    #[tokio::test]
    async fn test_no_oracle_answers_nothing() {
        let answer = NoOracle.ask_ui("where?", &PageSnapshot::default()).await.unwrap();
        assert_eq!(answer.action, UiAction::None);
        assert!(answer.target.is_none());
    }
}
