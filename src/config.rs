//! Configuration management
//!
//! Loads the TOML configuration for the pipeline: platform endpoints,
//! browser settings, scheduling windows, executor bounds, monitor and
//! learner cadence, LLM models, notifications and the managed actors.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::types::ActorId;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Platform endpoints
    #[serde(default)]
    pub platform: PlatformConfig,
    /// Headless browser settings
    #[serde(default)]
    pub browser: crate::browser::BrowserConfig,
    /// Calendar scheduling
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Submission executor bounds
    #[serde(default)]
    pub executor: ExecutorConfig,
    /// Outcome monitor cadence
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Performance learner cadence
    #[serde(default)]
    pub learner: LearnerConfig,
    /// LLM models
    #[serde(default)]
    pub llm: LlmConfig,
    /// Telegram notifications
    #[serde(default)]
    pub telegram: TelegramSettings,
    /// Database location override
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    /// Managed actors
    #[serde(default)]
    pub actors: Vec<ActorConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// Primary (modern) submission UI
    #[serde(default = "default_primary_url")]
    pub primary_url: String,
    /// Legacy, structurally simpler submission UI
    #[serde(default = "default_legacy_url")]
    pub legacy_url: String,
    /// Unauthenticated public read API
    #[serde(default = "default_public_api_url")]
    pub public_api_url: String,
    /// User agent for public API requests
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_primary_url() -> String {
    "https://www.reddit.com".to_string()
}

fn default_legacy_url() -> String {
    "https://old.reddit.com".to_string()
}

fn default_public_api_url() -> String {
    "https://www.reddit.com".to_string()
}

fn default_user_agent() -> String {
    format!("postline/{}", env!("CARGO_PKG_VERSION"))
}

fn default_request_timeout() -> u64 {
    20
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            primary_url: default_primary_url(),
            legacy_url: default_legacy_url(),
            public_api_url: default_public_api_url(),
            user_agent: default_user_agent(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Inactivity window that closes a batch
    #[serde(default = "default_batch_window")]
    pub batch_window_secs: u64,
    /// Days ahead that slots may be placed in
    #[serde(default = "default_horizon_days")]
    pub horizon_days: u32,
    /// Peak hours (UTC) used as slot candidates, in order
    #[serde(default = "default_peak_hours")]
    pub peak_hours: Vec<u32>,
    #[serde(default = "default_max_per_day")]
    pub max_per_day: usize,
    /// Minimum gap between two slots on the same day
    #[serde(default = "default_min_spacing")]
    pub min_spacing_minutes: i64,
    /// Upper bound of the forward jitter applied to each slot
    #[serde(default = "default_jitter")]
    pub jitter_max_minutes: i64,
    /// How often the intake queue is drained
    #[serde(default = "default_intake_poll")]
    pub intake_poll_secs: u64,
}

fn default_batch_window() -> u64 {
    45
}

fn default_horizon_days() -> u32 {
    14
}

fn default_peak_hours() -> Vec<u32> {
    vec![8, 9, 11, 13, 14, 17, 19, 20, 22]
}

fn default_max_per_day() -> usize {
    4
}

fn default_min_spacing() -> i64 {
    90
}

fn default_jitter() -> i64 {
    25
}

fn default_intake_poll() -> u64 {
    2
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_window_secs: default_batch_window(),
            horizon_days: default_horizon_days(),
            peak_hours: default_peak_hours(),
            max_per_day: default_max_per_day(),
            min_spacing_minutes: default_min_spacing(),
            jitter_max_minutes: default_jitter(),
            intake_poll_secs: default_intake_poll(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Concurrent actor flows
    #[serde(default = "default_workers")]
    pub max_workers: usize,
    /// Full-flow attempts (fresh page load each) within one dispatch
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Dispatches of one request before it is failed for good
    #[serde(default = "default_max_request_attempts")]
    pub max_request_attempts: u32,
    /// Delay before a transiently failed request is dispatched again
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_mins: i64,
    /// Bound on any single element wait
    #[serde(default = "default_step_timeout")]
    pub step_timeout_secs: u64,
    /// Bound on waiting for the post-submit redirect
    #[serde(default = "default_redirect_timeout")]
    pub redirect_timeout_secs: u64,
    /// Wall-clock budget for a human to clear a verification challenge
    #[serde(default = "default_challenge_wait")]
    pub challenge_wait_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// How often due requests are claimed
    #[serde(default = "default_dispatch_interval")]
    pub dispatch_interval_secs: u64,
}

fn default_workers() -> usize {
    3
}

fn default_max_attempts() -> u32 {
    2
}

fn default_max_request_attempts() -> u32 {
    3
}

fn default_retry_backoff() -> i64 {
    30
}

fn default_step_timeout() -> u64 {
    15
}

fn default_redirect_timeout() -> u64 {
    45
}

fn default_challenge_wait() -> u64 {
    120
}

fn default_poll_interval() -> u64 {
    250
}

fn default_dispatch_interval() -> u64 {
    30
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_workers: default_workers(),
            max_attempts: default_max_attempts(),
            max_request_attempts: default_max_request_attempts(),
            retry_backoff_mins: default_retry_backoff(),
            step_timeout_secs: default_step_timeout(),
            redirect_timeout_secs: default_redirect_timeout(),
            challenge_wait_secs: default_challenge_wait(),
            poll_interval_ms: default_poll_interval(),
            dispatch_interval_secs: default_dispatch_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_monitor_interval")]
    pub interval_secs: u64,
    /// Items older than this are no longer re-checked
    #[serde(default = "default_max_age")]
    pub max_age_hours: i64,
    /// Cron expression for the periodic risk sweep
    #[serde(default = "default_risk_sweep")]
    pub risk_sweep_cron: String,
}

fn default_monitor_interval() -> u64 {
    3600
}

fn default_max_age() -> i64 {
    48
}

fn default_risk_sweep() -> String {
    "0 15 */6 * * *".to_string()
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_monitor_interval(),
            max_age_hours: default_max_age(),
            risk_sweep_cron: default_risk_sweep(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnerConfig {
    #[serde(default = "default_learner_interval")]
    pub interval_secs: u64,
}

fn default_learner_interval() -> u64 {
    6 * 3600
}

impl Default for LearnerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_learner_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Model for captions and policy parsing
    #[serde(default = "default_text_model")]
    pub text_model: String,
    /// Model for UI questions with a screenshot
    #[serde(default = "default_vision_model")]
    pub vision_model: String,
    /// Disable every LLM call (captions and policies fall back)
    #[serde(default)]
    pub disabled: bool,
}

fn default_text_model() -> String {
    "z-ai/glm-5".to_string()
}

fn default_vision_model() -> String {
    "google/gemini-flash-1.5".to_string()
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            text_model: default_text_model(),
            vision_model: default_vision_model(),
            disabled: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelegramSettings {
    /// Bot token; TELEGRAM_BOT_TOKEN takes precedence
    #[serde(default)]
    pub bot_token: Option<String>,
}

/// One managed account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorConfig {
    pub id: String,
    /// Chat that receives this actor's notifications
    #[serde(default)]
    pub telegram_chat_id: Option<String>,
    /// Cookie export produced by the credential layer
    #[serde(default)]
    pub cookie_file: Option<PathBuf>,
    /// Short persona description handed to the content adapter
    #[serde(default)]
    pub persona: String,
}

impl ActorConfig {
    pub fn actor_id(&self) -> ActorId {
        ActorId::new(&self.id)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            platform: PlatformConfig::default(),
            browser: Default::default(),
            scheduler: SchedulerConfig::default(),
            executor: ExecutorConfig::default(),
            monitor: MonitorConfig::default(),
            learner: LearnerConfig::default(),
            llm: LlmConfig::default(),
            telegram: TelegramSettings::default(),
            database_path: None,
            actors: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from the default location, creating it if missing
    pub fn load() -> Result<Self> {
        Self::load_from(&config_path()?)
    }

    /// Load configuration from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save configuration to a path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let parent = path.parent().context("Config path has no parent")?;

        std::fs::create_dir_all(parent).context("Failed to create config directory")?;

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(path, contents).context("Failed to write config file")?;

        Ok(())
    }

    /// Reject settings the scheduler and executor cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.peak_hours.iter().any(|h| *h > 23) {
            anyhow::bail!("scheduler.peak_hours must be within 0..=23");
        }
        if self.scheduler.max_per_day == 0 {
            anyhow::bail!("scheduler.max_per_day must be greater than 0");
        }
        if self.scheduler.jitter_max_minutes < 0 || self.scheduler.jitter_max_minutes >= 60 {
            anyhow::bail!("scheduler.jitter_max_minutes must be within 0..60");
        }
        if self.executor.max_workers == 0 || self.executor.max_attempts == 0 {
            anyhow::bail!("executor.max_workers and executor.max_attempts must be greater than 0");
        }
        self.browser.validate()?;
        let mut seen = std::collections::HashSet::new();
        for actor in &self.actors {
            if !seen.insert(actor.id.as_str()) {
                anyhow::bail!("Duplicate actor id in config: {}", actor.id);
            }
        }
        Ok(())
    }

    pub fn actor(&self, id: &ActorId) -> Option<&ActorConfig> {
        self.actors.iter().find(|a| a.id == id.as_str())
    }

    /// Database file, defaulting into the data directory
    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.database_path {
            Some(path) => Ok(path.clone()),
            None => Ok(data_dir()?.join("postline.db")),
        }
    }
}

fn project_dirs() -> Result<directories::ProjectDirs> {
    directories::ProjectDirs::from("com", "postline", "postline").context("No home directory to keep postline files in")
}

pub fn config_dir() -> Result<PathBuf> {
    Ok(project_dirs()?.config_dir().to_path_buf())
}

pub fn config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

/// Database and diagnostics live here
pub fn data_dir() -> Result<PathBuf> {
    Ok(project_dirs()?.data_dir().to_path_buf())
}

/// Directory for failure screenshots
pub fn diagnostics_dir() -> Result<PathBuf> {
    Ok(data_dir()?.join("diagnostics"))
}

/// Show current configuration
pub fn show_config(config: &Config) -> Result<()> {
    println!("Platform:      {}", config.platform.primary_url);
    println!("Legacy UI:     {}", config.platform.legacy_url);
    println!("Database:      {}", config.database_path()?.display());
    println!(
        "Scheduling:    {} per day, {} min spacing, {} day horizon",
        config.scheduler.max_per_day, config.scheduler.min_spacing_minutes, config.scheduler.horizon_days
    );
    println!(
        "Executor:      {} workers, {} attempts, {}s challenge wait",
        config.executor.max_workers, config.executor.max_attempts, config.executor.challenge_wait_secs
    );
    println!("LLM:           {}", if config.llm.disabled { "disabled".to_string() } else { config.llm.text_model.clone() });
    println!("Actors:");
    if config.actors.is_empty() {
        println!("  (none configured)");
    }
    for actor in &config.actors {
        println!(
            "  {} (notifications: {}, cookies: {})",
            actor.id,
            actor.telegram_chat_id.as_deref().unwrap_or("log only"),
            actor.cookie_file.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| "none".to_string())
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler.horizon_days, 14);
        assert_eq!(config.executor.challenge_wait_secs, 120);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [scheduler]
            max_per_day = 2

            [[actors]]
            id = "ana"
            persona = "travel photographer"
            "#,
        )
        .unwrap();
        assert_eq!(config.scheduler.max_per_day, 2);
        assert_eq!(config.scheduler.min_spacing_minutes, 90);
        assert_eq!(config.actors.len(), 1);
        assert!(config.actor(&ActorId::new("ana")).is_some());
    }

    #[test]
    fn test_invalid_peak_hour_rejected() {
        let mut config = Config::default();
        config.scheduler.peak_hours.push(24);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.executor.max_workers, 3);
    }
}
