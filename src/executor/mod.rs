//! Submission executor
//!
//! Drives an actor's browser session through a destination's submission
//! form. Each attempt is a [`flow::Flow`] on one [`SurfaceProfile`]; a
//! transient failure moves on to the next surface, and the whole ladder is
//! repeated up to `max_attempts` times with a fresh page load.
//!
//! Failures are classified into [`SubmissionError`] so the dispatcher can
//! decide between requeueing, failing for good, or banning the destination.

pub mod flair;
pub mod flow;
pub mod locate;
pub mod oracle;
pub mod pool;
pub mod surface;

use anyhow::Context;
use chrono::{SubsecRound, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::browser::{BrowserDriver, BrowserProvider};
use crate::config::ExecutorConfig;
use crate::messaging::{notify_quietly, Notice, Notifier};
use crate::store::Store;
use crate::types::{ExternalRef, Liveness, Engagement, Policy, PublishedItem, SubmissionRequest};

pub use flow::Step;
pub use oracle::{NoOracle, UiAction, UiAnswer, UiOracle};
pub use pool::WorkerPool;
pub use surface::SurfaceProfile;

/// Bounds on every wait inside a flow
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    /// Any single element wait
    pub step: Duration,
    /// Post-submit redirect and upload preview
    pub redirect: Duration,
    /// Human escalation budget
    pub challenge: Duration,
    pub poll: Duration,
}

impl Timing {
    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self {
            step: Duration::from_secs(config.step_timeout_secs),
            redirect: Duration::from_secs(config.redirect_timeout_secs),
            challenge: Duration::from_secs(config.challenge_wait_secs),
            poll: Duration::from_millis(config.poll_interval_ms.max(10)),
        }
    }
}

#[derive(Debug, Error)]
pub enum SubmissionError {
    /// Logged out; needs re-authentication upstream
    #[error("session expired")]
    SessionExpired,
    /// The platform refuses this actor at this destination
    #[error("hard block: {0}")]
    HardBlock(String),
    #[error("destination is private or restricted (join requested: {join_requested})")]
    Restricted { join_requested: bool },
    #[error("transient failure at {step}: {reason}")]
    Transient { step: Step, reason: String },
    #[error("verification challenge not cleared within {0:?}")]
    ChallengeTimeout(Duration),
    #[error("unknown failure: {0}")]
    Unknown(String),
}

impl SubmissionError {
    pub fn transient(step: Step, reason: impl Into<String>) -> Self {
        SubmissionError::Transient {
            step,
            reason: reason.into(),
        }
    }

    /// Worth another surface or a fresh page load within this dispatch
    pub fn is_retryable(&self) -> bool {
        matches!(self, SubmissionError::Transient { .. })
    }

    /// Worth dispatching the request again later
    pub fn is_requeueable(&self) -> bool {
        matches!(
            self,
            SubmissionError::Transient { .. } | SubmissionError::ChallengeTimeout(_)
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SubmissionError::SessionExpired => "session_expired",
            SubmissionError::HardBlock(_) => "hard_block",
            SubmissionError::Restricted { .. } => "restricted",
            SubmissionError::Transient { .. } => "transient",
            SubmissionError::ChallengeTimeout(_) => "challenge_timeout",
            SubmissionError::Unknown(_) => "unknown",
        }
    }
}

/// Attach the failing step to a browser error
pub(crate) trait StepContext<T> {
    fn at(self, step: Step) -> Result<T, SubmissionError>;
}

impl<T> StepContext<T> for anyhow::Result<T> {
    fn at(self, step: Step) -> Result<T, SubmissionError> {
        self.map_err(|e| SubmissionError::transient(step, format!("{:#}", e)))
    }
}

pub struct Executor {
    store: Store,
    browsers: Arc<dyn BrowserProvider>,
    oracle: Arc<dyn UiOracle>,
    notifier: Arc<dyn Notifier>,
    surfaces: Vec<SurfaceProfile>,
    timing: Timing,
    max_attempts: u32,
    pool: WorkerPool,
    diagnostics_dir: Option<PathBuf>,
}

impl Executor {
    pub fn new(
        store: Store,
        browsers: Arc<dyn BrowserProvider>,
        oracle: Arc<dyn UiOracle>,
        notifier: Arc<dyn Notifier>,
        surfaces: Vec<SurfaceProfile>,
        config: &ExecutorConfig,
    ) -> Self {
        Self {
            store,
            browsers,
            oracle,
            notifier,
            surfaces,
            timing: Timing::from_config(config),
            max_attempts: config.max_attempts.max(1),
            pool: WorkerPool::new(config.max_workers),
            diagnostics_dir: None,
        }
    }

    /// Write failure screenshots into `dir`
    pub fn with_diagnostics_dir(mut self, dir: PathBuf) -> Self {
        self.diagnostics_dir = Some(dir);
        self
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    /// Publish one request. Waits for the actor's session and a worker.
    pub async fn submit(
        &self,
        request: &SubmissionRequest,
        policy: Option<&Policy>,
    ) -> Result<PublishedItem, SubmissionError> {
        let _slot = self
            .pool
            .acquire(&request.actor)
            .await
            .map_err(|e| SubmissionError::Unknown(e.to_string()))?;

        // A previous dispatch may have published before crashing
        if let Ok(Some(existing)) = self.store.get_published(&request.id).await {
            info!("Request {} already published as {}", request.id, existing.external.url);
            return Ok(existing);
        }

        info!(
            "Submitting {} to r/{} for {}",
            request.content.id, request.destination, request.actor
        );

        let driver = self
            .browsers
            .driver(&request.actor)
            .await
            .map_err(|e| SubmissionError::transient(Step::NavigateToForm, format!("{:#}", e)))?;
        let requires_flair = policy.map(|p| p.requires_flair).unwrap_or(false);

        match self.attempt(driver.as_ref(), request, requires_flair).await {
            Ok(external) => self.record_success(request, external).await,
            Err(err) => {
                self.record_failure(driver.as_ref(), request, &err).await;
                Err(err)
            }
        }
    }

    /// Attempts × surfaces, stopping at the first non-transient outcome
    async fn attempt(
        &self,
        driver: &dyn BrowserDriver,
        request: &SubmissionRequest,
        requires_flair: bool,
    ) -> Result<ExternalRef, SubmissionError> {
        let mut last_error = None;
        for attempt in 1..=self.max_attempts {
            for surface in &self.surfaces {
                let flow = flow::Flow::new(
                    driver,
                    surface,
                    request,
                    requires_flair,
                    self.oracle.as_ref(),
                    self.notifier.as_ref(),
                    &self.timing,
                );
                match flow.run().await {
                    Ok(external) => {
                        info!(
                            "Published {} on {} surface (attempt {}): {}",
                            request.id, surface.name, attempt, external.url
                        );
                        return Ok(external);
                    }
                    Err(e) if e.is_retryable() => {
                        warn!(
                            "Attempt {}/{} on {} surface failed for {}: {}",
                            attempt, self.max_attempts, surface.name, request.id, e
                        );
                        last_error = Some(e);
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Err(last_error.unwrap_or_else(|| SubmissionError::Unknown("no submission surfaces configured".to_string())))
    }

    async fn record_success(
        &self,
        request: &SubmissionRequest,
        external: ExternalRef,
    ) -> Result<PublishedItem, SubmissionError> {
        // The store keeps millisecond timestamps
        let now = Utc::now().trunc_subsecs(3);
        let item = PublishedItem {
            submission_id: request.id.clone(),
            actor: request.actor.clone(),
            destination: request.destination.clone(),
            external,
            published_at: now,
            last_checked_at: None,
            liveness: Liveness::Live,
            engagement: Engagement::default(),
            style: request.content.style.clone(),
        };

        let persisted: anyhow::Result<PublishedItem> = async {
            if !self.store.record_published(&item).await? {
                info!("{} was already recorded as published", request.id);
            }
            let item = self
                .store
                .get_published(&request.id)
                .await?
                .context("Published item vanished")?;
            self.store
                .mark_destination_submitted(&request.actor, &request.destination, now)
                .await?;
            self.store
                .ensure_risk_profile(&request.actor, &request.destination)
                .await?;
            Ok(item)
        }
        .await;

        let item = persisted
            .map_err(|e| SubmissionError::Unknown(format!("published but not recorded: {:#}", e)))?;

        notify_quietly(
            self.notifier.as_ref(),
            &request.actor,
            Notice::normal(format!("Posted to r/{}: {}", request.destination, item.external.url)),
        )
        .await;
        Ok(item)
    }

    async fn record_failure(&self, driver: &dyn BrowserDriver, request: &SubmissionRequest, err: &SubmissionError) {
        match err {
            SubmissionError::SessionExpired => {
                error!("Session of {} expired", request.actor);
                notify_quietly(
                    self.notifier.as_ref(),
                    &request.actor,
                    Notice::urgent("Your platform session has expired. Please sign in again so posting can resume."),
                )
                .await;
                if let Err(e) = self.browsers.reset(&request.actor).await {
                    warn!("Failed to reset browser session of {}: {}", request.actor, e);
                }
            }
            SubmissionError::HardBlock(reason) => {
                warn!("Banning r/{} for {}: {}", request.destination, request.actor, reason);
                if let Err(e) = self.store.ban_destination(&request.actor, &request.destination).await {
                    error!("Failed to ban r/{}: {}", request.destination, e);
                }
                notify_quietly(
                    self.notifier.as_ref(),
                    &request.actor,
                    Notice::high(format!(
                        "r/{} refused the post ({}). It is excluded until reviewed.",
                        request.destination, reason
                    )),
                )
                .await;
            }
            SubmissionError::Restricted { join_requested } => {
                let text = if *join_requested {
                    format!("r/{} is restricted; a join request was sent.", request.destination)
                } else {
                    format!("r/{} is restricted and could not be joined automatically.", request.destination)
                };
                info!("{}", text);
                notify_quietly(self.notifier.as_ref(), &request.actor, Notice::normal(text)).await;
            }
            SubmissionError::ChallengeTimeout(waited) => {
                warn!("Challenge for {} not cleared within {:?}", request.actor, waited);
                notify_quietly(
                    self.notifier.as_ref(),
                    &request.actor,
                    Notice::high(format!(
                        "The post to r/{} was abandoned because the verification challenge was not cleared.",
                        request.destination
                    )),
                )
                .await;
            }
            SubmissionError::Transient { .. } | SubmissionError::Unknown(_) => {
                error!("Submission {} to r/{} failed: {}", request.id, request.destination, err);
                self.capture_diagnostic(driver, request, err).await;
            }
        }
    }

    /// Screenshot plus a short text note next to it
    async fn capture_diagnostic(
        &self,
        driver: &dyn BrowserDriver,
        request: &SubmissionRequest,
        err: &SubmissionError,
    ) -> Option<PathBuf> {
        let dir = self.diagnostics_dir.as_ref()?;
        let result: anyhow::Result<PathBuf> = async {
            tokio::fs::create_dir_all(dir).await?;
            let stem = format!("{}-{}", request.id, Utc::now().format("%Y%m%dT%H%M%S"));
            let png = driver.screenshot().await?;
            let path = dir.join(format!("{}.png", stem));
            tokio::fs::write(&path, png).await?;
            let url = driver.current_url().await.unwrap_or_default();
            let note = format!(
                "request: {}\nactor: {}\ndestination: {}\nurl: {}\nerror: {}\n",
                request.id, request.actor, request.destination, url, err
            );
            tokio::fs::write(dir.join(format!("{}.txt", stem)), note).await?;
            Ok(path)
        }
        .await;

        match result {
            Ok(path) => {
                info!("Diagnostic written to {}", path.display());
                Some(path)
            }
            Err(e) => {
                warn!("Could not capture diagnostic for {}: {}", request.id, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let transient = SubmissionError::transient(Step::FillTitle, "title input not found");
        assert!(transient.is_retryable());
        assert!(transient.is_requeueable());
        assert_eq!(transient.to_string(), "transient failure at FillTitle: title input not found");

        assert!(!SubmissionError::SessionExpired.is_retryable());
        assert!(!SubmissionError::SessionExpired.is_requeueable());
        assert!(SubmissionError::ChallengeTimeout(Duration::from_secs(120)).is_requeueable());
        assert!(!SubmissionError::HardBlock("banned".into()).is_requeueable());
        assert_eq!(SubmissionError::Restricted { join_requested: true }.kind(), "restricted");
    }

    #[test]
    fn test_step_context_maps_to_transient() {
        let failed: anyhow::Result<()> = Err(anyhow::anyhow!("socket closed"));
        match failed.at(Step::Submit) {
            Err(SubmissionError::Transient { step, reason }) => {
                assert_eq!(step, Step::Submit);
                assert!(reason.contains("socket closed"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_timing_from_config() {
        let timing = Timing::from_config(&ExecutorConfig::default());
        assert_eq!(timing.challenge, Duration::from_secs(120));
        assert_eq!(timing.poll, Duration::from_millis(250));
    }
}
