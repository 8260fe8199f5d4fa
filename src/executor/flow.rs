//! One submission attempt on one surface, as an explicit state machine

use std::fmt;
use std::path::Path;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::flair::{choose_generic_flair, first_unreserved, is_dismissal, is_reserved};
use super::locate::{resolve, resolve_or_ask, resolve_with_wait, wait_for_absence};
use super::oracle::UiOracle;
use super::surface::{detect_condition, PageCondition, SurfaceProfile};
use super::{StepContext, SubmissionError, Timing};
use crate::browser::{BrowserDriver, ElementHandle};
use crate::messaging::{notify_quietly, Notice, Notifier};
use crate::types::{ExternalRef, SubmissionRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    NavigateToForm,
    DetectBlockingCondition,
    SelectMediaTab,
    UploadMedia,
    ConfirmUploadPreview,
    FillTitle,
    SetContentWarningFlag,
    SelectFlair,
    VerifyMediaStillAttached,
    Submit,
    HandlePostSubmitConfirmationDialog,
    WaitForRedirect,
    ExtractPublishedReference,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Everything one attempt needs, borrowed from the executor
pub(crate) struct Flow<'a> {
    pub driver: &'a dyn BrowserDriver,
    pub surface: &'a SurfaceProfile,
    pub request: &'a SubmissionRequest,
    pub requires_flair: bool,
    pub oracle: &'a dyn UiOracle,
    pub notifier: &'a dyn Notifier,
    pub timing: &'a Timing,
    reuploaded: bool,
    published_url: Option<String>,
}

impl<'a> Flow<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        driver: &'a dyn BrowserDriver,
        surface: &'a SurfaceProfile,
        request: &'a SubmissionRequest,
        requires_flair: bool,
        oracle: &'a dyn UiOracle,
        notifier: &'a dyn Notifier,
        timing: &'a Timing,
    ) -> Self {
        Self {
            driver,
            surface,
            request,
            requires_flair,
            oracle,
            notifier,
            timing,
            reuploaded: false,
            published_url: None,
        }
    }

    pub async fn run(mut self) -> Result<ExternalRef, SubmissionError> {
        let mut step = Step::NavigateToForm;
        loop {
            debug!("[{}:{}] {}", self.surface.name, self.request.destination, step);
            step = match step {
                Step::NavigateToForm => {
                    let url = self.surface.submit_url(&self.request.destination);
                    self.driver.navigate(&url).await.at(step)?;
                    Step::DetectBlockingCondition
                }
                Step::DetectBlockingCondition => {
                    self.detect_blocking().await?;
                    Step::SelectMediaTab
                }
                Step::SelectMediaTab => {
                    self.select_media_tab().await?;
                    Step::UploadMedia
                }
                Step::UploadMedia => {
                    self.upload_media(step).await?;
                    Step::ConfirmUploadPreview
                }
                Step::ConfirmUploadPreview => {
                    self.confirm_preview(step).await?;
                    Step::FillTitle
                }
                Step::FillTitle => {
                    self.fill_title().await?;
                    Step::SetContentWarningFlag
                }
                Step::SetContentWarningFlag => {
                    self.set_content_warning().await?;
                    Step::SelectFlair
                }
                Step::SelectFlair => {
                    self.select_flair().await?;
                    Step::VerifyMediaStillAttached
                }
                Step::VerifyMediaStillAttached => {
                    self.verify_media().await?;
                    Step::Submit
                }
                Step::Submit => {
                    let button = self.require(&self.surface.submit_button, step, "submit button").await?;
                    self.driver.click(&button).await.at(step)?;
                    Step::HandlePostSubmitConfirmationDialog
                }
                Step::HandlePostSubmitConfirmationDialog => {
                    self.handle_post_submit_dialog().await?;
                    Step::WaitForRedirect
                }
                Step::WaitForRedirect => {
                    self.wait_for_redirect().await?;
                    Step::ExtractPublishedReference
                }
                Step::ExtractPublishedReference => {
                    return self.extract_reference();
                }
            };
        }
    }

    /// Resolve with the step timeout or fail the step as transient
    async fn require(
        &self,
        strategies: &[crate::browser::Locator],
        step: Step,
        what: &str,
    ) -> Result<ElementHandle, SubmissionError> {
        resolve_with_wait(self.driver, strategies, self.timing, self.timing.step)
            .await
            .at(step)?
            .ok_or_else(|| SubmissionError::transient(step, format!("{} not found", what)))
    }

    async fn page_condition(&self, step: Step) -> Result<Option<PageCondition>, SubmissionError> {
        let url = self.driver.current_url().await.at(step)?;
        let text = self.driver.page_text().await.at(step)?;
        Ok(detect_condition(&url, &text))
    }

    async fn detect_blocking(&mut self) -> Result<(), SubmissionError> {
        let step = Step::DetectBlockingCondition;
        let mut condition = self.page_condition(step).await?;

        if condition == Some(PageCondition::Challenge) {
            self.escalate_challenge(step).await?;
            condition = self.page_condition(step).await?;
        }

        match condition {
            None => Ok(()),
            Some(PageCondition::LoggedOut) => Err(SubmissionError::SessionExpired),
            Some(PageCondition::Banned) => Err(SubmissionError::HardBlock(format!(
                "banned from {}",
                self.request.destination
            ))),
            Some(PageCondition::Restricted) => {
                let join_requested = self.request_to_join().await;
                Err(SubmissionError::Restricted { join_requested })
            }
            Some(PageCondition::RateLimited) => {
                Err(SubmissionError::transient(step, "rate limited"))
            }
            Some(PageCondition::Challenge) => Err(SubmissionError::ChallengeTimeout(self.timing.challenge)),
        }
    }

    /// Ask the actor to clear a verification challenge, then wait a bounded time
    async fn escalate_challenge(&self, step: Step) -> Result<(), SubmissionError> {
        warn!(
            "Verification challenge for {} on {}; waiting up to {:?}",
            self.request.actor, self.request.destination, self.timing.challenge
        );
        notify_quietly(
            self.notifier,
            &self.request.actor,
            Notice::urgent(format!(
                "A verification challenge is blocking the post to r/{}. Please clear it within {} seconds.",
                self.request.destination,
                self.timing.challenge.as_secs()
            )),
        )
        .await;

        let deadline = Instant::now() + self.timing.challenge;
        loop {
            tokio::time::sleep(self.timing.poll).await;
            if self.page_condition(step).await? != Some(PageCondition::Challenge) {
                info!("Challenge cleared for {}", self.request.actor);
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(SubmissionError::ChallengeTimeout(self.timing.challenge));
            }
        }
    }

    /// Side effect of a restricted destination; failures only logged
    async fn request_to_join(&self) -> bool {
        match resolve(self.driver, &self.surface.join_button).await {
            Ok(Some(button)) => match self.driver.click(&button).await {
                Ok(()) => {
                    info!("Sent join request to {} for {}", self.request.destination, self.request.actor);
                    true
                }
                Err(e) => {
                    warn!("Join request click failed: {}", e);
                    false
                }
            },
            Ok(None) => false,
            Err(e) => {
                warn!("Join button lookup failed: {}", e);
                false
            }
        }
    }

    async fn select_media_tab(&self) -> Result<(), SubmissionError> {
        let step = Step::SelectMediaTab;
        if self.surface.media_tab.is_empty() {
            return Ok(());
        }
        // Some forms open on the media tab already
        if resolve(self.driver, &self.surface.file_input).await.at(step)?.is_some() {
            return Ok(());
        }
        let tab = self.require(&self.surface.media_tab, step, "media tab").await?;
        self.driver.click(&tab).await.at(step)
    }

    async fn upload_media(&self, step: Step) -> Result<(), SubmissionError> {
        let input = self.require(&self.surface.file_input, step, "file input").await?;
        self.driver
            .upload_file(&input, Path::new(&self.request.content.media_path))
            .await
            .at(step)
    }

    async fn confirm_preview(&self, step: Step) -> Result<(), SubmissionError> {
        if self.surface.upload_preview.is_empty() {
            return Ok(());
        }
        let found = resolve_with_wait(
            self.driver,
            &self.surface.upload_preview,
            self.timing,
            self.timing.redirect,
        )
        .await
        .at(step)?;
        match found {
            Some(_) => Ok(()),
            None => Err(SubmissionError::transient(step, "upload preview never appeared")),
        }
    }

    async fn fill_title(&self) -> Result<(), SubmissionError> {
        let step = Step::FillTitle;
        let input = self.require(&self.surface.title_input, step, "title input").await?;
        self.driver.fill(&input, &self.request.title).await.at(step)?;

        if let Some(body) = self.request.body.as_deref().filter(|b| !b.trim().is_empty()) {
            match resolve(self.driver, &self.surface.body_input).await.at(step)? {
                Some(field) => self.driver.fill(&field, body).await.at(step)?,
                None => debug!("No body field on {} surface; body dropped", self.surface.name),
            }
        }
        Ok(())
    }

    async fn set_content_warning(&self) -> Result<(), SubmissionError> {
        let step = Step::SetContentWarningFlag;
        if !self.request.nsfw {
            return Ok(());
        }
        let toggle = self.require(&self.surface.nsfw_toggle, step, "NSFW toggle").await?;
        if !self.driver.is_checked(&toggle).await.at(step)? {
            self.driver.click(&toggle).await.at(step)?;
        }
        if !self.driver.is_checked(&toggle).await.at(step)? {
            return Err(SubmissionError::transient(step, "NSFW toggle did not stick"));
        }
        Ok(())
    }

    /// Open picker, choose the safest generic option, confirm inside the modal.
    /// Dismissing the modal discards the choice, so it is never used.
    async fn select_flair(&self) -> Result<(), SubmissionError> {
        let step = Step::SelectFlair;
        let opener = resolve_with_wait(
            self.driver,
            &self.surface.flair_button,
            self.timing,
            if self.requires_flair { self.timing.step } else { self.timing.poll },
        )
        .await
        .at(step)?;

        let Some(opener) = opener else {
            if self.requires_flair {
                return Err(SubmissionError::transient(step, "flair picker not found"));
            }
            return Ok(());
        };

        self.driver.click(&opener).await.at(step)?;
        self.require(&self.surface.flair_dialog, step, "flair dialog").await?;

        let mut options = Vec::new();
        for locator in &self.surface.flair_options {
            options = self.driver.locate_all(locator).await.at(step)?;
            if !options.is_empty() {
                break;
            }
        }
        let labels: Vec<String> = options.iter().map(|o| o.label.clone()).collect();

        let choice = match choose_generic_flair(&labels) {
            Some(idx) => Some(options[idx].clone()),
            None => self.ask_flair(&options).await.or_else(|| {
                first_unreserved(&labels).map(|idx| options[idx].clone())
            }),
        };

        match &choice {
            Some(option) => {
                info!("Choosing flair '{}' for {}", option.label, self.request.destination);
                self.driver.click(option).await.at(step)?;
            }
            None if self.requires_flair => {
                return Err(SubmissionError::transient(step, "no usable flair option"));
            }
            None => debug!("No flair options offered"),
        }

        let confirm = resolve_or_ask(
            self.driver,
            &self.surface.flair_confirm,
            &self.surface.flair_dialog,
            self.timing,
            self.oracle,
            "Which button inside the flair dialog applies the selected flair?",
            |el| !is_dismissal(&el.label),
        )
        .await
        .at(step)?
        .ok_or_else(|| SubmissionError::transient(step, "flair confirm button not found"))?;

        if is_dismissal(&confirm.label) {
            return Err(SubmissionError::transient(step, "only a dismiss control was found"));
        }
        self.driver.click(&confirm).await.at(step)?;

        let closed = wait_for_absence(self.driver, &self.surface.flair_dialog, self.timing, self.timing.step)
            .await
            .at(step)?;
        if !closed {
            return Err(SubmissionError::transient(step, "flair dialog did not close after confirm"));
        }
        Ok(())
    }

    /// Only one of the offered options is ever returned
    async fn ask_flair(&self, options: &[ElementHandle]) -> Option<ElementHandle> {
        if options.is_empty() {
            return None;
        }
        let snapshot = match self.driver.snapshot().await {
            Ok(s) => s,
            Err(e) => {
                warn!("Snapshot for flair question failed: {}", e);
                return None;
            }
        };
        let labels: Vec<&str> = options.iter().map(|o| o.label.as_str()).collect();
        let question = format!(
            "Which flair option is the safest generic choice for a photo post? Options: {}",
            labels.join(", ")
        );
        let answer = match self.oracle.ask_ui(&question, &snapshot).await {
            Ok(a) => a,
            Err(e) => {
                warn!("UI oracle failed on flair choice: {}", e);
                return None;
            }
        };
        let target = answer.target?;
        let wanted = snapshot
            .element(&target)
            .map(|el| el.label.clone())
            .unwrap_or(target)
            .trim()
            .to_lowercase();
        let picked = options
            .iter()
            .find(|o| o.label.trim().to_lowercase() == wanted && !is_reserved(&o.label))
            .cloned();
        if picked.is_none() {
            warn!("Oracle flair answer '{}' is not one of the offered options", wanted);
        }
        picked
    }

    /// Flair interaction can silently clear the upload; re-upload once
    async fn verify_media(&mut self) -> Result<(), SubmissionError> {
        let step = Step::VerifyMediaStillAttached;
        if self.surface.upload_preview.is_empty() {
            return Ok(());
        }
        if resolve(self.driver, &self.surface.upload_preview).await.at(step)?.is_some() {
            return Ok(());
        }
        if self.reuploaded {
            return Err(SubmissionError::transient(step, "media cleared again after re-upload"));
        }

        warn!("Media cleared before submit on {}; re-uploading", self.request.destination);
        self.reuploaded = true;
        self.upload_media(step).await?;
        self.confirm_preview(step).await
    }

    async fn handle_post_submit_dialog(&self) -> Result<(), SubmissionError> {
        let step = Step::HandlePostSubmitConfirmationDialog;
        if self.surface.post_submit_confirm.is_empty() {
            return Ok(());
        }
        let window = self.timing.step.min(std::time::Duration::from_secs(5));
        let deadline = Instant::now() + window;
        loop {
            let url = self.driver.current_url().await.at(step)?;
            if self.surface.extract_reference(&url).is_some() {
                return Ok(());
            }
            if let Some(button) = resolve(self.driver, &self.surface.post_submit_confirm).await.at(step)? {
                info!("Confirming secondary submit dialog ({})", button.label);
                return self.driver.click(&button).await.at(step);
            }
            if Instant::now() >= deadline {
                return Ok(());
            }
            tokio::time::sleep(self.timing.poll).await;
        }
    }

    async fn wait_for_redirect(&mut self) -> Result<(), SubmissionError> {
        let step = Step::WaitForRedirect;
        let deadline = Instant::now() + self.timing.redirect;
        loop {
            let url = self.driver.current_url().await.at(step)?;
            if self.surface.extract_reference(&url).is_some() {
                self.published_url = Some(url);
                return Ok(());
            }

            let text = self.driver.page_text().await.at(step)?;
            match detect_condition(&url, &text) {
                Some(PageCondition::Banned) => {
                    return Err(SubmissionError::HardBlock(format!(
                        "submit rejected by {}",
                        self.request.destination
                    )))
                }
                Some(PageCondition::LoggedOut) => return Err(SubmissionError::SessionExpired),
                Some(PageCondition::RateLimited) => {
                    return Err(SubmissionError::transient(step, "rate limited on submit"))
                }
                Some(PageCondition::Challenge) => {
                    self.escalate_challenge(step).await?;
                }
                Some(PageCondition::Restricted) | None => {}
            }

            if Instant::now() >= deadline {
                // An explicit error banner we cannot classify is worth a diagnostic
                if let Some(banner) = resolve(self.driver, &self.surface.error_banner).await.at(step)? {
                    if !banner.label.is_empty() {
                        return Err(SubmissionError::Unknown(format!("submit error: {}", banner.label)));
                    }
                }
                return Err(SubmissionError::transient(step, "no redirect to the published item"));
            }
            tokio::time::sleep(self.timing.poll).await;
        }
    }

    fn extract_reference(&self) -> Result<ExternalRef, SubmissionError> {
        let step = Step::ExtractPublishedReference;
        let url = self
            .published_url
            .clone()
            .ok_or_else(|| SubmissionError::transient(step, "no published URL"))?;
        let id = self
            .surface
            .extract_reference(&url)
            .ok_or_else(|| SubmissionError::Unknown(format!("unrecognised published URL {}", url)))?;
        Ok(ExternalRef { id, url })
    }
}
