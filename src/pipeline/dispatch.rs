//! Dispatch of due submission requests
//!
//! queued -> validating (claimed) -> blocked | submitting -> published |
//! failed, or back to queued with a later time while attempts remain.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::compliance::ComplianceGate;
use crate::executor::{Executor, SubmissionError};
use crate::messaging::{notify_quietly, Notice, Notifier};
use crate::store::Store;
use crate::types::{Policy, PublishedItem, SubmissionRequest, SubmissionState};

/// Requests claimed per dispatch pass
const CLAIM_LIMIT: usize = 32;

/// Anything that can publish one request
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, request: &SubmissionRequest, policy: Option<Policy>) -> Result<PublishedItem, SubmissionError>;
}

#[async_trait]
impl Publisher for Executor {
    async fn publish(&self, request: &SubmissionRequest, policy: Option<Policy>) -> Result<PublishedItem, SubmissionError> {
        self.submit(request, policy.as_ref()).await
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub published: usize,
    pub blocked: usize,
    pub failed: usize,
    pub requeued: usize,
}

pub struct Dispatcher {
    store: Store,
    gate: Arc<ComplianceGate>,
    publisher: Arc<dyn Publisher>,
    notifier: Arc<dyn Notifier>,
    max_request_attempts: u32,
    retry_backoff: Duration,
}

impl Dispatcher {
    pub fn new(
        store: Store,
        gate: Arc<ComplianceGate>,
        publisher: Arc<dyn Publisher>,
        notifier: Arc<dyn Notifier>,
        max_request_attempts: u32,
        retry_backoff_mins: i64,
    ) -> Self {
        Self {
            store,
            gate,
            publisher,
            notifier,
            max_request_attempts: max_request_attempts.max(1),
            retry_backoff: Duration::minutes(retry_backoff_mins.max(1)),
        }
    }

    /// Claim everything due and drive each request to its next resting state.
    /// Per-actor serialization is left to the publisher.
    pub async fn dispatch_due(&self) -> Result<DispatchReport> {
        let claimed = self.store.claim_due(Utc::now(), CLAIM_LIMIT).await?;
        if claimed.is_empty() {
            return Ok(DispatchReport::default());
        }
        debug!("Dispatching {} due requests", claimed.len());

        let outcomes = join_all(claimed.iter().map(|req| self.process(req))).await;

        let mut report = DispatchReport::default();
        for (req, outcome) in claimed.iter().zip(outcomes) {
            match outcome {
                Ok(SubmissionState::Published) => report.published += 1,
                Ok(SubmissionState::Blocked) => report.blocked += 1,
                Ok(SubmissionState::Failed) => report.failed += 1,
                Ok(SubmissionState::Queued) => report.requeued += 1,
                Ok(_) => {}
                Err(e) => error!("Dispatch of {} failed: {:#}", req.id, e),
            }
        }
        Ok(report)
    }

    /// One claimed (validating) request; returns the state it ended in
    pub async fn process(&self, request: &SubmissionRequest) -> Result<SubmissionState> {
        let destination = match self.store.get_destination(&request.actor, &request.destination).await? {
            Some(dest) => dest,
            None => {
                let blockers = vec![format!("r/{} is not a known destination", request.destination)];
                return self.block(request, blockers).await;
            }
        };

        let report = match self.gate.check(&destination, request).await {
            Ok(report) => report,
            Err(e) => {
                let reason = format!("compliance check failed: {:#}", e);
                self.store
                    .transition_submission(&request.id, SubmissionState::Validating, SubmissionState::Failed, Some(&reason), &[])
                    .await?;
                return Ok(SubmissionState::Failed);
            }
        };
        if !report.ok {
            return self.block(request, report.blockers).await;
        }

        if !self
            .store
            .transition_submission(&request.id, SubmissionState::Validating, SubmissionState::Submitting, None, &[])
            .await?
        {
            debug!("Request {} moved on before submission", request.id);
            return Ok(request.state);
        }
        let attempts = request.attempts + 1;

        match self.publisher.publish(request, report.policy).await {
            Ok(item) => {
                self.store
                    .transition_submission(&request.id, SubmissionState::Submitting, SubmissionState::Published, None, &[])
                    .await?;
                info!("Request {} published: {}", request.id, item.external.url);
                Ok(SubmissionState::Published)
            }
            Err(e) if e.is_requeueable() && attempts < self.max_request_attempts => {
                let at = Utc::now() + self.retry_backoff * attempts as i32;
                warn!(
                    "Request {} failed ({}), retrying at {} (attempt {}/{})",
                    request.id, e, at, attempts, self.max_request_attempts
                );
                self.store.requeue_submission(&request.id, at, &e.to_string()).await?;
                Ok(SubmissionState::Queued)
            }
            Err(e) => {
                error!("Request {} failed for good: {}", request.id, e);
                self.store
                    .transition_submission(
                        &request.id,
                        SubmissionState::Submitting,
                        SubmissionState::Failed,
                        Some(&format!("{}: {}", e.kind(), e)),
                        &[],
                    )
                    .await?;
                Ok(SubmissionState::Failed)
            }
        }
    }

    async fn block(&self, request: &SubmissionRequest, blockers: Vec<String>) -> Result<SubmissionState> {
        self.store
            .transition_submission(&request.id, SubmissionState::Validating, SubmissionState::Blocked, None, &blockers)
            .await?;
        notify_quietly(
            self.notifier.as_ref(),
            &request.actor,
            Notice::normal(format!(
                "Skipped \"{}\" for r/{}: {}",
                request.title,
                request.destination,
                blockers.join("; ")
            )),
        )
        .await;
        Ok(SubmissionState::Blocked)
    }
}
