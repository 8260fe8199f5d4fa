//! Compliance gate: pre-submission validation
//!
//! Combines the destination's cached policy with the actor's removal
//! history. Blockers are business outcomes and come back as data.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::rules::RuleCache;
use crate::store::Store;
use crate::types::{ActorId, Destination, PerformanceSummary, Policy, RiskProfile, SubmissionRequest};

/// Removal rate above which a destination is blocked once it has history
const BLOCK_REMOVAL_RATE: f64 = 0.5;
const BLOCK_MIN_POSTS: u32 = 3;
const WARN_REMOVAL_RATE: f64 = 0.25;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComplianceReport {
    pub ok: bool,
    pub blockers: Vec<String>,
    pub warnings: Vec<String>,
    pub suggestions: Vec<String>,
    /// Policy the decision was made with
    #[serde(skip)]
    pub policy: Option<Policy>,
}

/// What the actor has done at a destination so far
#[derive(Debug, Clone, Default)]
pub struct ActorHistory {
    /// Counts recomputed from published items
    pub risk: Option<RiskProfile>,
    pub posts_today: u32,
    pub summary: Option<PerformanceSummary>,
}

/// Every rule, without I/O
pub fn evaluate(
    destination: &Destination,
    policy: Option<&Policy>,
    request: &SubmissionRequest,
    is_nsfw: bool,
    history: &ActorHistory,
) -> ComplianceReport {
    let mut report = ComplianceReport {
        policy: policy.cloned(),
        ..Default::default()
    };
    let name = &destination.name;

    if destination.banned {
        report.blockers.push(format!("r/{} is banned for this actor", name));
    }

    if let Some(until) = destination.cooldown_until {
        if request.scheduled_at < until {
            report.blockers.push(format!(
                "r/{} is cooling down until {}",
                name,
                until.format("%Y-%m-%d %H:%M UTC")
            ));
        }
    }

    if let Some(policy) = policy {
        if is_nsfw && !policy.nsfw_allowed {
            report.blockers.push(format!("NSFW content is not allowed in r/{}", name));
        }

        if policy.requires_verification {
            report.blockers.push(format!("r/{} requires account verification", name));
        }

        let title = request.title.to_lowercase();
        for term in &policy.banned_terms {
            let term = term.trim().to_lowercase();
            if !term.is_empty() && title.contains(&term) {
                report.blockers.push(format!("title contains banned term '{}'", term));
            }
        }

        if let Some(limit) = policy.max_posts_per_day {
            if history.posts_today >= limit {
                report.warnings.push(format!(
                    "posting limit of {} per day already reached in r/{}",
                    limit, name
                ));
            }
        }

        if policy.requires_flair {
            report
                .suggestions
                .push(format!("r/{} requires a post flair; a generic one will be chosen", name));
        }
    }

    if let Some(risk) = &history.risk {
        let rate = risk.removal_rate();
        if rate > BLOCK_REMOVAL_RATE && risk.total_posts > BLOCK_MIN_POSTS {
            report.blockers.push(format!(
                "high removal rate ({:.0}% of {} posts)",
                rate * 100.0,
                risk.total_posts
            ));
        } else if rate > WARN_REMOVAL_RATE && rate <= BLOCK_REMOVAL_RATE {
            report.warnings.push(format!("elevated removal rate ({:.0}%)", rate * 100.0));
        }
    }

    if let Some(last) = destination.last_submitted_at {
        if request.scheduled_at - last < Duration::hours(24) {
            report
                .warnings
                .push(format!("already posted to r/{} within the last 24h", name));
        }
    }

    if let Some(summary) = &history.summary {
        if summary.is_high_risk(name) {
            report
                .warnings
                .push(format!("r/{} is underperforming or risky for this actor", name));
        }
    }

    report.ok = report.blockers.is_empty();
    report
}

pub struct ComplianceGate {
    store: Store,
    rules: Arc<RuleCache>,
}

impl ComplianceGate {
    pub fn new(store: Store, rules: Arc<RuleCache>) -> Self {
        Self { store, rules }
    }

    /// History for a pair with counts taken from the published items
    pub async fn history(&self, actor: &ActorId, destination: &str, at: DateTime<Utc>) -> Result<ActorHistory> {
        let (total, removed) = self.store.outcome_counts(actor, destination).await?;
        let mut risk = self
            .store
            .get_risk_profile(actor, destination)
            .await?
            .unwrap_or_else(|| RiskProfile::new(actor.clone(), destination));
        risk.total_posts = total;
        risk.removed_count = removed;

        let day_start = at
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|d| d.and_utc())
            .unwrap_or(at);

        Ok(ActorHistory {
            risk: Some(risk),
            posts_today: self.store.published_since(actor, destination, day_start).await?,
            summary: self.store.get_summary(actor).await?,
        })
    }

    /// Validate a request against its destination. A verification
    /// requirement also flags the destination for manual review.
    pub async fn validate(
        &self,
        destination: &Destination,
        request: &SubmissionRequest,
        is_nsfw: bool,
        history: &ActorHistory,
    ) -> Result<ComplianceReport> {
        let policy = self.rules.get_policy(&destination.name).await?;
        let report = evaluate(destination, policy.as_ref(), request, is_nsfw, history);

        if policy.as_ref().map(|p| p.requires_verification).unwrap_or(false)
            && self
                .store
                .flag_needs_verification(&destination.actor, &destination.name)
                .await?
        {
            warn!(
                "r/{} requires verification; excluded for {} until reviewed",
                destination.name, destination.actor
            );
        }

        if report.ok {
            for warning in &report.warnings {
                info!("[{}] warning: {}", request.id, warning);
            }
        } else {
            info!("[{}] blocked: {}", request.id, report.blockers.join("; "));
        }
        Ok(report)
    }

    /// Load history and validate in one go
    pub async fn check(&self, destination: &Destination, request: &SubmissionRequest) -> Result<ComplianceReport> {
        let history = self
            .history(&request.actor, &destination.name, request.scheduled_at)
            .await?;
        self.validate(destination, request, request.nsfw, &history).await
    }
}
