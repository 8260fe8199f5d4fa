//! Outcome monitor: re-checks that recent posts are still up
//!
//! A failed probe leaves the item as it was; only a positive signal from
//! the platform (gone, forbidden, removal markers) marks it removed.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::messaging::{notify_quietly, Notice, Notifier};
use crate::risk::RiskAdapter;
use crate::store::Store;
use crate::types::{ActorId, Engagement, ExternalRef, PublishedItem, RiskProfile};

/// Parallel probes per cycle
const PROBE_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Live(Engagement),
    Removed(String),
}

/// Public, unauthenticated view of a published item. `Err` means the
/// platform could not be asked, not that the item is gone.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn probe(&self, external: &ExternalRef) -> Result<ProbeOutcome>;
}

/// What the monitor calls when an item goes down
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RiskAdjuster: Send + Sync {
    async fn adjust(&self, actor: &ActorId, destination: &str) -> Result<RiskProfile>;
}

#[async_trait]
impl RiskAdjuster for RiskAdapter {
    async fn adjust(&self, actor: &ActorId, destination: &str) -> Result<RiskProfile> {
        RiskAdapter::adjust(self, actor, destination).await
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorReport {
    pub checked: usize,
    pub removed: usize,
    pub unknown: usize,
}

enum ItemResult {
    Live,
    Removed,
    Unchanged,
}

pub struct OutcomeMonitor {
    store: Store,
    probe: Arc<dyn LivenessProbe>,
    risk: Arc<dyn RiskAdjuster>,
    notifier: Arc<dyn Notifier>,
    max_age: Duration,
}

impl OutcomeMonitor {
    pub fn new(
        store: Store,
        probe: Arc<dyn LivenessProbe>,
        risk: Arc<dyn RiskAdjuster>,
        notifier: Arc<dyn Notifier>,
        max_age_hours: i64,
    ) -> Self {
        Self {
            store,
            probe,
            risk,
            notifier,
            max_age: Duration::hours(max_age_hours),
        }
    }

    /// One pass over live items younger than the age limit
    pub async fn run_cycle(&self) -> Result<MonitorReport> {
        let items = self.store.live_items_since(Utc::now() - self.max_age).await?;
        debug!("Monitoring {} live items", items.len());

        let results: Vec<ItemResult> = stream::iter(items)
            .map(|item| async move { self.check(&item).await })
            .buffer_unordered(PROBE_CONCURRENCY)
            .collect()
            .await;

        let mut report = MonitorReport::default();
        for result in results {
            report.checked += 1;
            match result {
                ItemResult::Live => {}
                ItemResult::Removed => report.removed += 1,
                ItemResult::Unchanged => report.unknown += 1,
            }
        }
        if report.removed > 0 {
            info!("Monitor cycle: {} checked, {} newly removed", report.checked, report.removed);
        }
        Ok(report)
    }

    async fn check(&self, item: &PublishedItem) -> ItemResult {
        let now = Utc::now();
        match self.probe.probe(&item.external).await {
            Ok(ProbeOutcome::Live(engagement)) => {
                if let Err(e) = self.store.record_check(&item.submission_id, engagement, now).await {
                    warn!("Failed to record check for {}: {}", item.submission_id, e);
                }
                ItemResult::Live
            }
            Ok(ProbeOutcome::Removed(reason)) => match self.store.mark_removed(&item.submission_id, now).await {
                Ok(true) => {
                    self.on_removed(item, &reason).await;
                    ItemResult::Removed
                }
                Ok(false) => ItemResult::Unchanged,
                Err(e) => {
                    warn!("Failed to mark {} removed: {}", item.submission_id, e);
                    ItemResult::Unchanged
                }
            },
            Err(e) => {
                debug!("Probe of {} failed, leaving it live: {}", item.external.url, e);
                ItemResult::Unchanged
            }
        }
    }

    async fn on_removed(&self, item: &PublishedItem, reason: &str) {
        info!(
            "Post {} in r/{} for {} was removed ({})",
            item.external.id, item.destination, item.actor, reason
        );

        let posture = match self.risk.adjust(&item.actor, &item.destination).await {
            Ok(profile) if profile.banned => format!("r/{} is now excluded until reviewed.", item.destination),
            Ok(profile) => format!("r/{} is cooling down for {}h.", item.destination, profile.cooldown_hours),
            Err(e) => {
                warn!("Risk adjustment for r/{} failed: {}", item.destination, e);
                String::new()
            }
        };

        notify_quietly(
            self.notifier.as_ref(),
            &item.actor,
            Notice::high(format!(
                "Your post in r/{} was removed ({}). {}",
                item.destination, reason, posture
            ).trim_end().to_string()),
        )
        .await;
    }
}
