//! Calendar scheduler
//!
//! Turns a closed batch of content into queued submission requests:
//! plan slots, pick a destination per slot, adapt the caption for that
//! destination, then upsert. Content the actor already has queued, in
//! flight or published is skipped before any destination is drawn, so a
//! redelivered batch schedules nothing new.

pub mod batch;
pub mod slots;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::SchedulerConfig;
use crate::messaging::{notify_quietly, Notice, Notifier};
use crate::store::Store;
use crate::types::{ActorId, AdaptedContent, ContentItem, Destination, SubmissionRequest};

pub use batch::{Batch, BatchAccumulator};
pub use slots::{assign_destinations, plan_slots, Assignment, SlotPlan};

/// Maximum title length the platform accepts
const MAX_TITLE_CHARS: usize = 300;

/// Rewrites a caption for one destination. `Ok(None)` is a refusal.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContentAdapter: Send + Sync {
    async fn adapt(
        &self,
        content: &ContentItem,
        destination: &Destination,
        persona: &str,
    ) -> Result<Option<AdaptedContent>>;
}

/// Original caption as title, used on refusal or error
pub fn fallback_content(content: &ContentItem) -> AdaptedContent {
    let first_line = content.caption.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    let mut title: String = first_line.trim().chars().take(MAX_TITLE_CHARS).collect();
    if title.is_empty() {
        title = content.id.clone();
    }
    AdaptedContent { title, body: None }
}

/// Passes captions through unchanged
pub struct CaptionAdapter;

#[async_trait]
impl ContentAdapter for CaptionAdapter {
    async fn adapt(
        &self,
        content: &ContentItem,
        _destination: &Destination,
        _persona: &str,
    ) -> Result<Option<AdaptedContent>> {
        Ok(Some(fallback_content(content)))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScheduleOutcome {
    /// Newly queued requests
    pub queued: Vec<SubmissionRequest>,
    /// Items already queued, in flight or published for the actor
    pub duplicates: usize,
    /// Items with no slot or no eligible destination
    pub overflow: Vec<ContentItem>,
}

pub struct CalendarScheduler {
    store: Store,
    adapter: Arc<dyn ContentAdapter>,
    notifier: Arc<dyn Notifier>,
    config: SchedulerConfig,
    personas: HashMap<ActorId, String>,
}

impl CalendarScheduler {
    pub fn new(
        store: Store,
        adapter: Arc<dyn ContentAdapter>,
        notifier: Arc<dyn Notifier>,
        config: SchedulerConfig,
        personas: HashMap<ActorId, String>,
    ) -> Self {
        Self {
            store,
            adapter,
            notifier,
            config,
            personas,
        }
    }

    /// Plan and persist one closed batch
    pub async fn schedule_batch(&self, actor: &ActorId, items: Vec<ContentItem>) -> Result<ScheduleOutcome> {
        self.schedule_at(actor, items, Utc::now()).await
    }

    pub async fn schedule_at(
        &self,
        actor: &ActorId,
        items: Vec<ContentItem>,
        now: DateTime<Utc>,
    ) -> Result<ScheduleOutcome> {
        let already = self.store.scheduled_content_ids(actor).await?;
        let mut seen = HashSet::new();
        let total = items.len();
        let items: Vec<ContentItem> = items
            .into_iter()
            .filter(|item| !already.contains(&item.id) && seen.insert(item.id.clone()))
            .collect();
        let duplicates = total - items.len();
        if items.is_empty() {
            if duplicates > 0 {
                info!("All {} items for {} are already scheduled", duplicates, actor);
            }
            return Ok(ScheduleOutcome {
                duplicates,
                ..Default::default()
            });
        }

        let taken = self.store.pending_slots(actor, now).await?;
        let destinations = self.store.list_destinations(actor).await?;
        let summary = self.store.get_summary(actor).await?;

        let (plan, (assignments, unassigned)) = {
            let mut rng = rand::rng();
            let plan = plan_slots(items.len(), now, &taken, &self.config, &mut rng);
            let assigned = assign_destinations(&items, &plan.slots, &destinations, summary.as_ref(), &mut rng);
            (plan, assigned)
        };

        let persona = self.personas.get(actor).map(String::as_str).unwrap_or("");
        let by_name: HashMap<String, &Destination> =
            destinations.iter().map(|d| (d.name.to_lowercase(), d)).collect();

        let mut outcome = ScheduleOutcome {
            overflow: unassigned,
            duplicates,
            ..Default::default()
        };

        for assignment in assignments {
            let Some(destination) = by_name.get(&assignment.destination.to_lowercase()) else {
                continue;
            };
            let adapted = self.adapt(&assignment.item, destination, persona).await;
            let request = SubmissionRequest::new(
                actor.clone(),
                assignment.item,
                destination.name.clone(),
                adapted,
                assignment.at,
            );
            match self.store.upsert_submission(&request).await {
                Ok(true) => outcome.queued.push(request),
                Ok(false) => outcome.duplicates += 1,
                Err(e) => {
                    warn!("Failed to queue {} for r/{}: {}", request.content.id, request.destination, e);
                    outcome.overflow.push(request.content);
                }
            }
        }

        info!(
            "Scheduled {} items for {} ({} duplicates, {} unplaced, {} over horizon)",
            outcome.queued.len(),
            actor,
            outcome.duplicates,
            outcome.overflow.len(),
            plan.overflow
        );
        notify_quietly(self.notifier.as_ref(), actor, Notice::normal(plan_summary(&outcome))).await;
        Ok(outcome)
    }

    async fn adapt(&self, content: &ContentItem, destination: &Destination, persona: &str) -> AdaptedContent {
        match self.adapter.adapt(content, destination, persona).await {
            Ok(Some(adapted)) if !adapted.title.trim().is_empty() => AdaptedContent {
                title: adapted.title.trim().chars().take(MAX_TITLE_CHARS).collect(),
                body: adapted.body,
            },
            Ok(_) => {
                info!("Content adapter declined {} for r/{}; using caption", content.id, destination.name);
                fallback_content(content)
            }
            Err(e) => {
                warn!("Content adapter failed for {} ({}); using caption", content.id, e);
                fallback_content(content)
            }
        }
    }
}

fn plan_summary(outcome: &ScheduleOutcome) -> String {
    let mut lines = vec![format!("Scheduled {} posts:", outcome.queued.len())];
    for request in &outcome.queued {
        lines.push(format!(
            "• {} → r/{}",
            request.scheduled_at.format("%a %d %b %H:%M UTC"),
            request.destination
        ));
    }
    if !outcome.overflow.is_empty() {
        lines.push(format!(
            "{} items could not be placed (no slot or no eligible destination).",
            outcome.overflow.len()
        ));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::LogNotifier;
    use crate::types::DestinationStatus;
    use chrono::TimeZone;

    fn item(id: &str, caption: &str) -> ContentItem {
        ContentItem {
            id: id.into(),
            media_path: format!("/media/{}.jpg", id),
            caption: caption.into(),
            nsfw: false,
            style: Some("portrait".into()),
        }
    }

    async fn store_with_destinations(names: &[&str]) -> Store {
        let store = Store::in_memory().unwrap();
        for name in names {
            let mut d = Destination::suggested(ActorId::new("ana"), *name);
            d.status = DestinationStatus::Approved;
            store.upsert_destination(&d).await.unwrap();
        }
        store
    }

    #[test]
    fn test_fallback_uses_first_caption_line() {
        let adapted = fallback_content(&item("c1", "\n  Golden hour  \nsecond line"));
        assert_eq!(adapted.title, "Golden hour");
        assert!(adapted.body.is_none());
        assert_eq!(fallback_content(&item("c2", "")).title, "c2");
    }

    #[tokio::test]
    async fn test_refusal_and_errors_fall_back_to_caption() {
        let store = store_with_destinations(&["pics", "earthporn"]).await;
        let mut adapter = MockContentAdapter::new();
        let mut calls = 0;
        adapter.expect_adapt().returning(move |_, _, _| {
            calls += 1;
            if calls == 1 {
                Ok(None)
            } else {
                Err(anyhow::anyhow!("rate limited"))
            }
        });

        let scheduler = CalendarScheduler::new(
            store.clone(),
            Arc::new(adapter),
            Arc::new(LogNotifier),
            SchedulerConfig::default(),
            HashMap::new(),
        );
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap();
        let outcome = scheduler
            .schedule_at(&ActorId::new("ana"), vec![item("c1", "Lake"), item("c2", "Ridge")], now)
            .await
            .unwrap();

        assert_eq!(outcome.queued.len(), 2);
        let titles: Vec<_> = outcome.queued.iter().map(|r| r.title.as_str()).collect();
        assert!(titles.contains(&"Lake"));
        assert!(titles.contains(&"Ridge"));
    }

    #[tokio::test]
    async fn test_rescheduling_same_batch_is_idempotent() {
        let store = store_with_destinations(&["pics"]).await;
        let scheduler = CalendarScheduler::new(
            store.clone(),
            Arc::new(CaptionAdapter),
            Arc::new(LogNotifier),
            SchedulerConfig::default(),
            HashMap::new(),
        );
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap();
        let actor = ActorId::new("ana");

        let first = scheduler.schedule_at(&actor, vec![item("c1", "Lake")], now).await.unwrap();
        let second = scheduler.schedule_at(&actor, vec![item("c1", "Lake")], now).await.unwrap();
        assert_eq!(first.queued.len(), 1);
        assert_eq!(second.queued.len(), 0);
        assert_eq!(second.duplicates, 1);
        assert_eq!(store.list_submissions(&actor, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_redelivered_batch_over_many_destinations_adds_nothing() {
        let store = store_with_destinations(&["pics", "earthporn", "skylines", "harbours", "coastlines"]).await;
        let scheduler = CalendarScheduler::new(
            store.clone(),
            Arc::new(CaptionAdapter),
            Arc::new(LogNotifier),
            SchedulerConfig::default(),
            HashMap::new(),
        );
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap();
        let actor = ActorId::new("ana");
        let batch = || (1..=4).map(|i| item(&format!("c{}", i), "Lake")).collect::<Vec<_>>();

        let first = scheduler.schedule_at(&actor, batch(), now).await.unwrap();
        assert_eq!(first.queued.len(), 4);
        for _ in 0..3 {
            let again = scheduler.schedule_at(&actor, batch(), now).await.unwrap();
            assert!(again.queued.is_empty());
            assert_eq!(again.duplicates, 4);
        }

        let rows = store.list_submissions(&actor, 50).await.unwrap();
        assert_eq!(rows.len(), 4);
        let contents: HashSet<_> = rows.iter().map(|r| r.content.id.clone()).collect();
        assert_eq!(contents.len(), 4);
    }

    #[tokio::test]
    async fn test_repeated_item_within_a_batch_is_scheduled_once() {
        let store = store_with_destinations(&["pics", "earthporn", "skylines"]).await;
        let scheduler = CalendarScheduler::new(
            store.clone(),
            Arc::new(CaptionAdapter),
            Arc::new(LogNotifier),
            SchedulerConfig::default(),
            HashMap::new(),
        );
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap();
        let outcome = scheduler
            .schedule_at(&ActorId::new("ana"), vec![item("c1", "Lake"), item("c1", "Lake")], now)
            .await
            .unwrap();
        assert_eq!(outcome.queued.len(), 1);
        assert_eq!(outcome.duplicates, 1);
    }

    #[tokio::test]
    async fn test_no_destinations_means_overflow() {
        let store = Store::in_memory().unwrap();
        let scheduler = CalendarScheduler::new(
            store,
            Arc::new(CaptionAdapter),
            Arc::new(LogNotifier),
            SchedulerConfig::default(),
            HashMap::new(),
        );
        let outcome = scheduler
            .schedule_batch(&ActorId::new("ana"), vec![item("c1", "Lake")])
            .await
            .unwrap();
        assert!(outcome.queued.is_empty());
        assert_eq!(outcome.overflow.len(), 1);
    }
}
