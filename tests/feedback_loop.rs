//! Scheduling, gating, monitoring, risk and learning working together

mod common;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::*;
use postline::compliance::ComplianceGate;
use postline::config::SchedulerConfig;
use postline::learner::PerformanceLearner;
use postline::monitor::{OutcomeMonitor, RiskAdjuster};
use postline::pipeline::Dispatcher;
use postline::risk::RiskAdapter;
use postline::rules::RuleCache;
use postline::scheduler::{CalendarScheduler, CaptionAdapter};
use postline::store::Store;
use postline::types::{
    ActorId, Destination, DestinationStatus, Engagement, ExternalRef, Liveness, Policy, PublishedItem, RiskProfile,
    SubmissionState,
};

fn week_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2031, 6, 2, 0, 0, 0).unwrap()
}

fn scheduler(store: &Store, notifier: Arc<RecordingNotifier>, config: SchedulerConfig) -> CalendarScheduler {
    CalendarScheduler::new(store.clone(), Arc::new(CaptionAdapter), notifier, config, HashMap::new())
}

fn published(id: usize, destination: &str) -> PublishedItem {
    PublishedItem {
        submission_id: format!("s{}", id),
        actor: ana(),
        destination: destination.to_string(),
        external: ExternalRef {
            id: format!("x{}", id),
            url: format!("{}/r/{}/comments/x{}/", PRIMARY, destination, id),
        },
        published_at: Utc::now() - Duration::hours(2),
        last_checked_at: None,
        liveness: Liveness::Live,
        engagement: Engagement::default(),
        style: None,
    }
}

/// Real risk adapter that counts how often it is asked
struct CountingRisk {
    inner: RiskAdapter,
    calls: AtomicUsize,
}

#[async_trait]
impl RiskAdjuster for CountingRisk {
    async fn adjust(&self, actor: &ActorId, destination: &str) -> Result<RiskProfile> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.adjust(actor, destination).await
    }
}

#[tokio::test]
async fn test_ten_items_at_four_per_day_span_three_days() {
    let store = Store::in_memory().unwrap();
    for name in ["harbours", "skylines", "coastlines"] {
        approved(&store, name).await;
    }
    let notifier = Arc::new(RecordingNotifier::default());
    let config = SchedulerConfig {
        max_per_day: 4,
        min_spacing_minutes: 90,
        ..Default::default()
    };
    let scheduler = scheduler(&store, notifier.clone(), config);

    let items = (0..10).map(|i| content(&format!("c{}", i))).collect();
    let outcome = scheduler.schedule_at(&ana(), items, week_start()).await.unwrap();
    assert_eq!(outcome.queued.len(), 10);
    assert!(outcome.overflow.is_empty());

    let mut slots: Vec<DateTime<Utc>> = outcome.queued.iter().map(|r| r.scheduled_at).collect();
    slots.sort();
    let mut per_day: HashMap<NaiveDate, usize> = HashMap::new();
    for slot in &slots {
        *per_day.entry(slot.date_naive()).or_default() += 1;
    }
    assert!(per_day.len() >= 3);
    assert!(per_day.values().all(|n| *n <= 4));
    for pair in slots.windows(2) {
        if pair[0].date_naive() == pair[1].date_naive() {
            assert!(pair[1] - pair[0] >= Duration::minutes(90));
        }
    }

    for req in &outcome.queued {
        let stored = store.get_submission(&req.id).await.unwrap().unwrap();
        assert_eq!(stored.state, SubmissionState::Queued);
        assert!(stored.title.starts_with("Evening light"));
    }
    assert!(notifier.texts()[0].starts_with("Scheduled 10 posts"));
}

#[tokio::test]
async fn test_banned_destinations_are_never_scheduled_or_passed() {
    for seed in 0..25u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let store = Store::in_memory().unwrap();
        let gate = offline_gate(&store);

        let mut banned = Vec::new();
        for i in 0..rng.random_range(1..7) {
            let mut destination = Destination::suggested(ana(), format!("dest{}", i));
            destination.status = DestinationStatus::Approved;
            destination.banned = rng.random_bool(0.5);
            destination.elevated_priority = rng.random_bool(0.3);
            if destination.banned {
                banned.push(destination.clone());
            }
            store.upsert_destination(&destination).await.unwrap();
        }

        let scheduler = scheduler(&store, Arc::new(RecordingNotifier::default()), SchedulerConfig::default());
        let items = (0..6).map(|i| content(&format!("c{}", i))).collect();
        let outcome = scheduler.schedule_at(&ana(), items, week_start()).await.unwrap();
        for req in &outcome.queued {
            assert!(
                !banned.iter().any(|d| d.name == req.destination),
                "seed {} scheduled banned r/{}",
                seed,
                req.destination
            );
        }

        for destination in &banned {
            let req = request(content("probe"), &destination.name, week_start());
            let report = gate.check(destination, &req).await.unwrap();
            assert!(!report.ok);
            assert!(report.blockers.iter().any(|b| b.contains("banned")));
        }
    }
}

#[tokio::test]
async fn test_high_removal_rate_blocks_and_bans() {
    let store = Store::in_memory().unwrap();
    let destination = approved(&store, "harbours").await;
    for i in 0..4 {
        store.record_published(&published(i, "harbours")).await.unwrap();
    }
    for i in 0..3 {
        store.mark_removed(&format!("s{}", i), Utc::now()).await.unwrap();
    }

    let gate = offline_gate(&store);
    let req = request(content("c9"), "harbours", Utc::now() + Duration::hours(1));
    let report = gate.check(&destination, &req).await.unwrap();
    assert!(!report.ok);
    assert!(report.blockers.iter().any(|b| b.contains("high removal rate")));

    let profile = RiskAdapter::new(store.clone()).adjust(&ana(), "harbours").await.unwrap();
    assert_eq!((profile.total_posts, profile.removed_count), (4, 3));
    assert!(profile.banned);
    assert_eq!(profile.cooldown_hours, 168);
    assert!(store.get_destination(&ana(), "harbours").await.unwrap().unwrap().banned);
}

#[tokio::test]
async fn test_verification_requirement_blocks_and_flags() {
    let store = Store::in_memory().unwrap();
    let destination = approved(&store, "verifiedonly").await;
    let policy = Policy {
        requires_verification: true,
        ..Policy::permissive(Utc::now())
    };
    let rules = Arc::new(RuleCache::new(store.clone(), Arc::new(StaticSource), Arc::new(FixedParser(policy))));
    let gate = ComplianceGate::new(store.clone(), rules);

    let req = request(content("c1"), "verifiedonly", Utc::now() + Duration::hours(1));
    let report = gate.check(&destination, &req).await.unwrap();
    assert!(!report.ok);
    assert!(report.blockers.iter().any(|b| b.contains("verification")));

    let flagged = store.get_destination(&ana(), "verifiedonly").await.unwrap().unwrap();
    assert!(flagged.needs_verification);
    assert!(!flagged.is_schedulable(Utc::now()));
}

#[tokio::test]
async fn test_removed_item_triggers_exactly_one_risk_adjustment() {
    let store = Store::in_memory().unwrap();
    approved(&store, "harbours").await;
    store.record_published(&published(1, "harbours")).await.unwrap();
    store.record_published(&published(2, "harbours")).await.unwrap();

    let probe = Arc::new(TableProbe::default());
    probe.removed.lock().unwrap().push("x1".to_string());
    let risk = Arc::new(CountingRisk {
        inner: RiskAdapter::new(store.clone()),
        calls: AtomicUsize::new(0),
    });
    let monitor = OutcomeMonitor::new(
        store.clone(),
        probe,
        risk.clone(),
        Arc::new(RecordingNotifier::default()),
        72,
    );

    let first = monitor.run_cycle().await.unwrap();
    assert_eq!((first.checked, first.removed), (2, 1));
    let second = monitor.run_cycle().await.unwrap();
    assert_eq!((second.checked, second.removed), (1, 0));
    assert_eq!(risk.calls.load(Ordering::SeqCst), 1);

    let removed = store.get_published("s1").await.unwrap().unwrap();
    assert_eq!(removed.liveness, Liveness::Removed);
    let live = store.get_published("s2").await.unwrap().unwrap();
    assert_eq!(live.engagement, Engagement { score: 12, comments: 3 });
}

#[tokio::test(start_paused = true)]
async fn test_publish_remove_cooldown_and_learn() {
    let store = Store::in_memory().unwrap();
    approved(&store, "harbours").await;
    // Three earlier posts that stayed up
    for i in 10..13 {
        store.record_published(&published(i, "harbours")).await.unwrap();
    }
    let notifier = Arc::new(RecordingNotifier::default());

    // Publish through the browser
    let browser = FakeBrowser::new(Site::default());
    let dispatcher = Dispatcher::new(
        store.clone(),
        offline_gate(&store),
        Arc::new(executor(
            &store,
            browser.clone(),
            Arc::new(postline::executor::NoOracle),
            notifier.clone(),
        )),
        notifier.clone(),
        3,
        30,
    );
    let req = request(content("c1"), "harbours", Utc::now() - Duration::minutes(5));
    store.upsert_submission(&req).await.unwrap();
    let report = dispatcher.dispatch_due().await.unwrap();
    assert_eq!(report.published, 1);
    let item = store.get_published(&req.id).await.unwrap().unwrap();
    assert_eq!(item.external.id, "p1");

    // Live on the first check, gone on the second
    let probe = Arc::new(TableProbe::default());
    let risk = RiskAdapter::new(store.clone());
    let monitor = OutcomeMonitor::new(store.clone(), probe.clone(), Arc::new(risk), notifier.clone(), 72);
    assert_eq!(monitor.run_cycle().await.unwrap().removed, 0);
    probe.removed.lock().unwrap().push("p1".to_string());
    assert_eq!(monitor.run_cycle().await.unwrap().removed, 1);

    let profile = store.get_risk_profile(&ana(), "harbours").await.unwrap().unwrap();
    assert_eq!((profile.total_posts, profile.removed_count), (4, 1));
    assert_eq!(profile.cooldown_hours, 48);
    let destination = store.get_destination(&ana(), "harbours").await.unwrap().unwrap();
    assert!(destination.cooldown_until.unwrap() > Utc::now() + Duration::hours(47));
    assert!(!destination.is_schedulable(Utc::now()));
    assert!(notifier.texts().iter().any(|t| t.contains("was removed")));

    // Learner sees the removal and is stable across recomputes
    let learner = PerformanceLearner::new(store.clone());
    let first = learner.recompute(&ana()).await.unwrap();
    let stats = &first.by_destination["harbours"];
    assert_eq!((stats.posts, stats.removed), (4, 1));
    let second = learner.recompute(&ana()).await.unwrap();
    assert_eq!(first.by_destination, second.by_destination);
    assert_eq!(first.top_destinations, second.top_destinations);
    assert_eq!(first.best_hours, second.best_hours);
    assert_eq!(store.get_summary(&ana()).await.unwrap().unwrap().by_destination, second.by_destination);
    assert_eq!(browser.record().published.len(), 1);
}
