//! Performance learner: advisory aggregates over published items
//!
//! [`summarize`] is pure and deterministic; the learner only loads items,
//! summarizes them and stores the result per actor.

use anyhow::Result;
use chrono::{DateTime, Timelike, Utc};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::store::Store;
use crate::types::{ActorId, DestinationStats, Liveness, PerformanceSummary, PublishedItem};

const MIN_POSTS: u32 = 2;
const MIN_HOUR_SAMPLES: usize = 3;
const MIN_STYLE_SAMPLES: usize = 2;
const HIGH_RISK_REMOVAL_RATE: f64 = 0.2;
const MAX_TOP: usize = 5;

fn by_score_desc<K: Ord>(a: &(K, f64), b: &(K, f64)) -> Ordering {
    b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal).then_with(|| a.0.cmp(&b.0))
}

pub fn summarize(actor: &ActorId, items: &[PublishedItem], computed_at: DateTime<Utc>) -> PerformanceSummary {
    let mut summary = PerformanceSummary::empty(actor.clone(), computed_at);
    if items.is_empty() {
        return summary;
    }

    for item in items {
        let stats = summary
            .by_destination
            .entry(item.destination.to_lowercase())
            .or_insert(DestinationStats {
                posts: 0,
                removed: 0,
                total_engagement: 0.0,
                avg_engagement: 0.0,
            });
        stats.posts += 1;
        if item.liveness == Liveness::Removed {
            stats.removed += 1;
        }
        stats.total_engagement += item.engagement.total();
    }
    for stats in summary.by_destination.values_mut() {
        stats.avg_engagement = stats.total_engagement / stats.posts as f64;
    }

    let total: f64 = items.iter().map(|i| i.engagement.total()).sum();
    let actor_mean = total / items.len() as f64;

    let mut high_risk = Vec::new();
    let mut ranked = Vec::new();
    for (name, stats) in &summary.by_destination {
        if stats.posts < MIN_POSTS {
            continue;
        }
        if stats.removal_rate() > HIGH_RISK_REMOVAL_RATE || stats.avg_engagement < actor_mean / 2.0 {
            high_risk.push(name.clone());
        } else {
            ranked.push((name.clone(), stats.avg_engagement));
        }
    }
    ranked.sort_by(by_score_desc);
    summary.top_destinations = ranked.into_iter().take(MAX_TOP).map(|(name, _)| name).collect();
    summary.high_risk_destinations = high_risk;

    let mut hours: BTreeMap<u32, Vec<f64>> = BTreeMap::new();
    for item in items {
        hours
            .entry(item.published_at.hour())
            .or_default()
            .push(item.engagement.total());
    }
    let mut hour_rank: Vec<(u32, f64)> = hours
        .into_iter()
        .filter(|(_, samples)| samples.len() >= MIN_HOUR_SAMPLES)
        .map(|(hour, samples)| (hour, samples.iter().sum::<f64>() / samples.len() as f64))
        .collect();
    hour_rank.sort_by(by_score_desc);
    summary.best_hours = hour_rank.into_iter().map(|(hour, _)| hour).collect();

    let mut styles: BTreeMap<(String, String), Vec<f64>> = BTreeMap::new();
    for item in items {
        if let Some(style) = item.style.as_deref().filter(|s| !s.trim().is_empty()) {
            styles
                .entry((item.destination.to_lowercase(), style.trim().to_lowercase()))
                .or_default()
                .push(item.engagement.total());
        }
    }
    let mut per_destination: BTreeMap<String, Vec<(String, f64)>> = BTreeMap::new();
    for ((destination, style), samples) in styles {
        if samples.len() >= MIN_STYLE_SAMPLES {
            let avg = samples.iter().sum::<f64>() / samples.len() as f64;
            per_destination.entry(destination).or_default().push((style, avg));
        }
    }
    for (destination, mut candidates) in per_destination {
        candidates.sort_by(by_score_desc);
        if let Some((style, _)) = candidates.into_iter().next() {
            summary.best_style.insert(destination, style);
        }
    }

    summary
}

pub struct PerformanceLearner {
    store: Store,
}

impl PerformanceLearner {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn recompute(&self, actor: &ActorId) -> Result<PerformanceSummary> {
        let items = self.store.published_for_actor(actor).await?;
        let summary = summarize(actor, &items, Utc::now());
        self.store.put_summary(&summary).await?;
        info!(
            "Recomputed performance of {}: {} destinations, top {:?}",
            actor,
            summary.by_destination.len(),
            summary.top_destinations
        );
        Ok(summary)
    }

    /// Recompute for every actor; one failure does not stop the rest
    pub async fn recompute_all(&self) -> Result<usize> {
        let mut done = 0;
        for actor in self.store.list_actors().await? {
            match self.recompute(&actor).await {
                Ok(_) => done += 1,
                Err(e) => warn!("Learner failed for {}: {}", actor, e),
            }
        }
        Ok(done)
    }
}
