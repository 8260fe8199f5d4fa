//! Risk adapter: per-destination circuit breaker
//!
//! Counts are always recomputed from the published items, so a missed
//! increment is corrected on the next adjustment or sweep. The ladder only
//! escalates; a cooldown relaxes by expiring, and a ban is lifted only by
//! an operator review.

use anyhow::Result;
use chrono::{Duration, Utc};
use tracing::{debug, info, warn};

use crate::store::Store;
use crate::types::{ActorId, RiskProfile};

pub const BAN_HOURS: u32 = 168;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RiskLevel {
    pub cooldown_hours: u32,
    pub banned: bool,
}

/// Escalation ladder over the removal history of one pair
pub fn ladder(removed: u32, total: u32) -> RiskLevel {
    let rate = if total == 0 { 0.0 } else { removed as f64 / total as f64 };
    let (cooldown_hours, banned) = if removed >= 3 || rate > 0.6 {
        (BAN_HOURS, true)
    } else if removed >= 2 || rate > 0.4 {
        (72, false)
    } else if removed >= 1 {
        (48, false)
    } else {
        (RiskProfile::DEFAULT_COOLDOWN_HOURS, false)
    };
    RiskLevel { cooldown_hours, banned }
}

#[derive(Clone)]
pub struct RiskAdapter {
    store: Store,
}

impl RiskAdapter {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Recompute the pair's profile and push the destination's state
    pub async fn adjust(&self, actor: &ActorId, destination: &str) -> Result<RiskProfile> {
        let (total, removed) = self.store.outcome_counts(actor, destination).await?;
        let previous = self
            .store
            .get_risk_profile(actor, destination)
            .await?
            .unwrap_or_else(|| RiskProfile::new(actor.clone(), destination));

        let level = ladder(removed, total);
        let banned = previous.banned || level.banned;
        let profile = RiskProfile {
            actor: actor.clone(),
            destination: destination.to_string(),
            total_posts: total,
            removed_count: removed,
            cooldown_hours: if banned { BAN_HOURS } else { level.cooldown_hours },
            banned,
        };
        self.store.put_risk_profile(&profile).await?;

        // Only new evidence starts a cooldown; a sweep over unchanged counts
        // must not keep pushing it out
        let new_evidence = removed > previous.removed_count || (banned && !previous.banned);
        let current = self.store.get_destination(actor, destination).await?;
        let mut cooldown_until = current.as_ref().and_then(|d| d.cooldown_until);
        if new_evidence && profile.cooldown_hours > RiskProfile::DEFAULT_COOLDOWN_HOURS {
            let proposed = Utc::now() + Duration::hours(profile.cooldown_hours as i64);
            if cooldown_until.map(|until| proposed > until).unwrap_or(true) {
                cooldown_until = Some(proposed);
            }
        }

        if current.is_some() {
            self.store
                .apply_destination_risk(actor, destination, cooldown_until, banned, profile.removal_rate())
                .await?;
        }

        if banned && !previous.banned {
            warn!(
                "r/{} banned for {} after {} of {} posts were removed",
                destination, actor, removed, total
            );
        } else if new_evidence {
            info!(
                "r/{} for {}: {} of {} removed, cooldown {}h",
                destination, actor, removed, total, profile.cooldown_hours
            );
        } else {
            debug!("r/{} for {} unchanged", destination, actor);
        }

        Ok(profile)
    }

    /// Re-run `adjust` over every known pair
    pub async fn sweep(&self) -> Result<usize> {
        let profiles = self.store.list_risk_profiles().await?;
        let mut adjusted = 0;
        for profile in profiles {
            match self.adjust(&profile.actor, &profile.destination).await {
                Ok(_) => adjusted += 1,
                Err(e) => warn!(
                    "Risk sweep failed for r/{} ({}): {}",
                    profile.destination, profile.actor, e
                ),
            }
        }
        debug!("Risk sweep adjusted {} profiles", adjusted);
        Ok(adjusted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Destination, DestinationStatus, Engagement, ExternalRef, Liveness, PublishedItem};

    async fn seed(store: &Store, total: u32, removed: u32) {
        let actor = ActorId::new("ana");
        let mut dest = Destination::suggested(actor.clone(), "pics");
        dest.status = DestinationStatus::Approved;
        store.upsert_destination(&dest).await.unwrap();
        for i in 0..total {
            publish(store, i).await;
            if i < removed {
                store.mark_removed(&format!("s{}", i), Utc::now()).await.unwrap();
            }
        }
    }

    async fn publish(store: &Store, i: u32) {
        store
            .record_published(&PublishedItem {
                submission_id: format!("s{}", i),
                actor: ActorId::new("ana"),
                destination: "pics".into(),
                external: ExternalRef {
                    id: format!("x{}", i),
                    url: format!("https://example.com/comments/x{}", i),
                },
                published_at: Utc::now(),
                last_checked_at: None,
                liveness: Liveness::Live,
                engagement: Engagement::default(),
                style: None,
            })
            .await
            .unwrap();
    }

    #[test]
    fn test_ladder_rungs() {
        assert_eq!(ladder(0, 10), RiskLevel { cooldown_hours: 24, banned: false });
        assert_eq!(ladder(1, 10), RiskLevel { cooldown_hours: 48, banned: false });
        assert_eq!(ladder(2, 10), RiskLevel { cooldown_hours: 72, banned: false });
        assert_eq!(ladder(3, 10), RiskLevel { cooldown_hours: 168, banned: true });
        // Rate rules on small samples
        assert_eq!(ladder(1, 2).cooldown_hours, 72);
        assert!(ladder(2, 3).banned);
        assert_eq!(ladder(0, 0).cooldown_hours, 24);
    }

    #[test]
    fn test_ladder_is_monotonic_in_removals() {
        for total in 1..20u32 {
            let mut previous = ladder(0, total);
            for removed in 1..=total {
                let level = ladder(removed, total);
                assert!(level.cooldown_hours >= previous.cooldown_hours);
                assert!(level.banned || !previous.banned);
                previous = level;
            }
        }
    }

    #[tokio::test]
    async fn test_three_of_four_removed_bans() {
        let store = Store::in_memory().unwrap();
        seed(&store, 4, 3).await;
        let adapter = RiskAdapter::new(store.clone());

        let profile = adapter.adjust(&ActorId::new("ana"), "pics").await.unwrap();
        assert!(profile.banned);
        assert_eq!(profile.cooldown_hours, 168);
        assert_eq!(profile.total_posts, 4);
        assert_eq!(profile.removed_count, 3);

        let dest = store.get_destination(&ActorId::new("ana"), "pics").await.unwrap().unwrap();
        assert!(dest.banned);
        assert!((dest.risk_score - 0.75).abs() < 1e-9);
        assert!(dest.cooldown_until.unwrap() > Utc::now() + Duration::hours(167));
    }

    #[tokio::test]
    async fn test_ban_is_sticky_as_live_posts_accumulate() {
        let store = Store::in_memory().unwrap();
        seed(&store, 3, 3).await;
        let adapter = RiskAdapter::new(store.clone());
        adapter.adjust(&ActorId::new("ana"), "pics").await.unwrap();

        for i in 3..20 {
            publish(&store, i).await;
        }
        let profile = adapter.adjust(&ActorId::new("ana"), "pics").await.unwrap();
        assert!(profile.banned);
        assert_eq!(profile.cooldown_hours, 168);
    }

    #[tokio::test]
    async fn test_sweep_does_not_extend_cooldown_without_new_removals() {
        let store = Store::in_memory().unwrap();
        seed(&store, 5, 1).await;
        let adapter = RiskAdapter::new(store.clone());
        let actor = ActorId::new("ana");

        adapter.adjust(&actor, "pics").await.unwrap();
        let first = store.get_destination(&actor, "pics").await.unwrap().unwrap().cooldown_until;
        assert!(first.is_some());

        assert_eq!(adapter.sweep().await.unwrap(), 1);
        let second = store.get_destination(&actor, "pics").await.unwrap().unwrap().cooldown_until;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_sweep_corrects_missed_increment() {
        let store = Store::in_memory().unwrap();
        seed(&store, 4, 0).await;
        let adapter = RiskAdapter::new(store.clone());
        let actor = ActorId::new("ana");
        adapter.adjust(&actor, "pics").await.unwrap();

        // Removal recorded without the adapter being told
        store.mark_removed("s0", Utc::now()).await.unwrap();
        adapter.sweep().await.unwrap();

        let profile = store.get_risk_profile(&actor, "pics").await.unwrap().unwrap();
        assert_eq!(profile.removed_count, 1);
        assert_eq!(profile.cooldown_hours, 48);
    }

    #[tokio::test]
    async fn test_later_cooldown_is_never_pulled_earlier() {
        let store = Store::in_memory().unwrap();
        seed(&store, 10, 0).await;
        let actor = ActorId::new("ana");
        let far = Utc::now() + Duration::days(30);
        store
            .apply_destination_risk(&actor, "pics", Some(far), false, 0.0)
            .await
            .unwrap();

        store.mark_removed("s0", Utc::now()).await.unwrap();
        RiskAdapter::new(store.clone()).adjust(&actor, "pics").await.unwrap();

        let dest = store.get_destination(&actor, "pics").await.unwrap().unwrap();
        assert_eq!(dest.cooldown_until.map(|t| t.timestamp_millis()), Some(far.timestamp_millis()));
    }
}
