//! Slot planning and destination assignment
//!
//! Both functions are pure apart from the injected random source, so tests
//! can seed it and assert structural properties.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashSet;

use crate::config::SchedulerConfig;
use crate::types::{ContentItem, Destination, PerformanceSummary};

#[derive(Debug, Clone, PartialEq)]
pub struct SlotPlan {
    /// Ascending slot times, one per planned item
    pub slots: Vec<DateTime<Utc>>,
    /// Items that did not fit inside the horizon
    pub overflow: usize,
}

/// Place up to `count` slots over the next `horizon_days` days.
///
/// `taken` holds slots already queued for the actor; they count against
/// the daily cap and the spacing rule.
pub fn plan_slots<R: Rng + ?Sized>(
    count: usize,
    now: DateTime<Utc>,
    taken: &[DateTime<Utc>],
    config: &SchedulerConfig,
    rng: &mut R,
) -> SlotPlan {
    let mut hours: Vec<u32> = config.peak_hours.iter().copied().filter(|h| *h < 24).collect();
    hours.sort_unstable();
    hours.dedup();

    let jitter_max = config.jitter_max_minutes.clamp(0, 59);
    let gap = Duration::minutes(config.min_spacing_minutes.max(0) + jitter_max);
    let mut slots = Vec::with_capacity(count);

    let today = now.date_naive();
    for offset in 0..config.horizon_days as i64 {
        if slots.len() == count {
            break;
        }
        let Some(day) = today.checked_add_signed(Duration::days(offset)) else {
            break;
        };

        let mut day_slots: Vec<DateTime<Utc>> = taken.iter().copied().filter(|t| t.date_naive() == day).collect();
        let mut capacity = config.max_per_day.saturating_sub(day_slots.len());

        for &hour in &hours {
            if capacity == 0 || slots.len() == count {
                break;
            }
            let Some(base) = at_hour(day, hour) else {
                continue;
            };
            // The base hour must clear every taken slot by spacing + jitter,
            // so the jittered slot clears it by at least the spacing.
            if day_slots.iter().any(|t| (base - *t).abs() < gap) {
                continue;
            }
            let jitter = if jitter_max > 0 { rng.random_range(0..jitter_max) } else { 0 };
            let slot = base + Duration::minutes(jitter);
            if slot <= now {
                continue;
            }
            day_slots.push(slot);
            slots.push(slot);
            capacity -= 1;
        }
    }

    SlotPlan {
        overflow: count - slots.len(),
        slots,
    }
}

fn at_hour(day: NaiveDate, hour: u32) -> Option<DateTime<Utc>> {
    day.and_hms_opt(hour, 0, 0).map(|t| t.and_utc())
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub item: ContentItem,
    pub destination: String,
    pub at: DateTime<Utc>,
}

/// Pair each slot with a destination. A destination is not repeated within
/// a day until every eligible one was used that day.
pub fn assign_destinations<R: Rng + ?Sized>(
    items: &[ContentItem],
    slots: &[DateTime<Utc>],
    destinations: &[Destination],
    summary: Option<&PerformanceSummary>,
    rng: &mut R,
) -> (Vec<Assignment>, Vec<ContentItem>) {
    let mut assignments = Vec::new();
    let mut unassigned = Vec::new();
    let mut used: HashSet<String> = HashSet::new();
    let mut current_day: Option<NaiveDate> = None;

    for (item, &at) in items.iter().zip(slots) {
        if current_day != Some(at.date_naive()) {
            current_day = Some(at.date_naive());
            used.clear();
        }

        let eligible: Vec<&Destination> = destinations
            .iter()
            .filter(|d| d.is_schedulable(at) && (!item.nsfw || d.nsfw))
            .collect();
        if eligible.is_empty() {
            unassigned.push(item.clone());
            continue;
        }

        let mut candidates: Vec<&Destination> = eligible
            .iter()
            .copied()
            .filter(|d| !used.contains(&d.name.to_lowercase()))
            .collect();
        if candidates.is_empty() {
            used.clear();
            candidates = eligible;
        }

        candidates.shuffle(rng);
        // Stable sort keeps the shuffle inside each priority tier
        candidates.sort_by_key(|d| {
            let top = summary.map(|s| s.is_top(&d.name)).unwrap_or(false);
            std::cmp::Reverse((d.elevated_priority || top) as u8)
        });

        let chosen = candidates[0];
        used.insert(chosen.name.to_lowercase());
        assignments.push(Assignment {
            item: item.clone(),
            destination: chosen.name.clone(),
            at,
        });
    }

    unassigned.extend(items.iter().skip(slots.len()).cloned());
    (assignments, unassigned)
}
