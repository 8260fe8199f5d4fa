//! Persistent relational store
//!
//! The single source of shared state across components:
//! - Destinations and their cooldown/ban flags
//! - Cached destination policies
//! - Submission requests (also the dispatch queue)
//! - Published items and their liveness
//! - Risk profiles and performance summaries
//! - The intake queue of inbound content items
//!
//! Every write is an upsert or a conditional update keyed by identity, so
//! handlers can run more than once for the same input.

pub mod sqlite;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ActorId, ContentItem};

pub use sqlite::{Store, StoreStats};

/// An inbound content item waiting to be batched
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeEntry {
    pub id: i64,
    pub actor: ActorId,
    pub content: ContentItem,
    pub received_at: DateTime<Utc>,
}

/// Timestamps are stored as fixed-width RFC 3339 so that text comparison
/// in SQL matches chronological order
pub(crate) fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_default()
}

pub(crate) fn parse_opt_ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(parse_ts)
}
