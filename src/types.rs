//! Shared domain types used across modules
//!
//! Every component of the feedback loop reads and writes these records
//! through the store, so they live here to avoid circular dependencies.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use thiserror::Error;

/// The content-owning account the pipeline operates on behalf of
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActorId(pub String);

impl ActorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ActorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a destination before it can be targeted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DestinationStatus {
    Suggested,
    Approved,
}

impl DestinationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DestinationStatus::Suggested => "suggested",
            DestinationStatus::Approved => "approved",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "approved" => DestinationStatus::Approved,
            _ => DestinationStatus::Suggested,
        }
    }
}

/// A community on the platform, as seen by one actor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Destination {
    pub actor: ActorId,
    /// Community name without any platform prefix
    pub name: String,
    pub member_count: u64,
    pub nsfw: bool,
    pub status: DestinationStatus,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub banned: bool,
    pub elevated_priority: bool,
    pub needs_verification: bool,
    pub last_submitted_at: Option<DateTime<Utc>>,
    /// Removal rate of the matching risk profile
    pub risk_score: f64,
}

impl Destination {
    /// A freshly discovered destination awaiting approval
    pub fn suggested(actor: ActorId, name: impl Into<String>) -> Self {
        Self {
            actor,
            name: name.into(),
            member_count: 0,
            nsfw: false,
            status: DestinationStatus::Suggested,
            cooldown_until: None,
            banned: false,
            elevated_priority: false,
            needs_verification: false,
            last_submitted_at: None,
            risk_score: 0.0,
        }
    }

    pub fn is_cooling_down(&self, at: DateTime<Utc>) -> bool {
        self.cooldown_until.map(|until| at < until).unwrap_or(false)
    }

    /// Whether the scheduler may place this destination in a slot at `at`
    pub fn is_schedulable(&self, at: DateTime<Utc>) -> bool {
        self.status == DestinationStatus::Approved
            && !self.banned
            && !self.needs_verification
            && !self.is_cooling_down(at)
    }
}

/// Structured posting rules of a destination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub nsfw_allowed: bool,
    pub requires_flair: bool,
    pub requires_verification: bool,
    #[serde(default)]
    pub banned_terms: Vec<String>,
    /// Maximum submissions per day, when the community states one
    #[serde(default)]
    pub max_posts_per_day: Option<u32>,
    #[serde(default)]
    pub rules_text: Vec<String>,
    pub fetched_at: DateTime<Utc>,
}

impl Policy {
    /// Cache lifetime of a fetched policy
    pub const TTL_DAYS: i64 = 7;

    /// Fail-open policy used when the rules could not be understood
    pub fn permissive(fetched_at: DateTime<Utc>) -> Self {
        Self {
            nsfw_allowed: true,
            requires_flair: false,
            requires_verification: false,
            banned_terms: Vec::new(),
            max_posts_per_day: None,
            rules_text: Vec::new(),
            fetched_at,
        }
    }

    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now - self.fetched_at < Duration::days(Self::TTL_DAYS)
    }
}

/// A piece of creator content waiting to be distributed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: String,
    pub media_path: String,
    pub caption: String,
    pub nsfw: bool,
    #[serde(default)]
    pub style: Option<String>,
}

/// Title/body pair produced by the content adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptedContent {
    pub title: String,
    pub body: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubmissionState {
    Queued,
    Validating,
    Submitting,
    Published,
    Failed,
    Blocked,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("illegal submission transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: SubmissionState,
    pub to: SubmissionState,
}

impl SubmissionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionState::Queued => "queued",
            SubmissionState::Validating => "validating",
            SubmissionState::Submitting => "submitting",
            SubmissionState::Published => "published",
            SubmissionState::Failed => "failed",
            SubmissionState::Blocked => "blocked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(SubmissionState::Queued),
            "validating" => Some(SubmissionState::Validating),
            "submitting" => Some(SubmissionState::Submitting),
            "published" => Some(SubmissionState::Published),
            "failed" => Some(SubmissionState::Failed),
            "blocked" => Some(SubmissionState::Blocked),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubmissionState::Published | SubmissionState::Failed | SubmissionState::Blocked
        )
    }

    /// Transitions are monotonic; `Submitting -> Queued` is the bounded retry path
    pub fn can_transition(&self, to: SubmissionState) -> bool {
        use SubmissionState::*;
        matches!(
            (self, to),
            (Queued, Validating)
                | (Validating, Submitting)
                | (Validating, Blocked)
                | (Validating, Failed)
                | (Submitting, Published)
                | (Submitting, Failed)
                | (Submitting, Queued)
        )
    }

    pub fn transition(&self, to: SubmissionState) -> Result<SubmissionState, TransitionError> {
        if self.can_transition(to) {
            Ok(to)
        } else {
            Err(TransitionError { from: *self, to })
        }
    }
}

impl std::fmt::Display for SubmissionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A scheduled (content, destination) pair moving through the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionRequest {
    pub id: String,
    pub actor: ActorId,
    pub content: ContentItem,
    pub destination: String,
    pub title: String,
    pub body: Option<String>,
    pub nsfw: bool,
    pub scheduled_at: DateTime<Utc>,
    pub state: SubmissionState,
    pub attempts: u32,
    pub last_error: Option<String>,
    #[serde(default)]
    pub blockers: Vec<String>,
}

impl SubmissionRequest {
    /// Identity used for upserts: the same content aimed at the same
    /// destination by the same actor is always the same request
    pub fn identity(actor: &ActorId, content_id: &str, destination: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(actor.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(content_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(destination.to_lowercase().as_bytes());
        hex::encode(&hasher.finalize()[..16])
    }

    pub fn new(
        actor: ActorId,
        content: ContentItem,
        destination: impl Into<String>,
        adapted: AdaptedContent,
        scheduled_at: DateTime<Utc>,
    ) -> Self {
        let destination = destination.into();
        let id = Self::identity(&actor, &content.id, &destination);
        let nsfw = content.nsfw;
        Self {
            id,
            actor,
            content,
            destination,
            title: adapted.title,
            body: adapted.body,
            nsfw,
            scheduled_at,
            state: SubmissionState::Queued,
            attempts: 0,
            last_error: None,
            blockers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Liveness {
    Live,
    Removed,
}

impl Liveness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Liveness::Live => "live",
            Liveness::Removed => "removed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "removed" => Liveness::Removed,
            _ => Liveness::Live,
        }
    }
}

/// Engagement observed for a published item
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Engagement {
    pub score: i64,
    pub comments: i64,
}

impl Engagement {
    pub fn total(&self) -> f64 {
        (self.score + self.comments) as f64
    }
}

/// Where the platform put a published item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalRef {
    /// Platform-native item id
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedItem {
    pub submission_id: String,
    pub actor: ActorId,
    pub destination: String,
    pub external: ExternalRef,
    pub published_at: DateTime<Utc>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub liveness: Liveness,
    pub engagement: Engagement,
    #[serde(default)]
    pub style: Option<String>,
}

/// Per (actor, destination) removal history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskProfile {
    pub actor: ActorId,
    pub destination: String,
    pub total_posts: u32,
    pub removed_count: u32,
    pub cooldown_hours: u32,
    pub banned: bool,
}

impl RiskProfile {
    pub const DEFAULT_COOLDOWN_HOURS: u32 = 24;

    pub fn new(actor: ActorId, destination: impl Into<String>) -> Self {
        Self {
            actor,
            destination: destination.into(),
            total_posts: 0,
            removed_count: 0,
            cooldown_hours: Self::DEFAULT_COOLDOWN_HOURS,
            banned: false,
        }
    }

    pub fn removal_rate(&self) -> f64 {
        if self.total_posts == 0 {
            0.0
        } else {
            self.removed_count as f64 / self.total_posts as f64
        }
    }
}

/// Aggregated outcomes for one destination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationStats {
    pub posts: u32,
    pub removed: u32,
    pub total_engagement: f64,
    pub avg_engagement: f64,
}

impl DestinationStats {
    pub fn removal_rate(&self) -> f64 {
        if self.posts == 0 {
            0.0
        } else {
            self.removed as f64 / self.posts as f64
        }
    }
}

/// Advisory view of what has worked for an actor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub actor: ActorId,
    pub by_destination: BTreeMap<String, DestinationStats>,
    pub top_destinations: Vec<String>,
    pub high_risk_destinations: Vec<String>,
    /// UTC hours ordered best first
    pub best_hours: Vec<u32>,
    pub best_style: BTreeMap<String, String>,
    pub computed_at: DateTime<Utc>,
}

impl PerformanceSummary {
    pub fn empty(actor: ActorId, computed_at: DateTime<Utc>) -> Self {
        Self {
            actor,
            by_destination: BTreeMap::new(),
            top_destinations: Vec::new(),
            high_risk_destinations: Vec::new(),
            best_hours: Vec::new(),
            best_style: BTreeMap::new(),
            computed_at,
        }
    }

    pub fn is_high_risk(&self, destination: &str) -> bool {
        self.high_risk_destinations.iter().any(|d| d.eq_ignore_ascii_case(destination))
    }

    pub fn is_top(&self, destination: &str) -> bool {
        self.top_destinations.iter().any(|d| d.eq_ignore_ascii_case(destination))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submission_transitions_are_monotonic() {
        use SubmissionState::*;
        assert!(Queued.can_transition(Validating));
        assert!(Validating.can_transition(Blocked));
        assert!(Submitting.can_transition(Queued));
        assert!(!Published.can_transition(Queued));
        assert!(!Blocked.can_transition(Validating));
        assert!(!Queued.can_transition(Published));
        assert_eq!(
            Failed.transition(Submitting),
            Err(TransitionError { from: Failed, to: Submitting })
        );
    }

    #[test]
    fn test_identity_is_stable_and_case_insensitive_on_destination() {
        let actor = ActorId::new("ana");
        let a = SubmissionRequest::identity(&actor, "c1", "Pics");
        let b = SubmissionRequest::identity(&actor, "c1", "pics");
        let c = SubmissionRequest::identity(&actor, "c2", "pics");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_removal_rate() {
        let mut profile = RiskProfile::new(ActorId::new("ana"), "pics");
        assert_eq!(profile.removal_rate(), 0.0);
        profile.total_posts = 4;
        profile.removed_count = 3;
        assert!((profile.removal_rate() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_policy_ttl() {
        let now = Utc::now();
        let policy = Policy::permissive(now - Duration::days(6));
        assert!(policy.is_fresh(now));
        let stale = Policy::permissive(now - Duration::days(8));
        assert!(!stale.is_fresh(now));
    }

    #[test]
    fn test_destination_schedulable() {
        let now = Utc::now();
        let mut dest = Destination::suggested(ActorId::new("ana"), "pics");
        assert!(!dest.is_schedulable(now));
        dest.status = DestinationStatus::Approved;
        assert!(dest.is_schedulable(now));
        dest.cooldown_until = Some(now + Duration::hours(3));
        assert!(!dest.is_schedulable(now));
        assert!(dest.is_schedulable(now + Duration::hours(4)));
        dest.banned = true;
        assert!(!dest.is_schedulable(now + Duration::hours(4)));
    }
}
