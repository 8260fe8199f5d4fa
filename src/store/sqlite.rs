//! SQLite-backed store for destinations, submissions, outcomes and risk

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{fmt_ts, parse_opt_ts, parse_ts, IntakeEntry};
use crate::types::{
    ActorId, ContentItem, Destination, DestinationStatus, Engagement, ExternalRef, Liveness,
    PerformanceSummary, Policy, PublishedItem, RiskProfile, SubmissionRequest, SubmissionState,
};

/// SQLite store shared by every component
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

/// Row counts for the status command
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub destinations: usize,
    pub queued: usize,
    pub published: usize,
    pub removed: usize,
    pub failed: usize,
    pub blocked: usize,
}

const SUBMISSION_COLUMNS: &str = "id, actor, destination, content, title, body, nsfw, scheduled_at, state, attempts, last_error, blockers";
const PUBLISHED_COLUMNS: &str = "submission_id, actor, destination, external_id, url, published_at, last_checked_at, liveness, score, comments, style";
const DESTINATION_COLUMNS: &str = "actor, name, member_count, nsfw, status, cooldown_until, banned, elevated_priority, needs_verification, last_submitted_at, risk_score";

impl Store {
    /// Open (or create) the store at the given path
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("Failed to open database {}", path.display()))?;

        // WAL lets the CLI read while the daemon writes
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;")?;

        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests and dry runs
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(r#"
            CREATE TABLE IF NOT EXISTS destinations (
                actor TEXT NOT NULL,
                name TEXT NOT NULL COLLATE NOCASE,
                member_count INTEGER NOT NULL DEFAULT 0,
                nsfw INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'suggested',
                cooldown_until TEXT,
                banned INTEGER NOT NULL DEFAULT 0,
                elevated_priority INTEGER NOT NULL DEFAULT 0,
                needs_verification INTEGER NOT NULL DEFAULT 0,
                last_submitted_at TEXT,
                risk_score REAL NOT NULL DEFAULT 0,
                PRIMARY KEY (actor, name)
            );

            CREATE TABLE IF NOT EXISTS policies (
                destination TEXT PRIMARY KEY COLLATE NOCASE,
                policy TEXT NOT NULL,
                fetched_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS submissions (
                id TEXT PRIMARY KEY,
                actor TEXT NOT NULL,
                destination TEXT NOT NULL COLLATE NOCASE,
                content TEXT NOT NULL,
                title TEXT NOT NULL,
                body TEXT,
                nsfw INTEGER NOT NULL DEFAULT 0,
                scheduled_at TEXT NOT NULL,
                state TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                blockers TEXT NOT NULL DEFAULT '[]',
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS published_items (
                submission_id TEXT PRIMARY KEY,
                actor TEXT NOT NULL,
                destination TEXT NOT NULL COLLATE NOCASE,
                external_id TEXT NOT NULL,
                url TEXT NOT NULL,
                published_at TEXT NOT NULL,
                last_checked_at TEXT,
                liveness TEXT NOT NULL DEFAULT 'live',
                score INTEGER NOT NULL DEFAULT 0,
                comments INTEGER NOT NULL DEFAULT 0,
                style TEXT
            );

            CREATE TABLE IF NOT EXISTS risk_profiles (
                actor TEXT NOT NULL,
                destination TEXT NOT NULL COLLATE NOCASE,
                total_posts INTEGER NOT NULL DEFAULT 0,
                removed_count INTEGER NOT NULL DEFAULT 0,
                cooldown_hours INTEGER NOT NULL DEFAULT 24,
                banned INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (actor, destination)
            );

            CREATE TABLE IF NOT EXISTS performance_summaries (
                actor TEXT PRIMARY KEY,
                summary TEXT NOT NULL,
                computed_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS intake (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                actor TEXT NOT NULL,
                content TEXT NOT NULL,
                received_at TEXT NOT NULL,
                consumed INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_submissions_due ON submissions(state, scheduled_at);
            CREATE INDEX IF NOT EXISTS idx_submissions_actor ON submissions(actor, scheduled_at);
            CREATE INDEX IF NOT EXISTS idx_published_recent ON published_items(liveness, published_at);
            CREATE INDEX IF NOT EXISTS idx_published_pair ON published_items(actor, destination);
            CREATE INDEX IF NOT EXISTS idx_intake_pending ON intake(consumed, id);
        "#)?;

        Ok(())
    }

    // ============ Destinations ============

    /// Insert or fully replace a destination record
    pub async fn upsert_destination(&self, dest: &Destination) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT INTO destinations
               (actor, name, member_count, nsfw, status, cooldown_until, banned,
                elevated_priority, needs_verification, last_submitted_at, risk_score)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
               ON CONFLICT(actor, name) DO UPDATE SET
                member_count = excluded.member_count,
                nsfw = excluded.nsfw,
                status = excluded.status,
                cooldown_until = excluded.cooldown_until,
                banned = excluded.banned,
                elevated_priority = excluded.elevated_priority,
                needs_verification = excluded.needs_verification,
                last_submitted_at = excluded.last_submitted_at,
                risk_score = excluded.risk_score"#,
            params![
                dest.actor.as_str(),
                dest.name,
                dest.member_count as i64,
                dest.nsfw,
                dest.status.as_str(),
                dest.cooldown_until.as_ref().map(fmt_ts),
                dest.banned,
                dest.elevated_priority,
                dest.needs_verification,
                dest.last_submitted_at.as_ref().map(fmt_ts),
                dest.risk_score,
            ],
        )?;
        Ok(())
    }

    pub async fn get_destination(&self, actor: &ActorId, name: &str) -> Result<Option<Destination>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM destinations WHERE actor = ?1 AND name = ?2",
            DESTINATION_COLUMNS
        ))?;
        let dest = stmt
            .query_row(params![actor.as_str(), name], row_to_destination)
            .optional()?;
        Ok(dest)
    }

    pub async fn list_destinations(&self, actor: &ActorId) -> Result<Vec<Destination>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM destinations WHERE actor = ?1 ORDER BY name",
            DESTINATION_COLUMNS
        ))?;
        let rows = stmt.query_map(params![actor.as_str()], row_to_destination)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Exclude a destination from scheduling until an operator reviews it
    pub async fn flag_needs_verification(&self, actor: &ActorId, name: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE destinations SET needs_verification = 1 WHERE actor = ?1 AND name = ?2 AND needs_verification = 0",
            params![actor.as_str(), name],
        )?;
        Ok(changed == 1)
    }

    /// Apply the risk adapter's decision to the destination row
    pub async fn apply_destination_risk(
        &self,
        actor: &ActorId,
        name: &str,
        cooldown_until: Option<DateTime<Utc>>,
        banned: bool,
        risk_score: f64,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"UPDATE destinations
               SET cooldown_until = ?3, banned = (banned OR ?4), risk_score = ?5
               WHERE actor = ?1 AND name = ?2"#,
            params![
                actor.as_str(),
                name,
                cooldown_until.as_ref().map(fmt_ts),
                banned,
                risk_score,
            ],
        )?;
        Ok(())
    }

    /// Ban a destination outright (hard platform block)
    pub async fn ban_destination(&self, actor: &ActorId, name: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE destinations SET banned = 1 WHERE actor = ?1 AND name = ?2",
            params![actor.as_str(), name],
        )?;
        conn.execute(
            r#"INSERT INTO risk_profiles (actor, destination, banned, cooldown_hours)
               VALUES (?1, ?2, 1, 168)
               ON CONFLICT(actor, destination) DO UPDATE SET banned = 1, cooldown_hours = 168"#,
            params![actor.as_str(), name],
        )?;
        Ok(())
    }

    pub async fn mark_destination_submitted(&self, actor: &ActorId, name: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE destinations SET last_submitted_at = ?3 WHERE actor = ?1 AND name = ?2",
            params![actor.as_str(), name, fmt_ts(&at)],
        )?;
        Ok(())
    }

    /// Manual review: lifts ban, verification flag and cooldown
    pub async fn review_destination(&self, actor: &ActorId, name: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            r#"UPDATE destinations
               SET banned = 0, needs_verification = 0, cooldown_until = NULL
               WHERE actor = ?1 AND name = ?2"#,
            params![actor.as_str(), name],
        )?;
        conn.execute(
            "UPDATE risk_profiles SET banned = 0, cooldown_hours = 24 WHERE actor = ?1 AND destination = ?2",
            params![actor.as_str(), name],
        )?;
        Ok(changed == 1)
    }

    /// Every actor that owns destinations or published items
    pub async fn list_actors(&self) -> Result<Vec<ActorId>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT actor FROM destinations UNION SELECT actor FROM published_items ORDER BY actor",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .map(ActorId)
            .collect())
    }

    // ============ Policies ============

    pub async fn get_cached_policy(&self, destination: &str) -> Result<Option<Policy>> {
        let conn = self.conn.lock().await;
        let raw: Option<String> = conn
            .query_row(
                "SELECT policy FROM policies WHERE destination = ?1",
                params![destination],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json).context("Corrupt cached policy")?)),
            None => Ok(None),
        }
    }

    pub async fn put_cached_policy(&self, destination: &str, policy: &Policy) -> Result<()> {
        let json = serde_json::to_string(policy)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO policies (destination, policy, fetched_at) VALUES (?1, ?2, ?3)",
            params![destination, json, fmt_ts(&policy.fetched_at)],
        )?;
        Ok(())
    }

    pub async fn delete_cached_policy(&self, destination: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM policies WHERE destination = ?1", params![destination])?;
        Ok(())
    }

    // ============ Submissions ============

    /// Insert a request unless one with the same identity exists.
    /// Returns whether a new row was written.
    pub async fn upsert_submission(&self, req: &SubmissionRequest) -> Result<bool> {
        let content = serde_json::to_string(&req.content)?;
        let blockers = serde_json::to_string(&req.blockers)?;
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            r#"INSERT INTO submissions
               (id, actor, destination, content, title, body, nsfw, scheduled_at, state,
                attempts, last_error, blockers, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
               ON CONFLICT(id) DO NOTHING"#,
            params![
                req.id,
                req.actor.as_str(),
                req.destination,
                content,
                req.title,
                req.body,
                req.nsfw,
                fmt_ts(&req.scheduled_at),
                req.state.as_str(),
                req.attempts,
                req.last_error,
                blockers,
                fmt_ts(&Utc::now()),
            ],
        )?;
        Ok(changed == 1)
    }

    pub async fn get_submission(&self, id: &str) -> Result<Option<SubmissionRequest>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM submissions WHERE id = ?1",
            SUBMISSION_COLUMNS
        ))?;
        Ok(stmt.query_row(params![id], row_to_submission).optional()?)
    }

    pub async fn list_submissions(&self, actor: &ActorId, limit: usize) -> Result<Vec<SubmissionRequest>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM submissions WHERE actor = ?1 ORDER BY scheduled_at DESC LIMIT ?2",
            SUBMISSION_COLUMNS
        ))?;
        let rows = stmt.query_map(params![actor.as_str(), limit as i64], row_to_submission)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Claim due queued requests by moving them to `validating`.
    /// A row claimed by another dispatcher is skipped.
    pub async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<SubmissionRequest>> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let candidates = {
            let mut stmt = tx.prepare_cached(&format!(
                "SELECT {} FROM submissions WHERE state = 'queued' AND scheduled_at <= ?1 ORDER BY scheduled_at LIMIT ?2",
                SUBMISSION_COLUMNS
            ))?;
            let rows = stmt.query_map(params![fmt_ts(&now), limit as i64], row_to_submission)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut claimed = Vec::with_capacity(candidates.len());
        for mut req in candidates {
            let changed = tx.execute(
                "UPDATE submissions SET state = 'validating', updated_at = ?2 WHERE id = ?1 AND state = 'queued'",
                params![req.id, fmt_ts(&now)],
            )?;
            if changed == 1 {
                req.state = SubmissionState::Validating;
                claimed.push(req);
            }
        }
        tx.commit()?;
        Ok(claimed)
    }

    /// Move a request between states. Fails on an illegal transition;
    /// returns `false` when the row was not in `from` any more.
    pub async fn transition_submission(
        &self,
        id: &str,
        from: SubmissionState,
        to: SubmissionState,
        last_error: Option<&str>,
        blockers: &[String],
    ) -> Result<bool> {
        from.transition(to)?;
        let blockers = serde_json::to_string(blockers)?;
        let attempt_increment = i64::from(to == SubmissionState::Submitting);
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            r#"UPDATE submissions
               SET state = ?3, last_error = COALESCE(?4, last_error), blockers = ?5,
                   attempts = attempts + ?6, updated_at = ?7
               WHERE id = ?1 AND state = ?2"#,
            params![
                id,
                from.as_str(),
                to.as_str(),
                last_error,
                blockers,
                attempt_increment,
                fmt_ts(&Utc::now()),
            ],
        )?;
        Ok(changed == 1)
    }

    /// The bounded retry path: `submitting -> queued` at a later time
    pub async fn requeue_submission(&self, id: &str, at: DateTime<Utc>, last_error: &str) -> Result<bool> {
        SubmissionState::Submitting.transition(SubmissionState::Queued)?;
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            r#"UPDATE submissions
               SET state = 'queued', scheduled_at = ?2, last_error = ?3, updated_at = ?4
               WHERE id = ?1 AND state = 'submitting'"#,
            params![id, fmt_ts(&at), last_error, fmt_ts(&Utc::now())],
        )?;
        Ok(changed == 1)
    }

    /// Content ids of an actor that are queued, in flight or published
    /// at any destination. Failed and blocked requests do not count.
    pub async fn scheduled_content_ids(&self, actor: &ActorId) -> Result<HashSet<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            r#"SELECT DISTINCT json_extract(content, '$.id') FROM submissions
               WHERE actor = ?1
                 AND state IN ('queued', 'validating', 'submitting', 'published')"#,
        )?;
        let rows = stmt.query_map(params![actor.as_str()], |row| row.get::<_, Option<String>>(0))?;
        Ok(rows
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .flatten()
            .collect())
    }

    /// Slots already taken by pending requests of an actor from `from` on
    pub async fn pending_slots(&self, actor: &ActorId, from: DateTime<Utc>) -> Result<Vec<DateTime<Utc>>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            r#"SELECT scheduled_at FROM submissions
               WHERE actor = ?1 AND scheduled_at >= ?2
                 AND state IN ('queued', 'validating', 'submitting')
               ORDER BY scheduled_at"#,
        )?;
        let rows = stmt.query_map(params![actor.as_str(), fmt_ts(&from)], |row| row.get::<_, String>(0))?;
        Ok(rows
            .collect::<rusqlite::Result<Vec<_>>>()?
            .iter()
            .map(|s| parse_ts(s))
            .collect())
    }

    /// Requests left in flight by a crashed process go back to the queue
    pub async fn recover_in_flight(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE submissions SET state = 'queued', updated_at = ?1 WHERE state IN ('validating', 'submitting')",
            params![fmt_ts(&Utc::now())],
        )?;
        Ok(changed)
    }

    // ============ Published items ============

    /// Record a successful submission. Returns `false` if the request had
    /// already produced an item.
    pub async fn record_published(&self, item: &PublishedItem) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            r#"INSERT INTO published_items
               (submission_id, actor, destination, external_id, url, published_at,
                last_checked_at, liveness, score, comments, style)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
               ON CONFLICT(submission_id) DO NOTHING"#,
            params![
                item.submission_id,
                item.actor.as_str(),
                item.destination,
                item.external.id,
                item.external.url,
                fmt_ts(&item.published_at),
                item.last_checked_at.as_ref().map(fmt_ts),
                item.liveness.as_str(),
                item.engagement.score,
                item.engagement.comments,
                item.style,
            ],
        )?;
        Ok(changed == 1)
    }

    pub async fn get_published(&self, submission_id: &str) -> Result<Option<PublishedItem>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM published_items WHERE submission_id = ?1",
            PUBLISHED_COLUMNS
        ))?;
        Ok(stmt.query_row(params![submission_id], row_to_published).optional()?)
    }

    /// Live items published at or after `since`
    pub async fn live_items_since(&self, since: DateTime<Utc>) -> Result<Vec<PublishedItem>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM published_items WHERE liveness = 'live' AND published_at >= ?1 ORDER BY published_at",
            PUBLISHED_COLUMNS
        ))?;
        let rows = stmt.query_map(params![fmt_ts(&since)], row_to_published)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub async fn published_for_actor(&self, actor: &ActorId) -> Result<Vec<PublishedItem>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM published_items WHERE actor = ?1 ORDER BY published_at, submission_id",
            PUBLISHED_COLUMNS
        ))?;
        let rows = stmt.query_map(params![actor.as_str()], row_to_published)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Flip an item to removed. Only the first caller sees `true`.
    pub async fn mark_removed(&self, submission_id: &str, at: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE published_items SET liveness = 'removed', last_checked_at = ?2 WHERE submission_id = ?1 AND liveness = 'live'",
            params![submission_id, fmt_ts(&at)],
        )?;
        Ok(changed == 1)
    }

    pub async fn record_check(&self, submission_id: &str, engagement: Engagement, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE published_items SET score = ?2, comments = ?3, last_checked_at = ?4 WHERE submission_id = ?1",
            params![submission_id, engagement.score, engagement.comments, fmt_ts(&at)],
        )?;
        Ok(())
    }

    /// (total, removed) published items for a pair
    pub async fn outcome_counts(&self, actor: &ActorId, destination: &str) -> Result<(u32, u32)> {
        let conn = self.conn.lock().await;
        let counts = conn.query_row(
            r#"SELECT COUNT(*), COALESCE(SUM(CASE WHEN liveness = 'removed' THEN 1 ELSE 0 END), 0)
               FROM published_items WHERE actor = ?1 AND destination = ?2"#,
            params![actor.as_str(), destination],
            |row| Ok((row.get::<_, u32>(0)?, row.get::<_, u32>(1)?)),
        )?;
        Ok(counts)
    }

    pub async fn published_since(&self, actor: &ActorId, destination: &str, since: DateTime<Utc>) -> Result<u32> {
        let conn = self.conn.lock().await;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM published_items WHERE actor = ?1 AND destination = ?2 AND published_at >= ?3",
            params![actor.as_str(), destination, fmt_ts(&since)],
            |row| row.get::<_, u32>(0),
        )?;
        Ok(count)
    }

    // ============ Risk profiles ============

    pub async fn get_risk_profile(&self, actor: &ActorId, destination: &str) -> Result<Option<RiskProfile>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT actor, destination, total_posts, removed_count, cooldown_hours, banned FROM risk_profiles WHERE actor = ?1 AND destination = ?2",
        )?;
        Ok(stmt.query_row(params![actor.as_str(), destination], row_to_risk).optional()?)
    }

    /// Lazily create the profile on first publish
    pub async fn ensure_risk_profile(&self, actor: &ActorId, destination: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO risk_profiles (actor, destination) VALUES (?1, ?2)",
            params![actor.as_str(), destination],
        )?;
        Ok(())
    }

    pub async fn put_risk_profile(&self, profile: &RiskProfile) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT INTO risk_profiles (actor, destination, total_posts, removed_count, cooldown_hours, banned)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6)
               ON CONFLICT(actor, destination) DO UPDATE SET
                total_posts = excluded.total_posts,
                removed_count = excluded.removed_count,
                cooldown_hours = excluded.cooldown_hours,
                banned = excluded.banned"#,
            params![
                profile.actor.as_str(),
                profile.destination,
                profile.total_posts,
                profile.removed_count,
                profile.cooldown_hours,
                profile.banned,
            ],
        )?;
        Ok(())
    }

    pub async fn list_risk_profiles(&self) -> Result<Vec<RiskProfile>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT actor, destination, total_posts, removed_count, cooldown_hours, banned FROM risk_profiles ORDER BY actor, destination",
        )?;
        let rows = stmt.query_map([], row_to_risk)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ============ Performance summaries ============

    pub async fn put_summary(&self, summary: &PerformanceSummary) -> Result<()> {
        let json = serde_json::to_string(summary)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO performance_summaries (actor, summary, computed_at) VALUES (?1, ?2, ?3)",
            params![summary.actor.as_str(), json, fmt_ts(&summary.computed_at)],
        )?;
        Ok(())
    }

    pub async fn get_summary(&self, actor: &ActorId) -> Result<Option<PerformanceSummary>> {
        let conn = self.conn.lock().await;
        let raw: Option<String> = conn
            .query_row(
                "SELECT summary FROM performance_summaries WHERE actor = ?1",
                params![actor.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json).context("Corrupt performance summary")?)),
            None => Ok(None),
        }
    }

    // ============ Intake queue ============

    pub async fn push_intake(&self, actor: &ActorId, content: &ContentItem) -> Result<i64> {
        let json = serde_json::to_string(content)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO intake (actor, content, received_at) VALUES (?1, ?2, ?3)",
            params![actor.as_str(), json, fmt_ts(&Utc::now())],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Take pending intake entries, marking them consumed
    pub async fn take_intake(&self, limit: usize) -> Result<Vec<IntakeEntry>> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let entries = {
            let mut stmt = tx.prepare_cached(
                "SELECT id, actor, content, received_at FROM intake WHERE consumed = 0 ORDER BY id LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], |row| {
                let content: String = row.get(2)?;
                Ok(IntakeEntry {
                    id: row.get(0)?,
                    actor: ActorId(row.get(1)?),
                    content: json_column(&content, 2)?,
                    received_at: parse_ts(&row.get::<_, String>(3)?),
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        for entry in &entries {
            tx.execute("UPDATE intake SET consumed = 1 WHERE id = ?1", params![entry.id])?;
        }
        tx.commit()?;
        Ok(entries)
    }

    // ============ Stats ============

    pub async fn stats(&self, actor: &ActorId) -> Result<StoreStats> {
        let conn = self.conn.lock().await;
        let count = |sql: &str| -> rusqlite::Result<usize> {
            conn.query_row(sql, params![actor.as_str()], |row| row.get::<_, i64>(0))
                .map(|n| n as usize)
        };
        Ok(StoreStats {
            destinations: count("SELECT COUNT(*) FROM destinations WHERE actor = ?1")?,
            queued: count("SELECT COUNT(*) FROM submissions WHERE actor = ?1 AND state = 'queued'")?,
            published: count("SELECT COUNT(*) FROM published_items WHERE actor = ?1")?,
            removed: count("SELECT COUNT(*) FROM published_items WHERE actor = ?1 AND liveness = 'removed'")?,
            failed: count("SELECT COUNT(*) FROM submissions WHERE actor = ?1 AND state = 'failed'")?,
            blocked: count("SELECT COUNT(*) FROM submissions WHERE actor = ?1 AND state = 'blocked'")?,
        })
    }
}

fn json_column<T: serde::de::DeserializeOwned>(raw: &str, idx: usize) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_destination(row: &Row<'_>) -> rusqlite::Result<Destination> {
    Ok(Destination {
        actor: ActorId(row.get(0)?),
        name: row.get(1)?,
        member_count: row.get::<_, i64>(2)?.max(0) as u64,
        nsfw: row.get(3)?,
        status: DestinationStatus::parse(&row.get::<_, String>(4)?),
        cooldown_until: parse_opt_ts(row.get(5)?),
        banned: row.get(6)?,
        elevated_priority: row.get(7)?,
        needs_verification: row.get(8)?,
        last_submitted_at: parse_opt_ts(row.get(9)?),
        risk_score: row.get(10)?,
    })
}

fn row_to_submission(row: &Row<'_>) -> rusqlite::Result<SubmissionRequest> {
    let content: String = row.get(3)?;
    let state: String = row.get(8)?;
    let blockers: String = row.get(11)?;
    Ok(SubmissionRequest {
        id: row.get(0)?,
        actor: ActorId(row.get(1)?),
        destination: row.get(2)?,
        content: json_column(&content, 3)?,
        title: row.get(4)?,
        body: row.get(5)?,
        nsfw: row.get(6)?,
        scheduled_at: parse_ts(&row.get::<_, String>(7)?),
        state: SubmissionState::parse(&state).unwrap_or(SubmissionState::Failed),
        attempts: row.get(9)?,
        last_error: row.get(10)?,
        blockers: json_column(&blockers, 11)?,
    })
}

fn row_to_published(row: &Row<'_>) -> rusqlite::Result<PublishedItem> {
    Ok(PublishedItem {
        submission_id: row.get(0)?,
        actor: ActorId(row.get(1)?),
        destination: row.get(2)?,
        external: ExternalRef {
            id: row.get(3)?,
            url: row.get(4)?,
        },
        published_at: parse_ts(&row.get::<_, String>(5)?),
        last_checked_at: parse_opt_ts(row.get(6)?),
        liveness: Liveness::parse(&row.get::<_, String>(7)?),
        engagement: Engagement {
            score: row.get(8)?,
            comments: row.get(9)?,
        },
        style: row.get(10)?,
    })
}

fn row_to_risk(row: &Row<'_>) -> rusqlite::Result<RiskProfile> {
    Ok(RiskProfile {
        actor: ActorId(row.get(0)?),
        destination: row.get(1)?,
        total_posts: row.get(2)?,
        removed_count: row.get(3)?,
        cooldown_hours: row.get(4)?,
        banned: row.get(5)?,
    })
}
