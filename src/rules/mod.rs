//! Rule cache: per-destination posting policies
//!
//! Policies are fetched from the platform's public metadata, turned into
//! structured fields by a [`PolicyParser`] and cached for
//! [`Policy::TTL_DAYS`]. When the metadata cannot be fetched, the last
//! cached policy is returned even if stale. When it cannot be parsed, a
//! permissive policy is returned (fail-open) without caching it, so the
//! next lookup tries again.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::store::Store;
use crate::types::Policy;

/// Raw community metadata as published by the platform
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommunityMetadata {
    pub name: String,
    pub description: String,
    /// Rule titles and descriptions, one entry per rule
    pub rules: Vec<String>,
    /// Structured adult-content flag, when the platform exposes it
    pub over18: Option<bool>,
    pub flair_required: Option<bool>,
    pub subscribers: Option<u64>,
}

/// Where raw metadata comes from
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PolicySource: Send + Sync {
    async fn fetch_metadata(&self, destination: &str) -> Result<CommunityMetadata>;
}

/// Turns free-text rules into a structured policy
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PolicyParser: Send + Sync {
    async fn parse_policy(&self, metadata: &CommunityMetadata) -> Result<Policy>;
}

pub struct RuleCache {
    store: Store,
    source: Arc<dyn PolicySource>,
    parser: Arc<dyn PolicyParser>,
}

impl RuleCache {
    pub fn new(store: Store, source: Arc<dyn PolicySource>, parser: Arc<dyn PolicyParser>) -> Self {
        Self { store, source, parser }
    }

    /// Cached policy if fresh, otherwise refetched. `None` only when
    /// nothing was ever cached and the fetch failed.
    pub async fn get_policy(&self, destination: &str) -> Result<Option<Policy>> {
        let now = Utc::now();
        let cached = self.store.get_cached_policy(destination).await?;
        if let Some(policy) = &cached {
            if policy.is_fresh(now) {
                debug!("Policy cache hit for r/{}", destination);
                return Ok(cached);
            }
        }

        let metadata = match self.source.fetch_metadata(destination).await {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(
                    "Policy fetch for r/{} failed ({}); using {}",
                    destination,
                    e,
                    if cached.is_some() { "stale cache" } else { "no policy" }
                );
                return Ok(cached);
            }
        };

        match self.parser.parse_policy(&metadata).await {
            Ok(policy) => {
                let mut policy = merge_metadata(policy, &metadata);
                policy.fetched_at = now;
                self.store.put_cached_policy(destination, &policy).await?;
                info!("Cached policy for r/{} ({} rules)", destination, policy.rules_text.len());
                Ok(Some(policy))
            }
            Err(e) => {
                warn!("Could not parse rules of r/{} ({}); failing open", destination, e);
                Ok(Some(Policy::permissive(now)))
            }
        }
    }

    /// Drop a cached entry so the next lookup refetches
    pub async fn invalidate(&self, destination: &str) -> Result<()> {
        self.store.delete_cached_policy(destination).await
    }
}

/// Structured flags from the platform win over what the parser inferred
fn merge_metadata(mut policy: Policy, metadata: &CommunityMetadata) -> Policy {
    if let Some(over18) = metadata.over18 {
        policy.nsfw_allowed = over18;
    }
    if metadata.flair_required == Some(true) {
        policy.requires_flair = true;
    }
    if policy.rules_text.is_empty() {
        policy.rules_text = metadata.rules.clone();
    }
    policy
        .banned_terms
        .retain(|term| !term.trim().is_empty());
    for term in policy.banned_terms.iter_mut() {
        *term = term.trim().to_lowercase();
    }
    policy
}
