//! Unauthenticated public read API of the platform
//!
//! Serves the rule cache (community metadata and rules) and the outcome
//! monitor (is a post still up). Nothing here needs a logged-in session.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::PlatformConfig;
use crate::monitor::{LivenessProbe, ProbeOutcome};
use crate::rules::{CommunityMetadata, PolicySource};
use crate::types::{Engagement, ExternalRef};

/// Selftext the platform leaves behind on a taken-down post
const REMOVAL_MARKERS: &[&str] = &["[removed]", "[deleted]"];

pub struct PublicApi {
    client: Client,
    base: Url,
}

impl PublicApi {
    pub fn new(config: &PlatformConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;
        let base = Url::parse(&config.public_api_url)
            .with_context(|| format!("Invalid public API URL: {}", config.public_api_url))?;
        Ok(Self { client, base })
    }

    /// `{base}/{segments...}` with `.json` appended to the last segment
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| anyhow::anyhow!("Public API URL cannot be a base"))?;
            path.pop_if_empty();
            for (i, segment) in segments.iter().enumerate() {
                if i + 1 == segments.len() {
                    path.push(&format!("{}.json", segment));
                } else {
                    path.push(segment);
                }
            }
        }
        url.query_pairs_mut().append_pair("raw_json", "1");
        Ok(url)
    }

    async fn get_json(&self, url: Url) -> Result<(StatusCode, Option<Value>)> {
        debug!("GET {}", url);
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("Request to {} failed", url))?;
        let status = response.status();
        if !status.is_success() {
            return Ok((status, None));
        }
        let body = response
            .json::<Value>()
            .await
            .with_context(|| format!("Invalid JSON from {}", url))?;
        Ok((status, Some(body)))
    }
}

fn destination_name(destination: &str) -> &str {
    let name = destination.trim();
    name.strip_prefix("r/")
        .or_else(|| name.strip_prefix("/r/"))
        .unwrap_or(name)
}

/// Plain text of an HTML fragment, whitespace collapsed
pub fn html_to_text(html: &str) -> String {
    let fragment = scraper::Html::parse_fragment(html);
    let text: String = fragment.root_element().text().collect::<Vec<_>>().join(" ");
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn parse_about(name: &str, about: &Value) -> CommunityMetadata {
    let data = &about["data"];
    let description = data["public_description"]
        .as_str()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| data["description"].as_str())
        .unwrap_or_default()
        .trim()
        .to_string();
    CommunityMetadata {
        name: data["display_name"].as_str().unwrap_or(name).to_string(),
        description,
        rules: Vec::new(),
        over18: data["over18"].as_bool(),
        flair_required: None,
        subscribers: data["subscribers"].as_u64(),
    }
}

/// "Title: description" per rule; description taken from HTML when present
pub fn parse_rules(rules: &Value) -> Vec<String> {
    let Some(list) = rules["rules"].as_array() else {
        return Vec::new();
    };
    list.iter()
        .filter_map(|rule| {
            let title = rule["short_name"].as_str().unwrap_or_default().trim();
            let description = match rule["description_html"].as_str() {
                Some(html) if !html.trim().is_empty() => html_to_text(html),
                _ => rule["description"].as_str().unwrap_or_default().trim().to_string(),
            };
            match (title.is_empty(), description.is_empty()) {
                (true, true) => None,
                (false, true) => Some(title.to_string()),
                (true, false) => Some(description),
                (false, false) => Some(format!("{}: {}", title, description)),
            }
        })
        .collect()
}

/// Classify the listing returned for one post
///
/// Only an explicitly empty listing counts as removal. Anything the
/// listing shape does not account for is an error, so the item stays
/// tracked and is checked again next cycle.
pub fn classify_post(listing: &Value) -> Result<ProbeOutcome> {
    if let Some(code) = listing.get("error") {
        bail!(
            "Listing API error {}: {}",
            code,
            listing["message"].as_str().unwrap_or("no message")
        );
    }
    let post = listing
        .as_array()
        .and_then(|parts| parts.first())
        .unwrap_or(listing);
    let Some(children) = post["data"]["children"].as_array() else {
        bail!("Unrecognised listing shape");
    };
    let Some(child) = children.first() else {
        return Ok(ProbeOutcome::Removed("post no longer listed".into()));
    };
    let data = &child["data"];
    if !data.is_object() {
        bail!("Listing entry has no post data");
    }

    if let Some(category) = data["removed_by_category"].as_str() {
        return Ok(ProbeOutcome::Removed(format!("removed by {}", category)));
    }
    if data["banned_by"].as_str().is_some() || data["banned_by"].as_bool() == Some(true) {
        return Ok(ProbeOutcome::Removed("removed by moderators".into()));
    }
    let selftext = data["selftext"].as_str().unwrap_or_default().trim();
    if REMOVAL_MARKERS.contains(&selftext) {
        return Ok(ProbeOutcome::Removed(format!("body is {}", selftext)));
    }

    Ok(ProbeOutcome::Live(Engagement {
        score: data["score"].as_i64().unwrap_or(0),
        comments: data["num_comments"].as_i64().unwrap_or(0),
    }))
}

fn is_gone(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::NOT_FOUND | StatusCode::FORBIDDEN | StatusCode::GONE
    )
}

#[async_trait]
impl PolicySource for PublicApi {
    async fn fetch_metadata(&self, destination: &str) -> Result<CommunityMetadata> {
        let name = destination_name(destination);
        let (status, about) = self.get_json(self.endpoint(&["r", name, "about"])?).await?;
        let Some(about) = about else {
            bail!("Metadata of r/{} unavailable (HTTP {})", name, status);
        };
        let mut metadata = parse_about(name, &about);

        // Rules are optional; a community without a rules page still has metadata
        match self.get_json(self.endpoint(&["r", name, "about", "rules"])?).await {
            Ok((_, Some(rules))) => metadata.rules = parse_rules(&rules),
            Ok((status, None)) => debug!("No rules page for r/{} (HTTP {})", name, status),
            Err(e) => debug!("Rules of r/{} unavailable: {}", name, e),
        }

        if let Ok((_, Some(requirements))) = self
            .get_json(self.endpoint(&["api", "v1", name, "post_requirements"])?)
            .await
        {
            metadata.flair_required = requirements["is_flair_required"].as_bool();
        }

        Ok(metadata)
    }
}

#[async_trait]
impl LivenessProbe for PublicApi {
    async fn probe(&self, external: &ExternalRef) -> Result<ProbeOutcome> {
        let id = external.id.trim_start_matches("t3_");
        let (status, body) = self.get_json(self.endpoint(&["comments", id])?).await?;
        match body {
            Some(listing) => classify_post(&listing).with_context(|| format!("Probe of {}", external.id)),
            None if is_gone(status) => Ok(ProbeOutcome::Removed(format!("HTTP {}", status.as_u16()))),
            None => bail!("Probe of {} got HTTP {}", external.id, status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn api() -> PublicApi {
        PublicApi::new(&PlatformConfig::default()).unwrap()
    }

    #[test]
    fn test_endpoint_building() {
        let url = api().endpoint(&["r", "EarthPorn", "about", "rules"]).unwrap();
        assert_eq!(url.as_str(), "https://www.reddit.com/r/EarthPorn/about/rules.json?raw_json=1");
        assert_eq!(destination_name(" r/pics "), "pics");
    }

    #[test]
    fn test_parse_about_and_rules() {
        let about = json!({"data": {
            "display_name": "pics",
            "public_description": "",
            "description": "Pictures and images",
            "over18": false,
            "subscribers": 30000000
        }});
        let metadata = parse_about("pics", &about);
        assert_eq!(metadata.description, "Pictures and images");
        assert_eq!(metadata.over18, Some(false));
        assert_eq!(metadata.subscribers, Some(30_000_000));

        let rules = json!({"rules": [
            {"short_name": "No screenshots", "description_html": "<div><p>No <strong>screenshots</strong>\n of text.</p></div>"},
            {"short_name": "Be civil", "description": ""},
            {"short_name": "", "description": ""}
        ]});
        assert_eq!(
            parse_rules(&rules),
            vec!["No screenshots: No screenshots of text.".to_string(), "Be civil".to_string()]
        );
    }

    #[test]
    fn test_classify_live_post() {
        let listing = json!([
            {"data": {"children": [{"data": {"score": 120, "num_comments": 14, "selftext": "", "removed_by_category": null}}]}},
            {"data": {"children": []}}
        ]);
        assert_eq!(
            classify_post(&listing).unwrap(),
            ProbeOutcome::Live(Engagement { score: 120, comments: 14 })
        );
    }

    #[test]
    fn test_classify_removal_markers() {
        let by_mods = json!([{"data": {"children": [{"data": {"removed_by_category": "moderator"}}]}}]);
        assert!(matches!(classify_post(&by_mods).unwrap(), ProbeOutcome::Removed(_)));

        let deleted = json!([{"data": {"children": [{"data": {"selftext": "[deleted]"}}]}}]);
        assert!(matches!(classify_post(&deleted).unwrap(), ProbeOutcome::Removed(_)));

        let empty = json!([{"data": {"children": []}}]);
        assert!(matches!(classify_post(&empty).unwrap(), ProbeOutcome::Removed(_)));
    }

    #[test]
    fn test_unrecognised_listings_are_errors() {
        let throttled = json!({"message": "Too Many Requests", "error": 429});
        assert!(classify_post(&throttled).is_err());

        assert!(classify_post(&json!({})).is_err());
        assert!(classify_post(&json!([])).is_err());
        assert!(classify_post(&json!("<html>maintenance</html>")).is_err());
        assert!(classify_post(&json!([{"kind": "Listing", "data": {"after": null}}])).is_err());
        assert!(classify_post(&json!([{"data": {"children": [{"kind": "t3"}]}}])).is_err());
    }

    #[test]
    fn test_gone_statuses() {
        assert!(is_gone(StatusCode::NOT_FOUND));
        assert!(is_gone(StatusCode::GONE));
        assert!(!is_gone(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_gone(StatusCode::BAD_GATEWAY));
    }
}
