//! Submission surfaces: the platform's alternative submission UIs
//!
//! Each surface is a table of locator strategies per flow step. The
//! executor walks the same state machine over any surface; only the
//! tables differ.

use regex::Regex;

use crate::browser::Locator;

/// Condition of the page that stops the normal flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageCondition {
    LoggedOut,
    Challenge,
    Banned,
    Restricted,
    RateLimited,
}

const LOGIN_PATHS: &[&str] = &["/login", "/register", "/account/login"];

const CHALLENGE_MARKERS: &[&str] = &[
    "verify you are human",
    "are you a robot",
    "confirm you're not a robot",
    "complete the captcha",
    "security check",
];

const BANNED_MARKERS: &[&str] = &[
    "you've been banned",
    "you have been banned",
    "you are banned",
    "banned from participating",
    "you aren't allowed to post",
    "you are not allowed to post",
    "not allowed to post in this community",
];

const RESTRICTED_MARKERS: &[&str] = &[
    "this community is private",
    "private community",
    "restricted community",
    "only approved users",
    "approved submitters",
];

const RATE_LIMIT_MARKERS: &[&str] = &[
    "you're doing that too much",
    "you are doing that too much",
    "rate limit",
];

/// Classify a page by its URL and visible text.
/// Checked in order: logged out, challenge, banned, restricted, rate limited.
pub fn detect_condition(url: &str, text: &str) -> Option<PageCondition> {
    let path = url::Url::parse(url)
        .map(|u| u.path().to_lowercase())
        .unwrap_or_default();
    if LOGIN_PATHS.iter().any(|p| path.starts_with(p)) {
        return Some(PageCondition::LoggedOut);
    }

    let text = text.to_lowercase();
    let has = |markers: &[&str]| markers.iter().any(|m| text.contains(m));

    if has(CHALLENGE_MARKERS) {
        Some(PageCondition::Challenge)
    } else if has(BANNED_MARKERS) {
        Some(PageCondition::Banned)
    } else if has(RESTRICTED_MARKERS) {
        Some(PageCondition::Restricted)
    } else if has(RATE_LIMIT_MARKERS) {
        Some(PageCondition::RateLimited)
    } else {
        None
    }
}

/// Locator tables for one submission UI
#[derive(Debug, Clone)]
pub struct SurfaceProfile {
    pub name: &'static str,
    base_url: String,
    pub media_tab: Vec<Locator>,
    pub file_input: Vec<Locator>,
    /// Empty when the surface shows no observable preview
    pub upload_preview: Vec<Locator>,
    pub title_input: Vec<Locator>,
    pub body_input: Vec<Locator>,
    pub nsfw_toggle: Vec<Locator>,
    pub flair_button: Vec<Locator>,
    pub flair_dialog: Vec<Locator>,
    pub flair_options: Vec<Locator>,
    /// Confirmation buttons scoped inside the flair dialog
    pub flair_confirm: Vec<Locator>,
    pub submit_button: Vec<Locator>,
    pub post_submit_confirm: Vec<Locator>,
    pub join_button: Vec<Locator>,
    /// Error banners shown after a rejected submit
    pub error_banner: Vec<Locator>,
    pub published_url: Regex,
}

fn published_url_pattern() -> Regex {
    Regex::new(r"/comments/([a-z0-9]+)").expect("static regex")
}

fn in_dialog(inner: Locator) -> Locator {
    Locator::within(Locator::any_role("dialog"), inner)
}

impl SurfaceProfile {
    /// The modern UI
    pub fn primary(base_url: &str) -> Self {
        Self {
            name: "primary",
            base_url: base_url.trim_end_matches('/').to_string(),
            media_tab: vec![
                Locator::role("tab", "Images"),
                Locator::attr("data-select-value", "IMAGE"),
                Locator::exact_text("Images & Video"),
            ],
            file_input: vec![
                Locator::css("input[type=\"file\"][accept*=\"image\"]"),
                Locator::css("input[type=\"file\"]"),
            ],
            upload_preview: vec![
                Locator::css("img[src^=\"blob:\"]"),
                Locator::attr("data-testid", "media-preview"),
                Locator::css("[data-testid*=\"preview\"] img"),
            ],
            title_input: vec![
                Locator::role("textbox", "title"),
                Locator::css("textarea[name=\"title\"]"),
                Locator::attr("placeholder", "Title"),
            ],
            body_input: vec![
                Locator::role("textbox", "body"),
                Locator::css("div[contenteditable=\"true\"][name=\"body\"]"),
            ],
            nsfw_toggle: vec![
                Locator::role("switch", "NSFW"),
                Locator::role("button", "NSFW"),
                Locator::role("checkbox", "NSFW"),
            ],
            flair_button: vec![
                Locator::role("button", "Add flair"),
                Locator::role("button", "Flair"),
                Locator::exact_text("Add flair"),
            ],
            flair_dialog: vec![Locator::any_role("dialog")],
            flair_options: vec![
                in_dialog(Locator::any_role("radio")),
                in_dialog(Locator::any_role("option")),
                in_dialog(Locator::any_role("menuitemradio")),
            ],
            flair_confirm: vec![
                in_dialog(Locator::role("button", "Apply")),
                in_dialog(Locator::role("button", "Add")),
                in_dialog(Locator::role("button", "Save")),
                in_dialog(Locator::role("button", "Done")),
            ],
            submit_button: vec![
                Locator::role("button", "Post"),
                Locator::css("button[type=\"submit\"]"),
                Locator::exact_text("Post"),
            ],
            post_submit_confirm: vec![
                in_dialog(Locator::role("button", "Post anyway")),
                in_dialog(Locator::role("button", "Continue")),
                in_dialog(Locator::role("button", "Confirm")),
            ],
            join_button: vec![
                Locator::role("button", "Request to join"),
                Locator::role("button", "Join"),
            ],
            error_banner: vec![Locator::any_role("alert")],
            published_url: published_url_pattern(),
        }
    }

    /// The legacy UI: plain forms, no preview, no modal flair picker
    pub fn legacy(base_url: &str) -> Self {
        Self {
            name: "legacy",
            base_url: base_url.trim_end_matches('/').to_string(),
            media_tab: vec![
                Locator::exact_text("image & video"),
                Locator::css("a.image-link-tab"),
            ],
            file_input: vec![Locator::css("input[type=\"file\"]")],
            upload_preview: Vec::new(),
            title_input: vec![
                Locator::css("textarea[name=\"title\"]"),
                Locator::role("textbox", "title"),
            ],
            body_input: Vec::new(),
            nsfw_toggle: vec![
                Locator::css("input[name=\"over_18\"]"),
                Locator::role("checkbox", "nsfw"),
            ],
            flair_button: vec![
                Locator::css("a.flairselect-btn"),
                Locator::exact_text("choose"),
            ],
            flair_dialog: vec![Locator::css(".flairselector")],
            flair_options: vec![Locator::within(Locator::css(".flairselector"), Locator::css("li"))],
            flair_confirm: vec![
                Locator::within(Locator::css(".flairselector"), Locator::css("button[type=\"submit\"]")),
                Locator::within(Locator::css(".flairselector"), Locator::role("button", "save")),
            ],
            submit_button: vec![
                Locator::css("button[name=\"submit\"]"),
                Locator::role("button", "submit"),
            ],
            post_submit_confirm: Vec::new(),
            join_button: vec![Locator::role("button", "join")],
            error_banner: vec![Locator::css(".error:not([style*=\"display: none\"])")],
            published_url: published_url_pattern(),
        }
    }

    /// Primary first, then legacy
    pub fn defaults(primary_url: &str, legacy_url: &str) -> Vec<Self> {
        vec![Self::primary(primary_url), Self::legacy(legacy_url)]
    }

    pub fn submit_url(&self, destination: &str) -> String {
        format!("{}/r/{}/submit", self.base_url, destination)
    }

    /// External id from a published item URL
    pub fn extract_reference(&self, url: &str) -> Option<String> {
        self.published_url
            .captures(url)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_logged_out_by_path() {
        assert_eq!(
            detect_condition("https://www.example.test/login/?dest=x", "Welcome back"),
            Some(PageCondition::LoggedOut)
        );
        assert_eq!(detect_condition("https://www.example.test/r/pics/submit", "Create post"), None);
    }

    #[test]
    fn test_detect_markers_in_priority_order() {
        let url = "https://www.example.test/r/pics/submit";
        assert_eq!(
            detect_condition(url, "Security check: verify you are human"),
            Some(PageCondition::Challenge)
        );
        assert_eq!(
            detect_condition(url, "You've been banned from participating in r/pics"),
            Some(PageCondition::Banned)
        );
        assert_eq!(
            detect_condition(url, "This community is private. Only approved users may post."),
            Some(PageCondition::Restricted)
        );
        assert_eq!(
            detect_condition(url, "You're doing that too much. Try again in 9 minutes."),
            Some(PageCondition::RateLimited)
        );
    }

    #[test]
    fn test_reference_extraction() {
        let surface = SurfaceProfile::primary("https://www.example.test/");
        assert_eq!(
            surface.extract_reference("https://www.example.test/r/pics/comments/1abc9z/sunset/"),
            Some("1abc9z".to_string())
        );
        assert_eq!(surface.extract_reference("https://www.example.test/r/pics/submit"), None);
        assert_eq!(surface.submit_url("pics"), "https://www.example.test/r/pics/submit");
    }

    #[test]
    fn test_flair_confirmation_is_scoped_to_the_dialog() {
        for surface in SurfaceProfile::defaults("https://a.test", "https://b.test") {
            assert!(!surface.flair_confirm.is_empty());
            assert!(surface
                .flair_confirm
                .iter()
                .all(|loc| matches!(loc, Locator::Within { .. })));
        }
    }
}
