//! Shared fakes for the integration tests: a scripted submission page,
//! recording notifier, canned policy sources and liveness probes.

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

use postline::browser::{BrowserDriver, BrowserProvider, ElementHandle, Locator, PageSnapshot};
use postline::compliance::ComplianceGate;
use postline::config::ExecutorConfig;
use postline::executor::{Executor, NoOracle, SurfaceProfile, UiAnswer, UiOracle};
use postline::messaging::{Notice, Notifier};
use postline::monitor::{LivenessProbe, ProbeOutcome};
use postline::rules::{CommunityMetadata, PolicyParser, PolicySource, RuleCache};
use postline::store::Store;
use postline::types::{
    ActorId, AdaptedContent, ContentItem, Destination, DestinationStatus, ExternalRef, Policy, SubmissionRequest,
};

pub const PRIMARY: &str = "https://www.example.test";
pub const LEGACY: &str = "https://old.example.test";

/// How the fake platform behaves
#[derive(Debug, Clone, Default)]
pub struct Site {
    /// Page text shown instead of the form, per destination
    pub conditions: HashMap<String, String>,
    /// Origins whose form never renders a title field
    pub broken_origins: Vec<String>,
    pub flair: Option<FlairPicker>,
    /// The first flair confirmation drops the attached media
    pub flair_clears_media: bool,
    /// Submits accepted without ever redirecting
    pub swallowed_submits: u32,
    /// Every navigation lands on the login page
    pub logged_out: bool,
    pub challenge: Option<Challenge>,
    /// Label of the button on a dialog shown after submit
    pub submit_confirmation: Option<String>,
}

/// Verification wall shown in place of the form
#[derive(Debug, Clone, Default)]
pub struct Challenge {
    /// Cleared by the human this long after it first appeared; never when None
    pub clears_after: Option<std::time::Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct FlairPicker {
    pub options: Vec<String>,
    /// Buttons inside the modal, in document order
    pub buttons: Vec<String>,
}

impl FlairPicker {
    pub fn new(options: &[&str], buttons: &[&str]) -> Self {
        Self {
            options: options.iter().map(|s| s.to_string()).collect(),
            buttons: buttons.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Everything the page saw, for assertions
#[derive(Debug, Clone, Default)]
pub struct Record {
    pub navigations: Vec<String>,
    pub clicks: Vec<String>,
    pub fills: Vec<String>,
    pub uploads: usize,
    pub submits: usize,
    pub published: Vec<String>,
    pub applied_flair: Option<String>,
    pub dismissed: usize,
    pub joined: bool,
    pub confirmations: usize,
}

#[derive(Debug, Default)]
struct Page {
    origin: String,
    destination: String,
    url: String,
    tab_selected: bool,
    media_attached: bool,
    media_cleared: bool,
    dialog_open: bool,
    selected_flair: Option<String>,
    nsfw: bool,
    confirm_open: bool,
}

#[derive(Debug)]
struct El {
    id: String,
    role: &'static str,
    label: String,
    attrs: Vec<(&'static str, &'static str)>,
    css: Vec<&'static str>,
    parent: Option<&'static str>,
}

impl El {
    fn new(id: impl Into<String>, role: &'static str, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            label: label.into(),
            attrs: Vec::new(),
            css: Vec::new(),
            parent: None,
        }
    }

    fn attr(mut self, name: &'static str, value: &'static str) -> Self {
        self.attrs.push((name, value));
        self
    }

    fn css(mut self, selector: &'static str) -> Self {
        self.css.push(selector);
        self
    }

    fn inside(mut self, parent: &'static str) -> Self {
        self.parent = Some(parent);
        self
    }

    fn handle(&self) -> ElementHandle {
        ElementHandle {
            id: self.id.clone(),
            label: self.label.clone(),
        }
    }

    fn matches(&self, locator: &Locator) -> bool {
        match locator {
            Locator::Role { role, name } => {
                self.role == role
                    && name
                        .as_deref()
                        .map(|n| self.label.to_lowercase().contains(&n.to_lowercase()))
                        .unwrap_or(true)
            }
            Locator::Text { text, exact } => {
                let (label, text) = (self.label.to_lowercase(), text.to_lowercase());
                if *exact {
                    label.trim() == text.trim()
                } else {
                    label.contains(text.trim())
                }
            }
            Locator::Attribute { name, value } => self
                .attrs
                .iter()
                .any(|(k, v)| k == name && value.as_deref().map(|want| want == *v).unwrap_or(true)),
            Locator::Css { selector } => self.css.contains(&selector.as_str()),
            Locator::Within { .. } => false,
        }
    }
}

fn find_all<'a>(locator: &Locator, elements: &'a [El]) -> Vec<&'a El> {
    match locator {
        Locator::Within { scope, inner } => {
            let Some(container) = find_all(scope, elements).into_iter().next() else {
                return Vec::new();
            };
            elements
                .iter()
                .filter(|e| e.parent == Some(container.id.as_str()))
                .filter(|e| find_all(inner, std::slice::from_ref(*e)).len() == 1)
                .collect()
        }
        other => elements.iter().filter(|e| e.matches(other)).collect(),
    }
}

/// One page that behaves like the platform's submission form
pub struct FakeBrowser {
    site: Site,
    state: Mutex<(Page, Record, u32)>,
    challenge_since: Mutex<Option<Instant>>,
}

impl FakeBrowser {
    pub fn new(site: Site) -> Arc<Self> {
        Arc::new(Self {
            site,
            state: Mutex::new((Page::default(), Record::default(), 0)),
            challenge_since: Mutex::new(None),
        })
    }

    pub fn record(&self) -> Record {
        self.state.lock().unwrap().1.clone()
    }

    /// Stop swallowing submits from now on
    pub fn heal(&self) {
        let mut state = self.state.lock().unwrap();
        state.2 = self.site.swallowed_submits;
    }

    fn challenged(&self) -> bool {
        let Some(challenge) = &self.site.challenge else {
            return false;
        };
        let since = *self.challenge_since.lock().unwrap().get_or_insert_with(Instant::now);
        challenge.clears_after.map(|after| since.elapsed() < after).unwrap_or(true)
    }

    fn elements(&self, page: &Page) -> Vec<El> {
        let mut els = Vec::new();
        if page.url.is_empty() || page.url.contains("/comments/") || page.url.contains("/login") || self.challenged() {
            return els;
        }
        if page.confirm_open {
            if let Some(label) = &self.site.submit_confirmation {
                els.push(El::new("confirm-dialog", "dialog", "Are you sure?"));
                els.push(El::new("confirm", "button", label.clone()).inside("confirm-dialog"));
            }
            return els;
        }
        if let Some(text) = self.site.conditions.get(&page.destination) {
            if text.to_lowercase().contains("private") {
                els.push(El::new("join", "button", "Request to join"));
            }
            return els;
        }

        if page.tab_selected {
            els.push(
                El::new("file", "generic", "Upload files")
                    .css(r#"input[type="file"][accept*="image"]"#)
                    .css(r#"input[type="file"]"#),
            );
        } else {
            els.push(
                El::new("tab", "tab", "Images & Video")
                    .attr("data-select-value", "IMAGE")
                    .css("a.image-link-tab"),
            );
        }
        if page.media_attached {
            els.push(
                El::new("preview", "img", "Uploaded image")
                    .attr("data-testid", "media-preview")
                    .css(r#"img[src^="blob:"]"#),
            );
        }
        if !self.site.broken_origins.contains(&page.origin) {
            els.push(
                El::new("title", "textbox", "Title")
                    .attr("placeholder", "Title")
                    .css(r#"textarea[name="title"]"#),
            );
        }
        els.push(El::new("nsfw", "switch", "NSFW").css(r#"input[name="over_18"]"#));

        if let Some(flair) = &self.site.flair {
            if page.dialog_open {
                els.push(El::new("dialog", "dialog", "Add flair and tags").css(".flairselector"));
                for (i, option) in flair.options.iter().enumerate() {
                    els.push(El::new(format!("opt:{}", i), "radio", option.clone()).css("li").inside("dialog"));
                }
                for (i, button) in flair.buttons.iter().enumerate() {
                    let mut el = El::new(format!("btn:{}", i), "button", button.clone()).inside("dialog");
                    if button == "Apply" {
                        el = el.css(r#"button[type="submit"]"#);
                    }
                    els.push(el);
                }
            } else {
                els.push(El::new("flair-open", "button", "Add flair").css("a.flairselect-btn"));
            }
        }

        if !page.dialog_open {
            els.push(El::new("submit", "button", "Post").css(r#"button[name="submit"]"#));
        }
        els
    }
}

fn split_submit_url(url: &str) -> (String, String) {
    let Some((origin, rest)) = url.split_once("/r/") else {
        return (url.to_string(), String::new());
    };
    let destination = rest.split('/').next().unwrap_or_default();
    (origin.to_string(), destination.to_string())
}

fn publish(page: &mut Page, record: &mut Record) {
    let id = format!("p{}", record.published.len() + 1);
    page.url = format!("{}/r/{}/comments/{}/post/", page.origin, page.destination, id);
    record.published.push(id);
}

fn is_dismiss(label: &str) -> bool {
    matches!(label.to_lowercase().as_str(), "close" | "cancel" | "×")
}

#[async_trait]
impl BrowserDriver for FakeBrowser {
    async fn navigate(&self, url: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let (origin, destination) = split_submit_url(url);
        let landed = if self.site.logged_out {
            format!("{}/login/?dest={}", origin, destination)
        } else {
            url.to_string()
        };
        state.0 = Page {
            origin,
            destination,
            url: landed,
            ..Default::default()
        };
        state.1.navigations.push(url.to_string());
        Ok(())
    }

    async fn locate(&self, locator: &Locator) -> Result<Option<ElementHandle>> {
        Ok(self.locate_all(locator).await?.into_iter().next())
    }

    async fn locate_all(&self, locator: &Locator) -> Result<Vec<ElementHandle>> {
        let state = self.state.lock().unwrap();
        let elements = self.elements(&state.0);
        Ok(find_all(locator, &elements).into_iter().map(El::handle).collect())
    }

    async fn click(&self, element: &ElementHandle) -> Result<()> {
        let mut guard = self.state.lock().unwrap();
        let (page, record, swallowed) = &mut *guard;
        record.clicks.push(element.label.clone());

        match element.id.as_str() {
            "tab" => page.tab_selected = true,
            "nsfw" => page.nsfw = !page.nsfw,
            "join" => record.joined = true,
            "flair-open" => {
                page.dialog_open = true;
                page.selected_flair = None;
            }
            "submit" => {
                record.submits += 1;
                if *swallowed < self.site.swallowed_submits {
                    *swallowed += 1;
                } else if self.site.submit_confirmation.is_some() {
                    page.confirm_open = true;
                } else {
                    publish(page, record);
                }
            }
            "confirm" => {
                record.confirmations += 1;
                page.confirm_open = false;
                publish(page, record);
            }
            id if id.starts_with("opt:") => page.selected_flair = Some(element.label.clone()),
            id if id.starts_with("btn:") => {
                if is_dismiss(&element.label) {
                    record.dismissed += 1;
                    page.dialog_open = false;
                    page.selected_flair = None;
                } else if let Some(flair) = page.selected_flair.clone() {
                    record.applied_flair = Some(flair);
                    page.dialog_open = false;
                    if self.site.flair_clears_media && !page.media_cleared {
                        page.media_attached = false;
                        page.media_cleared = true;
                    }
                }
            }
            other => anyhow::bail!("element {} is not clickable", other),
        }
        Ok(())
    }

    async fn fill(&self, element: &ElementHandle, text: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.1.fills.push(format!("{}={}", element.id, text));
        Ok(())
    }

    async fn upload_file(&self, element: &ElementHandle, _path: &Path) -> Result<()> {
        anyhow::ensure!(element.id == "file", "not a file input");
        let mut state = self.state.lock().unwrap();
        state.0.media_attached = true;
        state.1.uploads += 1;
        Ok(())
    }

    async fn is_checked(&self, element: &ElementHandle) -> Result<bool> {
        let state = self.state.lock().unwrap();
        Ok(element.id == "nsfw" && state.0.nsfw)
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        Ok(b"\x89PNG".to_vec())
    }

    async fn current_url(&self) -> Result<String> {
        Ok(self.state.lock().unwrap().0.url.clone())
    }

    async fn page_text(&self) -> Result<String> {
        let state = self.state.lock().unwrap();
        let page = &state.0;
        if page.url.contains("/login") {
            return Ok("Log in to continue".to_string());
        }
        if self.challenged() {
            return Ok("Please verify you are human to continue".to_string());
        }
        if let Some(text) = self.site.conditions.get(&page.destination) {
            return Ok(text.clone());
        }
        Ok(if page.url.contains("/comments/") {
            "Your post is live".to_string()
        } else {
            "Create post".to_string()
        })
    }

    async fn snapshot(&self) -> Result<PageSnapshot> {
        let state = self.state.lock().unwrap();
        let elements = self.elements(&state.0);
        let mut snapshot = PageSnapshot {
            url: state.0.url.clone(),
            title: "Create post".to_string(),
            ..Default::default()
        };
        let mut lines = Vec::new();
        for (i, el) in elements.iter().enumerate() {
            let reference = format!("@e{}", i + 1);
            lines.push(format!("[{}] {} \"{}\"", reference, el.role, el.label));
            snapshot.refs.insert(reference, el.handle());
        }
        snapshot.tree_text = lines.join("\n");
        Ok(snapshot)
    }
}

/// Hands the same fake page to every actor
pub struct FakeProvider {
    pub browser: Arc<FakeBrowser>,
    pub resets: AtomicUsize,
}

impl FakeProvider {
    pub fn new(browser: Arc<FakeBrowser>) -> Arc<Self> {
        Arc::new(Self {
            browser,
            resets: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl BrowserProvider for FakeProvider {
    async fn driver(&self, _actor: &ActorId) -> Result<Arc<dyn BrowserDriver>> {
        Ok(self.browser.clone() as Arc<dyn BrowserDriver>)
    }

    async fn reset(&self, _actor: &ActorId) -> Result<()> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Oracle with one fixed answer
pub struct ScriptedOracle {
    answer: UiAnswer,
    pub calls: AtomicUsize,
}

impl ScriptedOracle {
    pub fn new(answer: UiAnswer) -> Arc<Self> {
        Arc::new(Self {
            answer,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl UiOracle for ScriptedOracle {
    async fn ask_ui(&self, _question: &str, _snapshot: &PageSnapshot) -> Result<UiAnswer> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.answer.clone())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<(ActorId, Notice)>>,
}

impl RecordingNotifier {
    pub fn texts(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|(_, n)| n.text.clone()).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, actor: &ActorId, notice: &Notice) -> Result<()> {
        self.sent.lock().unwrap().push((actor.clone(), notice.clone()));
        Ok(())
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

/// Metadata source that is always unreachable
pub struct OfflineSource;

#[async_trait]
impl PolicySource for OfflineSource {
    async fn fetch_metadata(&self, destination: &str) -> Result<CommunityMetadata> {
        anyhow::bail!("r/{} unreachable", destination)
    }
}

/// Metadata source that always answers
pub struct StaticSource;

#[async_trait]
impl PolicySource for StaticSource {
    async fn fetch_metadata(&self, destination: &str) -> Result<CommunityMetadata> {
        Ok(CommunityMetadata {
            name: destination.to_string(),
            description: "Photos".to_string(),
            rules: vec!["Verified members only".to_string()],
            ..Default::default()
        })
    }
}

/// Parser that returns one fixed policy
pub struct FixedParser(pub Policy);

#[async_trait]
impl PolicyParser for FixedParser {
    async fn parse_policy(&self, _metadata: &CommunityMetadata) -> Result<Policy> {
        Ok(self.0.clone())
    }
}

/// Probe answering from a table of external ids; unknown ids are live
#[derive(Default)]
pub struct TableProbe {
    pub removed: Mutex<Vec<String>>,
}

#[async_trait]
impl LivenessProbe for TableProbe {
    async fn probe(&self, external: &ExternalRef) -> Result<ProbeOutcome> {
        if self.removed.lock().unwrap().contains(&external.id) {
            Ok(ProbeOutcome::Removed("HTTP 404".to_string()))
        } else {
            Ok(ProbeOutcome::Live(postline::types::Engagement { score: 12, comments: 3 }))
        }
    }
}

pub fn ana() -> ActorId {
    ActorId::new("ana")
}

/// Short waits; tests run on a paused clock anyway
pub fn executor_config() -> ExecutorConfig {
    ExecutorConfig {
        max_attempts: 1,
        step_timeout_secs: 2,
        redirect_timeout_secs: 3,
        challenge_wait_secs: 5,
        poll_interval_ms: 100,
        ..Default::default()
    }
}

pub fn executor(
    store: &Store,
    browser: Arc<FakeBrowser>,
    oracle: Arc<dyn UiOracle>,
    notifier: Arc<dyn Notifier>,
) -> Executor {
    executor_with(store, FakeProvider::new(browser), oracle, notifier)
}

/// Same as [`executor`] but keeps the provider for assertions
pub fn executor_with(
    store: &Store,
    provider: Arc<FakeProvider>,
    oracle: Arc<dyn UiOracle>,
    notifier: Arc<dyn Notifier>,
) -> Executor {
    Executor::new(
        store.clone(),
        provider,
        oracle,
        notifier,
        SurfaceProfile::defaults(PRIMARY, LEGACY),
        &executor_config(),
    )
}

pub fn plain_executor(store: &Store, browser: Arc<FakeBrowser>) -> Executor {
    executor(store, browser, Arc::new(NoOracle), Arc::new(RecordingNotifier::default()))
}

pub fn offline_gate(store: &Store) -> Arc<ComplianceGate> {
    let rules = Arc::new(RuleCache::new(
        store.clone(),
        Arc::new(OfflineSource),
        Arc::new(FixedParser(Policy::permissive(Utc::now()))),
    ));
    Arc::new(ComplianceGate::new(store.clone(), rules))
}

pub async fn approved(store: &Store, name: &str) -> Destination {
    let mut destination = Destination::suggested(ana(), name);
    destination.status = DestinationStatus::Approved;
    destination.member_count = 50_000;
    store.upsert_destination(&destination).await.unwrap();
    destination
}

pub fn content(id: &str) -> ContentItem {
    ContentItem {
        id: id.to_string(),
        media_path: format!("/media/{}.jpg", id),
        caption: format!("Evening light over the harbour ({})", id),
        nsfw: false,
        style: Some("candid".to_string()),
    }
}

pub fn request(content: ContentItem, destination: &str, at: DateTime<Utc>) -> SubmissionRequest {
    let title = content.caption.clone();
    SubmissionRequest::new(ana(), content, destination, AdaptedContent { title, body: None }, at)
}

/// Queue a request due a minute ago and claim it
pub async fn claimed(store: &Store, content: ContentItem, destination: &str) -> SubmissionRequest {
    let req = request(content, destination, Utc::now() - Duration::minutes(1));
    store.upsert_submission(&req).await.unwrap();
    store
        .claim_due(Utc::now(), 10)
        .await
        .unwrap()
        .into_iter()
        .find(|r| r.id == req.id)
        .unwrap()
}

pub fn flair_policy() -> Policy {
    Policy {
        requires_flair: true,
        ..Policy::permissive(Utc::now())
    }
}
