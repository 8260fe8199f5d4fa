//! Per-actor browser sessions on a shared Chrome process

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::cdp::{CdpConnection, ChromeProcess};
use super::{escape_js_string, BrowserConfig, BrowserDriver, BrowserProvider, ElementHandle, Locator, PageSnapshot};
use crate::types::ActorId;

/// Element lookup injected into the page. Walks open shadow roots, keeps
/// visible matches and stores them in `window.__plRefs` for later calls.
const LOCATE_JS: &str = r#"
(function(loc, all) {
  const deep = (root) => {
    const out = [];
    const walk = (node) => {
      for (const el of node.querySelectorAll('*')) {
        out.push(el);
        if (el.shadowRoot) walk(el.shadowRoot);
      }
    };
    walk(root);
    return out;
  };
  const visible = (el) => {
    if (el.tagName === 'INPUT' && (el.type || '').toLowerCase() === 'file') return true;
    const r = el.getBoundingClientRect();
    if (r.width === 0 && r.height === 0) return false;
    const s = getComputedStyle(el);
    return s.visibility !== 'hidden' && s.display !== 'none';
  };
  const implicitRole = (el) => {
    const tag = el.tagName.toLowerCase();
    const type = (el.getAttribute('type') || '').toLowerCase();
    if (tag === 'button') return 'button';
    if (tag === 'a' && el.hasAttribute('href')) return 'link';
    if (tag === 'textarea') return 'textbox';
    if (tag === 'select') return 'combobox';
    if (tag === 'dialog') return 'dialog';
    if (tag === 'option') return 'option';
    if (tag === 'input') {
      if (['submit', 'button', 'reset'].includes(type)) return 'button';
      if (type === 'checkbox') return 'checkbox';
      if (type === 'radio') return 'radio';
      if (['', 'text', 'search', 'url', 'email'].includes(type)) return 'textbox';
    }
    return '';
  };
  const roleOf = (el) => (el.getAttribute('role') || implicitRole(el)).toLowerCase();
  const labelOf = (el) => (el.getAttribute('aria-label') || el.innerText || el.value ||
      el.getAttribute('placeholder') || el.getAttribute('title') || '')
      .toString().trim().replace(/\s+/g, ' ').slice(0, 200);
  const find = (root, loc) => {
    switch (loc.kind) {
      case 'role': {
        const want = loc.name ? loc.name.toLowerCase() : null;
        return deep(root).filter(el => roleOf(el) === loc.role &&
          (!want || labelOf(el).toLowerCase().includes(want)));
      }
      case 'text': {
        const want = loc.text.toLowerCase();
        const hits = deep(root).filter(el => {
          const t = (el.innerText || '').trim().toLowerCase();
          return loc.exact ? t === want : t.includes(want);
        });
        return hits.filter(el => !hits.some(other => other !== el && el.contains(other)));
      }
      case 'attribute':
        return deep(root).filter(el => (loc.value === null || loc.value === undefined)
          ? el.hasAttribute(loc.name)
          : el.getAttribute(loc.name) === loc.value);
      case 'css': {
        const out = [];
        const walk = (node) => {
          out.push(...node.querySelectorAll(loc.selector));
          for (const el of node.querySelectorAll('*')) if (el.shadowRoot) walk(el.shadowRoot);
        };
        walk(root);
        return out;
      }
      case 'within': {
        const scopes = find(root, loc.scope).filter(visible);
        if (scopes.length === 0) return [];
        const roots = [scopes[0]];
        if (scopes[0].shadowRoot) roots.push(scopes[0].shadowRoot);
        return roots.flatMap(r => find(r, loc.inner));
      }
    }
    return [];
  };
  const matches = find(document, loc).filter(visible);
  window.__plRefs = window.__plRefs || {};
  window.__plSeq = window.__plSeq || 0;
  const picked = all ? matches : matches.slice(0, 1);
  return picked.map(el => {
    const id = 'r' + (++window.__plSeq);
    window.__plRefs[id] = el;
    return { id: id, label: labelOf(el) };
  });
})
"#;

/// Interactive ARIA roles that get ref IDs in snapshots
const INTERACTIVE_ROLES: &[&str] = &[
    "button", "link", "textbox", "checkbox", "radio", "combobox",
    "listbox", "menuitem", "menuitemcheckbox", "menuitemradio",
    "option", "searchbox", "switch", "tab",
];

/// One actor's isolated browser context and its single page
pub struct ActorSession {
    actor: ActorId,
    context_id: String,
    conn: Mutex<CdpConnection>,
    load_timeout: Duration,
}

impl ActorSession {
    async fn open(
        chrome: &mut ChromeProcess,
        actor: &ActorId,
        cookie_file: Option<&Path>,
        config: &BrowserConfig,
    ) -> Result<Self> {
        let (context_id, target_id) = chrome.new_context().await?;
        let mut conn = CdpConnection::connect(
            &chrome.page_ws_url(&target_id),
            Duration::from_secs(config.command_timeout_secs),
        )
        .await?;

        conn.send("Page.enable", serde_json::json!({})).await?;
        conn.send("Runtime.enable", serde_json::json!({})).await?;
        conn.send("DOM.enable", serde_json::json!({})).await?;
        conn.send("Network.enable", serde_json::json!({})).await?;

        if let Some(path) = cookie_file {
            let cookies = load_cookies(path)?;
            let count = cookies.len();
            conn.send("Network.setCookies", serde_json::json!({ "cookies": cookies }))
                .await
                .context("Failed to install actor cookies")?;
            info!("Loaded {} cookies for actor {}", count, actor);
        } else {
            warn!("No cookie file configured for actor {}; session will be logged out", actor);
        }

        Ok(Self {
            actor: actor.clone(),
            context_id,
            conn: Mutex::new(conn),
            load_timeout: Duration::from_secs(config.load_timeout_secs),
        })
    }

    pub fn actor(&self) -> &ActorId {
        &self.actor
    }

    async fn object_id(conn: &mut CdpConnection, element: &ElementHandle) -> Result<String> {
        if let Some(backend) = element.id.strip_prefix("ax:") {
            let backend_node_id: i64 = backend.parse().context("Malformed snapshot ref")?;
            let resolved = conn
                .send(
                    "DOM.resolveNode",
                    serde_json::json!({ "backendNodeId": backend_node_id }),
                )
                .await?;
            return resolved["object"]["objectId"]
                .as_str()
                .map(|s| s.to_string())
                .context("Could not resolve snapshot node");
        }

        conn.evaluate_object(&format!(
            "(window.__plRefs && window.__plRefs['{}']) || null",
            escape_js_string(&element.id)
        ))
        .await?
        .with_context(|| format!("Stale element handle {} ({})", element.id, element.label))
    }

    async fn find(&self, locator: &Locator, all: bool) -> Result<Vec<ElementHandle>> {
        let loc_json = serde_json::to_string(locator)?;
        let mut conn = self.conn.lock().await;
        let value = conn
            .evaluate(&format!("{}({}, {})", LOCATE_JS, loc_json, all))
            .await?;

        let found = value
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        Some(ElementHandle {
                            id: item["id"].as_str()?.to_string(),
                            label: item["label"].as_str().unwrap_or("").to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(found)
    }
}

#[async_trait]
impl BrowserDriver for ActorSession {
    async fn navigate(&self, url: &str) -> Result<()> {
        let parsed = url::Url::parse(url).with_context(|| format!("Invalid URL: {}", url))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            bail!("Only HTTP and HTTPS URLs are allowed");
        }

        info!("Navigating session of {} to {}", self.actor, url);
        let mut conn = self.conn.lock().await;
        conn.send("Page.navigate", serde_json::json!({ "url": url })).await?;

        // Poll document.readyState rather than sleeping
        let deadline = Instant::now() + self.load_timeout;
        loop {
            if Instant::now() > deadline {
                warn!("Page load did not settle within {:?}: {}", self.load_timeout, url);
                break;
            }
            if let Ok(state) = conn.evaluate("document.readyState").await {
                if state.as_str() == Some("complete") {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(150)).await;
        }
        Ok(())
    }

    async fn locate(&self, locator: &Locator) -> Result<Option<ElementHandle>> {
        Ok(self.find(locator, false).await?.into_iter().next())
    }

    async fn locate_all(&self, locator: &Locator) -> Result<Vec<ElementHandle>> {
        self.find(locator, true).await
    }

    async fn click(&self, element: &ElementHandle) -> Result<()> {
        debug!("Clicking {} ({})", element.id, element.label);
        let mut conn = self.conn.lock().await;
        let object_id = Self::object_id(&mut conn, element).await?;
        conn.call_on(
            &object_id,
            "function() { this.scrollIntoView({block: 'center'}); this.click(); return true; }",
        )
        .await?;
        Ok(())
    }

    async fn fill(&self, element: &ElementHandle, text: &str) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let object_id = Self::object_id(&mut conn, element).await?;

        // Select existing content so insertText replaces it
        conn.call_on(
            &object_id,
            "function() { this.focus(); if (typeof this.select === 'function') { this.select(); } \
             else { document.execCommand('selectAll'); } return true; }",
        )
        .await?;

        conn.send("Input.insertText", serde_json::json!({ "text": text })).await?;

        conn.call_on(
            &object_id,
            "function() { this.dispatchEvent(new Event('change', {bubbles: true})); return true; }",
        )
        .await?;
        Ok(())
    }

    async fn upload_file(&self, element: &ElementHandle, path: &Path) -> Result<()> {
        let absolute = std::fs::canonicalize(path)
            .with_context(|| format!("Media file not found: {}", path.display()))?;

        let mut conn = self.conn.lock().await;
        let object_id = Self::object_id(&mut conn, element).await?;
        conn.send(
            "DOM.setFileInputFiles",
            serde_json::json!({
                "files": [absolute.display().to_string()],
                "objectId": object_id
            }),
        )
        .await?;
        Ok(())
    }

    async fn is_checked(&self, element: &ElementHandle) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let object_id = Self::object_id(&mut conn, element).await?;
        let value = conn
            .call_on(
                &object_id,
                "function() { return this.checked === true || this.getAttribute('aria-checked') === 'true' \
                 || this.getAttribute('aria-pressed') === 'true'; }",
            )
            .await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        let mut conn = self.conn.lock().await;
        let result = conn
            .send("Page.captureScreenshot", serde_json::json!({ "format": "png" }))
            .await?;

        let data_b64 = result["data"]
            .as_str()
            .context("No screenshot data in CDP response")?;

        base64::engine::general_purpose::STANDARD
            .decode(data_b64)
            .context("Failed to decode screenshot base64")
    }

    async fn current_url(&self) -> Result<String> {
        let mut conn = self.conn.lock().await;
        let value = conn.evaluate("window.location.href").await?;
        Ok(value.as_str().unwrap_or("").to_string())
    }

    async fn page_text(&self) -> Result<String> {
        let mut conn = self.conn.lock().await;
        let value = conn
            .evaluate("document.body ? (document.body.innerText || '') : ''")
            .await?;
        Ok(value.as_str().unwrap_or("").to_string())
    }

    async fn snapshot(&self) -> Result<PageSnapshot> {
        let mut conn = self.conn.lock().await;

        let _ = conn.send("Accessibility.enable", serde_json::json!({})).await;
        let ax_result = conn
            .send("Accessibility.getFullAXTree", serde_json::json!({}))
            .await?;

        let url = conn
            .evaluate("window.location.href")
            .await
            .map(|v| v.as_str().unwrap_or("").to_string())
            .unwrap_or_default();
        let title = conn
            .evaluate("document.title")
            .await
            .map(|v| v.as_str().unwrap_or("").to_string())
            .unwrap_or_default();

        let nodes = ax_result
            .get("nodes")
            .and_then(|n| n.as_array())
            .cloned()
            .unwrap_or_default();

        Ok(build_snapshot(url, title, &nodes))
    }
}

/// Turn raw AX nodes into the compact text view plus ref map
fn build_snapshot(url: String, title: String, nodes: &[Value]) -> PageSnapshot {
    let mut lines = Vec::new();
    let mut refs = HashMap::new();
    let mut counter = 0usize;

    for node in nodes {
        let role = node["role"]["value"].as_str().unwrap_or("");
        if role.is_empty() || role == "none" || role == "generic" || role == "Ignored" {
            continue;
        }
        let name = node["name"]["value"].as_str().unwrap_or("");
        let backend = node["backendDOMNodeId"].as_i64();
        let interactive = INTERACTIVE_ROLES.contains(&role.to_lowercase().as_str());

        match backend {
            Some(backend_id) if interactive => {
                counter += 1;
                let ref_id = format!("@e{}", counter);
                let mut line = format!("[{}] {} \"{}\"", ref_id, role, name);
                if let Some(checked) = node["properties"].as_array().and_then(|props| {
                    props
                        .iter()
                        .find(|p| p["name"].as_str() == Some("checked"))
                        .and_then(|p| p["value"]["value"].as_str().map(|s| s.to_string()))
                }) {
                    line.push_str(&format!(" checked={}", checked));
                }
                lines.push(line);
                refs.insert(
                    ref_id,
                    ElementHandle {
                        id: format!("ax:{}", backend_id),
                        label: name.to_string(),
                    },
                );
            }
            _ if !name.is_empty() => lines.push(format!("{}: {}", role, name)),
            _ => {}
        }
    }

    PageSnapshot {
        url,
        title,
        tree_text: lines.join("\n"),
        refs,
    }
}

/// Read a cookie export and convert it to `Network.CookieParam` objects.
/// Accepts DevTools exports and browser-extension exports
/// (`expirationDate`, `hostOnly`).
pub fn load_cookies(path: &Path) -> Result<Vec<Value>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read cookie file {}", path.display()))?;
    let parsed: Value = serde_json::from_str(&raw)
        .with_context(|| format!("Cookie file is not JSON: {}", path.display()))?;

    let entries = match parsed {
        Value::Array(items) => items,
        Value::Object(mut obj) => match obj.remove("cookies") {
            Some(Value::Array(items)) => items,
            _ => bail!("Cookie file must be an array or {{\"cookies\": [...]}}"),
        },
        _ => bail!("Cookie file must be an array or {{\"cookies\": [...]}}"),
    };

    Ok(entries.iter().filter_map(normalize_cookie).collect())
}

fn normalize_cookie(raw: &Value) -> Option<Value> {
    let name = raw["name"].as_str()?;
    let value = raw["value"].as_str()?;
    let domain = raw["domain"].as_str()?;

    let mut cookie = serde_json::json!({
        "name": name,
        "value": value,
        "domain": domain,
        "path": raw["path"].as_str().unwrap_or("/"),
        "secure": raw["secure"].as_bool().unwrap_or(true),
        "httpOnly": raw["httpOnly"].as_bool().unwrap_or(false),
    });

    let expires = raw["expires"]
        .as_f64()
        .or_else(|| raw["expirationDate"].as_f64());
    if let Some(expires) = expires.filter(|e| *e > 0.0) {
        cookie["expires"] = serde_json::json!(expires);
    }

    if let Some(same_site) = raw["sameSite"].as_str() {
        let normalized = match same_site.to_lowercase().as_str() {
            "strict" => Some("Strict"),
            "lax" => Some("Lax"),
            "none" | "no_restriction" => Some("None"),
            _ => None,
        };
        if let Some(s) = normalized {
            cookie["sameSite"] = serde_json::json!(s);
        }
    }

    Some(cookie)
}

/// Lazily launched Chrome shared by every actor session
pub struct BrowserPool {
    config: BrowserConfig,
    cookie_files: HashMap<ActorId, PathBuf>,
    chrome: Mutex<Option<ChromeProcess>>,
    sessions: Mutex<HashMap<ActorId, Arc<ActorSession>>>,
}

impl BrowserPool {
    pub fn new(config: BrowserConfig, cookie_files: HashMap<ActorId, PathBuf>) -> Self {
        Self {
            config,
            cookie_files,
            chrome: Mutex::new(None),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Close all sessions and the Chrome process
    pub async fn shutdown(&self) {
        self.sessions.lock().await.clear();
        if let Some(mut chrome) = self.chrome.lock().await.take() {
            chrome.shutdown().await;
            info!("Chrome stopped");
        }
    }
}

#[async_trait]
impl BrowserProvider for BrowserPool {
    async fn driver(&self, actor: &ActorId) -> Result<Arc<dyn BrowserDriver>> {
        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get(actor) {
            return Ok(existing.clone());
        }

        let mut chrome = self.chrome.lock().await;
        if chrome.is_none() {
            *chrome = Some(ChromeProcess::launch(&self.config).await?);
        }
        let process = chrome.as_mut().context("Chrome process missing")?;

        let session = Arc::new(
            ActorSession::open(
                process,
                actor,
                self.cookie_files.get(actor).map(|p| p.as_path()),
                &self.config,
            )
            .await?,
        );
        sessions.insert(actor.clone(), session.clone());
        info!("Opened isolated browser context for {}", actor);
        Ok(session)
    }

    /// Drop an actor's context so the next use starts from its cookie file again
    async fn reset(&self, actor: &ActorId) -> Result<()> {
        let removed = self.sessions.lock().await.remove(actor);
        if let Some(session) = removed {
            let mut chrome = self.chrome.lock().await;
            if let Some(chrome) = chrome.as_mut() {
                chrome.dispose_context(&session.context_id).await?;
            }
            info!("Reset browser session of {}", actor);
        }
        Ok(())
    }
}
