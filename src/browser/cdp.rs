//! Chrome DevTools Protocol wire client and Chrome process management

use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, info};
use uuid::Uuid;

use super::BrowserConfig;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// One WebSocket connection to Chrome, either browser-level or page-level
pub struct CdpConnection {
    ws_stream: WsStream,
    message_id: u64,
    command_timeout: Duration,
}

impl CdpConnection {
    pub async fn connect(ws_url: &str, command_timeout: Duration) -> Result<Self> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(ws_url)
            .await
            .with_context(|| format!("Failed to connect to Chrome DevTools at {}", ws_url))?;

        Ok(Self {
            ws_stream,
            message_id: 0,
            command_timeout,
        })
    }

    /// Send a command and wait for its response, skipping events
    pub async fn send(&mut self, method: &str, params: Value) -> Result<Value> {
        self.message_id += 1;
        let id = self.message_id;

        let message = serde_json::json!({
            "id": id,
            "method": method,
            "params": params
        });

        debug!("CDP command: {}", method);

        self.ws_stream
            .send(tokio_tungstenite::tungstenite::Message::Text(
                message.to_string().into(),
            ))
            .await?;

        let wait = async {
            loop {
                let msg = self
                    .ws_stream
                    .next()
                    .await
                    .context("WebSocket closed unexpectedly")??;

                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    let response: Value = serde_json::from_str(&text)?;

                    if response.get("id").and_then(|v| v.as_u64()) == Some(id) {
                        if let Some(error) = response.get("error") {
                            bail!("CDP error in {}: {}", method, error);
                        }
                        return Ok(response.get("result").cloned().unwrap_or(Value::Null));
                    }
                }
            }
        };

        timeout(self.command_timeout, wait)
            .await
            .with_context(|| format!("CDP command {} timed out", method))?
    }

    /// Evaluate an expression and return its JSON value
    pub async fn evaluate(&mut self, expression: &str) -> Result<Value> {
        let result = self
            .send(
                "Runtime.evaluate",
                serde_json::json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true
                }),
            )
            .await?;

        if let Some(exception) = result.get("exceptionDetails") {
            bail!("Script threw: {}", exception["text"].as_str().unwrap_or("unknown"));
        }

        Ok(result
            .get("result")
            .and_then(|r| r.get("value"))
            .cloned()
            .unwrap_or(Value::Null))
    }

    /// Evaluate an expression that yields a DOM node and return its remote object id
    pub async fn evaluate_object(&mut self, expression: &str) -> Result<Option<String>> {
        let result = self
            .send(
                "Runtime.evaluate",
                serde_json::json!({ "expression": expression, "returnByValue": false }),
            )
            .await?;

        Ok(result
            .get("result")
            .and_then(|r| r.get("objectId"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()))
    }

    /// Call a function with `this` bound to a remote object
    pub async fn call_on(&mut self, object_id: &str, function: &str) -> Result<Value> {
        let result = self
            .send(
                "Runtime.callFunctionOn",
                serde_json::json!({
                    "objectId": object_id,
                    "functionDeclaration": function,
                    "returnByValue": true
                }),
            )
            .await?;

        Ok(result
            .get("result")
            .and_then(|r| r.get("value"))
            .cloned()
            .unwrap_or(Value::Null))
    }

    pub async fn close(&mut self) {
        let _ = self.ws_stream.close(None).await;
    }
}

/// The shared Chrome process plus its browser-level connection
pub struct ChromeProcess {
    process: tokio::process::Child,
    port: u16,
    browser: CdpConnection,
    profile_dir: std::path::PathBuf,
}

impl ChromeProcess {
    /// Launch Chrome with remote debugging and connect to it
    pub async fn launch(config: &BrowserConfig) -> Result<Self> {
        let binary = locate_chrome(config.chrome_path.as_deref())?;
        let port = free_port().await?;
        // Throwaway default profile; actor state lives in browser contexts
        let profile_dir = std::env::temp_dir().join(format!("postline-chrome-{}", Uuid::new_v4()));

        debug!("Launching {} on debug port {}", binary.display(), port);
        let process = tokio::process::Command::new(&binary)
            .args(chrome_args(config, port, &profile_dir))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to launch {}", binary.display()))?;

        let ws_url = browser_ws_url(port, Duration::from_secs(config.load_timeout_secs.max(5))).await?;
        info!("Chrome ready at {}", ws_url);
        let browser = CdpConnection::connect(&ws_url, Duration::from_secs(config.command_timeout_secs)).await?;

        Ok(Self {
            process,
            port,
            browser,
            profile_dir,
        })
    }

    /// Create an isolated browser context with one blank page in it.
    /// Returns (context id, target id).
    pub async fn new_context(&mut self) -> Result<(String, String)> {
        let ctx = self
            .browser
            .send(
                "Target.createBrowserContext",
                serde_json::json!({ "disposeOnDetach": false }),
            )
            .await?;
        let context_id = ctx["browserContextId"]
            .as_str()
            .context("Failed to get browser context ID")?
            .to_string();

        let target = self
            .browser
            .send(
                "Target.createTarget",
                serde_json::json!({ "url": "about:blank", "browserContextId": context_id }),
            )
            .await?;
        let target_id = target["targetId"]
            .as_str()
            .context("Failed to get target ID")?
            .to_string();

        Ok((context_id, target_id))
    }

    pub async fn dispose_context(&mut self, context_id: &str) -> Result<()> {
        self.browser
            .send(
                "Target.disposeBrowserContext",
                serde_json::json!({ "browserContextId": context_id }),
            )
            .await?;
        Ok(())
    }

    /// Direct WebSocket endpoint of a page target
    pub fn page_ws_url(&self, target_id: &str) -> String {
        format!("ws://127.0.0.1:{}/devtools/page/{}", self.port, target_id)
    }

    pub async fn shutdown(&mut self) {
        self.browser.close().await;
        let _ = self.process.kill().await;
        let _ = tokio::fs::remove_dir_all(&self.profile_dir).await;
    }
}

/// Flags that keep background throttling and automation hints out of the way
const BASE_FLAGS: &[&str] = &[
    "--no-first-run",
    "--no-default-browser-check",
    "--disable-default-apps",
    "--disable-background-timer-throttling",
    "--disable-renderer-backgrounding",
    "--disable-backgrounding-occluded-windows",
    "--disable-blink-features=AutomationControlled",
];

const CHROME_NAMES: &[&str] = &["google-chrome", "google-chrome-stable", "chromium", "chromium-browser"];

const MAC_BUNDLES: &[&str] = &[
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/Applications/Chromium.app/Contents/MacOS/Chromium",
];

fn chrome_args(config: &BrowserConfig, port: u16, profile_dir: &Path) -> Vec<String> {
    let mut args: Vec<String> = BASE_FLAGS.iter().map(|f| f.to_string()).collect();
    args.push(format!("--remote-debugging-port={}", port));
    args.push(format!("--user-data-dir={}", profile_dir.display()));
    args.push(format!("--window-size={},{}", config.window_width, config.window_height));
    if config.headless {
        args.push("--headless=new".to_string());
    }
    if let Some(agent) = &config.user_agent {
        args.push(format!("--user-agent={}", agent));
    }
    args
}

/// Configured binary, else the first Chrome-like name on PATH, else a macOS bundle
fn locate_chrome(configured: Option<&str>) -> Result<PathBuf> {
    if let Some(path) = configured {
        let path = PathBuf::from(path);
        if !path.is_file() {
            bail!("browser.chrome_path {} does not exist", path.display());
        }
        return Ok(path);
    }

    let search = std::env::var_os("PATH").unwrap_or_default();
    let on_path = std::env::split_paths(&search)
        .flat_map(|dir| CHROME_NAMES.iter().map(move |name| dir.join(name)))
        .find(|candidate| candidate.is_file());

    on_path
        .or_else(|| MAC_BUNDLES.iter().map(PathBuf::from).find(|p| p.is_file()))
        .context("No Chrome or Chromium found; install one or set browser.chrome_path")
}

async fn free_port() -> Result<u16> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .context("Failed to reserve a debug port")?;
    Ok(listener.local_addr()?.port())
}

#[derive(Debug, Deserialize)]
struct DevtoolsVersion {
    #[serde(rename = "webSocketDebuggerUrl")]
    ws_url: String,
}

/// Poll `/json/version` until Chrome answers with its browser endpoint
async fn browser_ws_url(port: u16, within: Duration) -> Result<String> {
    let endpoint = format!("http://127.0.0.1:{}/json/version", port);
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if let Ok(response) = reqwest::get(&endpoint).await {
            if let Ok(version) = response.json::<DevtoolsVersion>().await {
                return Ok(version.ws_url);
            }
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    bail!("Chrome did not open its debug port {} within {:?}", port, within)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_configured_chrome_is_an_error() {
        let err = locate_chrome(Some("/nonexistent/chrome-binary")).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_args_follow_config() {
        let mut config = BrowserConfig::default();
        config.headless = false;
        config.user_agent = Some("postline-test".to_string());
        let args = chrome_args(&config, 9333, Path::new("/tmp/profile"));

        assert!(args.contains(&"--remote-debugging-port=9333".to_string()));
        assert!(args.contains(&"--user-data-dir=/tmp/profile".to_string()));
        assert!(args.contains(&"--user-agent=postline-test".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("--headless")));
    }

    #[tokio::test]
    async fn test_free_port() {
        assert!(free_port().await.unwrap() > 0);
    }
}
