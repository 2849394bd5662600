//! Chrome-backed sessions.
//!
//! Each session is its own browser process on a persistent profile directory
//! (so the chat login survives restarts), driven through one page target.

use crate::cdp::CdpClient;
use crate::{ElementRef, SessionHandle, SessionProvider, TextMatcher};
use aimatch_core::{Error, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tracing::{debug, info};

/// Attribute used to hand element references between JS and Rust.
const REF_ATTR: &str = "data-aimatch-ref";
const CANDIDATE_ATTR: &str = "data-aimatch-cand";
const POLL_INTERVAL: Duration = Duration::from_millis(250);
const LOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Supported browser engines (both speak CDP).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowserEngine {
    Chrome,
    Edge,
}

impl BrowserEngine {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "edge" | "msedge" => Self::Edge,
            _ => Self::Chrome,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Chrome => "chrome",
            Self::Edge => "edge",
        }
    }
}

/// Launches Chrome sessions on a fixed profile directory.
#[derive(Debug, Clone)]
pub struct ChromeProvider {
    engine: BrowserEngine,
    profile_dir: PathBuf,
    headed: bool,
}

impl ChromeProvider {
    pub fn new(engine: BrowserEngine, profile_dir: PathBuf, headed: bool) -> Self {
        Self {
            engine,
            profile_dir,
            headed,
        }
    }

    pub fn profile_dir(&self) -> &Path {
        &self.profile_dir
    }

    /// Launch a browser and connect to its first page target.
    pub async fn launch(&self) -> Result<ChromeSession> {
        let browser_path = find_browser_binary(self.engine).ok_or_else(|| {
            Error::Browser(format!("{} not found. Please install it.", self.engine.name()))
        })?;

        std::fs::create_dir_all(&self.profile_dir).map_err(|e| {
            Error::Browser(format!("Failed to create profile dir: {}", e))
        })?;

        let debug_port = find_free_port().await?;
        let args = build_browser_args(debug_port, &self.profile_dir, self.headed);

        info!(
            port = debug_port,
            headed = self.headed,
            browser = self.engine.name(),
            profile = %self.profile_dir.display(),
            "Launching browser session"
        );

        let child = Command::new(&browser_path)
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Browser(format!("Failed to launch {}: {}", self.engine.name(), e)))?;

        wait_for_cdp_ready(debug_port, Duration::from_secs(15)).await?;
        let page_ws_url = get_page_ws_url(debug_port).await?;

        let cdp = CdpClient::connect(&page_ws_url).await.map_err(cdp_err)?;
        cdp.enable_domain("Page").await.map_err(cdp_err)?;
        cdp.enable_domain("Runtime").await.map_err(cdp_err)?;
        cdp.enable_domain("DOM").await.map_err(cdp_err)?;

        info!(ws_url = %page_ws_url, "CDP connection established (page target)");

        Ok(ChromeSession {
            process: child,
            cdp,
            next_ref: 0,
        })
    }
}

#[async_trait]
impl SessionProvider for ChromeProvider {
    async fn open(&self) -> Result<Box<dyn SessionHandle>> {
        Ok(Box::new(self.launch().await?))
    }
}

/// A live browser process plus its CDP connection.
pub struct ChromeSession {
    process: Child,
    cdp: CdpClient,
    next_ref: u64,
}

impl ChromeSession {
    fn fresh_ref(&mut self) -> String {
        self.next_ref += 1;
        format!("r{}", self.next_ref)
    }

    async fn wait_for_load(&self) -> Result<()> {
        let start = Instant::now();
        // Give the navigation a moment to replace the old document
        tokio::time::sleep(Duration::from_millis(300)).await;
        loop {
            let state = self
                .cdp
                .evaluate_js("document.readyState")
                .await
                .map_err(cdp_err)?;
            if state.as_str() == Some("complete") {
                return Ok(());
            }
            if start.elapsed() > LOAD_TIMEOUT {
                debug!("Page still loading after {}s, continuing", LOAD_TIMEOUT.as_secs());
                return Ok(());
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Collect candidate texts, tagging each element with its index.
    async fn collect_candidates(&self, max_len: usize) -> Result<Vec<String>> {
        let js = candidates_script(max_len);
        let value = self.cdp.evaluate_js(&js).await.map_err(cdp_err)?;
        Ok(value
            .as_array()
            .map(|arr| {
                arr.iter()
                    .map(|v| v.as_str().unwrap_or_default().to_string())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn tag_candidate(&mut self, index: usize) -> Result<String> {
        let ref_id = self.fresh_ref();
        let js = format!(
            "(function() {{ var el = document.querySelector('[{cand}=\"{idx}\"]'); if (!el) return false; el.setAttribute('{attr}', '{rid}'); return true; }})()",
            cand = CANDIDATE_ATTR,
            idx = index,
            attr = REF_ATTR,
            rid = ref_id
        );
        let tagged = self.cdp.evaluate_js(&js).await.map_err(cdp_err)?;
        if tagged.as_bool() != Some(true) {
            return Err(Error::UiElementNotFound(format!(
                "candidate {} vanished before it could be tagged",
                index
            )));
        }
        Ok(ref_id)
    }
}

#[async_trait]
impl SessionHandle for ChromeSession {
    async fn navigate(&mut self, url: &str) -> Result<()> {
        debug!(url = %url, "Navigating");
        self.cdp.navigate(url).await.map_err(cdp_err)?;
        self.wait_for_load().await
    }

    async fn reload(&mut self) -> Result<()> {
        debug!("Reloading page");
        self.cdp.reload().await.map_err(cdp_err)?;
        self.wait_for_load().await
    }

    async fn wait_for_element(&mut self, selector: &str, timeout: Duration) -> Result<ElementRef> {
        let ref_id = self.fresh_ref();
        let js = format!(
            "(function(sel) {{ var el = document.querySelector(sel); if (!el) return false; el.setAttribute('{attr}', '{rid}'); return true; }})({sel})",
            attr = REF_ATTR,
            rid = ref_id,
            sel = js_string(selector)
        );

        let start = Instant::now();
        loop {
            let found = self.cdp.evaluate_js(&js).await.map_err(cdp_err)?;
            if found.as_bool() == Some(true) {
                return Ok(ElementRef { ref_id, text: None });
            }
            if start.elapsed() >= timeout {
                return Err(Error::Timeout(format!(
                    "'{}' not present after {}s",
                    selector,
                    timeout.as_secs_f32()
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn find_by_text(
        &mut self,
        text: &str,
        matcher: &dyn TextMatcher,
        timeout: Duration,
    ) -> Result<ElementRef> {
        let limit = matcher.candidate_limit(text);
        let start = Instant::now();
        loop {
            let candidates = self.collect_candidates(limit).await?;
            if let Some((index, matched)) = matcher.best(text, &candidates) {
                let matched = matched.to_string();
                let ref_id = self.tag_candidate(index).await?;
                return Ok(ElementRef {
                    ref_id,
                    text: Some(matched),
                });
            }
            if start.elapsed() >= timeout {
                return Err(Error::UiElementNotFound(format!(
                    "no element matching '{}' after {}s",
                    text,
                    timeout.as_secs_f32()
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn click(&mut self, element: &ElementRef) -> Result<()> {
        let js = format!(
            concat!(
                "(function() {{ var el = document.querySelector('[{attr}=\"{rid}\"]');",
                " if (!el) return null;",
                " el.scrollIntoView({{block: 'center'}});",
                " var r = el.getBoundingClientRect();",
                " return {{x: r.left + r.width / 2, y: r.top + r.height / 2}}; }})()"
            ),
            attr = REF_ATTR,
            rid = element.ref_id
        );
        let point = self.cdp.evaluate_js(&js).await.map_err(cdp_err)?;
        let (x, y) = center_of(&point).ok_or_else(|| {
            Error::UiElementNotFound(format!("element {} is gone", element.ref_id))
        })?;
        self.cdp.click_at(x, y).await.map_err(cdp_err)
    }

    async fn send_text(&mut self, element: &ElementRef, text: &str) -> Result<()> {
        let js = format!(
            "(function() {{ var el = document.querySelector('[{attr}=\"{rid}\"]'); if (!el) return false; el.focus(); return true; }})()",
            attr = REF_ATTR,
            rid = element.ref_id
        );
        let focused = self.cdp.evaluate_js(&js).await.map_err(cdp_err)?;
        if focused.as_bool() != Some(true) {
            return Err(Error::UiElementNotFound(format!(
                "element {} is gone",
                element.ref_id
            )));
        }

        let body = text.trim_end_matches('\n');
        if !body.is_empty() {
            self.cdp.insert_text(body).await.map_err(cdp_err)?;
        }
        if body.len() != text.len() {
            self.cdp.press_enter().await.map_err(cdp_err)?;
        }
        Ok(())
    }

    async fn page_text(&mut self) -> Result<String> {
        let value = self
            .cdp
            .evaluate_js("document.body ? document.body.innerText : ''")
            .await
            .map_err(cdp_err)?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn close(&mut self) -> Result<()> {
        if let Err(e) = self.cdp.close_browser().await {
            debug!("CDP Browser.close failed (may already be closed): {}", e);
        }
        let _ = self.process.kill().await;
        info!("Browser session closed");
        Ok(())
    }
}

impl Drop for ChromeSession {
    fn drop(&mut self) {
        // Best-effort kill on drop
        let _ = self.process.start_kill();
    }
}

/// Encode `s` as a JavaScript string literal.
fn js_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "''".to_string())
}

fn center_of(point: &Value) -> Option<(f64, f64)> {
    let x = point.get("x")?.as_f64()?;
    let y = point.get("y")?.as_f64()?;
    Some((x, y))
}

/// Convert a CDP error string into a crate error, recognising dead sessions.
fn cdp_err(e: String) -> Error {
    let err = Error::Browser(format!("CDP: {}", e));
    if err.is_session_lost() {
        Error::SessionLost(e)
    } else {
        err
    }
}

fn build_browser_args(debug_port: u16, user_data_dir: &Path, headed: bool) -> Vec<String> {
    let mut args = vec![
        format!("--remote-debugging-port={}", debug_port),
        format!("--user-data-dir={}", user_data_dir.display()),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        "--disable-background-networking".to_string(),
        "--disable-sync".to_string(),
        "--disable-translate".to_string(),
        "--password-store=basic".to_string(),
        "--disable-blink-features=AutomationControlled".to_string(),
    ];
    if !headed {
        args.push("--headless=new".to_string());
    }
    args.push("--window-size=1280,900".to_string());
    args.push("about:blank".to_string());
    args
}

/// Find a browser binary on the system for the given engine.
pub fn find_browser_binary(engine: BrowserEngine) -> Option<String> {
    let candidates = match engine {
        BrowserEngine::Chrome => {
            if cfg!(target_os = "macos") {
                vec![
                    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
                    "/Applications/Chromium.app/Contents/MacOS/Chromium",
                ]
            } else if cfg!(target_os = "linux") {
                vec![
                    "google-chrome",
                    "google-chrome-stable",
                    "chromium",
                    "chromium-browser",
                    "/usr/bin/google-chrome",
                    "/usr/bin/chromium",
                ]
            } else {
                vec![
                    r"C:\Program Files\Google\Chrome\Application\chrome.exe",
                    r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
                ]
            }
        }
        BrowserEngine::Edge => {
            if cfg!(target_os = "macos") {
                vec!["/Applications/Microsoft Edge.app/Contents/MacOS/Microsoft Edge"]
            } else if cfg!(target_os = "linux") {
                vec!["microsoft-edge", "microsoft-edge-stable", "/usr/bin/microsoft-edge"]
            } else {
                vec![
                    r"C:\Program Files (x86)\Microsoft\Edge\Application\msedge.exe",
                    r"C:\Program Files\Microsoft\Edge\Application\msedge.exe",
                ]
            }
        }
    };

    for candidate in candidates {
        if Path::new(candidate).exists() {
            return Some(candidate.to_string());
        }
        if !candidate.contains('/') && !candidate.contains('\\') && which::which(candidate).is_ok() {
            return Some(candidate.to_string());
        }
    }
    None
}

async fn find_free_port() -> Result<u16> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

/// Poll /json/version until the browser answers.
async fn wait_for_cdp_ready(port: u16, timeout: Duration) -> Result<String> {
    let start = Instant::now();
    let url = format!("http://127.0.0.1:{}/json/version", port);

    loop {
        if start.elapsed() > timeout {
            return Err(Error::SessionLost(format!(
                "browser CDP not ready after {}s on port {}",
                timeout.as_secs(),
                port
            )));
        }

        if let Ok(resp) = reqwest::get(&url).await {
            if let Ok(body) = resp.json::<Value>().await {
                if let Some(ws_url) = body.get("webSocketDebuggerUrl").and_then(|v| v.as_str()) {
                    return Ok(ws_url.to_string());
                }
            }
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

/// Resolve the first "page" target's WebSocket URL via /json/list.
async fn get_page_ws_url(port: u16) -> Result<String> {
    let url = format!("http://127.0.0.1:{}/json/list", port);

    for attempt in 0..10 {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_millis(300)).await;
        }

        let resp = match reqwest::get(&url).await {
            Ok(r) => r,
            Err(_) => continue,
        };
        let targets: Vec<Value> = match resp.json().await {
            Ok(t) => t,
            Err(_) => continue,
        };

        if let Some(ws_url) = first_page_ws_url(&targets) {
            return Ok(ws_url);
        }
    }

    Err(Error::SessionLost("no page target found after retries".to_string()))
}

fn first_page_ws_url(targets: &[Value]) -> Option<String> {
    targets
        .iter()
        .filter(|t| t.get("type").and_then(|v| v.as_str()) == Some("page"))
        .find_map(|t| t.get("webSocketDebuggerUrl").and_then(|v| v.as_str()))
        .map(|s| s.to_string())
}

/// Script that tags every short-text element with its candidate index. Walks
/// the document from the end so the newest conversation output is never cut
/// by the cap.
fn candidates_script(max_len: usize) -> String {
    format!(
        concat!(
            "(function(maxLen) {{",
            " document.querySelectorAll('[{cand}]').forEach(function(el) {{ el.removeAttribute('{cand}'); }});",
            " var out = [];",
            " var all = document.body ? document.body.querySelectorAll('*') : [];",
            " for (var i = all.length - 1; i >= 0 && out.length < 5000; i--) {{",
            "   var el = all[i];",
            "   if (el.tagName === 'SCRIPT' || el.tagName === 'STYLE') continue;",
            "   var text = (el.innerText || el.textContent || '').trim();",
            "   if (!text || text.length > maxLen) continue;",
            "   var dup = false;",
            "   for (var j = 0; j < el.children.length; j++) {{",
            "     var ct = (el.children[j].innerText || el.children[j].textContent || '').trim();",
            "     if (ct === text) {{ dup = true; break; }}",
            "   }}",
            "   if (dup) continue;",
            "   el.setAttribute('{cand}', String(out.length));",
            "   out.push(text);",
            " }}",
            " return out; }})({max})"
        ),
        cand = CANDIDATE_ATTR,
        max = max_len
    )
}
