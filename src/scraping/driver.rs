//! Browser Driver: the narrow surface the enumerator and harvester script
//! against, plus its Chrome DevTools Protocol implementation.
//!
//! Every call is bounded by the context's deadline. Elapse surfaces as
//! `HarvestError::Deadline`, a closed channel or CDP failure as
//! `HarvestError::Transport`. Nothing here retries.

use async_trait::async_trait;
use chromiumoxide::{Browser, Page};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::core::error::{HarvestError, HarvestResult};

/// Snapshot of one DOM element's attributes at query time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomNode {
    attributes: HashMap<String, String>,
}

impl DomNode {
    pub fn new(attributes: HashMap<String, String>) -> Self {
        Self { attributes }
    }

    /// Convenience for anchors: a node carrying only `href`.
    pub fn with_href(href: impl Into<String>) -> Self {
        let mut attributes = HashMap::new();
        attributes.insert("href".to_string(), href.into());
        Self { attributes }
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn href(&self) -> Option<&str> {
        self.attribute("href")
    }
}

#[async_trait]
pub trait BrowserDriver: Send {
    /// Instant after which every call fails with `HarvestError::Deadline`.
    fn deadline(&self) -> Instant;

    /// Load `url`; resolves once the navigation has committed.
    async fn navigate(&mut self, url: &str) -> HarvestResult<()>;

    /// All nodes currently matching `selector`, in document order.
    async fn query_nodes(&mut self, selector: &str) -> HarvestResult<Vec<DomNode>>;

    /// Run `script` in the page. Only used for scrolling; the result is discarded.
    async fn evaluate(&mut self, script: &str) -> HarvestResult<()>;

    /// Serialized DOM rooted at the first element matching `root_selector`.
    async fn outer_html(&mut self, root_selector: &str) -> HarvestResult<String>;

    /// Release the context. Calls after `close` fail with a transport error.
    async fn close(&mut self);

    /// Cooperative pause that lets injected content settle. Never outlives the deadline.
    async fn sleep(&mut self, d: Duration) -> HarvestResult<()> {
        let deadline = self.deadline();
        let wake = Instant::now() + d;
        if wake > deadline {
            tokio::time::sleep_until(deadline).await;
            return Err(HarvestError::Deadline("sleep".into()));
        }
        tokio::time::sleep_until(wake).await;
        Ok(())
    }
}

/// Await `fut` until `deadline`, mapping elapse to `HarvestError::Deadline(op)`.
pub async fn within_deadline<T, F>(deadline: Instant, op: &str, fut: F) -> HarvestResult<T>
where
    F: Future<Output = HarvestResult<T>>,
{
    match tokio::time::timeout_at(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(HarvestError::Deadline(op.to_string())),
    }
}

/// JS string literal for `s` (JSON strings are valid JS string literals).
fn js_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

fn query_nodes_script(selector: &str) -> String {
    format!(
        "Array.from(document.querySelectorAll({sel})).map(el => Object.fromEntries(Array.from(el.attributes).map(a => [a.name, a.value])))",
        sel = js_string(selector)
    )
}

fn outer_html_script(root_selector: &str) -> String {
    format!(
        "(() => {{ const el = document.querySelector({sel}); return el ? el.outerHTML : null; }})()",
        sel = js_string(root_selector)
    )
}

/// Driver over one exclusively owned headless Chromium process and its
/// throwaway profile directory. The profile is removed once the process has
/// exited.
pub struct CdpDriver {
    browser: Option<Browser>,
    handler_task: Option<JoinHandle<()>>,
    page: Page,
    profile: Option<TempDir>,
    deadline: Instant,
}

impl CdpDriver {
    pub fn new(
        browser: Browser,
        handler_task: JoinHandle<()>,
        page: Page,
        profile: TempDir,
        deadline: Instant,
    ) -> Self {
        Self {
            browser: Some(browser),
            handler_task: Some(handler_task),
            page,
            profile: Some(profile),
            deadline,
        }
    }

    fn ensure_open(&self) -> HarvestResult<()> {
        if self.browser.is_none() {
            return Err(HarvestError::transport("browser context already closed"));
        }
        Ok(())
    }

    async fn eval_json(&mut self, op: &str, script: String) -> HarvestResult<serde_json::Value> {
        self.ensure_open()?;
        evaluate_on_page(self.page.clone(), self.deadline, op, script).await
    }
}

async fn evaluate_on_page(
    page: Page,
    deadline: Instant,
    op: &str,
    script: String,
) -> HarvestResult<serde_json::Value> {
    within_deadline(deadline, op, async move {
        let result = page
            .evaluate(script)
            .await
            .map_err(|e| HarvestError::transport(format!("{} failed: {}", op, e)))?;
        Ok(result
            .into_value::<serde_json::Value>()
            .unwrap_or(serde_json::Value::Null))
    })
    .await
}

#[async_trait]
impl BrowserDriver for CdpDriver {
    fn deadline(&self) -> Instant {
        self.deadline
    }

    async fn navigate(&mut self, url: &str) -> HarvestResult<()> {
        self.ensure_open()?;
        debug!("🌐 Navigating to: {}", url);
        let page = self.page.clone();
        within_deadline(self.deadline, "navigate", async move {
            page.goto(url)
                .await
                .map(|_| ())
                .map_err(|e| {
                    HarvestError::transport(format!("failed to navigate to {}: {}", url, e))
                })
        })
        .await
    }

    async fn query_nodes(&mut self, selector: &str) -> HarvestResult<Vec<DomNode>> {
        let value = self
            .eval_json("query_nodes", query_nodes_script(selector))
            .await?;
        let rows: Vec<HashMap<String, String>> = serde_json::from_value(value).map_err(|e| {
            HarvestError::transport(format!("unexpected node list for {}: {}", selector, e))
        })?;
        Ok(rows.into_iter().map(DomNode::new).collect())
    }

    async fn evaluate(&mut self, script: &str) -> HarvestResult<()> {
        self.eval_json("evaluate", script.to_string()).await.map(|_| ())
    }

    async fn outer_html(&mut self, root_selector: &str) -> HarvestResult<String> {
        match self
            .eval_json("outer_html", outer_html_script(root_selector))
            .await?
        {
            serde_json::Value::String(html) => Ok(html),
            _ => Err(HarvestError::transport(format!(
                "no element matches {}",
                root_selector
            ))),
        }
    }

    async fn close(&mut self) {
        if let Some(mut browser) = self.browser.take() {
            if let Err(e) = browser.close().await {
                warn!("Browser close error (non-fatal): {}", e);
            }
            let _ = browser.wait().await;
        }
        if let Some(task) = self.handler_task.take() {
            task.abort();
        }
        drop(self.profile.take());
    }
}

impl Drop for CdpDriver {
    fn drop(&mut self) {
        // Drop cannot await; hand the close to the runtime so no Chromium
        // process outlives an aborted task. The handler must keep running
        // until the close command has gone out.
        let handler_task = self.handler_task.take();
        let profile = self.profile.take();
        let Some(mut browser) = self.browser.take() else {
            if let Some(task) = handler_task {
                task.abort();
            }
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let _ = browser.close().await;
                    let _ = browser.wait().await;
                    if let Some(task) = handler_task {
                        task.abort();
                    }
                    drop(profile);
                });
            }
            Err(_) => {
                if let Some(task) = handler_task {
                    task.abort();
                }
            }
        }
    }
}
