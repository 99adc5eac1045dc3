//! In-memory `BrowserDriver` / `BrowserLauncher` that replay canned DOM
//! snapshots. Used by the test suite and handy for dry runs without Chromium.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use super::browser_manager::BrowserLauncher;
use super::driver::{BrowserDriver, DomNode};
use crate::core::error::{HarvestError, HarvestResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    Navigate(String),
    Sleep(Duration),
    Query(String),
    Evaluate(String),
    OuterHtml(String),
    Close,
}

/// Replays one queue of node lists per selector. The last list of a queue is
/// sticky, so a page that "stops growing" is modelled by its final snapshot.
#[derive(Debug)]
pub struct ScriptedDriver {
    queries: HashMap<String, VecDeque<Vec<DomNode>>>,
    html: String,
    fail_navigation: Option<String>,
    deadline: Instant,
    calls: Arc<Mutex<Vec<DriverCall>>>,
    live: Option<Arc<AtomicUsize>>,
    closed: bool,
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self {
            queries: HashMap::new(),
            html: "<html><body></body></html>".to_string(),
            fail_navigation: None,
            deadline: Instant::now() + Duration::from_secs(24 * 3600),
            calls: Arc::new(Mutex::new(Vec::new())),
            live: None,
            closed: false,
        }
    }

    /// Successive snapshots of hrefs returned for `selector`.
    pub fn with_hrefs(mut self, selector: &str, passes: &[&[&str]]) -> Self {
        let queue = passes
            .iter()
            .map(|pass| pass.iter().map(|h| DomNode::with_href(*h)).collect())
            .collect();
        self.queries.insert(selector.to_string(), queue);
        self
    }

    pub fn with_html(mut self, html: impl Into<String>) -> Self {
        self.html = html.into();
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn failing_navigation(mut self, message: impl Into<String>) -> Self {
        self.fail_navigation = Some(message.into());
        self
    }

    /// Shared call log, readable after the driver has been boxed or dropped.
    pub fn call_log(&self) -> Arc<Mutex<Vec<DriverCall>>> {
        Arc::clone(&self.calls)
    }

    fn record(&self, call: DriverCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    fn check(&self, op: &str) -> HarvestResult<()> {
        if self.closed {
            return Err(HarvestError::transport("browser context already closed"));
        }
        if Instant::now() >= self.deadline {
            return Err(HarvestError::Deadline(op.to_string()));
        }
        Ok(())
    }

    fn release(&mut self) {
        if let Some(live) = self.live.take() {
            live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Default for ScriptedDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ScriptedDriver {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
impl BrowserDriver for ScriptedDriver {
    fn deadline(&self) -> Instant {
        self.deadline
    }

    async fn navigate(&mut self, url: &str) -> HarvestResult<()> {
        self.check("navigate")?;
        self.record(DriverCall::Navigate(url.to_string()));
        match &self.fail_navigation {
            Some(msg) => Err(HarvestError::transport(msg.clone())),
            None => Ok(()),
        }
    }

    async fn sleep(&mut self, d: Duration) -> HarvestResult<()> {
        self.check("sleep")?;
        self.record(DriverCall::Sleep(d));
        let wake = Instant::now() + d;
        if wake > self.deadline {
            tokio::time::sleep_until(self.deadline).await;
            return Err(HarvestError::Deadline("sleep".into()));
        }
        tokio::time::sleep_until(wake).await;
        Ok(())
    }

    async fn query_nodes(&mut self, selector: &str) -> HarvestResult<Vec<DomNode>> {
        self.check("query_nodes")?;
        self.record(DriverCall::Query(selector.to_string()));
        let Some(queue) = self.queries.get_mut(selector) else {
            return Ok(Vec::new());
        };
        let nodes = if queue.len() > 1 {
            queue.pop_front().unwrap_or_default()
        } else {
            queue.front().cloned().unwrap_or_default()
        };
        Ok(nodes)
    }

    async fn evaluate(&mut self, script: &str) -> HarvestResult<()> {
        self.check("evaluate")?;
        self.record(DriverCall::Evaluate(script.to_string()));
        Ok(())
    }

    async fn outer_html(&mut self, root_selector: &str) -> HarvestResult<String> {
        self.check("outer_html")?;
        self.record(DriverCall::OuterHtml(root_selector.to_string()));
        Ok(self.html.clone())
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.record(DriverCall::Close);
            self.release();
        }
    }
}

type DriverFactory = dyn Fn(usize) -> ScriptedDriver + Send + Sync;

/// Hands out `ScriptedDriver`s and tracks how many are alive at once.
pub struct ScriptedLauncher {
    factory: Box<DriverFactory>,
    launched: AtomicUsize,
    live: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ScriptedLauncher {
    /// `factory` receives the 0-based launch index.
    pub fn new(factory: impl Fn(usize) -> ScriptedDriver + Send + Sync + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            launched: AtomicUsize::new(0),
            live: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn launched(&self) -> usize {
        self.launched.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously open contexts observed.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrowserLauncher for ScriptedLauncher {
    async fn launch(&self, deadline: Instant) -> HarvestResult<Box<dyn BrowserDriver>> {
        let index = self.launched.fetch_add(1, Ordering::SeqCst);
        let driver = (self.factory)(index);
        let effective = driver.deadline.min(deadline);
        let mut driver = driver.with_deadline(effective);
        let now_live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_live, Ordering::SeqCst);
        driver.live = Some(Arc::clone(&self.live));
        Ok(Box::new(driver))
    }
}
