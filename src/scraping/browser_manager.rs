//! Native browser management using `chromiumoxide`.
//!
//! This module is the single place that knows how to:
//! * find a usable Chromium-family executable (Chrome → Chromium → Brave, cross-platform);
//! * build a headless `BrowserConfig` with stealth defaults;
//! * launch one **exclusive** browser context per playlist task (`ChromeLauncher`).
//!
//! Contexts are never pooled or shared: each harvest task owns its browser
//! process from launch to close, so a deadline or crash only ever takes down
//! that one task.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chromiumoxide::browser::BrowserConfig;
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::Browser;
use futures::StreamExt;
use rand::seq::IndexedRandom;
use std::path::Path;
use tokio::time::Instant;
use tracing::{info, warn};

use super::driver::{BrowserDriver, CdpDriver};
use crate::core::error::{HarvestError, HarvestResult};

// ── Realistic User-Agent pool ────────────────────────────────────────────────

const DESKTOP_USER_AGENTS: &[&str] = &[
    // Chrome 132 – Windows
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36",
    // Chrome 132 – macOS
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36",
    // Chrome 131 – Linux
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    // Edge 132 – Windows
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36 Edg/132.0.0.0",
];

/// Returns a randomly-chosen desktop Chromium User-Agent string.
///
/// Only Chromium UAs are listed: the channel page serves a different layout
/// to Firefox/Safari, and the selectors below target the Chromium one.
pub fn random_user_agent() -> &'static str {
    let mut rng = rand::rng();
    DESKTOP_USER_AGENTS
        .choose(&mut rng)
        .copied()
        .unwrap_or(DESKTOP_USER_AGENTS[0])
}

// ── Browser executable discovery ─────────────────────────────────────────────

const PATH_CANDIDATES: &[&str] = &[
    "google-chrome",
    "google-chrome-stable",
    "chromium",
    "chromium-browser",
    "chrome",
    "brave-browser",
    "brave",
];

/// Find a usable Chromium-family browser executable.
///
/// Resolution order:
/// 1. `explicit` (config file / `CHROME_EXECUTABLE`, already checked to exist)
/// 2. PATH lookup via `which`
/// 3. OS-specific well-known install paths
pub fn find_chrome_executable(explicit: Option<&str>) -> Option<String> {
    if let Some(p) = explicit {
        if Path::new(p).exists() {
            return Some(p.to_string());
        }
    }

    for exe in PATH_CANDIDATES {
        if let Ok(full) = which::which(exe) {
            return Some(full.to_string_lossy().to_string());
        }
    }

    #[cfg(target_os = "macos")]
    {
        let candidates = [
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
            "/Applications/Brave Browser.app/Contents/MacOS/Brave Browser",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    #[cfg(target_os = "linux")]
    {
        let candidates = [
            "/usr/bin/google-chrome",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/usr/local/bin/chromium",
            "/snap/bin/chromium",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    #[cfg(target_os = "windows")]
    {
        let candidates = [
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Microsoft\Edge\Application\msedge.exe",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    None
}

// ── Headless browser config builder ──────────────────────────────────────────

/// Build a `BrowserConfig` for headless operation.
///
/// Flags chosen for:
/// * Compatibility with CI / containers (`--no-sandbox`, `--disable-dev-shm-usage`).
/// * Stealth: `--disable-blink-features=AutomationControlled` hides the
///   `navigator.webdriver` flag; UA is drawn from `DESKTOP_USER_AGENTS`.
///
/// `profile_dir` must be private to this process: Chromium takes a
/// `SingletonLock` in it, and a second process on the same profile hands off
/// to the first instead of starting.
pub fn build_headless_config(
    exe: &str,
    width: u32,
    height: u32,
    profile_dir: &Path,
) -> Result<BrowserConfig> {
    let ua = random_user_agent();

    BrowserConfig::builder()
        .chrome_executable(exe)
        .user_data_dir(profile_dir)
        .viewport(Viewport {
            width,
            height,
            device_scale_factor: Some(1.0),
            emulating_mobile: false,
            is_landscape: true,
            has_touch: false,
        })
        .window_size(width, height)
        .arg("--disable-gpu")
        .arg("--no-sandbox")
        .arg("--disable-setuid-sandbox")
        .arg("--disable-dev-shm-usage")
        .arg("--disable-extensions")
        .arg("--disable-background-networking")
        .arg("--disable-sync")
        .arg("--disable-translate")
        .arg("--no-first-run")
        .arg("--no-default-browser-check")
        .arg("--mute-audio")
        .arg("--disable-blink-features=AutomationControlled")
        .arg(format!("--user-agent={}", ua))
        .build()
        .map_err(|e| anyhow!("Failed to build browser config: {}", e))
}

// ── Per-task context launcher ────────────────────────────────────────────────

/// Creates a fresh, exclusively-owned browser context bound to `deadline`.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self, deadline: Instant) -> HarvestResult<Box<dyn BrowserDriver>>;
}

/// Launches one headless Chromium process per context.
pub struct ChromeLauncher {
    exe: String,
    width: u32,
    height: u32,
}

impl ChromeLauncher {
    pub fn new(exe: impl Into<String>) -> Self {
        Self {
            exe: exe.into(),
            width: 1920,
            height: 1080,
        }
    }

    /// Launcher for the auto-discovered executable; `Config` error when none is installed.
    pub fn discover(explicit: Option<&str>) -> HarvestResult<Self> {
        find_chrome_executable(explicit).map(Self::new).ok_or_else(|| {
            HarvestError::Config(
                "No browser found. Install Chrome or Chromium, or set CHROME_EXECUTABLE.".into(),
            )
        })
    }

    pub fn executable(&self) -> &str {
        &self.exe
    }
}

#[async_trait]
impl BrowserLauncher for ChromeLauncher {
    async fn launch(&self, deadline: Instant) -> HarvestResult<Box<dyn BrowserDriver>> {
        let profile = tempfile::Builder::new()
            .prefix("ocw-harvest-profile-")
            .tempdir()
            .map_err(|e| {
                HarvestError::transport(format!("failed to create browser profile: {}", e))
            })?;
        let config = build_headless_config(&self.exe, self.width, self.height, profile.path())
            .map_err(|e| HarvestError::Config(e.to_string()))?;

        let launched = tokio::time::timeout_at(deadline, Browser::launch(config))
            .await
            .map_err(|_| HarvestError::Deadline("browser launch".into()))?;
        let (mut browser, mut handler) = launched.map_err(|e| {
            HarvestError::transport(format!("failed to launch browser ({}): {}", self.exe, e))
        })?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    warn!("CDP handler error: {}", e);
                }
            }
        });

        let page = match tokio::time::timeout_at(deadline, browser.new_page("about:blank")).await {
            Ok(Ok(page)) => page,
            Ok(Err(e)) => {
                let _ = browser.close().await;
                return Err(HarvestError::transport(format!("failed to open tab: {}", e)));
            }
            Err(_) => {
                let _ = browser.close().await;
                return Err(HarvestError::Deadline("open tab".into()));
            }
        };

        info!("🚀 Browser context launched ({})", self.exe);
        Ok(Box::new(CdpDriver::new(
            browser,
            handler_task,
            page,
            profile,
            deadline,
        )))
    }
}
