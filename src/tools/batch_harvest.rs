//! Concurrency orchestrator: fan playlists out over a bounded set of browser
//! contexts, pace the extractor, retry throttled extractions, collect records
//! in completion order.

use backoff::backoff::Backoff;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{info, warn};
use url::Url;

use super::extract::StructuredExtractor;
use super::pacing::PacingTicker;
use super::reconcile::reconcile;
use crate::core::config::HarvestConfig;
use crate::core::error::{HarvestError, HarvestResult};
use crate::core::types::{CourseExtraction, CourseRecord, PlaylistRef};
use crate::scraping::browser_manager::BrowserLauncher;
use crate::scraping::driver::{within_deadline, BrowserDriver};
use crate::scraping::harvest::harvest_playlist;
use crate::scraping::sanitize::sanitize_html;
use crate::scraping::ScrollTiming;

#[derive(Debug, Clone)]
pub struct HarvestSettings {
    /// Browser-concurrency cap (K).
    pub max_concurrent: usize,
    /// Deadline of one playlist task, measured from when it gets its slot.
    pub task_timeout: Duration,
    pub site_base: Url,
    pub timing: ScrollTiming,
    pub pacing_period: Duration,
    /// Extraction attempts per task, first one included (M).
    pub max_attempts: u32,
    /// Retry `n` waits `n × backoff_step`.
    pub backoff_step: Duration,
}

impl HarvestSettings {
    pub fn from_config(cfg: &HarvestConfig) -> HarvestResult<Self> {
        let base = cfg.browser.resolve_site_base_url();
        let site_base = Url::parse(&base)
            .map_err(|e| HarvestError::Config(format!("invalid site base URL {}: {}", base, e)))?;
        Ok(Self {
            max_concurrent: cfg.browser.resolve_max_concurrent(),
            task_timeout: cfg.browser.resolve_task_timeout(),
            site_base,
            timing: ScrollTiming::playlist(&cfg.browser),
            pacing_period: cfg.llm.resolve_pacing_period(),
            max_attempts: cfg.llm.resolve_max_attempts(),
            backoff_step: cfg.llm.resolve_backoff_step(),
        })
    }
}

/// Linear backoff: retry `n` waits `n × step`, and there are at most
/// `max_retries` retries.
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    step: Duration,
    max_retries: u32,
    retries: u32,
}

impl LinearBackoff {
    /// Backoff for `max_attempts` total attempts (first one included).
    pub fn new(step: Duration, max_attempts: u32) -> Self {
        Self {
            step,
            max_retries: max_attempts.saturating_sub(1),
            retries: 0,
        }
    }
}

impl Backoff for LinearBackoff {
    fn next_backoff(&mut self) -> Option<Duration> {
        if self.retries >= self.max_retries {
            return None;
        }
        self.retries += 1;
        Some(self.step * self.retries)
    }

    fn reset(&mut self) {
        self.retries = 0;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub total: usize,
    pub emitted: usize,
    /// Abandoned tasks by error class (`transport`, `schema`, ...).
    pub abandoned: BTreeMap<String, usize>,
    pub total_duration_ms: u64,
}

#[derive(Debug, Clone, Default)]
pub struct BatchHarvest {
    /// Completion order, not input order.
    pub courses: Vec<CourseRecord>,
    pub summary: RunSummary,
}

pub struct BatchHarvester {
    launcher: Arc<dyn BrowserLauncher>,
    extractor: Arc<dyn StructuredExtractor>,
    settings: Arc<HarvestSettings>,
    run_deadline: Option<Instant>,
    cancel: Option<watch::Receiver<bool>>,
}

/// Everything one playlist task shares with its siblings.
struct TaskContext {
    launcher: Arc<dyn BrowserLauncher>,
    extractor: Arc<dyn StructuredExtractor>,
    settings: Arc<HarvestSettings>,
    semaphore: Arc<Semaphore>,
    ticker: PacingTicker,
    run_deadline: Option<Instant>,
    total: usize,
}

impl BatchHarvester {
    pub fn new(
        launcher: Arc<dyn BrowserLauncher>,
        extractor: Arc<dyn StructuredExtractor>,
        settings: HarvestSettings,
    ) -> Self {
        Self {
            launcher,
            extractor,
            settings: Arc::new(settings),
            run_deadline: None,
            cancel: None,
        }
    }

    /// Cap every task deadline at `deadline`.
    pub fn with_run_deadline(mut self, deadline: Instant) -> Self {
        self.run_deadline = Some(deadline);
        self
    }

    /// Once `cancel` turns `true`, every pending or in-flight task is
    /// abandoned as a deadline error and its browser context is closed.
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Harvest every playlist; failed tasks are logged and contribute nothing.
    pub async fn run(&self, playlists: Vec<PlaylistRef>) -> Vec<CourseRecord> {
        self.run_detailed(playlists).await.courses
    }

    /// Like `run`, plus a per-class count of abandoned tasks.
    pub async fn run_detailed(&self, playlists: Vec<PlaylistRef>) -> BatchHarvest {
        let start_time = Instant::now();

        let mut unique = HashSet::new();
        let playlists: Vec<PlaylistRef> = playlists
            .into_iter()
            .filter(|p| unique.insert(p.clone()))
            .collect();
        let total = playlists.len();

        info!(
            "Starting to process {} playlists (browsers: {}, pacing: {}ms)",
            total,
            self.settings.max_concurrent,
            self.settings.pacing_period.as_millis()
        );

        let ctx = Arc::new(TaskContext {
            launcher: Arc::clone(&self.launcher),
            extractor: Arc::clone(&self.extractor),
            settings: Arc::clone(&self.settings),
            semaphore: Arc::new(Semaphore::new(self.settings.max_concurrent)),
            ticker: PacingTicker::new(self.settings.pacing_period),
            run_deadline: self.run_deadline,
            total,
        });
        let mut tasks = JoinSet::new();

        for (i, playlist) in playlists.into_iter().enumerate() {
            let ctx = Arc::clone(&ctx);
            let cancel = self.cancel.clone();
            tasks.spawn(async move {
                let result = run_task(&ctx, i, &playlist, cancel).await;
                (playlist, result)
            });
        }

        let mut courses = Vec::with_capacity(total);
        let mut abandoned: BTreeMap<String, usize> = BTreeMap::new();

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(course))) => {
                    info!(
                        "Successfully processed playlist: {} ({} videos)",
                        course.title,
                        course.videos.len()
                    );
                    courses.push(course);
                }
                Ok((playlist, Err(e))) => {
                    warn!("Error processing {}: {}", playlist, e);
                    *abandoned.entry(e.kind().to_string()).or_default() += 1;
                }
                Err(e) => {
                    warn!("Playlist task did not complete: {}", e);
                    *abandoned.entry("panic".to_string()).or_default() += 1;
                }
            }
        }

        let summary = RunSummary {
            total,
            emitted: courses.len(),
            abandoned,
            total_duration_ms: start_time.elapsed().as_millis() as u64,
        };
        info!(
            "Completed processing {}/{} playlists in {}ms (abandoned: {:?})",
            summary.emitted, summary.total, summary.total_duration_ms, summary.abandoned
        );

        BatchHarvest { courses, summary }
    }
}

/// Resolves once the run is cancelled; never resolves without a signal.
async fn cancelled(cancel: &mut Option<watch::Receiver<bool>>) {
    if let Some(rx) = cancel {
        let fired = rx.wait_for(|stop| *stop).await.is_ok();
        if fired {
            return;
        }
    }
    // No signal, or its sender is gone without ever firing.
    std::future::pending::<()>().await
}

fn cancelled_error() -> HarvestError {
    HarvestError::Deadline("run cancelled".into())
}

/// slot → launch → process → close. Cancellation wins over any step that is
/// ready at the same time. A launched context is always closed.
async fn run_task(
    ctx: &TaskContext,
    index: usize,
    playlist: &PlaylistRef,
    mut cancel: Option<watch::Receiver<bool>>,
) -> HarvestResult<CourseRecord> {
    let _slot = tokio::select! {
        biased;
        _ = cancelled(&mut cancel) => return Err(cancelled_error()),
        slot = Arc::clone(&ctx.semaphore).acquire_owned() => {
            slot.map_err(|_| HarvestError::transport("browser slots closed"))?
        }
    };

    let mut deadline = Instant::now() + ctx.settings.task_timeout;
    if let Some(run_deadline) = ctx.run_deadline {
        deadline = deadline.min(run_deadline);
    }

    let progress = index as f64 / ctx.total as f64 * 100.0;
    info!(
        "Processing playlist {}/{} ({:.1}%): {}",
        index + 1,
        ctx.total,
        progress,
        playlist
    );

    let launch = within_deadline(deadline, "browser launch", ctx.launcher.launch(deadline));
    let mut driver = tokio::select! {
        biased;
        _ = cancelled(&mut cancel) => return Err(cancelled_error()),
        driver = launch => driver?,
    };

    let outcome = tokio::select! {
        biased;
        _ = cancelled(&mut cancel) => Err(cancelled_error()),
        outcome = process_playlist(driver.as_mut(), ctx, playlist, deadline) => outcome,
    };
    driver.close().await;
    outcome
}

/// harvest → sanitize → extract (paced, retried) → reconcile, all under `deadline`.
async fn process_playlist(
    driver: &mut dyn BrowserDriver,
    ctx: &TaskContext,
    playlist: &PlaylistRef,
    deadline: Instant,
) -> HarvestResult<CourseRecord> {
    let settings = ctx.settings.as_ref();
    let harvested =
        harvest_playlist(driver, &settings.site_base, playlist, &settings.timing).await?;
    let payload = sanitize_html(&harvested.raw_html);
    let extraction = extract_with_retry(
        ctx.extractor.as_ref(),
        &ctx.ticker,
        settings,
        &payload,
        deadline,
    )
    .await?;
    reconcile(playlist, &harvested.observed, extraction)
}

/// Every attempt waits for a fresh pacing permit, retries included. Only
/// throttle errors are retried, with `LinearBackoff`.
async fn extract_with_retry(
    extractor: &dyn StructuredExtractor,
    ticker: &PacingTicker,
    settings: &HarvestSettings,
    payload: &str,
    deadline: Instant,
) -> HarvestResult<CourseExtraction> {
    let policy = LinearBackoff::new(settings.backoff_step, settings.max_attempts);
    let max_attempts = settings.max_attempts;
    let mut retry = 0u32;

    let attempt = move || async move {
        ticker.acquire().await;
        extractor.extract(payload).await.map_err(|e| {
            if e.is_throttle() {
                backoff::Error::transient(e)
            } else {
                backoff::Error::permanent(e)
            }
        })
    };
    let on_throttle = move |e: HarvestError, wait: Duration| {
        retry += 1;
        warn!(
            "Rate limit hit ({}), waiting {}s before retry {}/{}",
            e,
            wait.as_secs(),
            retry,
            max_attempts.saturating_sub(1)
        );
    };

    within_deadline(
        deadline,
        "extract",
        backoff::future::retry_notify(policy, attempt, on_throttle),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scraping::harvest::VIDEO_ANCHOR_SELECTOR;
    use crate::scraping::scripted::{DriverCall, ScriptedDriver, ScriptedLauncher};
    use crate::tools::extract::ScriptedExtractor;
    use std::sync::Mutex;

    fn settings(k: usize) -> HarvestSettings {
        HarvestSettings {
            max_concurrent: k,
            task_timeout: Duration::from_secs(300),
            site_base: Url::parse("https://www.youtube.com").unwrap(),
            timing: ScrollTiming {
                settle: Duration::from_secs(1),
                pause: Duration::from_secs(2),
            },
            pacing_period: Duration::from_millis(100),
            max_attempts: 3,
            backoff_step: Duration::from_secs(4),
        }
    }

    fn three_video_launcher() -> ScriptedLauncher {
        ScriptedLauncher::new(|_| {
            ScriptedDriver::new().with_hrefs(
                VIDEO_ANCHOR_SELECTOR,
                &[&["/watch?v=A", "/watch?v=B", "/watch?v=C"]],
            )
        })
    }

    /// Playlist panel that never stops growing: counts 1, 2, 3, ...
    fn endless_driver() -> ScriptedDriver {
        let hrefs: Vec<String> = (0..100).map(|i| format!("/watch?v={i}")).collect();
        let passes: Vec<Vec<&str>> = (1..=hrefs.len())
            .map(|n| hrefs[..n].iter().map(String::as_str).collect())
            .collect();
        let slices: Vec<&[&str]> = passes.iter().map(Vec::as_slice).collect();
        ScriptedDriver::new().with_hrefs(VIDEO_ANCHOR_SELECTOR, &slices)
    }

    fn playlists(n: usize) -> Vec<PlaylistRef> {
        (0..n)
            .map(|i| PlaylistRef::new(format!("/playlist?list=PL{i}")))
            .collect()
    }

    const THREE_VIDEOS: &str = r#"{"title":"Course","videos":[
        {"url":"/watch?v=A","title":"One","view_count":300,"taxonomy":"Physics"},
        {"url":"/watch?v=B","title":"Two","view_count":200},
        {"url":"/watch?v=C","title":"Three","view_count":100,"taxonomy":"Other"}]}"#;

    #[tokio::test(start_paused = true)]
    async fn test_empty_input_returns_empty() {
        let harvester = BatchHarvester::new(
            Arc::new(three_video_launcher()),
            Arc::new(ScriptedExtractor::new(|_, _| Ok(THREE_VIDEOS.to_string()))),
            settings(5),
        );
        assert!(harvester.run(Vec::new()).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_then_success_backs_off_linearly() {
        let extractor = Arc::new(ScriptedExtractor::new(|_, i| match i {
            0 | 1 => Err(HarvestError::http(429, "Too Many Requests")),
            _ => Ok(THREE_VIDEOS.to_string()),
        }));
        let harvester = BatchHarvester::new(
            Arc::new(three_video_launcher()),
            extractor.clone(),
            settings(5),
        );

        let courses = harvester
            .run(vec![PlaylistRef::new("/playlist?list=PL1")])
            .await;
        assert_eq!(courses.len(), 1);
        assert_eq!(courses[0].videos.len(), 3);

        let at = extractor.dispatch_instants();
        assert_eq!(at.len(), 3);
        // 4s then 8s of backoff, each followed by a fresh pacing permit.
        let first_gap = at[1] - at[0];
        let second_gap = at[2] - at[1];
        assert!(first_gap >= Duration::from_secs(4) && first_gap <= Duration::from_millis(4100));
        assert!(second_gap >= Duration::from_secs(8) && second_gap <= Duration::from_millis(8100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_exhaustion_abandons_task() {
        let extractor = Arc::new(ScriptedExtractor::new(|_, _| {
            Err(HarvestError::http(429, "Too Many Requests"))
        }));
        let harvester = BatchHarvester::new(
            Arc::new(three_video_launcher()),
            extractor.clone(),
            settings(5),
        );
        let out = harvester
            .run_detailed(vec![PlaylistRef::new("/playlist?list=PL1")])
            .await;
        assert!(out.courses.is_empty());
        assert_eq!(extractor.calls(), 3);
        assert_eq!(out.summary.abandoned.get("transport"), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_throttle_failure_is_not_retried() {
        let extractor = Arc::new(ScriptedExtractor::new(|_, _| {
            Err(HarvestError::http(500, "internal"))
        }));
        let harvester = BatchHarvester::new(
            Arc::new(three_video_launcher()),
            extractor.clone(),
            settings(5),
        );
        let courses = harvester
            .run(vec![PlaylistRef::new("/playlist?list=PL1")])
            .await;
        assert!(courses.is_empty());
        assert_eq!(extractor.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_abandons_task_and_closes_context() {
        let launcher = Arc::new(ScriptedLauncher::new(|_| endless_driver()));
        let mut s = settings(5);
        s.task_timeout = Duration::from_secs(30);
        let harvester = BatchHarvester::new(
            launcher.clone(),
            Arc::new(ScriptedExtractor::new(|_, _| Ok(THREE_VIDEOS.to_string()))),
            s,
        );
        let out = harvester
            .run_detailed(vec![PlaylistRef::new("/playlist?list=PL1")])
            .await;
        assert!(out.courses.is_empty());
        assert_eq!(out.summary.abandoned.get("deadline"), Some(&1));
        assert_eq!(launcher.live(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_deadline_abandons_in_flight_tasks() {
        let launcher = Arc::new(ScriptedLauncher::new(|_| endless_driver()));
        let harvester = BatchHarvester::new(
            launcher.clone(),
            Arc::new(ScriptedExtractor::new(|_, _| Ok(THREE_VIDEOS.to_string()))),
            settings(2),
        )
        .with_run_deadline(Instant::now() + Duration::from_secs(10));

        let started = Instant::now();
        let out = harvester.run_detailed(playlists(3)).await;

        assert!(out.courses.is_empty());
        assert_eq!(out.summary.abandoned.get("deadline"), Some(&3));
        assert_eq!(launcher.live(), 0);
        // The third task gets its slot only after the first two give up at 10s.
        assert!(started.elapsed() <= Duration::from_secs(11));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_closes_contexts() {
        let logs: Arc<Mutex<Vec<Arc<Mutex<Vec<DriverCall>>>>>> = Arc::default();
        let factory_logs = Arc::clone(&logs);
        let launcher = Arc::new(ScriptedLauncher::new(move |_| {
            let driver = endless_driver();
            factory_logs.lock().unwrap().push(driver.call_log());
            driver
        }));
        let (tx, rx) = watch::channel(false);
        let harvester = BatchHarvester::new(
            launcher.clone(),
            Arc::new(ScriptedExtractor::new(|_, _| Ok(THREE_VIDEOS.to_string()))),
            settings(2),
        )
        .with_cancellation(rx);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            let _ = tx.send(true);
        });
        let out = harvester.run_detailed(playlists(3)).await;

        assert!(out.courses.is_empty());
        assert_eq!(out.summary.abandoned.get("deadline"), Some(&3));
        // The queued third playlist never launched a browser.
        assert_eq!(launcher.launched(), 2);
        assert_eq!(launcher.live(), 0);
        let logs = logs.lock().unwrap();
        assert_eq!(logs.len(), 2);
        for log in logs.iter() {
            assert_eq!(log.lock().unwrap().last(), Some(&DriverCall::Close));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_before_start_launches_nothing() {
        let launcher = Arc::new(three_video_launcher());
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let harvester = BatchHarvester::new(
            launcher.clone(),
            Arc::new(ScriptedExtractor::new(|_, _| Ok(THREE_VIDEOS.to_string()))),
            settings(2),
        )
        .with_cancellation(rx);

        let out = harvester.run_detailed(playlists(2)).await;
        assert!(out.courses.is_empty());
        assert_eq!(out.summary.abandoned.get("deadline"), Some(&2));
        assert_eq!(launcher.launched(), 0);
    }

    #[test]
    fn test_linear_backoff_sequence() {
        let mut policy = LinearBackoff::new(Duration::from_secs(4), 3);
        assert_eq!(policy.next_backoff(), Some(Duration::from_secs(4)));
        assert_eq!(policy.next_backoff(), Some(Duration::from_secs(8)));
        assert_eq!(policy.next_backoff(), None);
        policy.reset();
        assert_eq!(policy.next_backoff(), Some(Duration::from_secs(4)));

        assert_eq!(LinearBackoff::new(Duration::from_secs(4), 1).next_backoff(), None);
        assert_eq!(LinearBackoff::new(Duration::from_secs(4), 0).next_backoff(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_refs_are_processed_once() {
        let launcher = Arc::new(three_video_launcher());
        let harvester = BatchHarvester::new(
            launcher.clone(),
            Arc::new(ScriptedExtractor::new(|_, _| Ok(THREE_VIDEOS.to_string()))),
            settings(5),
        );
        let p = PlaylistRef::new("/playlist?list=PL1");
        let courses = harvester.run(vec![p.clone(), p]).await;
        assert_eq!(courses.len(), 1);
        assert_eq!(launcher.launched(), 1);
    }
}
