use anyhow::{bail, Context};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use ocw_harvest::batch_harvest::{BatchHarvester, HarvestSettings};
use ocw_harvest::browser_manager::{BrowserLauncher, ChromeLauncher};
use ocw_harvest::core::config::{load_harvest_config, Credentials};
use ocw_harvest::enumerate::enumerate_playlists;
use ocw_harvest::export::{output_filename, sort_courses, write_courses_csv};
use ocw_harvest::extract::GeminiExtractor;
use ocw_harvest::retention::{load_courses_csv, summarize};
use ocw_harvest::scraping::ScrollTiming;
use ocw_harvest::{AppState, HarvestError, HarvestResult, PlaylistRef};

const USAGE: &str = "usage: ocw-harvest [--channel URL] [--out-dir DIR] [--concurrency K]\n       ocw-harvest summarize FILE";

#[derive(Debug, PartialEq)]
enum Command {
    Harvest,
    Summarize(PathBuf),
}

#[derive(Debug, PartialEq)]
struct CliArgs {
    command: Command,
    channel: Option<String>,
    out_dir: Option<PathBuf>,
    concurrency: Option<usize>,
}

/// Accepts `--flag value` and `--flag=value`.
fn parse_args(args: impl IntoIterator<Item = String>) -> anyhow::Result<CliArgs> {
    let mut parsed = CliArgs {
        command: Command::Harvest,
        channel: None,
        out_dir: None,
        concurrency: None,
    };
    let mut args = args.into_iter();

    while let Some(a) = args.next() {
        let (flag, inline) = match a.split_once('=') {
            Some((f, v)) if f.starts_with("--") => (f.to_string(), Some(v.to_string())),
            _ => (a.clone(), None),
        };
        let mut value = |name: &str| -> anyhow::Result<String> {
            match inline.clone().or_else(|| args.next()) {
                Some(v) => Ok(v),
                None => bail!("{} needs a value\n{}", name, USAGE),
            }
        };
        match flag.as_str() {
            "--channel" => parsed.channel = Some(value("--channel")?),
            "--out-dir" => parsed.out_dir = Some(PathBuf::from(value("--out-dir")?)),
            "--concurrency" => {
                let raw = value("--concurrency")?;
                let k: usize = raw
                    .parse()
                    .with_context(|| format!("--concurrency expects a number, got '{}'", raw))?;
                if k == 0 {
                    bail!("--concurrency must be at least 1");
                }
                parsed.concurrency = Some(k);
            }
            "summarize" => {
                let Some(file) = args.next() else {
                    bail!("summarize needs a CSV file\n{}", USAGE);
                };
                parsed.command = Command::Summarize(PathBuf::from(file));
            }
            "-h" | "--help" => bail!("{}", USAGE),
            other => bail!("unknown argument '{}'\n{}", other, USAGE),
        }
    }
    Ok(parsed)
}

/// Enumerate the channel in one dedicated browser context bounded by `deadline`.
async fn enumerate_channel(
    launcher: &dyn BrowserLauncher,
    channel_url: &str,
    timing: &ScrollTiming,
    deadline: Instant,
) -> HarvestResult<Vec<PlaylistRef>> {
    let mut driver = launcher.launch(deadline).await?;
    let result = enumerate_playlists(driver.as_mut(), channel_url, timing).await;
    driver.close().await;
    result
}

async fn run_harvest(args: CliArgs) -> anyhow::Result<()> {
    let mut config = load_harvest_config();
    if let Some(channel) = args.channel {
        config.browser.channel_url = Some(channel);
    }
    if let Some(k) = args.concurrency {
        config.browser.max_concurrent = Some(k);
    }
    if let Some(dir) = args.out_dir {
        config.output.dir = Some(dir.to_string_lossy().into_owned());
    }

    // Missing credentials abort before any browser is started.
    let credentials = Credentials::from_env()?;
    let state = AppState::new(config, credentials)?;

    let launcher = Arc::new(ChromeLauncher::discover(
        state.config.browser.resolve_chrome_executable().as_deref(),
    )?);
    info!("Using browser at {}", launcher.executable());

    let channel_url = state.config.browser.resolve_channel_url();
    let deadline = Instant::now() + state.config.browser.resolve_enumerate_timeout();
    info!("Enumerating playlists on {}", channel_url);
    let playlists = enumerate_channel(
        launcher.as_ref(),
        &channel_url,
        &ScrollTiming::channel(&state.config.browser),
        deadline,
    )
    .await
    .context("playlist enumeration failed")?;
    info!("Found {} playlists", playlists.len());

    let settings = HarvestSettings::from_config(&state.config)?;
    let extractor = Arc::new(GeminiExtractor::from_state(&state));
    let (stop_tx, stop_rx) = watch::channel(false);
    let harvester =
        BatchHarvester::new(launcher, extractor, settings).with_cancellation(stop_rx.clone());

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; closing browsers and abandoning in-flight playlists");
            let _ = stop_tx.send(true);
        }
    });
    let outcome = harvester.run_detailed(playlists).await;
    let interrupted = *stop_rx.borrow();

    let mut courses = outcome.courses;
    sort_courses(&mut courses);
    if tracing::enabled!(tracing::Level::DEBUG) {
        debug!("Courses:\n{}", serde_json::to_string_pretty(&courses)?);
    }

    let out_dir = state.config.output.resolve_dir();
    std::fs::create_dir_all(&out_dir)
        .with_context(|| format!("creating output directory {}", out_dir.display()))?;
    let path = out_dir.join(output_filename(chrono::Local::now()));
    write_courses_csv(&courses, &path)?;

    if interrupted {
        bail!(
            "run interrupted after {}/{} playlists; partial results in {}",
            outcome.summary.emitted,
            outcome.summary.total,
            path.display()
        );
    }
    info!(
        "✅ Harvested {}/{} playlists into {}",
        outcome.summary.emitted,
        outcome.summary.total,
        path.display()
    );
    Ok(())
}

fn run_summarize(path: &Path) -> anyhow::Result<()> {
    let courses = load_courses_csv(path)?;
    if courses.is_empty() {
        return Err(HarvestError::Config(format!("{} holds no course rows", path.display())).into());
    }
    let report = summarize(&courses);
    println!("{}", report);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,chromiumoxide=warn"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let args = parse_args(std::env::args().skip(1))?;
    if let Command::Summarize(path) = &args.command {
        return run_summarize(path);
    }
    run_harvest(args).await
}
