use std::path::{Path, PathBuf};
use std::time::Duration;

use super::error::{HarvestError, HarvestResult};

// ---------------------------------------------------------------------------
// HarvestConfig: file-based config loader (ocw-harvest.json) with env-var fallback
// ---------------------------------------------------------------------------

pub const ENV_CONFIG_PATH: &str = "OCW_HARVEST_CONFIG";
pub const ENV_CHROME_EXECUTABLE: &str = "CHROME_EXECUTABLE";
pub const ENV_GEMINI_API_KEY: &str = "GEMINI_API_KEY";
pub const ENV_KAGGLE_USERNAME: &str = "KAGGLE_USERNAME";
pub const ENV_KAGGLE_KEY: &str = "KAGGLE_KEY";

pub const DEFAULT_CHANNEL_URL: &str = "https://www.youtube.com/@mitocw/courses?app=desktop";
pub const DEFAULT_SITE_BASE_URL: &str = "https://www.youtube.com";
/// Gemini's OpenAI-compatible surface.
pub const DEFAULT_LLM_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/openai";
pub const DEFAULT_LLM_MODEL: &str = "gemini-1.5-flash";

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.parse().ok())
}

fn non_blank(v: &Option<String>) -> Option<String> {
    v.as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Browser-side knobs (mirrors the `browser` key in ocw-harvest.json).
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct BrowserConfig {
    /// Channel courses page to enumerate.
    pub channel_url: Option<String>,
    /// Origin that relative playlist hrefs are resolved against.
    pub site_base_url: Option<String>,
    /// Browser-concurrency cap (K). Default: 5.
    pub max_concurrent: Option<usize>,
    /// Per-playlist task deadline. Default: 300 s.
    pub task_timeout_secs: Option<u64>,
    /// Deadline for the whole enumeration scroll. Default: 120 s.
    pub enumerate_timeout_secs: Option<u64>,
    /// Pause after navigating to the channel page. Default: 2000 ms.
    pub channel_settle_ms: Option<u64>,
    /// Pause after navigating to a playlist page. Default: 1000 ms.
    pub playlist_settle_ms: Option<u64>,
    /// Pause after each scroll. Default: 2000 ms.
    pub scroll_pause_ms: Option<u64>,
    pub chrome_executable: Option<String>,
}

impl BrowserConfig {
    /// Channel URL: JSON field → `OCW_CHANNEL_URL` env var → MIT OpenCourseWare courses tab.
    pub fn resolve_channel_url(&self) -> String {
        non_blank(&self.channel_url)
            .or_else(|| env_string("OCW_CHANNEL_URL"))
            .unwrap_or_else(|| DEFAULT_CHANNEL_URL.to_string())
    }

    pub fn resolve_site_base_url(&self) -> String {
        non_blank(&self.site_base_url)
            .or_else(|| env_string("OCW_SITE_BASE_URL"))
            .unwrap_or_else(|| DEFAULT_SITE_BASE_URL.to_string())
    }

    /// Concurrency cap: JSON field → `OCW_MAX_BROWSERS` env var → 5. Never below 1.
    pub fn resolve_max_concurrent(&self) -> usize {
        self.max_concurrent
            .or_else(|| env_parse("OCW_MAX_BROWSERS"))
            .unwrap_or(5)
            .max(1)
    }

    pub fn resolve_task_timeout(&self) -> Duration {
        Duration::from_secs(
            self.task_timeout_secs
                .or_else(|| env_parse("OCW_TASK_TIMEOUT_SECS"))
                .unwrap_or(300),
        )
    }

    pub fn resolve_enumerate_timeout(&self) -> Duration {
        Duration::from_secs(
            self.enumerate_timeout_secs
                .or_else(|| env_parse("OCW_ENUMERATE_TIMEOUT_SECS"))
                .unwrap_or(120),
        )
    }

    pub fn resolve_channel_settle(&self) -> Duration {
        Duration::from_millis(self.channel_settle_ms.unwrap_or(2000))
    }

    pub fn resolve_playlist_settle(&self) -> Duration {
        Duration::from_millis(self.playlist_settle_ms.unwrap_or(1000))
    }

    pub fn resolve_scroll_pause(&self) -> Duration {
        Duration::from_millis(self.scroll_pause_ms.unwrap_or(2000))
    }

    /// Explicit browser executable: JSON field → `CHROME_EXECUTABLE`, only when the path exists.
    /// `None` means auto-discovery (see `scraping::browser_manager::find_chrome_executable()`).
    pub fn resolve_chrome_executable(&self) -> Option<String> {
        non_blank(&self.chrome_executable)
            .or_else(|| env_string(ENV_CHROME_EXECUTABLE))
            .filter(|p| Path::new(p).exists())
    }
}

/// Extractor and pacing knobs (mirrors the `llm` key in ocw-harvest.json).
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct LlmConfig {
    /// OpenAI-compatible endpoint root, e.g. the Gemini `/v1beta/openai` surface.
    pub base_url: Option<String>,
    pub model: Option<String>,
    /// Pacing ticker rate. Default: 10 permits/s (≈600 RPM).
    pub requests_per_second: Option<u32>,
    /// Attempts per extraction including the first. Default: 3.
    pub max_attempts: Option<u32>,
    /// Linear backoff step; retry `n` waits `n × step`. Default: 4 s.
    pub backoff_step_secs: Option<u64>,
    /// HTTP timeout of a single completion request. Default: 120 s.
    pub request_timeout_secs: Option<u64>,
}

impl LlmConfig {
    /// Endpoint: JSON field → `GEMINI_BASE_URL` env var → Gemini OpenAI-compatible root.
    pub fn resolve_base_url(&self) -> String {
        non_blank(&self.base_url)
            .or_else(|| env_string("GEMINI_BASE_URL"))
            .unwrap_or_else(|| DEFAULT_LLM_BASE_URL.to_string())
    }

    /// Model: JSON field → `GEMINI_MODEL` env var → `gemini-1.5-flash`.
    pub fn resolve_model(&self) -> String {
        non_blank(&self.model)
            .or_else(|| env_string("GEMINI_MODEL"))
            .unwrap_or_else(|| DEFAULT_LLM_MODEL.to_string())
    }

    /// Interval between pacing permits.
    pub fn resolve_pacing_period(&self) -> Duration {
        let rps = self
            .requests_per_second
            .or_else(|| env_parse("OCW_LLM_RPS"))
            .unwrap_or(10)
            .max(1);
        Duration::from_millis(1000 / rps as u64).max(Duration::from_millis(1))
    }

    pub fn resolve_max_attempts(&self) -> u32 {
        self.max_attempts.unwrap_or(3).max(1)
    }

    pub fn resolve_backoff_step(&self) -> Duration {
        Duration::from_secs(self.backoff_step_secs.unwrap_or(4))
    }

    pub fn resolve_request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.unwrap_or(120))
    }
}

#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct OutputConfig {
    pub dir: Option<String>,
}

impl OutputConfig {
    /// Output directory: JSON field → `OCW_OUTPUT_DIR` env var → current directory.
    pub fn resolve_dir(&self) -> PathBuf {
        non_blank(&self.dir)
            .or_else(|| env_string("OCW_OUTPUT_DIR"))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// Top-level config loaded from `ocw-harvest.json`.
#[derive(serde::Deserialize, Default, Clone, Debug)]
#[serde(default)]
pub struct HarvestConfig {
    pub browser: BrowserConfig,
    pub llm: LlmConfig,
    pub output: OutputConfig,
}

fn config_candidates() -> Vec<PathBuf> {
    let mut v = vec![
        PathBuf::from("ocw-harvest.json"),
        PathBuf::from("../ocw-harvest.json"),
    ];
    if let Some(home) = dirs::home_dir() {
        v.push(home.join(".ocw-harvest").join("config.json"));
    }
    if let Some(env_path) = env_string(ENV_CONFIG_PATH) {
        v.insert(0, PathBuf::from(env_path));
    }
    v
}

/// Load `ocw-harvest.json` from standard locations.
///
/// Search order (first found wins):
/// 1. `OCW_HARVEST_CONFIG` env var path
/// 2. `./ocw-harvest.json`
/// 3. `../ocw-harvest.json`
/// 4. `~/.ocw-harvest/config.json`
///
/// Missing file → `HarvestConfig::default()` (all env-var fallbacks apply).
/// Parse error → log a warning, return `HarvestConfig::default()`.
pub fn load_harvest_config() -> HarvestConfig {
    for path in config_candidates() {
        if let Some(cfg) = load_config_file(&path) {
            return cfg;
        }
    }
    HarvestConfig::default()
}

/// `None` when the file does not exist; defaults when it exists but does not parse.
fn load_config_file(path: &Path) -> Option<HarvestConfig> {
    let contents = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str::<HarvestConfig>(&contents) {
        Ok(cfg) => {
            tracing::info!("ocw-harvest.json loaded from {}", path.display());
            Some(cfg)
        }
        Err(e) => {
            tracing::warn!(
                "ocw-harvest.json parse error at {}: {}; using defaults",
                path.display(),
                e
            );
            Some(HarvestConfig::default())
        }
    }
}

// ---------------------------------------------------------------------------

/// Secrets required before any browser is launched.
#[derive(Clone)]
pub struct Credentials {
    pub gemini_api_key: String,
    pub kaggle_username: String,
    pub kaggle_key: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("gemini_api_key", &"<redacted>")
            .field("kaggle_username", &self.kaggle_username)
            .field("kaggle_key", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    pub fn from_env() -> HarvestResult<Self> {
        Self::from_lookup(env_string)
    }

    /// Same checks as `from_env`, against an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> HarvestResult<Self> {
        let gemini_api_key = lookup(ENV_GEMINI_API_KEY).ok_or_else(|| {
            HarvestError::Config(format!("{} environment variable must be set", ENV_GEMINI_API_KEY))
        })?;
        let kaggle_username = lookup(ENV_KAGGLE_USERNAME);
        let kaggle_key = lookup(ENV_KAGGLE_KEY);
        match (kaggle_username, kaggle_key) {
            (Some(kaggle_username), Some(kaggle_key)) => Ok(Self {
                gemini_api_key,
                kaggle_username,
                kaggle_key,
            }),
            _ => Err(HarvestError::Config(format!(
                "{} and {} environment variables must be set",
                ENV_KAGGLE_USERNAME, ENV_KAGGLE_KEY
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned().filter(|v| !v.trim().is_empty())
    }

    #[test]
    fn test_credentials_all_present() {
        let creds = Credentials::from_lookup(lookup_from(&[
            ("GEMINI_API_KEY", "g-key"),
            ("KAGGLE_USERNAME", "someone"),
            ("KAGGLE_KEY", "k-key"),
        ]))
        .unwrap();
        assert_eq!(creds.gemini_api_key, "g-key");
        let dbg = format!("{:?}", creds);
        assert!(!dbg.contains("g-key"));
        assert!(!dbg.contains("k-key"));
    }

    #[test]
    fn test_credentials_missing_gemini_is_config_error() {
        let err = Credentials::from_lookup(lookup_from(&[
            ("KAGGLE_USERNAME", "someone"),
            ("KAGGLE_KEY", "k"),
        ]))
        .unwrap_err();
        assert!(matches!(err, HarvestError::Config(ref m) if m.contains("GEMINI_API_KEY")));
    }

    #[test]
    fn test_credentials_blank_kaggle_is_config_error() {
        let err = Credentials::from_lookup(lookup_from(&[
            ("GEMINI_API_KEY", "g"),
            ("KAGGLE_USERNAME", "someone"),
            ("KAGGLE_KEY", "   "),
        ]))
        .unwrap_err();
        assert!(matches!(err, HarvestError::Config(_)));
    }

    #[test]
    fn test_config_json_fields_override_defaults() {
        let cfg: HarvestConfig = serde_json::from_str(
            r#"{"browser":{"max_concurrent":2,"task_timeout_secs":30},"llm":{"requests_per_second":4,"max_attempts":5}}"#,
        )
        .unwrap();
        assert_eq!(cfg.browser.resolve_max_concurrent(), 2);
        assert_eq!(cfg.browser.resolve_task_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.llm.resolve_pacing_period(), Duration::from_millis(250));
        assert_eq!(cfg.llm.resolve_max_attempts(), 5);
        assert_eq!(cfg.llm.resolve_backoff_step(), Duration::from_secs(4));
    }

    #[test]
    fn test_zero_concurrency_is_clamped() {
        let cfg = BrowserConfig {
            max_concurrent: Some(0),
            ..Default::default()
        };
        assert_eq!(cfg.resolve_max_concurrent(), 1);
    }

    #[test]
    fn test_unparseable_config_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ocw-harvest.json");
        std::fs::write(&path, "{ not json").unwrap();
        let cfg = load_config_file(&path).unwrap();
        assert!(cfg.browser.max_concurrent.is_none());
        assert!(load_config_file(&dir.path().join("missing.json")).is_none());
    }
}
