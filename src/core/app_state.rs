use std::sync::Arc;

use super::config::{Credentials, HarvestConfig};
use super::error::HarvestResult;

/// Process-wide state shared by the enumerator, the orchestrator and the extractor.
#[derive(Clone)]
pub struct AppState {
    pub http_client: reqwest::Client,
    /// File-based config loaded from `ocw-harvest.json` (env-var fallback for all fields).
    pub config: Arc<HarvestConfig>,
    pub credentials: Arc<Credentials>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("credentials", &self.credentials)
            .finish()
    }
}

impl AppState {
    pub fn new(config: HarvestConfig, credentials: Credentials) -> HarvestResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(config.llm.resolve_request_timeout())
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| {
                super::error::HarvestError::Config(format!("failed to build HTTP client: {}", e))
            })?;
        Ok(Self {
            http_client,
            config: Arc::new(config),
            credentials: Arc::new(credentials),
        })
    }
}
