use thiserror::Error;

/// Failure classes of the harvest pipeline.
///
/// Only `Config` is fatal to a run. Every other variant abandons the single
/// playlist task that raised it; the orchestrator logs it and moves on.
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error: {message}")]
    Transport {
        message: String,
        /// HTTP status when the failure came from an upstream HTTP response.
        status: Option<u16>,
    },

    #[error("schema error: {0}")]
    Schema(String),

    #[error("reconciliation error: {0}")]
    Reconciliation(String),

    #[error("deadline elapsed during {0}")]
    Deadline(String),
}

pub type HarvestResult<T> = std::result::Result<T, HarvestError>;

impl HarvestError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            status: None,
        }
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            status: Some(status),
        }
    }

    /// True when the upstream told us to slow down. A known HTTP status is
    /// authoritative; the message is only inspected when there is none.
    pub fn is_throttle(&self) -> bool {
        match self {
            Self::Transport {
                status: Some(status),
                ..
            } => *status == 429,
            Self::Transport {
                status: None,
                message,
            } => message.contains("429") || message.contains("RESOURCE_EXHAUSTED"),
            _ => false,
        }
    }

    /// Short label used in run summaries and log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Transport { .. } => "transport",
            Self::Schema(_) => "schema",
            Self::Reconciliation(_) => "reconciliation",
            Self::Deadline(_) => "deadline",
        }
    }
}
