pub mod browser_manager;
pub mod driver;
pub mod enumerate;
pub mod harvest;
pub mod sanitize;
pub mod scripted;

use std::time::Duration;

use crate::core::config::BrowserConfig;

/// Pauses used while scrolling dynamically rendered pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrollTiming {
    /// Wait after the initial navigation.
    pub settle: Duration,
    /// Wait after each scroll.
    pub pause: Duration,
}

impl ScrollTiming {
    pub fn channel(cfg: &BrowserConfig) -> Self {
        Self {
            settle: cfg.resolve_channel_settle(),
            pause: cfg.resolve_scroll_pause(),
        }
    }

    pub fn playlist(cfg: &BrowserConfig) -> Self {
        Self {
            settle: cfg.resolve_playlist_settle(),
            pause: cfg.resolve_scroll_pause(),
        }
    }
}
