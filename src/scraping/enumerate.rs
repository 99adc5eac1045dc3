//! Playlist enumeration over the channel courses page.
//!
//! Termination is **new-URL stability**: scrolling stops on the first pass
//! that discovers no href not already seen. The courses grid is virtualized
//! and recycles anchor nodes, so the node count can stay flat while new
//! playlists are still being revealed; only new hrefs prove progress.
//! (The harvester deliberately uses a different rule, see `harvest.rs`.)

use std::collections::BTreeSet;
use tracing::{debug, info};

use super::driver::BrowserDriver;
use super::ScrollTiming;
use crate::core::error::HarvestResult;
use crate::core::types::{PlaylistRef, PLAYLIST_HREF_MARKER};

pub const PLAYLIST_ANCHOR_SELECTOR: &str = r#"a[href*="/playlist?list="]"#;
pub const DOCUMENT_SCROLL_SCRIPT: &str =
    "window.scrollTo(0, document.documentElement.scrollHeight)";

/// Scroll `channel_url` until no new playlist anchors appear; return the
/// distinct hrefs sorted ascending.
///
/// The caller bounds the whole operation through the driver's deadline;
/// any driver error (including deadline elapse) is returned as-is.
pub async fn enumerate_playlists(
    driver: &mut dyn BrowserDriver,
    channel_url: &str,
    timing: &ScrollTiming,
) -> HarvestResult<Vec<PlaylistRef>> {
    driver.navigate(channel_url).await?;
    driver.sleep(timing.settle).await?;

    let mut seen: BTreeSet<String> = BTreeSet::new();
    let mut total_duplicates = 0usize;
    let mut passes = 0usize;

    loop {
        passes += 1;
        let nodes = driver.query_nodes(PLAYLIST_ANCHOR_SELECTOR).await?;

        let mut new_found = false;
        for href in nodes.iter().filter_map(|n| n.href()) {
            if !href.contains(PLAYLIST_HREF_MARKER) {
                continue;
            }
            if seen.insert(href.to_string()) {
                new_found = true;
            } else {
                total_duplicates += 1;
            }
        }

        debug!(
            "Current unique URLs: {}, Duplicates found: {}",
            seen.len(),
            total_duplicates
        );

        if !new_found {
            break;
        }

        driver.evaluate(DOCUMENT_SCROLL_SCRIPT).await?;
        driver.sleep(timing.pause).await?;
    }

    info!(
        "📚 Enumerated {} playlists from {} after {} passes",
        seen.len(),
        channel_url,
        passes
    );

    // BTreeSet iteration is already the canonical lexicographic order.
    Ok(seen.into_iter().map(PlaylistRef::new).collect())
}
