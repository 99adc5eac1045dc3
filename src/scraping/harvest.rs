//! Playlist harvesting: scroll the video panel to exhaustion, recording each
//! video's position in first-observation order, then capture the DOM.
//!
//! Termination is **node-count stability**: the loop stops on the first pass
//! whose `/watch?v=` anchor count equals the previous pass. The playlist panel
//! keeps every anchor mounted, so a flat count means nothing new was loaded,
//! even when every anchor of the pass is a duplicate. Do not swap this for
//! the enumerator's new-URL rule (or vice versa): each one only works for its
//! own list type.

use std::collections::HashSet;
use tracing::debug;
use url::Url;

use super::driver::BrowserDriver;
use super::ScrollTiming;
use crate::core::error::HarvestResult;
use crate::core::types::{HarvestedPlaylist, ObservedVideo, PlaylistRef};

pub const VIDEO_ANCHOR_SELECTOR: &str = r#"a[href*="/watch?v="]"#;
pub const PLAYLIST_PANEL_SCROLL_SCRIPT: &str = "(() => { const p = document.querySelector('ytd-playlist-panel-renderer'); if (p) { p.scrollTo(0, p.scrollHeight); } })()";
pub const DOM_ROOT_SELECTOR: &str = "html";

/// Scroll the playlist's video panel until the anchor count stops changing.
///
/// Returns the observed videos (positions `1..=N`, distinct URLs) and the
/// final `outerHTML` of the document root.
pub async fn harvest_playlist(
    driver: &mut dyn BrowserDriver,
    site_base: &Url,
    playlist: &PlaylistRef,
    timing: &ScrollTiming,
) -> HarvestResult<HarvestedPlaylist> {
    let page_url = playlist.absolute_url(site_base)?;
    driver.navigate(page_url.as_str()).await?;
    driver.sleep(timing.settle).await?;

    let mut seen: HashSet<String> = HashSet::new();
    let mut observed: Vec<ObservedVideo> = Vec::new();
    let mut previous_count = 0usize;

    loop {
        let nodes = driver.query_nodes(VIDEO_ANCHOR_SELECTOR).await?;

        let mut position = observed.len() as u32 + 1;
        for href in nodes.iter().filter_map(|n| n.href()) {
            if seen.insert(href.to_string()) {
                observed.push(ObservedVideo {
                    url: href.to_string(),
                    position,
                });
                position += 1;
            }
        }

        debug!(
            "{}: {} anchors this pass, {} distinct videos",
            playlist,
            nodes.len(),
            observed.len()
        );

        if nodes.len() == previous_count {
            break;
        }
        previous_count = nodes.len();

        driver.evaluate(PLAYLIST_PANEL_SCROLL_SCRIPT).await?;
        driver.sleep(timing.pause).await?;
    }

    let raw_html = driver.outer_html(DOM_ROOT_SELECTOR).await?;

    Ok(HarvestedPlaylist {
        playlist: playlist.clone(),
        observed,
        raw_html,
    })
}
