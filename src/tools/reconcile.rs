//! Reconciler: overlay harvested positions onto extracted attributes.
//!
//! Position is never taken from the model. Extracted videos are zipped with
//! the observed list **by index**: record `i` gets title, views and taxonomy
//! from `extracted[i]` and position from `observed[i]`. There is no join on
//! URL, so a model that reorders or drops a video silently shifts positions.
//! URL disagreements are counted and logged, not repaired.

use std::collections::HashSet;
use tracing::warn;

use crate::core::error::{HarvestError, HarvestResult};
use crate::core::types::{CourseExtraction, CourseRecord, ObservedVideo, PlaylistRef, VideoRecord};

pub fn reconcile(
    playlist: &PlaylistRef,
    observed: &[ObservedVideo],
    extracted: CourseExtraction,
) -> HarvestResult<CourseRecord> {
    if extracted.videos.len() != observed.len() {
        return Err(HarvestError::Reconciliation(format!(
            "{}: extractor returned {} videos, browser observed {}",
            playlist,
            extracted.videos.len(),
            observed.len()
        )));
    }

    let mut urls = HashSet::with_capacity(observed.len());
    let mut mismatched = 0usize;
    let mut videos = Vec::with_capacity(observed.len());

    for (seen, video) in observed.iter().zip(extracted.videos) {
        if !urls.insert(video.url.clone()) {
            return Err(HarvestError::Reconciliation(format!(
                "{}: extractor returned {} more than once",
                playlist, video.url
            )));
        }
        if !same_video(&seen.url, &video.url) {
            mismatched += 1;
        }
        videos.push(VideoRecord {
            url: video.url,
            title: video.title,
            view_count: video.view_count,
            position: seen.position,
            taxonomy: video.taxonomy,
        });
    }

    if mismatched > 0 {
        warn!(
            "{}: {} of {} extracted URLs differ from the observed order",
            playlist,
            mismatched,
            videos.len()
        );
    }

    Ok(CourseRecord {
        url: playlist.path().to_string(),
        title: extracted.title,
        videos,
    })
}

/// Watch hrefs inside a playlist carry `&list=…&index=…`; compare on the
/// `v=` id only.
fn same_video(observed: &str, extracted: &str) -> bool {
    fn video_id(href: &str) -> &str {
        href.split_once("v=")
            .map(|(_, rest)| rest.split('&').next().unwrap_or(rest))
            .unwrap_or(href)
    }
    video_id(observed) == video_id(extracted)
}
