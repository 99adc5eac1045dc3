//! Viewer-retention summary over an exported course CSV.
//!
//! Retention of a course at position `p` is the view count at `p` as a
//! percentage of the first video's views, capped so it never rises above the
//! value at `p - 1`. The first video is 100% by definition.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use tracing::{debug, warn};

use crate::core::types::{CourseRecord, VideoRecord};

#[derive(Debug, Deserialize)]
struct CsvRow {
    #[serde(rename = "CourseURL")]
    course_url: String,
    #[serde(rename = "CourseTitle")]
    course_title: String,
    #[serde(rename = "Position")]
    position: u32,
    #[serde(rename = "VideoURL")]
    video_url: String,
    #[serde(rename = "VideoTitle")]
    video_title: String,
    #[serde(rename = "ViewCount")]
    view_count: u64,
    #[serde(rename = "Taxonomy", default)]
    taxonomy: String,
}

/// Read back a CSV written by `write_courses_csv`, grouping rows by course URL.
pub fn load_courses_csv(path: &Path) -> Result<Vec<CourseRecord>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;

    let mut courses: BTreeMap<String, CourseRecord> = BTreeMap::new();
    for (line, row) in reader.deserialize::<CsvRow>().enumerate() {
        let row = row.with_context(|| format!("{}: bad row {}", path.display(), line + 2))?;
        let taxonomy = match row.taxonomy.trim() {
            "" => None,
            label => match label.parse() {
                Ok(t) => Some(t),
                Err(e) => {
                    warn!("{}: row {}: {}", path.display(), line + 2, e);
                    None
                }
            },
        };
        let course = courses
            .entry(row.course_url.clone())
            .or_insert_with(|| CourseRecord {
                url: row.course_url.clone(),
                title: row.course_title.clone(),
                videos: Vec::new(),
            });
        course.videos.push(VideoRecord {
            url: row.video_url,
            title: row.video_title,
            view_count: row.view_count,
            position: row.position,
            taxonomy,
        });
    }

    let mut courses: Vec<CourseRecord> = courses.into_values().collect();
    for course in &mut courses {
        course.videos.sort_by_key(|v| v.position);
    }
    debug!("Loaded {} courses from {}", courses.len(), path.display());
    Ok(courses)
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetentionPoint {
    pub position: u32,
    pub view_count: u64,
    /// Views as a percentage of the first video's views.
    pub raw_pct: f64,
    /// `min(raw_pct, previous retention_pct)`.
    pub retention_pct: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CourseRetention {
    pub url: String,
    pub title: String,
    pub points: Vec<RetentionPoint>,
}

impl CourseRetention {
    pub fn final_retention(&self) -> f64 {
        self.points.last().map(|p| p.retention_pct).unwrap_or(100.0)
    }
}

/// `None` when the course is empty or its first video has no views.
pub fn course_retention(course: &CourseRecord) -> Option<CourseRetention> {
    let mut videos: Vec<&VideoRecord> = course.videos.iter().collect();
    videos.sort_by_key(|v| v.position);

    let first_views = videos.first()?.view_count;
    if first_views == 0 {
        return None;
    }

    let mut points = Vec::with_capacity(videos.len());
    let mut previous = 100.0_f64;
    for (i, video) in videos.iter().enumerate() {
        let raw_pct = video.view_count as f64 * 100.0 / first_views as f64;
        let retention_pct = if i == 0 { 100.0 } else { raw_pct.min(previous) };
        previous = retention_pct;
        points.push(RetentionPoint {
            position: video.position,
            view_count: video.view_count,
            raw_pct,
            retention_pct,
        });
    }

    Some(CourseRetention {
        url: course.url.clone(),
        title: course.title.clone(),
        points,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetentionReport {
    pub courses: Vec<CourseRetention>,
    /// Every course in the input, analysed or not.
    pub total_courses: usize,
    pub total_videos: usize,
    pub average_final_retention: f64,
    pub median_final_retention: f64,
    /// Median capped retention across courses that reach each position.
    pub median_by_position: BTreeMap<u32, f64>,
}

fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

pub fn summarize(courses: &[CourseRecord]) -> RetentionReport {
    let analysed: Vec<CourseRetention> = courses
        .iter()
        .filter_map(|c| {
            let r = course_retention(c);
            if r.is_none() {
                debug!("Skipping {}: no baseline views", c.url);
            }
            r
        })
        .collect();

    let mut finals: Vec<f64> = analysed.iter().map(CourseRetention::final_retention).collect();
    let average_final_retention = if finals.is_empty() {
        0.0
    } else {
        finals.iter().sum::<f64>() / finals.len() as f64
    };
    let median_final_retention = median(&mut finals);

    let mut by_position: BTreeMap<u32, Vec<f64>> = BTreeMap::new();
    for course in &analysed {
        for point in &course.points {
            by_position
                .entry(point.position)
                .or_default()
                .push(point.retention_pct);
        }
    }
    let median_by_position = by_position
        .into_iter()
        .map(|(pos, mut values)| (pos, median(&mut values)))
        .collect();

    RetentionReport {
        total_courses: courses.len(),
        total_videos: courses.iter().map(|c| c.videos.len()).sum(),
        courses: analysed,
        average_final_retention,
        median_final_retention,
        median_by_position,
    }
}

impl fmt::Display for RetentionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Total courses: {}", self.total_courses)?;
        writeln!(f, "Total videos: {}", self.total_videos)?;
        writeln!(
            f,
            "Average final retention: {:.1}%",
            self.average_final_retention
        )?;
        writeln!(
            f,
            "Median final retention: {:.1}%",
            self.median_final_retention
        )?;
        writeln!(f)?;
        writeln!(f, "Position | Median retention")?;
        for (pos, value) in &self.median_by_position {
            writeln!(f, "{:>8} | {:.1}%", pos, value)?;
        }
        Ok(())
    }
}
