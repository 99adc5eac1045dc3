//! CSV sink for harvested course records.

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone};
use std::fs::File;
use std::path::Path;
use tracing::info;

use crate::core::types::CourseRecord;

pub const CSV_HEADER: [&str; 7] = [
    "CourseURL",
    "CourseTitle",
    "Position",
    "VideoURL",
    "VideoTitle",
    "ViewCount",
    "Taxonomy",
];

/// `mit_courses_YYYY-MM-DD_HHMMSS.csv` for the given wall-clock time.
pub fn output_filename<Tz: TimeZone>(now: DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("mit_courses_{}.csv", now.format("%Y-%m-%d_%H%M%S"))
}

/// Order courses by playlist URL and each course's videos by position.
pub fn sort_courses(courses: &mut [CourseRecord]) {
    courses.sort_by(|a, b| a.url.cmp(&b.url));
    for course in courses.iter_mut() {
        course.videos.sort_by_key(|v| v.position);
    }
}

/// One row per (course, video); an absent taxonomy is written as an empty cell.
pub fn write_courses_csv(courses: &[CourseRecord], path: &Path) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = csv::Writer::from_writer(file);
    writer.write_record(CSV_HEADER)?;

    let mut rows = 0usize;
    for course in courses {
        for video in &course.videos {
            let taxonomy = video.taxonomy.map(|t| t.label()).unwrap_or("");
            writer.write_record([
                course.url.as_str(),
                course.title.as_str(),
                &video.position.to_string(),
                video.url.as_str(),
                video.title.as_str(),
                &video.view_count.to_string(),
                taxonomy,
            ])?;
            rows += 1;
        }
    }
    writer.flush()?;

    info!(
        "💾 Wrote {} rows ({} courses) to {}",
        rows,
        courses.len(),
        path.display()
    );
    Ok(())
}
