use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;
use url::Url;

use super::error::{HarvestError, HarvestResult};

pub const PLAYLIST_HREF_MARKER: &str = "/playlist?list=";
pub const WATCH_HREF_MARKER: &str = "/watch?v=";

/// A playlist as discovered on the channel courses page: the raw `href` path,
/// e.g. `/playlist?list=PLUl4u3cNGP63WbdFxL8giv4yhgdMGaZNA`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PlaylistRef(String);

impl PlaylistRef {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &str {
        &self.0
    }

    /// Absolute page URL for navigation. Absolute hrefs are kept as-is.
    pub fn absolute_url(&self, site_base: &Url) -> HarvestResult<Url> {
        site_base.join(&self.0).map_err(|e| {
            HarvestError::Config(format!(
                "cannot resolve playlist {} against {}: {}",
                self.0, site_base, e
            ))
        })
    }
}

impl fmt::Display for PlaylistRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A video anchor as first seen while scrolling a playlist panel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedVideo {
    pub url: String,
    /// 1-based, in first-observation order.
    pub position: u32,
}

/// Closed set of subject categories the extractor may assign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum Taxonomy {
    #[serde(rename = "Biological Sciences")]
    BiologicalSciences,
    #[serde(rename = "Business and Management")]
    BusinessAndManagement,
    #[serde(rename = "Chemistry")]
    Chemistry,
    #[serde(rename = "Computer Science")]
    ComputerScience,
    #[serde(rename = "Design")]
    Design,
    #[serde(rename = "Economics")]
    Economics,
    #[serde(rename = "Political Science")]
    PoliticalScience,
    #[serde(rename = "Physics")]
    Physics,
    #[serde(rename = "Mathematics")]
    Mathematics,
    #[serde(rename = "Sociology")]
    Sociology,
    #[serde(rename = "Statistics")]
    Statistics,
    #[serde(rename = "Literature")]
    Literature,
    #[serde(rename = "History")]
    History,
    #[serde(rename = "Philosophy")]
    Philosophy,
    #[serde(rename = "Other")]
    Other,
}

impl Taxonomy {
    pub const ALL: [Taxonomy; 15] = [
        Taxonomy::BiologicalSciences,
        Taxonomy::BusinessAndManagement,
        Taxonomy::Chemistry,
        Taxonomy::ComputerScience,
        Taxonomy::Design,
        Taxonomy::Economics,
        Taxonomy::PoliticalScience,
        Taxonomy::Physics,
        Taxonomy::Mathematics,
        Taxonomy::Sociology,
        Taxonomy::Statistics,
        Taxonomy::Literature,
        Taxonomy::History,
        Taxonomy::Philosophy,
        Taxonomy::Other,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Taxonomy::BiologicalSciences => "Biological Sciences",
            Taxonomy::BusinessAndManagement => "Business and Management",
            Taxonomy::Chemistry => "Chemistry",
            Taxonomy::ComputerScience => "Computer Science",
            Taxonomy::Design => "Design",
            Taxonomy::Economics => "Economics",
            Taxonomy::PoliticalScience => "Political Science",
            Taxonomy::Physics => "Physics",
            Taxonomy::Mathematics => "Mathematics",
            Taxonomy::Sociology => "Sociology",
            Taxonomy::Statistics => "Statistics",
            Taxonomy::Literature => "Literature",
            Taxonomy::History => "History",
            Taxonomy::Philosophy => "Philosophy",
            Taxonomy::Other => "Other",
        }
    }
}

impl fmt::Display for Taxonomy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Taxonomy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Taxonomy::ALL
            .iter()
            .copied()
            .find(|t| t.label() == s)
            .ok_or_else(|| format!("unknown taxonomy '{}'", s))
    }
}

/// `null`, a missing field and `""` all mean "no taxonomy"; anything else must
/// be one of the enum labels.
fn taxonomy_or_blank<'de, D>(deserializer: D) -> Result<Option<Taxonomy>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(label) => label.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

/// One video as reported by the structured extractor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ExtractedVideo {
    /// Relative watch URL, starting with `/watch?v=`.
    pub url: String,
    pub title: String,
    /// Integer view count with separators and the "views" suffix removed.
    pub view_count: u64,
    #[serde(default, deserialize_with = "taxonomy_or_blank")]
    #[schemars(with = "Option<Taxonomy>")]
    pub taxonomy: Option<Taxonomy>,
}

/// Structured output contract of the extractor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CourseExtraction {
    /// Course (playlist) title.
    pub title: String,
    pub videos: Vec<ExtractedVideo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoRecord {
    pub url: String,
    pub title: String,
    pub view_count: u64,
    pub position: u32,
    #[serde(default)]
    pub taxonomy: Option<Taxonomy>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseRecord {
    /// Playlist URL path, identical to the `PlaylistRef` it was harvested from.
    pub url: String,
    pub title: String,
    pub videos: Vec<VideoRecord>,
}

/// Output of one playlist scroll: positional ground truth plus the final DOM.
#[derive(Debug, Clone)]
pub struct HarvestedPlaylist {
    pub playlist: PlaylistRef,
    pub observed: Vec<ObservedVideo>,
    pub raw_html: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absolute_url_joins_site_base() {
        let base = Url::parse("https://www.youtube.com").unwrap();
        let p = PlaylistRef::new("/playlist?list=PLabc");
        assert_eq!(
            p.absolute_url(&base).unwrap().as_str(),
            "https://www.youtube.com/playlist?list=PLabc"
        );
    }

    #[test]
    fn test_taxonomy_labels_round_trip_through_from_str() {
        for t in Taxonomy::ALL {
            assert_eq!(t.label().parse::<Taxonomy>().unwrap(), t);
        }
        assert!("Astrology".parse::<Taxonomy>().is_err());
    }

    #[test]
    fn test_extracted_video_taxonomy_optional_and_blank() {
        let v: ExtractedVideo =
            serde_json::from_str(r#"{"url":"/watch?v=a","title":"L1","view_count":12}"#).unwrap();
        assert_eq!(v.taxonomy, None);

        let v: ExtractedVideo = serde_json::from_str(
            r#"{"url":"/watch?v=a","title":"L1","view_count":12,"taxonomy":""}"#,
        )
        .unwrap();
        assert_eq!(v.taxonomy, None);

        let v: ExtractedVideo = serde_json::from_str(
            r#"{"url":"/watch?v=a","title":"L1","view_count":12,"taxonomy":"Physics"}"#,
        )
        .unwrap();
        assert_eq!(v.taxonomy, Some(Taxonomy::Physics));
    }

    #[test]
    fn test_extracted_video_rejects_bad_values() {
        for bad in [
            r#"{"url":"/watch?v=a","title":"L1","view_count":-3}"#,
            r#"{"url":"/watch?v=a","title":"L1","view_count":"1,234 views"}"#,
            r#"{"url":"/watch?v=a","title":"L1","view_count":12.5}"#,
            r#"{"url":"/watch?v=a","title":"L1","view_count":1,"taxonomy":"Astrology"}"#,
            r#"{"url":"/watch?v=a","view_count":1}"#,
        ] {
            assert!(serde_json::from_str::<ExtractedVideo>(bad).is_err(), "accepted: {bad}");
        }
    }
}
