//! User-drawn sections: payload validation and direction-aware matching.
//!
//! Custom section payloads are the one place caller-supplied geometry is
//! persisted, so every field is checked here before the store sees it.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::geo_utils::polyline_length;
use crate::sections::{find_traversals, Traversal};
use crate::GpsPoint;

/// Byte ceiling for a custom section JSON payload
pub const MAX_SECTION_PAYLOAD_BYTES: usize = 100 * 1024;

/// Maximum custom section id length, in characters
pub const MAX_SECTION_ID_CHARS: usize = 128;

/// Maximum route/section name length, in characters
pub const MAX_NAME_CHARS: usize = 100;

/// Maximum points in a custom section polyline
pub const MAX_SECTION_POINTS: usize = 50_000;

/// A user-created section cut from one activity's track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct CustomSection {
    /// Unique identifier (e.g., "custom_1718000000000")
    pub id: String,
    pub name: String,
    /// GPS polyline defining the section path
    pub polyline: Vec<GpsPoint>,
    /// Activity this section was created from, empty for drawn sections
    #[serde(default)]
    pub source_activity_id: String,
    /// Start index in the source activity's GPS track
    #[serde(default)]
    pub start_index: u32,
    /// End index in the source activity's GPS track (inclusive)
    #[serde(default)]
    pub end_index: u32,
    pub sport_type: String,
    /// Distance in meters, recomputed from the polyline on insert
    #[serde(default)]
    pub distance_meters: f64,
    /// RFC3339 creation timestamp
    #[serde(default)]
    pub created_at: String,
}

/// One traversal of a custom section by an activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct CustomSectionMatch {
    pub activity_id: String,
    /// Start index in the activity's GPS track
    pub start_index: u32,
    /// End index in the activity's GPS track (inclusive)
    pub end_index: u32,
    /// "same" or "reverse"
    pub direction: String,
    /// Distance of the matched portion in meters
    pub distance_meters: f64,
    /// The activity's actual points over the matched range
    pub trace: Vec<GpsPoint>,
}

/// Configuration for custom section matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct CustomSectionMatchConfig {
    /// Maximum distance in meters between section and activity points (default: 50m)
    pub proximity_threshold: f64,
    /// Minimum fraction of the section that must be covered (default: 0.8)
    pub min_coverage: f64,
}

impl Default for CustomSectionMatchConfig {
    fn default() -> Self {
        Self {
            proximity_threshold: 50.0,
            min_coverage: 0.8,
        }
    }
}

/// Check a display name: at most [`MAX_NAME_CHARS`] characters, no control characters.
pub fn validate_name(field: &str, name: &str) -> Result<()> {
    if name.chars().count() > MAX_NAME_CHARS {
        return Err(EngineError::validation(
            field,
            format!("longer than {} characters", MAX_NAME_CHARS),
        ));
    }
    if name.chars().any(char::is_control) {
        return Err(EngineError::validation(field, "contains control characters"));
    }
    Ok(())
}

/// Field checks for a custom section, independent of the store.
pub fn validate_custom_section(section: &CustomSection) -> Result<()> {
    if section.id.trim().is_empty() {
        return Err(EngineError::validation("id", "must not be empty"));
    }
    if section.id.chars().count() > MAX_SECTION_ID_CHARS {
        return Err(EngineError::validation(
            "id",
            format!("longer than {} characters", MAX_SECTION_ID_CHARS),
        ));
    }
    if section.id.chars().any(char::is_control) {
        return Err(EngineError::validation("id", "contains control characters"));
    }

    validate_name("name", &section.name)?;
    validate_name("sportType", &section.sport_type)?;

    let points = section.polyline.len();
    if !(2..=MAX_SECTION_POINTS).contains(&points) {
        return Err(EngineError::validation(
            "polyline",
            format!("needs 2..={} points, got {}", MAX_SECTION_POINTS, points),
        ));
    }
    if let Some(i) = section.polyline.iter().position(|p| !p.is_valid()) {
        return Err(EngineError::validation(
            "polyline",
            format!("point {} is not a valid coordinate", i),
        ));
    }

    if section.start_index > section.end_index {
        return Err(EngineError::validation(
            "startIndex",
            format!("{} is after end index {}", section.start_index, section.end_index),
        ));
    }
    Ok(())
}

/// Parse and validate a custom section JSON payload.
///
/// The byte ceiling is checked before parsing. The returned section has its
/// distance recomputed from the polyline.
pub fn validate_section_payload(json: &str) -> Result<CustomSection> {
    if json.len() > MAX_SECTION_PAYLOAD_BYTES {
        return Err(EngineError::PayloadTooLarge {
            size: json.len(),
            limit: MAX_SECTION_PAYLOAD_BYTES,
        });
    }

    let mut section: CustomSection = serde_json::from_str(json)
        .map_err(|e| EngineError::validation("payload", e.to_string()))?;
    validate_custom_section(&section)?;
    section.distance_meters = polyline_length(&section.polyline);
    Ok(section)
}

fn to_match(activity_id: &str, track: &[GpsPoint], traversal: &Traversal) -> CustomSectionMatch {
    CustomSectionMatch {
        activity_id: activity_id.to_string(),
        start_index: traversal.start_index as u32,
        end_index: traversal.end_index as u32,
        direction: traversal.direction.clone(),
        distance_meters: traversal.distance_meters,
        trace: track[traversal.start_index..=traversal.end_index].to_vec(),
    }
}

/// Every disjoint traversal of `section` in `track`, in either direction.
pub fn match_section_in_track(
    section: &CustomSection,
    activity_id: &str,
    track: &[GpsPoint],
    config: &CustomSectionMatchConfig,
) -> Vec<CustomSectionMatch> {
    find_traversals(
        track,
        &section.polyline,
        config.proximity_threshold,
        config.min_coverage,
    )
    .iter()
    .map(|t| to_match(activity_id, track, t))
    .collect()
}

/// The activity's points along `polyline` for its first traversal, if any.
pub fn extract_section_trace(
    track: &[GpsPoint],
    polyline: &[GpsPoint],
    config: &CustomSectionMatchConfig,
) -> Option<Vec<GpsPoint>> {
    find_traversals(track, polyline, config.proximity_threshold, config.min_coverage)
        .first()
        .map(|t| track[t.start_index..=t.end_index].to_vec())
}
