//! FFI exports for the process engine.
//!
//! Thin `#[uniffi::export]` wrappers over [`crate::engine`]. Geometry crosses
//! the boundary as flat `[lat, lng, ...]` buffers or encoded polylines, rich
//! results as camelCase JSON. Failures are logged and reported through the
//! return value (`false`, `0`, an empty string or an empty JSON document) so
//! the caller treats them as "state did not change".

use log::{error, info, warn};

use crate::codec::{flat_to_points, points_to_flat};
use crate::engine::{self, with_engine};
use crate::error::{EngineError, Result};
use crate::persistence::PersistentRouteEngine;
use crate::{ActivityMetrics, Bounds};

/// Run a fallible engine call, logging and falling back on any error.
fn call<R>(op: &str, fallback: R, f: impl FnOnce(&mut PersistentRouteEngine) -> Result<R>) -> R {
    match with_engine(f) {
        Ok(Ok(value)) => value,
        Ok(Err(e)) if e.is_validation() => {
            warn!("[Engine] {} rejected: {}", op, e);
            fallback
        }
        Ok(Err(e)) => {
            error!("[Engine] {} failed: {}", op, e);
            fallback
        }
        Err(EngineError::NotInitialized) => {
            warn!("[Engine] {} called before init", op);
            fallback
        }
        Err(e) => {
            error!("[Engine] {} failed: {}", op, e);
            fallback
        }
    }
}

/// Infallible engine read, with `fallback` when not initialized.
fn read<R>(fallback: R, f: impl FnOnce(&mut PersistentRouteEngine) -> R) -> R {
    with_engine(f).unwrap_or(fallback)
}

fn blank_to_none(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn viewport(min_lat: f64, max_lat: f64, min_lng: f64, max_lng: f64) -> Bounds {
    Bounds {
        min_lat,
        max_lat,
        min_lng,
        max_lng,
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Initialize the engine with a database path.
/// Call this once at app startup before any other engine functions.
/// Re-initializing with the same path is a no-op.
#[uniffi::export]
pub fn persistent_engine_init(db_path: String) -> bool {
    match engine::init(&db_path) {
        Ok(()) => true,
        Err(e) => {
            error!("[Engine] Failed to initialize: {}", e);
            false
        }
    }
}

#[uniffi::export]
pub fn persistent_engine_is_initialized() -> bool {
    engine::is_initialized()
}

/// Release the engine so it can be re-initialized with another path.
#[uniffi::export]
pub fn persistent_engine_reset() {
    engine::reset();
}

/// Delete all stored data.
#[uniffi::export]
pub fn persistent_engine_clear() -> bool {
    let cleared = call("clear", false, |e| e.clear().map(|_| true));
    if cleared {
        info!("[Engine] Cleared");
    }
    cleared
}

/// Remove activities older than the retention period (0 = keep all).
/// Returns the number of activities deleted.
#[uniffi::export]
pub fn persistent_engine_cleanup_old_activities(retention_days: u32) -> u32 {
    call("cleanup", 0, |e| e.cleanup_old_activities(retention_days))
}

/// Mark groups and sections for re-computation.
#[uniffi::export]
pub fn persistent_engine_mark_for_recomputation() {
    read((), |e| e.mark_for_recomputation());
}

/// Replace the engine configuration from camelCase JSON.
#[uniffi::export]
pub fn persistent_engine_set_config_json(json: String) -> bool {
    call("set config", false, |e| e.set_config_json(&json).map(|_| true))
}

#[uniffi::export]
pub fn persistent_engine_get_config_json() -> String {
    call("get config", "{}".to_string(), |e| {
        Ok(serde_json::to_string(e.config())?)
    })
}

#[uniffi::export]
pub fn persistent_engine_get_stats_json() -> String {
    call("stats", "{}".to_string(), |e| e.get_stats_json())
}

// ============================================================================
// Activities
// ============================================================================

/// Add activities from one flat coordinate buffer.
/// `offsets[i]` is the point index where activity `i` starts.
/// The whole batch is rejected if any track is invalid.
#[uniffi::export]
pub fn persistent_engine_add_activities(
    activity_ids: Vec<String>,
    all_coords: Vec<f64>,
    offsets: Vec<u32>,
    sport_types: Vec<String>,
) -> u32 {
    info!(
        "[Engine] Adding {} activities ({} coords)",
        activity_ids.len(),
        all_coords.len() / 2
    );
    call("add activities", 0, |e| {
        e.add_activities(&activity_ids, &all_coords, &offsets, &sport_types)
    })
}

/// Add activities given as Google-encoded polylines.
#[uniffi::export]
pub fn persistent_engine_add_activities_encoded(
    activity_ids: Vec<String>,
    polylines: Vec<String>,
    sport_types: Vec<String>,
) -> u32 {
    call("add encoded activities", 0, |e| {
        e.add_activities_encoded(&activity_ids, &polylines, &sport_types)
    })
}

#[uniffi::export]
pub fn persistent_engine_remove_activities(activity_ids: Vec<String>) -> u32 {
    info!("[Engine] Removing {} activities", activity_ids.len());
    call("remove activities", 0, |e| e.remove_activities(&activity_ids))
}

#[uniffi::export]
pub fn persistent_engine_get_activity_ids() -> Vec<String> {
    read(Vec::new(), |e| e.get_activity_ids())
}

#[uniffi::export]
pub fn persistent_engine_get_activity_count() -> u32 {
    read(0, |e| e.activity_count() as u32)
}

#[uniffi::export]
pub fn persistent_engine_has_activity(activity_id: String) -> bool {
    read(false, |e| e.has_activity(&activity_id))
}

/// Get all activity bounds info as JSON for map display.
#[uniffi::export]
pub fn persistent_engine_get_all_activity_bounds_json() -> String {
    call("activity bounds", "[]".to_string(), |e| e.get_all_activity_bounds_json())
}

/// Activity ids whose bounds intersect the viewport.
#[uniffi::export]
pub fn persistent_engine_query_viewport(
    min_lat: f64,
    max_lat: f64,
    min_lng: f64,
    max_lng: f64,
) -> Vec<String> {
    read(Vec::new(), |e| {
        e.query_viewport_coords(min_lat, max_lat, min_lng, max_lng)
    })
}

/// Full GPS track as a flat buffer (empty if unknown).
#[uniffi::export]
pub fn persistent_engine_get_gps_track(activity_id: String) -> Vec<f64> {
    call("gps track", Vec::new(), |e| e.get_gps_track_flat(&activity_id))
}

#[uniffi::export]
pub fn persistent_engine_get_gps_track_encoded(activity_id: String) -> String {
    call("gps track", String::new(), |e| e.get_gps_track_encoded(&activity_id))
}

#[uniffi::export]
pub fn persistent_engine_get_simplified_gps_track(activity_id: String, tolerance_deg: f64) -> Vec<f64> {
    call("simplified track", Vec::new(), |e| {
        e.get_simplified_gps_track_flat(&activity_id, tolerance_deg)
    })
}

/// Set activity metrics for performance calculations.
#[uniffi::export]
pub fn persistent_engine_set_activity_metrics(metrics: Vec<ActivityMetrics>) -> bool {
    call("set metrics", false, |e| e.set_activity_metrics(metrics).map(|_| true))
}

#[uniffi::export]
pub fn persistent_engine_get_activity_metrics_json(activity_id: String) -> String {
    call("get metrics", "null".to_string(), |e| {
        e.get_activity_metrics_json(&activity_id)
    })
}

// ============================================================================
// Time streams
// ============================================================================

/// Store per-point time streams, all or nothing. Returns the number stored.
#[uniffi::export]
pub fn persistent_engine_set_time_streams_flat(
    activity_ids: Vec<String>,
    all_times: Vec<u32>,
    offsets: Vec<u32>,
) -> u32 {
    call("set time streams", 0, |e| {
        e.set_time_streams_flat(&activity_ids, &all_times, &offsets)
    })
}

#[uniffi::export]
pub fn persistent_engine_get_activities_missing_time_streams(activity_ids: Vec<String>) -> Vec<String> {
    read(Vec::new(), |e| e.get_activities_missing_time_streams(&activity_ids))
}

// ============================================================================
// Route groups
// ============================================================================

#[uniffi::export]
pub fn persistent_engine_get_group_count() -> u32 {
    call("group count", 0, |e| e.get_group_count())
}

#[uniffi::export]
pub fn persistent_engine_get_groups_json() -> String {
    call("groups", "[]".to_string(), |e| e.get_groups_json())
}

#[uniffi::export]
pub fn persistent_engine_get_group_summaries_json() -> String {
    call("group summaries", "[]".to_string(), |e| e.get_group_summaries_json())
}

#[uniffi::export]
pub fn persistent_engine_get_group_by_id_json(group_id: String) -> String {
    call("group", "null".to_string(), |e| e.get_group_by_id_json(&group_id))
}

/// Group id of an activity, empty if ungrouped.
#[uniffi::export]
pub fn persistent_engine_get_group_for_activity(activity_id: String) -> String {
    call("group for activity", String::new(), |e| {
        Ok(e.get_group_for_activity(&activity_id)?.unwrap_or_default())
    })
}

#[uniffi::export]
pub fn persistent_engine_get_consensus_route(group_id: String) -> Vec<f64> {
    call("consensus route", Vec::new(), |e| e.get_consensus_route_flat(&group_id))
}

#[uniffi::export]
pub fn persistent_engine_get_consensus_route_encoded(group_id: String) -> String {
    call("consensus route", String::new(), |e| {
        e.get_consensus_route_encoded(&group_id)
    })
}

#[uniffi::export]
pub fn persistent_engine_get_route_performances_json(
    route_group_id: String,
    current_activity_id: Option<String>,
) -> String {
    call("route performances", "{}".to_string(), |e| {
        e.get_route_performances_json(&route_group_id, current_activity_id.as_deref())
    })
}

/// Set a custom name for a route. Pass an empty string to clear it.
#[uniffi::export]
pub fn persistent_engine_set_route_name(route_id: String, name: String) -> bool {
    call("set route name", false, |e| {
        e.set_route_name(&route_id, blank_to_none(&name)).map(|_| true)
    })
}

/// Custom name of a route, empty if none is set.
#[uniffi::export]
pub fn persistent_engine_get_route_name(route_id: String) -> String {
    read(None, |e| e.get_route_name(&route_id)).unwrap_or_default()
}

#[uniffi::export]
pub fn persistent_engine_get_all_route_names_json() -> String {
    call("route names", "{}".to_string(), |e| e.get_all_route_names_json())
}

// ============================================================================
// Sections
// ============================================================================

#[uniffi::export]
pub fn persistent_engine_get_section_count() -> u32 {
    read(0, |e| e.get_section_count())
}

#[uniffi::export]
pub fn persistent_engine_get_sections_json() -> String {
    call("sections", "[]".to_string(), |e| e.get_sections_json())
}

#[uniffi::export]
pub fn persistent_engine_get_section_summaries_json(sport_type: Option<String>) -> String {
    call("section summaries", "[]".to_string(), |e| {
        e.get_section_summaries_json(sport_type.as_deref())
    })
}

#[uniffi::export]
pub fn persistent_engine_get_section_by_id_json(section_id: String) -> String {
    call("section", "null".to_string(), |e| e.get_section_by_id_json(&section_id))
}

#[uniffi::export]
pub fn persistent_engine_get_sections_for_activity_json(activity_id: String) -> String {
    call("sections for activity", "[]".to_string(), |e| {
        e.get_sections_for_activity_json(&activity_id)
    })
}

#[uniffi::export]
pub fn persistent_engine_query_sections_in_viewport(
    min_lat: f64,
    max_lat: f64,
    min_lng: f64,
    max_lng: f64,
) -> Vec<String> {
    read(Vec::new(), |e| {
        e.query_sections_in_viewport(&viewport(min_lat, max_lat, min_lng, max_lng))
    })
}

/// Polyline of a detected or custom section as a flat buffer.
#[uniffi::export]
pub fn persistent_engine_get_section_polyline(section_id: String) -> Vec<f64> {
    read(Vec::new(), |e| e.get_section_polyline_flat(&section_id))
}

#[uniffi::export]
pub fn persistent_engine_get_section_polyline_encoded(section_id: String) -> String {
    call("section polyline", String::new(), |e| {
        e.get_section_polyline_encoded(&section_id)
    })
}

/// Set a custom name for a section. Pass an empty string to clear it.
#[uniffi::export]
pub fn persistent_engine_set_section_name(section_id: String, name: String) -> bool {
    call("set section name", false, |e| {
        e.set_section_name(&section_id, blank_to_none(&name)).map(|_| true)
    })
}

/// Display name of a section, empty if the section is unknown.
#[uniffi::export]
pub fn persistent_engine_get_section_name(section_id: String) -> String {
    read(None, |e| e.get_section_name(&section_id)).unwrap_or_default()
}

#[uniffi::export]
pub fn persistent_engine_get_all_section_names_json() -> String {
    call("section names", "{}".to_string(), |e| e.get_all_section_names_json())
}

/// Use one contributing activity's trace as the section polyline.
#[uniffi::export]
pub fn persistent_engine_set_section_reference(section_id: String, activity_id: String) -> bool {
    call("set section reference", false, |e| {
        e.set_section_reference(&section_id, &activity_id)
    })
}

/// Go back to the detected medoid trace.
#[uniffi::export]
pub fn persistent_engine_reset_section_reference(section_id: String) -> bool {
    call("reset section reference", false, |e| {
        e.reset_section_reference(&section_id)
    })
}

#[uniffi::export]
pub fn persistent_engine_get_section_performances_json(section_id: String) -> String {
    call("section performances", "{}".to_string(), |e| {
        e.get_section_performances_json(&section_id)
    })
}

/// Raw overlap candidates, computed synchronously and not stored.
#[uniffi::export]
pub fn persistent_engine_detect_potentials_json(sport_type: Option<String>) -> String {
    call("detect potentials", "[]".to_string(), |e| {
        e.detect_potentials_json(sport_type.as_deref())
    })
}

// ============================================================================
// Section detection job
// ============================================================================

/// Start section detection in the background.
/// Returns false if a job is already running or the engine is not ready.
#[uniffi::export]
pub fn persistent_engine_start_section_detection(sport_type: Option<String>) -> bool {
    call("start detection", false, |e| {
        e.start_section_detection(sport_type.as_deref()).map(|_| true)
    })
}

/// Current phase, a terminal status exactly once, then `"idle"`.
#[uniffi::export]
pub fn persistent_engine_poll_section_detection() -> String {
    read("idle".to_string(), |e| e.poll_section_detection())
}

#[uniffi::export]
pub fn persistent_engine_get_section_detection_progress_json() -> String {
    read(
        r#"{"phase":"idle","completed":0,"total":0}"#.to_string(),
        |e| e.get_section_detection_progress_json(),
    )
}

#[uniffi::export]
pub fn persistent_engine_cancel_section_detection() -> bool {
    read(false, |e| e.cancel_section_detection())
}

// ============================================================================
// Custom sections
// ============================================================================

/// Store a custom section from its JSON payload.
/// Returns the stored section as JSON, or an empty string if rejected.
#[uniffi::export]
pub fn persistent_engine_add_custom_section(section_json: String) -> String {
    call("add custom section", String::new(), |e| {
        let section = e.add_custom_section(&section_json)?;
        Ok(serde_json::to_string(&section)?)
    })
}

/// Cut a custom section from a stored activity's track.
/// Returns the new section as JSON, or an empty string if rejected.
#[uniffi::export]
pub fn persistent_engine_create_section_from_indices(
    activity_id: String,
    start_index: u32,
    end_index: u32,
    sport_type: String,
    name: String,
) -> String {
    call("create section", String::new(), |e| {
        let section =
            e.create_section_from_indices(&activity_id, start_index, end_index, &sport_type, &name)?;
        Ok(serde_json::to_string(&section)?)
    })
}

#[uniffi::export]
pub fn persistent_engine_remove_custom_section(section_id: String) -> bool {
    call("remove custom section", false, |e| e.remove_custom_section(&section_id))
}

#[uniffi::export]
pub fn persistent_engine_get_custom_sections_json() -> String {
    call("custom sections", "[]".to_string(), |e| e.get_custom_sections_json())
}

/// Match a custom section against the given activities; returns the matches as JSON.
#[uniffi::export]
pub fn persistent_engine_match_custom_section(section_id: String, activity_ids: Vec<String>) -> String {
    call("match custom section", "[]".to_string(), |e| {
        let matches = e.match_custom_section(&section_id, &activity_ids)?;
        Ok(serde_json::to_string(&matches)?)
    })
}

#[uniffi::export]
pub fn persistent_engine_get_custom_section_matches_json(section_id: String) -> String {
    call("custom section matches", "[]".to_string(), |e| {
        e.get_custom_section_matches_json(&section_id)
    })
}

/// The activity's points along a flat polyline, empty if it never traverses it.
#[uniffi::export]
pub fn persistent_engine_extract_section_trace(activity_id: String, polyline: Vec<f64>) -> Vec<f64> {
    call("extract trace", Vec::new(), |e| {
        let trace = e.extract_section_trace(&activity_id, &flat_to_points(&polyline))?;
        Ok(trace
            .map(|points| points_to_flat(&points))
            .unwrap_or_default())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_names_clear() {
        assert_eq!(blank_to_none(""), None);
        assert_eq!(blank_to_none("   "), None);
        assert_eq!(blank_to_none("Hill"), Some("Hill"));
    }
}
