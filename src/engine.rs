//! Process-wide engine facade.
//!
//! One [`PersistentRouteEngine`] per process, bound to a single store path.
//! Every call serializes through the singleton mutex, so callers on any
//! thread see one consistent engine. Long-running work (section detection)
//! is started here and polled; it never holds the lock while computing.
//!
//! The second half of this module adds the projections the facade hands
//! across the FFI boundary: JSON strings, flat coordinate buffers and
//! Google-encoded polylines.

use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{info, warn};
use once_cell::sync::Lazy;
use serde::Serialize;

use crate::codec::{decode_polyline, encode_polyline, points_to_flat};
use crate::error::{EngineError, Result};
use crate::persistence::PersistentRouteEngine;
use crate::{Bounds, EngineConfig, GpsPoint};

/// The singleton's contents: the engine and the path it was opened with.
pub struct EngineState {
    path: String,
    engine: PersistentRouteEngine,
}

impl EngineState {
    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Global engine instance.
///
/// This singleton allows FFI calls to access a shared engine without passing
/// state back and forth across the FFI boundary.
pub static ENGINE: Lazy<Mutex<Option<EngineState>>> = Lazy::new(|| Mutex::new(None));

// A panic while holding the lock leaves the engine usable: every mutation
// commits to SQLite before touching memory.
fn lock_engine() -> MutexGuard<'static, Option<EngineState>> {
    ENGINE.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Open the store at `db_path` and install it as the process engine.
///
/// Calling again with the same path is a no-op. A different path is
/// rejected with [`EngineError::PathMismatch`] until [`reset`] is called.
pub fn init(db_path: &str) -> Result<()> {
    crate::init_logging();

    let mut guard = lock_engine();
    if let Some(state) = guard.as_ref() {
        if state.path == db_path {
            return Ok(());
        }
        return Err(EngineError::PathMismatch {
            current: state.path.clone(),
            requested: db_path.to_string(),
        });
    }

    info!("[Engine] Initializing with db: {}", db_path);
    let engine = PersistentRouteEngine::new(db_path)?;
    *guard = Some(EngineState {
        path: db_path.to_string(),
        engine,
    });
    info!("[Engine] Initialized successfully");
    Ok(())
}

/// Release the process engine. A running detection job is cancelled and its
/// result discarded.
pub fn reset() {
    let mut guard = lock_engine();
    if let Some(mut state) = guard.take() {
        if state.engine.cancel_section_detection() {
            warn!("[Engine] Reset while detection was running; result discarded");
        }
        info!("[Engine] Released {}", state.path);
    }
}

pub fn is_initialized() -> bool {
    lock_engine().is_some()
}

/// Path of the store the process engine is bound to.
pub fn current_path() -> Option<String> {
    lock_engine().as_ref().map(|state| state.path.clone())
}

/// Run `f` against the process engine.
pub fn with_engine<F, R>(f: F) -> Result<R>
where
    F: FnOnce(&mut PersistentRouteEngine) -> R,
{
    let mut guard = lock_engine();
    let state = guard.as_mut().ok_or(EngineError::NotInitialized)?;
    Ok(f(&mut state.engine))
}

// ============================================================================
// Transport projections
// ============================================================================

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

impl PersistentRouteEngine {
    /// Add activities given as Google-encoded polylines, one per id.
    pub fn add_activities_encoded(
        &mut self,
        activity_ids: &[String],
        polylines: &[String],
        sport_types: &[String],
    ) -> Result<u32> {
        if activity_ids.len() != polylines.len() {
            return Err(EngineError::validation(
                "polylines",
                format!("{} ids but {} polylines", activity_ids.len(), polylines.len()),
            ));
        }

        let mut flat = Vec::new();
        let mut offsets = Vec::with_capacity(polylines.len());
        for encoded in polylines {
            offsets.push((flat.len() / 2) as u32);
            flat.extend(points_to_flat(&decode_polyline(encoded)?));
        }
        self.add_activities(activity_ids, &flat, &offsets, sport_types)
    }

    /// Activity ids whose bounds intersect the viewport.
    pub fn query_viewport_coords(
        &mut self,
        min_lat: f64,
        max_lat: f64,
        min_lng: f64,
        max_lng: f64,
    ) -> Vec<String> {
        self.query_viewport(&Bounds {
            min_lat,
            max_lat,
            min_lng,
            max_lng,
        })
    }

    /// Replace the engine configuration from a camelCase JSON document.
    /// Missing fields take their defaults.
    pub fn set_config_json(&mut self, json: &str) -> Result<()> {
        let config: EngineConfig = serde_json::from_str(json)?;
        self.set_match_config(config.match_config)?;
        self.set_section_config(config.section_config);
        self.set_custom_match_config(config.custom_match_config);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // JSON
    // ------------------------------------------------------------------------

    /// Get all activity bounds info as JSON for map display.
    pub fn get_all_activity_bounds_json(&self) -> Result<String> {
        to_json(&self.get_all_activity_bounds())
    }

    pub fn get_sections_json(&self) -> Result<String> {
        to_json(&self.get_sections())
    }

    pub fn get_sections_for_activity_json(&self, activity_id: &str) -> Result<String> {
        to_json(&self.get_sections_for_activity(activity_id))
    }

    pub fn get_section_summaries_json(&self, sport_type: Option<&str>) -> Result<String> {
        to_json(&self.get_section_summaries(sport_type)?)
    }

    /// `"null"` when the section does not exist.
    pub fn get_section_by_id_json(&self, section_id: &str) -> Result<String> {
        to_json(&self.get_section_by_id(section_id))
    }

    pub fn get_groups_json(&mut self) -> Result<String> {
        to_json(&self.get_groups()?)
    }

    pub fn get_group_summaries_json(&mut self) -> Result<String> {
        to_json(&self.get_group_summaries()?)
    }

    /// `"null"` when the group does not exist.
    pub fn get_group_by_id_json(&mut self, group_id: &str) -> Result<String> {
        to_json(&self.get_group_by_id(group_id)?)
    }

    pub fn get_route_performances_json(
        &mut self,
        group_id: &str,
        current_activity_id: Option<&str>,
    ) -> Result<String> {
        to_json(&self.get_route_performances(group_id, current_activity_id)?)
    }

    pub fn get_section_performances_json(&mut self, section_id: &str) -> Result<String> {
        to_json(&self.get_section_performances(section_id)?)
    }

    pub fn get_custom_sections_json(&self) -> Result<String> {
        to_json(&self.get_custom_sections())
    }

    pub fn get_custom_section_matches_json(&self, section_id: &str) -> Result<String> {
        to_json(&self.get_custom_section_matches(section_id)?)
    }

    pub fn get_all_route_names_json(&self) -> Result<String> {
        to_json(&self.get_all_route_names())
    }

    pub fn get_all_section_names_json(&self) -> Result<String> {
        to_json(&self.get_all_section_names())
    }

    pub fn detect_potentials_json(&self, sport_type: Option<&str>) -> Result<String> {
        to_json(&self.detect_potentials(sport_type)?)
    }

    pub fn get_activity_metrics_json(&self, activity_id: &str) -> Result<String> {
        to_json(&self.get_activity_metrics(activity_id))
    }

    pub fn get_stats_json(&self) -> Result<String> {
        to_json(&self.stats())
    }

    pub fn get_section_detection_progress_json(&self) -> String {
        self.get_section_detection_progress().to_string()
    }

    // ------------------------------------------------------------------------
    // Geometry
    // ------------------------------------------------------------------------

    /// Full track as `[lat, lng, ...]`; empty for unknown activities.
    pub fn get_gps_track_flat(&self, activity_id: &str) -> Result<Vec<f64>> {
        Ok(self
            .get_gps_track(activity_id)?
            .map(|track| points_to_flat(&track))
            .unwrap_or_default())
    }

    /// Full track as an encoded polyline; empty for unknown activities.
    pub fn get_gps_track_encoded(&self, activity_id: &str) -> Result<String> {
        match self.get_gps_track(activity_id)? {
            Some(track) => encode_polyline(&track),
            None => Ok(String::new()),
        }
    }

    pub fn get_simplified_gps_track_flat(&self, activity_id: &str, tolerance_deg: f64) -> Result<Vec<f64>> {
        Ok(self
            .get_simplified_gps_track(activity_id, tolerance_deg)?
            .map(|track| points_to_flat(&track))
            .unwrap_or_default())
    }

    pub fn get_consensus_route_flat(&mut self, group_id: &str) -> Result<Vec<f64>> {
        Ok(self
            .get_consensus_route(group_id)?
            .map(|route| points_to_flat(&route))
            .unwrap_or_default())
    }

    pub fn get_consensus_route_encoded(&mut self, group_id: &str) -> Result<String> {
        match self.get_consensus_route(group_id)? {
            Some(route) => encode_polyline(&route),
            None => Ok(String::new()),
        }
    }

    /// Polyline of a detected or custom section.
    pub fn get_section_polyline(&self, section_id: &str) -> Option<Vec<GpsPoint>> {
        self.get_section_by_id(section_id)
            .map(|s| s.polyline)
            .or_else(|| self.get_custom_section(section_id).map(|s| s.polyline))
    }

    pub fn get_section_polyline_flat(&self, section_id: &str) -> Vec<f64> {
        self.get_section_polyline(section_id)
            .map(|polyline| points_to_flat(&polyline))
            .unwrap_or_default()
    }

    pub fn get_section_polyline_encoded(&self, section_id: &str) -> Result<String> {
        match self.get_section_polyline(section_id) {
            Some(polyline) => encode_polyline(&polyline),
            None => Ok(String::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::tests::sample_coords;

    // Tests share the process-wide singleton
    static SINGLETON: Mutex<()> = Mutex::new(());

    fn serial() -> MutexGuard<'static, ()> {
        SINGLETON.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[test]
    fn test_not_initialized() {
        let _serial = serial();
        reset();
        assert!(!is_initialized());
        assert!(matches!(with_engine(|e| e.activity_count()), Err(EngineError::NotInitialized)));
    }

    #[test]
    fn test_init_is_idempotent_per_path() {
        let _serial = serial();
        reset();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routes.db");
        let path = path.to_str().unwrap();

        init(path).unwrap();
        with_engine(|e| e.add_activity("a", sample_coords(), "Ride"))
            .unwrap()
            .unwrap();
        init(path).unwrap();
        assert_eq!(with_engine(|e| e.activity_count()).unwrap(), 1);

        let err = init(":memory:").unwrap_err();
        assert!(matches!(err, EngineError::PathMismatch { .. }));
        assert_eq!(current_path().as_deref(), Some(path));

        reset();
        init(":memory:").unwrap();
        assert_eq!(with_engine(|e| e.activity_count()).unwrap(), 0);
        reset();
    }

    #[test]
    fn test_encoded_and_flat_geometry() {
        let mut engine = PersistentRouteEngine::in_memory().unwrap();
        let coords = sample_coords();
        let encoded = encode_polyline(&coords).unwrap();

        let added = engine
            .add_activities_encoded(&["a".to_string()], &[encoded.clone()], &["Run".to_string()])
            .unwrap();
        assert_eq!(added, 1);

        let flat = engine.get_gps_track_flat("a").unwrap();
        assert_eq!(flat.len(), coords.len() * 2);
        assert!((flat[0] - coords[0].latitude).abs() < 1e-5);
        assert_eq!(engine.get_gps_track_encoded("a").unwrap(), encoded);

        assert!(engine.get_gps_track_flat("missing").unwrap().is_empty());
        assert_eq!(engine.get_gps_track_encoded("missing").unwrap(), "");
    }

    #[test]
    fn test_encoded_length_mismatch() {
        let mut engine = PersistentRouteEngine::in_memory().unwrap();
        let err = engine
            .add_activities_encoded(&["a".to_string(), "b".to_string()], &[String::new()], &[])
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_json_projections() {
        let mut engine = PersistentRouteEngine::in_memory().unwrap();
        engine.add_activity("a", sample_coords(), "Ride").unwrap();

        let bounds: serde_json::Value =
            serde_json::from_str(&engine.get_all_activity_bounds_json().unwrap()).unwrap();
        assert_eq!(bounds[0]["id"], "a");
        assert_eq!(bounds[0]["activityType"], "Ride");

        assert_eq!(engine.get_section_by_id_json("nope").unwrap(), "null");
        assert_eq!(engine.get_group_by_id_json("nope").unwrap(), "null");
        assert_eq!(engine.get_sections_json().unwrap(), "[]");

        let stats: serde_json::Value = serde_json::from_str(&engine.get_stats_json().unwrap()).unwrap();
        assert_eq!(stats["activityCount"], 1);

        let progress: serde_json::Value =
            serde_json::from_str(&engine.get_section_detection_progress_json()).unwrap();
        assert_eq!(progress["phase"], "idle");
    }

    #[test]
    fn test_viewport_coords() {
        let mut engine = PersistentRouteEngine::in_memory().unwrap();
        engine.add_activity("a", sample_coords(), "Ride").unwrap();
        let p = sample_coords()[10];
        let hits = engine.query_viewport_coords(
            p.latitude - 0.001,
            p.latitude + 0.001,
            p.longitude - 0.001,
            p.longitude + 0.001,
        );
        assert_eq!(hits, vec!["a".to_string()]);
        assert!(engine.query_viewport_coords(0.0, 0.1, 0.0, 0.1).is_empty());
    }

    #[test]
    fn test_config_json_partial() {
        let mut engine = PersistentRouteEngine::in_memory().unwrap();
        engine
            .set_config_json(r#"{"customMatchConfig": {"proximityThreshold": 80.0, "minCoverage": 0.7}}"#)
            .unwrap();
        assert_eq!(engine.config().custom_match_config.proximity_threshold, 80.0);
        assert_eq!(engine.config().match_config, crate::MatchConfig::default());
        assert!(engine.set_config_json("{not json").is_err());
    }
}
