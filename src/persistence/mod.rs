//! SQLite-backed engine state.
//!
//! What stays resident: per-activity metadata and bounds, both R-trees and
//! the section/group reverse index, and every derived result (groups,
//! sections, custom sections, metrics, time streams). Signatures and
//! consensus routes sit in LRU caches. Full tracks are decoded from the
//! store only for the call that needs them.
//!
//! A mutation commits its transaction first and then updates memory, so a
//! failed write leaves both sides as they were.

mod activities;
mod custom;
mod detection;
mod groups;
pub mod schema;
mod sections;
mod time_streams;

use std::collections::HashMap;
use std::num::NonZeroUsize;

use log::info;
use lru::LruCache;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::custom_sections::{CustomSection, CustomSectionMatchConfig};
use crate::error::Result;
use crate::spatial_index::{ReverseIndex, SpatialIndex};
use crate::{
    ActivityMatchInfo, ActivityMetrics, Bounds, FrequentSection, GpsPoint, MatchConfig,
    RouteGroup, RouteSignature, SectionConfig,
};

pub use detection::{DetectionOutcome, SectionDetectionHandle};

// ============================================================================
// Types
// ============================================================================

/// Everything tunable at runtime; sent over FFI as one JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct EngineConfig {
    pub match_config: MatchConfig,
    pub section_config: SectionConfig,
    pub custom_match_config: CustomSectionMatchConfig,
    /// Route signatures kept in memory
    pub signature_cache_size: u32,
    /// Consensus routes kept in memory
    pub consensus_cache_size: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            match_config: MatchConfig::default(),
            section_config: SectionConfig::default(),
            custom_match_config: CustomSectionMatchConfig::default(),
            signature_cache_size: 200,
            consensus_cache_size: 50,
        }
    }
}

/// Resident per-activity row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityMetadata {
    pub id: String,
    pub sport_type: String,
    pub bounds: Bounds,
    pub point_count: u32,
    pub distance_meters: f64,
    /// Unix seconds when the activity was first stored
    pub created_at: i64,
}

/// Per-activity bounds for map overview rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityBoundsInfo {
    pub id: String,
    /// `[[minLat, minLng], [maxLat, maxLng]]`
    pub bounds: [[f64; 2]; 2],
    pub activity_type: String,
    /// Meters, from metrics when known
    pub distance: f64,
}

/// Section projection served without decoding polylines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct SectionSummary {
    pub id: String,
    /// User name if set, otherwise the generated one
    pub name: Option<String>,
    pub sport_type: String,
    pub representative_activity_id: String,
    pub reference_pinned: bool,
    pub visit_count: u32,
    pub activity_count: u32,
    pub distance_meters: f64,
    pub confidence: f64,
    pub scale: String,
    pub bounds: Bounds,
}

/// Route group projection without geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct GroupSummary {
    pub group_id: String,
    pub representative_id: String,
    pub sport_type: String,
    pub activity_count: u32,
    pub custom_name: Option<String>,
    pub bounds: Option<Bounds>,
    pub best_time: Option<f64>,
}

/// Full route group with its consensus route.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupDetail {
    pub group: RouteGroup,
    /// The representative's full track
    pub consensus: Vec<GpsPoint>,
    pub activity_matches: Vec<ActivityMatchInfo>,
}

/// Counters for diagnostics screens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct PersistentEngineStats {
    pub activity_count: u32,
    pub signature_cache_size: u32,
    pub consensus_cache_size: u32,
    pub group_count: u32,
    pub section_count: u32,
    pub custom_section_count: u32,
    pub time_stream_count: u32,
    pub groups_dirty: bool,
    /// Activities changed since the last committed detection run
    pub sections_dirty: bool,
    pub detection_running: bool,
}

// ============================================================================
// Persistent Route Engine
// ============================================================================

/// The stateful engine: one SQLite connection plus resident indexes.
pub struct PersistentRouteEngine {
    db: Connection,

    /// Reopened by the detection worker on its own thread
    db_path: String,

    config: EngineConfig,

    activity_metadata: HashMap<String, ActivityMetadata>,
    activity_index: SpatialIndex,
    section_index: SpatialIndex,
    reverse_index: ReverseIndex,

    signature_cache: LruCache<String, RouteSignature>,
    consensus_cache: LruCache<String, Vec<GpsPoint>>,

    groups: Vec<RouteGroup>,
    /// group_id -> member match info
    activity_matches: HashMap<String, Vec<ActivityMatchInfo>>,
    route_names: HashMap<String, String>,

    /// Detected sections, generated names (user names live in `section_names`)
    sections: Vec<FrequentSection>,
    section_names: HashMap<String, String>,

    custom_sections: Vec<CustomSection>,

    activity_metrics: HashMap<String, ActivityMetrics>,
    time_streams: HashMap<String, Vec<u32>>,

    groups_dirty: bool,
    /// Activities changed since the last committed detection run
    sections_dirty: bool,

    detection: Option<SectionDetectionHandle>,
}

fn cache_capacity(size: u32) -> NonZeroUsize {
    NonZeroUsize::new(size as usize).unwrap_or(NonZeroUsize::MIN)
}

impl PersistentRouteEngine {
    // ========================================================================
    // Initialization
    // ========================================================================

    /// Open the store at `db_path` with default configuration and load it.
    pub fn new(db_path: &str) -> Result<Self> {
        Self::with_config(db_path, EngineConfig::default())
    }

    /// Open the store at `db_path` and load its contents.
    pub fn with_config(db_path: &str, config: EngineConfig) -> Result<Self> {
        let db = schema::open_store(db_path)?;

        let mut engine = Self {
            db,
            db_path: db_path.to_string(),
            activity_metadata: HashMap::new(),
            activity_index: SpatialIndex::new(),
            section_index: SpatialIndex::new(),
            reverse_index: ReverseIndex::new(),
            signature_cache: LruCache::new(cache_capacity(config.signature_cache_size)),
            consensus_cache: LruCache::new(cache_capacity(config.consensus_cache_size)),
            groups: Vec::new(),
            activity_matches: HashMap::new(),
            route_names: HashMap::new(),
            sections: Vec::new(),
            section_names: HashMap::new(),
            custom_sections: Vec::new(),
            activity_metrics: HashMap::new(),
            time_streams: HashMap::new(),
            groups_dirty: false,
            sections_dirty: false,
            detection: None,
            config,
        };
        engine.load()?;
        Ok(engine)
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::new(schema::IN_MEMORY_PATH)
    }

    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    pub fn is_in_memory(&self) -> bool {
        self.db_path == schema::IN_MEMORY_PATH
    }

    /// Reload all in-memory state from the store.
    pub fn load(&mut self) -> Result<()> {
        self.load_metadata()?;
        self.load_activity_metrics()?;
        self.load_time_streams()?;
        self.load_names()?;
        self.load_groups()?;
        self.load_sections()?;
        self.load_custom_sections()?;

        info!(
            "[Store] Loaded {} activities, {} groups, {} sections, {} custom sections",
            self.activity_metadata.len(),
            self.groups.len(),
            self.sections.len(),
            self.custom_sections.len()
        );
        Ok(())
    }

    fn load_names(&mut self) -> Result<()> {
        self.route_names = Self::read_names(&self.db, "SELECT route_id, custom_name FROM route_names")?;
        self.section_names =
            Self::read_names(&self.db, "SELECT section_id, custom_name FROM section_names")?;
        Ok(())
    }

    fn read_names(conn: &Connection, sql: &str) -> Result<HashMap<String, String>> {
        let mut stmt = conn.prepare(sql)?;
        let names = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<rusqlite::Result<HashMap<_, _>>>()?;
        Ok(names)
    }

    /// Delete everything in the store.
    pub fn clear(&mut self) -> Result<()> {
        let tx = self.db.unchecked_transaction()?;
        tx.execute_batch(
            "DELETE FROM custom_sections;
             DELETE FROM sections;
             DELETE FROM route_groups;
             DELETE FROM activity_matches;
             DELETE FROM route_names;
             DELETE FROM section_names;
             DELETE FROM activities;",
        )?;
        tx.commit()?;

        self.activity_metadata.clear();
        self.activity_index.mark_dirty();
        self.section_index.mark_dirty();
        self.reverse_index.clear();
        self.signature_cache.clear();
        self.consensus_cache.clear();
        self.groups.clear();
        self.activity_matches.clear();
        self.route_names.clear();
        self.sections.clear();
        self.section_names.clear();
        self.custom_sections.clear();
        self.activity_metrics.clear();
        self.time_streams.clear();
        self.groups_dirty = false;
        self.sections_dirty = false;

        info!("[Store] Cleared");
        Ok(())
    }

    /// Force groups and sections to be rebuilt by the next read.
    pub fn mark_for_recomputation(&mut self) {
        if !self.groups_dirty || !self.sections_dirty {
            self.groups_dirty = true;
            self.sections_dirty = true;
            self.consensus_cache.clear();
            info!("[Store] Marked for re-computation");
        }
    }

    // ========================================================================
    // Signatures and tracks
    // ========================================================================

    /// Cached signature, falling back to the `signatures` table.
    pub fn get_signature(&mut self, id: &str) -> Result<Option<RouteSignature>> {
        if let Some(sig) = self.signature_cache.get(id) {
            return Ok(Some(sig.clone()));
        }

        let Some(sig) = Self::read_signature(&self.db, id)? else {
            return Ok(None);
        };
        self.signature_cache.put(id.to_string(), sig.clone());
        Ok(Some(sig))
    }

    fn read_signature(conn: &Connection, id: &str) -> Result<Option<RouteSignature>> {
        let row = conn
            .query_row(
                "SELECT points, start_point_lat, start_point_lng, end_point_lat, end_point_lng, total_distance
                 FROM signatures WHERE activity_id = ?",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        GpsPoint::new(row.get(1)?, row.get(2)?),
                        GpsPoint::new(row.get(3)?, row.get(4)?),
                        row.get::<_, f64>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((blob, start_point, end_point, total_distance)) = row else {
            return Ok(None);
        };
        let points: Vec<GpsPoint> = rmp_serde::from_slice(&blob)?;
        let Some(bounds) = Bounds::from_points(&points) else {
            return Ok(None);
        };

        Ok(Some(RouteSignature {
            activity_id: id.to_string(),
            points,
            total_distance,
            start_point,
            end_point,
            center: bounds.center(),
            bounds,
        }))
    }

    /// Decoded track; never cached.
    pub fn get_gps_track(&self, id: &str) -> Result<Option<Vec<GpsPoint>>> {
        read_track(&self.db, id)
    }

    /// Track thinned with Douglas-Peucker at `tolerance_deg`, for list previews.
    pub fn get_simplified_gps_track(&self, id: &str, tolerance_deg: f64) -> Result<Option<Vec<GpsPoint>>> {
        use geo::{algorithm::simplify::Simplify, Coord, LineString};

        let Some(track) = self.get_gps_track(id)? else {
            return Ok(None);
        };
        let line: LineString = track
            .iter()
            .map(|p| Coord { x: p.longitude, y: p.latitude })
            .collect();
        Ok(Some(
            line.simplify(&tolerance_deg)
                .0
                .iter()
                .map(|c| GpsPoint::new(c.y, c.x))
                .collect(),
        ))
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Replace the route matching settings and mark groups dirty. Signatures
    /// are rebuilt from tracks when a simplification setting changed.
    pub fn set_match_config(&mut self, config: MatchConfig) -> Result<()> {
        let resimplify = config.simplification_tolerance
            != self.config.match_config.simplification_tolerance
            || config.max_simplified_points != self.config.match_config.max_simplified_points;
        self.config.match_config = config;

        if resimplify {
            self.rebuild_signatures()?;
        }
        self.signature_cache.clear();
        self.consensus_cache.clear();
        self.groups_dirty = true;
        Ok(())
    }

    /// Used by the next detection run.
    pub fn set_section_config(&mut self, config: SectionConfig) {
        self.config.section_config = config;
        self.sections_dirty = true;
    }

    pub fn set_custom_match_config(&mut self, config: CustomSectionMatchConfig) {
        self.config.custom_match_config = config;
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    pub fn stats(&self) -> PersistentEngineStats {
        PersistentEngineStats {
            activity_count: self.activity_metadata.len() as u32,
            signature_cache_size: self.signature_cache.len() as u32,
            consensus_cache_size: self.consensus_cache.len() as u32,
            group_count: self.groups.len() as u32,
            section_count: self.sections.len() as u32,
            custom_section_count: self.custom_sections.len() as u32,
            time_stream_count: self.time_streams.len() as u32,
            groups_dirty: self.groups_dirty,
            sections_dirty: self.sections_dirty,
            detection_running: self.detection.is_some(),
        }
    }
}

/// Decode one activity's track from `gps_tracks`.
pub(crate) fn read_track(conn: &Connection, id: &str) -> Result<Option<Vec<GpsPoint>>> {
    let blob: Option<Vec<u8>> = conn
        .query_row(
            "SELECT track_data FROM gps_tracks WHERE activity_id = ?",
            params![id],
            |row| row.get(0),
        )
        .optional()?;

    match blob {
        Some(blob) => Ok(Some(rmp_serde::from_slice(&blob)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_coords() -> Vec<GpsPoint> {
        (0..50)
            .map(|i| GpsPoint::new(51.5074 + i as f64 * 0.001, -0.1278 + i as f64 * 0.0005))
            .collect()
    }

    #[test]
    fn test_create_engine() {
        let engine = PersistentRouteEngine::in_memory().unwrap();
        assert!(engine.is_in_memory());
        assert_eq!(engine.activity_count(), 0);
        assert_eq!(engine.stats().section_count, 0);
    }

    #[test]
    fn test_signature_caching() {
        let mut engine = PersistentRouteEngine::in_memory().unwrap();
        engine.add_activity("test-1", sample_coords(), "Ride").unwrap();

        let sig1 = engine.get_signature("test-1").unwrap().unwrap();
        engine.signature_cache.clear();
        // Second access comes from the store
        let sig2 = engine.get_signature("test-1").unwrap().unwrap();
        assert_eq!(sig1.points, sig2.points);
        assert_eq!(engine.stats().signature_cache_size, 1);
        assert!(engine.get_signature("missing").unwrap().is_none());
    }

    #[test]
    fn test_simplified_track_is_shorter() {
        let mut engine = PersistentRouteEngine::in_memory().unwrap();
        engine.add_activity("a", sample_coords(), "Ride").unwrap();

        let simplified = engine.get_simplified_gps_track("a", 0.0001).unwrap().unwrap();
        // A straight line collapses to its endpoints
        assert_eq!(simplified.len(), 2);
        assert!(engine.get_simplified_gps_track("missing", 0.0001).unwrap().is_none());
    }

    #[test]
    fn test_clear() {
        let mut engine = PersistentRouteEngine::in_memory().unwrap();
        engine.add_activity("a", sample_coords(), "Ride").unwrap();
        engine.clear().unwrap();
        assert_eq!(engine.activity_count(), 0);
        assert!(engine.get_gps_track("a").unwrap().is_none());
    }

    #[test]
    fn test_dirty_flags_reported() {
        let mut engine = PersistentRouteEngine::in_memory().unwrap();
        assert!(!engine.stats().sections_dirty);

        engine.add_activity("a", sample_coords(), "Ride").unwrap();
        let stats = engine.stats();
        assert!(stats.groups_dirty && stats.sections_dirty);

        engine.get_group_count().unwrap();
        let stats = engine.stats();
        assert!(!stats.groups_dirty && stats.sections_dirty);

        engine.apply_sections(Vec::new(), None).unwrap();
        assert!(!engine.stats().sections_dirty);

        engine.mark_for_recomputation();
        let stats = engine.stats();
        assert!(stats.groups_dirty && stats.sections_dirty);
    }

    #[test]
    fn test_match_config_invalidates_groups() {
        let mut engine = PersistentRouteEngine::in_memory().unwrap();
        engine.add_activity("a", sample_coords(), "Ride").unwrap();
        engine.get_group_count().unwrap();
        assert!(!engine.stats().groups_dirty);

        engine
            .set_match_config(MatchConfig {
                max_simplified_points: 10,
                simplification_tolerance: 0.0,
                ..MatchConfig::default()
            })
            .unwrap();
        assert!(engine.stats().groups_dirty);
        assert!(engine.get_signature("a").unwrap().unwrap().points.len() <= 10);
    }
}
