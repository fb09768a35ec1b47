//! # Route Engine
//!
//! Stores GPS activities in SQLite and finds what they have in common:
//! whole routes ridden more than once, and shorter sections shared by
//! several different routes.
//!
//! Main pieces:
//! - [`PersistentRouteEngine`]: the track store, its R-tree indexes and
//!   the background section detection job
//! - [`group_signatures`]: whole-route grouping with a medoid consensus
//! - [`detect_sections_multiscale`]: frequent sections at several scales
//! - [`custom_sections`]: user-drawn sections matched in both directions
//! - [`performance`]: laps and route times read from time streams
//!
//! Cargo features: `parallel` runs pairwise overlap search and grouping on
//! rayon; `ffi` adds the UniFFI surface used by the mobile apps.
//!
//! ```rust
//! use route_engine::{compare_routes, GpsPoint, MatchConfig, RouteSignature};
//!
//! let config = MatchConfig::default();
//! let track: Vec<GpsPoint> = (0..20)
//!     .map(|i| GpsPoint::new(46.95 + i as f64 * 0.0005, 7.44))
//!     .collect();
//!
//! let morning = RouteSignature::from_points("morning", &track, &config).unwrap();
//! let evening = RouteSignature::from_points("evening", &track, &config).unwrap();
//! let matched = compare_routes(&morning, &evening, &config).unwrap();
//! assert_eq!(matched.direction, "same");
//! ```

use geo::{algorithm::simplify::Simplify, Coord, LineString};
use rstar::{RTreeObject, AABB};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// Errors shared by every layer
pub mod error;
pub use error::{EngineError, OptionExt, Result};

// Haversine distances and point/segment helpers
pub mod geo_utils;

// Flat-array and Google polyline geometry transport
pub mod codec;

// Disjoint sets for grouping and overlap clustering
pub mod union_find;
pub use union_find::UnionFind;

// Whole-route comparison by average minimum distance
pub mod matching;
pub use matching::compare_routes;

// Clustering matched signatures into route groups
pub mod grouping;
#[cfg(feature = "parallel")]
pub use grouping::group_signatures_parallel;
pub use grouping::{group_signatures, group_signatures_with_matches, should_group_routes};

// Bounding-box indexes over activities and sections
pub mod spatial_index;
pub use spatial_index::{BoundsEntry, ReverseIndex, SpatialIndex};

// Frequent sections detection (multiscale, medoid-based)
pub mod sections;
pub use sections::{
    detect_sections_multiscale, DetectionPhase, DetectionProgress, DetectionProgressCallback,
    DetectionStats, FrequentSection, MultiScaleSectionResult, PotentialSection, ScalePreset,
    SectionConfig, SectionPortion,
};

// User-drawn sections and their matches
pub mod custom_sections;
pub use custom_sections::{CustomSection, CustomSectionMatch, CustomSectionMatchConfig};

// Lap extraction from time streams
pub mod performance;

// SQLite track store and the stateful engine
pub mod persistence;
pub use persistence::{
    EngineConfig, GroupDetail, GroupSummary, PersistentEngineStats, PersistentRouteEngine,
    SectionDetectionHandle, SectionSummary,
};

// Process-wide engine facade
pub mod engine;
pub use engine::{with_engine, ENGINE};

// UniFFI exports
#[cfg(feature = "ffi")]
pub mod ffi;

#[cfg(feature = "ffi")]
uniffi::setup_scaffolding!();

/// Route `log` records to logcat, once per process.
#[cfg(target_os = "android")]
pub(crate) fn init_logging() {
    use android_logger::Config;
    use log::LevelFilter;

    android_logger::init_once(
        Config::default()
            .with_max_level(LevelFilter::Debug)
            .with_tag("RouteEngine"),
    );
}

#[cfg(not(target_os = "android"))]
pub(crate) fn init_logging() {
    // Hosts install their own `log` backend.
}

// --- Geometry ---------------------------------------------------------------

/// One WGS84 fix. Elevation is carried through storage but never matched on.
///
/// ```
/// use route_engine::GpsPoint;
/// assert!(GpsPoint::new(46.9480, 7.4474).is_valid());
/// assert!(!GpsPoint::new(-90.5, 7.4474).is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
    /// Meters above sea level, when the recording device reported it
    #[serde(default)]
    pub elevation: Option<f64>,
}

impl GpsPoint {
    /// A fix without elevation.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            elevation: None,
        }
    }

    pub fn with_elevation(latitude: f64, longitude: f64, elevation: f64) -> Self {
        Self {
            latitude,
            longitude,
            elevation: Some(elevation),
        }
    }

    /// Finite and inside [-90, 90] x [-180, 180]. NaN fails both range checks.
    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.latitude) && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// Axis-aligned bounding box in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct Bounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl Bounds {
    /// Tight box around `points`; `None` for an empty slice.
    pub fn from_points(points: &[GpsPoint]) -> Option<Self> {
        let (first, rest) = points.split_first()?;
        let seed = Bounds {
            min_lat: first.latitude,
            max_lat: first.latitude,
            min_lng: first.longitude,
            max_lng: first.longitude,
        };
        Some(rest.iter().fold(seed, |acc, p| Bounds {
            min_lat: acc.min_lat.min(p.latitude),
            max_lat: acc.max_lat.max(p.latitude),
            min_lng: acc.min_lng.min(p.longitude),
            max_lng: acc.max_lng.max(p.longitude),
        }))
    }

    pub fn center(&self) -> GpsPoint {
        GpsPoint::new(
            self.min_lat + (self.max_lat - self.min_lat) * 0.5,
            self.min_lng + (self.max_lng - self.min_lng) * 0.5,
        )
    }

    /// True when the two boxes share at least one point.
    pub fn intersects(&self, other: &Bounds) -> bool {
        self.min_lat <= other.max_lat
            && self.max_lat >= other.min_lat
            && self.min_lng <= other.max_lng
            && self.max_lng >= other.min_lng
    }

    /// True when `other` lies entirely inside these bounds, grown by `buffer_deg`.
    pub fn contains(&self, other: &Bounds, buffer_deg: f64) -> bool {
        other.min_lat >= self.min_lat - buffer_deg
            && other.max_lat <= self.max_lat + buffer_deg
            && other.min_lng >= self.min_lng - buffer_deg
            && other.max_lng <= self.max_lng + buffer_deg
    }

    /// Smallest bounds enclosing both.
    pub fn union(&self, other: &Bounds) -> Bounds {
        Bounds {
            min_lat: self.min_lat.min(other.min_lat),
            max_lat: self.max_lat.max(other.max_lat),
            min_lng: self.min_lng.min(other.min_lng),
            max_lng: self.max_lng.max(other.max_lng),
        }
    }

    pub(crate) fn envelope(&self) -> AABB<[f64; 2]> {
        AABB::from_corners([self.min_lng, self.min_lat], [self.max_lng, self.max_lat])
    }
}

/// Compact stand-in for a track, used by whole-route comparison.
///
/// Built once per activity when it is added and stored next to the track.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteSignature {
    pub activity_id: String,
    /// Douglas-Peucker output, thinned to at most `max_simplified_points`
    pub points: Vec<GpsPoint>,
    /// Length of `points` in meters
    pub total_distance: f64,
    pub start_point: GpsPoint,
    pub end_point: GpsPoint,
    pub bounds: Bounds,
    pub center: GpsPoint,
}

impl RouteSignature {
    /// Signature for `points`, skipping invalid fixes.
    ///
    /// `None` when fewer than two valid fixes remain.
    ///
    /// ```
    /// use route_engine::{GpsPoint, MatchConfig, RouteSignature};
    ///
    /// let lap = [
    ///     GpsPoint::new(46.9480, 7.4474),
    ///     GpsPoint::new(f64::NAN, 7.4480),
    ///     GpsPoint::new(46.9492, 7.4490),
    /// ];
    /// let sig = RouteSignature::from_points("lap", &lap, &MatchConfig::default()).unwrap();
    /// assert_eq!(sig.points.len(), 2);
    /// ```
    pub fn from_points(
        activity_id: &str,
        points: &[GpsPoint],
        config: &MatchConfig,
    ) -> Option<Self> {
        let valid: Vec<Coord> = points
            .iter()
            .filter(|p| p.is_valid())
            .map(|p| Coord { x: p.longitude, y: p.latitude })
            .collect();
        if valid.len() < 2 {
            return None;
        }

        let kept = LineString::new(valid).simplify(&config.simplification_tolerance).0;
        let cap = config.max_simplified_points.max(2) as usize;
        let thinned: Vec<GpsPoint> = if kept.len() > cap {
            let last = kept.len() - 1;
            (0..cap)
                .map(|i| {
                    let at = ((i * last) as f64 / (cap - 1) as f64).round() as usize;
                    kept[at.min(last)]
                })
                .map(|c| GpsPoint::new(c.y, c.x))
                .collect()
        } else {
            kept.iter().map(|c| GpsPoint::new(c.y, c.x)).collect()
        };

        if thinned.len() < 2 {
            return None;
        }
        let (&start_point, &end_point) = (thinned.first()?, thinned.last()?);
        let bounds = Bounds::from_points(&thinned)?;

        Some(Self {
            activity_id: activity_id.to_string(),
            total_distance: geo_utils::polyline_length(&thinned),
            start_point,
            end_point,
            center: bounds.center(),
            bounds,
            points: thinned,
        })
    }

    /// Index entry for the grouping pre-filter.
    pub fn route_bounds(&self) -> RouteBounds {
        RouteBounds {
            activity_id: self.activity_id.to_string(),
            bounds: self.bounds,
            distance: self.total_distance,
        }
    }
}

/// Outcome of [`compare_routes`] for a pair that matched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResult {
    pub activity_id_1: String,
    pub activity_id_2: String,
    /// 100 at or under `perfect_threshold`, 0 at `zero_threshold`
    pub match_percentage: f64,
    /// "same", "reverse" or "partial"
    pub direction: String,
    /// Symmetric average minimum distance, meters
    pub amd: f64,
}

/// Tuning for whole-route comparison and grouping.
///
/// Missing JSON fields fall back to the defaults below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct MatchConfig {
    /// AMD (meters) that still scores 100. Default 30, about GPS noise.
    pub perfect_threshold: f64,
    /// AMD (meters) that scores 0. Default 250.
    pub zero_threshold: f64,
    /// Pairs scoring below this are not linked. Default 65.
    pub min_match_percentage: f64,
    /// Shorter signatures never join a group. Default 500 m.
    pub min_route_distance: f64,
    /// Largest allowed |d1 - d2| / max(d1, d2). Default 0.20.
    pub max_distance_diff_ratio: f64,
    /// Start/end proximity used for direction and loop checks. Default 200 m.
    pub endpoint_threshold: f64,
    /// Points per route after resampling for AMD. Default 50.
    pub resample_count: u32,
    /// Douglas-Peucker epsilon in degrees. Default 1e-4, roughly 11 m.
    pub simplification_tolerance: f64,
    /// Cap on signature size. Default 100.
    pub max_simplified_points: u32,
}

impl Default for MatchConfig {
    fn default() -> Self {
        MatchConfig {
            perfect_threshold: 30.0,
            zero_threshold: 250.0,
            min_match_percentage: 65.0,
            min_route_distance: 500.0,
            max_distance_diff_ratio: 0.2,
            endpoint_threshold: 200.0,
            resample_count: 50,
            simplification_tolerance: 1e-4,
            max_simplified_points: 100,
        }
    }
}

/// A group of activities judged to be the same physical route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteGroup {
    /// Lowest member activity id
    pub group_id: String,
    /// Medoid member; its track is the consensus route
    pub representative_id: String,
    /// Sorted
    pub activity_ids: Vec<String>,
    pub sport_type: String,
    /// Union of member signature bounds
    pub bounds: Option<Bounds>,
    /// Name set by the user, if any
    pub custom_name: Option<String>,
    /// Fastest timed member, seconds
    pub best_time: Option<f64>,
    pub best_activity_id: Option<String>,
}

/// How one member compares with its group's representative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityMatchInfo {
    pub activity_id: String,
    pub match_percentage: f64,
    pub direction: String,
}

/// Groups plus, per group id, every member scored against the representative.
#[derive(Debug, Clone)]
pub struct GroupingResult {
    pub groups: Vec<RouteGroup>,
    pub activity_matches: HashMap<String, Vec<ActivityMatchInfo>>,
}

// --- Performances -----------------------------------------------------------

/// Per-activity summary supplied by the host app alongside the track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct ActivityMetrics {
    pub activity_id: String,
    pub name: String,
    /// Start time, unix seconds
    pub date: i64,
    /// Meters
    pub distance: f64,
    /// Seconds
    pub moving_time: u32,
    pub elapsed_time: u32,
    /// Meters climbed
    pub elevation_gain: f64,
    pub avg_hr: Option<u16>,
    pub avg_power: Option<u16>,
    pub sport_type: String,
}

/// One member's traversal of a route group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutePerformance {
    pub activity_id: String,
    pub name: String,
    pub date: i64,
    /// distance / duration, m/s
    pub speed: f64,
    /// First to last time stream sample, seconds
    pub duration: u32,
    pub distance: f64,
    /// Set for the activity passed as `current_activity_id`
    pub is_current: bool,
    pub direction: String,
    pub match_percentage: f64,
}

/// Timed members of one route group.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutePerformanceResult {
    /// Oldest first
    pub performances: Vec<RoutePerformance>,
    /// Shortest duration
    pub best: Option<RoutePerformance>,
    /// 1-based rank by duration of the requested activity
    pub current_rank: Option<u32>,
}

/// A single traversal of a section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionLap {
    pub id: String,
    pub activity_id: String,
    /// Seconds between the boundary samples
    pub time: f64,
    /// m/s
    pub pace: f64,
    pub distance: f64,
    /// "same" or "reverse"
    pub direction: String,
    /// Inclusive track index range
    pub start_index: u32,
    pub end_index: u32,
}

/// Laps of one activity over one section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionPerformanceRecord {
    pub activity_id: String,
    pub activity_name: String,
    pub activity_date: i64,
    pub laps: Vec<SectionLap>,
    pub lap_count: u32,
    pub best_time: f64,
    pub best_pace: f64,
    pub avg_time: f64,
    pub avg_pace: f64,
    /// Of the first lap
    pub direction: String,
    pub section_distance: f64,
}

/// Every timed traversal of a section, grouped by activity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionPerformanceResult {
    /// Oldest activity first
    pub records: Vec<SectionPerformanceRecord>,
    /// Record holding the fastest lap
    pub best_record: Option<SectionPerformanceRecord>,
    /// Traversals across all candidate activities, timed or not
    pub visit_count: u32,
    /// Activities that traverse the section but have no time stream
    pub untimed_activity_ids: Vec<String>,
}

// --- Indexing ---------------------------------------------------------------

/// Signature bounds, as stored in the grouping R-tree.
#[derive(Debug, Clone)]
pub struct RouteBounds {
    pub activity_id: String,
    pub bounds: Bounds,
    pub distance: f64,
}

impl RTreeObject for RouteBounds {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.bounds.envelope()
    }
}
