//! # Multiscale Section Detection
//!
//! Detects frequently-traveled road sections from FULL GPS tracks at several
//! spatial scales.
//!
//! ## Algorithm
//! 1. Bucket tracks by sport; per scale, skip tracks shorter than the window
//! 2. Build one point R-tree per track
//! 3. For every pair with overlapping bounds, find consecutive runs of
//!    track A within the scale's lateral tolerance of track B
//! 4. Cluster overlaps of the same physical stretch (union-find)
//! 5. Per cluster, adopt the medoid trace as the polyline (real GPS points,
//!    never averaged) and locate every activity's traversals of it
//! 6. Deduplicate across scales, name, and sort by visit count
//!
//! Cancellation is cooperative: the progress sink is asked between phases.

mod medoid;
mod overlap;
mod postprocess;
mod progress;
mod rtree;
mod traversals;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Instant;

use log::info;
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::geo_utils::{bounds_overlap, compute_bounds, polyline_length};
use crate::{Bounds, GpsPoint};

pub(crate) use medoid::{average_spread, collect_traces, select_medoid};
pub(crate) use overlap::{cluster_overlaps, find_track_overlaps, OverlapCluster, OverlapParams};
pub use postprocess::{overlap_ratio, polylines_overlap, sport_slug};
pub(crate) use postprocess::{assign_ids_and_names, remove_duplicate_sections, to_potentials};
pub use progress::{DetectionAborted, DetectionPhase, DetectionProgress, DetectionProgressCallback};
pub use rtree::{build_rtree, IndexedPoint, TrackMatcher};
pub use traversals::{find_traversals, find_traversals_with_tree, Traversal};

/// One granularity of section detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct ScalePreset {
    /// "short", "medium", "long"
    pub name: String,
    /// Minimum overlap length in meters
    pub window_length: f64,
    /// Maximum lateral deviation in meters
    pub lateral_tolerance: f64,
    /// Overlaps longer than this belong to a larger scale (None = unbounded)
    pub max_length: Option<f64>,
    /// Distinct activities needed for a section
    pub min_activities: u32,
}

impl ScalePreset {
    pub fn short() -> Self {
        Self {
            name: "short".to_string(),
            window_length: 100.0,
            lateral_tolerance: 30.0,
            max_length: Some(800.0),
            min_activities: 2,
        }
    }

    pub fn medium() -> Self {
        Self {
            name: "medium".to_string(),
            window_length: 500.0,
            lateral_tolerance: 40.0,
            max_length: Some(3000.0),
            min_activities: 2,
        }
    }

    pub fn long() -> Self {
        Self {
            name: "long".to_string(),
            window_length: 2500.0,
            lateral_tolerance: 50.0,
            max_length: None,
            min_activities: 2,
        }
    }

    /// Short, medium and long, smallest first.
    pub fn default_presets() -> Vec<Self> {
        vec![Self::short(), Self::medium(), Self::long()]
    }
}

/// Configuration for section detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct SectionConfig {
    /// Scales to detect at, smallest first
    pub scale_presets: Vec<ScalePreset>,
    /// Maximum distance from a section polyline for an activity's traversal (meters)
    pub proximity_threshold: f64,
    /// Tolerance for clustering and deduplicating similar overlaps (meters)
    pub cluster_tolerance: f64,
    /// Return raw candidates as potentials alongside the sections
    pub include_potentials: bool,
    /// Point overlap at which two sections count as duplicates (0-1)
    pub dedup_overlap_ratio: f64,
    /// Fraction of a section a traversal must cover (0-1)
    pub min_coverage: f64,
    /// Number of sample points for AMD comparison (not for output!)
    pub sample_points: u32,
}

impl Default for SectionConfig {
    fn default() -> Self {
        Self {
            scale_presets: ScalePreset::default_presets(),
            proximity_threshold: 50.0,
            cluster_tolerance: 50.0,
            include_potentials: false,
            dedup_overlap_ratio: 0.9,
            min_coverage: 0.8,
            sample_points: 50,
        }
    }
}

/// Each activity's traversal of a section (for pace comparison)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct SectionPortion {
    pub activity_id: String,
    /// Start index into the activity's FULL GPS track
    pub start_index: u32,
    /// End index into the activity's FULL GPS track (inclusive)
    pub end_index: u32,
    /// Distance of this portion in meters
    pub distance_meters: f64,
    /// Direction relative to the section polyline: "same" or "reverse"
    pub direction: String,
}

impl SectionPortion {
    pub fn from_traversal(activity_id: &str, traversal: &Traversal) -> Self {
        Self {
            activity_id: activity_id.to_string(),
            start_index: traversal.start_index as u32,
            end_index: traversal.end_index as u32,
            distance_meters: traversal.distance_meters,
            direction: traversal.direction.clone(),
        }
    }
}

/// A frequently-traveled section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct FrequentSection {
    pub id: String,
    /// Display name; user overrides are applied by the store
    pub name: Option<String>,
    pub sport_type: String,
    /// Exact points of the reference activity's track
    pub polyline: Vec<GpsPoint>,
    /// Activity the polyline was taken from
    pub representative_activity_id: String,
    /// Activities with at least one traversal, sorted
    pub activity_ids: Vec<String>,
    /// Every traversal of every contributing activity
    pub activity_portions: Vec<SectionPortion>,
    /// Number of traversals
    pub visit_count: u32,
    pub distance_meters: f64,
    /// 0-1, grows with contributors and shrinks with spread
    pub confidence: f64,
    /// Mean AMD of the other traces to the polyline, in meters
    pub average_spread: f64,
    /// Name of the scale preset that produced the section
    pub scale: String,
    pub bounds: Bounds,
    /// The user chose the reference activity
    #[serde(default)]
    pub reference_pinned: bool,
}

/// A raw, unpersisted section candidate for user review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct PotentialSection {
    pub id: String,
    pub sport_type: String,
    pub polyline: Vec<GpsPoint>,
    pub activity_ids: Vec<String>,
    pub visit_count: u32,
    pub distance_meters: f64,
    pub confidence: f64,
    pub scale: String,
}

/// Counters from one detection run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionStats {
    pub activities_processed: u32,
    pub pairs_checked: u32,
    pub overlaps_found: u32,
    pub clusters_found: u32,
    /// Scale name -> sections kept after dedup
    pub sections_per_scale: BTreeMap<String, u32>,
    pub potentials_found: u32,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiScaleSectionResult {
    pub sections: Vec<FrequentSection>,
    /// Pre-dedup candidates, only when `include_potentials` is set
    pub potentials: Vec<PotentialSection>,
    pub stats: DetectionStats,
}

/// Confidence from contributor count and spread, in [0, 1].
pub fn section_confidence(contributors: usize, average_spread: f64, tolerance: f64) -> f64 {
    let n = contributors.max(1) as i32;
    let count_term = 1.0 - 0.5f64.powi(n - 1);
    let spread_term = if tolerance > 0.0 {
        1.0 - (average_spread / tolerance).min(1.0)
    } else {
        0.0
    };
    (0.5 * count_term + 0.5 * spread_term).clamp(0.0, 1.0)
}

fn checkpoint(progress: &dyn DetectionProgressCallback) -> Result<(), DetectionAborted> {
    if progress.is_cancelled() {
        Err(DetectionAborted)
    } else {
        Ok(())
    }
}

#[cfg(feature = "parallel")]
fn map_items<T, R, F>(items: &[T], f: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync + Send,
{
    items.par_iter().map(f).collect()
}

#[cfg(not(feature = "parallel"))]
fn map_items<T, R, F>(items: &[T], f: F) -> Vec<R>
where
    F: Fn(&T) -> R,
{
    items.iter().map(f).collect()
}

struct TrackIndex {
    tree: rstar::RTree<IndexedPoint>,
    length: f64,
    bounds: Bounds,
}

/// One (sport, scale) combination with its own overlap pool.
struct Bucket {
    sport: String,
    scale: usize,
}

struct PairJob {
    bucket: usize,
    i: usize,
    j: usize,
}

/// Turn one cluster into a section, or `None` when fewer than the preset's
/// minimum activities actually traverse the medoid polyline.
fn build_section(
    cluster: &OverlapCluster,
    sport_type: &str,
    preset: &ScalePreset,
    tracks: &HashMap<&str, &[GpsPoint]>,
    config: &SectionConfig,
) -> Option<FrequentSection> {
    let sample_points = config.sample_points as usize;
    let traces = collect_traces(cluster);
    let medoid = select_medoid(&traces, sample_points)?;
    let representative = &traces[medoid];
    if representative.points.len() < 2 {
        return None;
    }

    let polyline = representative.points.clone();
    let tree = build_rtree(&polyline);
    let tolerance = config.proximity_threshold.max(preset.lateral_tolerance);

    let mut portions = Vec::new();
    for activity_id in &cluster.activity_ids {
        let Some(track) = tracks.get(activity_id.as_str()) else {
            continue;
        };
        portions.extend(
            find_traversals_with_tree(track, &polyline, &tree, tolerance, config.min_coverage)
                .iter()
                .map(|t| SectionPortion::from_traversal(activity_id, t)),
        );
    }

    let activity_ids: Vec<String> = portions
        .iter()
        .map(|p| p.activity_id.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    if activity_ids.len() < (preset.min_activities as usize).max(2) {
        return None;
    }

    let spread = average_spread(&traces, medoid, &polyline, sample_points);

    Some(FrequentSection {
        id: String::new(),
        name: None,
        sport_type: sport_type.to_string(),
        bounds: compute_bounds(&polyline),
        distance_meters: polyline_length(&polyline),
        representative_activity_id: representative.activity_id.clone(),
        confidence: section_confidence(activity_ids.len(), spread, preset.lateral_tolerance),
        visit_count: portions.len() as u32,
        activity_ids,
        activity_portions: portions,
        polyline,
        average_spread: spread,
        scale: preset.name.clone(),
        reference_pinned: false,
    })
}

/// Detect frequent sections from FULL GPS tracks at every configured scale.
///
/// Tracks are bucketed by `sport_types` (missing entries go under
/// "Unknown"). Returns `Err(DetectionAborted)` if `progress` reports a
/// cancellation at a phase boundary.
pub fn detect_sections_multiscale(
    tracks: &[(String, Vec<GpsPoint>)],
    sport_types: &HashMap<String, String>,
    config: &SectionConfig,
    progress: &dyn DetectionProgressCallback,
) -> Result<MultiScaleSectionResult, DetectionAborted> {
    let start = Instant::now();
    let mut stats = DetectionStats::default();

    let mut by_sport: BTreeMap<String, Vec<(&str, &[GpsPoint])>> = BTreeMap::new();
    for (activity_id, points) in tracks {
        if points.len() < 2 {
            continue;
        }
        let sport = sport_types
            .get(activity_id)
            .cloned()
            .unwrap_or_else(|| "Unknown".to_string());
        by_sport
            .entry(sport)
            .or_default()
            .push((activity_id.as_str(), points.as_slice()));
    }

    // Flat, id-sorted track list; each sport owns a contiguous range
    let mut flat: Vec<(&str, &[GpsPoint])> = Vec::new();
    let mut sport_ranges: Vec<(String, std::ops::Range<usize>)> = Vec::new();
    for (sport, mut list) in by_sport {
        list.sort_by(|a, b| a.0.cmp(b.0));
        list.dedup_by(|a, b| a.0 == b.0);
        let begin = flat.len();
        flat.extend(list);
        sport_ranges.push((sport, begin..flat.len()));
    }
    stats.activities_processed = flat.len() as u32;

    info!(
        "[Sections] Detecting from {} tracks across {} sports, {} scales",
        flat.len(),
        sport_ranges.len(),
        config.scale_presets.len()
    );

    // Phase: per-track R-trees
    checkpoint(progress)?;
    progress.on_phase(DetectionPhase::BuildingRtrees, flat.len() as u32);
    let rtree_start = Instant::now();
    let indexed: Vec<TrackIndex> = map_items(&flat, |&(_, points)| {
        let index = TrackIndex {
            tree: build_rtree(points),
            length: polyline_length(points),
            bounds: compute_bounds(points),
        };
        progress.on_progress();
        index
    });
    info!(
        "[Sections] Built {} R-trees in {}ms",
        indexed.len(),
        rtree_start.elapsed().as_millis()
    );

    // Phase: pairwise overlaps
    checkpoint(progress)?;
    let mut buckets: Vec<Bucket> = Vec::new();
    let mut jobs: Vec<PairJob> = Vec::new();
    for (sport, range) in &sport_ranges {
        for (scale, preset) in config.scale_presets.iter().enumerate() {
            let eligible: Vec<usize> = range
                .clone()
                .filter(|&i| indexed[i].length >= preset.window_length)
                .collect();
            if eligible.len() < (preset.min_activities as usize).max(2) {
                continue;
            }

            let bucket = buckets.len();
            buckets.push(Bucket {
                sport: sport.clone(),
                scale,
            });
            for (k, &i) in eligible.iter().enumerate() {
                for &j in &eligible[k + 1..] {
                    let (a, b) = (&indexed[i].bounds, &indexed[j].bounds);
                    if bounds_overlap(a, b, preset.lateral_tolerance, a.center().latitude) {
                        jobs.push(PairJob { bucket, i, j });
                    }
                }
            }
        }
    }
    stats.pairs_checked = jobs.len() as u32;

    progress.on_phase(DetectionPhase::FindingOverlaps, jobs.len() as u32);
    let overlap_start = Instant::now();
    let found = map_items(&jobs, |job| {
        let preset = &config.scale_presets[buckets[job.bucket].scale];
        let params = OverlapParams {
            tolerance: preset.lateral_tolerance,
            window_length: preset.window_length,
            max_length: preset.max_length,
        };
        let (id_a, track_a) = flat[job.i];
        let (id_b, track_b) = flat[job.j];
        let overlaps = find_track_overlaps(id_a, track_a, id_b, track_b, &indexed[job.j].tree, &params);
        progress.on_progress();
        overlaps
    });

    let mut bucket_overlaps: Vec<Vec<_>> = (0..buckets.len()).map(|_| Vec::new()).collect();
    for (job, overlaps) in jobs.iter().zip(found) {
        stats.overlaps_found += overlaps.len() as u32;
        bucket_overlaps[job.bucket].extend(overlaps);
    }
    info!(
        "[Sections] Found {} overlaps in {} pairs in {}ms",
        stats.overlaps_found,
        stats.pairs_checked,
        overlap_start.elapsed().as_millis()
    );

    // Phase: clustering
    checkpoint(progress)?;
    progress.on_phase(DetectionPhase::Clustering, buckets.len() as u32);
    let cluster_start = Instant::now();
    let mut clusters: Vec<(usize, OverlapCluster)> = Vec::new();
    for (bucket, overlaps) in bucket_overlaps.into_iter().enumerate() {
        let preset = &config.scale_presets[buckets[bucket].scale];
        let min_activities = (preset.min_activities as usize).max(2);
        clusters.extend(
            cluster_overlaps(overlaps, config.cluster_tolerance)
                .into_iter()
                .filter(|c| c.activity_ids.len() >= min_activities)
                .map(|c| (bucket, c)),
        );
        progress.on_progress();
    }
    stats.clusters_found = clusters.len() as u32;
    info!(
        "[Sections] {} significant clusters in {}ms",
        clusters.len(),
        cluster_start.elapsed().as_millis()
    );

    // Phase: medoid sections
    checkpoint(progress)?;
    progress.on_phase(DetectionPhase::BuildingSections, clusters.len() as u32);
    let build_start = Instant::now();
    let track_lookup: HashMap<&str, &[GpsPoint]> = flat.iter().copied().collect();
    let candidates: Vec<FrequentSection> = map_items(&clusters, |(bucket, cluster)| {
        let bucket = &buckets[*bucket];
        let preset = &config.scale_presets[bucket.scale];
        let section = build_section(cluster, &bucket.sport, preset, &track_lookup, config);
        progress.on_progress();
        section
    })
    .into_iter()
    .flatten()
    .collect();
    info!(
        "[Sections] Built {} candidate sections in {}ms",
        candidates.len(),
        build_start.elapsed().as_millis()
    );

    // Phase: dedup, naming
    checkpoint(progress)?;
    progress.on_phase(DetectionPhase::Postprocessing, sport_ranges.len() as u32);
    let post_start = Instant::now();
    let scale_rank = |name: &str| {
        config
            .scale_presets
            .iter()
            .position(|p| p.name == name)
            .unwrap_or(0)
    };

    let mut candidates_by_sport: BTreeMap<String, Vec<FrequentSection>> = BTreeMap::new();
    for candidate in candidates {
        candidates_by_sport
            .entry(candidate.sport_type.clone())
            .or_default()
            .push(candidate);
    }

    let mut sections = Vec::new();
    let mut potentials = Vec::new();
    for (sport, mut sport_candidates) in candidates_by_sport {
        sport_candidates.sort_by(|a, b| {
            b.visit_count
                .cmp(&a.visit_count)
                .then(b.distance_meters.total_cmp(&a.distance_meters))
                .then(a.representative_activity_id.cmp(&b.representative_activity_id))
        });
        if config.include_potentials {
            potentials.extend(to_potentials(&sport_candidates, &sport));
        }

        let mut kept = remove_duplicate_sections(
            sport_candidates,
            &scale_rank,
            config.cluster_tolerance,
            config.dedup_overlap_ratio,
        );
        assign_ids_and_names(&mut kept, &sport);
        for section in &kept {
            *stats.sections_per_scale.entry(section.scale.clone()).or_insert(0) += 1;
        }
        sections.extend(kept);
        progress.on_progress();
    }

    sections.sort_by(|a, b| b.visit_count.cmp(&a.visit_count).then(a.id.cmp(&b.id)));
    stats.potentials_found = potentials.len() as u32;
    stats.elapsed_ms = start.elapsed().as_millis() as u64;

    info!(
        "[Sections] Postprocessed in {}ms, detected {} sections ({} potentials) in {}ms",
        post_start.elapsed().as_millis(),
        sections.len(),
        potentials.len(),
        stats.elapsed_ms
    );

    Ok(MultiScaleSectionResult {
        sections,
        potentials,
        stats,
    })
}
