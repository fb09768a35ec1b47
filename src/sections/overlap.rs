//! Pairwise overlap detection and clustering.

use std::collections::BTreeSet;

use rstar::{RTree, RTreeObject, AABB};

use super::rtree::{build_rtree, IndexedPoint, TrackMatcher};
use super::traversals::{matched_runs, monotonic_segments};
use crate::geo_utils::{expand_bounds, polyline_length};
use crate::union_find::UnionFind;
use crate::{Bounds, GpsPoint};

/// Reference-index reversal (in points) that splits an overlap at a fold.
const FOLD_HYSTERESIS: usize = 5;

/// Points sampled when comparing two overlaps.
const CLUSTER_SAMPLES: usize = 10;

/// A stretch of track A running alongside track B.
#[derive(Debug, Clone)]
pub struct FullTrackOverlap {
    pub activity_a: String,
    pub activity_b: String,
    /// Inclusive index range into track A
    pub range_a: (usize, usize),
    /// Inclusive index range into track B
    pub range_b: (usize, usize),
    /// The actual GPS points from track A
    pub points_a: Vec<GpsPoint>,
    /// The actual GPS points from track B
    pub points_b: Vec<GpsPoint>,
    /// Length of the A side in meters
    pub length: f64,
    pub bounds: Bounds,
}

/// Overlaps judged to be the same physical stretch.
#[derive(Debug)]
pub struct OverlapCluster {
    pub overlaps: Vec<FullTrackOverlap>,
    /// Unique activity ids, sorted
    pub activity_ids: BTreeSet<String>,
}

/// Parameters of one scale's overlap search.
#[derive(Debug, Clone, Copy)]
pub struct OverlapParams {
    /// Lateral tolerance in meters
    pub tolerance: f64,
    /// Minimum overlap length in meters
    pub window_length: f64,
    /// Maximum overlap length in meters, `None` for unbounded
    pub max_length: Option<f64>,
}

/// Find every stretch of track A that stays within tolerance of track B.
///
/// A stretch is a strictly consecutive run of matched points, split where
/// it folds back along B. It is kept when its length on A is at least the
/// window length and at most the maximum length.
pub fn find_track_overlaps(
    activity_a: &str,
    track_a: &[GpsPoint],
    activity_b: &str,
    track_b: &[GpsPoint],
    tree_b: &RTree<IndexedPoint>,
    params: &OverlapParams,
) -> Vec<FullTrackOverlap> {
    let matcher = TrackMatcher::new(track_b, tree_b, params.tolerance);
    let mut overlaps = Vec::new();

    for run in matched_runs(track_a, &matcher, 0) {
        let indices_b: Vec<usize> = run.iter().map(|&(_, b)| b).collect();

        for (s, e) in monotonic_segments(&indices_b, FOLD_HYSTERESIS) {
            let (a_start, a_end) = (run[s].0, run[e].0);
            if a_end <= a_start {
                continue;
            }

            let points_a = track_a[a_start..=a_end].to_vec();
            let length = polyline_length(&points_a);
            if length < params.window_length {
                continue;
            }
            if params.max_length.is_some_and(|max| length > max) {
                continue;
            }

            let b_min = indices_b[s..=e].iter().copied().min().unwrap_or(0);
            let b_max = indices_b[s..=e].iter().copied().max().unwrap_or(0);
            let Some(bounds) = Bounds::from_points(&points_a) else {
                continue;
            };

            overlaps.push(FullTrackOverlap {
                activity_a: activity_a.to_string(),
                activity_b: activity_b.to_string(),
                range_a: (a_start, a_end),
                range_b: (b_min, b_max),
                points_a,
                points_b: track_b[b_min..=b_max].to_vec(),
                length,
                bounds,
            });
        }
    }

    overlaps
}

struct OverlapEnvelope {
    idx: usize,
    bounds: Bounds,
}

impl RTreeObject for OverlapEnvelope {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.bounds.envelope()
    }
}

/// Cluster overlaps by transitive closure.
///
/// Two overlaps are linked when their bounds (grown by `tolerance`)
/// intersect and at least half of each one's sampled points lie within
/// `tolerance` of the other. Clusters come back ordered by their first
/// overlap index.
pub fn cluster_overlaps(overlaps: Vec<FullTrackOverlap>, tolerance: f64) -> Vec<OverlapCluster> {
    if overlaps.is_empty() {
        return vec![];
    }

    let trees: Vec<RTree<IndexedPoint>> = overlaps.iter().map(|o| build_rtree(&o.points_a)).collect();
    let index = RTree::bulk_load(
        overlaps
            .iter()
            .enumerate()
            .map(|(idx, o)| OverlapEnvelope {
                idx,
                bounds: expand_bounds(&o.bounds, tolerance),
            })
            .collect(),
    );

    let mut uf = UnionFind::with_capacity(overlaps.len());
    for i in 0..overlaps.len() {
        uf.make_set(i);
    }

    for (i, overlap) in overlaps.iter().enumerate() {
        for candidate in index.locate_in_envelope_intersecting(&overlap.bounds.envelope()) {
            let j = candidate.idx;
            if j <= i || uf.connected(&i, &j) {
                continue;
            }
            let other = &overlaps[j];
            if samples_match(&overlap.points_a, &other.points_a, &trees[j], tolerance)
                && samples_match(&other.points_a, &overlap.points_a, &trees[i], tolerance)
            {
                uf.union(&i, &j);
            }
        }
    }

    let mut slots: Vec<Option<FullTrackOverlap>> = overlaps.into_iter().map(Some).collect();
    uf.sorted_groups()
        .into_iter()
        .map(|members| {
            let overlaps: Vec<FullTrackOverlap> =
                members.iter().filter_map(|&i| slots[i].take()).collect();
            let activity_ids = overlaps
                .iter()
                .flat_map(|o| [o.activity_a.clone(), o.activity_b.clone()])
                .collect();
            OverlapCluster {
                overlaps,
                activity_ids,
            }
        })
        .collect()
}

/// At least half of `CLUSTER_SAMPLES` evenly spaced points of `poly_a` are near `poly_b`.
fn samples_match(
    poly_a: &[GpsPoint],
    poly_b: &[GpsPoint],
    tree_b: &RTree<IndexedPoint>,
    tolerance: f64,
) -> bool {
    if poly_a.is_empty() || poly_b.is_empty() {
        return false;
    }

    let matcher = TrackMatcher::new(poly_b, tree_b, tolerance);
    let sample_count = CLUSTER_SAMPLES.min(poly_a.len());
    let step = (poly_a.len() / sample_count).max(1);

    let matches = (0..poly_a.len())
        .step_by(step)
        .take(sample_count)
        .filter(|&i| matcher.match_point(&poly_a[i], None).is_some())
        .count();

    matches * 2 >= sample_count
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(n: usize, lat0: f64, lng: f64) -> Vec<GpsPoint> {
        (0..n)
            .map(|i| GpsPoint::new(lat0 + i as f64 * 0.0001, lng))
            .collect()
    }

    fn params() -> OverlapParams {
        OverlapParams {
            tolerance: 30.0,
            window_length: 200.0,
            max_length: Some(5000.0),
        }
    }

    #[test]
    fn test_shared_stretch_found() {
        // A: 100 points north; B: west approach, then A's points 30..80, then east
        let track_a = line(100, 51.50, -0.12);
        let mut track_b: Vec<GpsPoint> = (0..20)
            .map(|i| GpsPoint::new(51.503, -0.14 + i as f64 * 0.0009))
            .collect();
        track_b.extend_from_slice(&track_a[30..80]);
        track_b.extend((1..20).map(|i| GpsPoint::new(51.508, -0.12 + i as f64 * 0.0009)));

        let tree_b = build_rtree(&track_b);
        let overlaps = find_track_overlaps("a", &track_a, "b", &track_b, &tree_b, &params());

        assert_eq!(overlaps.len(), 1);
        let o = &overlaps[0];
        assert!(o.range_a.0 >= 28 && o.range_a.0 <= 30);
        assert!(o.range_a.1 >= 79 && o.range_a.1 <= 81);
        assert!(o.length > 500.0 && o.length < 600.0);
    }

    #[test]
    fn test_short_and_long_overlaps_rejected() {
        let track = line(100, 51.50, -0.12);
        let tree = build_rtree(&track);

        let too_short = OverlapParams { window_length: 2000.0, ..params() };
        assert!(find_track_overlaps("a", &track, "b", &track, &tree, &too_short).is_empty());

        let too_long = OverlapParams { max_length: Some(500.0), ..params() };
        assert!(find_track_overlaps("a", &track, "b", &track, &tree, &too_long).is_empty());

        let unbounded = OverlapParams { max_length: None, ..params() };
        assert_eq!(find_track_overlaps("a", &track, "b", &track, &tree, &unbounded).len(), 1);
    }

    #[test]
    fn test_cluster_links_same_stretch_only() {
        let shared = line(60, 51.50, -0.12);
        let elsewhere = line(60, 51.60, -0.12);
        let make = |a: &str, b: &str, pts: &[GpsPoint]| FullTrackOverlap {
            activity_a: a.to_string(),
            activity_b: b.to_string(),
            range_a: (0, pts.len() - 1),
            range_b: (0, pts.len() - 1),
            points_a: pts.to_vec(),
            points_b: pts.to_vec(),
            length: polyline_length(pts),
            bounds: Bounds::from_points(pts).unwrap(),
        };

        let clusters = cluster_overlaps(
            vec![
                make("a", "b", &shared),
                make("x", "y", &elsewhere),
                make("b", "c", &shared),
            ],
            30.0,
        );

        assert_eq!(clusters.len(), 2);
        assert_eq!(
            clusters[0].activity_ids.iter().cloned().collect::<Vec<_>>(),
            vec!["a", "b", "c"]
        );
        assert_eq!(clusters[0].overlaps.len(), 2);
    }
}
