//! Locating every pass of a track over a reference polyline.
//!
//! Used for section portions, custom section matches and lap timing. Each
//! track point is matched to a reference vertex; matched runs are split
//! where the reference index reverses, so an out-and-back yields two
//! traversals, one per direction.

use rstar::RTree;
use serde::{Deserialize, Serialize};

use super::rtree::{build_rtree, IndexedPoint, TrackMatcher};
use crate::geo_utils::{cumulative_distances, polyline_length};
use crate::GpsPoint;

/// Allow small gaps for GPS noise
const MAX_GAP: usize = 3;

/// One pass of a track over a reference polyline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Traversal {
    /// First track index of the pass
    pub start_index: usize,
    /// Last track index of the pass (inclusive)
    pub end_index: usize,
    /// "same" or "reverse" relative to the reference
    pub direction: String,
    /// Length of the track between start and end, in meters
    pub distance_meters: f64,
    /// Fraction of the reference length covered (0-1)
    pub coverage: f64,
}

/// Every disjoint pass of `track` over `reference` covering at least `min_coverage`.
///
/// Passes are ordered by start index.
pub fn find_traversals(
    track: &[GpsPoint],
    reference: &[GpsPoint],
    threshold: f64,
    min_coverage: f64,
) -> Vec<Traversal> {
    if track.len() < 2 || reference.len() < 2 {
        return Vec::new();
    }
    let ref_tree = build_rtree(reference);
    find_traversals_with_tree(track, reference, &ref_tree, threshold, min_coverage)
}

/// [`find_traversals`] with a prebuilt reference R-tree.
pub fn find_traversals_with_tree(
    track: &[GpsPoint],
    reference: &[GpsPoint],
    ref_tree: &RTree<IndexedPoint>,
    threshold: f64,
    min_coverage: f64,
) -> Vec<Traversal> {
    let ref_cumulative = cumulative_distances(reference);
    let ref_length = ref_cumulative.last().copied().unwrap_or(0.0);
    if ref_length <= 0.0 || track.len() < 2 {
        return Vec::new();
    }

    let matcher = TrackMatcher::new(reference, ref_tree, threshold);
    let hysteresis = (reference.len() / 20).clamp(2, 10);

    let mut traversals = Vec::new();
    for run in matched_runs(track, &matcher, MAX_GAP) {
        let ref_indices: Vec<usize> = run.iter().map(|&(_, r)| r).collect();

        for (seg_start, seg_end) in monotonic_segments(&ref_indices, hysteresis) {
            let (s, e) = trim_endpoints(&ref_indices, seg_start, seg_end);

            let min_ref = ref_indices[s..=e].iter().copied().min().unwrap_or(0);
            let max_ref = ref_indices[s..=e].iter().copied().max().unwrap_or(0);
            let coverage = (ref_cumulative[max_ref] - ref_cumulative[min_ref]) / ref_length;
            if coverage + 1e-9 < min_coverage {
                continue;
            }

            let (start_index, end_index) = (run[s].0, run[e].0);
            if end_index <= start_index {
                continue;
            }

            traversals.push(Traversal {
                start_index,
                end_index,
                direction: direction_of(ref_indices[s], ref_indices[e]).to_string(),
                distance_meters: polyline_length(&track[start_index..=end_index]),
                coverage: coverage.min(1.0),
            });
        }
    }

    traversals
}

/// Runs of `(track_index, target_index)` matches, tolerating up to `max_gap`
/// unmatched points inside a run.
pub(crate) fn matched_runs(
    track: &[GpsPoint],
    matcher: &TrackMatcher<'_>,
    max_gap: usize,
) -> Vec<Vec<(usize, usize)>> {
    let mut runs = Vec::new();
    let mut current: Vec<(usize, usize)> = Vec::new();
    let mut gap = 0;

    for (i, point) in track.iter().enumerate() {
        let prev = current.last().map(|&(_, r)| r);
        match matcher.match_point(point, prev) {
            Some(r) => {
                current.push((i, r));
                gap = 0;
            }
            None if !current.is_empty() => {
                gap += 1;
                if gap > max_gap {
                    runs.push(std::mem::take(&mut current));
                    gap = 0;
                }
            }
            None => {}
        }
    }

    if !current.is_empty() {
        runs.push(current);
    }
    runs
}

/// Split a sequence of target indices where it reverses by at least `hysteresis`.
///
/// Returns inclusive `(start, end)` positions into `indices`. Consecutive
/// segments do not share a position; the turnaround belongs to the first.
pub(crate) fn monotonic_segments(indices: &[usize], hysteresis: usize) -> Vec<(usize, usize)> {
    if indices.is_empty() {
        return Vec::new();
    }

    let h = hysteresis.max(1) as i64;
    let mut segments = Vec::new();
    let mut seg_start = 0usize;
    let mut direction: i64 = 0;
    let mut extreme = 0usize;

    for k in 1..indices.len() {
        let value = indices[k] as i64;
        match direction {
            0 => {
                let delta = value - indices[seg_start] as i64;
                if delta.abs() >= h {
                    direction = delta.signum();
                    extreme = k;
                }
            }
            dir => {
                let extreme_value = indices[extreme] as i64;
                if (value - extreme_value) * dir >= 0 {
                    extreme = k;
                } else if (extreme_value - value) * dir >= h {
                    segments.push((seg_start, extreme));
                    seg_start = (extreme + 1).min(k);
                    direction = -dir;
                    extreme = k;
                }
            }
        }
    }

    segments.push((seg_start, indices.len() - 1));
    segments
}

/// Drop leading/trailing points that map to the same target vertex as their
/// neighbour, keeping the one nearest the inside of the pass.
fn trim_endpoints(indices: &[usize], mut start: usize, mut end: usize) -> (usize, usize) {
    while start < end && indices[start + 1] == indices[start] {
        start += 1;
    }
    while end > start && indices[end - 1] == indices[end] {
        end -= 1;
    }
    (start, end)
}

fn direction_of(first: usize, last: usize) -> &'static str {
    if last < first {
        "reverse"
    } else {
        "same"
    }
}
