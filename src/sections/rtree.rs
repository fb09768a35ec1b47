//! Point R-trees and nearest-point matching against a track.

use rstar::{PointDistance, RTree, RTreeObject, AABB};

use crate::geo_utils::{haversine_distance, meters_to_degrees, point_to_segment_distance};
use crate::GpsPoint;

/// A GPS point with its index for R-tree queries
#[derive(Debug, Clone, Copy)]
pub struct IndexedPoint {
    pub idx: usize,
    pub lat: f64,
    pub lng: f64,
}

impl RTreeObject for IndexedPoint {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point([self.lat, self.lng])
    }
}

impl PointDistance for IndexedPoint {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        let dlat = self.lat - point[0];
        let dlng = self.lng - point[1];
        dlat * dlat + dlng * dlng
    }
}

/// Build R-tree from GPS points for efficient spatial queries
pub fn build_rtree(points: &[GpsPoint]) -> RTree<IndexedPoint> {
    let indexed: Vec<IndexedPoint> = points
        .iter()
        .enumerate()
        .map(|(i, p)| IndexedPoint {
            idx: i,
            lat: p.latitude,
            lng: p.longitude,
        })
        .collect();
    RTree::bulk_load(indexed)
}

/// Vertices within this many indices of the previous match are preferred.
const CONTINUITY_WINDOW: usize = 20;

/// Matches query points onto a target track within a lateral tolerance.
///
/// A point matches when its distance to one of the track segments around a
/// nearby vertex is within `tolerance` meters. Vertices near the previous
/// match win over closer ones elsewhere on the track, so out-and-back
/// tracks don't flip between their two legs.
pub struct TrackMatcher<'a> {
    track: &'a [GpsPoint],
    tree: &'a RTree<IndexedPoint>,
    tolerance: f64,
}

impl<'a> TrackMatcher<'a> {
    pub fn new(track: &'a [GpsPoint], tree: &'a RTree<IndexedPoint>, tolerance: f64) -> Self {
        Self {
            track,
            tree,
            tolerance,
        }
    }

    /// Index of the matched vertex on the target track, if any.
    pub fn match_point(&self, point: &GpsPoint, prev: Option<usize>) -> Option<usize> {
        let query = [point.latitude, point.longitude];
        let radius = meters_to_degrees(self.tolerance, point.latitude);

        let mut candidates: Vec<usize> = self
            .tree
            .locate_within_distance(query, radius * radius)
            .map(|p| p.idx)
            .collect();
        // Sparse tracks may have no vertex in range while a segment still is
        if let Some(nearest) = self.tree.nearest_neighbor(&query) {
            candidates.push(nearest.idx);
        }

        // Ranked by (near the previous match, distance to the vertex, index gap)
        let mut best: Option<(bool, f64, usize, usize)> = None;
        for idx in candidates {
            if self.lateral_distance(point, idx) > self.tolerance {
                continue;
            }
            let gap = prev.map_or(0, |p| idx.abs_diff(p));
            let in_window = gap <= CONTINUITY_WINDOW;
            let vertex_dist = haversine_distance(point, &self.track[idx]);
            let better = match best {
                None => true,
                Some((best_window, best_dist, best_gap, best_idx)) => {
                    (in_window && !best_window)
                        || (in_window == best_window
                            && (vertex_dist < best_dist
                                || (vertex_dist == best_dist
                                    && (gap < best_gap || (gap == best_gap && idx < best_idx)))))
                }
            };
            if better {
                best = Some((in_window, vertex_dist, gap, idx));
            }
        }

        best.map(|(_, _, _, idx)| idx)
    }

    /// Distance from `point` to the segments adjacent to vertex `idx`.
    pub fn lateral_distance(&self, point: &GpsPoint, idx: usize) -> f64 {
        let vertex = &self.track[idx];
        let before = idx
            .checked_sub(1)
            .map(|i| point_to_segment_distance(point, &self.track[i], vertex));
        let after = self
            .track
            .get(idx + 1)
            .map(|next| point_to_segment_distance(point, vertex, next));

        match (before, after) {
            (Some(a), Some(b)) => a.min(b),
            (Some(d), None) | (None, Some(d)) => d,
            (None, None) => haversine_distance(point, vertex),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(n: usize, lng: f64) -> Vec<GpsPoint> {
        (0..n)
            .map(|i| GpsPoint::new(51.50 + i as f64 * 0.0001, lng))
            .collect()
    }

    #[test]
    fn test_match_point_within_tolerance() {
        let track = line(50, -0.12);
        let tree = build_rtree(&track);
        let matcher = TrackMatcher::new(&track, &tree, 30.0);

        // ~14m east of vertex 10
        let near = GpsPoint::new(51.5010, -0.1198);
        assert_eq!(matcher.match_point(&near, None), Some(10));

        // ~140m east
        let far = GpsPoint::new(51.5010, -0.118);
        assert_eq!(matcher.match_point(&far, None), None);
    }

    #[test]
    fn test_match_point_prefers_continuity() {
        // Out-and-back: vertex i and vertex 99 - i coincide
        let out = line(50, -0.12);
        let mut track = out.clone();
        track.extend(out.iter().rev());
        let tree = build_rtree(&track);
        let matcher = TrackMatcher::new(&track, &tree, 30.0);

        let fix = track[20];
        assert_eq!(matcher.match_point(&fix, Some(79)), Some(79));
        assert_eq!(matcher.match_point(&fix, Some(20)), Some(20));
        assert!(matcher.match_point(&fix, Some(90)).unwrap() >= 50);
        assert!(matcher.match_point(&fix, Some(5)).unwrap() < 50);
    }

    #[test]
    fn test_sparse_track_matches_segment() {
        // Vertices ~1.1km apart, fix sits on the segment between them
        let track = vec![GpsPoint::new(51.50, -0.12), GpsPoint::new(51.51, -0.12)];
        let tree = build_rtree(&track);
        let matcher = TrackMatcher::new(&track, &tree, 30.0);
        assert!(matcher.match_point(&GpsPoint::new(51.505, -0.12), None).is_some());
    }
}
