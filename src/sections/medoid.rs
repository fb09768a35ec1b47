//! Medoid selection.
//!
//! The medoid is the actual GPS trace with minimum total AMD (Average
//! Minimum Distance) to all other traces, so a section polyline is always
//! made of real recorded points.

use std::collections::BTreeMap;

use super::overlap::OverlapCluster;
use crate::matching::{average_min_distance, resample_route, symmetric_amd};
use crate::GpsPoint;

/// Above this many traces, each trace is compared against an even sample.
const FULL_PAIRWISE_LIMIT: usize = 10;
const SAMPLE_SIZE: usize = 5;

/// One activity's trace through a cluster.
#[derive(Debug, Clone)]
pub struct ClusterTrace {
    pub activity_id: String,
    /// Inclusive index range into the activity's full track
    pub range: (usize, usize),
    pub points: Vec<GpsPoint>,
}

/// The longest trace of every activity in the cluster, sorted by activity id.
pub fn collect_traces(cluster: &OverlapCluster) -> Vec<ClusterTrace> {
    let mut longest: BTreeMap<&str, (usize, (usize, usize), &[GpsPoint])> = BTreeMap::new();

    for overlap in &cluster.overlaps {
        for (id, range, points) in [
            (overlap.activity_a.as_str(), overlap.range_a, overlap.points_a.as_slice()),
            (overlap.activity_b.as_str(), overlap.range_b, overlap.points_b.as_slice()),
        ] {
            let len = points.len();
            match longest.get(id) {
                Some((best_len, _, _)) if *best_len >= len => {}
                _ => {
                    longest.insert(id, (len, range, points));
                }
            }
        }
    }

    longest
        .into_iter()
        .map(|(id, (_, range, points))| ClusterTrace {
            activity_id: id.to_string(),
            range,
            points: points.to_vec(),
        })
        .collect()
}

/// Index of the medoid among `traces`.
///
/// Traces must be sorted by activity id; ties keep the earlier trace, so
/// the lowest activity id wins.
pub fn select_medoid(traces: &[ClusterTrace], sample_points: usize) -> Option<usize> {
    match traces.len() {
        0 => return None,
        1 | 2 => return Some(0),
        _ => {}
    }

    let others: Vec<usize> = if traces.len() <= FULL_PAIRWISE_LIMIT {
        (0..traces.len()).collect()
    } else {
        let step = traces.len() / SAMPLE_SIZE;
        (0..traces.len()).step_by(step.max(1)).take(SAMPLE_SIZE).collect()
    };

    let mut best: Option<(usize, f64)> = None;
    for (i, trace) in traces.iter().enumerate() {
        let compared: Vec<f64> = others
            .iter()
            .filter(|&&j| j != i)
            .map(|&j| symmetric_amd(&trace.points, &traces[j].points, sample_points))
            .collect();
        if compared.is_empty() {
            continue;
        }
        let score = compared.iter().sum::<f64>() / compared.len() as f64;

        match best {
            Some((_, best_score)) if score >= best_score => {}
            _ => best = Some((i, score)),
        }
    }

    best.map(|(i, _)| i)
}

/// Mean one-way AMD of the non-medoid traces to the section polyline, in meters.
pub fn average_spread(traces: &[ClusterTrace], medoid: usize, polyline: &[GpsPoint], sample_points: usize) -> f64 {
    let reference = resample_route(polyline, sample_points);
    let spreads: Vec<f64> = traces
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != medoid)
        .map(|(_, t)| average_min_distance(&resample_route(&t.points, sample_points), &reference))
        .filter(|d| d.is_finite())
        .collect();

    if spreads.is_empty() {
        0.0
    } else {
        spreads.iter().sum::<f64>() / spreads.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace(id: &str, lng_offset: f64) -> ClusterTrace {
        ClusterTrace {
            activity_id: id.to_string(),
            range: (0, 29),
            points: (0..30)
                .map(|i| GpsPoint::new(51.50 + i as f64 * 0.0001, -0.12 + lng_offset))
                .collect(),
        }
    }

    #[test]
    fn test_medoid_picks_central_trace() {
        let traces = vec![trace("a", -0.0003), trace("b", 0.0), trace("c", 0.0003)];
        assert_eq!(select_medoid(&traces, 50), Some(1));
    }

    #[test]
    fn test_medoid_ties_break_to_lowest_id() {
        let traces = vec![trace("a", 0.0), trace("b", 0.0), trace("c", 0.0)];
        for _ in 0..5 {
            assert_eq!(select_medoid(&traces, 50), Some(0));
        }
        assert_eq!(select_medoid(&traces[1..], 50), Some(0));
    }

    #[test]
    fn test_average_spread() {
        let traces = vec![trace("a", 0.0), trace("b", 0.0003)];
        let spread = average_spread(&traces, 0, &traces[0].points, 50);
        // 0.0003 deg of longitude at 51.5N is ~21m
        assert!(spread > 18.0 && spread < 24.0, "got {}", spread);
    }
}
