//! Lap extraction from time streams.
//!
//! Durations always come from the per-point time stream over the matched
//! index range (`time[end] - time[start]`), never from average speed.

use std::cmp::Ordering;

use crate::custom_sections::CustomSectionMatchConfig;
use crate::sections::find_traversals;
use crate::{
    ActivityMatchInfo, ActivityMetrics, GpsPoint, RoutePerformance, RoutePerformanceResult,
    SectionLap, SectionPerformanceRecord, SectionPerformanceResult,
};

/// One activity considered for a section's performances.
#[derive(Debug, Clone, Copy)]
pub struct LapCandidate<'a> {
    pub activity_id: &'a str,
    pub track: &'a [GpsPoint],
    /// Cumulative seconds per track point, if known
    pub times: Option<&'a [u32]>,
    pub metrics: Option<&'a ActivityMetrics>,
}

/// Seconds between two track indices, if the stream covers them and time advances.
pub fn lap_duration(times: &[u32], start_index: usize, end_index: usize) -> Option<f64> {
    let start = *times.get(start_index)?;
    let end = *times.get(end_index)?;
    (end > start).then(|| (end - start) as f64)
}

/// Total recorded duration of a stream.
pub fn stream_duration(times: &[u32]) -> Option<u32> {
    match (times.first(), times.last()) {
        (Some(&first), Some(&last)) if last > first => Some(last - first),
        _ => None,
    }
}

/// All laps of `activity_id` over `polyline`, one per disjoint traversal.
///
/// Returns the number of traversals alongside the timed laps; traversals
/// whose duration cannot be taken from `times` produce no lap.
pub fn extract_laps(
    activity_id: &str,
    track: &[GpsPoint],
    times: Option<&[u32]>,
    polyline: &[GpsPoint],
    config: &CustomSectionMatchConfig,
) -> (usize, Vec<SectionLap>) {
    let traversals = find_traversals(
        track,
        polyline,
        config.proximity_threshold,
        config.min_coverage,
    );

    let Some(times) = times else {
        return (traversals.len(), Vec::new());
    };

    let laps = traversals
        .iter()
        .enumerate()
        .filter_map(|(i, t)| {
            let time = lap_duration(times, t.start_index, t.end_index)?;
            Some(SectionLap {
                id: format!("{}_lap_{}", activity_id, i + 1),
                activity_id: activity_id.to_string(),
                time,
                pace: t.distance_meters / time,
                distance: t.distance_meters,
                direction: t.direction.clone(),
                start_index: t.start_index as u32,
                end_index: t.end_index as u32,
            })
        })
        .collect();

    (traversals.len(), laps)
}

fn fastest(a: &SectionLap, b: &SectionLap) -> Ordering {
    a.time.total_cmp(&b.time)
}

fn build_record(
    candidate: &LapCandidate<'_>,
    laps: Vec<SectionLap>,
    section_distance: f64,
) -> Option<SectionPerformanceRecord> {
    let best = laps.iter().min_by(|a, b| fastest(a, b))?.clone();
    let count = laps.len() as f64;
    let avg_time = laps.iter().map(|l| l.time).sum::<f64>() / count;
    let avg_pace = laps.iter().map(|l| l.pace).sum::<f64>() / count;

    Some(SectionPerformanceRecord {
        activity_id: candidate.activity_id.to_string(),
        activity_name: candidate
            .metrics
            .map(|m| m.name.clone())
            .unwrap_or_default(),
        activity_date: candidate.metrics.map(|m| m.date).unwrap_or(0),
        lap_count: laps.len() as u32,
        best_time: best.time,
        best_pace: best.pace,
        avg_time,
        avg_pace,
        direction: laps[0].direction.clone(),
        section_distance,
        laps,
    })
}

/// Performances of every candidate over a section polyline.
///
/// Candidates without a time stream that still traverse the section are
/// counted in `visit_count` and listed in `untimed_activity_ids`.
pub fn section_performances(
    polyline: &[GpsPoint],
    section_distance: f64,
    candidates: &[LapCandidate<'_>],
    config: &CustomSectionMatchConfig,
) -> SectionPerformanceResult {
    let mut result = SectionPerformanceResult::default();

    for candidate in candidates {
        let (visits, laps) = extract_laps(
            candidate.activity_id,
            candidate.track,
            candidate.times,
            polyline,
            config,
        );
        if visits == 0 {
            continue;
        }
        result.visit_count += visits as u32;

        if candidate.times.is_none() {
            result
                .untimed_activity_ids
                .push(candidate.activity_id.to_string());
            continue;
        }
        if let Some(record) = build_record(candidate, laps, section_distance) {
            result.records.push(record);
        }
    }

    result.records.sort_by(|a, b| {
        a.activity_date
            .cmp(&b.activity_date)
            .then_with(|| a.activity_id.cmp(&b.activity_id))
    });
    result.best_record = result
        .records
        .iter()
        .min_by(|a, b| a.best_time.total_cmp(&b.best_time))
        .cloned();
    result.untimed_activity_ids.sort();
    result
}

/// One group member's inputs for route performances.
#[derive(Debug, Clone, Copy)]
pub struct RouteMember<'a> {
    pub activity_id: &'a str,
    pub times: Option<&'a [u32]>,
    pub metrics: Option<&'a ActivityMetrics>,
    /// Route distance in meters, used when no metrics are stored
    pub distance: f64,
    pub match_info: Option<&'a ActivityMatchInfo>,
}

/// Route performances for a group, sorted by date, with the fastest member
/// and the rank of `current_activity_id` (1 = fastest).
///
/// Members with neither a time stream nor metrics are skipped.
pub fn route_performances(
    members: &[RouteMember<'_>],
    current_activity_id: Option<&str>,
) -> RoutePerformanceResult {
    let mut performances: Vec<RoutePerformance> = members
        .iter()
        .filter_map(|m| {
            let duration = m
                .times
                .and_then(stream_duration)
                .or_else(|| m.metrics.map(|x| x.elapsed_time).filter(|&t| t > 0))?;
            let distance = m.metrics.map(|x| x.distance).unwrap_or(m.distance);
            let (match_percentage, direction) = m
                .match_info
                .map(|i| (i.match_percentage, i.direction.clone()))
                .unwrap_or((100.0, "same".to_string()));

            Some(RoutePerformance {
                activity_id: m.activity_id.to_string(),
                name: m.metrics.map(|x| x.name.clone()).unwrap_or_default(),
                date: m.metrics.map(|x| x.date).unwrap_or(0),
                speed: distance / duration as f64,
                duration,
                distance,
                is_current: current_activity_id == Some(m.activity_id),
                direction,
                match_percentage,
            })
        })
        .collect();

    // Oldest first for charting
    performances.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.activity_id.cmp(&b.activity_id)));

    let mut by_time: Vec<&RoutePerformance> = performances.iter().collect();
    by_time.sort_by(|a, b| a.duration.cmp(&b.duration).then_with(|| a.activity_id.cmp(&b.activity_id)));

    let best = by_time.first().map(|p| (*p).clone());
    let current_rank = current_activity_id.and_then(|id| {
        by_time
            .iter()
            .position(|p| p.activity_id == id)
            .map(|idx| (idx + 1) as u32)
    });

    RoutePerformanceResult {
        performances,
        best,
        current_rank,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo_utils::polyline_length;

    fn straight_track(n: usize) -> Vec<GpsPoint> {
        (0..n)
            .map(|i| GpsPoint::new(51.50 + i as f64 * 0.0001, -0.12))
            .collect()
    }

    fn metrics(id: &str, date: i64, elapsed: u32) -> ActivityMetrics {
        ActivityMetrics {
            activity_id: id.to_string(),
            name: format!("Run {}", id),
            date,
            distance: 5000.0,
            moving_time: elapsed,
            elapsed_time: elapsed,
            elevation_gain: 0.0,
            avg_hr: None,
            avg_power: None,
            sport_type: "Run".to_string(),
        }
    }

    #[test]
    fn test_lap_duration() {
        let times = [0, 5, 12, 20];
        assert_eq!(lap_duration(&times, 1, 3), Some(15.0));
        assert_eq!(lap_duration(&times, 2, 2), None);
        assert_eq!(lap_duration(&times, 0, 9), None);
        assert_eq!(stream_duration(&times), Some(20));
        assert_eq!(stream_duration(&[]), None);
    }

    #[test]
    fn test_out_and_back_gives_two_laps() {
        let section = straight_track(40);
        let mut track = section.clone();
        track.extend(section.iter().rev().skip(1).copied());
        let times: Vec<u32> = (0..track.len() as u32).map(|i| i * 3).collect();

        let (visits, laps) = extract_laps(
            "a",
            &track,
            Some(&times),
            &section,
            &CustomSectionMatchConfig::default(),
        );
        assert_eq!(visits, 2);
        assert_eq!(laps.len(), 2);
        for lap in &laps {
            assert!(lap.time.is_finite() && lap.time > 0.0);
            assert!(lap.pace > 0.0);
        }
        assert_eq!(laps[0].direction, "same");
        assert_eq!(laps[1].direction, "reverse");
    }

    #[test]
    fn test_untimed_activity_counted_not_timed() {
        let section = straight_track(40);
        let track_a = straight_track(50);
        let track_b = straight_track(50);
        let times_a: Vec<u32> = (0..50).collect();
        let m_a = metrics("a", 100, 50);

        let candidates = [
            LapCandidate { activity_id: "a", track: &track_a, times: Some(&times_a), metrics: Some(&m_a) },
            LapCandidate { activity_id: "b", track: &track_b, times: None, metrics: None },
        ];
        let result = section_performances(
            &section,
            polyline_length(&section),
            &candidates,
            &CustomSectionMatchConfig::default(),
        );

        assert_eq!(result.visit_count, 2);
        assert_eq!(result.records.len(), 1);
        assert_eq!(result.untimed_activity_ids, vec!["b".to_string()]);
        let best = result.best_record.unwrap();
        assert_eq!(best.activity_id, "a");
        assert_eq!(best.activity_name, "Run a");
    }

    #[test]
    fn test_route_performances_rank_by_duration() {
        let m_a = metrics("a", 300, 0);
        let m_b = metrics("b", 100, 0);
        let times_a: Vec<u32> = vec![0, 100, 900];
        let times_b: Vec<u32> = vec![0, 100, 1200];

        let members = [
            RouteMember { activity_id: "a", times: Some(&times_a), metrics: Some(&m_a), distance: 5000.0, match_info: None },
            RouteMember { activity_id: "b", times: Some(&times_b), metrics: Some(&m_b), distance: 5000.0, match_info: None },
            RouteMember { activity_id: "c", times: None, metrics: None, distance: 5000.0, match_info: None },
        ];
        let result = route_performances(&members, Some("b"));

        assert_eq!(result.performances.len(), 2);
        assert_eq!(result.performances[0].activity_id, "b");
        assert_eq!(result.best.unwrap().activity_id, "a");
        assert_eq!(result.current_rank, Some(2));
    }
}
