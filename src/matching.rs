//! Whole-route similarity.
//!
//! Two signatures are resampled to the same number of evenly spaced points
//! and scored by their average minimum distance (AMD), taken both ways. The
//! score maps linearly onto 0..=100 between the configured thresholds.

use crate::geo_utils::haversine_distance;
use crate::{GpsPoint, MatchConfig, MatchResult, RouteSignature};

/// Swapped endpoints must be this much closer (meters) to call a pair reversed.
const REVERSE_MARGIN: f64 = 100.0;

/// Below this score the endpoints say nothing reliable about direction.
const DIRECTION_MIN_SCORE: f64 = 70.0;

/// Score `b` against `a`.
///
/// `None` when one route is less than half as long as the other, or when the
/// score falls under `config.min_match_percentage`.
///
/// ```
/// use route_engine::matching::compare_routes;
/// use route_engine::{GpsPoint, MatchConfig, RouteSignature};
///
/// let config = MatchConfig::default();
/// let out = [GpsPoint::new(46.9480, 7.4474), GpsPoint::new(46.9560, 7.4474)];
/// let back = [out[1], out[0]];
///
/// let a = RouteSignature::from_points("out", &out, &config).unwrap();
/// let b = RouteSignature::from_points("back", &back, &config).unwrap();
/// assert_eq!(compare_routes(&a, &b, &config).unwrap().direction, "reverse");
/// ```
pub fn compare_routes(
    a: &RouteSignature,
    b: &RouteSignature,
    config: &MatchConfig,
) -> Option<MatchResult> {
    let (short, long) = if a.total_distance <= b.total_distance {
        (a.total_distance, b.total_distance)
    } else {
        (b.total_distance, a.total_distance)
    };
    if long <= 0.0 || short * 2.0 < long {
        return None;
    }

    let amd = symmetric_amd(&a.points, &b.points, config.resample_count as usize);
    let score = amd_score(amd, config.perfect_threshold, config.zero_threshold);
    if score < config.min_match_percentage {
        return None;
    }

    let direction = if score < DIRECTION_MIN_SCORE {
        "partial"
    } else {
        endpoint_direction(a, b, config.endpoint_threshold)
    };

    Some(MatchResult {
        activity_id_1: a.activity_id.to_string(),
        activity_id_2: b.activity_id.to_string(),
        match_percentage: score,
        direction: direction.to_string(),
        amd,
    })
}

/// Mean of the AMD in each direction, after resampling both routes.
pub fn symmetric_amd(a: &[GpsPoint], b: &[GpsPoint], resample_count: usize) -> f64 {
    let a = resample_route(a, resample_count);
    let b = resample_route(b, resample_count);
    0.5 * (average_min_distance(&a, &b) + average_min_distance(&b, &a))
}

/// For every point of `from`, the distance to the nearest point of `to`,
/// averaged. Infinite if either side is empty.
pub fn average_min_distance(from: &[GpsPoint], to: &[GpsPoint]) -> f64 {
    if from.is_empty() || to.is_empty() {
        return f64::INFINITY;
    }
    let nearest = |p: &GpsPoint| {
        to.iter()
            .map(|q| haversine_distance(p, q))
            .fold(f64::INFINITY, f64::min)
    };
    from.iter().map(nearest).sum::<f64>() / from.len() as f64
}

/// 100 at or under `perfect`, 0 at or over `zero`, linear in between.
pub fn amd_score(amd: f64, perfect: f64, zero: f64) -> f64 {
    if amd <= perfect {
        return 100.0;
    }
    let t = (amd - perfect) / (zero - perfect);
    (100.0 * (1.0 - t)).clamp(0.0, 100.0)
}

/// `count` points spaced evenly by arc length, keeping both endpoints.
///
/// Tracks with fewer than two points, or with zero length, are returned
/// (truncated) as they are.
pub fn resample_route(points: &[GpsPoint], count: usize) -> Vec<GpsPoint> {
    let count = count.max(2);
    if points.len() < 2 || points.len() == count {
        return points.to_vec();
    }

    let mut along = Vec::with_capacity(points.len());
    along.push(0.0);
    for pair in points.windows(2) {
        let so_far = along[along.len() - 1];
        along.push(so_far + haversine_distance(&pair[0], &pair[1]));
    }
    let total = along[along.len() - 1];
    if total <= 0.0 {
        return points[..count.min(points.len())].to_vec();
    }

    let mut out = Vec::with_capacity(count);
    out.push(points[0]);
    for k in 1..count - 1 {
        let target = total * k as f64 / (count - 1) as f64;
        // along[0] == 0 < target, so hi >= 1
        let hi = along.partition_point(|&d| d < target).min(points.len() - 1);
        let lo = hi - 1;
        let span = along[hi] - along[lo];
        let t = if span > 0.0 { (target - along[lo]) / span } else { 0.0 };
        let (p, q) = (&points[lo], &points[hi]);
        out.push(GpsPoint::new(
            p.latitude + t * (q.latitude - p.latitude),
            p.longitude + t * (q.longitude - p.longitude),
        ));
    }
    out.push(points[points.len() - 1]);
    out
}

/// "reverse" when `b` starts near `a`'s end and ends near its start,
/// otherwise "same". Two loops always count as "same".
pub fn endpoint_direction(
    a: &RouteSignature,
    b: &RouteSignature,
    loop_radius: f64,
) -> &'static str {
    let is_loop =
        |s: &RouteSignature| haversine_distance(&s.start_point, &s.end_point) < loop_radius;
    if is_loop(a) && is_loop(b) {
        return "same";
    }

    let aligned = haversine_distance(&a.start_point, &b.start_point)
        + haversine_distance(&a.end_point, &b.end_point);
    let swapped = haversine_distance(&a.end_point, &b.start_point)
        + haversine_distance(&a.start_point, &b.end_point);

    if swapped + REVERSE_MARGIN < aligned {
        "reverse"
    } else {
        "same"
    }
}
