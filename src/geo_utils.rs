//! # Geographic Utilities
//!
//! Core geographic computations shared by matching, detection and the store.
//!
//! | Function | Description |
//! |----------|-------------|
//! | [`haversine_distance`] | Great-circle distance between two GPS points |
//! | [`polyline_length`] | Total length of a GPS track in meters |
//! | [`cumulative_distances`] | Running distance at every point of a track |
//! | [`point_to_segment_distance`] | Lateral distance from a point to a track segment |
//! | [`compute_bounds`] | Bounding box of a GPS track |
//! | [`bounds_overlap`] | Check if two bounding boxes overlap |
//! | [`meters_to_degrees`] | Convert meters to approximate degrees at a latitude |
//!
//! All functions expect WGS84 coordinates in degrees.

use crate::{Bounds, GpsPoint};
use geo::{Distance, Haversine, Point};

// =============================================================================
// Distance Functions
// =============================================================================

/// Great-circle distance between two GPS points in meters.
///
/// ```rust
/// use route_engine::{GpsPoint, geo_utils};
///
/// let london = GpsPoint::new(51.5074, -0.1278);
/// let paris = GpsPoint::new(48.8566, 2.3522);
///
/// let distance = geo_utils::haversine_distance(&london, &paris);
/// assert!((distance - 343_560.0).abs() < 5000.0);
/// ```
#[inline]
pub fn haversine_distance(p1: &GpsPoint, p2: &GpsPoint) -> f64 {
    let point1 = Point::new(p1.longitude, p1.latitude);
    let point2 = Point::new(p2.longitude, p2.latitude);
    Haversine::distance(point1, point2)
}

/// Total length of a polyline in meters. Empty or single-point tracks return 0.0.
pub fn polyline_length(points: &[GpsPoint]) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }

    points
        .windows(2)
        .map(|w| haversine_distance(&w[0], &w[1]))
        .sum()
}

/// Distance from the first point to every point, same length as `points`.
pub fn cumulative_distances(points: &[GpsPoint]) -> Vec<f64> {
    let mut cumulative = Vec::with_capacity(points.len());
    let mut total = 0.0;
    for (i, p) in points.iter().enumerate() {
        if i > 0 {
            total += haversine_distance(&points[i - 1], p);
        }
        cumulative.push(total);
    }
    cumulative
}

/// Convert meters to approximate degrees at a given latitude.
///
/// Uses the longitude scale at `latitude` (the smaller of the two axes), so
/// the result is a conservative, slightly large, square search radius.
#[inline]
pub fn meters_to_degrees(meters: f64, latitude: f64) -> f64 {
    let lat_rad = latitude.to_radians();
    let meters_per_degree = 111_320.0 * lat_rad.cos().max(0.1);
    meters / meters_per_degree
}

/// Distance in meters from `p` to the segment `a`-`b`.
///
/// Uses a local equirectangular projection around `p`, accurate for the
/// short segments of a GPS track.
pub fn point_to_segment_distance(p: &GpsPoint, a: &GpsPoint, b: &GpsPoint) -> f64 {
    const METERS_PER_DEGREE: f64 = 111_320.0;
    let lng_scale = METERS_PER_DEGREE * p.latitude.to_radians().cos();

    let (ax, ay) = ((a.longitude - p.longitude) * lng_scale, (a.latitude - p.latitude) * METERS_PER_DEGREE);
    let (bx, by) = ((b.longitude - p.longitude) * lng_scale, (b.latitude - p.latitude) * METERS_PER_DEGREE);
    let (dx, dy) = (bx - ax, by - ay);
    let len_sq = dx * dx + dy * dy;

    if len_sq <= f64::EPSILON {
        return haversine_distance(p, a);
    }

    // Projection of the origin (p) onto the segment, clamped to its ends
    let t = (-(ax * dx + ay * dy) / len_sq).clamp(0.0, 1.0);
    let (cx, cy) = (ax + t * dx, ay + t * dy);
    (cx * cx + cy * cy).sqrt()
}

// =============================================================================
// Bounding Box Functions
// =============================================================================

/// Bounding box of a GPS track.
///
/// For empty input, returns inverted MIN/MAX bounds that fail every overlap check.
pub fn compute_bounds(points: &[GpsPoint]) -> Bounds {
    Bounds::from_points(points).unwrap_or(Bounds {
        min_lat: f64::MAX,
        max_lat: f64::MIN,
        min_lng: f64::MAX,
        max_lng: f64::MIN,
    })
}

/// Check whether two bounding boxes overlap once grown by `buffer_meters`.
pub fn bounds_overlap(a: &Bounds, b: &Bounds, buffer_meters: f64, reference_lat: f64) -> bool {
    let buffer_deg = meters_to_degrees(buffer_meters, reference_lat);

    !(a.max_lat + buffer_deg < b.min_lat
        || b.max_lat + buffer_deg < a.min_lat
        || a.max_lng + buffer_deg < b.min_lng
        || b.max_lng + buffer_deg < a.min_lng)
}

/// Grow bounds by `buffer_meters` on every side.
pub fn expand_bounds(bounds: &Bounds, buffer_meters: f64) -> Bounds {
    let ref_lat = (bounds.min_lat + bounds.max_lat) / 2.0;
    let buffer_deg = meters_to_degrees(buffer_meters, ref_lat);
    Bounds {
        min_lat: bounds.min_lat - buffer_deg,
        max_lat: bounds.max_lat + buffer_deg,
        min_lng: bounds.min_lng - buffer_deg,
        max_lng: bounds.max_lng + buffer_deg,
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f64, b: f64, epsilon: f64) -> bool {
        (a - b).abs() < epsilon
    }

    #[test]
    fn test_haversine_distance_same_point() {
        let p = GpsPoint::new(51.5074, -0.1278);
        assert_eq!(haversine_distance(&p, &p), 0.0);
    }

    #[test]
    fn test_polyline_length_degenerate() {
        assert_eq!(polyline_length(&[]), 0.0);
        assert_eq!(polyline_length(&[GpsPoint::new(51.5074, -0.1278)]), 0.0);
    }

    #[test]
    fn test_polyline_length_two_points() {
        let track = vec![
            GpsPoint::new(51.5074, -0.1278),
            GpsPoint::new(51.5080, -0.1280),
        ];
        let length = polyline_length(&track);
        assert!(length > 60.0 && length < 80.0);
    }

    #[test]
    fn test_cumulative_distances_matches_length() {
        let track: Vec<GpsPoint> = (0..20)
            .map(|i| GpsPoint::new(51.5 + i as f64 * 0.0005, -0.12))
            .collect();
        let cumulative = cumulative_distances(&track);
        assert_eq!(cumulative.len(), track.len());
        assert_eq!(cumulative[0], 0.0);
        assert!(approx_eq(*cumulative.last().unwrap(), polyline_length(&track), 1e-6));
    }

    #[test]
    fn test_point_to_segment_distance() {
        let a = GpsPoint::new(51.5000, -0.1200);
        let b = GpsPoint::new(51.5100, -0.1200);
        // ~70m east of the middle of a north-south segment
        let p = GpsPoint::new(51.5050, -0.1190);
        let d = point_to_segment_distance(&p, &a, &b);
        assert!(d > 65.0 && d < 72.0, "got {}", d);

        // Beyond the end the distance is to the endpoint
        let beyond = GpsPoint::new(51.5110, -0.1200);
        let d_end = point_to_segment_distance(&beyond, &a, &b);
        assert!(approx_eq(d_end, haversine_distance(&beyond, &b), 1.0));
    }

    #[test]
    fn test_compute_bounds() {
        let track = vec![
            GpsPoint::new(51.50, -0.13),
            GpsPoint::new(51.51, -0.12),
            GpsPoint::new(51.505, -0.125),
        ];
        let bounds = compute_bounds(&track);
        assert_eq!(bounds.min_lat, 51.50);
        assert_eq!(bounds.max_lat, 51.51);
        assert_eq!(bounds.min_lng, -0.13);
        assert_eq!(bounds.max_lng, -0.12);
    }

    #[test]
    fn test_bounds_overlap_with_buffer() {
        let a = Bounds { min_lat: 51.50, max_lat: 51.51, min_lng: -0.13, max_lng: -0.12 };
        // ~110m north of `a`
        let b = Bounds { min_lat: 51.511, max_lat: 51.52, min_lng: -0.13, max_lng: -0.12 };
        assert!(!bounds_overlap(&a, &b, 0.0, 51.5));
        assert!(bounds_overlap(&a, &b, 200.0, 51.5));
    }

    #[test]
    fn test_expand_bounds_grows_every_side() {
        let a = Bounds { min_lat: 51.50, max_lat: 51.51, min_lng: -0.13, max_lng: -0.12 };
        let grown = expand_bounds(&a, 100.0);
        assert!(grown.contains(&a, 0.0));
        assert!(grown.min_lat < a.min_lat && grown.max_lng > a.max_lng);
    }
}
