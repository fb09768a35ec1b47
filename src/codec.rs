//! Geometry transport formats.
//!
//! Polylines cross the API boundary either as flat coordinate arrays
//! (`[lat0, lng0, lat1, lng1, ...]`) or as Google-encoded polyline strings
//! at precision 5 (~1e-5 degrees, roughly 1 meter).

use geo::LineString;

use crate::error::{EngineError, Result};
use crate::GpsPoint;

/// Google polyline precision used everywhere in the engine.
pub const POLYLINE_PRECISION: u32 = 5;

/// Convert a flat `[lat, lng, ...]` buffer to points. A trailing odd value is ignored.
pub fn flat_to_points(flat: &[f64]) -> Vec<GpsPoint> {
    flat.chunks_exact(2)
        .map(|chunk| GpsPoint::new(chunk[0], chunk[1]))
        .collect()
}

/// Convert points to a flat `[lat, lng, ...]` buffer.
pub fn points_to_flat(points: &[GpsPoint]) -> Vec<f64> {
    points
        .iter()
        .flat_map(|p| [p.latitude, p.longitude])
        .collect()
}

/// Slice one flat coordinate buffer into per-activity tracks.
///
/// `offsets[i]` is the index, in points, where track `i` starts. Track `i`
/// ends at `offsets[i + 1]`, the last one at the end of the buffer.
pub fn split_flat_tracks(
    ids: &[String],
    flat_coords: &[f64],
    offsets: &[u32],
) -> Result<Vec<(String, Vec<GpsPoint>)>> {
    if ids.len() != offsets.len() {
        return Err(EngineError::validation(
            "offsets",
            format!("{} ids but {} offsets", ids.len(), offsets.len()),
        ));
    }
    if flat_coords.len() % 2 != 0 {
        return Err(EngineError::validation(
            "coordinates",
            "flat buffer must hold lat/lng pairs",
        ));
    }

    let total_points = flat_coords.len() / 2;
    let mut tracks = Vec::with_capacity(ids.len());

    for (i, id) in ids.iter().enumerate() {
        let start = offsets[i] as usize;
        let end = offsets
            .get(i + 1)
            .map(|&o| o as usize)
            .unwrap_or(total_points);

        if start > end || end > total_points {
            return Err(EngineError::validation(
                "offsets",
                format!("track '{}' spans points {}..{} of {}", id, start, end, total_points),
            ));
        }

        tracks.push((id.clone(), flat_to_points(&flat_coords[start * 2..end * 2])));
    }

    Ok(tracks)
}

/// Encode points as a Google polyline string. Empty input encodes to `""`.
pub fn encode_polyline(points: &[GpsPoint]) -> Result<String> {
    if points.is_empty() {
        return Ok(String::new());
    }

    // geo coordinates are (x, y) = (lng, lat)
    let line: LineString<f64> = points.iter().map(|p| (p.longitude, p.latitude)).collect();

    polyline::encode_coordinates(line, POLYLINE_PRECISION)
        .map_err(|e| EngineError::validation("polyline", e.to_string()))
}

/// Decode a Google polyline string. An empty string decodes to no points.
pub fn decode_polyline(encoded: &str) -> Result<Vec<GpsPoint>> {
    if encoded.is_empty() {
        return Ok(Vec::new());
    }

    let line = polyline::decode_polyline(encoded, POLYLINE_PRECISION)
        .map_err(|e| EngineError::validation("polyline", e.to_string()))?;

    Ok(line.coords().map(|c| GpsPoint::new(c.y, c.x)).collect())
}

/// Encode a flat `[lat, lng, ...]` buffer directly.
pub fn encode_flat(flat: &[f64]) -> Result<String> {
    encode_polyline(&flat_to_points(flat))
}

/// Decode straight to a flat `[lat, lng, ...]` buffer.
pub fn decode_to_flat(encoded: &str) -> Result<Vec<f64>> {
    decode_polyline(encoded).map(|points| points_to_flat(&points))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_round_trip(points: &[GpsPoint]) {
        let encoded = encode_polyline(points).unwrap();
        let decoded = decode_polyline(&encoded).unwrap();
        assert_eq!(decoded.len(), points.len());
        for (a, b) in points.iter().zip(decoded.iter()) {
            assert!((a.latitude - b.latitude).abs() <= 1e-5);
            assert!((a.longitude - b.longitude).abs() <= 1e-5);
        }
    }

    #[test]
    fn test_empty_round_trip() {
        assert_eq!(encode_polyline(&[]).unwrap(), "");
        assert!(decode_polyline("").unwrap().is_empty());
    }

    #[test]
    fn test_single_point_round_trip() {
        assert_round_trip(&[GpsPoint::new(51.50741, -0.12782)]);
    }

    #[test]
    fn test_known_encoding() {
        // Reference example from the polyline algorithm documentation
        let points = vec![
            GpsPoint::new(38.5, -120.2),
            GpsPoint::new(40.7, -120.95),
            GpsPoint::new(43.252, -126.453),
        ];
        assert_eq!(encode_polyline(&points).unwrap(), "_p~iF~ps|U_ulLnnqC_mqNvxq`@");
    }

    #[test]
    fn test_large_round_trip() {
        let points: Vec<GpsPoint> = (0..12_000)
            .map(|i| {
                let t = i as f64 * 0.001;
                GpsPoint::new(46.5 + t.sin() * 0.05, 6.6 + t * 0.01)
            })
            .collect();
        assert_round_trip(&points);
    }

    #[test]
    fn test_flat_round_trip() {
        let flat = vec![51.5, -0.12, 51.51, -0.13];
        let encoded = encode_flat(&flat).unwrap();
        let decoded = decode_to_flat(&encoded).unwrap();
        assert_eq!(decoded.len(), 4);
        assert!((decoded[2] - 51.51).abs() < 1e-9);
    }

    #[test]
    fn test_split_flat_tracks() {
        let ids = vec!["a".to_string(), "b".to_string()];
        let flat = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let tracks = split_flat_tracks(&ids, &flat, &[0, 2]).unwrap();
        assert_eq!(tracks[0].1.len(), 2);
        assert_eq!(tracks[1].1, vec![GpsPoint::new(5.0, 6.0)]);
    }

    #[test]
    fn test_split_flat_tracks_rejects_bad_offsets() {
        let ids = vec!["a".to_string(), "b".to_string()];
        let flat = vec![1.0, 2.0, 3.0, 4.0];
        assert!(split_flat_tracks(&ids, &flat, &[0]).is_err());
        assert!(split_flat_tracks(&ids, &flat, &[2, 1]).is_err());
        assert!(split_flat_tracks(&ids, &flat, &[0, 5]).is_err());
    }
}
