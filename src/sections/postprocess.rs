//! Post-processing: cross-scale deduplication, naming and ordering.

use std::cmp::Ordering;

use log::debug;

use super::rtree::{build_rtree, TrackMatcher};
use super::{FrequentSection, PotentialSection};
use crate::geo_utils::meters_to_degrees;
use crate::{Bounds, GpsPoint};

/// Fraction of `inner` points within `tolerance` meters of `outer`.
pub fn overlap_ratio(inner: &[GpsPoint], outer: &[GpsPoint], tolerance: f64) -> f64 {
    if inner.is_empty() || outer.is_empty() {
        return 0.0;
    }

    let tree = build_rtree(outer);
    let matcher = TrackMatcher::new(outer, &tree, tolerance);
    let mut prev = None;
    let mut matched = 0usize;
    for point in inner {
        if let Some(idx) = matcher.match_point(point, prev) {
            matched += 1;
            prev = Some(idx);
        }
    }
    matched as f64 / inner.len() as f64
}

/// True when one polyline's bounds lie inside the other's (grown by
/// `tolerance`) and at least `min_ratio` of the contained polyline's points
/// are within `tolerance` of the containing one.
pub fn polylines_overlap(a: &[GpsPoint], b: &[GpsPoint], tolerance: f64, min_ratio: f64) -> bool {
    let (Some(bounds_a), Some(bounds_b)) = (Bounds::from_points(a), Bounds::from_points(b)) else {
        return false;
    };
    let buffer = meters_to_degrees(tolerance, bounds_a.center().latitude);

    if bounds_b.contains(&bounds_a, buffer) && overlap_ratio(a, b, tolerance) >= min_ratio {
        return true;
    }
    bounds_a.contains(&bounds_b, buffer) && overlap_ratio(b, a, tolerance) >= min_ratio
}

/// Ordering used before deduplication: larger scale first, then more visits,
/// then longer, then lowest representative id.
fn dedup_order(a: &FrequentSection, b: &FrequentSection, scale_rank: &dyn Fn(&str) -> usize) -> Ordering {
    scale_rank(&b.scale)
        .cmp(&scale_rank(&a.scale))
        .then(b.visit_count.cmp(&a.visit_count))
        .then(b.distance_meters.total_cmp(&a.distance_meters))
        .then(a.representative_activity_id.cmp(&b.representative_activity_id))
}

/// Drop near-identical sections, keeping the larger scale (or, at equal
/// scale, the higher visit count).
pub fn remove_duplicate_sections(
    mut sections: Vec<FrequentSection>,
    scale_rank: &dyn Fn(&str) -> usize,
    tolerance: f64,
    min_ratio: f64,
) -> Vec<FrequentSection> {
    sections.sort_by(|a, b| dedup_order(a, b, scale_rank));

    let mut kept: Vec<FrequentSection> = Vec::with_capacity(sections.len());
    for section in sections {
        let duplicate = kept.iter().any(|k| {
            k.sport_type == section.sport_type
                && k.bounds.intersects(&section.bounds)
                && polylines_overlap(&section.polyline, &k.polyline, tolerance, min_ratio)
        });
        if duplicate {
            debug!(
                "[Sections] Dropping duplicate {} section from {}",
                section.scale, section.representative_activity_id
            );
        } else {
            kept.push(section);
        }
    }
    kept
}

/// Lowercase id fragment for a sport type.
pub fn sport_slug(sport_type: &str) -> String {
    let slug: String = sport_type
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    if slug.is_empty() {
        "unknown".to_string()
    } else {
        slug
    }
}

/// Order by visit count and assign `sec_{sport}_{n}` ids and `"{sport} Section {n}"` names.
pub fn assign_ids_and_names(sections: &mut [FrequentSection], sport_type: &str) {
    sections.sort_by(|a, b| {
        b.visit_count
            .cmp(&a.visit_count)
            .then(b.distance_meters.total_cmp(&a.distance_meters))
            .then(a.representative_activity_id.cmp(&b.representative_activity_id))
    });

    let slug = sport_slug(sport_type);
    for (i, section) in sections.iter_mut().enumerate() {
        section.id = format!("sec_{}_{}", slug, i + 1);
        section.name = Some(format!("{} Section {}", sport_type, i + 1));
    }
}

/// Raw candidates as reviewable potentials.
pub fn to_potentials(candidates: &[FrequentSection], sport_type: &str) -> Vec<PotentialSection> {
    let slug = sport_slug(sport_type);
    candidates
        .iter()
        .enumerate()
        .map(|(i, c)| PotentialSection {
            id: format!("pot_{}_{}", slug, i + 1),
            sport_type: c.sport_type.clone(),
            polyline: c.polyline.clone(),
            activity_ids: c.activity_ids.clone(),
            visit_count: c.visit_count,
            distance_meters: c.distance_meters,
            confidence: c.confidence,
            scale: c.scale.clone(),
        })
        .collect()
}
