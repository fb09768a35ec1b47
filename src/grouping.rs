//! Whole-route grouping.
//!
//! Activities are grouped when they are the same end-to-end journey, not
//! just a shared stretch. Candidate pairs come from an R-tree over route
//! bounds, matches are closed transitively with Union-Find, and each group
//! is represented by its medoid.

use std::collections::HashMap;

use log::debug;
use rstar::{RTree, AABB};

use crate::geo_utils::haversine_distance;
use crate::matching::{compare_routes, symmetric_amd};
use crate::union_find::UnionFind;
use crate::{
    ActivityMatchInfo, Bounds, GpsPoint, GroupingResult, MatchConfig, MatchResult, RouteBounds,
    RouteGroup, RouteSignature,
};

/// Degrees added around each route's bounds when looking for candidates.
const CANDIDATE_PAD_DEG: f64 = 0.01;

/// Fractions of the route where both signatures must line up.
const CHECKPOINTS: [f64; 3] = [0.25, 0.5, 0.75];

/// Stricter than [`compare_routes`]: true only when the pair is the same
/// journey end to end.
///
/// On top of the match score this needs both routes to be long enough,
/// similar in length, to share their endpoints (in either direction, or as
/// two loops from the same start) and to agree at the quarter points.
pub fn should_group_routes(
    a: &RouteSignature,
    b: &RouteSignature,
    matched: &MatchResult,
    config: &MatchConfig,
) -> bool {
    let near = |p: &GpsPoint, q: &GpsPoint| haversine_distance(p, q) < config.endpoint_threshold;
    let (da, db) = (a.total_distance, b.total_distance);

    if da.min(db) < config.min_route_distance
        || matched.match_percentage < config.min_match_percentage
        || (da - db).abs() > config.max_distance_diff_ratio * da.max(db)
    {
        return false;
    }

    let slack = 2.0 * config.endpoint_threshold;
    let a_loop = near(&a.start_point, &a.end_point);
    let b_loop = near(&b.start_point, &b.end_point);

    if a_loop && b_loop {
        return near(&a.start_point, &b.start_point) && interior_aligned(&a.points, &b.points, slack);
    }
    if near(&a.start_point, &b.start_point) && near(&a.end_point, &b.end_point) {
        return interior_aligned(&a.points, &b.points, slack);
    }
    if near(&a.start_point, &b.end_point) && near(&a.end_point, &b.start_point) {
        let flipped: Vec<GpsPoint> = b.points.iter().rev().copied().collect();
        return interior_aligned(&a.points, &flipped, slack);
    }
    false
}

/// Both tracks pass within `slack` meters of each other at every checkpoint.
/// Signatures too short to index that way pass.
fn interior_aligned(a: &[GpsPoint], b: &[GpsPoint], slack: f64) -> bool {
    if a.len() < 5 || b.len() < 5 {
        return true;
    }
    let at = |track: &[GpsPoint], f: f64| track[(track.len() as f64 * f) as usize];
    CHECKPOINTS
        .iter()
        .all(|&f| haversine_distance(&at(a, f), &at(b, f)) <= slack)
}

/// Group similar routes together.
///
/// All signatures are assumed to share a sport type; see [`group_by_sport`].
pub fn group_signatures(signatures: &[RouteSignature], config: &MatchConfig) -> Vec<RouteGroup> {
    if signatures.is_empty() {
        return vec![];
    }

    let rtree = RTree::bulk_load(signatures.iter().map(|s| s.route_bounds()).collect());
    let sig_map = signature_map(signatures);

    let mut matches = Vec::new();
    for sig1 in signatures {
        matches.extend(matching_pairs(sig1, &rtree, &sig_map, config));
    }

    build_route_groups(signatures, matches, &sig_map, config)
}

/// Same as [`group_signatures`], comparing route pairs on rayon.
#[cfg(feature = "parallel")]
pub fn group_signatures_parallel(
    signatures: &[RouteSignature],
    config: &MatchConfig,
) -> Vec<RouteGroup> {
    use rayon::prelude::*;

    if signatures.is_empty() {
        return vec![];
    }

    let rtree = RTree::bulk_load(signatures.iter().map(|s| s.route_bounds()).collect());
    let sig_map = signature_map(signatures);

    let matches: Vec<(String, String)> = signatures
        .par_iter()
        .flat_map(|sig1| matching_pairs(sig1, &rtree, &sig_map, config))
        .collect();

    build_route_groups(signatures, matches, &sig_map, config)
}

/// Group routes and record how every member matches its representative.
pub fn group_signatures_with_matches(
    signatures: &[RouteSignature],
    config: &MatchConfig,
) -> GroupingResult {
    #[cfg(feature = "parallel")]
    let groups = group_signatures_parallel(signatures, config);
    #[cfg(not(feature = "parallel"))]
    let groups = group_signatures(signatures, config);

    let sig_map = signature_map(signatures);
    let mut activity_matches: HashMap<String, Vec<ActivityMatchInfo>> = HashMap::new();

    for group in &groups {
        let Some(representative) = sig_map.get(group.representative_id.as_str()) else {
            continue;
        };

        let matches = group
            .activity_ids
            .iter()
            .filter_map(|activity_id| {
                let sig = sig_map.get(activity_id.as_str())?;
                let (match_percentage, direction) = if activity_id == &group.representative_id {
                    (100.0, "same".to_string())
                } else {
                    match compare_routes(sig, representative, config) {
                        Some(result) => (result.match_percentage, result.direction),
                        // Chained into the group through another member
                        None => (0.0, "partial".to_string()),
                    }
                };
                Some(ActivityMatchInfo {
                    activity_id: activity_id.clone(),
                    match_percentage,
                    direction,
                })
            })
            .collect();

        activity_matches.insert(group.group_id.clone(), matches);
    }

    GroupingResult {
        groups,
        activity_matches,
    }
}

/// Group signatures per sport type. Activities of different sports never share a group.
///
/// Activities missing from `sport_types` are grouped under an empty sport.
/// Groups are returned sorted by group id.
pub fn group_by_sport(
    signatures: &[RouteSignature],
    sport_types: &HashMap<String, String>,
    config: &MatchConfig,
) -> GroupingResult {
    let mut by_sport: HashMap<&str, Vec<RouteSignature>> = HashMap::new();
    for sig in signatures {
        let sport = sport_types
            .get(&sig.activity_id)
            .map(String::as_str)
            .unwrap_or("");
        by_sport.entry(sport).or_default().push(sig.clone());
    }

    let mut groups = Vec::new();
    let mut activity_matches = HashMap::new();

    for (sport, sigs) in by_sport {
        let result = group_signatures_with_matches(&sigs, config);
        debug!(
            "[Grouping] {} {} activities -> {} groups",
            sport,
            sigs.len(),
            result.groups.len()
        );
        groups.extend(result.groups.into_iter().map(|mut g| {
            g.sport_type = sport.to_string();
            g
        }));
        activity_matches.extend(result.activity_matches);
    }

    groups.sort_by(|a, b| a.group_id.cmp(&b.group_id));
    GroupingResult {
        groups,
        activity_matches,
    }
}

/// Pick the member with minimal total AMD to all others. Ties go to the lowest id.
pub fn select_medoid(members: &[&RouteSignature], resample_count: usize) -> Option<String> {
    let mut sorted: Vec<&RouteSignature> = members.to_vec();
    sorted.sort_by(|a, b| a.activity_id.cmp(&b.activity_id));

    if sorted.len() <= 2 {
        return sorted.first().map(|s| s.activity_id.clone());
    }

    let mut best: Option<(&str, f64)> = None;
    for candidate in &sorted {
        let total: f64 = sorted
            .iter()
            .filter(|other| other.activity_id != candidate.activity_id)
            .map(|other| symmetric_amd(&candidate.points, &other.points, resample_count))
            .sum();
        match best {
            Some((_, best_total)) if total >= best_total => {}
            _ => best = Some((candidate.activity_id.as_str(), total)),
        }
    }

    best.map(|(id, _)| id.to_string())
}

fn signature_map(signatures: &[RouteSignature]) -> HashMap<&str, &RouteSignature> {
    signatures
        .iter()
        .map(|s| (s.activity_id.as_str(), s))
        .collect()
}

/// Pairs `(sig1, other)` with `sig1 < other` that pass the strict grouping check.
fn matching_pairs(
    sig1: &RouteSignature,
    rtree: &RTree<RouteBounds>,
    sig_map: &HashMap<&str, &RouteSignature>,
    config: &MatchConfig,
) -> Vec<(String, String)> {
    rtree
        .locate_in_envelope_intersecting(&search_envelope(&sig1.bounds, CANDIDATE_PAD_DEG))
        .filter(|b| {
            sig1.activity_id < b.activity_id && distance_ratio_ok(sig1.total_distance, b.distance)
        })
        .filter_map(|b| {
            let sig2 = sig_map.get(b.activity_id.as_str())?;
            let match_result = compare_routes(sig1, sig2, config)?;
            should_group_routes(sig1, sig2, &match_result, config)
                .then(|| (sig1.activity_id.clone(), sig2.activity_id.clone()))
        })
        .collect()
}

/// Close matches transitively and build groups with medoid representatives.
fn build_route_groups(
    signatures: &[RouteSignature],
    matches: Vec<(String, String)>,
    sig_map: &HashMap<&str, &RouteSignature>,
    config: &MatchConfig,
) -> Vec<RouteGroup> {
    let mut uf = UnionFind::with_capacity(signatures.len());
    for sig in signatures {
        uf.make_set(sig.activity_id.clone());
    }
    for (id1, id2) in &matches {
        uf.union(id1, id2);
    }

    uf.sorted_groups()
        .into_iter()
        .filter_map(|activity_ids| {
            let members: Vec<&RouteSignature> = activity_ids
                .iter()
                .filter_map(|id| sig_map.get(id.as_str()).copied())
                .collect();
            let representative_id = select_medoid(&members, config.resample_count as usize)?;
            let bounds = members
                .iter()
                .map(|s| s.bounds)
                .reduce(|acc, b| acc.union(&b));

            Some(RouteGroup {
                group_id: activity_ids[0].clone(),
                representative_id,
                activity_ids,
                sport_type: String::new(),
                bounds,
                custom_name: None,
                best_time: None,
                best_activity_id: None,
            })
        })
        .collect()
}

fn search_envelope(bounds: &Bounds, tolerance: f64) -> AABB<[f64; 2]> {
    AABB::from_corners(
        [bounds.min_lng - tolerance, bounds.min_lat - tolerance],
        [bounds.max_lng + tolerance, bounds.max_lat + tolerance],
    )
}

/// Cheap pre-filter: neither route more than twice the other.
fn distance_ratio_ok(d1: f64, d2: f64) -> bool {
    d1 > 0.0 && d2 > 0.0 && 2.0 * d1.min(d2) >= d1.max(d2)
}
