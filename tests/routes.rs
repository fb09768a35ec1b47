//! Route grouping, medoid choice and route performances.

mod common;

use common::*;
use route_engine::PersistentRouteEngine;

fn commute_engine() -> PersistentRouteEngine {
    let mut engine = PersistentRouteEngine::in_memory().unwrap();
    // Insertion order must not matter
    engine.add_activity("c", straight_route(10, 0.00005), "Ride").unwrap();
    engine.add_activity("b", straight_route(10, 0.0), "Ride").unwrap();
    engine.add_activity("a", straight_route(10, 0.0), "Ride").unwrap();
    engine.add_activity("far", straight_route(10, 2.0), "Ride").unwrap();
    engine
}

#[test]
fn test_medoid_is_deterministic() {
    init_logger();
    let mut engine = commute_engine();
    let groups = engine.get_groups().unwrap();
    assert_eq!(groups.len(), 2);

    let commute = groups.iter().find(|g| g.activity_ids.len() == 3).unwrap();
    assert_eq!(commute.group_id, "a");
    assert_eq!(commute.activity_ids, vec!["a", "b", "c"]);
    // a and b tie on total distance; the lower id wins
    assert_eq!(commute.representative_id, "a");

    let consensus = engine.get_consensus_route("a").unwrap().unwrap();
    assert_eq!(consensus, straight_route(10, 0.0));
    assert!(engine.get_consensus_route("nope").unwrap().is_none());

    // Rebuilding from scratch gives the same answer
    engine.mark_for_recomputation();
    let again = engine.get_groups().unwrap();
    assert_eq!(again, groups);
}

#[test]
fn test_group_survives_member_removal() {
    let mut engine = commute_engine();
    engine.get_groups().unwrap();
    engine.set_route_name("a", Some("Commute")).unwrap();

    engine.remove_activities(&["c".to_string()]).unwrap();
    let summaries = engine.get_group_summaries().unwrap();
    let commute = summaries.iter().find(|s| s.group_id == "a").unwrap();
    assert_eq!(commute.activity_count, 2);
    assert_eq!(commute.custom_name.as_deref(), Some("Commute"));
    assert_eq!(engine.get_group_for_activity("c").unwrap(), None);
}

#[test]
fn test_route_performances_ranked_by_duration() {
    let mut engine = commute_engine();
    engine.get_groups().unwrap();

    let ids = vec!["a".to_string(), "b".to_string(), "c".to_string()];
    let mut times = uniform_times(10, 3);
    times.extend(uniform_times(10, 1));
    times.extend(uniform_times(10, 2));
    engine.set_time_streams_flat(&ids, &times, &[0, 10, 20]).unwrap();

    let result = engine.get_route_performances("a", Some("a")).unwrap();
    assert_eq!(result.performances.len(), 3);
    let best = result.best.unwrap();
    assert_eq!(best.activity_id, "b");
    assert_eq!(best.duration, 9);
    assert_eq!(result.current_rank, Some(3));

    let group = engine.get_group_by_id("a").unwrap().unwrap().group;
    assert_eq!(group.best_time, Some(9.0));
    assert_eq!(group.best_activity_id.as_deref(), Some("b"));

    let empty = engine.get_route_performances("nope", None).unwrap();
    assert!(empty.performances.is_empty());
    assert!(empty.best.is_none());
}
