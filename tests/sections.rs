//! Section detection through the store: commit, removal, renaming and laps.

mod common;

use common::*;
use route_engine::sections::sport_slug;
use route_engine::{EngineError, PersistentRouteEngine};

#[test]
fn test_crossing_rides_share_one_section() {
    init_logger();
    let engine = detected_engine(PersistentRouteEngine::in_memory().unwrap());

    let sections = engine.get_sections();
    assert_eq!(sections.len(), 1);
    let section = &sections[0];
    assert_eq!(section.id, "sec_ride_1");
    assert_eq!(section.activity_ids, vec!["a", "b"]);
    assert_eq!(section.visit_count, 2);
    assert!(section.confidence > 0.0 && section.confidence <= 1.0);
    assert!(section.distance_meters > 500.0 && section.distance_meters < 800.0);

    // Exact sub-path of the representative's stored track
    let track = engine
        .get_gps_track(&section.representative_activity_id)
        .unwrap()
        .unwrap();
    let offset = track.iter().position(|p| *p == section.polyline[0]).unwrap();
    assert_eq!(&track[offset..offset + section.polyline.len()], section.polyline.as_slice());

    let summaries = engine.get_section_summaries(Some("Ride")).unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].visit_count, 2);
    assert!(engine.get_section_summaries(Some("Run")).unwrap().is_empty());
    assert_eq!(engine.get_sections_for_activity("b").len(), 1);
}

#[test]
fn test_section_ids_use_sport_slug() {
    assert_eq!(sport_slug("Ride"), "ride");
    assert_eq!(sport_slug(" Trail Run "), "trail_run");
    assert_eq!(sport_slug(""), "unknown");

    let engine = detected_engine(PersistentRouteEngine::in_memory().unwrap());
    let section = &engine.get_sections()[0];
    assert_eq!(section.id, format!("sec_{}_1", sport_slug(&section.sport_type)));
}

#[test]
fn test_redetection_keeps_id_and_name() {
    let mut engine = detected_engine(PersistentRouteEngine::in_memory().unwrap());
    engine.set_section_name("sec_ride_1", Some("Riverside")).unwrap();

    engine.start_section_detection(None).unwrap();
    assert_eq!(wait_for_detection(&mut engine), "complete");

    assert_eq!(engine.get_section_count(), 1);
    let section = engine.get_section_by_id("sec_ride_1").unwrap();
    assert_eq!(section.name.as_deref(), Some("Riverside"));
}

#[test]
fn test_poll_reports_terminal_once() {
    let mut engine = PersistentRouteEngine::in_memory().unwrap();
    engine.set_section_config(single_scale());
    add_all(&mut engine, &crossing_tracks(), "Ride");

    assert_eq!(engine.poll_section_detection(), "idle");
    engine.start_section_detection(Some("Ride")).unwrap();
    assert!(matches!(
        engine.start_section_detection(None),
        Err(EngineError::DetectionInProgress)
    ));

    assert_eq!(wait_for_detection(&mut engine), "complete");
    assert_eq!(engine.poll_section_detection(), "idle");
    assert!(!engine.is_detection_running());
}

#[test]
fn test_cancelled_run_leaves_sections_untouched() {
    let mut engine = detected_engine(PersistentRouteEngine::in_memory().unwrap());
    let before = engine.get_sections();

    engine.add_activity("c", through_track(), "Ride").unwrap();
    engine.start_section_detection(None).unwrap();
    assert!(engine.cancel_section_detection());
    let status = wait_for_detection(&mut engine);

    if status == "cancelled" {
        assert_eq!(engine.get_sections(), before);
    } else {
        // The worker finished before it saw the flag
        assert_eq!(status, "complete");
    }
}

#[test]
fn test_removing_contributor_below_two_deletes_section() {
    let mut engine = detected_engine(PersistentRouteEngine::in_memory().unwrap());
    assert_eq!(engine.remove_activities(&["b".to_string()]).unwrap(), 1);

    assert_eq!(engine.get_section_count(), 0);
    assert!(engine.get_sections_for_activity("a").is_empty());
    assert!(engine.query_sections_in_viewport(&route_engine::Bounds {
        min_lat: 51.49,
        max_lat: 51.51,
        min_lng: -0.13,
        max_lng: -0.11,
    })
    .is_empty());
}

#[test]
fn test_removing_reference_rebases_section() {
    let mut engine = PersistentRouteEngine::in_memory().unwrap();
    engine.set_section_config(single_scale());
    add_all(&mut engine, &crossing_tracks(), "Ride");
    engine.add_activity("c", through_track(), "Ride").unwrap();
    engine.start_section_detection(None).unwrap();
    assert_eq!(wait_for_detection(&mut engine), "complete");

    let section = engine
        .get_sections()
        .into_iter()
        .find(|s| s.activity_ids.len() == 3)
        .expect("section shared by all three rides");
    let reference = section.representative_activity_id.clone();

    engine.remove_activities(&[reference.clone()]).unwrap();

    let patched = engine.get_section_by_id(&section.id).unwrap();
    assert_eq!(patched.activity_ids.len(), 2);
    assert!(!patched.activity_ids.contains(&reference));
    assert_eq!(patched.representative_activity_id, patched.activity_ids[0]);
    assert!(patched.polyline.len() >= 2);
    assert!(patched
        .activity_portions
        .iter()
        .all(|p| p.activity_id != reference));
}

#[test]
fn test_section_laps_from_time_streams() {
    let mut engine = detected_engine(PersistentRouteEngine::in_memory().unwrap());
    let tracks = crossing_tracks();

    let ids = vec!["a".to_string(), "b".to_string()];
    let mut times = uniform_times(tracks[0].1.len(), 2);
    times.extend(uniform_times(tracks[1].1.len(), 3));
    let offsets = vec![0, tracks[0].1.len() as u32];
    assert_eq!(engine.set_time_streams_flat(&ids, &times, &offsets).unwrap(), 2);

    let result = engine.get_section_performances("sec_ride_1").unwrap();
    assert_eq!(result.records.len(), 2);
    assert_eq!(result.visit_count, 2);
    assert!(result.untimed_activity_ids.is_empty());

    let best = result.best_record.unwrap();
    assert_eq!(best.activity_id, "a");
    // ~60 points at 2s vs 3s
    assert!(best.best_time > 90.0 && best.best_time < 140.0);
    let slower = result.records.iter().find(|r| r.activity_id == "b").unwrap();
    assert!(slower.best_time > best.best_time);
}

#[test]
fn test_untimed_activity_counted() {
    let mut engine = detected_engine(PersistentRouteEngine::in_memory().unwrap());
    let len = crossing_tracks()[0].1.len();
    engine
        .set_time_streams_flat(&["a".to_string()], &uniform_times(len, 1), &[0])
        .unwrap();

    let result = engine.get_section_performances("sec_ride_1").unwrap();
    assert_eq!(result.records.len(), 1);
    assert_eq!(result.untimed_activity_ids, vec!["b"]);
    assert_eq!(result.visit_count, 2);
}

#[test]
fn test_detection_on_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("routes.db");
    let path = path.to_str().unwrap();

    {
        let engine = detected_engine(PersistentRouteEngine::new(path).unwrap());
        assert_eq!(engine.get_section_count(), 1);
    }

    let engine = PersistentRouteEngine::new(path).unwrap();
    let section = engine.get_section_by_id("sec_ride_1").unwrap();
    assert_eq!(section.activity_ids, vec!["a", "b"]);
    assert_eq!(section.activity_portions.len(), 2);
}
