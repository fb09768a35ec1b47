//! Synthetic tracks and helpers shared by the integration tests.

#![allow(dead_code)]

use std::thread;
use std::time::{Duration, Instant};

use route_engine::{GpsPoint, PersistentRouteEngine, ScalePreset, SectionConfig};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// ~660m north-south stretch that every crossing track rides.
pub fn shared_stretch() -> Vec<GpsPoint> {
    (0..60)
        .map(|i| GpsPoint::new(51.50 + i as f64 * 0.0001, -0.12))
        .collect()
}

/// Two rides sharing [`shared_stretch`], arriving and leaving on opposite sides.
pub fn crossing_tracks() -> Vec<(String, Vec<GpsPoint>)> {
    let mut a: Vec<GpsPoint> = (0..20)
        .map(|i| GpsPoint::new(51.50, -0.14 + i as f64 * 0.001))
        .collect();
    a.extend(shared_stretch());
    a.extend((1..20).map(|i| GpsPoint::new(51.5059, -0.12 + i as f64 * 0.001)));

    let mut b: Vec<GpsPoint> = (0..20)
        .map(|i| GpsPoint::new(51.50, -0.10 - i as f64 * 0.001))
        .collect();
    b.extend(shared_stretch());
    b.extend((1..20).map(|i| GpsPoint::new(51.5059, -0.12 - i as f64 * 0.001)));

    vec![("a".to_string(), a), ("b".to_string(), b)]
}

/// A ride along the whole meridian through [`shared_stretch`].
pub fn through_track() -> Vec<GpsPoint> {
    (0..300)
        .map(|i| GpsPoint::new(51.49 + i as f64 * 0.0001, -0.12))
        .collect()
}

/// Straight northbound line with ~111m spacing.
pub fn straight_route(n: usize, lat_offset: f64) -> Vec<GpsPoint> {
    (0..n)
        .map(|i| GpsPoint::new(51.5074 + lat_offset + i as f64 * 0.001, -0.1278))
        .collect()
}

pub fn reversed(track: &[GpsPoint]) -> Vec<GpsPoint> {
    track.iter().rev().copied().collect()
}

/// One detection scale, small enough for the synthetic tracks.
pub fn single_scale() -> SectionConfig {
    SectionConfig {
        scale_presets: vec![ScalePreset {
            name: "test".to_string(),
            window_length: 300.0,
            lateral_tolerance: 30.0,
            max_length: None,
            min_activities: 2,
        }],
        ..SectionConfig::default()
    }
}

pub fn add_all(engine: &mut PersistentRouteEngine, tracks: &[(String, Vec<GpsPoint>)], sport: &str) {
    for (id, track) in tracks {
        engine.add_activity(id, track.clone(), sport).unwrap();
    }
}

/// One sample per point, `seconds_per_point` apart.
pub fn uniform_times(points: usize, seconds_per_point: u32) -> Vec<u32> {
    (0..points as u32).map(|i| i * seconds_per_point).collect()
}

/// Poll until the job reports a terminal status.
pub fn wait_for_detection(engine: &mut PersistentRouteEngine) -> String {
    let deadline = Instant::now() + Duration::from_secs(60);
    loop {
        let status = engine.poll_section_detection();
        if matches!(status.as_str(), "complete" | "cancelled" | "error") {
            return status;
        }
        assert_ne!(status, "idle", "job vanished without a terminal status");
        assert!(Instant::now() < deadline, "detection did not finish");
        thread::sleep(Duration::from_millis(10));
    }
}

/// Crossing rides in a fresh engine with detection run to completion.
pub fn detected_engine(mut engine: PersistentRouteEngine) -> PersistentRouteEngine {
    engine.set_section_config(single_scale());
    add_all(&mut engine, &crossing_tracks(), "Ride");
    engine.start_section_detection(None).unwrap();
    assert_eq!(wait_for_detection(&mut engine), "complete");
    engine
}
