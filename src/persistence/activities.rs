//! Activity ingest, removal, metrics and activity-level queries.

use std::collections::{BTreeSet, HashSet};

use chrono::Utc;
use log::{debug, info};
use rusqlite::{params, Connection, OptionalExtension};

use super::{ActivityBoundsInfo, ActivityMetadata, PersistentRouteEngine};
use crate::codec::split_flat_tracks;
use crate::custom_sections::validate_name;
use crate::error::{EngineError, Result};
use crate::geo_utils::polyline_length;
use crate::spatial_index::BoundsEntry;
use crate::{ActivityMetrics, Bounds, GpsPoint, RouteSignature};

const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

/// A track that passed validation and is ready to write.
struct PreparedActivity {
    id: String,
    sport_type: String,
    track: Vec<GpsPoint>,
    track_blob: Vec<u8>,
    bounds: Bounds,
    distance_meters: f64,
    signature: Option<RouteSignature>,
}

fn validate_activity_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(EngineError::validation("activityId", "must not be empty"));
    }
    if id.chars().any(char::is_control) {
        return Err(EngineError::validation("activityId", "contains control characters"));
    }
    Ok(())
}

fn validate_track(id: &str, track: &[GpsPoint]) -> Result<Bounds> {
    if track.len() < 2 {
        return Err(EngineError::InvalidTrack {
            activity_id: id.to_string(),
            message: format!("needs at least 2 points, got {}", track.len()),
        });
    }
    if let Some(i) = track.iter().position(|p| !p.is_valid()) {
        return Err(EngineError::InvalidTrack {
            activity_id: id.to_string(),
            message: format!("point {} is not a valid coordinate", i),
        });
    }
    Bounds::from_points(track).ok_or_else(|| EngineError::InvalidTrack {
        activity_id: id.to_string(),
        message: "empty track".to_string(),
    })
}

fn store_activity(conn: &Connection, a: &PreparedActivity) -> Result<()> {
    conn.execute(
        "INSERT INTO activities (id, sport_type, min_lat, max_lat, min_lng, max_lng, point_count, distance_meters)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
            sport_type = excluded.sport_type,
            min_lat = excluded.min_lat,
            max_lat = excluded.max_lat,
            min_lng = excluded.min_lng,
            max_lng = excluded.max_lng,
            point_count = excluded.point_count,
            distance_meters = excluded.distance_meters",
        params![
            a.id,
            a.sport_type,
            a.bounds.min_lat,
            a.bounds.max_lat,
            a.bounds.min_lng,
            a.bounds.max_lng,
            a.track.len() as i64,
            a.distance_meters,
        ],
    )?;

    conn.execute(
        "INSERT OR REPLACE INTO gps_tracks (activity_id, track_data, point_count) VALUES (?, ?, ?)",
        params![a.id, a.track_blob, a.track.len() as i64],
    )?;

    match &a.signature {
        Some(sig) => store_signature(conn, &a.id, sig)?,
        None => {
            conn.execute("DELETE FROM signatures WHERE activity_id = ?", params![a.id])?;
        }
    }

    // A stream recorded against a different track no longer lines up
    conn.execute(
        "DELETE FROM time_streams WHERE activity_id = ? AND point_count != ?",
        params![a.id, a.track.len() as i64],
    )?;
    Ok(())
}

fn store_signature(conn: &Connection, id: &str, sig: &RouteSignature) -> Result<()> {
    let points_blob = rmp_serde::to_vec(&sig.points)?;
    conn.execute(
        "INSERT OR REPLACE INTO signatures (activity_id, points, start_point_lat, start_point_lng, end_point_lat, end_point_lng, total_distance, point_count)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            id,
            points_blob,
            sig.start_point.latitude,
            sig.start_point.longitude,
            sig.end_point.latitude,
            sig.end_point.longitude,
            sig.total_distance,
            sig.points.len() as i64
        ],
    )?;
    Ok(())
}

impl PersistentRouteEngine {
    // ========================================================================
    // Loading
    // ========================================================================

    pub(super) fn load_metadata(&mut self) -> Result<()> {
        let mut stmt = self.db.prepare(
            "SELECT id, sport_type, min_lat, max_lat, min_lng, max_lng, point_count, distance_meters, created_at
             FROM activities",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ActivityMetadata {
                    id: row.get(0)?,
                    sport_type: row.get(1)?,
                    bounds: Bounds {
                        min_lat: row.get(2)?,
                        max_lat: row.get(3)?,
                        min_lng: row.get(4)?,
                        max_lng: row.get(5)?,
                    },
                    point_count: row.get(6)?,
                    distance_meters: row.get(7)?,
                    created_at: row.get(8)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        self.activity_metadata = rows.into_iter().map(|m| (m.id.clone(), m)).collect();
        self.activity_index.mark_dirty();
        Ok(())
    }

    pub(super) fn load_activity_metrics(&mut self) -> Result<()> {
        let mut stmt = self.db.prepare(
            "SELECT activity_id, name, date, distance, moving_time, elapsed_time,
                    elevation_gain, avg_hr, avg_power, sport_type
             FROM activity_metrics",
        )?;
        let metrics = stmt
            .query_map([], |row| {
                Ok(ActivityMetrics {
                    activity_id: row.get(0)?,
                    name: row.get(1)?,
                    date: row.get(2)?,
                    distance: row.get(3)?,
                    moving_time: row.get(4)?,
                    elapsed_time: row.get(5)?,
                    elevation_gain: row.get(6)?,
                    avg_hr: row.get(7)?,
                    avg_power: row.get(8)?,
                    sport_type: row.get(9)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        self.activity_metrics = metrics
            .into_iter()
            .map(|m| (m.activity_id.clone(), m))
            .collect();
        Ok(())
    }

    // ========================================================================
    // Activity Management
    // ========================================================================

    /// Add activities from one flat coordinate buffer.
    ///
    /// `offsets[i]` is the point index where activity `i` starts. All tracks
    /// are validated before anything is written; the batch is stored in one
    /// transaction. Re-adding an id replaces its track and drops it from the
    /// sections it contributed to (rebasing or deleting them as removal
    /// does); its custom section matches are recomputed. Re-adding identical
    /// data changes nothing. Returns the number of activities stored.
    pub fn add_activities(
        &mut self,
        ids: &[String],
        flat_coords: &[f64],
        offsets: &[u32],
        sport_types: &[String],
    ) -> Result<u32> {
        if ids.len() != sport_types.len() {
            return Err(EngineError::validation(
                "sportTypes",
                format!("{} ids but {} sport types", ids.len(), sport_types.len()),
            ));
        }

        let tracks = split_flat_tracks(ids, flat_coords, offsets)?;
        let batch = tracks
            .into_iter()
            .zip(sport_types.iter().cloned())
            .map(|((id, track), sport)| (id, track, sport))
            .collect();
        self.add_tracks(batch)
    }

    /// Add a single activity.
    pub fn add_activity(&mut self, id: &str, coords: Vec<GpsPoint>, sport_type: &str) -> Result<()> {
        self.add_tracks(vec![(id.to_string(), coords, sport_type.to_string())])
            .map(|_| ())
    }

    fn add_tracks(&mut self, batch: Vec<(String, Vec<GpsPoint>, String)>) -> Result<u32> {
        let mut prepared: Vec<PreparedActivity> = Vec::with_capacity(batch.len());
        for (id, track, sport_type) in batch {
            validate_activity_id(&id)?;
            validate_name("sportType", &sport_type)?;
            let bounds = validate_track(&id, &track)?;

            // Later duplicates in one batch win
            prepared.retain(|p| p.id != id);
            prepared.push(PreparedActivity {
                signature: RouteSignature::from_points(&id, &track, &self.config.match_config),
                track_blob: rmp_serde::to_vec(&track)?,
                distance_meters: polyline_length(&track),
                bounds,
                id,
                sport_type,
                track,
            });
        }

        // Identical re-adds are no-ops
        let mut changed = Vec::with_capacity(prepared.len());
        for activity in prepared {
            let stored: Option<(Vec<u8>, String)> = self
                .db
                .query_row(
                    "SELECT t.track_data, a.sport_type FROM gps_tracks t
                     JOIN activities a ON a.id = t.activity_id WHERE t.activity_id = ?",
                    params![activity.id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            match stored {
                Some((blob, sport)) if blob == activity.track_blob && sport == activity.sport_type => {
                    debug!("[Store] {} unchanged, skipping", activity.id);
                }
                _ => changed.push(activity),
            }
        }
        if changed.is_empty() {
            return Ok(0);
        }

        // Replaced tracks no longer line up with section portions or custom
        // match indices: patch them out of sections and rematch
        let replacements: Vec<(&str, &str, &[GpsPoint])> = changed
            .iter()
            .filter(|a| self.activity_metadata.contains_key(&a.id))
            .map(|a| (a.id.as_str(), a.sport_type.as_str(), a.track.as_slice()))
            .collect();
        let replaced_ids: HashSet<&str> = replacements.iter().map(|&(id, _, _)| id).collect();

        let tx = self.db.unchecked_transaction()?;
        let patch = self.patch_sections_for_removal(&tx, &replaced_ids)?;
        for activity in &changed {
            store_activity(&tx, activity)?;
        }
        self.rematch_replaced_tracks(&tx, &replacements)?;
        tx.commit()?;
        self.apply_section_patch(patch);

        let now = Utc::now().timestamp();
        let mut replaced = 0;
        for activity in changed.iter() {
            let created_at = match self.activity_metadata.get(&activity.id) {
                Some(existing) => {
                    replaced += 1;
                    if existing.point_count as usize != activity.track.len() {
                        self.time_streams.remove(&activity.id);
                    }
                    existing.created_at
                }
                None => now,
            };

            self.signature_cache.pop(&activity.id);
            if let Some(sig) = &activity.signature {
                self.signature_cache.put(activity.id.clone(), sig.clone());
            }
            self.activity_metadata.insert(
                activity.id.clone(),
                ActivityMetadata {
                    id: activity.id.clone(),
                    sport_type: activity.sport_type.clone(),
                    bounds: activity.bounds,
                    point_count: activity.track.len() as u32,
                    distance_meters: activity.distance_meters,
                    created_at,
                },
            );
        }

        self.activity_index.mark_dirty();
        self.consensus_cache.clear();
        self.groups_dirty = true;
        self.sections_dirty = true;

        info!(
            "[Store] Stored {} activities ({} replaced)",
            changed.len(),
            replaced
        );
        Ok(changed.len() as u32)
    }

    /// Remove activities and everything derived from them.
    ///
    /// Dependent sections are patched through the reverse index in the same
    /// transaction. Unknown ids are ignored. Returns the number removed.
    pub fn remove_activities(&mut self, ids: &[String]) -> Result<u32> {
        let removed: BTreeSet<String> = ids
            .iter()
            .filter(|id| self.activity_metadata.contains_key(id.as_str()))
            .cloned()
            .collect();
        if removed.is_empty() {
            return Ok(0);
        }
        let removed_set: HashSet<&str> = removed.iter().map(String::as_str).collect();

        let tx = self.db.unchecked_transaction()?;
        let patch = self.patch_sections_for_removal(&tx, &removed_set)?;
        for id in &removed {
            // Cascades to track, signature, time stream, metrics and match rows
            tx.execute("DELETE FROM activities WHERE id = ?", params![id])?;
        }
        tx.commit()?;

        for id in &removed {
            self.activity_metadata.remove(id);
            self.signature_cache.pop(id);
            self.activity_metrics.remove(id);
            self.time_streams.remove(id);
            self.reverse_index.remove_activity(id);
        }
        self.apply_section_patch(patch);

        self.activity_index.mark_dirty();
        self.consensus_cache.clear();
        self.groups_dirty = true;

        info!("[Store] Removed {} activities", removed.len());
        Ok(removed.len() as u32)
    }

    /// Remove activities stored more than `retention_days` ago (0 = keep all).
    pub fn cleanup_old_activities(&mut self, retention_days: u32) -> Result<u32> {
        if retention_days == 0 {
            info!("[Store] Cleanup skipped: retention period is 0 (keep all)");
            return Ok(0);
        }

        let cutoff = Utc::now().timestamp() - retention_days as i64 * SECONDS_PER_DAY;
        let old: Vec<String> = self
            .activity_metadata
            .values()
            .filter(|m| m.created_at < cutoff)
            .map(|m| m.id.clone())
            .collect();

        let deleted = self.remove_activities(&old)?;
        if deleted > 0 {
            info!(
                "[Store] Cleaned up {} activities older than {} days",
                deleted, retention_days
            );
        }
        Ok(deleted)
    }

    /// Re-derive every stored signature from its track.
    pub(super) fn rebuild_signatures(&mut self) -> Result<()> {
        let tx = self.db.unchecked_transaction()?;
        let ids: Vec<String> = self.activity_metadata.keys().cloned().collect();
        for id in &ids {
            let Some(track) = super::read_track(&tx, id)? else {
                continue;
            };
            match RouteSignature::from_points(id, &track, &self.config.match_config) {
                Some(sig) => store_signature(&tx, id, &sig)?,
                None => {
                    tx.execute("DELETE FROM signatures WHERE activity_id = ?", params![id])?;
                }
            }
        }
        tx.commit()?;
        debug!("[Store] Rebuilt {} signatures", ids.len());
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn activity_count(&self) -> usize {
        self.activity_metadata.len()
    }

    /// All activity ids, sorted.
    pub fn get_activity_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.activity_metadata.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn has_activity(&self, id: &str) -> bool {
        self.activity_metadata.contains_key(id)
    }

    pub fn get_activity_metadata(&self, id: &str) -> Option<&ActivityMetadata> {
        self.activity_metadata.get(id)
    }

    fn ensure_activity_index(&mut self) {
        let metadata = &self.activity_metadata;
        self.activity_index.ensure_built(|| {
            metadata
                .values()
                .map(|m| BoundsEntry {
                    id: m.id.clone(),
                    bounds: m.bounds,
                })
                .collect()
        });
    }

    /// Activity ids whose bounding box intersects the viewport, sorted.
    pub fn query_viewport(&mut self, viewport: &Bounds) -> Vec<String> {
        self.ensure_activity_index();
        self.activity_index.query_viewport(viewport)
    }

    /// Activity ids whose bounds overlap `bounds` grown by `buffer_meters`.
    pub(super) fn activities_near(&mut self, bounds: &Bounds, buffer_meters: f64) -> Vec<String> {
        self.ensure_activity_index();
        self.activity_index.find_overlapping(bounds, buffer_meters)
    }

    /// Bounds of every activity for map overview, sorted by id.
    pub fn get_all_activity_bounds(&self) -> Vec<ActivityBoundsInfo> {
        let mut infos: Vec<ActivityBoundsInfo> = self
            .activity_metadata
            .values()
            .map(|m| ActivityBoundsInfo {
                id: m.id.clone(),
                bounds: [
                    [m.bounds.min_lat, m.bounds.min_lng],
                    [m.bounds.max_lat, m.bounds.max_lng],
                ],
                activity_type: m.sport_type.clone(),
                distance: self
                    .activity_metrics
                    .get(&m.id)
                    .map(|metrics| metrics.distance)
                    .unwrap_or(m.distance_meters),
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    // ========================================================================
    // Activity Metrics
    // ========================================================================

    /// Store metrics for existing activities, replacing earlier values.
    pub fn set_activity_metrics(&mut self, metrics: Vec<ActivityMetrics>) -> Result<()> {
        for m in &metrics {
            if !self.activity_metadata.contains_key(&m.activity_id) {
                return Err(EngineError::UnknownActivity(m.activity_id.clone()));
            }
            validate_name("name", &m.name)?;
        }

        let tx = self.db.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO activity_metrics
                 (activity_id, name, date, distance, moving_time, elapsed_time,
                  elevation_gain, avg_hr, avg_power, sport_type)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )?;
            for m in &metrics {
                stmt.execute(params![
                    m.activity_id,
                    m.name,
                    m.date,
                    m.distance,
                    m.moving_time,
                    m.elapsed_time,
                    m.elevation_gain,
                    m.avg_hr,
                    m.avg_power,
                    m.sport_type,
                ])?;
            }
        }
        tx.commit()?;

        for m in metrics {
            self.activity_metrics.insert(m.activity_id.clone(), m);
        }
        Ok(())
    }

    pub fn get_activity_metrics(&self, activity_id: &str) -> Option<&ActivityMetrics> {
        self.activity_metrics.get(activity_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::points_to_flat;
    use crate::persistence::tests::sample_coords;

    fn metrics(id: &str) -> ActivityMetrics {
        ActivityMetrics {
            activity_id: id.to_string(),
            name: "Morning Ride".to_string(),
            date: 1_700_000_000,
            distance: 6000.0,
            moving_time: 1200,
            elapsed_time: 1300,
            elevation_gain: 50.0,
            avg_hr: Some(140),
            avg_power: None,
            sport_type: "Ride".to_string(),
        }
    }

    #[test]
    fn test_add_activities_flat() {
        let mut engine = PersistentRouteEngine::in_memory().unwrap();
        let track = sample_coords();
        let mut flat = points_to_flat(&track);
        flat.extend(points_to_flat(&track[..20]));

        let ids = vec!["a".to_string(), "b".to_string()];
        let sports = vec!["Ride".to_string(), "Run".to_string()];
        let stored = engine.add_activities(&ids, &flat, &[0, 50], &sports).unwrap();

        assert_eq!(stored, 2);
        assert_eq!(engine.get_activity_ids(), vec!["a", "b"]);
        assert_eq!(engine.get_gps_track("b").unwrap().unwrap().len(), 20);
        assert_eq!(engine.get_activity_metadata("a").unwrap().point_count, 50);
    }

    #[test]
    fn test_add_is_idempotent() {
        let mut engine = PersistentRouteEngine::in_memory().unwrap();
        engine.add_activity("a", sample_coords(), "Ride").unwrap();
        let before = engine.get_gps_track("a").unwrap();

        let ids = vec!["a".to_string()];
        let flat = points_to_flat(&sample_coords());
        assert_eq!(engine.add_activities(&ids, &flat, &[0], &["Ride".to_string()]).unwrap(), 0);

        assert_eq!(engine.activity_count(), 1);
        assert_eq!(engine.get_gps_track("a").unwrap(), before);
    }

    #[test]
    fn test_invalid_batch_writes_nothing() {
        let mut engine = PersistentRouteEngine::in_memory().unwrap();
        let mut flat = points_to_flat(&sample_coords());
        flat.extend([51.5, -0.1]); // one-point track

        let ids = vec!["good".to_string(), "bad".to_string()];
        let sports = vec!["Ride".to_string(), "Ride".to_string()];
        let err = engine.add_activities(&ids, &flat, &[0, 50], &sports).unwrap_err();

        assert!(matches!(err, EngineError::InvalidTrack { ref activity_id, .. } if activity_id == "bad"));
        assert_eq!(engine.activity_count(), 0);
        assert!(engine.get_gps_track("good").unwrap().is_none());
    }

    #[test]
    fn test_invalid_coordinates_rejected() {
        let mut engine = PersistentRouteEngine::in_memory().unwrap();
        let mut track = sample_coords();
        track[3] = GpsPoint::new(f64::NAN, 0.0);
        assert!(engine.add_activity("a", track, "Ride").unwrap_err().is_validation());
        assert!(engine.add_activity("", sample_coords(), "Ride").is_err());
    }

    #[test]
    fn test_viewport_query() {
        let mut engine = PersistentRouteEngine::in_memory().unwrap();
        engine.add_activity("test-1", sample_coords(), "Ride").unwrap();

        let results = engine.query_viewport(&Bounds {
            min_lat: 51.5,
            max_lat: 51.6,
            min_lng: -0.2,
            max_lng: -0.1,
        });
        assert_eq!(results, vec!["test-1"]);

        let results = engine.query_viewport(&Bounds {
            min_lat: 40.0,
            max_lat: 41.0,
            min_lng: -75.0,
            max_lng: -74.0,
        });
        assert!(results.is_empty());
    }

    #[test]
    fn test_remove_cascades() {
        let mut engine = PersistentRouteEngine::in_memory().unwrap();
        engine.add_activity("a", sample_coords(), "Ride").unwrap();
        engine.set_activity_metrics(vec![metrics("a")]).unwrap();

        assert_eq!(engine.remove_activities(&["a".to_string(), "zzz".to_string()]).unwrap(), 1);
        assert!(!engine.has_activity("a"));
        assert!(engine.get_activity_metrics("a").is_none());
        assert!(engine.get_gps_track("a").unwrap().is_none());

        let orphans: i64 = engine
            .db
            .query_row("SELECT COUNT(*) FROM activity_metrics", [], |row| row.get(0))
            .unwrap();
        assert_eq!(orphans, 0);
    }

    #[test]
    fn test_cleanup_old_activities() {
        let mut engine = PersistentRouteEngine::in_memory().unwrap();
        engine.add_activity("old", sample_coords(), "Ride").unwrap();
        engine.add_activity("new", sample_coords(), "Ride").unwrap();

        let long_ago = Utc::now().timestamp() - 100 * SECONDS_PER_DAY;
        engine
            .db
            .execute("UPDATE activities SET created_at = ? WHERE id = 'old'", params![long_ago])
            .unwrap();
        engine.load().unwrap();

        assert_eq!(engine.cleanup_old_activities(0).unwrap(), 0);
        assert_eq!(engine.cleanup_old_activities(90).unwrap(), 1);
        assert_eq!(engine.get_activity_ids(), vec!["new"]);
    }

    #[test]
    fn test_metrics_require_activity() {
        let mut engine = PersistentRouteEngine::in_memory().unwrap();
        let err = engine.set_activity_metrics(vec![metrics("ghost")]).unwrap_err();
        assert!(matches!(err, EngineError::UnknownActivity(_)));

        engine.add_activity("a", sample_coords(), "Ride").unwrap();
        engine.set_activity_metrics(vec![metrics("a")]).unwrap();
        let bounds = engine.get_all_activity_bounds();
        assert_eq!(bounds.len(), 1);
        assert_eq!(bounds[0].distance, 6000.0);
        assert_eq!(bounds[0].activity_type, "Ride");
    }
}
