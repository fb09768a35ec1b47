//! User-created sections and their stored matches.

use std::collections::HashMap;

use chrono::Utc;
use log::{debug, info};
use rusqlite::{params, Connection};

use super::PersistentRouteEngine;
use crate::custom_sections::{
    extract_section_trace, match_section_in_track, validate_custom_section, validate_name,
    validate_section_payload, CustomSection, CustomSectionMatch,
};
use crate::error::{EngineError, OptionExt, Result};
use crate::geo_utils::{compute_bounds, polyline_length};
use crate::GpsPoint;

fn store_custom_section(conn: &Connection, section: &CustomSection) -> Result<()> {
    conn.execute(
        "INSERT INTO custom_sections
         (id, name, polyline_json, source_activity_id, start_index, end_index, sport_type, distance_meters, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            section.id,
            section.name,
            serde_json::to_string(&section.polyline)?,
            section.source_activity_id,
            section.start_index,
            section.end_index,
            section.sport_type,
            section.distance_meters,
            section.created_at,
        ],
    )?;
    Ok(())
}

/// Replace the stored matches of `section_id` in each listed activity.
fn write_custom_matches(
    conn: &Connection,
    section_id: &str,
    matched: &[(String, Vec<CustomSectionMatch>)],
) -> Result<()> {
    let mut delete = conn.prepare_cached(
        "DELETE FROM custom_section_matches WHERE section_id = ? AND activity_id = ?",
    )?;
    let mut insert = conn.prepare_cached(
        "INSERT OR REPLACE INTO custom_section_matches
         (section_id, activity_id, start_index, end_index, direction, distance_meters)
         VALUES (?, ?, ?, ?, ?, ?)",
    )?;
    for (activity_id, matches) in matched {
        delete.execute(params![section_id, activity_id])?;
        for m in matches {
            insert.execute(params![
                section_id,
                m.activity_id,
                m.start_index,
                m.end_index,
                m.direction,
                m.distance_meters
            ])?;
        }
    }
    Ok(())
}

impl PersistentRouteEngine {
    pub(super) fn load_custom_sections(&mut self) -> Result<()> {
        let mut stmt = self.db.prepare(
            "SELECT id, name, polyline_json, source_activity_id, start_index, end_index,
                    sport_type, distance_meters, created_at
             FROM custom_sections ORDER BY created_at, id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    CustomSection {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        polyline: Vec::new(),
                        source_activity_id: row.get(3)?,
                        start_index: row.get(4)?,
                        end_index: row.get(5)?,
                        sport_type: row.get(6)?,
                        distance_meters: row.get(7)?,
                        created_at: row.get(8)?,
                    },
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut sections = Vec::with_capacity(rows.len());
        for (mut section, polyline_json) in rows {
            section.polyline = serde_json::from_str(&polyline_json)?;
            sections.push(section);
        }
        self.custom_sections = sections;
        Ok(())
    }

    fn has_custom_section(&self, id: &str) -> bool {
        self.custom_sections.iter().any(|s| s.id == id)
    }

    /// Activities of `sport_type` whose bounds come within matching distance of `polyline`.
    pub(super) fn custom_candidates(&mut self, polyline: &[GpsPoint], sport_type: &str) -> Vec<String> {
        let bounds = compute_bounds(polyline);
        let buffer = self.config.custom_match_config.proximity_threshold;
        let mut ids = self.activities_near(&bounds, buffer);
        ids.retain(|id| {
            self.activity_metadata
                .get(id)
                .is_some_and(|m| m.sport_type == sport_type)
        });
        ids
    }

    /// Store a validated section together with its first matches, in one transaction.
    fn insert_custom_section(&mut self, section: CustomSection) -> Result<CustomSection> {
        let candidates = self.custom_candidates(&section.polyline, &section.sport_type);
        let matched = self.find_custom_matches(&self.db, &section, &candidates)?;

        let tx = self.db.unchecked_transaction()?;
        store_custom_section(&tx, &section)?;
        write_custom_matches(&tx, &section.id, &matched)?;
        tx.commit()?;

        self.custom_sections.push(section.clone());
        info!(
            "[CustomSections] Added {} ({:.0}m, {} matches)",
            section.id,
            section.distance_meters,
            matched.iter().map(|(_, m)| m.len()).sum::<usize>()
        );
        Ok(section)
    }

    /// Add a custom section from a JSON payload and match it against stored activities.
    pub fn add_custom_section(&mut self, json: &str) -> Result<CustomSection> {
        let mut section = validate_section_payload(json)?;
        if self.has_custom_section(&section.id) {
            return Err(EngineError::validation(
                "id",
                format!("'{}' already exists", section.id),
            ));
        }
        if section.created_at.is_empty() {
            section.created_at = Utc::now().to_rfc3339();
        }
        self.insert_custom_section(section)
    }

    /// Cut a custom section out of a stored track, inclusive of both indices.
    pub fn create_section_from_indices(
        &mut self,
        activity_id: &str,
        start_index: u32,
        end_index: u32,
        sport_type: &str,
        name: &str,
    ) -> Result<CustomSection> {
        let point_count = self
            .activity_metadata
            .get(activity_id)
            .ok_or_unknown_activity(activity_id)?
            .point_count;
        if start_index >= end_index || end_index >= point_count {
            return Err(EngineError::validation(
                "endIndex",
                format!(
                    "need start < end < {}, got {}..{}",
                    point_count, start_index, end_index
                ),
            ));
        }
        validate_name("name", name)?;

        let track = self
            .get_gps_track(activity_id)?
            .ok_or_unknown_activity(activity_id)?;
        let polyline = track[start_index as usize..=end_index as usize].to_vec();

        let now = Utc::now();
        let base_id = format!("custom_{}", now.timestamp_millis());
        let mut id = base_id.clone();
        let mut suffix = 1;
        while self.has_custom_section(&id) {
            id = format!("{}_{}", base_id, suffix);
            suffix += 1;
        }

        let section = CustomSection {
            id,
            name: name.to_string(),
            distance_meters: polyline_length(&polyline),
            polyline,
            source_activity_id: activity_id.to_string(),
            start_index,
            end_index,
            sport_type: sport_type.to_string(),
            created_at: now.to_rfc3339(),
        };
        validate_custom_section(&section)?;
        self.insert_custom_section(section)
    }

    /// Delete a custom section and its matches. Returns false if unknown.
    pub fn remove_custom_section(&mut self, section_id: &str) -> Result<bool> {
        let deleted = self
            .db
            .execute("DELETE FROM custom_sections WHERE id = ?", params![section_id])?;
        self.custom_sections.retain(|s| s.id != section_id);
        Ok(deleted > 0)
    }

    pub fn get_custom_sections(&self) -> Vec<CustomSection> {
        self.custom_sections.clone()
    }

    pub fn get_custom_section(&self, section_id: &str) -> Option<CustomSection> {
        self.custom_sections
            .iter()
            .find(|s| s.id == section_id)
            .cloned()
    }

    /// Match a custom section against the given activities and store the result.
    ///
    /// Earlier matches for those activities are replaced. Unknown activities
    /// are skipped; an unknown section yields no matches.
    pub fn match_custom_section(
        &mut self,
        section_id: &str,
        activity_ids: &[String],
    ) -> Result<Vec<CustomSectionMatch>> {
        let Some(section) = self.get_custom_section(section_id) else {
            return Ok(Vec::new());
        };

        let matched = self.find_custom_matches(&self.db, &section, activity_ids)?;

        let tx = self.db.unchecked_transaction()?;
        write_custom_matches(&tx, section_id, &matched)?;
        tx.commit()?;

        let all: Vec<CustomSectionMatch> = matched.into_iter().flat_map(|(_, m)| m).collect();
        debug!(
            "[CustomSections] {} matched {} traversals in {} activities",
            section_id,
            all.len(),
            activity_ids.len()
        );
        Ok(all)
    }

    /// Traversals of `section` in every known activity of `activity_ids`,
    /// tracks read through `conn`.
    fn find_custom_matches(
        &self,
        conn: &Connection,
        section: &CustomSection,
        activity_ids: &[String],
    ) -> Result<Vec<(String, Vec<CustomSectionMatch>)>> {
        let mut matched = Vec::with_capacity(activity_ids.len());
        for id in activity_ids {
            if !self.activity_metadata.contains_key(id) {
                continue;
            }
            let Some(track) = super::read_track(conn, id)? else {
                continue;
            };
            let matches =
                match_section_in_track(section, id, &track, &self.config.custom_match_config);
            matched.push((id.clone(), matches));
        }
        Ok(matched)
    }

    /// Recompute custom matches of activities whose track or sport was just
    /// replaced. Runs inside the caller's transaction.
    pub(super) fn rematch_replaced_tracks(
        &self,
        conn: &Connection,
        replaced: &[(&str, &str, &[GpsPoint])],
    ) -> Result<()> {
        for &(activity_id, _, _) in replaced {
            conn.execute(
                "DELETE FROM custom_section_matches WHERE activity_id = ?",
                params![activity_id],
            )?;
        }
        for section in &self.custom_sections {
            let matched: Vec<(String, Vec<CustomSectionMatch>)> = replaced
                .iter()
                .filter(|(_, sport, _)| *sport == section.sport_type)
                .map(|&(id, _, track)| {
                    let matches = match_section_in_track(
                        section,
                        id,
                        track,
                        &self.config.custom_match_config,
                    );
                    (id.to_string(), matches)
                })
                .collect();
            write_custom_matches(conn, &section.id, &matched)?;
        }
        Ok(())
    }

    /// Re-run matching for every custom section against its current candidates.
    pub(super) fn rematch_custom_sections(&mut self) -> Result<()> {
        let sections: Vec<(String, Vec<GpsPoint>, String)> = self
            .custom_sections
            .iter()
            .map(|s| (s.id.clone(), s.polyline.clone(), s.sport_type.clone()))
            .collect();
        for (id, polyline, sport) in sections {
            let candidates = self.custom_candidates(&polyline, &sport);
            self.match_custom_section(&id, &candidates)?;
        }
        Ok(())
    }

    /// Stored matches of a custom section, traces re-sliced from the tracks.
    pub fn get_custom_section_matches(&self, section_id: &str) -> Result<Vec<CustomSectionMatch>> {
        let mut stmt = self.db.prepare(
            "SELECT activity_id, start_index, end_index, direction, distance_meters
             FROM custom_section_matches WHERE section_id = ?
             ORDER BY activity_id, start_index",
        )?;
        let rows = stmt
            .query_map(params![section_id], |row| {
                Ok(CustomSectionMatch {
                    activity_id: row.get(0)?,
                    start_index: row.get(1)?,
                    end_index: row.get(2)?,
                    direction: row.get(3)?,
                    distance_meters: row.get(4)?,
                    trace: Vec::new(),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut tracks: HashMap<String, Option<Vec<GpsPoint>>> = HashMap::new();
        let mut matches = Vec::with_capacity(rows.len());
        for mut m in rows {
            if !tracks.contains_key(&m.activity_id) {
                tracks.insert(m.activity_id.clone(), self.get_gps_track(&m.activity_id)?);
            }
            let Some(Some(track)) = tracks.get(&m.activity_id) else {
                continue;
            };
            let Some(trace) = track.get(m.start_index as usize..=m.end_index as usize) else {
                continue;
            };
            m.trace = trace.to_vec();
            matches.push(m);
        }
        Ok(matches)
    }

    /// An activity's points along `polyline`, for its first traversal.
    pub fn extract_section_trace(
        &self,
        activity_id: &str,
        polyline: &[GpsPoint],
    ) -> Result<Option<Vec<GpsPoint>>> {
        let Some(track) = self.get_gps_track(activity_id)? else {
            return Ok(None);
        };
        Ok(extract_section_trace(
            &track,
            polyline,
            &self.config.custom_match_config,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo_utils::haversine_distance;
    use crate::persistence::tests::sample_coords;

    fn reversed() -> Vec<GpsPoint> {
        sample_coords().into_iter().rev().collect()
    }

    #[test]
    fn test_create_from_indices_matches_both_directions() {
        let mut engine = PersistentRouteEngine::in_memory().unwrap();
        engine.add_activity("a", sample_coords(), "Run").unwrap();
        engine.add_activity("b", reversed(), "Run").unwrap();
        engine.add_activity("c", sample_coords(), "Ride").unwrap();

        let section = engine
            .create_section_from_indices("a", 10, 30, "Run", "Hill")
            .unwrap();
        assert!(section.id.starts_with("custom_"));
        assert_eq!(section.polyline.len(), 21);

        let matches = engine.get_custom_section_matches(&section.id).unwrap();
        let ids: Vec<&str> = matches.iter().map(|m| m.activity_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(matches[0].direction, "same");
        assert_eq!(matches[1].direction, "reverse");
        assert_eq!(
            matches[1].trace.len(),
            (matches[1].end_index - matches[1].start_index + 1) as usize
        );
    }

    #[test]
    fn test_create_from_indices_validates() {
        let mut engine = PersistentRouteEngine::in_memory().unwrap();
        engine.add_activity("a", sample_coords(), "Run").unwrap();

        assert!(engine.create_section_from_indices("a", 30, 10, "Run", "x").is_err());
        assert!(engine.create_section_from_indices("a", 10, 50, "Run", "x").is_err());
        assert!(matches!(
            engine.create_section_from_indices("zzz", 1, 2, "Run", "x"),
            Err(EngineError::UnknownActivity(_))
        ));
        assert!(engine.get_custom_sections().is_empty());
    }

    #[test]
    fn test_unique_ids_within_one_millisecond() {
        let mut engine = PersistentRouteEngine::in_memory().unwrap();
        engine.add_activity("a", sample_coords(), "Run").unwrap();
        let first = engine.create_section_from_indices("a", 0, 10, "Run", "One").unwrap();
        let second = engine.create_section_from_indices("a", 0, 10, "Run", "Two").unwrap();
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn test_add_payload_and_remove() {
        let mut engine = PersistentRouteEngine::in_memory().unwrap();
        engine.add_activity("a", sample_coords(), "Run").unwrap();

        let json = serde_json::json!({
            "id": "custom_drawn",
            "name": "Drawn",
            "polyline": sample_coords()[5..25].to_vec(),
            "sportType": "Run",
        })
        .to_string();
        let added = engine.add_custom_section(&json).unwrap();
        assert!(!added.created_at.is_empty());
        assert!(added.distance_meters > 0.0);
        assert!(engine.add_custom_section(&json).unwrap_err().is_validation());
        assert_eq!(engine.get_custom_section_matches("custom_drawn").unwrap().len(), 1);

        engine.load().unwrap();
        assert_eq!(engine.get_custom_section("custom_drawn").unwrap().polyline.len(), 20);

        assert!(engine.remove_custom_section("custom_drawn").unwrap());
        assert!(!engine.remove_custom_section("custom_drawn").unwrap());
        assert!(engine.get_custom_section_matches("custom_drawn").unwrap().is_empty());
    }

    #[test]
    fn test_failed_matching_stores_nothing() {
        let mut engine = PersistentRouteEngine::in_memory().unwrap();
        engine.add_activity("a", sample_coords(), "Run").unwrap();
        engine.add_activity("b", sample_coords(), "Run").unwrap();
        engine
            .db
            .execute("UPDATE gps_tracks SET track_data = x'00' WHERE activity_id = 'b'", [])
            .unwrap();

        let json = serde_json::json!({
            "id": "custom_drawn",
            "name": "Drawn",
            "polyline": sample_coords()[5..25].to_vec(),
            "sportType": "Run",
        })
        .to_string();
        assert!(engine.add_custom_section(&json).is_err());
        assert!(engine.get_custom_sections().is_empty());

        let stored: i64 = engine
            .db
            .query_row("SELECT COUNT(*) FROM custom_sections", [], |row| row.get(0))
            .unwrap();
        assert_eq!(stored, 0);
        engine.load().unwrap();
        assert!(engine.get_custom_section("custom_drawn").is_none());
    }

    #[test]
    fn test_changed_readd_rematches() {
        let mut engine = PersistentRouteEngine::in_memory().unwrap();
        engine.add_activity("a", sample_coords(), "Run").unwrap();
        let section = engine
            .create_section_from_indices("a", 10, 30, "Run", "Hill")
            .unwrap();
        assert_eq!(engine.get_custom_section_matches(&section.id).unwrap().len(), 1);

        // Same road with five extra fixes before the old start
        let mut longer: Vec<GpsPoint> = (1..=5)
            .rev()
            .map(|k| GpsPoint::new(51.5074 - k as f64 * 0.001, -0.1278 - k as f64 * 0.0005))
            .collect();
        longer.extend(sample_coords());
        engine.add_activity("a", longer, "Run").unwrap();

        let matches = engine.get_custom_section_matches(&section.id).unwrap();
        assert_eq!(matches.len(), 1);
        assert!(haversine_distance(&matches[0].trace[0], &section.polyline[0]) < 60.0);

        let elsewhere: Vec<GpsPoint> = sample_coords()
            .iter()
            .map(|p| GpsPoint::new(p.latitude + 0.5, p.longitude))
            .collect();
        engine.add_activity("a", elsewhere, "Run").unwrap();
        assert!(engine.get_custom_section_matches(&section.id).unwrap().is_empty());
    }

    #[test]
    fn test_match_unknown_section_is_empty() {
        let mut engine = PersistentRouteEngine::in_memory().unwrap();
        engine.add_activity("a", sample_coords(), "Run").unwrap();
        assert!(engine
            .match_custom_section("missing", &["a".to_string()])
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_extract_trace_from_store() {
        let mut engine = PersistentRouteEngine::in_memory().unwrap();
        engine.add_activity("a", sample_coords(), "Run").unwrap();
        let polyline = sample_coords()[20..40].to_vec();
        let trace = engine.extract_section_trace("a", &polyline).unwrap().unwrap();
        assert_eq!(trace.first(), polyline.first());
        assert!(engine.extract_section_trace("zzz", &polyline).unwrap().is_none());
    }
}
