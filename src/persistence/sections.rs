//! Detected section storage, naming, references and removal patching.

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::Utc;
use log::{debug, info, warn};
use rusqlite::{params, Connection, OptionalExtension};

use super::{detection, PersistentRouteEngine, SectionSummary};
use crate::custom_sections::validate_name;
use crate::error::{EngineError, Result};
use crate::geo_utils::{compute_bounds, polyline_length};
use crate::sections::{detect_sections_multiscale, polylines_overlap, sport_slug};
use crate::spatial_index::BoundsEntry;
use crate::{Bounds, DetectionProgress, FrequentSection, GpsPoint, PotentialSection, SectionPortion};

/// Section rows rewritten while removing activities, applied to memory after commit.
#[derive(Debug, Default)]
pub(super) struct SectionPatch {
    updated: Vec<FrequentSection>,
    deleted: Vec<String>,
}

/// Medoid columns to (re)write with a section row.
struct Medoid<'a> {
    activity_id: &'a str,
    polyline: &'a [GpsPoint],
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

fn sort_sections(sections: &mut [FrequentSection]) {
    sections.sort_by(|a, b| b.visit_count.cmp(&a.visit_count).then_with(|| a.id.cmp(&b.id)));
}

/// Upsert a section row and replace its portions.
///
/// Medoid columns are only written when `medoid` is given; an update
/// without one leaves the stored medoid alone.
fn save_section(conn: &Connection, section: &FrequentSection, medoid: Option<Medoid<'_>>) -> Result<()> {
    let polyline_blob = rmp_serde::to_vec(&section.polyline)?;
    let now = now_rfc3339();

    conn.execute("DELETE FROM section_activities WHERE section_id = ?", params![section.id])?;

    let (medoid_id, medoid_blob) = match &medoid {
        Some(m) => (m.activity_id.to_string(), rmp_serde::to_vec(m.polyline)?),
        None => (section.representative_activity_id.clone(), polyline_blob.clone()),
    };
    conn.execute(
        "INSERT INTO sections (id, name, sport_type, representative_activity_id, reference_pinned,
            medoid_activity_id, visit_count, distance_meters, confidence, average_spread, scale,
            min_lat, max_lat, min_lng, max_lng, polyline, medoid_polyline, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?18)
         ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            sport_type = excluded.sport_type,
            representative_activity_id = excluded.representative_activity_id,
            reference_pinned = excluded.reference_pinned,
            visit_count = excluded.visit_count,
            distance_meters = excluded.distance_meters,
            confidence = excluded.confidence,
            average_spread = excluded.average_spread,
            scale = excluded.scale,
            min_lat = excluded.min_lat,
            max_lat = excluded.max_lat,
            min_lng = excluded.min_lng,
            max_lng = excluded.max_lng,
            polyline = excluded.polyline,
            updated_at = excluded.updated_at",
        params![
            section.id,
            section.name,
            section.sport_type,
            section.representative_activity_id,
            section.reference_pinned,
            medoid_id,
            section.visit_count,
            section.distance_meters,
            section.confidence,
            section.average_spread,
            section.scale,
            section.bounds.min_lat,
            section.bounds.max_lat,
            section.bounds.min_lng,
            section.bounds.max_lng,
            polyline_blob,
            medoid_blob,
            now,
        ],
    )?;

    if medoid.is_some() {
        conn.execute(
            "UPDATE sections SET medoid_activity_id = ?, medoid_polyline = ? WHERE id = ?",
            params![medoid_id, medoid_blob, section.id],
        )?;
    }

    let mut stmt = conn.prepare_cached(
        "INSERT OR REPLACE INTO section_activities
         (section_id, activity_id, direction, start_index, end_index, distance_meters)
         VALUES (?, ?, ?, ?, ?, ?)",
    )?;
    for p in &section.activity_portions {
        stmt.execute(params![
            section.id,
            p.activity_id,
            p.direction,
            p.start_index,
            p.end_index,
            p.distance_meters
        ])?;
    }
    Ok(())
}

fn read_sections(conn: &Connection) -> Result<Vec<FrequentSection>> {
    let mut portions: HashMap<String, Vec<SectionPortion>> = HashMap::new();
    {
        let mut stmt = conn.prepare(
            "SELECT section_id, activity_id, direction, start_index, end_index, distance_meters
             FROM section_activities ORDER BY section_id, activity_id, start_index",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                SectionPortion {
                    activity_id: row.get(1)?,
                    direction: row.get(2)?,
                    start_index: row.get(3)?,
                    end_index: row.get(4)?,
                    distance_meters: row.get(5)?,
                },
            ))
        })?;
        for row in rows {
            let (section_id, portion) = row?;
            portions.entry(section_id).or_default().push(portion);
        }
    }

    let mut stmt = conn.prepare(
        "SELECT id, name, sport_type, representative_activity_id, reference_pinned, visit_count,
                distance_meters, confidence, average_spread, scale,
                min_lat, max_lat, min_lng, max_lng, polyline
         FROM sections",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                FrequentSection {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    sport_type: row.get(2)?,
                    representative_activity_id: row.get(3)?,
                    reference_pinned: row.get(4)?,
                    visit_count: row.get(5)?,
                    distance_meters: row.get(6)?,
                    confidence: row.get(7)?,
                    average_spread: row.get(8)?,
                    scale: row.get(9)?,
                    bounds: Bounds {
                        min_lat: row.get(10)?,
                        max_lat: row.get(11)?,
                        min_lng: row.get(12)?,
                        max_lng: row.get(13)?,
                    },
                    polyline: Vec::new(),
                    activity_ids: Vec::new(),
                    activity_portions: Vec::new(),
                },
                row.get::<_, Vec<u8>>(14)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut sections = Vec::with_capacity(rows.len());
    for (mut section, blob) in rows {
        section.polyline = rmp_serde::from_slice(&blob)?;
        section.activity_portions = portions.remove(&section.id).unwrap_or_default();
        section.activity_ids = section
            .activity_portions
            .iter()
            .map(|p| p.activity_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        sections.push(section);
    }
    Ok(sections)
}

/// The track points of an activity's first portion, oriented like the section.
fn slice_reference(track: &[GpsPoint], portion: &SectionPortion) -> Option<Vec<GpsPoint>> {
    let (start, end) = (portion.start_index as usize, portion.end_index as usize);
    if start >= end || end >= track.len() {
        return None;
    }
    let mut points = track[start..=end].to_vec();
    if portion.direction == "reverse" {
        points.reverse();
    }
    Some(points)
}

/// Make `activity_id` the section's reference, re-slicing the polyline from its track.
///
/// Returns false when the activity has no usable portion.
fn rebase_reference(conn: &Connection, section: &mut FrequentSection, activity_id: &str) -> Result<bool> {
    let Some(portion) = section
        .activity_portions
        .iter()
        .filter(|p| p.activity_id == activity_id)
        .min_by_key(|p| p.start_index)
    else {
        return Ok(false);
    };
    let Some(track) = super::read_track(conn, activity_id)? else {
        return Ok(false);
    };
    let Some(polyline) = slice_reference(&track, portion) else {
        return Ok(false);
    };

    section.representative_activity_id = activity_id.to_string();
    section.distance_meters = polyline_length(&polyline);
    section.bounds = compute_bounds(&polyline);
    section.polyline = polyline;
    Ok(true)
}

fn write_reference(conn: &Connection, section: &FrequentSection) -> Result<()> {
    conn.execute(
        "UPDATE sections SET representative_activity_id = ?, reference_pinned = ?, polyline = ?,
            distance_meters = ?, min_lat = ?, max_lat = ?, min_lng = ?, max_lng = ?, updated_at = ?
         WHERE id = ?",
        params![
            section.representative_activity_id,
            section.reference_pinned,
            rmp_serde::to_vec(&section.polyline)?,
            section.distance_meters,
            section.bounds.min_lat,
            section.bounds.max_lat,
            section.bounds.min_lng,
            section.bounds.max_lng,
            now_rfc3339(),
            section.id,
        ],
    )?;
    Ok(())
}

/// Lowest `sec_{slug}_{n}` not in `taken`.
fn next_free_id(sport_type: &str, taken: &HashSet<String>) -> (String, usize) {
    let slug = sport_slug(sport_type);
    let mut n = 1;
    loop {
        let id = format!("sec_{}_{}", slug, n);
        if !taken.contains(&id) {
            return (id, n);
        }
        n += 1;
    }
}

impl PersistentRouteEngine {
    // ========================================================================
    // Loading and committing
    // ========================================================================

    pub(super) fn load_sections(&mut self) -> Result<()> {
        let mut sections = read_sections(&self.db)?;
        sort_sections(&mut sections);
        self.sections = sections;
        self.rebuild_section_indexes();
        Ok(())
    }

    fn rebuild_section_indexes(&mut self) {
        self.reverse_index.clear_sections();
        for section in &self.sections {
            self.reverse_index.add_section(&section.id, &section.activity_ids);
        }
        self.section_index.mark_dirty();
    }

    /// Replace committed sections with a detection result.
    ///
    /// With `sport_type` set only that sport's sections are replaced. Runs in
    /// one transaction and swaps memory only after the commit. A new section
    /// duplicating a committed one takes over its id and generated name;
    /// when that one had a pinned reference still contributing, the pin and
    /// its geometry are carried over.
    pub(super) fn apply_sections(
        &mut self,
        detected: Vec<FrequentSection>,
        sport_type: Option<&str>,
    ) -> Result<()> {
        let tolerance = self.config.section_config.cluster_tolerance;
        let ratio = self.config.section_config.dedup_overlap_ratio;

        let tx = self.db.unchecked_transaction()?;

        // Activities removed while detection ran no longer exist. A section
        // that lost its reference but kept two contributors is rebased like
        // removal patching does.
        let mut sections: Vec<FrequentSection> = Vec::with_capacity(detected.len());
        for mut s in detected {
            s.activity_portions
                .retain(|p| self.activity_metadata.contains_key(&p.activity_id));
            s.activity_ids
                .retain(|id| self.activity_metadata.contains_key(id));
            s.visit_count = s.activity_portions.len() as u32;
            if s.activity_ids.len() < 2 {
                continue;
            }
            if !s.activity_ids.contains(&s.representative_activity_id) {
                let Some(lowest) = s.activity_ids.iter().min().cloned() else {
                    continue;
                };
                if !rebase_reference(&tx, &mut s, &lowest)? {
                    continue;
                }
                debug!("[Sections] Rebased {} onto {} after removal", s.id, lowest);
            }
            sections.push(s);
        }

        let mut claimed: HashSet<&str> = HashSet::new();
        let mut inherited: Vec<Option<&FrequentSection>> = Vec::with_capacity(sections.len());
        for s in &sections {
            let previous = self.sections.iter().find(|old| {
                !claimed.contains(old.id.as_str())
                    && old.sport_type == s.sport_type
                    && old.bounds.intersects(&s.bounds)
                    && polylines_overlap(&old.polyline, &s.polyline, tolerance, ratio)
            });
            if let Some(old) = previous {
                claimed.insert(&old.id);
            }
            inherited.push(previous);
        }

        let kept: Vec<FrequentSection> = self
            .sections
            .iter()
            .filter(|s| sport_type.is_some_and(|sport| s.sport_type != sport))
            .cloned()
            .collect();

        let mut taken: HashSet<String> = claimed
            .iter()
            .map(|id| id.to_string())
            .chain(kept.iter().map(|s| s.id.clone()))
            .collect();
        tx.execute(
            "DELETE FROM sections WHERE ?1 IS NULL OR sport_type = ?1",
            params![sport_type],
        )?;

        let mut carried = 0;
        for (section, previous) in sections.iter_mut().zip(&inherited) {
            let detected_reference = section.representative_activity_id.clone();
            let detected_polyline = section.polyline.clone();

            match previous {
                Some(old) => {
                    section.id = old.id.clone();
                    section.name = old.name.clone();
                    carried += 1;

                    if old.reference_pinned
                        && section.activity_ids.contains(&old.representative_activity_id)
                        && rebase_reference(&tx, section, &old.representative_activity_id)?
                    {
                        section.reference_pinned = true;
                    }
                }
                None if taken.contains(&section.id) || section.id.is_empty() => {
                    let (id, n) = next_free_id(&section.sport_type, &taken);
                    section.name = Some(format!("{} Section {}", section.sport_type, n));
                    section.id = id;
                }
                None => {}
            }
            taken.insert(section.id.clone());

            save_section(
                &tx,
                section,
                Some(Medoid {
                    activity_id: &detected_reference,
                    polyline: &detected_polyline,
                }),
            )?;
        }
        tx.commit()?;

        sections.extend(kept);
        sort_sections(&mut sections);
        info!(
            "[Sections] Committed {} sections ({} kept their id)",
            sections.len(),
            carried
        );
        self.sections = sections;
        self.sections_dirty = false;
        self.rebuild_section_indexes();
        Ok(())
    }

    /// Rewrite sections that depend on activities about to be deleted.
    ///
    /// Must run inside the removal transaction, before the activity rows go.
    pub(super) fn patch_sections_for_removal(
        &self,
        conn: &Connection,
        removed: &HashSet<&str>,
    ) -> Result<SectionPatch> {
        let affected: BTreeSet<String> = removed
            .iter()
            .flat_map(|id| self.reverse_index.sections_for(id))
            .collect();

        let mut patch = SectionPatch::default();
        for section_id in affected {
            let Some(current) = self.sections.iter().find(|s| s.id == section_id) else {
                continue;
            };
            let mut section = current.clone();
            section
                .activity_portions
                .retain(|p| !removed.contains(p.activity_id.as_str()));
            section
                .activity_ids
                .retain(|id| !removed.contains(id.as_str()));
            section.visit_count = section.activity_portions.len() as u32;

            let mut keep = section.activity_ids.len() >= 2;
            if keep && removed.contains(section.representative_activity_id.as_str()) {
                let lowest = section.activity_ids[0].clone();
                keep = rebase_reference(conn, &mut section, &lowest)?;
                section.reference_pinned = false;
            }
            if !keep {
                conn.execute("DELETE FROM sections WHERE id = ?", params![section.id])?;
                debug!("[Sections] Deleted {} after contributor removal", section.id);
                patch.deleted.push(section.id);
                continue;
            }

            let medoid_id: Option<String> = conn
                .query_row(
                    "SELECT medoid_activity_id FROM sections WHERE id = ?",
                    params![section.id],
                    |row| row.get(0),
                )
                .optional()?;
            let medoid_gone = medoid_id.is_some_and(|id| removed.contains(id.as_str()));
            let medoid = medoid_gone.then(|| Medoid {
                activity_id: &section.representative_activity_id,
                polyline: &section.polyline,
            });
            save_section(conn, &section, medoid)?;
            patch.updated.push(section);
        }
        Ok(patch)
    }

    pub(super) fn apply_section_patch(&mut self, patch: SectionPatch) {
        if patch.updated.is_empty() && patch.deleted.is_empty() {
            return;
        }
        for id in &patch.deleted {
            self.sections.retain(|s| &s.id != id);
            self.reverse_index.remove_section(id);
        }
        for section in patch.updated {
            self.reverse_index.remove_section(&section.id);
            self.reverse_index.add_section(&section.id, &section.activity_ids);
            if let Some(slot) = self.sections.iter_mut().find(|s| s.id == section.id) {
                *slot = section;
            }
        }
        sort_sections(&mut self.sections);
        self.section_index.mark_dirty();
    }

    // ========================================================================
    // Queries
    // ========================================================================

    fn with_display_name(&self, mut section: FrequentSection) -> FrequentSection {
        if let Some(name) = self.section_names.get(&section.id) {
            section.name = Some(name.clone());
        }
        section
    }

    /// All committed sections, user names applied.
    pub fn get_sections(&self) -> Vec<FrequentSection> {
        self.sections
            .iter()
            .map(|s| self.with_display_name(s.clone()))
            .collect()
    }

    pub fn get_section_count(&self) -> u32 {
        self.sections.len() as u32
    }

    pub fn get_section_by_id(&self, section_id: &str) -> Option<FrequentSection> {
        self.sections
            .iter()
            .find(|s| s.id == section_id)
            .map(|s| self.with_display_name(s.clone()))
    }

    /// Sections the activity contributes to.
    pub fn get_sections_for_activity(&self, activity_id: &str) -> Vec<FrequentSection> {
        self.reverse_index
            .sections_for(activity_id)
            .iter()
            .filter_map(|id| self.get_section_by_id(id))
            .collect()
    }

    /// Scalar section projection read straight from the store.
    pub fn get_section_summaries(&self, sport_type: Option<&str>) -> Result<Vec<SectionSummary>> {
        let mut stmt = self.db.prepare(
            "SELECT s.id, s.name, s.sport_type, s.representative_activity_id, s.reference_pinned,
                    s.visit_count,
                    (SELECT COUNT(DISTINCT sa.activity_id) FROM section_activities sa WHERE sa.section_id = s.id),
                    s.distance_meters, s.confidence, s.scale,
                    s.min_lat, s.max_lat, s.min_lng, s.max_lng
             FROM sections s
             WHERE ?1 IS NULL OR s.sport_type = ?1
             ORDER BY s.visit_count DESC, s.id",
        )?;
        let summaries = stmt
            .query_map(params![sport_type], |row| {
                Ok(SectionSummary {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    sport_type: row.get(2)?,
                    representative_activity_id: row.get(3)?,
                    reference_pinned: row.get(4)?,
                    visit_count: row.get(5)?,
                    activity_count: row.get(6)?,
                    distance_meters: row.get(7)?,
                    confidence: row.get(8)?,
                    scale: row.get(9)?,
                    bounds: Bounds {
                        min_lat: row.get(10)?,
                        max_lat: row.get(11)?,
                        min_lng: row.get(12)?,
                        max_lng: row.get(13)?,
                    },
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(summaries
            .into_iter()
            .map(|mut s| {
                if let Some(name) = self.section_names.get(&s.id) {
                    s.name = Some(name.clone());
                }
                s
            })
            .collect())
    }

    /// Section ids whose bounds intersect the viewport, sorted.
    pub fn query_sections_in_viewport(&mut self, viewport: &Bounds) -> Vec<String> {
        let sections = &self.sections;
        self.section_index.ensure_built(|| {
            sections
                .iter()
                .map(|s| BoundsEntry {
                    id: s.id.clone(),
                    bounds: s.bounds,
                })
                .collect()
        });
        self.section_index.query_viewport(viewport)
    }

    // ========================================================================
    // Names
    // ========================================================================

    /// Set or clear (`None` or blank) a section's user name.
    pub fn set_section_name(&mut self, section_id: &str, name: Option<&str>) -> Result<()> {
        let name = name.map(str::trim).filter(|n| !n.is_empty());
        match name {
            Some(name) => {
                validate_name("name", name)?;
                self.db.execute(
                    "INSERT OR REPLACE INTO section_names (section_id, custom_name) VALUES (?, ?)",
                    params![section_id, name],
                )?;
                self.section_names
                    .insert(section_id.to_string(), name.to_string());
            }
            None => {
                self.db.execute(
                    "DELETE FROM section_names WHERE section_id = ?",
                    params![section_id],
                )?;
                self.section_names.remove(section_id);
            }
        }
        Ok(())
    }

    /// The user name if set, otherwise the generated one.
    pub fn get_section_name(&self, section_id: &str) -> Option<String> {
        self.section_names.get(section_id).cloned().or_else(|| {
            self.sections
                .iter()
                .find(|s| s.id == section_id)
                .and_then(|s| s.name.clone())
        })
    }

    /// All user-set section names.
    pub fn get_all_section_names(&self) -> HashMap<String, String> {
        self.section_names.clone()
    }

    // ========================================================================
    // Reference activity
    // ========================================================================

    /// Pin a contributing activity as the section's reference.
    ///
    /// Returns false for an unknown section.
    pub fn set_section_reference(&mut self, section_id: &str, activity_id: &str) -> Result<bool> {
        let Some(pos) = self.sections.iter().position(|s| s.id == section_id) else {
            return Ok(false);
        };
        let mut section = self.sections[pos].clone();
        if !section.activity_ids.iter().any(|id| id == activity_id) {
            return Err(EngineError::validation(
                "activityId",
                format!("'{}' does not traverse section '{}'", activity_id, section_id),
            ));
        }

        let tx = self.db.unchecked_transaction()?;
        if !rebase_reference(&tx, &mut section, activity_id)? {
            return Err(EngineError::UnknownActivity(activity_id.to_string()));
        }
        section.reference_pinned = true;
        write_reference(&tx, &section)?;
        tx.commit()?;

        info!("[Sections] {} reference pinned to {}", section_id, activity_id);
        self.sections[pos] = section;
        self.section_index.mark_dirty();
        Ok(true)
    }

    /// Drop the pin and restore the detected medoid geometry.
    pub fn reset_section_reference(&mut self, section_id: &str) -> Result<bool> {
        let Some(pos) = self.sections.iter().position(|s| s.id == section_id) else {
            return Ok(false);
        };
        let medoid: Option<(String, Vec<u8>)> = self
            .db
            .query_row(
                "SELECT medoid_activity_id, medoid_polyline FROM sections WHERE id = ?",
                params![section_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((medoid_id, blob)) = medoid else {
            return Ok(false);
        };
        let polyline: Vec<GpsPoint> = rmp_serde::from_slice(&blob)?;

        let mut section = self.sections[pos].clone();
        section.representative_activity_id = medoid_id;
        section.distance_meters = polyline_length(&polyline);
        section.bounds = compute_bounds(&polyline);
        section.polyline = polyline;
        section.reference_pinned = false;
        write_reference(&self.db, &section)?;

        self.sections[pos] = section;
        self.section_index.mark_dirty();
        Ok(true)
    }

    // ========================================================================
    // Potentials
    // ========================================================================

    /// Run detection synchronously and return raw candidates without persisting.
    pub fn detect_potentials(&self, sport_type: Option<&str>) -> Result<Vec<PotentialSection>> {
        let input = self.detection_input(sport_type);
        let tracks = detection::load_tracks(&self.db, &input)?;
        let sports: HashMap<String, String> = input.into_iter().collect();

        let mut config = self.config.section_config.clone();
        config.include_potentials = true;
        let progress = DetectionProgress::new();

        match detect_sections_multiscale(&tracks, &sports, &config, &progress) {
            Ok(result) => Ok(result.potentials),
            Err(_) => {
                warn!("[Sections] Potential detection aborted");
                Err(EngineError::Internal("potential detection aborted".to_string()))
            }
        }
    }

    /// `(activity id, sport)` pairs for a detection run, sorted by id.
    pub(super) fn detection_input(&self, sport_type: Option<&str>) -> Vec<(String, String)> {
        let mut input: Vec<(String, String)> = self
            .activity_metadata
            .values()
            .filter(|m| sport_type.map_or(true, |sport| m.sport_type == sport))
            .map(|m| (m.id.clone(), m.sport_type.clone()))
            .collect();
        input.sort();
        input
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::tests::sample_coords;

    /// Two activities sharing one straight section, stored directly.
    fn engine_with_section() -> PersistentRouteEngine {
        let mut engine = PersistentRouteEngine::in_memory().unwrap();
        for id in ["a", "b", "c"] {
            engine.add_activity(id, sample_coords(), "Ride").unwrap();
        }
        let polyline = sample_coords()[10..30].to_vec();
        let portions = ["a", "b", "c"]
            .iter()
            .map(|id| SectionPortion {
                activity_id: id.to_string(),
                start_index: 10,
                end_index: 29,
                distance_meters: polyline_length(&polyline),
                direction: "same".to_string(),
            })
            .collect();
        let section = FrequentSection {
            id: "sec_ride_1".to_string(),
            name: Some("Ride Section 1".to_string()),
            sport_type: "Ride".to_string(),
            representative_activity_id: "b".to_string(),
            activity_ids: vec!["a".to_string(), "b".to_string(), "c".to_string()],
            activity_portions: portions,
            visit_count: 3,
            distance_meters: polyline_length(&polyline),
            confidence: 0.8,
            average_spread: 1.0,
            scale: "medium".to_string(),
            bounds: compute_bounds(&polyline),
            polyline,
            reference_pinned: false,
        };
        engine.apply_sections(vec![section], None).unwrap();
        engine
    }

    #[test]
    fn test_apply_and_reload() {
        let mut engine = engine_with_section();
        assert_eq!(engine.get_section_count(), 1);
        assert_eq!(engine.get_sections_for_activity("a").len(), 1);

        engine.load().unwrap();
        let section = engine.get_section_by_id("sec_ride_1").unwrap();
        assert_eq!(section.activity_ids, vec!["a", "b", "c"]);
        assert_eq!(section.activity_portions.len(), 3);
        assert_eq!(section.polyline.len(), 20);

        let summaries = engine.get_section_summaries(Some("Ride")).unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].activity_count, 3);
        assert!(engine.get_section_summaries(Some("Run")).unwrap().is_empty());
    }

    #[test]
    fn test_redetection_keeps_id_and_pin() {
        let mut engine = engine_with_section();
        engine.set_section_reference("sec_ride_1", "c").unwrap();

        let mut again = engine.get_section_by_id("sec_ride_1").unwrap();
        again.id = "sec_ride_7".to_string();
        again.representative_activity_id = "a".to_string();
        again.reference_pinned = false;
        engine.apply_sections(vec![again], None).unwrap();

        let section = engine.get_section_by_id("sec_ride_1").unwrap();
        assert!(section.reference_pinned);
        assert_eq!(section.representative_activity_id, "c");

        // The medoid is the newly detected reference
        engine.reset_section_reference("sec_ride_1").unwrap();
        assert_eq!(
            engine.get_section_by_id("sec_ride_1").unwrap().representative_activity_id,
            "a"
        );
    }

    #[test]
    fn test_reference_pin_and_reset() {
        let mut engine = engine_with_section();
        assert!(!engine.set_section_reference("missing", "a").unwrap());
        assert!(engine.set_section_reference("sec_ride_1", "zzz").unwrap_err().is_validation());

        assert!(engine.set_section_reference("sec_ride_1", "a").unwrap());
        let pinned = engine.get_section_by_id("sec_ride_1").unwrap();
        assert!(pinned.reference_pinned);
        assert_eq!(pinned.representative_activity_id, "a");

        assert!(engine.reset_section_reference("sec_ride_1").unwrap());
        let reset = engine.get_section_by_id("sec_ride_1").unwrap();
        assert!(!reset.reference_pinned);
        assert_eq!(reset.representative_activity_id, "b");
    }

    #[test]
    fn test_removal_rebases_then_deletes() {
        let mut engine = engine_with_section();
        engine.remove_activities(&["b".to_string()]).unwrap();

        let section = engine.get_section_by_id("sec_ride_1").unwrap();
        assert_eq!(section.activity_ids, vec!["a", "c"]);
        assert_eq!(section.representative_activity_id, "a");
        assert_eq!(section.visit_count, 2);

        engine.remove_activities(&["a".to_string()]).unwrap();
        assert_eq!(engine.get_section_count(), 0);
        assert!(engine.get_sections_for_activity("c").is_empty());
        assert!(engine.get_section_summaries(None).unwrap().is_empty());
    }

    #[test]
    fn test_commit_rebases_when_reference_removed_mid_run() {
        let mut engine = engine_with_section();
        let detected = engine.get_section_by_id("sec_ride_1").unwrap();
        assert_eq!(detected.representative_activity_id, "b");

        engine.remove_activities(&["b".to_string()]).unwrap();
        engine.apply_sections(vec![detected.clone()], None).unwrap();

        let section = engine.get_section_by_id("sec_ride_1").unwrap();
        assert_eq!(section.activity_ids, vec!["a", "c"]);
        assert_eq!(section.representative_activity_id, "a");
        assert_eq!(section.visit_count, 2);
        assert_eq!(section.polyline, sample_coords()[10..30].to_vec());

        // One contributor left: nothing to commit
        engine.remove_activities(&["c".to_string()]).unwrap();
        engine.apply_sections(vec![detected], None).unwrap();
        assert_eq!(engine.get_section_count(), 0);
    }

    #[test]
    fn test_changed_readd_rebases_off_the_new_track() {
        let mut engine = engine_with_section();
        let moved: Vec<GpsPoint> = sample_coords()
            .iter()
            .map(|p| GpsPoint::new(p.latitude + 0.5, p.longitude))
            .collect();
        engine.add_activity("b", moved, "Ride").unwrap();

        let section = engine.get_section_by_id("sec_ride_1").unwrap();
        assert_eq!(section.activity_ids, vec!["a", "c"]);
        assert_eq!(section.representative_activity_id, "a");
        assert!(section.activity_portions.iter().all(|p| p.activity_id != "b"));
        assert!(engine.get_sections_for_activity("b").is_empty());

        // Same state after a reload from the store
        engine.load().unwrap();
        let reloaded = engine.get_section_by_id("sec_ride_1").unwrap();
        assert_eq!(reloaded.activity_ids, vec!["a", "c"]);
        assert_eq!(reloaded.polyline, section.polyline);
    }

    #[test]
    fn test_section_names() {
        let mut engine = engine_with_section();
        assert_eq!(engine.get_section_name("sec_ride_1").as_deref(), Some("Ride Section 1"));

        engine.set_section_name("sec_ride_1", Some("Climb")).unwrap();
        assert_eq!(engine.get_section_by_id("sec_ride_1").unwrap().name.as_deref(), Some("Climb"));
        assert_eq!(engine.get_all_section_names().len(), 1);

        engine.set_section_name("sec_ride_1", Some("   ")).unwrap();
        assert_eq!(engine.get_section_name("sec_ride_1").as_deref(), Some("Ride Section 1"));
        assert!(engine.set_section_name("sec_ride_1", Some("bad\nname")).is_err());
    }

    #[test]
    fn test_sections_viewport() {
        let mut engine = engine_with_section();
        let hits = engine.query_sections_in_viewport(&Bounds {
            min_lat: 51.5,
            max_lat: 51.6,
            min_lng: -0.2,
            max_lng: 0.0,
        });
        assert_eq!(hits, vec!["sec_ride_1"]);
    }

    #[test]
    fn test_fresh_id_collision_renumbered() {
        let mut engine = engine_with_section();
        let mut other = engine.get_section_by_id("sec_ride_1").unwrap();
        // Far away: cannot inherit, but its detected id is taken
        other.polyline = other
            .polyline
            .iter()
            .map(|p| GpsPoint::new(p.latitude + 1.0, p.longitude))
            .collect();
        other.bounds = compute_bounds(&other.polyline);
        let first = engine.get_section_by_id("sec_ride_1").unwrap();
        engine.apply_sections(vec![first, other], None).unwrap();

        let mut ids: Vec<String> = engine.get_sections().into_iter().map(|s| s.id).collect();
        ids.sort();
        assert_eq!(ids, vec!["sec_ride_1", "sec_ride_2"]);
    }
}
