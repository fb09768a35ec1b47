//! Per-point time streams and section performances.

use std::collections::HashMap;

use log::info;
use rusqlite::params;

use super::PersistentRouteEngine;
use crate::error::{EngineError, Result};
use crate::performance::{section_performances, LapCandidate};
use crate::{GpsPoint, SectionPerformanceResult};

impl PersistentRouteEngine {
    pub(super) fn load_time_streams(&mut self) -> Result<()> {
        let mut stmt = self
            .db
            .prepare("SELECT activity_id, times FROM time_streams")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut streams = HashMap::with_capacity(rows.len());
        for (id, blob) in rows {
            let times: Vec<u32> = rmp_serde::from_slice(&blob)?;
            streams.insert(id, times);
        }
        self.time_streams = streams;
        Ok(())
    }

    /// Store time streams from one flat buffer, all or nothing.
    ///
    /// `offsets[i]` is where stream `i` starts in `all_times`. Every id must
    /// be a stored activity and every stream must have one sample per GPS
    /// point. Returns the number of streams stored.
    pub fn set_time_streams_flat(
        &mut self,
        activity_ids: &[String],
        all_times: &[u32],
        offsets: &[u32],
    ) -> Result<u32> {
        if activity_ids.len() != offsets.len() {
            return Err(EngineError::validation(
                "offsets",
                format!("{} ids but {} offsets", activity_ids.len(), offsets.len()),
            ));
        }

        let mut streams: Vec<(&str, &[u32])> = Vec::with_capacity(activity_ids.len());
        for (i, id) in activity_ids.iter().enumerate() {
            let start = offsets[i] as usize;
            let end = offsets
                .get(i + 1)
                .map(|&o| o as usize)
                .unwrap_or(all_times.len());
            if start > end || end > all_times.len() {
                return Err(EngineError::validation(
                    "offsets",
                    format!("stream '{}' spans {}..{} of {}", id, start, end, all_times.len()),
                ));
            }

            let metadata = self
                .activity_metadata
                .get(id)
                .ok_or_else(|| EngineError::UnknownActivity(id.clone()))?;
            let times = &all_times[start..end];
            if times.len() != metadata.point_count as usize {
                return Err(EngineError::TimeStreamMismatch {
                    activity_id: id.clone(),
                    expected: metadata.point_count as usize,
                    actual: times.len(),
                });
            }
            streams.push((id, times));
        }

        let tx = self.db.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO time_streams (activity_id, times, point_count) VALUES (?, ?, ?)",
            )?;
            for (id, times) in &streams {
                stmt.execute(params![id, rmp_serde::to_vec(times)?, times.len() as i64])?;
            }
        }
        tx.commit()?;

        for (id, times) in &streams {
            self.time_streams.insert(id.to_string(), times.to_vec());
        }
        self.refresh_best_times()?;

        info!("[Store] Stored {} time streams", streams.len());
        Ok(streams.len() as u32)
    }

    /// The given ids that have no time stream stored.
    pub fn get_activities_missing_time_streams(&self, activity_ids: &[String]) -> Vec<String> {
        activity_ids
            .iter()
            .filter(|id| !self.time_streams.contains_key(id.as_str()))
            .cloned()
            .collect()
    }

    pub fn get_time_stream(&self, activity_id: &str) -> Option<&[u32]> {
        self.time_streams.get(activity_id).map(Vec::as_slice)
    }

    /// Lap performances over a detected or custom section.
    ///
    /// Detected sections are checked against their contributing activities,
    /// custom sections against every activity of the same sport whose bounds
    /// come near the section. Unknown ids yield an empty result.
    pub fn get_section_performances(&mut self, section_id: &str) -> Result<SectionPerformanceResult> {
        let detected = self
            .sections
            .iter()
            .find(|s| s.id == section_id)
            .map(|s| (s.polyline.clone(), s.distance_meters, s.activity_ids.clone()));

        let (polyline, distance, candidates) = match detected {
            Some(found) => found,
            None => {
                let Some(custom) = self.get_custom_section(section_id) else {
                    return Ok(SectionPerformanceResult::default());
                };
                let candidates = self.custom_candidates(&custom.polyline, &custom.sport_type);
                (custom.polyline, custom.distance_meters, candidates)
            }
        };

        let mut tracks: Vec<(String, Vec<GpsPoint>)> = Vec::with_capacity(candidates.len());
        for id in candidates {
            if let Some(track) = self.get_gps_track(&id)? {
                tracks.push((id, track));
            }
        }

        let lap_candidates: Vec<LapCandidate<'_>> = tracks
            .iter()
            .map(|(id, track)| LapCandidate {
                activity_id: id,
                track,
                times: self.time_streams.get(id).map(Vec::as_slice),
                metrics: self.activity_metrics.get(id),
            })
            .collect();

        Ok(section_performances(
            &polyline,
            distance,
            &lap_candidates,
            &self.config.custom_match_config,
        ))
    }
}
