//! Route groups: lazy recomputation, consensus routes, names and performances.

use std::collections::HashMap;

use log::info;
use rusqlite::params;

use super::{GroupDetail, GroupSummary, PersistentRouteEngine};
use crate::custom_sections::validate_name;
use crate::error::Result;
use crate::grouping::group_by_sport;
use crate::performance::{route_performances, RouteMember};
use crate::{ActivityMatchInfo, Bounds, GpsPoint, RouteGroup, RoutePerformanceResult};

impl PersistentRouteEngine {
    pub(super) fn load_groups(&mut self) -> Result<()> {
        let mut stmt = self.db.prepare(
            "SELECT id, representative_id, activity_ids, sport_type,
                    bounds_min_lat, bounds_max_lat, bounds_min_lng, bounds_max_lng,
                    best_time, best_activity_id
             FROM route_groups ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let bounds = match (
                    row.get::<_, Option<f64>>(4)?,
                    row.get::<_, Option<f64>>(5)?,
                    row.get::<_, Option<f64>>(6)?,
                    row.get::<_, Option<f64>>(7)?,
                ) {
                    (Some(min_lat), Some(max_lat), Some(min_lng), Some(max_lng)) => Some(Bounds {
                        min_lat,
                        max_lat,
                        min_lng,
                        max_lng,
                    }),
                    _ => None,
                };
                Ok((
                    RouteGroup {
                        group_id: row.get(0)?,
                        representative_id: row.get(1)?,
                        activity_ids: Vec::new(),
                        sport_type: row.get(3)?,
                        bounds,
                        custom_name: None,
                        best_time: row.get(8)?,
                        best_activity_id: row.get(9)?,
                    },
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);

        let mut groups = Vec::with_capacity(rows.len());
        for (mut group, ids_json) in rows {
            group.activity_ids = serde_json::from_str(&ids_json)?;
            groups.push(group);
        }

        let mut matches: HashMap<String, Vec<ActivityMatchInfo>> = HashMap::new();
        let mut stmt = self.db.prepare(
            "SELECT route_id, activity_id, match_percentage, direction
             FROM activity_matches ORDER BY route_id, activity_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                ActivityMatchInfo {
                    activity_id: row.get(1)?,
                    match_percentage: row.get(2)?,
                    direction: row.get(3)?,
                },
            ))
        })?;
        for row in rows {
            let (route_id, info) = row?;
            matches.entry(route_id).or_default().push(info);
        }
        drop(stmt);

        // Activities stored after the last grouping
        let grouped: usize = groups.iter().map(|g| g.activity_ids.len()).sum();
        if grouped != self.activity_metadata.len() {
            self.groups_dirty = true;
        }

        self.groups = groups;
        self.activity_matches = matches;
        self.reverse_index.set_groups(
            self.groups
                .iter()
                .map(|g| (g.group_id.as_str(), g.activity_ids.as_slice())),
        );
        Ok(())
    }

    /// Regroup if anything changed since the last grouping.
    fn ensure_groups(&mut self) -> Result<()> {
        if self.groups_dirty {
            self.recompute_groups()?;
        }
        Ok(())
    }

    fn recompute_groups(&mut self) -> Result<()> {
        let ids = self.get_activity_ids();
        let mut signatures = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(sig) = self.get_signature(id)? {
                signatures.push(sig);
            }
        }
        let sport_types: HashMap<String, String> = self
            .activity_metadata
            .values()
            .map(|m| (m.id.clone(), m.sport_type.clone()))
            .collect();

        let result = group_by_sport(&signatures, &sport_types, &self.config.match_config);
        self.groups = result.groups;
        self.activity_matches = result.activity_matches;
        self.fill_best_times();
        self.save_groups()?;

        self.reverse_index.set_groups(
            self.groups
                .iter()
                .map(|g| (g.group_id.as_str(), g.activity_ids.as_slice())),
        );
        self.consensus_cache.clear();
        self.groups_dirty = false;

        info!(
            "[Grouping] {} activities -> {} groups",
            signatures.len(),
            self.groups.len()
        );
        Ok(())
    }

    fn route_members<'a>(&'a self, group: &'a RouteGroup) -> Vec<RouteMember<'a>> {
        let matches = self.activity_matches.get(&group.group_id);
        group
            .activity_ids
            .iter()
            .map(|id| RouteMember {
                activity_id: id,
                times: self.time_streams.get(id).map(Vec::as_slice),
                metrics: self.activity_metrics.get(id),
                distance: self
                    .activity_metadata
                    .get(id)
                    .map(|m| m.distance_meters)
                    .unwrap_or(0.0),
                match_info: matches.and_then(|m| m.iter().find(|info| &info.activity_id == id)),
            })
            .collect()
    }

    fn fill_best_times(&mut self) {
        let best: Vec<Option<(f64, String)>> = self
            .groups
            .iter()
            .map(|group| {
                route_performances(&self.route_members(group), None)
                    .best
                    .map(|p| (p.duration as f64, p.activity_id))
            })
            .collect();
        for (group, best) in self.groups.iter_mut().zip(best) {
            group.best_time = best.as_ref().map(|(time, _)| *time);
            group.best_activity_id = best.map(|(_, id)| id);
        }
    }

    /// Recompute group best times after timing data changed.
    pub(super) fn refresh_best_times(&mut self) -> Result<()> {
        if self.groups_dirty || self.groups.is_empty() {
            return Ok(());
        }
        self.fill_best_times();
        let tx = self.db.unchecked_transaction()?;
        for group in &self.groups {
            tx.execute(
                "UPDATE route_groups SET best_time = ?, best_activity_id = ? WHERE id = ?",
                params![group.best_time, group.best_activity_id, group.group_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn save_groups(&self) -> Result<()> {
        let tx = self.db.unchecked_transaction()?;
        tx.execute("DELETE FROM route_groups", [])?;
        tx.execute("DELETE FROM activity_matches", [])?;
        {
            let mut group_stmt = tx.prepare(
                "INSERT INTO route_groups (id, representative_id, activity_ids, sport_type,
                    bounds_min_lat, bounds_max_lat, bounds_min_lng, bounds_max_lng,
                    best_time, best_activity_id)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )?;
            let mut match_stmt = tx.prepare(
                "INSERT INTO activity_matches (route_id, activity_id, match_percentage, direction)
                 VALUES (?, ?, ?, ?)",
            )?;

            for group in &self.groups {
                group_stmt.execute(params![
                    group.group_id,
                    group.representative_id,
                    serde_json::to_string(&group.activity_ids)?,
                    group.sport_type,
                    group.bounds.map(|b| b.min_lat),
                    group.bounds.map(|b| b.max_lat),
                    group.bounds.map(|b| b.min_lng),
                    group.bounds.map(|b| b.max_lng),
                    group.best_time,
                    group.best_activity_id,
                ])?;

                for info in self.activity_matches.get(&group.group_id).into_iter().flatten() {
                    match_stmt.execute(params![
                        group.group_id,
                        info.activity_id,
                        info.match_percentage,
                        info.direction
                    ])?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn with_route_name(&self, mut group: RouteGroup) -> RouteGroup {
        group.custom_name = self.route_names.get(&group.group_id).cloned();
        group
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// All route groups, recomputing first if stale.
    pub fn get_groups(&mut self) -> Result<Vec<RouteGroup>> {
        self.ensure_groups()?;
        Ok(self
            .groups
            .iter()
            .map(|g| self.with_route_name(g.clone()))
            .collect())
    }

    pub fn get_group_count(&mut self) -> Result<u32> {
        self.ensure_groups()?;
        Ok(self.groups.len() as u32)
    }

    pub fn get_group_summaries(&mut self) -> Result<Vec<GroupSummary>> {
        self.ensure_groups()?;
        Ok(self
            .groups
            .iter()
            .map(|g| GroupSummary {
                group_id: g.group_id.clone(),
                representative_id: g.representative_id.clone(),
                sport_type: g.sport_type.clone(),
                activity_count: g.activity_ids.len() as u32,
                custom_name: self.route_names.get(&g.group_id).cloned(),
                bounds: g.bounds,
                best_time: g.best_time,
            })
            .collect())
    }

    /// The group containing an activity.
    pub fn get_group_for_activity(&mut self, activity_id: &str) -> Result<Option<String>> {
        self.ensure_groups()?;
        Ok(self.reverse_index.group_for(activity_id).map(str::to_string))
    }

    /// Consensus route of a group: its representative's full track.
    pub fn get_consensus_route(&mut self, group_id: &str) -> Result<Option<Vec<GpsPoint>>> {
        self.ensure_groups()?;
        if let Some(route) = self.consensus_cache.get(group_id) {
            return Ok(Some(route.clone()));
        }

        let Some(group) = self.groups.iter().find(|g| g.group_id == group_id) else {
            return Ok(None);
        };
        let Some(track) = self.get_gps_track(&group.representative_id)? else {
            return Ok(None);
        };
        self.consensus_cache.put(group_id.to_string(), track.clone());
        Ok(Some(track))
    }

    pub fn get_group_by_id(&mut self, group_id: &str) -> Result<Option<GroupDetail>> {
        let Some(consensus) = self.get_consensus_route(group_id)? else {
            return Ok(None);
        };
        let Some(group) = self.groups.iter().find(|g| g.group_id == group_id) else {
            return Ok(None);
        };
        Ok(Some(GroupDetail {
            group: self.with_route_name(group.clone()),
            consensus,
            activity_matches: self
                .activity_matches
                .get(group_id)
                .cloned()
                .unwrap_or_default(),
        }))
    }

    /// Per-member durations for a group, with the fastest and the current activity's rank.
    pub fn get_route_performances(
        &mut self,
        group_id: &str,
        current_activity_id: Option<&str>,
    ) -> Result<RoutePerformanceResult> {
        self.ensure_groups()?;
        let Some(group) = self.groups.iter().find(|g| g.group_id == group_id) else {
            return Ok(RoutePerformanceResult::default());
        };
        Ok(route_performances(&self.route_members(group), current_activity_id))
    }

    // ========================================================================
    // Route Names
    // ========================================================================

    /// Set or clear (`None` or blank) a route group's user name.
    pub fn set_route_name(&mut self, route_id: &str, name: Option<&str>) -> Result<()> {
        let name = name.map(str::trim).filter(|n| !n.is_empty());
        match name {
            Some(name) => {
                validate_name("name", name)?;
                self.db.execute(
                    "INSERT OR REPLACE INTO route_names (route_id, custom_name) VALUES (?, ?)",
                    params![route_id, name],
                )?;
                self.route_names.insert(route_id.to_string(), name.to_string());
            }
            None => {
                self.db
                    .execute("DELETE FROM route_names WHERE route_id = ?", params![route_id])?;
                self.route_names.remove(route_id);
            }
        }
        Ok(())
    }

    pub fn get_route_name(&self, route_id: &str) -> Option<String> {
        self.route_names.get(route_id).cloned()
    }

    pub fn get_all_route_names(&self) -> HashMap<String, String> {
        self.route_names.clone()
    }
}
