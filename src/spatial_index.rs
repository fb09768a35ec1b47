//! Bounding-box indexes over activities and sections.
//!
//! [`SpatialIndex`] is an R-tree rebuilt lazily: mutations only mark it
//! dirty, and the next query bulk-loads a complete new tree and swaps it in
//! whole. [`ReverseIndex`] maps activity ids to the sections and group that
//! depend on them, so removing an activity patches dependents locally.

use std::collections::{BTreeSet, HashMap};

use rstar::{RTree, RTreeObject, AABB};

use crate::geo_utils::expand_bounds;
use crate::Bounds;

/// An entity id with its bounding box, as stored in the R-tree.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundsEntry {
    pub id: String,
    pub bounds: Bounds,
}

impl RTreeObject for BoundsEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.bounds.envelope()
    }
}

/// Lazily rebuilt R-tree of [`BoundsEntry`].
#[derive(Debug)]
pub struct SpatialIndex {
    tree: RTree<BoundsEntry>,
    dirty: bool,
}

impl Default for SpatialIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl SpatialIndex {
    /// Empty index that builds on first use.
    pub fn new() -> Self {
        Self {
            tree: RTree::new(),
            dirty: true,
        }
    }

    /// Flag the index for rebuild on the next query.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Rebuild from `entries` if dirty. The closure only runs when a rebuild is needed.
    pub fn ensure_built<F>(&mut self, entries: F)
    where
        F: FnOnce() -> Vec<BoundsEntry>,
    {
        if !self.dirty {
            return;
        }
        // Bulk-load off to the side, then replace in one assignment
        let tree = RTree::bulk_load(entries());
        self.tree = tree;
        self.dirty = false;
    }

    /// Ids whose bounding box intersects `viewport`, sorted.
    ///
    /// Boxes touching the viewport edge count as intersecting.
    pub fn query_viewport(&self, viewport: &Bounds) -> Vec<String> {
        let mut ids: Vec<String> = self
            .tree
            .locate_in_envelope_intersecting(&viewport.envelope())
            .map(|entry| entry.id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Ids whose bounding box overlaps `bounds` grown by `buffer_meters`.
    pub fn find_overlapping(&self, bounds: &Bounds, buffer_meters: f64) -> Vec<String> {
        self.query_viewport(&expand_bounds(bounds, buffer_meters))
    }

    pub fn len(&self) -> usize {
        self.tree.size()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.size() == 0
    }
}

/// Activity id → dependent section ids and group id.
#[derive(Debug, Default, Clone)]
pub struct ReverseIndex {
    sections: HashMap<String, BTreeSet<String>>,
    groups: HashMap<String, String>,
}

impl ReverseIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `section_id` under each of its contributing activities.
    pub fn add_section(&mut self, section_id: &str, activity_ids: &[String]) {
        for activity_id in activity_ids {
            self.sections
                .entry(activity_id.clone())
                .or_default()
                .insert(section_id.to_string());
        }
    }

    /// Forget `section_id` everywhere.
    pub fn remove_section(&mut self, section_id: &str) {
        self.sections.retain(|_, ids| {
            ids.remove(section_id);
            !ids.is_empty()
        });
    }

    /// Drop every section entry.
    pub fn clear_sections(&mut self) {
        self.sections.clear();
    }

    /// Replace all group memberships.
    pub fn set_groups<'a, I>(&mut self, memberships: I)
    where
        I: IntoIterator<Item = (&'a str, &'a [String])>,
    {
        self.groups.clear();
        for (group_id, activity_ids) in memberships {
            for activity_id in activity_ids {
                self.groups.insert(activity_id.clone(), group_id.to_string());
            }
        }
    }

    /// Section ids the activity contributes to, sorted.
    pub fn sections_for(&self, activity_id: &str) -> Vec<String> {
        self.sections
            .get(activity_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The group containing the activity, if any.
    pub fn group_for(&self, activity_id: &str) -> Option<&str> {
        self.groups.get(activity_id).map(String::as_str)
    }

    /// Drop the activity from the index, returning the sections it was in.
    pub fn remove_activity(&mut self, activity_id: &str) -> Vec<String> {
        self.groups.remove(activity_id);
        self.sections
            .remove(activity_id)
            .map(|ids| ids.into_iter().collect())
            .unwrap_or_default()
    }

    pub fn clear(&mut self) {
        self.sections.clear();
        self.groups.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, min_lat: f64, max_lat: f64, min_lng: f64, max_lng: f64) -> BoundsEntry {
        BoundsEntry {
            id: id.to_string(),
            bounds: Bounds { min_lat, max_lat, min_lng, max_lng },
        }
    }

    fn built(entries: Vec<BoundsEntry>) -> SpatialIndex {
        let mut index = SpatialIndex::new();
        index.ensure_built(|| entries);
        index
    }

    #[test]
    fn test_viewport_sound_and_complete() {
        let entries = vec![
            entry("inside", 51.50, 51.51, -0.13, -0.12),
            entry("straddling", 51.49, 51.505, -0.14, -0.125),
            entry("touching", 51.52, 51.53, -0.13, -0.12),
            entry("outside", 52.00, 52.01, -0.13, -0.12),
        ];
        let index = built(entries);
        let viewport = Bounds { min_lat: 51.50, max_lat: 51.52, min_lng: -0.13, max_lng: -0.12 };

        assert_eq!(index.query_viewport(&viewport), vec!["inside", "straddling", "touching"]);
    }

    #[test]
    fn test_rebuild_only_when_dirty() {
        let mut index = built(vec![entry("a", 0.0, 1.0, 0.0, 1.0)]);
        assert!(!index.is_dirty());

        // Not dirty: the closure must not run
        index.ensure_built(|| panic!("rebuilt a clean index"));
        assert_eq!(index.len(), 1);

        index.mark_dirty();
        index.ensure_built(Vec::new);
        assert!(index.is_empty());
    }

    #[test]
    fn test_find_overlapping_uses_buffer() {
        let index = built(vec![entry("near", 51.5110, 51.52, -0.13, -0.12)]);
        let query = Bounds { min_lat: 51.50, max_lat: 51.51, min_lng: -0.13, max_lng: -0.12 };
        assert!(index.find_overlapping(&query, 0.0).is_empty());
        assert_eq!(index.find_overlapping(&query, 500.0), vec!["near"]);
    }

    #[test]
    fn test_reverse_index() {
        let mut reverse = ReverseIndex::new();
        let ids = vec!["a1".to_string(), "a2".to_string()];
        reverse.add_section("s1", &ids);
        reverse.add_section("s2", &ids[..1]);
        reverse.set_groups([("a1", ids.as_slice())]);

        assert_eq!(reverse.sections_for("a1"), vec!["s1", "s2"]);
        assert_eq!(reverse.group_for("a2"), Some("a1"));

        reverse.remove_section("s1");
        assert!(reverse.sections_for("a2").is_empty());

        assert_eq!(reverse.remove_activity("a1"), vec!["s2"]);
        assert!(reverse.group_for("a1").is_none());
    }
}
