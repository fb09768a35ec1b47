//! Disjoint sets over arbitrary keys.
//!
//! Route grouping clusters activity ids and section detection clusters
//! overlap indices, both as the transitive closure of pairwise matches.
//! Keys are interned to dense slots; union by size with path halving.

use std::collections::HashMap;
use std::hash::Hash;

/// Union-Find over keys of type `T`.
///
/// # Example
/// ```
/// use route_engine::union_find::UnionFind;
///
/// let mut uf = UnionFind::new();
/// uf.make_set("a");
/// uf.make_set("b");
/// uf.make_set("c");
///
/// uf.union(&"a", &"b");
/// assert!(uf.connected(&"a", &"b"));
/// assert!(!uf.connected(&"a", &"c"));
/// ```
#[derive(Debug, Clone)]
pub struct UnionFind<T: Eq + Hash + Clone> {
    slots: HashMap<T, usize>,
    keys: Vec<T>,
    parent: Vec<usize>,
    size: Vec<usize>,
}

impl<T: Eq + Hash + Clone> Default for UnionFind<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Eq + Hash + Clone> UnionFind<T> {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: HashMap::with_capacity(capacity),
            keys: Vec::with_capacity(capacity),
            parent: Vec::with_capacity(capacity),
            size: Vec::with_capacity(capacity),
        }
    }

    /// Add `item` as a singleton set; known items are left alone.
    pub fn make_set(&mut self, item: T) {
        self.slot(item);
    }

    fn slot(&mut self, item: T) -> usize {
        if let Some(&slot) = self.slots.get(&item) {
            return slot;
        }
        let slot = self.keys.len();
        self.slots.insert(item.clone(), slot);
        self.keys.push(item);
        self.parent.push(slot);
        self.size.push(1);
        slot
    }

    fn root(&mut self, mut slot: usize) -> usize {
        while self.parent[slot] != slot {
            self.parent[slot] = self.parent[self.parent[slot]];
            slot = self.parent[slot];
        }
        slot
    }

    /// Representative of the set containing `item`, adding it if unknown.
    pub fn find(&mut self, item: &T) -> T {
        let slot = self.slot(item.clone());
        let root = self.root(slot);
        self.keys[root].clone()
    }

    /// Merge the sets of `a` and `b`. Returns false if they were already one.
    pub fn union(&mut self, a: &T, b: &T) -> bool {
        let slot_a = self.slot(a.clone());
        let slot_b = self.slot(b.clone());
        let (mut big, mut small) = (self.root(slot_a), self.root(slot_b));
        if big == small {
            return false;
        }
        if self.size[big] < self.size[small] {
            std::mem::swap(&mut big, &mut small);
        }
        self.parent[small] = big;
        self.size[big] += self.size[small];
        true
    }

    pub fn connected(&mut self, a: &T, b: &T) -> bool {
        match (self.slots.get(a).copied(), self.slots.get(b).copied()) {
            (Some(slot_a), Some(slot_b)) => self.root(slot_a) == self.root(slot_b),
            _ => a == b,
        }
    }

    /// Sets with sorted members, ordered by their smallest member.
    ///
    /// Independent of insertion and hash order, so repeated runs agree.
    pub fn sorted_groups(&mut self) -> Vec<Vec<T>>
    where
        T: Ord,
    {
        let mut by_root: HashMap<usize, Vec<T>> = HashMap::new();
        for slot in 0..self.keys.len() {
            let root = self.root(slot);
            by_root.entry(root).or_default().push(self.keys[slot].clone());
        }

        let mut groups: Vec<Vec<T>> = by_root
            .into_values()
            .map(|mut members| {
                members.sort();
                members
            })
            .collect();
        groups.sort();
        groups
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_union_is_transitive() {
        let mut uf: UnionFind<u32> = UnionFind::new();
        for i in 1..=5 {
            uf.make_set(i);
        }

        assert!(uf.union(&1, &2));
        assert!(uf.union(&3, &2));
        assert!(!uf.union(&1, &3));
        assert!(uf.connected(&1, &3));
        assert!(!uf.connected(&1, &4));
        assert_eq!(uf.find(&3), uf.find(&1));
    }

    #[test]
    fn test_long_chain_collapses() {
        let mut uf: UnionFind<usize> = UnionFind::with_capacity(1000);
        for i in 1..1000 {
            uf.union(&(i - 1), &i);
        }
        let root = uf.find(&0);
        assert!((0..1000).all(|i| uf.find(&i) == root));
        assert_eq!(uf.sorted_groups().len(), 1);
    }

    #[test]
    fn test_unknown_items() {
        let mut uf: UnionFind<&str> = UnionFind::new();
        assert!(!uf.connected(&"x", &"y"));
        assert!(uf.is_empty());
        assert_eq!(uf.find(&"x"), "x");
        assert_eq!(uf.len(), 1);
    }

    #[test]
    fn test_sorted_groups_ignore_insertion_order() {
        let mut uf: UnionFind<String> = UnionFind::new();
        for id in ["d", "c", "b", "a", "e"] {
            uf.make_set(id.to_string());
        }
        uf.union(&"d".to_string(), &"a".to_string());
        uf.union(&"c".to_string(), &"e".to_string());

        assert_eq!(
            uf.sorted_groups(),
            vec![
                vec!["a".to_string(), "d".to_string()],
                vec!["b".to_string()],
                vec!["c".to_string(), "e".to_string()],
            ]
        );
    }
}
