// SPDX-License-Identifier: MIT OR Apache-2.0

//! Overlay graph for one stream key.
//!
//! Vertices are the currently subscribed nodes, an edge "A forwards to B"
//! always exists together with its mirror image. Asymmetry can appear
//! transiently between node reports; reconciliation restores it. Neighbour
//! selection is deterministic: fewest-neighbours first, ties broken by the
//! order nodes joined the overlay.

use std::collections::{BTreeSet, HashMap, HashSet};

#[derive(Debug)]
pub struct OverlayTopology {
    max_neighbours: usize,
    nodes: HashMap<String, HashSet<String>>,
    insertion_order: Vec<String>,
}

impl OverlayTopology {
    pub fn new(max_neighbours: usize) -> Self {
        Self {
            max_neighbours,
            nodes: HashMap::new(),
            insertion_order: Vec::new(),
        }
    }

    pub fn contains(&self, node: &str) -> bool {
        self.nodes.contains_key(node)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn register(&mut self, node: &str) {
        if !self.nodes.contains_key(node) {
            self.nodes.insert(node.to_string(), HashSet::new());
            self.insertion_order.push(node.to_string());
        }
    }

    /// Reconcile a node's reported neighbour set into the overlay.
    ///
    /// Reported neighbours that are not overlay members are dropped; edges
    /// are added and removed symmetrically. Returns the OTHER nodes whose
    /// neighbour sets changed.
    pub fn update(&mut self, node: &str, reported: &HashSet<String>) -> BTreeSet<String> {
        self.register(node);
        let kept: HashSet<String> = reported
            .iter()
            .filter(|candidate| candidate.as_str() != node && self.nodes.contains_key(*candidate))
            .cloned()
            .collect();
        let previous = self
            .nodes
            .insert(node.to_string(), kept.clone())
            .unwrap_or_default();

        let mut changed = BTreeSet::new();
        for dropped in previous.difference(&kept) {
            if let Some(neighbours) = self.nodes.get_mut(dropped) {
                if neighbours.remove(node) {
                    changed.insert(dropped.clone());
                }
            }
        }
        for added in kept.difference(&previous) {
            if let Some(neighbours) = self.nodes.get_mut(added) {
                if neighbours.insert(node.to_string()) {
                    changed.insert(added.clone());
                }
            }
        }
        changed
    }

    /// Top a node's neighbour set up to the fan-out limit.
    ///
    /// Candidates with capacity left are ranked by current neighbour count,
    /// ties broken by insertion order. Returns every node whose set changed,
    /// the topped-up node included.
    pub fn fill_neighbours(&mut self, node: &str) -> BTreeSet<String> {
        let mut changed = BTreeSet::new();
        let Some(current) = self.nodes.get(node).cloned() else {
            return changed;
        };
        if current.len() >= self.max_neighbours {
            return changed;
        }
        let wanted = self.max_neighbours - current.len();

        let mut candidates: Vec<(usize, usize, String)> = Vec::new();
        for (order, candidate) in self.insertion_order.iter().enumerate() {
            if candidate == node || current.contains(candidate) {
                continue;
            }
            let count = self
                .nodes
                .get(candidate)
                .map(HashSet::len)
                .unwrap_or_default();
            if count >= self.max_neighbours {
                continue;
            }
            candidates.push((count, order, candidate.clone()));
        }
        candidates.sort();

        for (_, _, candidate) in candidates.into_iter().take(wanted) {
            if let Some(neighbours) = self.nodes.get_mut(node) {
                neighbours.insert(candidate.clone());
            }
            if let Some(neighbours) = self.nodes.get_mut(&candidate) {
                neighbours.insert(node.to_string());
            }
            changed.insert(candidate);
            changed.insert(node.to_string());
        }
        changed
    }

    /// Remove a node and its incident edges; returns the former neighbours.
    pub fn remove_node(&mut self, node: &str) -> Vec<String> {
        let Some(neighbours) = self.nodes.remove(node) else {
            return Vec::new();
        };
        self.insertion_order.retain(|existing| existing != node);
        let mut affected = Vec::new();
        for neighbour in &self.insertion_order {
            if neighbours.contains(neighbour) {
                if let Some(set) = self.nodes.get_mut(neighbour) {
                    set.remove(node);
                }
                affected.push(neighbour.clone());
            }
        }
        affected
    }

    /// A node's neighbours in overlay insertion order.
    pub fn neighbours(&self, node: &str) -> Vec<String> {
        let Some(neighbours) = self.nodes.get(node) else {
            return Vec::new();
        };
        self.insertion_order
            .iter()
            .filter(|candidate| neighbours.contains(*candidate))
            .cloned()
            .collect()
    }

    pub fn node_ids(&self) -> Vec<String> {
        self.insertion_order.clone()
    }

    pub fn snapshot(&self) -> HashMap<String, Vec<String>> {
        self.insertion_order
            .iter()
            .map(|node| (node.clone(), self.neighbours(node)))
            .collect()
    }

    #[cfg(test)]
    fn assert_symmetric(&self) {
        for (node, neighbours) in &self.nodes {
            for neighbour in neighbours {
                assert!(
                    self.nodes[neighbour].contains(node),
                    "edge {node} -> {neighbour} has no mirror image"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::OverlayTopology;

    fn report(neighbours: &[&str]) -> HashSet<String> {
        neighbours.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn two_nodes_pair_up() {
        let mut overlay = OverlayTopology::new(4);
        overlay.update("one", &report(&[]));
        let changed = overlay.fill_neighbours("one");
        assert!(changed.is_empty());

        overlay.update("two", &report(&[]));
        let changed = overlay.fill_neighbours("two");
        assert_eq!(
            changed.into_iter().collect::<Vec<_>>(),
            vec!["one".to_string(), "two".to_string()]
        );
        assert_eq!(overlay.neighbours("one"), vec!["two"]);
        assert_eq!(overlay.neighbours("two"), vec!["one"]);
        overlay.assert_symmetric();
    }

    #[test]
    fn selection_is_deterministic_and_prefers_least_connected() {
        // Three nodes at the fan-out limit of one: the fourth pairs with the
        // least connected, and ties go to the earliest joiner.
        let mut overlay = OverlayTopology::new(1);
        for node in ["a", "b", "c"] {
            overlay.update(node, &report(&[]));
            overlay.fill_neighbours(node);
        }
        // a-b paired; c found nobody with capacity.
        assert_eq!(overlay.neighbours("a"), vec!["b"]);
        assert!(overlay.neighbours("c").is_empty());

        overlay.update("d", &report(&[]));
        let changed = overlay.fill_neighbours("d");
        assert!(changed.contains("c"));
        assert_eq!(overlay.neighbours("d"), vec!["c"]);
        overlay.assert_symmetric();
    }

    #[test]
    fn fan_out_is_capped() {
        let mut overlay = OverlayTopology::new(2);
        for node in ["a", "b", "c", "d"] {
            overlay.update(node, &report(&[]));
            overlay.fill_neighbours(node);
        }
        for node in ["a", "b", "c", "d"] {
            assert!(overlay.neighbours(node).len() <= 2, "{node} over the cap");
        }
        overlay.assert_symmetric();
    }

    #[test]
    fn update_prunes_dropped_edges_symmetrically() {
        let mut overlay = OverlayTopology::new(4);
        overlay.update("one", &report(&[]));
        overlay.update("two", &report(&[]));
        overlay.fill_neighbours("two");

        // "one" reports an empty neighbour set: the edge goes both ways.
        let changed = overlay.update("one", &report(&[]));
        assert!(changed.contains("two"));
        assert!(overlay.neighbours("two").is_empty());
        overlay.assert_symmetric();
    }

    #[test]
    fn unknown_reported_neighbours_are_ignored() {
        let mut overlay = OverlayTopology::new(4);
        let changed = overlay.update("one", &report(&["ghost", "one"]));
        assert!(changed.is_empty());
        assert!(overlay.neighbours("one").is_empty());
    }

    #[test]
    fn remove_node_detaches_everything() {
        let mut overlay = OverlayTopology::new(4);
        for node in ["a", "b", "c"] {
            overlay.update(node, &report(&[]));
            overlay.fill_neighbours(node);
        }
        let affected = overlay.remove_node("a");
        assert_eq!(affected, vec!["b", "c"]);
        assert!(!overlay.contains("a"));
        assert!(!overlay.neighbours("b").contains(&"a".to_string()));
        overlay.assert_symmetric();

        overlay.remove_node("b");
        overlay.remove_node("c");
        assert!(overlay.is_empty());
    }

    #[test]
    fn snapshot_lists_neighbours_in_insertion_order() {
        let mut overlay = OverlayTopology::new(4);
        for node in ["a", "b", "c"] {
            overlay.update(node, &report(&[]));
            overlay.fill_neighbours(node);
        }
        let snapshot = overlay.snapshot();
        assert_eq!(snapshot["c"], vec!["a", "b"]);
    }
}
