use std::collections::{HashMap, HashSet};

use flagstream_model::{DataKind, KindAndKey, StoreItem};

/// Tracks both upstream and downstream dependency relationships between
/// stored items.
///
/// A flag depends on its prerequisite flags and on every segment referenced
/// by a `segmentMatch` clause in its rules; a segment depends on segments
/// referenced the same way. Keeping the mapping bidirectional makes both
/// updates and affected-item queries cheap.
#[derive(Debug, Default)]
pub struct DependencyTracker {
    children: HashMap<KindAndKey, HashSet<KindAndKey>>,
    parents: HashMap<KindAndKey, HashSet<KindAndKey>>,
}

impl DependencyTracker {
    pub fn new() -> Self {
        DependencyTracker::default()
    }

    /// Updates the graph for one changed item. `None` clears the item's
    /// outgoing edges (used for deletions).
    pub fn update_dependencies_from(
        &mut self,
        from_kind: DataKind,
        from_key: &str,
        from_item: Option<&StoreItem>,
    ) {
        let from_what = KindAndKey::new(from_kind, from_key);
        let updated = Self::compute_dependencies_from(from_item);

        if let Some(old_children) = self.children.get(&from_what) {
            for child in old_children {
                if let Some(parents) = self.parents.get_mut(child) {
                    parents.remove(&from_what);
                }
            }
        }

        for child in &updated {
            self.parents.entry(child.clone()).or_default().insert(from_what.clone());
        }
        self.children.insert(from_what, updated);
    }

    /// Adds `initial` and everything that transitively depends on it to
    /// `items_out`. Cycles are handled by the already-visited check.
    pub fn add_affected_items(&self, items_out: &mut HashSet<KindAndKey>, initial: &KindAndKey) {
        if !items_out.insert(initial.clone()) {
            return;
        }
        if let Some(parents) = self.parents.get(initial) {
            for parent in parents {
                self.add_affected_items(items_out, parent);
            }
        }
    }

    pub fn reset(&mut self) {
        self.children.clear();
        self.parents.clear();
    }

    fn compute_dependencies_from(item: Option<&StoreItem>) -> HashSet<KindAndKey> {
        let mut out = HashSet::new();
        match item {
            Some(StoreItem::Flag(flag)) => {
                for prereq in &flag.prerequisites {
                    out.insert(KindAndKey::new(DataKind::Flag, &prereq.key));
                }
                for rule in &flag.rules {
                    for clause in &rule.clauses {
                        for key in clause.segment_keys() {
                            out.insert(KindAndKey::new(DataKind::Segment, key));
                        }
                    }
                }
            }
            Some(StoreItem::Segment(segment)) => {
                for rule in &segment.rules {
                    for clause in &rule.clauses {
                        for key in clause.segment_keys() {
                            out.insert(KindAndKey::new(DataKind::Segment, key));
                        }
                    }
                }
            }
            Some(StoreItem::Tombstone(_)) | None => {}
        }
        out
    }

    #[cfg(test)]
    fn children_of(&self, node: &KindAndKey) -> HashSet<KindAndKey> {
        self.children.get(node).cloned().unwrap_or_default()
    }

    #[cfg(test)]
    fn parents_of(&self, node: &KindAndKey) -> HashSet<KindAndKey> {
        self.parents.get(node).cloned().unwrap_or_default()
    }
}
