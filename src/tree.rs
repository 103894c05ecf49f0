//! Change-tree builder.
//!
//! Folds one change batch into a single JSON value shaped like the list at
//! that revision. Bookkeeping rides in two side-channels keyed by JSON
//! pointer rather than inside the value itself:
//!   - `annotations` — which batch changes touched which node;
//!   - `absent` — nodes a delete removed (`null` leaves in a delete body).
//!
//! After building, reading the tree at any pointer yields the effective
//! state of that subtree for the batch, and `changes_within` lists every raw
//! change that contributed to it.

use std::collections::{HashMap, HashSet};

use serde_json::{Map, Value};

use crate::pointer;
use crate::types::{ChangeBatch, ChangeType};

pub struct ChangeTree {
    root: Value,
    /// Pointer → indices (into the batch) of changes targeting that node.
    annotations: HashMap<String, Vec<usize>>,
    /// Pointers removed by this batch.
    absent: HashSet<String>,
}

impl ChangeTree {
    /// Fold `batch` into an effective tree.
    ///
    /// The root change seeds the tree; each child is then merged at its
    /// pointer in received order, later children overriding earlier ones at
    /// matching keys. Arrays are replaced whole. `null` leaves under a
    /// delete mark the pointer absent instead of storing a sentinel.
    pub fn build(batch: &ChangeBatch) -> Self {
        let mut tree = Self {
            root: Value::Object(Map::new()),
            annotations: HashMap::new(),
            absent: HashSet::new(),
        };

        for (index, change) in batch.changes().iter().enumerate() {
            tree.annotations
                .entry(change.path.clone())
                .or_default()
                .push(index);

            let delete = change.kind == ChangeType::Delete;
            match &change.body {
                Some(body) => {
                    let target = ensure_node(&mut tree.root, &change.path);
                    assign(target, body, delete, &change.path, &mut tree.absent);
                }
                // A bodyless delete removes the node at `path` outright.
                None if delete => {
                    let target = ensure_node(&mut tree.root, &change.path);
                    *target = Value::Null;
                    tree.absent.insert(change.path.clone());
                }
                None => {}
            }
        }

        tree
    }

    /// The effective JSON value of the list for this batch.
    pub fn root(&self) -> &Value {
        &self.root
    }

    pub fn value_at(&self, ptr: &str) -> Option<&Value> {
        pointer::get(&self.root, &pointer::parse(ptr))
    }

    /// Whether the node at `ptr` (or an ancestor of it) was removed.
    pub fn is_absent(&self, ptr: &str) -> bool {
        self.absent.iter().any(|a| pointer::is_prefix_of(a, ptr))
    }

    /// Batch indices of changes targeting `ptr` or a descendant of it, in
    /// batch order. The root change counts only for the root pointer.
    pub fn changes_within(&self, ptr: &str) -> Vec<usize> {
        let mut indices: Vec<usize> = self
            .annotations
            .iter()
            .filter(|(target, _)| pointer::is_prefix_of(ptr, target))
            .flat_map(|(_, idxs)| idxs.iter().copied())
            .collect();
        indices.sort_unstable();
        indices
    }
}

/// Walk to (and create) the node at `ptr`, materializing empty objects for
/// missing intermediate steps.
fn ensure_node<'a>(root: &'a mut Value, ptr: &str) -> &'a mut Value {
    let mut current = root;
    for step in pointer::parse(ptr) {
        current = child_entry(current, step);
    }
    current
}

/// Step into `parent`, padding arrays for numeric steps and materializing
/// object entries otherwise, replacing scalars in the way.
fn child_entry(parent: &mut Value, step: String) -> &mut Value {
    let array_index = match parent {
        Value::Array(arr) => step.parse::<usize>().ok().map(|idx| {
            if idx >= arr.len() {
                arr.resize(idx + 1, Value::Null);
            }
            idx
        }),
        _ => None,
    };

    match (parent, array_index) {
        (Value::Array(arr), Some(idx)) => &mut arr[idx],
        (node, _) => {
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            match node {
                Value::Object(map) => map.entry(step).or_insert(Value::Null),
                unchanged => unchanged,
            }
        }
    }
}

/// Deep object assign of `source` into `target`.
///
/// `null` values under a delete mark the pointer absent (the key stays in
/// the tree so selectors still see it); under a merge they are plain values.
fn assign(target: &mut Value, source: &Value, delete: bool, ptr: &str, absent: &mut HashSet<String>) {
    match source {
        Value::Object(map) => {
            if !target.is_object() {
                *target = Value::Object(Map::new());
            }
            if let Value::Object(entries) = target {
                for (key, value) in map {
                    let child = entries.entry(key.clone()).or_insert(Value::Null);
                    assign(child, value, delete, &pointer::join(ptr, key), absent);
                }
            }
        }
        Value::Null if delete => {
            *target = Value::Null;
            absent.insert(ptr.to_string());
        }
        // Arrays and scalars replace whole.
        other => *target = other.clone(),
    }
}
