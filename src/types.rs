//! Change wire types consumed from the store's tree watch.
//!
//! A change batch is a root change (path `""`) plus zero or more descendant
//! changes, delivered atomically at one list revision. The shape is consumed
//! as given; this module only validates the batch contract and extracts the
//! pieces the watch machinery needs.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::WatchError;

// ============================================================================
// ChangeType
// ============================================================================

/// The two change kinds the store emits.
///
/// Anything else is a wire-contract violation and fails at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    /// A deep merge of `body` into the node at `path`.
    Merge,
    /// A deletion: `null` leaves in `body` mark removed keys; a `null` body
    /// at the root means the resource itself was deleted.
    Delete,
}

impl FromStr for ChangeType {
    type Err = WatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "merge" => Ok(Self::Merge),
            "delete" => Ok(Self::Delete),
            other => Err(WatchError::InvalidBatch(format!(
                "unknown change type {other:?}"
            ))),
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Merge => f.write_str("merge"),
            Self::Delete => f.write_str("delete"),
        }
    }
}

// ============================================================================
// Change
// ============================================================================

/// One sub-change of a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change {
    #[serde(rename = "type")]
    pub kind: ChangeType,
    /// JSON pointer relative to the watched list; `""` for the root change.
    pub path: String,
    /// The change body. `None` only for a root delete of the whole list.
    #[serde(default)]
    pub body: Option<Value>,
    /// The `_id` of the resource this change was recorded against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
}

impl Change {
    /// The revision the change body carries: `body._meta._rev`, falling back
    /// to `body._rev`.
    pub fn rev(&self) -> Option<u64> {
        let body = self.body.as_ref()?;
        body.pointer("/_meta/_rev")
            .or_else(|| body.get("_rev"))
            .and_then(Value::as_u64)
    }

    /// Clone this change with its path rebased onto `prefix`.
    ///
    /// Used when surfacing an item change: the stored path is relative to
    /// the list, the surfaced path relative to the item.
    pub fn rebased(&self, prefix: &str) -> Option<Change> {
        let relative = crate::pointer::strip_prefix(prefix, &self.path)?;
        Some(Change {
            path: relative.to_string(),
            ..self.clone()
        })
    }
}

// ============================================================================
// ChangeBatch
// ============================================================================

/// A root change plus its descendant changes, delivered atomically.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeBatch(Vec<Change>);

impl ChangeBatch {
    /// Validate the batch contract: non-empty, root first with empty path.
    pub fn new(changes: Vec<Change>) -> Result<Self, WatchError> {
        let Some(root) = changes.first() else {
            return Err(WatchError::InvalidBatch("empty batch".to_string()));
        };
        if !root.path.is_empty() {
            return Err(WatchError::InvalidBatch(format!(
                "root change path must be empty, got {:?}",
                root.path
            )));
        }
        Ok(Self(changes))
    }

    pub fn root(&self) -> &Change {
        &self.0[0]
    }

    /// Children in received order (everything after the root).
    pub fn children(&self) -> &[Change] {
        &self.0[1..]
    }

    pub fn changes(&self) -> &[Change] {
        &self.0
    }

    /// The list revision this batch was recorded at, from the root body.
    pub fn list_rev(&self) -> Option<u64> {
        self.root().rev()
    }

    /// Whether this batch deletes the watched list itself.
    pub fn deletes_list(&self) -> bool {
        let root = self.root();
        root.kind == ChangeType::Delete && root.body.is_none()
    }
}
