//! Event payloads surfaced to listeners.
//!
//! Events are short-lived and delivered behind `Arc`s: every listener of one
//! emission shares the same instance, so the lazy item body is fetched at
//! most once per event no matter how many listeners look at it. Separate
//! events never share a fetch.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::OnceCell;

use crate::conn::Connection;
use crate::error::{Result, WatchError};
use crate::types::Change;

/// Boxed error a listener callback may return.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Runtime item predicate. A rejection surfaces as
/// [`WatchError::AssertItem`] from the lazy accessor.
pub type AssertFn = Arc<dyn Fn(&Value) -> std::result::Result<(), BoxError> + Send + Sync>;

// ============================================================================
// ItemEvent
// ============================================================================

/// An item was added to or removed from the list, or is part of the
/// starting snapshot. Also the payload of the Added/Changed aggregate.
pub struct ItemEvent {
    /// List revision of the batch that produced this event.
    pub list_rev: u64,
    /// JSON pointer of the item inside the list.
    pub pointer: String,
    item: LazyItem,
}

impl ItemEvent {
    pub(crate) fn new(list_rev: u64, pointer: String, item: LazyItem) -> Self {
        Self {
            list_rev,
            pointer,
            item,
        }
    }

    /// The item body, fetched on first access and memoized for this event.
    pub async fn item(&self) -> Result<Value> {
        self.item.get(&self.pointer).await
    }
}

impl fmt::Debug for ItemEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ItemEvent")
            .field("list_rev", &self.list_rev)
            .field("pointer", &self.pointer)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// ItemChange
// ============================================================================

/// An existing item was mutated.
pub struct ItemChange {
    pub list_rev: u64,
    pub pointer: String,
    /// The item's own revision, from the change body.
    pub rev: Option<u64>,
    /// The raw sub-change, with its path re-rooted at the item.
    pub change: Change,
    item: LazyItem,
}

impl ItemChange {
    pub(crate) fn new(
        list_rev: u64,
        pointer: String,
        rev: Option<u64>,
        change: Change,
        item: LazyItem,
    ) -> Self {
        Self {
            list_rev,
            pointer,
            rev,
            change,
            item,
        }
    }

    /// The item body, fetched on first access and memoized for this event.
    pub async fn item(&self) -> Result<Value> {
        self.item.get(&self.pointer).await
    }
}

impl fmt::Debug for ItemChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ItemChange")
            .field("list_rev", &self.list_rev)
            .field("pointer", &self.pointer)
            .field("rev", &self.rev)
            .field("change", &self.change)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// LazyItem
// ============================================================================

/// Deferred fetch of an item body at `<list>/<pointer>`.
pub(crate) struct LazyItem {
    conn: Arc<dyn Connection>,
    /// Full store path of the item.
    path: String,
    assert_item: Option<AssertFn>,
    cell: OnceCell<Value>,
}

impl LazyItem {
    pub(crate) fn new(conn: Arc<dyn Connection>, path: String, assert_item: Option<AssertFn>) -> Self {
        Self {
            conn,
            path,
            assert_item,
            cell: OnceCell::new(),
        }
    }

    async fn get(&self, pointer: &str) -> Result<Value> {
        let value = self
            .cell
            .get_or_try_init(|| async {
                let response = self.conn.get(&self.path, None).await?;
                let body = response.data.ok_or_else(|| WatchError::MissingBody {
                    path: self.path.clone(),
                })?;
                if let Some(assert_item) = &self.assert_item {
                    assert_item(&body).map_err(|source| WatchError::AssertItem {
                        pointer: pointer.to_string(),
                        source,
                    })?;
                }
                Ok::<_, WatchError>(body)
            })
            .await?;
        Ok(value.clone())
    }
}
