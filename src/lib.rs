//! Reactive item-change events over OADA list resources.
//!
//! A list resource is a JSON document whose non-underscore children link to
//! other resources. [`ListWatch`] subscribes to the store's tree change
//! feed, folds each change batch into an effective view of the list, runs a
//! JSONPath items selector over it, and surfaces typed events (added,
//! changed, removed) to callbacks or async streams. With `resume` enabled,
//! progress is persisted under the list's `_meta` subtree so a restarted
//! watch picks up after the last acknowledged revision instead of replaying
//! or skipping.
//!
//! The store transport is not part of this crate: callers supply any
//! [`Connection`] implementation (HTTP, WebSocket, in-process mock).
//!
//! ```no_run
//! use std::sync::Arc;
//! use oada_list_watch::{Connection, ListWatch, ListWatchOptions};
//!
//! # async fn example(conn: Arc<dyn Connection>) -> oada_list_watch::Result<()> {
//! let watch = ListWatch::new(ListWatchOptions {
//!     resume: true,
//!     ..ListWatchOptions::new("/bookmarks/trellis/documents", conn)
//! })
//! .await?;
//!
//! let _unsub = watch.on_added(|event| async move {
//!     let item = event.item().await?;
//!     println!("new document at {}: {item}", event.pointer);
//!     Ok(())
//! });
//! # Ok(())
//! # }
//! ```

pub mod conn;
mod emitter;
pub mod error;
mod event;
mod meta;
pub mod path;
pub mod pointer;
pub mod tree;
pub mod types;
mod watch;

pub use conn::{ChangeFeed, Connection, Response, TransportError};
pub use emitter::{EventStream, ListenerId, Unsubscribe};
pub use error::{Result, WatchError};
pub use event::{AssertFn, BoxError, ItemChange, ItemEvent};
pub use meta::{Metadata, META_ROOT};
pub use path::{ItemsPath, PathError, DEFAULT_ITEMS_PATH};
pub use types::{Change, ChangeBatch, ChangeType};
pub use watch::{ListWatch, ListWatchOptions, NewListMode, DEFAULT_PERSIST_INTERVAL};
