use thiserror::Error;

use crate::conn::TransportError;
use crate::path::PathError;

// ---------------------------------------------------------------------------
// WatchError — top-level rollup
// ---------------------------------------------------------------------------

/// Errors surfaced by the watch machinery.
///
/// Per-item failures (listener errors, item assertion failures) are recorded
/// under the list's `_meta` error log and do not halt the feed; only the
/// variants below escape to callers or the `error` event.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Path(#[from] PathError),

    /// A change batch violated the wire contract (empty batch, non-root
    /// first change, or an unrecognized change type).
    #[error("Invalid change batch: {0}")]
    InvalidBatch(String),

    /// The configured item assertion rejected a fetched item body.
    #[error("Item assertion failed for {pointer}: {source}")]
    AssertItem {
        pointer: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A GET returned no body where one was required.
    #[error("Missing response body from {path}")]
    MissingBody { path: String },

    /// The change feed ended without a list deletion or a `stop()` call.
    #[error("Change feed terminated unexpectedly")]
    FeedClosed,

    /// The watch has already been stopped.
    #[error("Watch is stopped")]
    Stopped,
}

/// Convenience alias — the default error type is `WatchError`.
pub type Result<T, E = WatchError> = std::result::Result<T, E>;
