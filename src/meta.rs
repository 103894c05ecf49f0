//! Watch progress persisted under the list's `_meta` subtree.
//!
//! One JSON resource per (list, watch name) at
//! `<list>/_meta/oada-list-lib/<name>` holding the resume cursor and a
//! per-pointer error log. The cursor write path is a small state machine,
//! `Clean → Dirty(rev) → Writing(rev) → Clean | Dirty(rev')`, driven by a
//! background task debounced by `persist_interval`, so listeners never wait
//! on a store round-trip. A failed write stays dirty and retries on the
//! next tick.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::conn::{Connection, TransportError};
use crate::error::Result;

/// Path segment under `_meta` where progress lives. Stable across library
/// generations so old and new consumers read the same cursor.
pub const META_ROOT: &str = "oada-list-lib";

// ============================================================================
// Metadata document
// ============================================================================

/// The persisted progress document.
///
/// `errors` maps item pointer → item rev (as a JSON key) → error text, and
/// only ever grows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub rev: u64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub errors: HashMap<String, HashMap<String, String>>,
}

// ============================================================================
// Persist state machine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PersistState {
    Clean,
    Dirty(u64),
    Writing(u64),
}

// ============================================================================
// MetaManager
// ============================================================================

/// Owns the resume cursor and error log for one watch.
pub struct MetaManager {
    conn: Arc<dyn Connection>,
    /// Full store path of the metadata resource.
    path: String,
    rev: AtomicU64,
    state: Arc<Mutex<PersistState>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MetaManager {
    /// Load or create the metadata resource and start the persist task.
    ///
    /// Returns the manager and whether prior metadata existed. On creation,
    /// the cursor starts at 0, or, when `handled` is set, at the
    /// `x-oada-rev` of the link PUT so pre-existing items count as already
    /// processed.
    pub async fn init(
        conn: Arc<dyn Connection>,
        list_path: &str,
        name: &str,
        persist_interval: Duration,
        handled: bool,
    ) -> Result<(Arc<Self>, bool)> {
        let path = format!("{list_path}/_meta/{META_ROOT}/{name}");

        let (initial_rev, found) = match conn.get(&path, None).await {
            Ok(response) => {
                let doc: Metadata = response
                    .data
                    .and_then(|data| serde_json::from_value(data).ok())
                    .unwrap_or_default();
                debug!(rev = doc.rev, "found existing watch metadata");
                (doc.rev, true)
            }
            Err(e) if e.is_missing() => {
                let rev = Self::create(&conn, &path, handled).await?;
                (rev, false)
            }
            Err(e) => return Err(e.into()),
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        let manager = Arc::new(Self {
            conn,
            path,
            rev: AtomicU64::new(initial_rev),
            state: Arc::new(Mutex::new(PersistState::Clean)),
            shutdown,
            task: Mutex::new(None),
        });

        // Newly assigned cursors (Handled mode) still need to reach the
        // store; the persist task picks them up on its first tick.
        if !found && initial_rev > 0 {
            *manager.state.lock() = PersistState::Dirty(initial_rev);
        }

        let task = tokio::spawn(Self::persist_loop(
            Arc::clone(&manager),
            persist_interval,
            shutdown_rx,
        ));
        *manager.task.lock() = Some(task);

        Ok((manager, found))
    }

    /// Create the backing resource and link it under `_meta`.
    async fn create(conn: &Arc<dyn Connection>, path: &str, handled: bool) -> Result<u64> {
        let response = conn.post("/resources", json!({}), "application/json").await?;
        let id = response
            .header("content-location")
            .map(|location| location.trim_start_matches('/').to_string())
            .ok_or_else(|| {
                TransportError::new("resource creation returned no content-location")
            })?;

        let link = conn.put(path, json!({ "_id": id }), None).await?;

        let rev = if handled {
            link.header("x-oada-rev")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0)
        } else {
            0
        };
        debug!(%id, rev, "created watch metadata");
        Ok(rev)
    }

    /// The current resume cursor.
    pub fn rev(&self) -> u64 {
        self.rev.load(Ordering::SeqCst)
    }

    /// Advance the cursor. The write happens on the next persist tick.
    pub fn set_rev(&self, rev: u64) {
        self.rev.store(rev, Ordering::SeqCst);
        *self.state.lock() = PersistState::Dirty(rev);
    }

    /// Record a listener failure for `(pointer, rev)` with one merge PUT.
    pub async fn set_errored(&self, pointer: &str, rev: u64, error: &str) {
        let body = json!({
            "errors": { pointer: { rev.to_string(): error } }
        });
        if let Err(e) = self.conn.put(&self.path, body, None).await {
            warn!(pointer, rev, error = %e, "failed to record listener error");
        }
    }

    /// Stop the persist task, flushing a dirty cursor first. Idempotent.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    // -----------------------------------------------------------------------
    // Persist task
    // -----------------------------------------------------------------------

    async fn persist_loop(
        manager: Arc<Self>,
        persist_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(persist_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of an interval completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => manager.flush_once().await,
            }
        }

        // Shutdown flush so a cursor set just before stop() is not lost.
        manager.flush_once().await;
    }

    /// One pass of the state machine: write the dirty rev if there is one.
    async fn flush_once(&self) {
        let pending = {
            let mut state = self.state.lock();
            match *state {
                PersistState::Dirty(rev) => {
                    *state = PersistState::Writing(rev);
                    Some(rev)
                }
                _ => None,
            }
        };

        let Some(rev) = pending else { return };

        match self.conn.put(&self.path, json!({ "rev": rev }), None).await {
            Ok(_) => {
                debug!(rev, "persisted watch progress");
                let mut state = self.state.lock();
                // A rev set during the write leaves the state Dirty(rev');
                // only an undisturbed write completes the cycle.
                if *state == PersistState::Writing(rev) {
                    *state = PersistState::Clean;
                }
            }
            Err(e) => {
                warn!(rev, error = %e, "failed to persist watch progress; will retry");
                let mut state = self.state.lock();
                if *state == PersistState::Writing(rev) {
                    *state = PersistState::Dirty(rev);
                }
            }
        }
    }
}
