//! ListWatch — the public surface.
//!
//! Owns the whole lifecycle of one watched list: making sure the list
//! exists, loading resume metadata, opening the change feed, turning each
//! batch into item events, and tearing everything down on `stop()`.
//!
//! # Task model
//!
//! All processing for one watch runs on a single spawned task; there is no
//! parallelism across batches. The task is spawned lazily when the first
//! listener registers: events emitted with nobody attached would only be
//! dropped, and the lazy start means a listener registered right after
//! construction can never miss the starting snapshot.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::watch as watch_channel;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument, Span};

use crate::conn::{ChangeFeed, Connection};
use crate::emitter::{EventStream, ListenerSet, Unsubscribe};
use crate::error::{Result, WatchError};
use crate::event::{AssertFn, BoxError, ItemChange, ItemEvent, LazyItem};
use crate::meta::MetaManager;
use crate::path::ItemsPath;
use crate::tree::ChangeTree;
use crate::types::ChangeBatch;

/// Default debounce interval for cursor writes.
pub const DEFAULT_PERSIST_INTERVAL: Duration = Duration::from_millis(1000);

// ============================================================================
// Options
// ============================================================================

/// What to do with items already on the list the first time a watch runs
/// with no prior metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NewListMode {
    /// Emit an `ItemAdded` for every existing item.
    #[default]
    New,
    /// Treat existing items as already processed; the cursor starts at the
    /// list's current rev.
    Handled,
}

/// Configuration for [`ListWatch::new`].
pub struct ListWatchOptions {
    /// Location of the list in the store. Required.
    pub path: String,
    /// The transport. Required; may be shared across watches.
    pub conn: Arc<dyn Connection>,
    /// Selector for list items. Defaults to direct non-underscore children.
    pub items_path: Option<ItemsPath>,
    /// Shape descriptor used to materialize the list (and its parents) when
    /// it does not exist yet, and for the tree-mode snapshot GET.
    pub tree: Option<Value>,
    /// Stable identity for progress storage. Two watches on one list must
    /// use distinct names. Defaults to this crate's package name.
    pub name: Option<String>,
    /// Persist and resume the cursor under `_meta`. When false, nothing is
    /// written and the watch starts from the current tip.
    pub resume: bool,
    /// Debounce interval for cursor writes.
    pub persist_interval: Duration,
    /// Runtime predicate applied to item bodies on first access.
    pub assert_item: Option<AssertFn>,
    pub on_new_list: NewListMode,
}

impl ListWatchOptions {
    pub fn new(path: impl Into<String>, conn: Arc<dyn Connection>) -> Self {
        Self {
            path: path.into(),
            conn,
            items_path: None,
            tree: None,
            name: None,
            resume: false,
            persist_interval: DEFAULT_PERSIST_INTERVAL,
            assert_item: None,
            on_new_list: NewListMode::default(),
        }
    }
}

// ============================================================================
// Internal wiring
// ============================================================================

/// Listener tables, one per event kind.
struct Emitter {
    added: Arc<ListenerSet<ItemEvent>>,
    changed: Arc<ListenerSet<ItemChange>>,
    removed: Arc<ListenerSet<ItemEvent>>,
    any: Arc<ListenerSet<ItemEvent>>,
    errors: Arc<ListenerSet<WatchError>>,
}

impl Emitter {
    fn new() -> Self {
        Self {
            added: Arc::new(ListenerSet::new()),
            changed: Arc::new(ListenerSet::new()),
            removed: Arc::new(ListenerSet::new()),
            any: Arc::new(ListenerSet::new()),
            errors: Arc::new(ListenerSet::new()),
        }
    }
}

/// State shared between the handle and the processing task.
struct Ctx {
    conn: Arc<dyn Connection>,
    list_path: String,
    items_path: ItemsPath,
    tree: Option<Value>,
    assert_item: Option<AssertFn>,
    emitter: Emitter,
    meta: Option<Arc<MetaManager>>,
}

impl Ctx {
    fn lazy_item(&self, pointer: &str) -> LazyItem {
        LazyItem::new(
            Arc::clone(&self.conn),
            format!("{}{pointer}", self.list_path),
            self.assert_item.clone(),
        )
    }
}

/// Everything the processing task needs, parked until the first listener.
struct Pending {
    feed: ChangeFeed,
    /// Emit the starting snapshot before consuming batches.
    emit_snapshot: bool,
    shutdown: watch_channel::Receiver<bool>,
}

// ============================================================================
// ListWatch
// ============================================================================

/// One active subscription over a list resource.
pub struct ListWatch {
    ctx: Arc<Ctx>,
    pending: Mutex<Option<Pending>>,
    shutdown: watch_channel::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    span: Span,
}

impl ListWatch {
    /// Set up a watch: ensure the list exists, load metadata when resuming,
    /// and open the change feed at the recorded rev.
    ///
    /// The processing task starts when the first listener registers.
    pub async fn new(options: ListWatchOptions) -> Result<Self> {
        let ListWatchOptions {
            path,
            conn,
            items_path,
            tree,
            name,
            resume,
            persist_interval,
            assert_item,
            on_new_list,
        } = options;

        let name = name.unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string());
        let items_path = items_path.unwrap_or_default();
        let span = tracing::info_span!("list_watch", watch = %name, path = %path);

        // Make sure the list exists before anything touches it.
        match conn.head(&path).await {
            Ok(_) => {}
            Err(e) if e.is_missing() => {
                debug!(parent: &span, "list does not exist; creating");
                conn.put(&path, json!({}), tree.as_ref()).await?;
            }
            Err(e) => return Err(e.into()),
        }

        let (meta, prior_metadata) = if resume {
            let (manager, found) = MetaManager::init(
                Arc::clone(&conn),
                &path,
                &name,
                persist_interval,
                on_new_list == NewListMode::Handled,
            )
            .await?;
            (Some(manager), found)
        } else {
            (None, false)
        };

        let watch_rev = meta.as_ref().map(|m| m.rev());
        let feed = conn.watch(&path, watch_rev).await?;
        debug!(parent: &span, rev = ?watch_rev, "opened change feed");

        let emit_snapshot = !prior_metadata && on_new_list == NewListMode::New;
        let (shutdown_tx, shutdown_rx) = watch_channel::channel(false);

        Ok(Self {
            ctx: Arc::new(Ctx {
                conn,
                list_path: path,
                items_path,
                tree,
                assert_item,
                emitter: Emitter::new(),
                meta,
            }),
            pending: Mutex::new(Some(Pending {
                feed,
                emit_snapshot,
                shutdown: shutdown_rx,
            })),
            shutdown: shutdown_tx,
            task: Mutex::new(None),
            span,
        })
    }

    // -----------------------------------------------------------------------
    // Listener registration
    // -----------------------------------------------------------------------

    /// A new item appeared on the list (or was present at startup).
    pub fn on_added<F, Fut>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(Arc<ItemEvent>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.ensure_started();
        let set = Arc::clone(&self.ctx.emitter.added);
        let id = set.on(callback);
        Box::new(move || set.off(id))
    }

    /// Like [`on_added`](Self::on_added), delivered exactly one event.
    pub fn once_added<F, Fut>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(Arc<ItemEvent>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.ensure_started();
        let set = Arc::clone(&self.ctx.emitter.added);
        let id = set.once(callback);
        Box::new(move || set.off(id))
    }

    /// Async sequence of added items.
    pub fn added(&self) -> EventStream<ItemEvent> {
        self.ensure_started();
        self.ctx.emitter.added.stream(false)
    }

    /// The next added item, then the subscription ends.
    pub async fn next_added(&self) -> Option<Arc<ItemEvent>> {
        self.ensure_started();
        self.ctx.emitter.added.stream(true).next().await
    }

    /// An existing item was mutated.
    pub fn on_changed<F, Fut>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(Arc<ItemChange>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.ensure_started();
        let set = Arc::clone(&self.ctx.emitter.changed);
        let id = set.on(callback);
        Box::new(move || set.off(id))
    }

    /// Like [`on_changed`](Self::on_changed), delivered exactly one event.
    pub fn once_changed<F, Fut>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(Arc<ItemChange>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.ensure_started();
        let set = Arc::clone(&self.ctx.emitter.changed);
        let id = set.once(callback);
        Box::new(move || set.off(id))
    }

    /// Async sequence of item changes.
    pub fn changed(&self) -> EventStream<ItemChange> {
        self.ensure_started();
        self.ctx.emitter.changed.stream(false)
    }

    /// The next item change, then the subscription ends.
    pub async fn next_changed(&self) -> Option<Arc<ItemChange>> {
        self.ensure_started();
        self.ctx.emitter.changed.stream(true).next().await
    }

    /// An item disappeared from the list.
    pub fn on_removed<F, Fut>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(Arc<ItemEvent>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.ensure_started();
        let set = Arc::clone(&self.ctx.emitter.removed);
        let id = set.on(callback);
        Box::new(move || set.off(id))
    }

    /// Like [`on_removed`](Self::on_removed), delivered exactly one event.
    pub fn once_removed<F, Fut>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(Arc<ItemEvent>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.ensure_started();
        let set = Arc::clone(&self.ctx.emitter.removed);
        let id = set.once(callback);
        Box::new(move || set.off(id))
    }

    /// Async sequence of removed items.
    pub fn removed(&self) -> EventStream<ItemEvent> {
        self.ensure_started();
        self.ctx.emitter.removed.stream(false)
    }

    /// Fires for every added and every changed item (not removals).
    pub fn on_any<F, Fut>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(Arc<ItemEvent>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.ensure_started();
        let set = Arc::clone(&self.ctx.emitter.any);
        let id = set.on(callback);
        Box::new(move || set.off(id))
    }

    /// Like [`on_any`](Self::on_any), delivered exactly one event.
    pub fn once_any<F, Fut>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(Arc<ItemEvent>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.ensure_started();
        let set = Arc::clone(&self.ctx.emitter.any);
        let id = set.once(callback);
        Box::new(move || set.off(id))
    }

    /// Async sequence of the added/changed aggregate.
    pub fn any(&self) -> EventStream<ItemEvent> {
        self.ensure_started();
        self.ctx.emitter.any.stream(false)
    }

    /// The change feed failed. Fires at most once; the watch is halted.
    pub fn on_error<F, Fut>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(Arc<WatchError>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.ensure_started();
        let set = Arc::clone(&self.ctx.emitter.errors);
        let id = set.on(callback);
        Box::new(move || set.off(id))
    }

    /// Like [`on_error`](Self::on_error), delivered exactly one event.
    pub fn once_error<F, Fut>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(Arc<WatchError>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.ensure_started();
        let set = Arc::clone(&self.ctx.emitter.errors);
        let id = set.once(callback);
        Box::new(move || set.off(id))
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Stop the watch: close the feed at its next yield, wait for in-flight
    /// listener calls, flush the cursor, tear the metadata manager down.
    /// Idempotent; concurrent calls collapse to one teardown.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);

        // A never-started watch still owns the feed; drop it here.
        drop(self.pending.lock().take());

        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        if let Some(meta) = &self.ctx.meta {
            meta.stop().await;
        }
    }

    // -----------------------------------------------------------------------
    // Task startup
    // -----------------------------------------------------------------------

    fn ensure_started(&self) {
        let Some(pending) = self.pending.lock().take() else {
            return;
        };
        let ctx = Arc::clone(&self.ctx);
        let task = tokio::spawn(run(ctx, pending).instrument(self.span.clone()));
        *self.task.lock() = Some(task);
    }
}

// ============================================================================
// Processing task
// ============================================================================

async fn run(ctx: Arc<Ctx>, pending: Pending) {
    let Pending {
        mut feed,
        emit_snapshot,
        mut shutdown,
    } = pending;

    let mut cursor = ctx.meta.as_ref().map_or(0, |m| m.rev());

    if emit_snapshot {
        match starting_items(&ctx).await {
            Ok(rev) => {
                if rev > cursor {
                    cursor = rev;
                    if let Some(meta) = &ctx.meta {
                        meta.set_rev(rev);
                    }
                }
            }
            Err(e) => {
                fatal(&ctx, e).await;
                return;
            }
        }
    }

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                debug!("watch stopped");
                break;
            }
            next = feed.next() => match next {
                Some(Ok(batch)) => {
                    if batch.deletes_list() {
                        info!("list was deleted; stopping watch");
                        break;
                    }
                    process_batch(&ctx, &batch, &mut cursor).await;
                }
                Some(Err(e)) => {
                    fatal(&ctx, e.into()).await;
                    return;
                }
                None => {
                    if !*shutdown.borrow() {
                        fatal(&ctx, WatchError::FeedClosed).await;
                        return;
                    }
                    break;
                }
            }
        }
    }

    if let Some(meta) = &ctx.meta {
        meta.stop().await;
    }
}

/// Emit the feed-fatal `error` event (at most once per watch) and tear the
/// metadata manager down.
async fn fatal(ctx: &Ctx, error: WatchError) {
    warn!(%error, "change feed failed");
    ctx.emitter.errors.emit(Arc::new(error)).await;
    if let Some(meta) = &ctx.meta {
        meta.stop().await;
    }
}

/// Fetch the current list snapshot and emit an `ItemAdded` per matched item.
/// Returns the snapshot's rev.
async fn starting_items(ctx: &Ctx) -> Result<u64> {
    let response = ctx.conn.get(&ctx.list_path, ctx.tree.as_ref()).await?;
    let body = response.data.ok_or_else(|| WatchError::MissingBody {
        path: ctx.list_path.clone(),
    })?;
    let rev = body.get("_rev").and_then(Value::as_u64).unwrap_or(0);

    let matches = ctx.items_path.matches(&body);
    debug!(rev, items = matches.len(), "emitting starting items");

    for m in matches {
        emit_added(ctx, rev, &m.pointer).await;
    }
    Ok(rev)
}

async fn process_batch(ctx: &Ctx, batch: &ChangeBatch, cursor: &mut u64) {
    let Some(list_rev) = batch.list_rev() else {
        warn!("change batch root carries no rev; skipping");
        return;
    };

    // Batches at or below the cursor were already delivered in a previous
    // run; replaying them would break resume idempotence.
    if *cursor > 0 && list_rev <= *cursor {
        debug!(list_rev, cursor = *cursor, "skipping already-processed batch");
        return;
    }

    let tree = ChangeTree::build(batch);

    for m in ctx.items_path.matches(tree.root()) {
        if tree.is_absent(&m.pointer) {
            let event = ItemEvent::new(list_rev, m.pointer.clone(), ctx.lazy_item(&m.pointer));
            dispatch(ctx, &ctx.emitter.removed, list_rev, &m.pointer, Arc::new(event)).await;
            continue;
        }

        let touching = tree.changes_within(&m.pointer);
        if touching.is_empty() {
            // Untouched node: only a newly linked item is an event.
            if m.value.get("_id").is_some() {
                emit_added(ctx, list_rev, &m.pointer).await;
            }
            continue;
        }

        for index in touching {
            let change = &batch.changes()[index];
            let Some(rebased) = change.rebased(&m.pointer) else {
                continue;
            };
            let event = ItemChange::new(
                list_rev,
                m.pointer.clone(),
                change.rev(),
                rebased,
                ctx.lazy_item(&m.pointer),
            );
            dispatch(ctx, &ctx.emitter.changed, list_rev, &m.pointer, Arc::new(event)).await;

            let any = ItemEvent::new(list_rev, m.pointer.clone(), ctx.lazy_item(&m.pointer));
            dispatch(ctx, &ctx.emitter.any, list_rev, &m.pointer, Arc::new(any)).await;
        }
    }

    // Only after every event of the batch has been dispatched.
    *cursor = list_rev;
    if let Some(meta) = &ctx.meta {
        meta.set_rev(list_rev);
    }
}

async fn emit_added(ctx: &Ctx, list_rev: u64, pointer: &str) {
    let event = ItemEvent::new(list_rev, pointer.to_string(), ctx.lazy_item(pointer));
    dispatch(ctx, &ctx.emitter.added, list_rev, pointer, Arc::new(event)).await;

    let any = ItemEvent::new(list_rev, pointer.to_string(), ctx.lazy_item(pointer));
    dispatch(ctx, &ctx.emitter.any, list_rev, pointer, Arc::new(any)).await;
}

/// Deliver one event, recording listener failures under `_meta` so the feed
/// never stalls on a bad consumer.
async fn dispatch<T: Send + Sync + 'static>(
    ctx: &Ctx,
    set: &ListenerSet<T>,
    list_rev: u64,
    pointer: &str,
    event: Arc<T>,
) {
    for failure in set.emit(event).await {
        warn!(pointer, list_rev, error = %failure.error, "listener failed");
        if let Some(meta) = &ctx.meta {
            meta.set_errored(pointer, list_rev, &failure.error.to_string())
                .await;
        }
    }
}
