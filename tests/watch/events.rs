//! Event classification scenarios: added, removed, changed, the aggregate,
//! and listener error isolation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::json;

use oada_list_watch::{
    ItemsPath, ListWatch, ListWatchOptions, WatchError,
};

use super::mock::{batch, delete, merge, FeedSender, MockConn};

const LIST: &str = "/bookmarks/test/list";

fn meta_path(name: &str) -> String {
    format!("{LIST}/_meta/oada-list-lib/{name}")
}

/// A watch over `LIST` with `$.*` items, no resume, and an empty snapshot.
async fn simple_watch(conn: &Arc<MockConn>) -> ListWatch {
    conn.set_get(LIST, json!({"_rev": 3}));
    ListWatch::new(ListWatchOptions {
        items_path: Some("$.*".parse::<ItemsPath>().unwrap()),
        ..ListWatchOptions::new(LIST, conn.as_conn())
    })
    .await
    .unwrap()
}

fn count_added(watch: &ListWatch) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let _ = watch.on_added({
        let count = Arc::clone(&count);
        move |_| {
            let count = Arc::clone(&count);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
    });
    count
}

fn count_changed(watch: &ListWatch) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let _ = watch.on_changed({
        let count = Arc::clone(&count);
        move |_| {
            let count = Arc::clone(&count);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
    });
    count
}

fn count_removed(watch: &ListWatch) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let _ = watch.on_removed({
        let count = Arc::clone(&count);
        move |_| {
            let count = Arc::clone(&count);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
    });
    count
}

fn count_any(watch: &ListWatch) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let _ = watch.on_any({
        let count = Arc::clone(&count);
        move |_| {
            let count = Arc::clone(&count);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
    });
    count
}

async fn send(feed: &FeedSender, b: oada_list_watch::ChangeBatch) {
    feed.send(Ok(b)).await.unwrap();
}

// ---------------------------------------------------------------------------
// S1 — new item
// ---------------------------------------------------------------------------

#[tokio::test]
async fn new_item_emits_added_and_any() {
    let (conn, feed) = MockConn::new();
    let watch = simple_watch(&conn).await;

    let mut added = watch.added();
    let mut any = watch.any();
    let changed = count_changed(&watch);
    let removed = count_removed(&watch);

    send(
        &feed,
        batch(vec![merge(
            "",
            json!({"K": {"_id": "resources/foo"}, "_rev": 4}),
        )]),
    )
    .await;

    let event = added.next().await.unwrap();
    assert_eq!(event.pointer, "/K");
    assert_eq!(event.list_rev, 4);

    let aggregate = any.next().await.unwrap();
    assert_eq!(aggregate.pointer, "/K");
    assert_eq!(aggregate.list_rev, 4);

    watch.stop().await;
    assert_eq!(changed.load(Ordering::SeqCst), 0);
    assert_eq!(removed.load(Ordering::SeqCst), 0);
}

// ---------------------------------------------------------------------------
// S2 — removed item
// ---------------------------------------------------------------------------

#[tokio::test]
async fn removed_item_emits_removed_without_any() {
    let (conn, feed) = MockConn::new();
    let watch = simple_watch(&conn).await;

    let mut removed = watch.removed();
    let added = count_added(&watch);
    let changed = count_changed(&watch);
    let any = count_any(&watch);

    send(
        &feed,
        batch(vec![delete("", Some(json!({"K": null, "_rev": 4})))]),
    )
    .await;

    let event = removed.next().await.unwrap();
    assert_eq!(event.pointer, "/K");
    assert_eq!(event.list_rev, 4);

    watch.stop().await;
    assert_eq!(added.load(Ordering::SeqCst), 0);
    assert_eq!(changed.load(Ordering::SeqCst), 0);
    assert_eq!(any.load(Ordering::SeqCst), 0);
}

// ---------------------------------------------------------------------------
// S3 — modified item via child change
// ---------------------------------------------------------------------------

#[tokio::test]
async fn child_change_emits_changed_rerooted_at_item() {
    let (conn, feed) = MockConn::new();
    let watch = simple_watch(&conn).await;

    let mut changed = watch.changed();
    let mut any = watch.any();
    let added = count_added(&watch);
    let removed = count_removed(&watch);

    send(
        &feed,
        batch(vec![
            merge("", json!({"K": {"_rev": 4}, "_rev": 4})),
            merge("/K", json!({"foo": "bar", "_rev": 4})),
        ]),
    )
    .await;

    let event = changed.next().await.unwrap();
    assert_eq!(event.pointer, "/K");
    assert_eq!(event.list_rev, 4);
    assert_eq!(event.rev, Some(4));
    assert_eq!(event.change.path, "");
    assert_eq!(event.change.body, Some(json!({"foo": "bar", "_rev": 4})));

    let aggregate = any.next().await.unwrap();
    assert_eq!(aggregate.pointer, "/K");

    watch.stop().await;
    assert_eq!(added.load(Ordering::SeqCst), 0);
    assert_eq!(removed.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn deep_child_change_path_is_relative_to_item() {
    let (conn, feed) = MockConn::new();
    let watch = simple_watch(&conn).await;

    let mut changed = watch.changed();

    send(
        &feed,
        batch(vec![
            merge("", json!({"_rev": 5})),
            merge("/K/status", json!({"state": "done", "_rev": 5})),
        ]),
    )
    .await;

    let event = changed.next().await.unwrap();
    assert_eq!(event.pointer, "/K");
    assert_eq!(event.change.path, "/status");

    watch.stop().await;
}

// ---------------------------------------------------------------------------
// Ordering & selector closure
// ---------------------------------------------------------------------------

#[tokio::test]
async fn added_items_arrive_in_document_order() {
    let (conn, feed) = MockConn::new();
    let watch = simple_watch(&conn).await;

    let pointers = Arc::new(Mutex::new(Vec::new()));
    let _ = watch.on_added({
        let pointers = Arc::clone(&pointers);
        move |event| {
            let pointers = Arc::clone(&pointers);
            async move {
                pointers.lock().push(event.pointer.clone());
                Ok(())
            }
        }
    });

    let mut any = watch.any();

    send(
        &feed,
        batch(vec![merge(
            "",
            json!({
                "z": {"_id": "resources/z"},
                "a": {"_id": "resources/a"},
                "_rev": 4,
            }),
        )]),
    )
    .await;

    any.next().await.unwrap();
    any.next().await.unwrap();

    watch.stop().await;
    assert_eq!(&*pointers.lock(), &["/z", "/a"]);
}

#[tokio::test]
async fn underscore_children_never_become_items() {
    let (conn, feed) = MockConn::new();
    let watch = simple_watch(&conn).await;

    let pointers = Arc::new(Mutex::new(Vec::new()));
    let _ = watch.on_added({
        let pointers = Arc::clone(&pointers);
        move |event| {
            let pointers = Arc::clone(&pointers);
            async move {
                pointers.lock().push(event.pointer.clone());
                Ok(())
            }
        }
    });
    let mut any = watch.any();

    send(
        &feed,
        batch(vec![merge(
            "",
            json!({
                "_meta": {"_id": "resources/meta"},
                "K": {"_id": "resources/foo"},
                "_rev": 4,
            }),
        )]),
    )
    .await;

    any.next().await.unwrap();
    watch.stop().await;
    assert_eq!(&*pointers.lock(), &["/K"]);
}

// ---------------------------------------------------------------------------
// Listener error isolation (invariant 7)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn listener_error_is_recorded_and_does_not_block_others() {
    let (conn, feed) = MockConn::new();
    conn.set_get(LIST, json!({"_rev": 3}));
    let watch = ListWatch::new(ListWatchOptions {
        items_path: Some("$.*".parse::<ItemsPath>().unwrap()),
        name: Some("test-watch".to_string()),
        resume: true,
        persist_interval: Duration::from_millis(10),
        ..ListWatchOptions::new(LIST, conn.as_conn())
    })
    .await
    .unwrap();

    let _ = watch.on_added(|_| async { Err("listener exploded".into()) });
    let survived = count_added(&watch);
    let mut any = watch.any();

    send(
        &feed,
        batch(vec![merge(
            "",
            json!({"K": {"_id": "resources/foo"}, "_rev": 4}),
        )]),
    )
    .await;

    any.next().await.unwrap();
    watch.stop().await;

    // The second listener still saw the event.
    assert_eq!(survived.load(Ordering::SeqCst), 1);

    let puts = conn.puts_to(&meta_path("test-watch"));
    assert!(
        puts.iter()
            .any(|body| body == &json!({"errors": {"/K": {"4": "listener exploded"}}})),
        "error not recorded under _meta: {puts:?}"
    );
    // The cursor advanced past the errored event.
    assert!(
        puts.iter().any(|body| body == &json!({"rev": 4})),
        "cursor did not advance: {puts:?}"
    );
}

// ---------------------------------------------------------------------------
// Lazy item accessor
// ---------------------------------------------------------------------------

#[tokio::test]
async fn item_fetch_is_lazy_and_memoized_per_event() {
    let (conn, feed) = MockConn::new();
    let item_path = format!("{LIST}/K");
    conn.set_get(&item_path, json!({"_id": "resources/foo", "ok": true}));
    let watch = simple_watch(&conn).await;

    let mut added = watch.added();

    send(
        &feed,
        batch(vec![merge(
            "",
            json!({"K": {"_id": "resources/foo"}, "_rev": 4}),
        )]),
    )
    .await;

    let event = added.next().await.unwrap();
    assert_eq!(conn.get_count(&item_path), 0, "no GET before access");

    let first = event.item().await.unwrap();
    let second = event.item().await.unwrap();
    assert_eq!(first, json!({"_id": "resources/foo", "ok": true}));
    assert_eq!(first, second);
    assert_eq!(conn.get_count(&item_path), 1, "memoized per event");

    watch.stop().await;
}

#[tokio::test]
async fn item_assertion_failure_surfaces_from_accessor() {
    let (conn, feed) = MockConn::new();
    conn.set_get(&format!("{LIST}/K"), json!({"not": "a thing"}));
    conn.set_get(LIST, json!({"_rev": 3}));

    let watch = ListWatch::new(ListWatchOptions {
        items_path: Some("$.*".parse::<ItemsPath>().unwrap()),
        assert_item: Some(Arc::new(|body| {
            if body.get("ok").is_some() {
                Ok(())
            } else {
                Err("body has no ok field".into())
            }
        })),
        ..ListWatchOptions::new(LIST, conn.as_conn())
    })
    .await
    .unwrap();

    let mut added = watch.added();

    send(
        &feed,
        batch(vec![merge(
            "",
            json!({"K": {"_id": "resources/foo"}, "_rev": 4}),
        )]),
    )
    .await;

    let event = added.next().await.unwrap();
    let error = event.item().await.unwrap_err();
    assert!(matches!(error, WatchError::AssertItem { .. }), "{error}");

    watch.stop().await;
}
