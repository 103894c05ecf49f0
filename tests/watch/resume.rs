//! Resume protocol scenarios: cursor-based watch acquisition, replay
//! idempotence, starting snapshots, and list self-deletion.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::json;

use oada_list_watch::{ItemsPath, ListWatch, ListWatchOptions, NewListMode};

use super::mock::{batch, delete, merge, MockConn};

const LIST: &str = "/bookmarks/test/list";
const NAME: &str = "sync";

fn meta_path() -> String {
    format!("{LIST}/_meta/oada-list-lib/{NAME}")
}

fn options(conn: &Arc<MockConn>) -> ListWatchOptions {
    ListWatchOptions {
        items_path: Some("$.*".parse::<ItemsPath>().unwrap()),
        name: Some(NAME.to_string()),
        resume: true,
        persist_interval: Duration::from_millis(10),
        ..ListWatchOptions::new(LIST, conn.as_conn())
    }
}

// ---------------------------------------------------------------------------
// S4 — resume from stored rev
// ---------------------------------------------------------------------------

#[tokio::test]
async fn resume_opens_watch_at_stored_rev() {
    let (conn, _feed) = MockConn::new();
    conn.set_get(&meta_path(), json!({"rev": 766}));

    let watch = ListWatch::new(options(&conn)).await.unwrap();

    assert_eq!(conn.watch_revs(), vec![Some(766)]);
    // Prior metadata means no starting snapshot.
    assert_eq!(conn.get_count(LIST), 0);

    watch.stop().await;
}

// ---------------------------------------------------------------------------
// Resume idempotence (invariant 6)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn batches_at_or_below_cursor_emit_nothing() {
    let (conn, feed) = MockConn::new();
    conn.set_get(&meta_path(), json!({"rev": 766}));

    let watch = ListWatch::new(options(&conn)).await.unwrap();

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

    // Already covered by the cursor: must be silent.
    feed.send(Ok(batch(vec![merge(
        "",
        json!({"K": {"_id": "resources/old"}, "_rev": 700}),
    )])))
    .await
    .unwrap();
    feed.send(Ok(batch(vec![merge(
        "",
        json!({"K": {"_id": "resources/old"}, "_rev": 766}),
    )])))
    .await
    .unwrap();
    // Past the cursor: delivered.
    feed.send(Ok(batch(vec![merge(
        "",
        json!({"Q": {"_id": "resources/new"}, "_rev": 767}),
    )])))
    .await
    .unwrap();

    let aggregate = any.next().await.unwrap();
    assert_eq!(aggregate.pointer, "/Q");
    assert_eq!(aggregate.list_rev, 767);

    watch.stop().await;
    assert_eq!(&*pointers.lock(), &["/Q"]);
}

// ---------------------------------------------------------------------------
// Starting snapshot
// ---------------------------------------------------------------------------

#[tokio::test]
async fn first_run_emits_existing_items_before_batches() {
    let (conn, feed) = MockConn::new();
    // No prior metadata; the default selector skips the underscore keys.
    conn.set_get(
        LIST,
        json!({
            "a": {"_id": "resources/a"},
            "b": {"_id": "resources/b"},
            "_id": "resources/list",
            "_rev": 7,
        }),
    );

    let watch = ListWatch::new(ListWatchOptions {
        items_path: None,
        ..options(&conn)
    })
    .await
    .unwrap();

    let mut added = watch.added();
    let mut any = watch.any();

    // A batch already queued behind the snapshot.
    feed.send(Ok(batch(vec![merge(
        "",
        json!({"c": {"_id": "resources/c"}, "_rev": 8}),
    )])))
    .await
    .unwrap();

    let first = added.next().await.unwrap();
    assert_eq!(first.pointer, "/a");
    assert_eq!(first.list_rev, 7);
    assert_eq!(any.next().await.unwrap().pointer, "/a");

    let second = added.next().await.unwrap();
    assert_eq!(second.pointer, "/b");
    assert_eq!(any.next().await.unwrap().pointer, "/b");

    // Only then the feed batch.
    let third = added.next().await.unwrap();
    assert_eq!(third.pointer, "/c");
    assert_eq!(third.list_rev, 8);

    watch.stop().await;
    assert!(
        conn.puts_to(&meta_path()).contains(&json!({"rev": 8})),
        "cursor not persisted: {:?}",
        conn.puts_to(&meta_path())
    );
}

#[tokio::test]
async fn handled_mode_skips_snapshot_and_starts_at_link_rev() {
    let (conn, _feed) = MockConn::new();
    conn.set_put_header(&meta_path(), "x-oada-rev", "42");

    let watch = ListWatch::new(ListWatchOptions {
        on_new_list: NewListMode::Handled,
        ..options(&conn)
    })
    .await
    .unwrap();

    assert_eq!(conn.watch_revs(), vec![Some(42)]);
    assert_eq!(conn.get_count(LIST), 0, "no snapshot GET in Handled mode");

    // The assigned cursor reaches the store even with no events.
    let _stream = watch.added();
    for _ in 0..50 {
        if conn.puts_to(&meta_path()).contains(&json!({"rev": 42})) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(conn.puts_to(&meta_path()).contains(&json!({"rev": 42})));

    watch.stop().await;
}

// ---------------------------------------------------------------------------
// S6 — list self-delete
// ---------------------------------------------------------------------------

#[tokio::test]
async fn list_self_delete_terminates_watch() {
    let (conn, feed) = MockConn::new();
    conn.set_get(LIST, json!({"_rev": 3}));

    let watch = ListWatch::new(ListWatchOptions {
        resume: false,
        ..options(&conn)
    })
    .await
    .unwrap();

    let added = Arc::new(AtomicUsize::new(0));
    let _ = watch.on_added({
        let added = Arc::clone(&added);
        move |_| {
            let added = Arc::clone(&added);
            async move {
                added.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
    });
    let removed = Arc::new(AtomicUsize::new(0));
    let _ = watch.on_removed({
        let removed = Arc::clone(&removed);
        move |_| {
            let removed = Arc::clone(&removed);
            async move {
                removed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
    });

    feed.send(Ok(batch(vec![delete("", None)]))).await.unwrap();
    // Batches after the deletion must be ignored.
    feed.send(Ok(batch(vec![merge(
        "",
        json!({"K": {"_id": "resources/foo"}, "_rev": 9}),
    )])))
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;

    watch.stop().await;
    assert_eq!(added.load(Ordering::SeqCst), 0);
    assert_eq!(removed.load(Ordering::SeqCst), 0, "no synthetic removals");
}

#[tokio::test]
async fn stop_is_idempotent() {
    let (conn, _feed) = MockConn::new();
    conn.set_get(LIST, json!({"_rev": 3}));
    let watch = ListWatch::new(options(&conn)).await.unwrap();

    watch.stop().await;
    watch.stop().await;
}

// ---------------------------------------------------------------------------
// Feed failure
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unexpected_feed_end_emits_error_event() {
    let (conn, feed) = MockConn::new();
    conn.set_get(LIST, json!({"_rev": 3}));
    let watch = ListWatch::new(ListWatchOptions {
        resume: false,
        ..options(&conn)
    })
    .await
    .unwrap();

    let errors = Arc::new(AtomicUsize::new(0));
    let _ = watch.on_error({
        let errors = Arc::clone(&errors);
        move |_| {
            let errors = Arc::clone(&errors);
            async move {
                errors.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
    });
    let _stream = watch.added();

    drop(feed);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(errors.load(Ordering::SeqCst), 1);
    watch.stop().await;
}
