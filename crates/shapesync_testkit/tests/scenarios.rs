//! End-to-end scenarios against the in-process log server.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use shapesync_core::{DatabaseAdapter, Priority, Statement};
use shapesync_engine::{
    match_stream, CoordinatorOffsetStore, MessageBatch, OffsetStore, StreamStatus,
    StreamSubscriber, SyncError, SyncResult,
};
use shapesync_protocol::{Handle, Offset, Operation};
use shapesync_testkit::prelude::*;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn insert_then_up_to_date() {
    init_tracing();
    let server = todos_server();
    server.insert(todo(1, "buy milk"));
    server.insert(todo(2, "write docs"));

    let local = TestDatabase::new().await;
    let stream = todos_stream(&server);
    stream.subscribe(Arc::new(local.pipeline().await));
    let shape = Shape::new(stream.clone());

    shape.synced().await.unwrap();
    eventually(|| stream.status() == StreamStatus::Live).await;

    assert_eq!(local.titles().await, vec!["buy milk", "write docs"]);
    assert_eq!(shape.get(&todo_key(1)), Some(todo(1, "buy milk")));
    assert_eq!(shape.len(), 2);
    assert!(stream.last_synced_at().is_some());
    assert_eq!(stream.checkpoint().handle, Some(server.handle()));

    stream.unsubscribe_all();
}

#[tokio::test]
async fn delete_is_replicated() {
    init_tracing();
    let server = todos_server();
    server.insert(todo(1, "keep"));
    server.insert(todo(2, "drop"));

    let local = TestDatabase::new().await;
    let stream = todos_stream(&server);
    stream.subscribe(Arc::new(local.pipeline().await));
    let shape = Shape::new(stream.clone());
    shape.synced().await.unwrap();

    server.delete(row(json!({"id": 2})));

    let db = &local;
    eventually_async(move || async move { db.count().await == 1 }).await;
    eventually(|| shape.get(&todo_key(2)).is_none()).await;
    assert_eq!(local.titles().await, vec!["keep"]);

    stream.unsubscribe_all();
}

/// Records the local row count whenever a reset batch arrives.
struct ResetProbe {
    db: DatabaseAdapter,
    counts: Mutex<Vec<serde_json::Value>>,
}

#[async_trait]
impl StreamSubscriber for ResetProbe {
    async fn on_messages(&self, batch: &MessageBatch) -> SyncResult<()> {
        if batch.is_reset() {
            let rows = self.db.query("SELECT count(*) AS n FROM todos").await?;
            self.counts.lock().push(rows[0]["n"].clone());
        }
        Ok(())
    }
}

#[tokio::test]
async fn gone_log_empties_then_repopulates() {
    init_tracing();
    let server = todos_server();
    server.insert(todo(1, "a"));
    server.insert(todo(2, "b"));

    let local = TestDatabase::new().await;
    let stream = todos_stream(&server);
    stream.subscribe(Arc::new(local.pipeline().await));
    let probe = Arc::new(ResetProbe {
        db: local.db.clone(),
        counts: Mutex::new(Vec::new()),
    });
    stream.subscribe(probe.clone());
    let shape = Shape::new(stream.clone());
    let reset_sizes = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reset_sizes);
    let listener = shape.subscribe(move |view| {
        if view.checkpoint().offset.is_before_all() {
            sink.lock().push(view.len());
        }
    });
    shape.synced().await.unwrap();
    let old_handle = server.handle();

    server.expire_handle();
    server.insert(todo(3, "c"));

    let db = &local;
    eventually_async(move || async move { db.count().await == 3 }).await;

    assert_eq!(probe.counts.lock().clone(), vec![json!(0)]);
    assert_eq!(local.titles().await, vec!["a", "b", "c"]);
    assert_ne!(stream.checkpoint().handle, Some(old_handle));
    eventually(|| shape.len() == 3).await;
    assert_eq!(reset_sizes.lock().clone(), vec![0]);

    let refetches = server
        .requests()
        .iter()
        .filter(|url| url.contains("offset=-1"))
        .count();
    assert_eq!(refetches, 2);

    // Closing the view leaves replication into the database running.
    assert!(shape.unsubscribe(listener));
    assert!(stream.status().is_active());
    server.insert(todo(4, "d"));
    eventually_async(move || async move { db.count().await == 4 }).await;

    stream.unsubscribe_all();
}

#[tokio::test]
async fn handle_conflict_adopts_new_handle() {
    init_tracing();
    let server = todos_server();
    server.insert(todo(1, "a"));

    let stream = todos_stream(&server);
    let shape = Shape::new(stream.clone());
    shape.synced().await.unwrap();

    let new_handle = server.rotate_handle();
    eventually(|| stream.checkpoint().handle.as_ref() == Some(&new_handle)).await;
    eventually(|| stream.is_up_to_date() && shape.len() == 1).await;

    assert!(server
        .requests()
        .iter()
        .any(|url| url.contains(&format!("offset=-1&handle={new_handle}"))));

    stream.unsubscribe_all();
}

#[tokio::test]
async fn high_priority_apply_runs_before_low_priority_write() {
    init_tracing();
    let local = TestDatabase::new().await;
    let pipeline = local.pipeline().await;

    let holder = local.mutex().acquire(&Priority::Normal).await.unwrap();

    let low = {
        let db = local.db.clone();
        tokio::spawn(async move {
            db.run_with_priority(
                Priority::Low,
                Statement::new("UPDATE todos SET title = ? WHERE id = ?")
                    .bind("local edit")
                    .bind(1),
            )
            .await
        })
    };
    eventually(|| local.mutex().waiting() == 1).await;

    let high = tokio::spawn(async move {
        pipeline
            .apply(&MessageBatch {
                messages: log_messages(&[LogOp::Insert(1, "from server".into())]),
                handle: Some(Handle::new("handle-1")),
                offset: Offset::new("1_0"),
            })
            .await
    });
    eventually(|| local.mutex().waiting() == 2).await;

    drop(holder);
    high.await.unwrap().unwrap();
    let updated = low.await.unwrap().unwrap();

    // The update only finds the row if the apply committed first.
    assert_eq!(updated.rows_affected, 1);
    assert_eq!(local.titles().await, vec!["local edit"]);
}

#[tokio::test]
async fn failed_batch_is_rolled_back() {
    init_tracing();
    let server = Arc::new(LogServer::new(TODOS, "id", todos_schema()).with_page_size(2));
    server.insert(todo(1, "one"));
    server.insert(todo(2, "two"));
    server.insert(todo(3, "three"));
    server.insert(row(json!({"id": 4, "title": null})));

    let local = TestDatabase::new().await;
    let stream = todos_stream(&server);
    stream.subscribe(Arc::new(local.pipeline().await));

    let err = stream.stopped().await.expect("stream should fail");
    assert!(matches!(err, SyncError::Database(_)), "unexpected error: {err}");
    assert_eq!(stream.status(), StreamStatus::Stopped);

    assert_eq!(local.titles().await, vec!["one", "two"]);
    let checkpoint = CoordinatorOffsetStore::new(local.db.clone())
        .load(TODOS)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint.offset, Offset::new("2_0"));
}

#[tokio::test]
async fn match_stream_timeout_restores_subscribers() {
    init_tracing();
    let server = todos_server();
    let stream = todos_stream(&server);
    stream.subscribe_fn(|_| Ok(()));
    let before = stream.subscriber_count();

    let err = match_stream(
        &stream,
        &[Operation::Insert],
        |change| change.key == todo_key(42),
        Duration::from_millis(100),
    )
    .await
    .unwrap_err();

    assert_eq!(err, SyncError::Timeout);
    assert_eq!(stream.subscriber_count(), before);

    let (matched, _) = tokio::join!(
        match_stream(
            &stream,
            &[Operation::Insert],
            |change| change.key == todo_key(7),
            Duration::from_secs(5),
        ),
        async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            server.insert(todo(7, "seven"));
        }
    );
    assert_eq!(matched.unwrap().value["title"], json!("seven"));
    assert_eq!(stream.subscriber_count(), before);

    stream.unsubscribe_all();
}

#[tokio::test]
async fn transient_faults_are_retried() {
    init_tracing();
    let server = todos_server();
    server.insert(todo(1, "a"));
    server.inject(Fault::Status(503));
    server.inject(Fault::Disconnect);
    server.inject(Fault::Status(429));

    let stream = todos_stream(&server);
    let shape = Shape::new(stream.clone());
    shape.synced().await.unwrap();

    assert_eq!(shape.len(), 1);
    let requests = server.requests();
    assert!(requests.len() >= 4);
    assert!(requests[..4].iter().all(|url| url.contains("offset=-1")));
    stream.unsubscribe_all();
}

#[tokio::test]
async fn exhausted_retries_stop_the_stream() {
    init_tracing();
    let server = todos_server();
    for _ in 0..4 {
        server.inject(Fault::Status(502));
    }

    let stream = todos_stream(&server);
    let shape = Shape::new(stream.clone());

    let err = shape.synced().await.unwrap_err();
    assert!(matches!(err, SyncError::RetriesExhausted { attempts: 4, .. }));
}
