//! Integration tests for the stream, apply pipeline and checkpoint store.

use serde_json::json;
use shapesync_core::{DatabaseAdapter, SqliteBackend};
use shapesync_engine::{
    ApplyConfig, ApplyPipeline, CoordinatorOffsetStore, FetchResponse, MockFetchClient,
    OffsetStore, RetryConfig, ShapeStream, ShapeStreamConfig, StreamStatus, SyncError,
    DEFAULT_OFFSET_TABLE,
};
use shapesync_protocol::{ChangeMessage, Message, Row, ShapeDefinition, HANDLE_HEADER, OFFSET_HEADER};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn row(value: serde_json::Value) -> Row {
    value.as_object().cloned().unwrap()
}

fn page(messages: &[Message], handle: &str, offset: &str) -> FetchResponse {
    FetchResponse::ok(messages)
        .with_header(HANDLE_HEADER, handle)
        .with_header(OFFSET_HEADER, offset)
}

async fn open_db(dir: &TempDir) -> DatabaseAdapter {
    let backend = SqliteBackend::open(dir.path().join("local.db")).unwrap();
    let db = DatabaseAdapter::new(backend);
    db.run("CREATE TABLE IF NOT EXISTS todos (id INTEGER PRIMARY KEY, title TEXT NOT NULL)")
        .await
        .unwrap();
    db
}

async fn attach(db: &DatabaseAdapter, stream: &ShapeStream) {
    let pipeline = ApplyPipeline::new(
        db.clone(),
        ApplyConfig::new("todos", ["id"]).with_offset_table(DEFAULT_OFFSET_TABLE, "todos"),
    );
    pipeline.ensure_offset_table().await.unwrap();
    stream.subscribe(Arc::new(pipeline));
}

async fn wait_for_requests(client: &MockFetchClient, n: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while client.requests().len() < n {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("stream did not issue the expected requests");
}

async fn count(db: &DatabaseAdapter) -> serde_json::Value {
    db.query("SELECT count(*) AS n FROM todos").await.unwrap()[0]["n"].clone()
}

#[tokio::test]
async fn applied_stream_resumes_after_restart() {
    let dir = TempDir::new().unwrap();
    let shape = ShapeDefinition::new("todos");

    {
        let db = open_db(&dir).await;
        let client = Arc::new(MockFetchClient::new().with_response(page(
            &[
                ChangeMessage::insert("k1", row(json!({"id": 1, "title": "a"}))).into(),
                ChangeMessage::insert("k2", row(json!({"id": 2, "title": "b"}))).into(),
                Message::up_to_date(),
            ],
            "h1",
            "4_1",
        )));
        let stream = ShapeStream::new(
            ShapeStreamConfig::new("http://sync.test", shape.clone()),
            Arc::clone(&client) as _,
        );
        attach(&db, &stream).await;
        wait_for_requests(&client, 2).await;
        stream.unsubscribe_all();
        assert_eq!(count(&db).await, json!(2));
    }

    let db = open_db(&dir).await;
    let checkpoint = CoordinatorOffsetStore::new(db.clone())
        .load("todos")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint.offset.as_str(), "4_1");

    let client = Arc::new(MockFetchClient::new());
    let stream = ShapeStream::new(
        ShapeStreamConfig::new("http://sync.test", shape).with_checkpoint(checkpoint),
        Arc::clone(&client) as _,
    );
    attach(&db, &stream).await;
    wait_for_requests(&client, 1).await;

    assert_eq!(
        client.requests()[0],
        "http://sync.test/shape?table=todos&offset=4_1&handle=h1"
    );
    stream.unsubscribe_all();
}

#[tokio::test]
async fn rejected_batch_stops_stream_without_advancing() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;
    let client = Arc::new(
        MockFetchClient::new()
            .with_response(page(
                &[ChangeMessage::insert("k1", row(json!({"id": 1, "title": "a"}))).into()],
                "h1",
                "1_0",
            ))
            .with_response(page(
                &[
                    ChangeMessage::insert("k2", row(json!({"id": 2, "title": "b"}))).into(),
                    ChangeMessage::insert("k3", row(json!({"id": 3}))).into(),
                ],
                "h1",
                "2_0",
            )),
    );
    let stream = ShapeStream::new(
        ShapeStreamConfig::new("http://sync.test", ShapeDefinition::new("todos"))
            .with_retry(RetryConfig::no_retry()),
        Arc::clone(&client) as _,
    );
    attach(&db, &stream).await;

    let err = stream.stopped().await.unwrap();
    assert!(matches!(err, SyncError::Database(_)));
    assert_eq!(stream.status(), StreamStatus::Stopped);
    assert_eq!(count(&db).await, json!(1));

    let checkpoint = CoordinatorOffsetStore::new(db).load("todos").await.unwrap().unwrap();
    assert_eq!(checkpoint.offset.as_str(), "1_0");
    assert_eq!(stream.checkpoint().offset.as_str(), "1_0");
}

#[tokio::test]
async fn reset_clears_local_table() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;
    let client = Arc::new(
        MockFetchClient::new()
            .with_response(page(
                &[
                    ChangeMessage::insert("k1", row(json!({"id": 1, "title": "a"}))).into(),
                    Message::up_to_date(),
                ],
                "h1",
                "1_0",
            ))
            .with_response(FetchResponse::new(409).with_header(HANDLE_HEADER, "h2")),
    );
    let stream = ShapeStream::new(
        ShapeStreamConfig::new("http://sync.test", ShapeDefinition::new("todos")),
        Arc::clone(&client) as _,
    );
    attach(&db, &stream).await;
    wait_for_requests(&client, 3).await;

    assert_eq!(count(&db).await, json!(0));
    let checkpoint = CoordinatorOffsetStore::new(db).load("todos").await.unwrap().unwrap();
    assert!(checkpoint.offset.is_before_all());
    assert_eq!(checkpoint.handle.unwrap().as_str(), "h2");
    assert_eq!(
        client.requests()[2],
        "http://sync.test/shape?table=todos&offset=-1&handle=h2"
    );
    stream.unsubscribe_all();
}
