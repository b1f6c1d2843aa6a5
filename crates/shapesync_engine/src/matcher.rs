//! Waiting for a specific change to arrive on a stream.

use crate::error::{SyncError, SyncResult};
use crate::stream::{MessageBatch, ShapeStream, StreamSubscriber, SubscriptionId};
use async_trait::async_trait;
use parking_lot::Mutex;
use shapesync_protocol::{ChangeMessage, Operation};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

type Outcome = SyncResult<ChangeMessage>;

struct MatchSubscriber<P> {
    operations: Vec<Operation>,
    predicate: P,
    tx: Mutex<Option<oneshot::Sender<Outcome>>>,
}

impl<P> MatchSubscriber<P> {
    fn resolve(&self, outcome: Outcome) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(outcome);
        }
    }
}

#[async_trait]
impl<P> StreamSubscriber for MatchSubscriber<P>
where
    P: Fn(&ChangeMessage) -> bool + Send + Sync,
{
    async fn on_messages(&self, batch: &MessageBatch) -> SyncResult<()> {
        let found = batch
            .changes()
            .find(|&change| self.operations.contains(&change.operation()) && (self.predicate)(change));
        if let Some(change) = found {
            self.resolve(Ok(change.clone()));
        }
        Ok(())
    }

    async fn on_error(&self, error: &SyncError) {
        self.resolve(Err(SyncError::Stopped(error.to_string())));
    }
}

struct Unsubscribe<'a> {
    stream: &'a ShapeStream,
    id: SubscriptionId,
}

impl Drop for Unsubscribe<'_> {
    fn drop(&mut self) {
        self.stream.unsubscribe(self.id);
    }
}

/// Waits for the first change of one of `operations` that satisfies
/// `predicate`.
///
/// Only changes arriving after the call are considered. The temporary
/// subscription is removed on every exit path, including cancellation of
/// the returned future. Fails with [`SyncError::Timeout`] if nothing
/// matches within `timeout` and with [`SyncError::Stopped`] if the stream
/// stops first.
pub async fn match_stream<P>(
    stream: &ShapeStream,
    operations: &[Operation],
    predicate: P,
    timeout: Duration,
) -> SyncResult<ChangeMessage>
where
    P: Fn(&ChangeMessage) -> bool + Send + Sync + 'static,
{
    let (tx, rx) = oneshot::channel();
    let subscriber = Arc::new(MatchSubscriber {
        operations: operations.to_vec(),
        predicate,
        tx: Mutex::new(Some(tx)),
    });

    let id = stream.subscribe(subscriber);
    let _unsubscribe = Unsubscribe { stream, id };

    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(_)) => Err(SyncError::Stopped(
            "subscription removed before a match".to_string(),
        )),
        Err(_) => {
            tracing::debug!(table = %stream.shape().table, ?timeout, "no matching change before timeout");
            Err(SyncError::Timeout)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RetryConfig, ShapeStreamConfig};
    use crate::transport::{FetchResponse, MockFetchClient};
    use serde_json::json;
    use shapesync_protocol::{Message, ShapeDefinition, HANDLE_HEADER, OFFSET_HEADER};

    fn stream(client: MockFetchClient) -> ShapeStream {
        let config = ShapeStreamConfig::new("http://sync.test", ShapeDefinition::new("todos"))
            .with_retry(RetryConfig::no_retry());
        ShapeStream::new(config, Arc::new(client))
    }

    fn todo(id: i64, done: bool) -> shapesync_protocol::Row {
        json!({"id": id, "done": done}).as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn resolves_on_matching_change() {
        let stream = stream(
            MockFetchClient::new().with_response(
                FetchResponse::ok(&[
                    ChangeMessage::insert("k1", todo(1, false)).into(),
                    ChangeMessage::update("k1", todo(1, true)).into(),
                    Message::up_to_date(),
                ])
                .with_header(HANDLE_HEADER, "h1")
                .with_header(OFFSET_HEADER, "1_1"),
            ),
        );

        let change = match_stream(
            &stream,
            &[Operation::Update],
            |change| change.value["done"] == json!(true),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert_eq!(change.operation(), Operation::Update);
        assert_eq!(stream.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn timeout_removes_subscription() {
        let stream = stream(MockFetchClient::new());
        let keep = stream.subscribe_fn(|_| Ok(()));

        let err = match_stream(
            &stream,
            &[Operation::Insert],
            |_| true,
            Duration::from_millis(20),
        )
        .await
        .unwrap_err();

        assert_eq!(err, SyncError::Timeout);
        assert_eq!(stream.subscriber_count(), 1);
        assert!(stream.unsubscribe(keep));
    }

    #[tokio::test]
    async fn stream_failure_is_reported() {
        let stream = stream(MockFetchClient::new().with_response(FetchResponse::new(400)));

        let err = match_stream(&stream, &[Operation::Delete], |_| true, Duration::from_secs(5))
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Stopped(_)));
        assert_eq!(stream.subscriber_count(), 0);
    }
}
