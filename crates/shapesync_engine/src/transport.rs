//! HTTP client abstraction.
//!
//! The stream never talks to a concrete HTTP library. Implement
//! [`FetchClient`] over reqwest, hyper or an in-process server; every
//! response comes back as a [`FetchResponse`] regardless of status.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use shapesync_protocol::{encode_messages, Headers, Message};
use std::collections::VecDeque;

/// A complete HTTP response.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResponse {
    /// Status code.
    pub status: u16,
    /// Response headers.
    pub headers: Headers,
    /// Raw body.
    pub body: Vec<u8>,
}

impl FetchResponse {
    /// Creates a response with no headers and an empty body.
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    /// Creates a 200 response carrying `messages`.
    pub fn ok(messages: &[Message]) -> Self {
        Self::new(200).with_body(encode_messages(messages))
    }

    /// Adds a header.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Replaces the body.
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Body as lossy UTF-8, for error messages.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Issues GET requests for the stream.
#[async_trait]
pub trait FetchClient: Send + Sync {
    /// Sends a GET request.
    ///
    /// Only failures to obtain a response are errors; non-2xx statuses are
    /// returned as ordinary responses.
    async fn get(&self, url: &str) -> SyncResult<FetchResponse>;
}

/// One scripted reply of a [`MockFetchClient`].
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Return this response.
    Response(FetchResponse),
    /// Fail with this transport error.
    Error(SyncError),
}

/// A fetch client that replays scripted replies in order.
///
/// Once the script runs out, requests hang like an idle long-poll. Every
/// requested URL is recorded.
#[derive(Debug, Default)]
pub struct MockFetchClient {
    replies: Mutex<VecDeque<MockReply>>,
    requests: Mutex<Vec<String>>,
}

impl MockFetchClient {
    /// Creates a client with an empty script.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a response.
    pub fn push_response(&self, response: FetchResponse) {
        self.replies.lock().push_back(MockReply::Response(response));
    }

    /// Queues a transport error.
    pub fn push_error(&self, error: SyncError) {
        self.replies.lock().push_back(MockReply::Error(error));
    }

    /// Builder form of [`push_response`](Self::push_response).
    pub fn with_response(self, response: FetchResponse) -> Self {
        self.push_response(response);
        self
    }

    /// Builder form of [`push_error`](Self::push_error).
    pub fn with_error(self, error: SyncError) -> Self {
        self.push_error(error);
        self
    }

    /// URLs requested so far.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }

    /// Number of replies not yet consumed.
    pub fn remaining(&self) -> usize {
        self.replies.lock().len()
    }
}

#[async_trait]
impl FetchClient for MockFetchClient {
    async fn get(&self, url: &str) -> SyncResult<FetchResponse> {
        self.requests.lock().push(url.to_string());
        let next = self.replies.lock().pop_front();
        match next {
            Some(MockReply::Response(response)) => Ok(response),
            Some(MockReply::Error(error)) => Err(error),
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn replays_in_order_then_hangs() {
        let client = MockFetchClient::new()
            .with_response(FetchResponse::new(204))
            .with_error(SyncError::transport_retryable("reset"));

        assert_eq!(client.get("http://a/1").await.unwrap().status, 204);
        assert!(client.get("http://a/2").await.unwrap_err().is_retryable());
        assert_eq!(client.remaining(), 0);

        let hung = tokio::time::timeout(Duration::from_millis(10), client.get("http://a/3")).await;
        assert!(hung.is_err());
        assert_eq!(client.requests(), vec!["http://a/1", "http://a/2", "http://a/3"]);
    }

    #[test]
    fn response_builder() {
        let response = FetchResponse::ok(&[Message::up_to_date()])
            .with_header("Electric-Handle", "h1");
        assert_eq!(response.status, 200);
        assert_eq!(response.headers.get("electric-handle"), Some("h1"));
        assert!(response.body_text().contains("up-to-date"));
    }
}
