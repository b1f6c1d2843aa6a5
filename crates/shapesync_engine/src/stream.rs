//! The shape stream: fetch loop, offset bookkeeping and batch delivery.
//!
//! ## Loop
//!
//! ```text
//! Idle ──subscribe/start──▶ Running ──up-to-date──▶ Live
//!                              ▲                      │
//!                              └── must-refetch/409/410
//!
//! any ──unsubscribe_all / abort / fatal error──▶ Stopped
//! ```
//!
//! Each iteration issues one request from the current checkpoint, decodes
//! the body, advances the checkpoint and hands the whole batch to every
//! subscriber before the next request is sent. Once up-to-date has been
//! seen, requests switch to live long-polling.

use crate::config::ShapeStreamConfig;
use crate::error::{SyncError, SyncResult};
use crate::offset_store::Checkpoint;
use crate::signal::AbortSignal;
use crate::transport::{FetchClient, FetchResponse};
use async_trait::async_trait;
use parking_lot::Mutex;
use shapesync_protocol::{
    build_shape_url, classify_status, decode_messages, ChangeMessage, Handle, Message, Offset,
    ResetReason, Schema, ShapeDefinition, ShapeRequest, StatusClass, CURSOR_HEADER,
    HANDLE_HEADER, OFFSET_HEADER, SCHEMA_HEADER, UP_TO_DATE_HEADER,
};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tokio::sync::watch;

/// Identifier returned by [`ShapeStream::subscribe`].
pub type SubscriptionId = u64;

/// Lifecycle of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    /// Not started yet.
    Idle,
    /// Catching up with the log.
    Running,
    /// Caught up; long-polling for new changes.
    Live,
    /// The fetch loop has exited.
    Stopped,
}

impl StreamStatus {
    /// Returns true while the fetch loop runs.
    pub fn is_active(&self) -> bool {
        matches!(self, StreamStatus::Running | StreamStatus::Live)
    }
}

/// Messages from one response, delivered together.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageBatch {
    /// Messages in log order.
    pub messages: Vec<Message>,
    /// Handle in effect after this batch.
    pub handle: Option<Handle>,
    /// Offset to resume from after this batch.
    pub offset: Offset,
}

impl MessageBatch {
    /// Change messages in log order.
    pub fn changes(&self) -> impl Iterator<Item = &ChangeMessage> {
        self.messages.iter().filter_map(Message::as_change)
    }

    /// Returns true if the batch ends with the stream up to date.
    pub fn is_up_to_date(&self) -> bool {
        self.messages.iter().any(Message::is_up_to_date)
    }

    /// Returns true if the batch discards all previously delivered state.
    pub fn is_reset(&self) -> bool {
        self.messages.iter().any(Message::is_must_refetch)
    }

    /// Position to resume from once this batch has been applied.
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint::new(self.handle.clone(), self.offset.clone())
    }

    /// Number of messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Returns true if the batch has no messages.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Receives batches from a [`ShapeStream`].
#[async_trait]
pub trait StreamSubscriber: Send + Sync {
    /// Handles one batch.
    ///
    /// Returning an error stops the stream: the batch is not considered
    /// delivered and no further batches follow.
    async fn on_messages(&self, batch: &MessageBatch) -> SyncResult<()>;

    /// Called once when the stream stops because of an error.
    async fn on_error(&self, _error: &SyncError) {}
}

/// Adapts a synchronous closure into a [`StreamSubscriber`].
pub struct FnSubscriber<F>(F);

impl<F> FnSubscriber<F>
where
    F: Fn(&MessageBatch) -> SyncResult<()> + Send + Sync + 'static,
{
    /// Wraps `f`.
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> StreamSubscriber for FnSubscriber<F>
where
    F: Fn(&MessageBatch) -> SyncResult<()> + Send + Sync + 'static,
{
    async fn on_messages(&self, batch: &MessageBatch) -> SyncResult<()> {
        (self.0)(batch)
    }
}

type RunId = u64;

struct StreamState {
    checkpoint: Checkpoint,
    cursor: Option<String>,
    schema: Option<Schema>,
    up_to_date: bool,
    last_synced_at: Option<SystemTime>,
    last_error: Option<SyncError>,
    subscribers: BTreeMap<SubscriptionId, Arc<dyn StreamSubscriber>>,
    next_subscription: SubscriptionId,
    run: RunId,
    stop: Option<watch::Sender<bool>>,
}

/// Position the stream moves to once a batch has been delivered.
struct Advance {
    checkpoint: Checkpoint,
    cursor: Option<String>,
    schema: Option<Schema>,
    up_to_date: bool,
    synced: bool,
}

impl Advance {
    fn reset(handle: Option<Handle>) -> Self {
        Self {
            checkpoint: Checkpoint::new(handle, Offset::before_all()),
            cursor: None,
            schema: None,
            up_to_date: false,
            synced: false,
        }
    }

    fn batch(&self, messages: Vec<Message>) -> MessageBatch {
        MessageBatch {
            messages,
            handle: self.checkpoint.handle.clone(),
            offset: self.checkpoint.offset.clone(),
        }
    }
}

struct StreamInner {
    config: ShapeStreamConfig,
    client: Arc<dyn FetchClient>,
    state: Mutex<StreamState>,
    status: watch::Sender<StreamStatus>,
}

/// A replicated view of one shape log.
///
/// Cloning yields another handle to the same stream. The fetch loop runs on
/// a tokio task, so the stream must be started from within a runtime.
#[derive(Clone)]
pub struct ShapeStream {
    inner: Arc<StreamInner>,
}

impl ShapeStream {
    /// Creates a stream. Nothing is fetched until the first subscription or
    /// an explicit [`start`](Self::start).
    pub fn new(config: ShapeStreamConfig, client: Arc<dyn FetchClient>) -> Self {
        let checkpoint = config.start.clone().unwrap_or_default();
        let (status, _) = watch::channel(StreamStatus::Idle);

        Self {
            inner: Arc::new(StreamInner {
                config,
                client,
                state: Mutex::new(StreamState {
                    checkpoint,
                    cursor: None,
                    schema: None,
                    up_to_date: false,
                    last_synced_at: None,
                    last_error: None,
                    subscribers: BTreeMap::new(),
                    next_subscription: 1,
                    run: 0,
                    stop: None,
                }),
                status,
            }),
        }
    }

    /// The shape being followed.
    pub fn shape(&self) -> &ShapeDefinition {
        &self.inner.config.shape
    }

    /// The stream configuration.
    pub fn config(&self) -> &ShapeStreamConfig {
        &self.inner.config
    }

    /// Registers a subscriber and starts the loop if it is not running.
    pub fn subscribe(&self, subscriber: Arc<dyn StreamSubscriber>) -> SubscriptionId {
        let id = {
            let mut state = self.inner.state.lock();
            let id = state.next_subscription;
            state.next_subscription += 1;
            state.subscribers.insert(id, subscriber);
            id
        };
        self.start();
        id
    }

    /// Registers a closure as a subscriber.
    pub fn subscribe_fn<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&MessageBatch) -> SyncResult<()> + Send + Sync + 'static,
    {
        self.subscribe(Arc::new(FnSubscriber::new(f)))
    }

    /// Removes a subscriber. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.state.lock().subscribers.remove(&id).is_some()
    }

    /// Removes a subscriber and stops the fetch loop if it was the last one.
    pub fn release(&self, id: SubscriptionId) -> bool {
        let (removed, stop) = {
            let mut state = self.inner.state.lock();
            let removed = state.subscribers.remove(&id).is_some();
            let stop = if removed && state.subscribers.is_empty() {
                state.stop.take()
            } else {
                None
            };
            (removed, stop)
        };
        if let Some(stop) = stop {
            self.halt(stop, "stream stopped after its last subscriber left");
        }
        removed
    }

    /// Removes every subscriber and stops the fetch loop.
    pub fn unsubscribe_all(&self) {
        let stop = {
            let mut state = self.inner.state.lock();
            state.subscribers.clear();
            state.stop.take()
        };
        if let Some(stop) = stop {
            self.halt(stop, "stream stopped by unsubscribe");
        }
    }

    fn halt(&self, stop: watch::Sender<bool>, reason: &'static str) {
        stop.send_replace(true);
        self.inner.status.send_replace(StreamStatus::Stopped);
        tracing::debug!(table = %self.inner.config.shape.table, "{reason}");
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.state.lock().subscribers.len()
    }

    /// Starts the fetch loop from the current checkpoint.
    ///
    /// Returns false if a loop is already running or the abort signal has
    /// fired. A stopped stream may be started again; it resumes where it
    /// left off.
    pub fn start(&self) -> bool {
        if self.is_aborted() {
            return false;
        }

        let (run, stop_rx, live) = {
            let mut state = self.inner.state.lock();
            if state.stop.is_some() {
                return false;
            }
            let (tx, rx) = watch::channel(false);
            state.stop = Some(tx);
            state.run += 1;
            state.last_error = None;
            (state.run, rx, state.up_to_date)
        };

        self.inner.status.send_replace(if live {
            StreamStatus::Live
        } else {
            StreamStatus::Running
        });
        tracing::debug!(table = %self.inner.config.shape.table, run, "stream started");

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.run(run, stop_rx).await });
        true
    }

    /// Current status.
    pub fn status(&self) -> StreamStatus {
        *self.inner.status.borrow()
    }

    /// Watches status changes.
    pub fn status_changes(&self) -> watch::Receiver<StreamStatus> {
        self.inner.status.subscribe()
    }

    /// Waits until the loop has stopped and returns the error it stopped
    /// with, if any.
    pub async fn stopped(&self) -> Option<SyncError> {
        let mut rx = self.status_changes();
        let _ = rx.wait_for(|s| *s == StreamStatus::Stopped).await;
        self.last_error()
    }

    /// Position the stream resumes from.
    pub fn checkpoint(&self) -> Checkpoint {
        self.inner.state.lock().checkpoint.clone()
    }

    /// Column schema announced by the server, once known.
    pub fn schema(&self) -> Option<Schema> {
        self.inner.state.lock().schema.clone()
    }

    /// Returns true once up-to-date has been seen for the current handle.
    pub fn is_up_to_date(&self) -> bool {
        self.inner.state.lock().up_to_date
    }

    /// When the stream last reached up-to-date.
    pub fn last_synced_at(&self) -> Option<SystemTime> {
        self.inner.state.lock().last_synced_at
    }

    /// The error that stopped the most recent run.
    pub fn last_error(&self) -> Option<SyncError> {
        self.inner.state.lock().last_error.clone()
    }

    fn is_aborted(&self) -> bool {
        self.inner
            .config
            .abort
            .as_ref()
            .map_or(false, AbortSignal::is_aborted)
    }
}

impl std::fmt::Debug for ShapeStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShapeStream")
            .field("shape", &self.inner.config.shape)
            .field("status", &self.status())
            .field("checkpoint", &self.checkpoint())
            .finish()
    }
}

enum Step {
    Continue,
    Stop,
    Fail(SyncError),
}

enum Interrupted<T> {
    Done(T),
    Stopped,
    Aborted,
}

async fn stop_requested(rx: &mut watch::Receiver<bool>) {
    // A dropped sender also means stop.
    let _ = rx.wait_for(|stop| *stop).await;
}

async fn abort_requested(signal: &Option<AbortSignal>) {
    match signal {
        Some(signal) => signal.aborted().await,
        None => std::future::pending().await,
    }
}

impl StreamInner {
    async fn run(self: Arc<Self>, run: RunId, mut stop_rx: watch::Receiver<bool>) {
        let mut attempt = 0u32;

        let outcome = loop {
            match self.step(run, &mut stop_rx, &mut attempt).await {
                Step::Continue => continue,
                Step::Stop => break None,
                Step::Fail(err) => break Some(err),
            }
        };

        self.finish(run, outcome).await;
    }

    async fn interruptible<F: Future>(
        &self,
        stop_rx: &mut watch::Receiver<bool>,
        fut: F,
    ) -> Interrupted<F::Output> {
        tokio::select! {
            biased;
            _ = stop_requested(stop_rx) => Interrupted::Stopped,
            _ = abort_requested(&self.config.abort) => Interrupted::Aborted,
            out = fut => Interrupted::Done(out),
        }
    }

    async fn step(
        &self,
        run: RunId,
        stop_rx: &mut watch::Receiver<bool>,
        attempt: &mut u32,
    ) -> Step {
        let url = {
            let state = self.state.lock();
            let request = ShapeRequest {
                offset: state.checkpoint.offset.clone(),
                handle: state.checkpoint.handle.clone(),
                live: state.up_to_date,
                cursor: state.cursor.clone(),
            };
            build_shape_url(&self.config.base_url, &self.config.shape, &request)
        };

        tracing::debug!(%url, "fetching shape");
        self.config.tracer.fetch_started(&url);
        let started = Instant::now();

        let response = match self.interruptible(stop_rx, self.client.get(&url)).await {
            Interrupted::Done(response) => response,
            Interrupted::Stopped => return Step::Stop,
            Interrupted::Aborted => return Step::Fail(SyncError::Aborted),
        };

        let response = match response {
            Ok(response) => response,
            Err(err) if err.is_retryable() => return self.backoff(stop_rx, attempt, err).await,
            Err(err) => return Step::Fail(err),
        };

        match classify_status(response.status) {
            StatusClass::Success => {
                *attempt = 0;
                self.on_success(run, response, started).await
            }
            StatusClass::Reset(reason) => {
                *attempt = 0;
                let handle = match reason {
                    ResetReason::HandleConflict => response.headers.get(HANDLE_HEADER).map(Handle::new),
                    _ => None,
                };
                self.config
                    .tracer
                    .fetch_finished(response.status, 0, started.elapsed());
                self.on_reset(run, reason, handle).await
            }
            StatusClass::Transient => {
                let err = SyncError::status(response.status, response.body_text());
                self.backoff(stop_rx, attempt, err).await
            }
            StatusClass::Fatal => Step::Fail(SyncError::status(response.status, response.body_text())),
        }
    }

    async fn backoff(
        &self,
        stop_rx: &mut watch::Receiver<bool>,
        attempt: &mut u32,
        err: SyncError,
    ) -> Step {
        *attempt += 1;
        let retry = &self.config.retry;
        if *attempt >= retry.max_attempts {
            return Step::Fail(SyncError::RetriesExhausted {
                attempts: *attempt,
                last: Box::new(err),
            });
        }

        let delay = retry.delay_for_attempt(*attempt);
        tracing::warn!(
            error = %err,
            attempt = *attempt,
            delay_ms = delay.as_millis() as u64,
            "shape request failed, retrying"
        );
        self.config.tracer.retry_scheduled(*attempt, delay);

        match self.interruptible(stop_rx, tokio::time::sleep(delay)).await {
            Interrupted::Done(()) => Step::Continue,
            Interrupted::Stopped => Step::Stop,
            Interrupted::Aborted => Step::Fail(SyncError::Aborted),
        }
    }

    async fn on_success(&self, run: RunId, response: FetchResponse, started: Instant) -> Step {
        let headers = &response.headers;

        let announced = match headers.get(SCHEMA_HEADER).map(Schema::from_header) {
            Some(Ok(schema)) => Some(schema),
            Some(Err(err)) => return Step::Fail(err.into()),
            None => None,
        };

        let mut messages = if response.status == 204 {
            vec![Message::up_to_date()]
        } else {
            let schema = announced.clone().or_else(|| self.state.lock().schema.clone());
            match decode_messages(&response.body, schema.as_ref(), self.config.parser.as_ref()) {
                Ok(messages) => messages,
                Err(err) => return Step::Fail(err.into()),
            }
        };

        if headers.contains(UP_TO_DATE_HEADER) && !messages.iter().any(Message::is_up_to_date) {
            messages.push(Message::up_to_date());
        }

        let reset_at = messages.iter().position(Message::is_must_refetch);
        if let Some(pos) = reset_at {
            messages.truncate(pos + 1);
        }

        let offset = match headers.get(OFFSET_HEADER) {
            Some(raw) => Some(Offset::new(raw)),
            None => messages.iter().rev().find_map(Message::offset).cloned(),
        };
        if offset.is_none() && messages.iter().any(|m| m.as_change().is_some()) {
            return Step::Fail(SyncError::MissingHeader(OFFSET_HEADER));
        }

        let count = messages.len();
        let up_to_date = messages.iter().any(Message::is_up_to_date);

        let (batch, advance) = {
            let state = self.state.lock();
            if !is_current(&state, run) {
                return Step::Stop;
            }

            let advance = if reset_at.is_some() {
                Advance::reset(None)
            } else {
                let mut checkpoint = state.checkpoint.clone();
                if let Some(handle) = headers.get(HANDLE_HEADER) {
                    checkpoint.handle = Some(Handle::new(handle));
                }
                if let Some(offset) = offset {
                    checkpoint.offset = offset;
                }
                Advance {
                    checkpoint,
                    cursor: headers
                        .get(CURSOR_HEADER)
                        .map(str::to_string)
                        .or_else(|| state.cursor.clone()),
                    schema: announced.or_else(|| state.schema.clone()),
                    up_to_date: state.up_to_date || up_to_date,
                    synced: up_to_date,
                }
            };
            (advance.batch(messages), advance)
        };

        self.config
            .tracer
            .fetch_finished(response.status, count, started.elapsed());

        if !batch.is_empty() {
            if let Err(err) = self.deliver(&batch).await {
                return Step::Fail(err);
            }
        }
        if !self.commit(run, advance) {
            return Step::Stop;
        }

        if reset_at.is_some() {
            tracing::info!(table = %self.config.shape.table, "server requested refetch, restarting shape");
            self.config.tracer.stream_reset("must-refetch");
            self.status.send_replace(StreamStatus::Running);
        } else if up_to_date {
            self.status.send_replace(StreamStatus::Live);
        }
        Step::Continue
    }

    async fn on_reset(&self, run: RunId, reason: ResetReason, handle: Option<Handle>) -> Step {
        if !is_current(&self.state.lock(), run) {
            return Step::Stop;
        }
        let advance = Advance::reset(handle);
        let batch = advance.batch(vec![Message::must_refetch()]);

        if let Err(err) = self.deliver(&batch).await {
            return Step::Fail(err);
        }
        if !self.commit(run, advance) {
            return Step::Stop;
        }

        let reason = match reason {
            ResetReason::MustRefetch => "must-refetch",
            ResetReason::HandleConflict => "handle-conflict",
            ResetReason::Gone => "gone",
        };
        tracing::info!(table = %self.config.shape.table, reason, "shape log reset, restarting");
        self.config.tracer.stream_reset(reason);
        self.status.send_replace(StreamStatus::Running);
        Step::Continue
    }

    async fn deliver(&self, batch: &MessageBatch) -> SyncResult<()> {
        let subscribers: Vec<Arc<dyn StreamSubscriber>> =
            self.state.lock().subscribers.values().cloned().collect();

        for subscriber in subscribers {
            subscriber.on_messages(batch).await?;
        }
        Ok(())
    }

    /// Moves the stream past a delivered batch.
    ///
    /// A batch a subscriber rejected is never committed, so a restart
    /// fetches it again.
    fn commit(&self, run: RunId, advance: Advance) -> bool {
        let mut state = self.state.lock();
        if !is_current(&state, run) {
            return false;
        }
        state.checkpoint = advance.checkpoint;
        state.cursor = advance.cursor;
        state.schema = advance.schema;
        state.up_to_date = advance.up_to_date;
        if advance.synced {
            state.last_synced_at = Some(SystemTime::now());
        }
        true
    }

    async fn finish(&self, run: RunId, outcome: Option<SyncError>) {
        let notify = {
            let mut state = self.state.lock();
            if !is_current(&state, run) {
                // Stopped from outside; a newer run may own the state now.
                return;
            }
            state.stop = None;
            state.last_error = outcome.clone();
            match &outcome {
                Some(SyncError::Aborted) | None => Vec::new(),
                Some(_) => state.subscribers.values().cloned().collect(),
            }
        };

        match &outcome {
            Some(SyncError::Aborted) | None => {
                tracing::debug!(table = %self.config.shape.table, "shape stream stopped");
            }
            Some(err) => {
                tracing::error!(table = %self.config.shape.table, error = %err, "shape stream failed");
                for subscriber in &notify {
                    subscriber.on_error(err).await;
                }
            }
        }
        self.status.send_replace(StreamStatus::Stopped);
    }
}

fn is_current(state: &StreamState, run: RunId) -> bool {
    state.run == run && state.stop.is_some()
}
