//! Materialized, in-memory view of a shape.

use crate::error::{SyncError, SyncResult};
use crate::offset_store::Checkpoint;
use crate::stream::{MessageBatch, ShapeStream, StreamStatus, StreamSubscriber, SubscriptionId};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use shapesync_protocol::{Message, Operation, Row};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;

/// Rows of a shape keyed by row key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShapeView {
    rows: BTreeMap<String, Row>,
    checkpoint: Checkpoint,
    up_to_date: bool,
}

impl ShapeView {
    /// Creates an empty view.
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one batch in log order.
    ///
    /// Inserts and updates store the received row as the full row value.
    /// Deletes remove it and must-refetch empties the view.
    pub fn apply(&mut self, batch: &MessageBatch) {
        for message in &batch.messages {
            match message {
                Message::Change(change) => match change.operation() {
                    Operation::Insert | Operation::Update => {
                        self.rows.insert(change.key.clone(), change.value.clone());
                    }
                    Operation::Delete => {
                        self.rows.remove(&change.key);
                    }
                },
                message if message.is_must_refetch() => {
                    self.rows.clear();
                    self.up_to_date = false;
                }
                message if message.is_up_to_date() => self.up_to_date = true,
                Message::Control(_) => {}
            }
        }
        self.checkpoint = batch.checkpoint();
    }

    /// All rows.
    pub fn rows(&self) -> &BTreeMap<String, Row> {
        &self.rows
    }

    /// One row by key.
    pub fn get(&self, key: &str) -> Option<&Row> {
        self.rows.get(key)
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if the view holds no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Checkpoint of the last applied batch.
    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    /// Returns true if the last applied batch left the view up to date.
    pub fn is_up_to_date(&self) -> bool {
        self.up_to_date
    }
}

/// Identifier returned by [`Shape::subscribe`].
pub type ListenerId = u64;

type Listener = Arc<dyn Fn(&ShapeView) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    entries: BTreeMap<ListenerId, Listener>,
    next: ListenerId,
}

struct ViewUpdater {
    view: Arc<RwLock<ShapeView>>,
    listeners: Arc<Mutex<Listeners>>,
    synced: watch::Sender<bool>,
}

#[async_trait]
impl StreamSubscriber for ViewUpdater {
    async fn on_messages(&self, batch: &MessageBatch) -> SyncResult<()> {
        let up_to_date = {
            let mut view = self.view.write();
            view.apply(batch);
            view.is_up_to_date()
        };
        if up_to_date {
            self.synced.send_if_modified(|synced| !std::mem::replace(synced, true));
        }

        let listeners: Vec<Listener> = self.listeners.lock().entries.values().cloned().collect();
        let view = self.view.read();
        for listener in listeners {
            listener(&view);
        }
        Ok(())
    }
}

/// A shape kept in memory and updated from its stream.
///
/// Creating a `Shape` subscribes to the stream, which starts it. When the
/// last listener unsubscribes the shape detaches from the stream; the
/// stream stops only if no other subscriber remains.
pub struct Shape {
    stream: ShapeStream,
    subscription: SubscriptionId,
    view: Arc<RwLock<ShapeView>>,
    listeners: Arc<Mutex<Listeners>>,
    synced: watch::Receiver<bool>,
}

impl Shape {
    /// Attaches a view to `stream`.
    pub fn new(stream: ShapeStream) -> Self {
        let view = Arc::new(RwLock::new(ShapeView::new()));
        let listeners = Arc::new(Mutex::new(Listeners {
            entries: BTreeMap::new(),
            next: 1,
        }));
        let (synced_tx, synced) = watch::channel(false);

        let subscription = stream.subscribe(Arc::new(ViewUpdater {
            view: Arc::clone(&view),
            listeners: Arc::clone(&listeners),
            synced: synced_tx,
        }));

        Self {
            stream,
            subscription,
            view,
            listeners,
            synced,
        }
    }

    /// The underlying stream.
    pub fn stream(&self) -> &ShapeStream {
        &self.stream
    }

    /// Snapshot of all rows.
    pub fn rows(&self) -> BTreeMap<String, Row> {
        self.view.read().rows().clone()
    }

    /// One row by key.
    pub fn get(&self, key: &str) -> Option<Row> {
        self.view.read().get(key).cloned()
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.view.read().len()
    }

    /// Returns true if the shape holds no rows.
    pub fn is_empty(&self) -> bool {
        self.view.read().is_empty()
    }

    /// Snapshot of the whole view.
    pub fn view(&self) -> ShapeView {
        self.view.read().clone()
    }

    /// Checkpoint of the last applied batch.
    pub fn checkpoint(&self) -> Checkpoint {
        self.view.read().checkpoint().clone()
    }

    /// Returns true if the view is currently up to date.
    pub fn is_up_to_date(&self) -> bool {
        self.view.read().is_up_to_date()
    }

    /// Calls `listener` with the view after every applied batch.
    ///
    /// The listener runs on the stream task while the view is read-locked;
    /// it must not block.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ShapeView) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.lock();
        let id = listeners.next;
        listeners.next += 1;
        listeners.entries.insert(id, Arc::new(listener));
        id
    }

    /// Removes a listener. Removing the last one detaches the shape from
    /// its stream.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let (removed, now_empty) = {
            let mut listeners = self.listeners.lock();
            let removed = listeners.entries.remove(&id).is_some();
            (removed, listeners.entries.is_empty())
        };
        if removed && now_empty {
            self.stream.release(self.subscription);
        }
        removed
    }

    /// Number of listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().entries.len()
    }

    /// Resolves once the shape has been up to date at least once.
    ///
    /// Fails if the stream stops first.
    pub async fn synced(&self) -> SyncResult<()> {
        let mut synced = self.synced.clone();
        let mut status = self.stream.status_changes();

        loop {
            if *synced.borrow_and_update() {
                return Ok(());
            }
            if *status.borrow_and_update() == StreamStatus::Stopped {
                return Err(self.stream.last_error().unwrap_or_else(|| {
                    SyncError::Stopped("stream stopped before the shape synced".to_string())
                }));
            }

            tokio::select! {
                changed = synced.changed() => {
                    if changed.is_err() {
                        return Err(SyncError::Stopped("shape view detached".to_string()));
                    }
                }
                _ = status.changed() => {}
            }
        }
    }
}

impl std::fmt::Debug for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shape")
            .field("stream", &self.stream)
            .field("rows", &self.len())
            .field("listeners", &self.listener_count())
            .finish()
    }
}
