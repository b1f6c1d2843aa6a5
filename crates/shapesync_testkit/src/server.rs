//! In-process shape-log server.
//!
//! [`LogServer`] implements [`FetchClient`] directly, so a stream can be
//! pointed at it without any networking. It keeps one table, appends every
//! mutation to a log, pages the log out in the wire format and long-polls
//! live requests until the next mutation.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use shapesync_engine::{FetchClient, FetchResponse, SyncError, SyncResult};
use shapesync_protocol::{
    params, ChangeMessage, Handle, Message, Offset, Operation, Row, Schema, CURSOR_HEADER,
    HANDLE_HEADER, OFFSET_HEADER, SCHEMA_HEADER, UP_TO_DATE_HEADER,
};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tokio::sync::Notify;

/// Scripted failure served before the next real response.
#[derive(Debug, Clone)]
pub enum Fault {
    /// Respond with this status and an empty body.
    Status(u16),
    /// Fail the request as a retryable transport error.
    Disconnect,
}

struct LogEntry {
    lsn: u64,
    change: ChangeMessage,
}

struct ServerState {
    generation: u64,
    handle: Handle,
    mismatch_status: u16,
    log: Vec<LogEntry>,
    rows: BTreeMap<String, Row>,
    next_lsn: u64,
    cursor: u64,
    faults: VecDeque<Fault>,
    requests: Vec<String>,
}

impl ServerState {
    fn append(&mut self, key: String, operation: Operation, value: Row) -> Offset {
        self.next_lsn += 1;
        let offset = lsn_offset(self.next_lsn);
        let change = ChangeMessage::new(key, operation, value).with_offset(offset.clone());
        self.log.push(LogEntry {
            lsn: self.next_lsn,
            change,
        });
        offset
    }

    /// Starts a new log incarnation holding the current rows as inserts.
    fn rotate(&mut self, mismatch_status: u16) {
        self.generation += 1;
        self.handle = Handle::new(format!("handle-{}", self.generation));
        self.mismatch_status = mismatch_status;
        self.log.clear();
        self.next_lsn = 0;

        let rows: Vec<(String, Row)> = self
            .rows
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (key, row) in rows {
            self.append(key, Operation::Insert, row);
        }
    }
}

/// An in-memory shape-log server for one table.
pub struct LogServer {
    table: String,
    primary_key: String,
    schema: Schema,
    page_size: usize,
    live_timeout: Duration,
    state: Mutex<ServerState>,
    changed: Notify,
}

impl LogServer {
    /// Creates a server for `table` keyed by `primary_key`.
    ///
    /// Row values are served in the Postgres text encoding described by
    /// `schema`, so clients exercise their value parser.
    pub fn new(table: impl Into<String>, primary_key: impl Into<String>, schema: Schema) -> Self {
        Self {
            table: table.into(),
            primary_key: primary_key.into(),
            schema,
            page_size: 100,
            live_timeout: Duration::from_millis(200),
            state: Mutex::new(ServerState {
                generation: 1,
                handle: Handle::new("handle-1"),
                mismatch_status: 409,
                log: Vec::new(),
                rows: BTreeMap::new(),
                next_lsn: 0,
                cursor: 0,
                faults: VecDeque::new(),
                requests: Vec::new(),
            }),
            changed: Notify::new(),
        }
    }

    /// Sets the maximum number of changes per response.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Sets how long live requests wait for a change before answering 204.
    pub fn with_live_timeout(mut self, timeout: Duration) -> Self {
        self.live_timeout = timeout;
        self
    }

    /// Inserts a row.
    pub fn insert(&self, row: Row) -> Offset {
        self.mutate(Operation::Insert, row)
    }

    /// Updates a row with the given columns.
    ///
    /// The log records the full post-image of the row.
    pub fn update(&self, row: Row) -> Offset {
        self.mutate(Operation::Update, row)
    }

    /// Deletes the row with the primary key found in `row`.
    pub fn delete(&self, row: Row) -> Offset {
        self.mutate(Operation::Delete, row)
    }

    fn mutate(&self, operation: Operation, row: Row) -> Offset {
        let key = self.row_key(&row);
        let offset = {
            let mut state = self.state.lock();
            let value = match operation {
                Operation::Insert => {
                    state.rows.insert(key.clone(), row.clone());
                    row
                }
                Operation::Update => {
                    let current = state.rows.entry(key.clone()).or_default();
                    for (column, value) in row {
                        current.insert(column, value);
                    }
                    current.clone()
                }
                Operation::Delete => {
                    state.rows.remove(&key);
                    row
                }
            };
            state.append(key, operation, value)
        };
        self.changed.notify_waiters();
        offset
    }

    /// Compacts the log under a new handle; stale handles get 409.
    pub fn rotate_handle(&self) -> Handle {
        self.rotate(409)
    }

    /// Discards the log under a new handle; stale handles get 410.
    pub fn expire_handle(&self) -> Handle {
        self.rotate(410)
    }

    fn rotate(&self, mismatch_status: u16) -> Handle {
        let handle = {
            let mut state = self.state.lock();
            state.rotate(mismatch_status);
            state.handle.clone()
        };
        self.changed.notify_waiters();
        handle
    }

    /// Serves `fault` in place of the next response.
    pub fn inject(&self, fault: Fault) {
        self.state.lock().faults.push_back(fault);
    }

    /// Current log handle.
    pub fn handle(&self) -> Handle {
        self.state.lock().handle.clone()
    }

    /// Current table contents keyed by row key.
    pub fn rows(&self) -> BTreeMap<String, Row> {
        self.state.lock().rows.clone()
    }

    /// URLs requested so far.
    pub fn requests(&self) -> Vec<String> {
        self.state.lock().requests.clone()
    }

    /// Row key of `row`, in the `"public"."table"/"pk"` form.
    pub fn row_key(&self, row: &Row) -> String {
        let pk = match row.get(&self.primary_key) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        };
        format!("\"public\".\"{}\"/\"{}\"", self.table, pk)
    }

    fn respond(&self, query: &BTreeMap<String, String>) -> SyncResult<Option<FetchResponse>> {
        let mut state = self.state.lock();

        if let Some(fault) = state.faults.pop_front() {
            return match fault {
                Fault::Status(status) => Ok(Some(FetchResponse::new(status))),
                Fault::Disconnect => Err(SyncError::transport_retryable("connection reset by test server")),
            };
        }

        if query.get(params::TABLE) != Some(&self.table) {
            return Ok(Some(FetchResponse::new(400).with_body("unknown table")));
        }

        let offset = Offset::new(
            query
                .get(params::OFFSET)
                .cloned()
                .unwrap_or_else(|| Offset::BEFORE_ALL.to_string()),
        );
        let handle = query.get(params::HANDLE).map(|h| Handle::new(h.as_str()));
        let live = query.get(params::LIVE).map(String::as_str) == Some("true");

        if let Some(handle) = handle {
            if handle != state.handle {
                let mut response = FetchResponse::new(state.mismatch_status);
                if state.mismatch_status == 409 {
                    response = response.with_header(HANDLE_HEADER, state.handle.as_str());
                }
                return Ok(Some(response));
            }
        } else if !offset.is_before_all() {
            return Ok(Some(FetchResponse::new(400).with_body("offset without handle")));
        }

        let after = match offset.position() {
            Some(position) => position.tx,
            None if offset.is_before_all() => 0,
            None => return Ok(Some(FetchResponse::new(400).with_body("invalid offset"))),
        };

        let pending: Vec<&LogEntry> = state.log.iter().filter(|e| e.lsn > after).collect();
        if pending.is_empty() && live {
            // Long-poll.
            return Ok(None);
        }

        let page: Vec<Message> = pending
            .iter()
            .take(self.page_size)
            .map(|e| Message::Change(self.encode_change(&e.change)))
            .collect();
        let drained = pending.len() <= self.page_size;
        let last = pending
            .iter()
            .take(self.page_size)
            .last()
            .map(|e| lsn_offset(e.lsn))
            .unwrap_or_else(|| {
                if offset.is_before_all() {
                    lsn_offset(0)
                } else {
                    offset.clone()
                }
            });

        let mut messages = page;
        if drained {
            messages.push(Message::up_to_date());
        }

        let mut response = FetchResponse::ok(&messages)
            .with_header(HANDLE_HEADER, state.handle.as_str())
            .with_header(OFFSET_HEADER, last.as_str());
        if !live {
            let schema = serde_json::to_string(&self.schema).unwrap_or_default();
            response = response.with_header(SCHEMA_HEADER, schema);
        }
        if drained {
            response = response.with_header(UP_TO_DATE_HEADER, "");
        }
        if live {
            state.cursor += 1;
            response = response.with_header(CURSOR_HEADER, state.cursor.to_string());
        }
        Ok(Some(response))
    }

    fn encode_change(&self, change: &ChangeMessage) -> ChangeMessage {
        let mut encoded = change.clone();
        for value in encoded.value.values_mut() {
            *value = to_pg_text(value.take());
        }
        encoded
    }
}

#[async_trait]
impl FetchClient for LogServer {
    async fn get(&self, url: &str) -> SyncResult<FetchResponse> {
        self.state.lock().requests.push(url.to_string());
        let query = parse_query(url);

        // Registered before the log is inspected so no mutation is missed.
        let wait = self.changed.notified();

        if let Some(response) = self.respond(&query)? {
            return Ok(response);
        }

        let _ = tokio::time::timeout(self.live_timeout, wait).await;
        match self.respond(&query)? {
            Some(response) => Ok(response),
            None => Ok(FetchResponse::new(204)),
        }
    }
}

fn lsn_offset(lsn: u64) -> Offset {
    Offset::new(format!("{lsn}_0"))
}

/// Renders a typed value the way Postgres prints it.
fn to_pg_text(value: Value) -> Value {
    match value {
        Value::Null | Value::String(_) => value,
        Value::Bool(b) => Value::String(if b { "t" } else { "f" }.to_string()),
        other => Value::String(other.to_string()),
    }
}

fn parse_query(url: &str) -> BTreeMap<String, String> {
    let query = url.split_once('?').map(|(_, q)| q).unwrap_or("");
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (decode_component(k), decode_component(v)),
            None => (decode_component(pair), String::new()),
        })
        .collect()
}

fn decode_component(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(byte) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
