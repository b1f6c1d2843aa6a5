//! Shape-log messages and the JSON envelope codec.

use crate::error::{ProtocolError, ProtocolResult};
use crate::offset::Offset;
use crate::parser::ValueParser;
use crate::schema::Schema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A row: column name to value.
pub type Row = Map<String, Value>;

/// Kind of row change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// A new row entered the shape.
    Insert,
    /// An existing row changed; the value is the full post-image.
    Update,
    /// A row left the shape.
    Delete,
}

impl Operation {
    /// Wire name of the operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

/// Per-change metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeHeaders {
    /// Kind of change.
    pub operation: Operation,
    /// Source transaction id, when the server reports it.
    pub txid: Option<u64>,
}

/// One row change.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeMessage {
    /// Stable row identity, independent of primary-key values changing.
    pub key: String,
    /// Row value. Deletes may carry only the primary-key columns.
    pub value: Row,
    /// Change metadata.
    pub headers: ChangeHeaders,
    /// Log position of this change.
    pub offset: Option<Offset>,
}

impl ChangeMessage {
    /// Creates a change message.
    pub fn new(key: impl Into<String>, operation: Operation, value: Row) -> Self {
        Self {
            key: key.into(),
            value,
            headers: ChangeHeaders {
                operation,
                txid: None,
            },
            offset: None,
        }
    }

    /// Creates an insert.
    pub fn insert(key: impl Into<String>, value: Row) -> Self {
        Self::new(key, Operation::Insert, value)
    }

    /// Creates an update.
    pub fn update(key: impl Into<String>, value: Row) -> Self {
        Self::new(key, Operation::Update, value)
    }

    /// Creates a delete.
    pub fn delete(key: impl Into<String>, value: Row) -> Self {
        Self::new(key, Operation::Delete, value)
    }

    /// Sets the log position.
    pub fn with_offset(mut self, offset: impl Into<Offset>) -> Self {
        self.offset = Some(offset.into());
        self
    }

    /// Sets the source transaction id.
    pub fn with_txid(mut self, txid: u64) -> Self {
        self.headers.txid = Some(txid);
        self
    }

    /// Kind of change.
    pub fn operation(&self) -> Operation {
        self.headers.operation
    }
}

/// Control signals interleaved with changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// The log has been drained to its live tail.
    UpToDate {
        /// Server-wide LSN for cross-shape ordering, when reported.
        global_last_seen_lsn: Option<String>,
    },
    /// All local state for the shape must be discarded.
    MustRefetch,
}

impl ControlMessage {
    const UP_TO_DATE: &'static str = "up-to-date";
    const MUST_REFETCH: &'static str = "must-refetch";

    /// Wire name of the control value.
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlMessage::UpToDate { .. } => Self::UP_TO_DATE,
            ControlMessage::MustRefetch => Self::MUST_REFETCH,
        }
    }
}

/// Any entry of a shape log.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Row change.
    Change(ChangeMessage),
    /// Control signal.
    Control(ControlMessage),
}

impl Message {
    /// Up-to-date marker without an LSN.
    pub fn up_to_date() -> Self {
        Message::Control(ControlMessage::UpToDate {
            global_last_seen_lsn: None,
        })
    }

    /// Must-refetch signal.
    pub fn must_refetch() -> Self {
        Message::Control(ControlMessage::MustRefetch)
    }

    /// Returns the change, if this is one.
    pub fn as_change(&self) -> Option<&ChangeMessage> {
        match self {
            Message::Change(change) => Some(change),
            Message::Control(_) => None,
        }
    }

    /// Returns true for an up-to-date marker.
    pub fn is_up_to_date(&self) -> bool {
        matches!(self, Message::Control(ControlMessage::UpToDate { .. }))
    }

    /// Returns true for a must-refetch signal.
    pub fn is_must_refetch(&self) -> bool {
        matches!(self, Message::Control(ControlMessage::MustRefetch))
    }

    /// Log position of the message, if it carries one.
    pub fn offset(&self) -> Option<&Offset> {
        self.as_change().and_then(|c| c.offset.as_ref())
    }
}

impl From<ChangeMessage> for Message {
    fn from(change: ChangeMessage) -> Self {
        Message::Change(change)
    }
}

impl From<ControlMessage> for Message {
    fn from(control: ControlMessage) -> Self {
        Message::Control(control)
    }
}

#[derive(Deserialize)]
struct RawEnvelope {
    key: Option<String>,
    value: Option<Row>,
    #[serde(default)]
    headers: RawHeaders,
    offset: Option<String>,
}

#[derive(Default, Deserialize)]
struct RawHeaders {
    operation: Option<Operation>,
    control: Option<String>,
    txid: Option<Value>,
    global_last_seen_lsn: Option<Value>,
}

/// Decodes a response body into messages, in log order.
///
/// An empty body decodes to no messages. When `schema` is known every
/// column value with a schema entry goes through `parser`.
pub fn decode_messages(
    body: &[u8],
    schema: Option<&Schema>,
    parser: &dyn ValueParser,
) -> ProtocolResult<Vec<Message>> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }

    let envelopes: Vec<RawEnvelope> =
        serde_json::from_slice(body).map_err(|e| ProtocolError::MalformedBody(e.to_string()))?;

    envelopes
        .into_iter()
        .enumerate()
        .map(|(index, envelope)| decode_envelope(index, envelope, schema, parser))
        .collect()
}

fn decode_envelope(
    index: usize,
    envelope: RawEnvelope,
    schema: Option<&Schema>,
    parser: &dyn ValueParser,
) -> ProtocolResult<Message> {
    let headers = envelope.headers;

    if let Some(control) = headers.control {
        return match control.as_str() {
            ControlMessage::UP_TO_DATE => Ok(Message::Control(ControlMessage::UpToDate {
                global_last_seen_lsn: headers.global_last_seen_lsn.map(value_to_text),
            })),
            ControlMessage::MUST_REFETCH => Ok(Message::must_refetch()),
            _ => Err(ProtocolError::UnknownControl(control)),
        };
    }

    let key = envelope
        .key
        .ok_or_else(|| ProtocolError::invalid_message(index, "change without key"))?;
    let operation = headers
        .operation
        .ok_or_else(|| ProtocolError::invalid_message(index, "change without operation"))?;
    let txid = match headers.txid {
        None | Some(Value::Null) => None,
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.parse().ok(),
        Some(_) => return Err(ProtocolError::invalid_message(index, "txid is not numeric")),
    };

    let mut value = envelope.value.unwrap_or_default();
    if let Some(schema) = schema {
        for (column, raw) in value.iter_mut() {
            if raw.is_null() {
                continue;
            }
            if let Some(info) = schema.column(column) {
                *raw = parser.parse(raw.take(), info)?;
            }
        }
    }

    Ok(Message::Change(ChangeMessage {
        key,
        value,
        headers: ChangeHeaders { operation, txid },
        offset: envelope.offset.map(Offset::new),
    }))
}

fn value_to_text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Encodes messages into the envelope format `decode_messages` reads.
///
/// Values are written as-is; typed values are not re-stringified.
pub fn encode_messages(messages: &[Message]) -> Vec<u8> {
    let envelopes: Vec<Value> = messages.iter().map(encode_message).collect();
    Value::Array(envelopes).to_string().into_bytes()
}

fn encode_message(message: &Message) -> Value {
    match message {
        Message::Change(change) => {
            let mut headers = Map::new();
            headers.insert(
                "operation".into(),
                Value::String(change.operation().as_str().into()),
            );
            if let Some(txid) = change.headers.txid {
                headers.insert("txid".into(), Value::from(txid));
            }

            let mut envelope = Map::new();
            envelope.insert("key".into(), Value::String(change.key.clone()));
            envelope.insert("value".into(), Value::Object(change.value.clone()));
            envelope.insert("headers".into(), Value::Object(headers));
            if let Some(offset) = &change.offset {
                envelope.insert("offset".into(), Value::String(offset.as_str().into()));
            }
            Value::Object(envelope)
        }
        Message::Control(control) => {
            let mut headers = Map::new();
            headers.insert("control".into(), Value::String(control.as_str().into()));
            if let ControlMessage::UpToDate {
                global_last_seen_lsn: Some(lsn),
            } = control
            {
                headers.insert("global_last_seen_lsn".into(), Value::String(lsn.clone()));
            }

            let mut envelope = Map::new();
            envelope.insert("headers".into(), Value::Object(headers));
            Value::Object(envelope)
        }
    }
}
