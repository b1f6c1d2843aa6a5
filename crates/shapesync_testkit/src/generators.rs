//! Property-based test generators using proptest.
//!
//! Logs are generated over a small key space so that inserts, updates and
//! deletes of the same row interleave often.

use crate::fixtures::todo;
use proptest::prelude::*;
use shapesync_protocol::{ChangeMessage, Handle, Message, Offset};
use shapesync_engine::MessageBatch;
use std::collections::BTreeMap;

/// One mutation of the fixture table.
#[derive(Debug, Clone, PartialEq)]
pub enum LogOp {
    /// Insert or replace a row.
    Insert(i64, String),
    /// Replace the title of a row.
    Update(i64, String),
    /// Delete a row.
    Delete(i64),
}

impl LogOp {
    /// Row id the operation touches.
    pub fn id(&self) -> i64 {
        match self {
            LogOp::Insert(id, _) | LogOp::Update(id, _) | LogOp::Delete(id) => *id,
        }
    }
}

/// Strategy for generating row titles.
pub fn title_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z ]{0,11}").expect("Invalid regex")
}

/// Strategy for generating one operation on ids `1..=max_id`.
pub fn log_op_strategy(max_id: i64) -> impl Strategy<Value = LogOp> {
    let id = 1..=max_id;
    prop_oneof![
        3 => (id.clone(), title_strategy()).prop_map(|(id, t)| LogOp::Insert(id, t)),
        2 => (id.clone(), title_strategy()).prop_map(|(id, t)| LogOp::Update(id, t)),
        1 => id.prop_map(LogOp::Delete),
    ]
}

/// Strategy for generating a log of up to `max_len` operations.
///
/// Updates may target rows that are absent at that point; they carry the
/// full row and must land like inserts.
pub fn log_strategy(max_len: usize) -> impl Strategy<Value = Vec<LogOp>> {
    prop::collection::vec(log_op_strategy(8), 0..=max_len)
}

/// Strategy for generating offsets, including the sentinel.
pub fn offset_strategy() -> impl Strategy<Value = Offset> {
    prop_oneof![
        1 => Just(Offset::before_all()),
        8 => (0u64..1_000_000, 0u64..64).prop_map(|(tx, op)| Offset::new(format!("{tx}_{op}"))),
    ]
}

/// Row key of a fixture row id.
pub fn todo_key(id: i64) -> String {
    format!("\"public\".\"todos\"/\"{id}\"")
}

/// Converts a log into change messages with increasing offsets.
///
/// Updates carry the full row, so replaying the log is idempotent.
pub fn log_messages(ops: &[LogOp]) -> Vec<Message> {
    ops.iter()
        .enumerate()
        .map(|(i, op)| {
            let offset = format!("{}_0", i + 1);
            let change = match op {
                LogOp::Insert(id, title) => ChangeMessage::insert(todo_key(*id), todo(*id, title)),
                LogOp::Update(id, title) => ChangeMessage::update(todo_key(*id), todo(*id, title)),
                LogOp::Delete(id) => ChangeMessage::delete(todo_key(*id), todo(*id, "")),
            };
            Message::Change(change.with_offset(offset.as_str()))
        })
        .collect()
}

/// Splits messages into batches at the given cut points.
pub fn batches(messages: &[Message], cuts: &[usize]) -> Vec<MessageBatch> {
    let mut points: Vec<usize> = cuts.iter().map(|c| c % (messages.len() + 1)).collect();
    points.push(0);
    points.push(messages.len());
    points.sort_unstable();
    points.dedup();

    points
        .windows(2)
        .map(|w| {
            let chunk = messages[w[0]..w[1]].to_vec();
            let offset = chunk
                .iter()
                .rev()
                .find_map(Message::offset)
                .cloned()
                .unwrap_or_default();
            MessageBatch {
                messages: chunk,
                handle: Some(Handle::new("handle-1")),
                offset,
            }
        })
        .collect()
}

/// Expected table contents after applying `ops`, as id to title.
pub fn model(ops: &[LogOp]) -> BTreeMap<i64, String> {
    let mut rows = BTreeMap::new();
    for op in ops {
        match op {
            LogOp::Insert(id, title) | LogOp::Update(id, title) => {
                rows.insert(*id, title.clone());
            }
            LogOp::Delete(id) => {
                rows.remove(id);
            }
        }
    }
    rows
}
