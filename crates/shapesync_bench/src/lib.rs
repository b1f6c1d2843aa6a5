//! Benchmark utilities.

use rand::Rng;
use serde_json::json;
use shapesync_engine::MessageBatch;
use shapesync_protocol::{ChangeMessage, ColumnInfo, Handle, Message, Offset, Row, Schema};

/// Generate a random lowercase title of `len` characters.
pub fn random_title(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len).map(|_| rng.gen_range(b'a'..=b'z') as char).collect()
}

/// Schema of the benchmark table.
pub fn bench_schema() -> Schema {
    Schema::new()
        .with_column("id", ColumnInfo::new("int8").primary_key(0))
        .with_column("title", ColumnInfo::new("text"))
        .with_column("score", ColumnInfo::new("float8"))
        .with_column("done", ColumnInfo::new("bool"))
}

fn text_row(id: u64, title: String) -> Row {
    let value = json!({
        "id": id.to_string(),
        "title": title,
        "score": format!("{}.5", id % 100),
        "done": if id % 2 == 0 { "t" } else { "f" },
    });
    match value {
        serde_json::Value::Object(row) => row,
        _ => Row::new(),
    }
}

/// Generate `count` changes as the server sends them, with text values.
///
/// Ids cycle over `key_space`, so larger logs update existing rows.
pub fn change_log(count: usize, key_space: u64) -> Vec<Message> {
    (0..count as u64)
        .map(|i| {
            let id = i % key_space.max(1);
            let key = format!("\"public\".\"items\"/\"{id}\"");
            let change = if i < key_space {
                ChangeMessage::insert(key, text_row(id, random_title(16)))
            } else {
                ChangeMessage::update(key, text_row(id, random_title(16)))
            };
            change.with_offset(format!("{}_0", i + 1).as_str()).into()
        })
        .collect()
}

/// Wrap messages in one batch ending at the last message offset.
pub fn batch_of(messages: Vec<Message>) -> MessageBatch {
    let offset = messages
        .iter()
        .rev()
        .find_map(Message::offset)
        .cloned()
        .unwrap_or_default();
    MessageBatch {
        messages,
        handle: Some(Handle::new("bench")),
        offset,
    }
}

/// Offset with the given transaction number.
pub fn offset(tx: u64) -> Offset {
    Offset::new(format!("{tx}_0"))
}
