//! Response headers, query parameters and status classification.

use std::collections::BTreeMap;

/// Header carrying the current log handle.
pub const HANDLE_HEADER: &str = "electric-handle";
/// Header carrying the offset of the last message in the response.
pub const OFFSET_HEADER: &str = "electric-offset";
/// Header carrying the JSON column schema.
pub const SCHEMA_HEADER: &str = "electric-schema";
/// Header carrying the live-mode cache-busting cursor.
pub const CURSOR_HEADER: &str = "electric-cursor";
/// Header present when the response reaches the live tail.
pub const UP_TO_DATE_HEADER: &str = "electric-up-to-date";

/// Query parameter names.
pub mod params {
    /// Table name.
    pub const TABLE: &str = "table";
    /// Table namespace.
    pub const NAMESPACE: &str = "namespace";
    /// Column projection.
    pub const COLUMNS: &str = "columns";
    /// Row filter.
    pub const WHERE: &str = "where";
    /// Log offset.
    pub const OFFSET: &str = "offset";
    /// Log handle.
    pub const HANDLE: &str = "handle";
    /// Long-poll switch.
    pub const LIVE: &str = "live";
    /// Live cursor.
    pub const CURSOR: &str = "cursor";
}

/// Headers a relaying proxy must drop when re-wrapping a response body.
///
/// Keeping them after the body was decompressed or re-chunked makes the
/// declared encoding disagree with the bytes and breaks client decoding.
pub const PROXY_STRIPPED_HEADERS: [&str; 2] = ["content-encoding", "content-length"];

/// Case-insensitive response header map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    /// Creates an empty header map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a header, replacing any previous value.
    pub fn insert(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.0
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    /// Looks up a header.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Removes a header, returning its value.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.0.remove(&name.to_ascii_lowercase())
    }

    /// Returns true if the header is present.
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(&name.to_ascii_lowercase())
    }

    /// Iterates over `(name, value)` pairs with lowercase names.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of headers.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if there are no headers.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}

/// Removes the headers listed in [`PROXY_STRIPPED_HEADERS`].
pub fn strip_proxy_headers(headers: &mut Headers) {
    for name in PROXY_STRIPPED_HEADERS {
        headers.remove(name);
    }
}

/// Why a log had to be resynchronised from scratch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetReason {
    /// The server sent a `must-refetch` control message.
    MustRefetch,
    /// 409: the handle is no longer valid for this shape.
    HandleConflict,
    /// 410: the log is gone.
    Gone,
}

/// How the client reacts to a response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// 2xx: decode the body.
    Success,
    /// 409/410: discard state and restart from the beginning.
    Reset(ResetReason),
    /// 408, 429, 5xx: retry with backoff.
    Transient,
    /// Anything else: the stream cannot continue.
    Fatal,
}

/// Classifies an HTTP status code.
pub fn classify_status(status: u16) -> StatusClass {
    match status {
        200..=299 => StatusClass::Success,
        409 => StatusClass::Reset(ResetReason::HandleConflict),
        410 => StatusClass::Reset(ResetReason::Gone),
        408 | 429 | 500..=599 => StatusClass::Transient,
        _ => StatusClass::Fatal,
    }
}
