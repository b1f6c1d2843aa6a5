//! Shape definitions and request URL construction.

use crate::headers::params;
use crate::offset::{Handle, Offset};

/// A projection and filter over one table.
///
/// The same definition always addresses the same server-side log.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShapeDefinition {
    /// Table name.
    pub table: String,
    /// Optional schema/namespace of the table.
    pub namespace: Option<String>,
    /// Optional column projection. `None` selects every column.
    pub columns: Option<Vec<String>>,
    /// Optional SQL filter expression.
    pub where_clause: Option<String>,
}

impl ShapeDefinition {
    /// Creates a definition over a whole table.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            namespace: None,
            columns: None,
            where_clause: None,
        }
    }

    /// Sets the table namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Restricts the shape to the given columns.
    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Restricts the shape to rows matching `expr`.
    pub fn with_where(mut self, expr: impl Into<String>) -> Self {
        self.where_clause = Some(expr.into());
        self
    }

    /// Returns `namespace.table`, or just the table name.
    pub fn qualified_table(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}.{}", ns, self.table),
            None => self.table.clone(),
        }
    }

    /// Returns a stable key identifying this definition.
    ///
    /// Used to address persisted offsets; two definitions share a key
    /// exactly when they are equal.
    pub fn shape_key(&self) -> String {
        let columns = self
            .columns
            .as_ref()
            .map(|c| c.join(","))
            .unwrap_or_default();
        format!(
            "{}|{}|{}",
            self.qualified_table(),
            columns,
            self.where_clause.as_deref().unwrap_or("")
        )
    }
}

/// Per-request protocol state appended to a shape URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeRequest {
    /// Offset to read from.
    pub offset: Offset,
    /// Handle the offset belongs to, once known.
    pub handle: Option<Handle>,
    /// Whether the request should long-poll.
    pub live: bool,
    /// Cache-busting cursor echoed from the previous live response.
    pub cursor: Option<String>,
}

impl ShapeRequest {
    /// A request for the start of the log.
    pub fn initial() -> Self {
        Self {
            offset: Offset::before_all(),
            handle: None,
            live: false,
            cursor: None,
        }
    }
}

impl Default for ShapeRequest {
    fn default() -> Self {
        Self::initial()
    }
}

/// Builds the full request URL for `shape` at `request`.
///
/// The endpoint is `{base}/shape`; a trailing slash on `base` is ignored.
pub fn build_shape_url(base: &str, shape: &ShapeDefinition, request: &ShapeRequest) -> String {
    let mut query: Vec<(&str, String)> = vec![(params::TABLE, shape.table.clone())];

    if let Some(ns) = &shape.namespace {
        query.push((params::NAMESPACE, ns.clone()));
    }
    if let Some(columns) = &shape.columns {
        query.push((params::COLUMNS, columns.join(",")));
    }
    if let Some(expr) = &shape.where_clause {
        query.push((params::WHERE, expr.clone()));
    }

    query.push((params::OFFSET, request.offset.as_str().to_string()));

    if let Some(handle) = &request.handle {
        query.push((params::HANDLE, handle.as_str().to_string()));
    }
    if request.live {
        query.push((params::LIVE, "true".to_string()));
        if let Some(cursor) = &request.cursor {
            query.push((params::CURSOR, cursor.clone()));
        }
    }

    let encoded: Vec<String> = query
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, encode_component(&v)))
        .collect();

    format!("{}/shape?{}", base.trim_end_matches('/'), encoded.join("&"))
}

/// Percent-encodes everything outside the RFC 3986 unreserved set.
fn encode_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definition_builder() {
        let shape = ShapeDefinition::new("items")
            .with_namespace("public")
            .with_columns(["id", "title"])
            .with_where("done = false");

        assert_eq!(shape.qualified_table(), "public.items");
        assert_eq!(
            shape.columns,
            Some(vec!["id".to_string(), "title".to_string()])
        );
        assert_eq!(shape.shape_key(), "public.items|id,title|done = false");
    }

    #[test]
    fn initial_url() {
        let shape = ShapeDefinition::new("items");
        let url = build_shape_url("http://localhost:3000/v1/", &shape, &ShapeRequest::initial());
        assert_eq!(url, "http://localhost:3000/v1/shape?table=items&offset=-1");
    }

    #[test]
    fn live_url_carries_handle_and_cursor() {
        let shape = ShapeDefinition::new("items")
            .with_columns(["id", "title"])
            .with_where("title = 'a b'");
        let request = ShapeRequest {
            offset: Offset::new("10_2"),
            handle: Some(Handle::new("h-1")),
            live: true,
            cursor: Some("42".into()),
        };

        let url = build_shape_url("http://host", &shape, &request);
        assert_eq!(
            url,
            "http://host/shape?table=items&columns=id%2Ctitle&where=title%20%3D%20%27a%20b%27\
             &offset=10_2&handle=h-1&live=true&cursor=42"
        );
    }

    #[test]
    fn cursor_only_sent_when_live() {
        let request = ShapeRequest {
            cursor: Some("42".into()),
            ..ShapeRequest::initial()
        };
        let url = build_shape_url("http://host", &ShapeDefinition::new("t"), &request);
        assert!(!url.contains("cursor"));
        assert!(!url.contains("live"));
    }
}
