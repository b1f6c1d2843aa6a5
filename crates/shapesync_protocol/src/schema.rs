//! Column schema announced by the server.
//!
//! The first response of a log carries the full column list in the
//! `electric-schema` header as a JSON object keyed by column name:
//!
//! ```json
//! {"id": {"type": "int4", "pk_index": 0}, "tags": {"type": "text", "dims": 1}}
//! ```

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Type information for one column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    /// Postgres type name (`int4`, `text`, `jsonb`, ...).
    #[serde(rename = "type")]
    pub type_name: String,
    /// Array dimensions; zero for scalars.
    #[serde(default)]
    pub dims: u32,
    /// Position within the primary key, if the column is part of it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pk_index: Option<u32>,
    /// Whether the column is declared NOT NULL.
    #[serde(default)]
    pub not_null: bool,
}

impl ColumnInfo {
    /// Creates scalar column info.
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            dims: 0,
            pk_index: None,
            not_null: false,
        }
    }

    /// Marks the column as part of the primary key.
    pub fn primary_key(mut self, index: u32) -> Self {
        self.pk_index = Some(index);
        self.not_null = true;
        self
    }

    /// Declares the column as an array with `dims` dimensions.
    pub fn array(mut self, dims: u32) -> Self {
        self.dims = dims;
        self
    }
}

/// Column name to type information.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema(BTreeMap<String, ColumnInfo>);

impl Schema {
    /// Creates an empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes the schema header.
    pub fn from_header(raw: &str) -> ProtocolResult<Self> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::InvalidSchema(e.to_string()))
    }

    /// Adds a column.
    pub fn with_column(mut self, name: impl Into<String>, info: ColumnInfo) -> Self {
        self.0.insert(name.into(), info);
        self
    }

    /// Looks up a column.
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.0.get(name)
    }

    /// Iterates columns in name order.
    pub fn columns(&self) -> impl Iterator<Item = (&str, &ColumnInfo)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Primary-key columns ordered by key position.
    pub fn primary_key(&self) -> Vec<&str> {
        let mut pk: Vec<(u32, &str)> = self
            .0
            .iter()
            .filter_map(|(name, info)| info.pk_index.map(|i| (i, name.as_str())))
            .collect();
        pk.sort_unstable();
        pk.into_iter().map(|(_, name)| name).collect()
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if no columns are known.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
