//! # ShapeSync Protocol
//!
//! Wire types for the shape-log replication protocol.
//!
//! This crate provides:
//! - `Offset` and `Handle`, the opaque log coordinates
//! - `ShapeDefinition` and request URL construction
//! - `Message` (changes and control signals) and the JSON envelope codec
//! - `Schema` and typed value parsing
//! - Response header names and status classification
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod headers;
mod messages;
mod offset;
mod parser;
mod schema;
mod shape;

pub use error::{ProtocolError, ProtocolResult};
pub use headers::{
    classify_status, params, strip_proxy_headers, Headers, ResetReason, StatusClass,
    CURSOR_HEADER, HANDLE_HEADER, OFFSET_HEADER, PROXY_STRIPPED_HEADERS, SCHEMA_HEADER,
    UP_TO_DATE_HEADER,
};
pub use messages::{
    decode_messages, encode_messages, ChangeHeaders, ChangeMessage, ControlMessage, Message,
    Operation, Row,
};
pub use offset::{Handle, LogPosition, Offset};
pub use parser::{parse_pg_array, PgValueParser, RawValueParser, ValueParser};
pub use schema::{ColumnInfo, Schema};
pub use shape::{build_shape_url, ShapeDefinition, ShapeRequest};
