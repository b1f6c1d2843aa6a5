//! # ShapeSync Engine
//!
//! Client-side replication of Postgres shape logs.
//!
//! This crate provides:
//! - `ShapeStream`, the fetch loop that follows one shape log from an
//!   initial snapshot into live long-polling
//! - `Shape`, an in-memory materialized view over a stream
//! - `match_stream`, waiting for a specific change to arrive
//! - `ApplyPipeline`, which writes batches into a local table through the
//!   transaction coordinator
//! - Checkpoint persistence (`OffsetStore`)
//! - Retry with exponential backoff
//! - HTTP client abstraction (`FetchClient`)
//!
//! ## Architecture
//!
//! ```text
//!  FetchClient ──▶ ShapeStream ──▶ StreamSubscriber
//!                      │              ├── Shape (in memory)
//!                      │              ├── ApplyPipeline ──▶ DatabaseAdapter
//!                      │              └── match_stream
//!                      └── checkpoint (handle, offset)
//! ```
//!
//! ## Key Invariants
//!
//! - Batches are delivered whole and in log order
//! - The next request is only sent after every subscriber accepted the
//!   previous batch
//! - A reset (must-refetch, 409, 410) is delivered as a must-refetch batch
//!   and the stream restarts from offset `-1`
//! - An applied batch and its checkpoint commit in the same transaction

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod apply;
mod config;
mod error;
mod matcher;
mod offset_store;
mod shape;
mod signal;
mod stream;
mod transport;

pub use apply::ApplyPipeline;
pub use config::{ApplyConfig, RetryConfig, ShapeStreamConfig};
pub use error::{SyncError, SyncResult};
pub use matcher::match_stream;
pub use offset_store::{
    Checkpoint, CoordinatorOffsetStore, MemoryOffsetStore, OffsetStore, DEFAULT_OFFSET_TABLE,
};
pub use shape::{ListenerId, Shape, ShapeView};
pub use signal::{AbortController, AbortSignal};
pub use stream::{
    FnSubscriber, MessageBatch, ShapeStream, StreamStatus, StreamSubscriber, SubscriptionId,
};
pub use transport::{FetchClient, FetchResponse, MockFetchClient, MockReply};
