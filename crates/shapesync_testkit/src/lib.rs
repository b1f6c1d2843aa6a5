//! # ShapeSync Testkit
//!
//! Test utilities for ShapeSync.
//!
//! This crate provides:
//! - Test fixtures: a file-backed local database, fixture rows and
//!   polling helpers
//! - `LogServer`, an in-process shape-log server implementing `FetchClient`
//! - Property-based test generators using proptest
//! - `init_tracing` for readable test logs
//!
//! ## Usage
//!
//! ```rust,ignore
//! use shapesync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn replicates() {
//!     let server = todos_server();
//!     server.insert(todo(1, "write tests"));
//!
//!     let shape = Shape::new(todos_stream(&server));
//!     shape.synced().await.unwrap();
//!     assert_eq!(shape.len(), 1);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod server;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::server::*;
    pub use shapesync_engine::Shape;
}

pub use fixtures::*;
pub use generators::*;
pub use server::*;
