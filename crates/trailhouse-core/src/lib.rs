//! # trailhouse-core
//!
//! Core abstractions for the trailhouse audit-log ingestion pipeline:
//!
//! - **Storage contract**: object-storage trait with conditional writes,
//!   paginated listing, batched deletes and a best-effort purge window
//! - **Error taxonomy**: structured errors with an explicit retryable class
//! - **Prefix resolution**: region extraction from audit-log layouts
//! - **Observability**: logging initialization and span helpers
//!
//! ## Crate Boundary
//!
//! `trailhouse-core` holds the shared primitives only; all job logic lives
//! in `trailhouse-ingest`.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod object_backend;
pub mod observability;
pub mod prefix;
pub mod storage;

pub use error::{Error, Result};
pub use object_backend::ObjectStoreBackend;
pub use prefix::SourcePrefix;
pub use storage::{
    DELETE_BATCH_LIMIT, ListPage, MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition,
    WriteResult, list_all,
};
