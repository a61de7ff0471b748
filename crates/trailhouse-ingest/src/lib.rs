//! # trailhouse-ingest
//!
//! Audit-event ingestion-and-retention job. One invocation processes a
//! single resolved source prefix: reads the raw audit-log batches under
//! it, normalizes them into partition-ready rows, commits them to the
//! `cloudtrail_events` table, reclaims the processed source objects
//! under a derived retention window, and runs table housekeeping.
//!
//! Pipeline modules, in program order: [`config`] → [`reader`] →
//! [`normalize`] → [`partition`] → [`table`] → [`purge`] →
//! [`maintenance`], wired by [`run`].

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod maintenance;
pub mod normalize;
pub mod partition;
pub mod purge;
pub mod reader;
pub mod run;
pub mod schema;
pub mod table;

pub use config::JobConfig;
pub use run::{IngestionJob, JobReport};
