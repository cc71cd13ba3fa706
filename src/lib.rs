//! Wildboar pipeline — camera-trap image ingestion, classification and query API.

pub mod api;
pub mod classify;
pub mod config;
pub mod error;
pub mod ingest;
pub mod mailbox;
pub mod model;
pub mod process;
pub mod schedule;
pub mod stats;
pub mod store;
