//! The Timestore catalog: versioned dataset metadata.
//!
//! Datasets, storage targets, schema versions, manifests and their
//! partitions, ingestion-batch idempotency records and streaming watermarks
//! all live here. Two backends are provided: an in-memory implementation
//! used by tests and inline deployments, and a Postgres implementation for
//! production.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub mod interface;
pub mod mem;
pub mod postgres;

/// Name under which the system default storage target is registered.
pub const DEFAULT_STORAGE_TARGET_NAME: &str = "default";
