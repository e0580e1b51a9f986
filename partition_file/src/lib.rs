//! Writing immutable columnar partition files.
//!
//! Rows are serialized to self-describing parquet (the file carries its own
//! schema) and handed to a storage backend that makes them visible
//! atomically: local files are written to a scratch name and renamed, object
//! stores rely on the atomicity of `put`.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub mod serialize;
pub mod storage;

pub use storage::{
    driver_for_target, LocalFileDriver, ObjectStoreDriver, StorageDriver, StorageError,
    WritePartitionRequest, WrittenPartition,
};
