//! The per-dataset staging spool.
//!
//! Each dataset buffers incoming batches in an embedded SQLite database
//! (`<root>/<sanitized-slug>/staging.db`, WAL journal mode) until the flush
//! policy decides to materialize them as immutable partitions. The spool
//! owns staged rows until a flush is finalized.
//!
//! A dataset's spool is strictly single-writer: an in-process async mutex
//! serializes tasks, and a `staging.lock` file guards against a second
//! process. Connections are opened per operation inside the critical
//! section and closed on exit, which keeps file handles bounded and lets
//! SQLite compact the WAL on last close.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use data_types::Timestamp;
use snafu::Snafu;
use std::path::PathBuf;

pub mod flush_policy;
mod lock;
mod manager;

pub use flush_policy::{FlushPolicy, FlushTrigger};
pub use manager::{
    AbortSummary, FlushPreparation, PreparedBatch, SpoolConfig, SpoolManager,
    StagePartitionRequest, StageOutcome, StagingBatchMeta, StalenessListener,
};

/// Errors surfaced by spool operations.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("sqlx error: {source}"))]
    Sqlx { source: sqlx::Error },

    #[snafu(display("spool database corrupted: {reason}"))]
    Corruption { reason: String },

    #[snafu(display("timed out waiting for staging lock {}", path.display()))]
    LockTimeout { path: PathBuf },

    #[snafu(display("spool I/O error: {source}"))]
    Io { source: std::io::Error },

    #[snafu(display(
        "staging table {table} column {column} is {existing} but the batch requires {requested}"
    ))]
    SchemaDrift {
        table: String,
        column: String,
        existing: String,
        requested: String,
    },

    #[snafu(display("row cannot be staged: {reason}"))]
    InvalidRow { reason: String },

    #[snafu(display("{what} {value:?} is not a valid identifier"))]
    InvalidIdentifier { what: &'static str, value: String },

    #[snafu(display("exporting staged batch: {source}"))]
    Export {
        source: partition_file::serialize::SerializeError,
    },
}

impl Error {
    /// Whether a retry of the failed operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Sqlx { .. } | Self::Io { .. } | Self::LockTimeout { .. }
        )
    }

    /// Whether the error indicates unrecoverable schema drift inside the
    /// staging database.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::SchemaDrift { .. })
    }
}

/// A specialized `Result` for spool errors.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Aggregate state of one dataset's spool, the input to the flush policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatasetSummary {
    /// Batches staged and not part of an in-flight flush.
    pub pending_batch_count: i64,
    /// Rows across those batches.
    pub pending_row_count: i64,
    /// Batches currently marked by a flush token.
    pub flushing_batch_count: i64,
    /// When the oldest pending batch was staged.
    pub oldest_staged_at: Option<Timestamp>,
    /// Bytes the staging database (plus WAL) occupies on disk.
    pub on_disk_bytes: i64,
}
