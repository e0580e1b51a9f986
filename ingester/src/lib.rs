//! The ingestion core: validates requests, stages them into the spool,
//! materializes staged batches as immutable partitions and manifest
//! versions, and runs the job queue workers that drive it all.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub mod cache;
pub mod events;
pub mod job;
pub mod processor;
pub mod queue;
pub mod staging_queue;

pub use job::{ErrorKind, IngestError, IngestOutcome, JobFailure, JobPayload, WatermarkUpdate};
pub use processor::IngestionProcessor;
pub use queue::{EnqueueOutcome, InlineJobQueue, JobQueue, MemoryJobQueue, QueueError};
pub use staging_queue::{StageBackend, StagingQueueError, StagingWriteManager};
