//! Streaming ingestion: the time-windowed micro-batcher and the file
//! connectors that feed the ingestion queue.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub mod backpressure;
pub mod batcher;
pub mod bulk;
pub mod checkpoint;
pub mod source;
pub mod tailer;

pub use backpressure::{BackpressureConfig, BackpressureController};
pub use batcher::{StreamingBatcher, StreamingBatcherConfig};
pub use bulk::{BulkConnectorConfig, BulkLoader};
pub use source::{ChannelStreamSource, NdjsonFileSource, StreamSource};
pub use tailer::{FileTailer, StreamingConnectorConfig};
