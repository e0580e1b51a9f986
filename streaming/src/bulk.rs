//! The bulk loader: watches a directory for files describing one large
//! ingestion each, splits them into bounded chunks, and enqueues the
//! chunks with deterministic idempotency keys.

use crate::backpressure::BackpressureController;
use backoff::{Backoff, BackoffConfig};
use data_types::ingest::Row;
use data_types::ingest::IngestionRequest;
use glob::Pattern;
use ingester::{JobPayload, JobQueue, QueueError};
use serde::{Deserialize, Serialize};
use std::{path::{Path, PathBuf}, sync::Arc, time::Duration};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

fn default_poll_interval_ms() -> u64 {
    5_000
}

/// What happens to a bulk file once all its chunks were enqueued.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OnSuccess {
    /// Rename to `<name>.done`.
    #[default]
    Rename,
    /// Delete the file.
    Delete,
}

/// Configuration of one bulk loader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkConnectorConfig {
    /// Identity of the connector.
    pub connector_id: String,
    /// Directory watched for bulk files.
    pub directory: PathBuf,
    /// Glob the file names must match, e.g. `*.json`.
    pub pattern: String,
    /// How often the directory is scanned.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// What to do with a fully enqueued file.
    #[serde(default)]
    pub on_success: OnSuccess,
}

/// The content of one bulk file.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct BulkFile {
    /// The ingestion template; its `rows` are ignored in favour of the
    /// file-level rows.
    ingestion: IngestionRequest,
    /// All rows of the load.
    rows: Vec<Row>,
    /// Rows per ingestion job.
    chunk_size: usize,
    /// Chunk idempotency keys are `<idempotencyBase>:<chunkIndex>`.
    idempotency_base: String,
}

/// Counters of one directory scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    /// Files fully enqueued.
    pub files_loaded: usize,
    /// Ingestion jobs enqueued.
    pub chunks_enqueued: usize,
    /// Files set aside as unparseable.
    pub files_rejected: usize,
}

/// Errors of the loader's own plumbing.
#[derive(Debug, Error)]
pub enum BulkError {
    /// The configured glob does not parse.
    #[error("invalid bulk file pattern {pattern:?}: {source}")]
    Pattern {
        /// The offending pattern.
        pattern: String,
        /// The glob error.
        source: glob::PatternError,
    },

    /// Reading or renaming files failed.
    #[error("bulk loader I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Watches a directory and turns each matching file into ingestion jobs.
#[derive(Debug)]
pub struct BulkLoader {
    config: BulkConnectorConfig,
    pattern: Pattern,
    queue: Arc<dyn JobQueue>,
    backpressure: BackpressureController,
    enqueue_backoff: BackoffConfig,
}

impl BulkLoader {
    /// Create a loader; fails if the glob pattern is invalid.
    pub fn new(
        config: BulkConnectorConfig,
        queue: Arc<dyn JobQueue>,
        backpressure: BackpressureController,
        enqueue_backoff: BackoffConfig,
    ) -> Result<Self, BulkError> {
        let pattern = Pattern::new(&config.pattern).map_err(|source| BulkError::Pattern {
            pattern: config.pattern.clone(),
            source,
        })?;
        Ok(Self {
            config,
            pattern,
            queue,
            backpressure,
            enqueue_backoff,
        })
    }

    /// Scan until shutdown, pausing while the queue is saturated.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            connector=%self.config.connector_id,
            directory=%self.config.directory.display(),
            pattern=%self.config.pattern,
            "bulk loader started",
        );
        loop {
            self.backpressure.wait_until_clear(&shutdown).await;
            if shutdown.is_cancelled() {
                break;
            }

            match self.scan_once().await {
                Ok(stats) if stats != ScanStats::default() => {
                    info!(
                        connector=%self.config.connector_id,
                        files = stats.files_loaded,
                        chunks = stats.chunks_enqueued,
                        rejected = stats.files_rejected,
                        "scan complete",
                    );
                }
                Ok(_) => {}
                Err(e) => warn!(connector=%self.config.connector_id, %e, "scan failed"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_millis(self.config.poll_interval_ms.max(1))) => {}
            }
        }
        info!(connector=%self.config.connector_id, "bulk loader stopped");
    }

    /// Process every matching file currently in the directory.
    pub async fn scan_once(&self) -> Result<ScanStats, BulkError> {
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.config.directory).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ScanStats::default())
            }
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if self.pattern.matches(&name) {
                names.push(name);
            }
        }
        names.sort();

        let mut stats = ScanStats::default();
        for name in names {
            let path = self.config.directory.join(&name);
            match self.load_file(&path).await? {
                FileOutcome::Loaded { chunks } => {
                    stats.files_loaded += 1;
                    stats.chunks_enqueued += chunks;
                    match self.config.on_success {
                        OnSuccess::Rename => {
                            let done = self.config.directory.join(format!("{name}.done"));
                            tokio::fs::rename(&path, &done).await?;
                        }
                        OnSuccess::Delete => {
                            tokio::fs::remove_file(&path).await?;
                        }
                    }
                }
                FileOutcome::Rejected => {
                    stats.files_rejected += 1;
                    let error = self.config.directory.join(format!("{name}.error"));
                    tokio::fs::rename(&path, &error).await?;
                }
                FileOutcome::QueueSaturated => break,
            }
        }
        Ok(stats)
    }

    async fn load_file(&self, path: &Path) -> Result<FileOutcome, BulkError> {
        let raw = tokio::fs::read_to_string(path).await?;
        let file: BulkFile = match serde_json::from_str(&raw) {
            Ok(file) => file,
            Err(e) => {
                warn!(
                    connector=%self.config.connector_id,
                    path=%path.display(),
                    %e,
                    "bulk file does not parse; setting it aside",
                );
                return Ok(FileOutcome::Rejected);
            }
        };

        let chunk_size = file.chunk_size.max(1);
        let chunk_count = (file.rows.len() + chunk_size - 1) / chunk_size;
        for (index, chunk) in file.rows.chunks(chunk_size).enumerate() {
            let mut ingestion = file.ingestion.clone();
            ingestion.rows = chunk.to_vec();
            ingestion.idempotency_key = Some(format!("{}:{index}", file.idempotency_base));

            if !self.enqueue_with_retry(ingestion).await {
                // already-enqueued chunks are safe to re-enqueue next scan
                // thanks to their deterministic keys
                return Ok(FileOutcome::QueueSaturated);
            }
        }

        info!(
            connector=%self.config.connector_id,
            path=%path.display(),
            rows = file.rows.len(),
            chunks = chunk_count,
            "bulk file enqueued",
        );
        Ok(FileOutcome::Loaded {
            chunks: chunk_count,
        })
    }

    async fn enqueue_with_retry(&self, ingestion: IngestionRequest) -> bool {
        let mut backoff = Backoff::new(&self.enqueue_backoff);
        let max_attempts = self.enqueue_backoff.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            match self
                .queue
                .enqueue(JobPayload::Ingest {
                    ingestion: ingestion.clone(),
                })
                .await
            {
                Ok(_) => return true,
                Err(QueueError::Job { failure }) if !failure.retryable => {
                    warn!(
                        connector=%self.config.connector_id,
                        %failure,
                        "bulk chunk rejected permanently; dropping",
                    );
                    return true;
                }
                Err(e) => {
                    if attempt == max_attempts {
                        warn!(
                            connector=%self.config.connector_id,
                            %e,
                            attempts = attempt,
                            "enqueue still failing; leaving the file for the next scan",
                        );
                        return false;
                    }
                    tokio::time::sleep(backoff.next()).await;
                }
            }
        }
        false
    }
}

enum FileOutcome {
    Loaded { chunks: usize },
    Rejected,
    QueueSaturated,
}
