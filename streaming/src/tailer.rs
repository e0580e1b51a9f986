//! The streaming file tailer: polls an append-only file of JSON envelopes
//! and feeds the ingestion queue.

use crate::{
    backpressure::BackpressureController,
    checkpoint::{CheckpointStore, DedupeCache, TailerCheckpoint},
};
use backoff::{Backoff, BackoffConfig};
use data_types::ingest::IngestionRequest;
use ingester::{JobPayload, JobQueue, QueueError};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, sync::Arc, time::Duration};
use thiserror::Error;
use timestore_time::TimeProvider;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_dedupe_ttl_ms() -> u64 {
    300_000
}

/// Configuration of one file tailer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingConnectorConfig {
    /// Identity of the connector.
    pub connector_id: String,
    /// The append-only file to tail.
    pub path: PathBuf,
    /// Where the checkpoint lives.
    pub checkpoint_path: PathBuf,
    /// Where invalid lines go.
    pub dlq_path: PathBuf,
    /// How often the file is polled.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Whether a first run starts at the beginning of the file; otherwise
    /// it seeks to the end and only consumes new lines.
    #[serde(default)]
    pub start_at_oldest: bool,
    /// How long idempotency keys are remembered for dedup.
    #[serde(default = "default_dedupe_ttl_ms")]
    pub dedupe_ttl_ms: u64,
}

/// One line of the tailed file.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct Envelope {
    /// Producer-side offset, persisted opaquely in the checkpoint.
    offset: serde_json::Value,
    /// Key deduplicating re-read lines; falls back to the ingestion's own
    /// key.
    #[serde(default)]
    idempotency_key: Option<String>,
    /// The ingestion to enqueue.
    ingestion: IngestionRequest,
}

/// Counters of one poll iteration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollStats {
    /// Envelopes enqueued.
    pub enqueued: usize,
    /// Invalid lines sent to the DLQ.
    pub dead_lettered: usize,
    /// Lines skipped by the dedupe cache.
    pub skipped_duplicates: usize,
}

/// Errors of the tailer's own plumbing (the tailed file being absent is not
/// an error; it simply yields nothing).
#[derive(Debug, Error)]
pub enum TailerError {
    /// Reading or writing tailer state failed.
    #[error("tailer I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Polls an append-only file and enqueues each valid envelope exactly once.
#[derive(Debug)]
pub struct FileTailer {
    config: StreamingConnectorConfig,
    queue: Arc<dyn JobQueue>,
    backpressure: BackpressureController,
    time_provider: Arc<dyn TimeProvider>,
    enqueue_backoff: BackoffConfig,

    checkpoints: CheckpointStore,
    last_line: u64,
    last_offset: Option<serde_json::Value>,
    dedupe: DedupeCache,
    initialized: bool,
}

impl FileTailer {
    /// Create a tailer; state is restored from the checkpoint on the first
    /// poll.
    pub fn new(
        config: StreamingConnectorConfig,
        queue: Arc<dyn JobQueue>,
        backpressure: BackpressureController,
        time_provider: Arc<dyn TimeProvider>,
        enqueue_backoff: BackoffConfig,
    ) -> Self {
        let checkpoints = CheckpointStore::new(&config.checkpoint_path);
        let dedupe = DedupeCache::new(Duration::from_millis(config.dedupe_ttl_ms.max(1)));
        Self {
            config,
            queue,
            backpressure,
            time_provider,
            enqueue_backoff,
            checkpoints,
            last_line: 0,
            last_offset: None,
            dedupe,
            initialized: false,
        }
    }

    /// Poll until shutdown, pausing while the queue is saturated.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(connector=%self.config.connector_id, path=%self.config.path.display(), "file tailer started");
        loop {
            self.backpressure.wait_until_clear(&shutdown).await;
            if shutdown.is_cancelled() {
                break;
            }

            match self.poll_once().await {
                Ok(stats) if stats != PollStats::default() => {
                    info!(
                        connector=%self.config.connector_id,
                        enqueued = stats.enqueued,
                        dead_lettered = stats.dead_lettered,
                        skipped = stats.skipped_duplicates,
                        "poll complete",
                    );
                }
                Ok(_) => {}
                Err(e) => warn!(connector=%self.config.connector_id, %e, "poll failed"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_millis(self.config.poll_interval_ms.max(1))) => {}
            }
        }
        info!(connector=%self.config.connector_id, "file tailer stopped");
    }

    async fn initialize(&mut self) -> Result<(), TailerError> {
        let now = self.time_provider.now();
        match self.checkpoints.load().await? {
            Some(checkpoint) => {
                self.last_line = checkpoint.last_line;
                self.last_offset = checkpoint.last_offset;
                self.dedupe = DedupeCache::from_entries(
                    Duration::from_millis(self.config.dedupe_ttl_ms.max(1)),
                    &checkpoint.dedupe,
                    now,
                );
            }
            None if !self.config.start_at_oldest => {
                // no checkpoint and not starting at the oldest record: seek
                // to the end of whatever already exists
                self.last_line = match tokio::fs::read_to_string(&self.config.path).await {
                    Ok(content) => content.lines().count() as u64,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
                    Err(e) => return Err(e.into()),
                };
            }
            None => {}
        }
        self.initialized = true;
        Ok(())
    }

    /// Read any new lines and enqueue their envelopes. Stops early (without
    /// consuming the line) when the queue keeps rejecting retryably, so the
    /// next poll resumes there.
    pub async fn poll_once(&mut self) -> Result<PollStats, TailerError> {
        if !self.initialized {
            self.initialize().await?;
        }

        let content = match tokio::fs::read_to_string(&self.config.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(PollStats::default()),
            Err(e) => return Err(e.into()),
        };

        let mut stats = PollStats::default();
        let now = self.time_provider.now();

        for (line_number, line) in content
            .lines()
            .enumerate()
            .skip(self.last_line as usize)
        {
            if line.trim().is_empty() {
                self.last_line = line_number as u64 + 1;
                continue;
            }

            match serde_json::from_str::<Envelope>(line) {
                Err(e) => {
                    self.dead_letter(line_number as u64 + 1, line, &e.to_string())
                        .await?;
                    stats.dead_lettered += 1;
                    self.last_line = line_number as u64 + 1;
                }
                Ok(envelope) => {
                    let mut ingestion = envelope.ingestion;
                    if ingestion.idempotency_key.is_none() {
                        ingestion.idempotency_key = envelope.idempotency_key.clone();
                    }

                    if let Some(key) = ingestion.idempotency_key.clone() {
                        if !self.dedupe.observe(&key, now) {
                            stats.skipped_duplicates += 1;
                            self.last_line = line_number as u64 + 1;
                            self.last_offset = Some(envelope.offset);
                            continue;
                        }
                    }

                    if !self.enqueue_with_retry(ingestion).await {
                        // queue is saturated; resume at this line next poll
                        break;
                    }
                    stats.enqueued += 1;
                    self.last_line = line_number as u64 + 1;
                    self.last_offset = Some(envelope.offset);
                }
            }
        }

        self.dedupe.prune(now);
        self.checkpoints
            .save(&TailerCheckpoint {
                last_line: self.last_line,
                last_offset: self.last_offset.clone(),
                dedupe: self.dedupe.to_entries(),
            })
            .await?;
        Ok(stats)
    }

    /// Enqueue with a bounded retry loop. Returns `false` when the queue
    /// kept rejecting retryably; permanent job failures are logged and
    /// count as consumed.
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
                        "envelope rejected permanently; dropping",
                    );
                    return true;
                }
                Err(e) => {
                    if attempt == max_attempts {
                        warn!(
                            connector=%self.config.connector_id,
                            %e,
                            attempts = attempt,
                            "enqueue still failing; backing off until the next poll",
                        );
                        return false;
                    }
                    tokio::time::sleep(backoff.next()).await;
                }
            }
        }
        false
    }

    async fn dead_letter(
        &self,
        line_number: u64,
        raw: &str,
        error: &str,
    ) -> Result<(), TailerError> {
        if let Some(parent) = self.config.dlq_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let entry = serde_json::json!({
            "connectorId": self.config.connector_id,
            "line": line_number,
            "raw": raw,
            "error": error,
        });
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.config.dlq_path)
            .await?;
        file.write_all(format!("{entry}\n").as_bytes()).await?;
        warn!(
            connector=%self.config.connector_id,
            line = line_number,
            error,
            "invalid line sent to DLQ",
        );
        Ok(())
    }
}
