//! The streaming micro-batcher: time-windows an event stream into bounded
//! ingestion batches.
//!
//! Records are routed to an open buffer identified by `(window, chunk)`. A
//! buffer seals when it reaches `max_rows_per_partition` (a new chunk opens
//! for the same window) or when `max_batch_latency_ms` elapses since the
//! buffer was created. Sealed buffers flush as ingestion jobs whose
//! idempotency key derives from `(connector, window, chunk)`, so replaying
//! the same events converges on the same manifest rows.

use crate::source::StreamSource;
use data_types::ingest::{
    row_timestamp, IngestionRequest, PartitionDescriptor, Row, SchemaDescriptor, TimeRange,
};
use ingester::{EnqueueOutcome, JobPayload, JobQueue, QueueError, WatermarkUpdate};
use metric::{Metric, U64Counter};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use timestore_time::{Time, TimeProvider};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How often the run loop checks buffer deadlines.
const TICK_INTERVAL: Duration = Duration::from_millis(100);

fn default_retry_delay_ms() -> u64 {
    5_000
}

/// Configuration of one micro-batcher (one per connector).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingBatcherConfig {
    /// Identity of the connector; part of every idempotency key.
    pub connector_id: String,
    /// Topic the connector subscribes to.
    pub topic: String,
    /// Consumer group of the subscription.
    pub group_id: String,
    /// Dataset the windows are ingested into.
    pub dataset_slug: String,
    /// Human-readable dataset name for first-ingest creation.
    #[serde(default)]
    pub dataset_name: Option<String>,
    /// Logical table of the rows.
    #[serde(default)]
    pub table_name: Option<String>,
    /// Schema of the incoming records.
    pub schema: SchemaDescriptor,
    /// The record field carrying the event time.
    pub time_field: String,
    /// Window width; record times are floored to multiples of this.
    pub window_seconds: i64,
    /// A buffer seals once it holds this many rows.
    pub max_rows_per_partition: usize,
    /// A buffer seals once it is this old.
    pub max_batch_latency_ms: u64,
    /// Static partition key entries, extended with `window` and `chunk`.
    #[serde(default)]
    pub partition_key: BTreeMap<String, String>,
    /// Static partition attributes, extended per flush.
    #[serde(default)]
    pub partition_attributes: BTreeMap<String, String>,
    /// Whether a fresh subscription starts from the earliest retained
    /// record rather than the stream tail.
    #[serde(default)]
    pub start_from_earliest: bool,
    /// Delay before a transiently failed flush is retried.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

/// Errors handling a single record.
#[derive(Debug, Error)]
pub enum BatcherError {
    /// The record has no parseable value in the configured time field.
    #[error("record has no usable {field:?} time field")]
    MissingTime {
        /// The configured time field.
        field: String,
    },
}

#[derive(Debug)]
struct Buffer {
    rows: Vec<Row>,
    created_at: Time,
    /// Set while the buffer waits out a transient flush failure.
    retry_not_before: Option<Time>,
}

#[derive(Debug, Default)]
struct WindowState {
    next_chunk_index: u32,
    active_chunk_index: Option<u32>,
    flushing_chunks: HashSet<u32>,
    buffers: HashMap<u32, Buffer>,
}

impl WindowState {
    fn is_empty(&self) -> bool {
        self.active_chunk_index.is_none() && self.flushing_chunks.is_empty()
            && self.buffers.is_empty()
    }
}

#[derive(Debug, Default)]
struct BatcherState {
    windows: BTreeMap<i64, WindowState>,
}

/// One sealed chunk on its way to the queue.
#[derive(Debug)]
struct SealedChunk {
    window_start_secs: i64,
    chunk_index: u32,
    rows: Vec<Row>,
    reason: &'static str,
}

/// Turns an event stream into bounded, replay-safe ingestion batches.
pub struct StreamingBatcher {
    config: StreamingBatcherConfig,
    queue: Arc<dyn JobQueue>,
    time_provider: Arc<dyn TimeProvider>,
    state: Mutex<BatcherState>,

    flush_counter: Metric<U64Counter>,
    dropped_counter: U64Counter,
}

impl std::fmt::Debug for StreamingBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingBatcher")
            .field("connector_id", &self.config.connector_id)
            .finish_non_exhaustive()
    }
}

impl StreamingBatcher {
    /// Create a batcher flushing into `queue`.
    pub fn new(
        config: StreamingBatcherConfig,
        queue: Arc<dyn JobQueue>,
        time_provider: Arc<dyn TimeProvider>,
        metrics: &metric::Registry,
    ) -> Self {
        let flush_counter = metrics.register_metric(
            "streaming_flush_count",
            "sealed buffers flushed, by seal reason",
        );
        let dropped_counter = metrics
            .register_metric::<U64Counter>(
                "streaming_dropped_buffers",
                "buffers dropped after a permanent flush failure",
            )
            .recorder(&[("connector", config.connector_id.as_str())]);
        Self {
            config,
            queue,
            time_provider,
            state: Default::default(),
            flush_counter,
            dropped_counter,
        }
    }

    /// Consume `source` until it ends or `shutdown` fires, flushing every
    /// remaining buffer on the way out.
    pub async fn run(&self, mut source: Box<dyn StreamSource>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.flush_all("shutdown").await;
                    info!(connector=%self.config.connector_id, "batcher stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
                record = source.next_record() => match record {
                    Some(row) => {
                        if let Err(e) = self.handle_record(row).await {
                            warn!(connector=%self.config.connector_id, %e, "dropped record");
                        }
                    }
                    None => {
                        self.flush_all("stream-end").await;
                        info!(connector=%self.config.connector_id, "stream ended");
                        return;
                    }
                },
            }
        }
    }

    /// Route one record into its window buffer, flushing the buffer if it
    /// reached the row bound.
    pub async fn handle_record(&self, row: Row) -> Result<(), BatcherError> {
        let ts = row_timestamp(&row, &self.config.time_field).ok_or_else(|| {
            BatcherError::MissingTime {
                field: self.config.time_field.clone(),
            }
        })?;

        let window_seconds = self.config.window_seconds.max(1);
        let window_start_secs =
            ts.to_time().timestamp_secs().div_euclid(window_seconds) * window_seconds;
        let now = self.time_provider.now();

        let sealed = {
            let mut state = self.state.lock();
            let window = state.windows.entry(window_start_secs).or_default();

            let chunk_index = match window.active_chunk_index {
                Some(chunk_index) => chunk_index,
                None => {
                    let chunk_index = window.next_chunk_index;
                    window.next_chunk_index += 1;
                    window.active_chunk_index = Some(chunk_index);
                    window.buffers.insert(
                        chunk_index,
                        Buffer {
                            rows: Vec::new(),
                            created_at: now,
                            retry_not_before: None,
                        },
                    );
                    chunk_index
                }
            };

            let buffer = window
                .buffers
                .get_mut(&chunk_index)
                .expect("active chunk always has a buffer");
            buffer.rows.push(row);

            if buffer.rows.len() >= self.config.max_rows_per_partition.max(1) {
                // seal; the next record for this window opens a new chunk
                window.active_chunk_index = None;
                window.flushing_chunks.insert(chunk_index);
                let buffer = window
                    .buffers
                    .remove(&chunk_index)
                    .expect("sealed chunk has a buffer");
                Some(SealedChunk {
                    window_start_secs,
                    chunk_index,
                    rows: buffer.rows,
                    reason: "rows",
                })
            } else {
                None
            }
        };

        if let Some(sealed) = sealed {
            self.flush_chunk(sealed).await;
        }
        Ok(())
    }

    /// Seal and flush buffers whose latency deadline or retry delay
    /// elapsed. Driven by the run loop; tests call it directly.
    pub async fn tick(&self) {
        let now = self.time_provider.now();
        let latency = Duration::from_millis(self.config.max_batch_latency_ms.max(1));

        let due = {
            let mut state = self.state.lock();
            let mut due = Vec::new();
            for (&window_start_secs, window) in state.windows.iter_mut() {
                // latency sealing of the open buffer
                if let Some(chunk_index) = window.active_chunk_index {
                    let expired = window
                        .buffers
                        .get(&chunk_index)
                        .and_then(|b| now.checked_duration_since(b.created_at))
                        .map(|age| age >= latency)
                        .unwrap_or(false);
                    if expired {
                        window.active_chunk_index = None;
                        window.flushing_chunks.insert(chunk_index);
                        let buffer = window
                            .buffers
                            .remove(&chunk_index)
                            .expect("active chunk always has a buffer");
                        due.push(SealedChunk {
                            window_start_secs,
                            chunk_index,
                            rows: buffer.rows,
                            reason: "latency",
                        });
                    }
                }

                // retry-pending buffers whose delay elapsed
                let retry_due: Vec<u32> = window
                    .buffers
                    .iter()
                    .filter(|(_, b)| b.retry_not_before.map(|t| now >= t).unwrap_or(false))
                    .map(|(&chunk_index, _)| chunk_index)
                    .collect();
                for chunk_index in retry_due {
                    let buffer = window
                        .buffers
                        .remove(&chunk_index)
                        .expect("retry chunk has a buffer");
                    due.push(SealedChunk {
                        window_start_secs,
                        chunk_index,
                        rows: buffer.rows,
                        reason: "retry",
                    });
                }
            }
            due
        };

        for sealed in due {
            self.flush_chunk(sealed).await;
        }
    }

    /// Flush every non-empty buffer, even those below their thresholds.
    pub async fn flush_all(&self, reason: &'static str) {
        let due = {
            let mut state = self.state.lock();
            let mut due = Vec::new();
            for (&window_start_secs, window) in state.windows.iter_mut() {
                window.active_chunk_index = None;
                let chunks: Vec<u32> = window.buffers.keys().copied().collect();
                for chunk_index in chunks {
                    let buffer = window
                        .buffers
                        .remove(&chunk_index)
                        .expect("chunk listed from buffers");
                    if buffer.rows.is_empty() {
                        continue;
                    }
                    window.flushing_chunks.insert(chunk_index);
                    due.push(SealedChunk {
                        window_start_secs,
                        chunk_index,
                        rows: buffer.rows,
                        reason,
                    });
                }
            }
            state.windows.retain(|_, w| !w.is_empty());
            due
        };

        for sealed in due {
            self.flush_chunk(sealed).await;
        }
    }

    /// Pending (unflushed) rows across all windows, for introspection.
    pub fn pending_rows(&self) -> usize {
        let state = self.state.lock();
        state
            .windows
            .values()
            .flat_map(|w| w.buffers.values())
            .map(|b| b.rows.len())
            .sum()
    }

    async fn flush_chunk(&self, sealed: SealedChunk) {
        let SealedChunk {
            window_start_secs,
            chunk_index,
            mut rows,
            reason,
        } = sealed;

        // records within a chunk are flushed in event-time order
        rows.sort_by_key(|row| {
            row_timestamp(row, &self.config.time_field)
                .map(|t| t.get())
                .unwrap_or(i64::MIN)
        });

        let window_start = Time::from_timestamp_secs(window_start_secs);
        let window_end =
            window_start + Duration::from_secs(self.config.window_seconds.max(1) as u64);
        let row_count = rows.len();

        let payload = self.build_payload(window_start, window_end, chunk_index, reason, rows);
        let idempotency_key = match &payload {
            JobPayload::StreamingWindow { ingestion, .. } => {
                ingestion.idempotency_key.clone().unwrap_or_default()
            }
            _ => String::new(),
        };

        match self.queue.enqueue(payload.clone()).await {
            Ok(outcome) => {
                self.flush_counter.recorder(&[("reason", reason)]).inc(1);
                debug!(
                    connector=%self.config.connector_id,
                    window=%window_start,
                    chunk=chunk_index,
                    rows=row_count,
                    reason,
                    duplicate=matches!(outcome, EnqueueOutcome::Duplicate { .. }),
                    "flushed window chunk",
                );
                self.mark_done(window_start_secs, chunk_index);
            }
            Err(QueueError::Job { failure }) if !failure.retryable => {
                // a poisoned chunk cannot succeed by waiting; drop it so the
                // window can drain
                error!(
                    connector=%self.config.connector_id,
                    window=%window_start,
                    chunk=chunk_index,
                    %failure,
                    "dropping chunk after permanent flush failure",
                );
                self.dropped_counter.inc(1);
                self.mark_done(window_start_secs, chunk_index);
            }
            Err(e) => {
                let retry_at = self.time_provider.now()
                    + Duration::from_millis(self.config.retry_delay_ms.max(1));
                warn!(
                    connector=%self.config.connector_id,
                    window=%window_start,
                    chunk=chunk_index,
                    idempotency_key=%idempotency_key,
                    %e,
                    retry_at=%retry_at,
                    "flush failed transiently; retry pending",
                );
                let rows = match payload {
                    JobPayload::StreamingWindow { ingestion, .. } => ingestion.rows,
                    _ => unreachable!("batcher only builds streaming-window payloads"),
                };
                let mut state = self.state.lock();
                let window = state.windows.entry(window_start_secs).or_default();
                window.buffers.insert(
                    chunk_index,
                    Buffer {
                        rows,
                        created_at: retry_at,
                        retry_not_before: Some(retry_at),
                    },
                );
            }
        }
    }

    fn mark_done(&self, window_start_secs: i64, chunk_index: u32) {
        let mut state = self.state.lock();
        let drained = match state.windows.get_mut(&window_start_secs) {
            Some(window) => {
                window.flushing_chunks.remove(&chunk_index);
                window.is_empty()
            }
            None => false,
        };
        // the window state is removed once nothing is open or in flight
        if drained {
            state.windows.remove(&window_start_secs);
        }
    }

    fn build_payload(
        &self,
        window_start: Time,
        window_end: Time,
        chunk_index: u32,
        reason: &'static str,
        rows: Vec<Row>,
    ) -> JobPayload {
        let window_start_iso = window_start.to_rfc3339();
        let window_end_iso = window_end.to_rfc3339();

        let mut key = self.config.partition_key.clone();
        key.insert("window".to_string(), window_start_iso.clone());
        key.insert("chunk".to_string(), chunk_index.to_string());

        let mut attributes = self.config.partition_attributes.clone();
        attributes.insert("window_end".to_string(), window_end_iso.clone());
        attributes.insert("chunk".to_string(), chunk_index.to_string());
        attributes.insert("flush_reason".to_string(), reason.to_string());

        let record_count = rows.len() as i64;
        let ingestion = IngestionRequest {
            dataset_slug: self.config.dataset_slug.clone(),
            dataset_name: self.config.dataset_name.clone(),
            storage_target_id: None,
            table_name: self.config.table_name.clone(),
            schema: self.config.schema.clone(),
            partition: PartitionDescriptor {
                key,
                attributes,
                time_range: TimeRange {
                    start: window_start_iso.clone(),
                    end: window_end_iso,
                },
            },
            rows,
            // replays of the same window chunk converge on the same manifest
            idempotency_key: Some(format!(
                "{}:{}:{}",
                self.config.connector_id, window_start_iso, chunk_index
            )),
            actor: None,
            received_at: Some(self.time_provider.now().to_rfc3339()),
        };

        JobPayload::StreamingWindow {
            ingestion,
            watermark: WatermarkUpdate {
                connector_id: self.config.connector_id.clone(),
                sealed_through: data_types::Timestamp::from_time(window_end),
                records_processed: record_count,
            },
        }
    }
}
