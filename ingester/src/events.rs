//! Events published after catalog state changes.

use async_trait::async_trait;
use data_types::{DatasetId, ManifestId, PartitionId, SchemaVersionId, StorageTargetId, Timestamp};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt::Debug};
use thiserror::Error;
use tracing::info;

/// Payload of `partition.created`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionCreated {
    /// The dataset the partition belongs to.
    pub dataset_id: DatasetId,
    /// Its slug.
    pub dataset_slug: String,
    /// The manifest that owns the partition.
    pub manifest_id: ManifestId,
    /// The partition.
    pub partition_id: PartitionId,
    /// Caller-facing partition key.
    pub partition_key: BTreeMap<String, String>,
    /// Where the file was written.
    pub storage_target_id: StorageTargetId,
    /// Path within the storage target.
    pub file_path: String,
    /// Rows in the file.
    pub row_count: i64,
    /// Size of the file.
    pub file_size_bytes: i64,
    /// Content hash of the file.
    pub checksum: Option<String>,
    /// When the rows were received upstream, if known.
    pub received_at: Option<Timestamp>,
}

/// Payload of `schema.evolved`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaEvolved {
    /// The dataset whose schema evolved.
    pub dataset_id: DatasetId,
    /// Its slug.
    pub dataset_slug: String,
    /// The manifest published with the new schema.
    pub manifest_id: ManifestId,
    /// The manifest it evolved from.
    pub previous_manifest_id: Option<ManifestId>,
    /// The new schema version.
    pub schema_version_id: SchemaVersionId,
    /// Names of the added columns.
    pub added_columns: Vec<String>,
}

/// Payload of `schema.backfill.requested`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaBackfillRequested {
    /// The evolution this backfill belongs to.
    #[serde(flatten)]
    pub evolution: SchemaEvolved,
    /// Per-column defaults for pre-existing rows; `null` when none was
    /// supplied.
    pub defaults: BTreeMap<String, serde_json::Value>,
}

/// Payload of `streaming.watermark.updated`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingWatermarkUpdated {
    /// The connector whose watermark advanced.
    pub connector_id: String,
    /// The dataset it feeds.
    pub dataset_id: DatasetId,
    /// Its slug.
    pub dataset_slug: String,
    /// The sealed-through position.
    pub sealed_through: Timestamp,
    /// How far behind real time the connector was.
    pub backlog_lag_ms: i64,
}

/// An event published to the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Event {
    /// A partition was created.
    PartitionCreated(PartitionCreated),
    /// A dataset schema evolved additively.
    SchemaEvolved(SchemaEvolved),
    /// A caller requested a backfill for an additive evolution.
    SchemaBackfillRequested(SchemaBackfillRequested),
    /// A streaming watermark advanced.
    StreamingWatermarkUpdated(StreamingWatermarkUpdated),
}

impl Event {
    /// The topic the event is published under.
    pub fn topic(&self) -> &'static str {
        match self {
            Self::PartitionCreated(_) => "partition.created",
            Self::SchemaEvolved(_) => "schema.evolved",
            Self::SchemaBackfillRequested(_) => "schema.backfill.requested",
            Self::StreamingWatermarkUpdated(_) => "streaming.watermark.updated",
        }
    }
}

/// Failure to hand an event to the bus.
#[derive(Debug, Error)]
#[error("event publish failed: {reason}")]
pub struct EventError {
    /// Why the publish failed.
    pub reason: String,
}

/// The event bus boundary. The real bus lives outside this service; the
/// processor treats publishes as fire-and-forget.
#[async_trait]
pub trait EventPublisher: Debug + Send + Sync {
    /// Publish one event.
    async fn publish(&self, event: Event) -> Result<(), EventError>;
}

/// Publisher that logs each event. The default when no bus is wired.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingEventPublisher;

#[async_trait]
impl EventPublisher for LoggingEventPublisher {
    async fn publish(&self, event: Event) -> Result<(), EventError> {
        let payload = serde_json::to_string(&event).map_err(|e| EventError {
            reason: e.to_string(),
        })?;
        info!(topic = event.topic(), payload=%payload, "published event");
        Ok(())
    }
}

/// Publisher capturing events for assertions.
#[derive(Debug, Default)]
pub struct MockEventPublisher {
    events: Mutex<Vec<Event>>,
}

impl MockEventPublisher {
    /// All events published so far.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// The topics of all events published so far.
    pub fn topics(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(Event::topic).collect()
    }
}

#[async_trait]
impl EventPublisher for MockEventPublisher {
    async fn publish(&self, event: Event) -> Result<(), EventError> {
        self.events.lock().push(event);
        Ok(())
    }
}
