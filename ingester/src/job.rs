//! Queue job payloads and the ingestion error model.

use data_types::{
    ingest::{IngestionRequest, ValidationError},
    ManifestId, StorageTargetId, Timestamp,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Watermark metadata a streaming flush carries alongside its ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatermarkUpdate {
    /// The connector that produced the window.
    pub connector_id: String,
    /// End of the flushed window; the watermark seals through here.
    pub sealed_through: Timestamp,
    /// Rows in the flushed window.
    pub records_processed: i64,
}

/// A job as carried by the ingestion queue.
///
/// The `operation` discriminator keeps payload variants apart at the queue
/// boundary; downstream code dispatches on the variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "kebab-case")]
pub enum JobPayload {
    /// Ingest one record batch.
    Ingest {
        /// The ingestion request.
        ingestion: IngestionRequest,
    },
    /// Materialize whatever the dataset has staged.
    Flush {
        /// Slug of the dataset to flush.
        dataset_slug: String,
    },
    /// Ingest a sealed streaming window and advance its watermark.
    StreamingWindow {
        /// The synthesized ingestion request.
        ingestion: IngestionRequest,
        /// The watermark to apply once the ingestion succeeded.
        watermark: WatermarkUpdate,
    },
}

impl JobPayload {
    /// The dataset this job addresses.
    pub fn dataset_slug(&self) -> &str {
        match self {
            Self::Ingest { ingestion } | Self::StreamingWindow { ingestion, .. } => {
                &ingestion.dataset_slug
            }
            Self::Flush { dataset_slug } => dataset_slug,
        }
    }

    /// The queue-level id of this job: `<slug>-<idempotencyKey>` when the
    /// ingestion carries a key (collapsing duplicates at the queue), a
    /// random suffix otherwise.
    pub fn job_id(&self) -> String {
        let suffix = match self {
            Self::Ingest { ingestion } | Self::StreamingWindow { ingestion, .. } => {
                ingestion.idempotency_key.clone()
            }
            Self::Flush { .. } => Some("flush".to_string()),
        };
        match suffix {
            Some(suffix) => format!("{}-{suffix}", self.dataset_slug()),
            None => format!("{}-{}", self.dataset_slug(), Uuid::new_v4()),
        }
    }
}

/// The successful result of processing a job.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// The ingestion reached a manifest (possibly by idempotent replay).
    Materialized {
        /// The manifest the rows belong to.
        manifest_id: ManifestId,
        /// Manifest version.
        manifest_version: i64,
        /// Partitions the manifest now owns.
        partition_count: usize,
        /// Whether this was an idempotent replay of a prior ingestion.
        replayed: bool,
    },
    /// The rows were staged; a later flush will materialize them.
    Staged {
        /// Id of the staged batch.
        batch_id: String,
        /// Rows staged.
        row_count: i64,
    },
    /// Nothing to do (no rows, or nothing staged to flush).
    NoOp,
}

/// Errors processing an ingestion job.
#[derive(Debug, Error)]
pub enum IngestError {
    /// The request failed validation.
    #[error("invalid ingestion request: {source}")]
    Validation {
        /// The validation failure.
        #[from]
        source: ValidationError,
    },

    /// The proposed schema breaks the dataset's published schema.
    #[error("breaking schema change: {}", reasons.join("; "))]
    SchemaEvolution {
        /// One reason per offending column.
        reasons: Vec<String>,
    },

    /// The explicitly named storage target does not exist.
    #[error("storage target {id} not found")]
    StorageTargetNotFound {
        /// The unknown id.
        id: StorageTargetId,
    },

    /// Neither the dataset nor the system has a default storage target.
    #[error("no default storage target is configured")]
    NoDefaultStorageTarget,

    /// The dataset's staging queue is at capacity.
    #[error(transparent)]
    StagingQueueFull(#[from] crate::staging_queue::StagingQueueError),

    /// The catalog failed.
    #[error("catalog failure: {source}")]
    Catalog {
        /// The catalog error.
        #[from]
        source: timestore_catalog::interface::Error,
    },

    /// The storage driver failed.
    #[error("storage failure: {source}")]
    Storage {
        /// The storage error.
        #[from]
        source: partition_file::StorageError,
    },

    /// The spool failed.
    #[error("spool failure: {source}")]
    Spool {
        /// The spool error.
        #[from]
        source: spool::Error,
    },
}

/// Coarse error classification surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[allow(missing_docs)]
pub enum ErrorKind {
    Validation,
    SchemaEvolution,
    StorageTargetNotFound,
    StagingQueueFull,
    TransientIo,
    Corruption,
    Fatal,
}

impl IngestError {
    /// Classify this error for the caller-visible failure record.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::SchemaEvolution { .. } => ErrorKind::SchemaEvolution,
            Self::StorageTargetNotFound { .. } | Self::NoDefaultStorageTarget => {
                ErrorKind::StorageTargetNotFound
            }
            Self::StagingQueueFull(crate::staging_queue::StagingQueueError::Full { .. }) => {
                ErrorKind::StagingQueueFull
            }
            Self::StagingQueueFull(crate::staging_queue::StagingQueueError::Spool { source }) => {
                spool_kind(source)
            }
            Self::Catalog { source } if source.is_transient() => ErrorKind::TransientIo,
            Self::Catalog { .. } => ErrorKind::Fatal,
            Self::Storage { source } if source.is_transient() => ErrorKind::TransientIo,
            Self::Storage { .. } => ErrorKind::Validation,
            Self::Spool { source } => spool_kind(source),
        }
    }

    /// Whether retrying the job may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::TransientIo | ErrorKind::StagingQueueFull | ErrorKind::Corruption
        )
    }

    /// Human-readable reasons, one per underlying cause.
    pub fn reasons(&self) -> Vec<String> {
        match self {
            Self::SchemaEvolution { reasons } => reasons.clone(),
            other => vec![other.to_string()],
        }
    }

    /// The caller-visible failure record for this error.
    pub fn to_failure(&self) -> JobFailure {
        JobFailure {
            error_kind: self.kind(),
            reasons: self.reasons(),
            retryable: self.is_retryable(),
        }
    }
}

fn spool_kind(source: &spool::Error) -> ErrorKind {
    if source.is_fatal() {
        ErrorKind::Fatal
    } else if matches!(source, spool::Error::Corruption { .. }) {
        ErrorKind::Corruption
    } else if source.is_transient() {
        ErrorKind::TransientIo
    } else {
        ErrorKind::Validation
    }
}

/// The caller-visible record of a failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFailure {
    /// Coarse classification.
    pub error_kind: ErrorKind,
    /// One entry per underlying cause.
    pub reasons: Vec<String>,
    /// Whether resubmitting the job may succeed.
    pub retryable: bool,
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} (retryable: {}): {}",
            self.error_kind,
            self.retryable,
            self.reasons.join("; ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ingest_payload(idempotency_key: Option<&str>) -> JobPayload {
        let mut ingestion: IngestionRequest = serde_json::from_value(serde_json::json!({
            "datasetSlug": "obs-1",
            "schema": {"fields": [{"name": "t", "type": "timestamp"}]},
            "partition": {
                "key": {},
                "timeRange": {"start": "2024-01-01T00:00:00Z", "end": "2024-01-01T00:00:00Z"},
            },
            "rows": [],
        }))
        .unwrap();
        ingestion.idempotency_key = idempotency_key.map(ToString::to_string);
        JobPayload::Ingest { ingestion }
    }

    #[test]
    fn job_id_collapses_on_idempotency_key() {
        assert_eq!(ingest_payload(Some("k1")).job_id(), "obs-1-k1");
        assert_eq!(
            ingest_payload(Some("k1")).job_id(),
            ingest_payload(Some("k1")).job_id()
        );
        assert_ne!(ingest_payload(None).job_id(), ingest_payload(None).job_id());
    }

    #[test]
    fn payload_round_trips_with_operation_tag() {
        let payload = ingest_payload(Some("k1"));
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["operation"], "ingest");

        let back: JobPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);

        let flush = JobPayload::Flush {
            dataset_slug: "obs-1".to_string(),
        };
        let json = serde_json::to_value(&flush).unwrap();
        assert_eq!(json["operation"], "flush");
    }

    #[test]
    fn breaking_schema_errors_carry_reasons() {
        let err = IngestError::SchemaEvolution {
            reasons: vec!["column v changed type from double to integer".to_string()],
        };
        let failure = err.to_failure();
        assert_eq!(failure.error_kind, ErrorKind::SchemaEvolution);
        assert!(!failure.retryable);
        assert_eq!(failure.reasons.len(), 1);
    }
}
