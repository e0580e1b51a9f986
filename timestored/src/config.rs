//! Service configuration, deserialized from a JSON file.

use serde::Deserialize;
use std::path::PathBuf;
use streaming::{BackpressureConfig, BulkConnectorConfig, StreamingBatcherConfig,
                StreamingConnectorConfig};

/// Top-level configuration of the `timestored` process.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct ServiceConfig {
    /// Catalog backend.
    pub catalog: CatalogConfig,
    /// Partition file storage.
    pub storage: StorageConfig,
    /// Staging spool.
    pub staging: StagingConfig,
    /// Ingestion queue.
    pub queue: QueueConfig,
    /// Streaming micro-batchers.
    pub streaming: StreamingConfig,
    /// File connectors.
    pub connectors: ConnectorsConfig,
    /// Partition index hints recorded with new partitions.
    pub partition_index: PartitionIndexConfig,
}

/// Which catalog backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CatalogMode {
    /// In-memory catalog; state is lost on restart. For development.
    Memory,
    /// Postgres catalog.
    Postgres,
}

/// Catalog configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct CatalogConfig {
    /// Backend selection.
    pub mode: CatalogMode,
    /// Postgres DSN; required in postgres mode.
    pub dsn: Option<String>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            mode: CatalogMode::Memory,
            dsn: None,
        }
    }
}

/// Partition storage configuration; registered as the `default` storage
/// target on startup.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct StorageConfig {
    /// Driver of the default target (`local-file` or `object-store`).
    pub driver: String,
    /// Filesystem root partition files are written under.
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            driver: "local-file".to_string(),
            root: PathBuf::from("./data/storage"),
        }
    }
}

/// Flush thresholds of the staging spool.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct FlushConfig {
    /// Flush once this many rows are pending (0 disables).
    pub max_rows: i64,
    /// Flush once the spool holds this many bytes (0 disables).
    pub max_bytes: i64,
    /// Flush once the oldest staged batch is this old (0 disables).
    pub max_age_ms: i64,
    /// Flush eagerly when only the byte threshold is configured.
    pub eager_when_bytes_only: bool,
}

/// Staging spool configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct StagingConfig {
    /// Directory holding the per-dataset staging databases.
    pub directory: PathBuf,
    /// Per-dataset byte ceiling (0 disables the warning).
    pub max_dataset_bytes: u64,
    /// Aggregate byte ceiling (0 disables the warning).
    pub max_total_bytes: u64,
    /// Per-dataset staging queue capacity.
    pub max_pending_per_dataset: usize,
    /// Reset flushes interrupted by a crash on first open.
    pub resume_interrupted_flushes: bool,
    /// Flush thresholds.
    pub flush: FlushConfig,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./data/staging"),
            max_dataset_bytes: 0,
            max_total_bytes: 0,
            max_pending_per_dataset: 16,
            resume_interrupted_flushes: true,
            flush: FlushConfig::default(),
        }
    }
}

/// Queue operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueMode {
    /// Jobs run synchronously in the caller.
    Inline,
    /// Jobs run on the worker pool.
    Distributed,
}

/// Ingestion queue configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct QueueConfig {
    /// Operating mode.
    pub mode: QueueMode,
    /// Queue name, for logs and metrics.
    pub name: String,
    /// Parallel workers in distributed mode.
    pub concurrency: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            mode: QueueMode::Distributed,
            name: "timestore-ingest".to_string(),
            concurrency: 4,
        }
    }
}

/// Streaming micro-batcher configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct StreamingConfig {
    /// Master switch.
    pub enabled: bool,
    /// Broker url; `file://` urls tail a local NDJSON file, anything else
    /// requires an external consumer feeding the batchers.
    pub broker_url: Option<String>,
    /// One batcher per connector.
    pub batchers: Vec<StreamingBatcherConfig>,
}

/// Connector configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct ConnectorsConfig {
    /// Master switch.
    pub enabled: bool,
    /// File tailers.
    pub streaming: Vec<StreamingConnectorConfig>,
    /// Bulk loaders.
    pub bulk: Vec<BulkConnectorConfig>,
    /// Shared backpressure watermarks.
    pub backpressure: BackpressureConfig,
}

/// Hints for partition-level indexing recorded at write time.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct PartitionIndexConfig {
    /// Columns statistics are kept for; empty means all.
    pub columns: Vec<String>,
    /// Histogram resolution for numeric columns (informational).
    pub histogram_bins: usize,
    /// Bloom filter false-positive rate (informational; filters are built
    /// by the query tier).
    pub bloom_false_positive_rate: f64,
}

impl Default for PartitionIndexConfig {
    fn default() -> Self {
        Self {
            columns: Vec::new(),
            histogram_bins: 32,
            bloom_false_positive_rate: 0.01,
        }
    }
}

impl ServiceConfig {
    /// Load the configuration from a JSON file.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Errors loading the configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Reading the file failed.
    #[error("cannot read config {}: {source}", path.display())]
    Io {
        /// The configured path.
        path: PathBuf,
        /// The I/O error.
        source: std::io::Error,
    },

    /// The file does not parse.
    #[error("cannot parse config {}: {source}", path.display())]
    Parse {
        /// The configured path.
        path: PathBuf,
        /// The JSON error.
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: ServiceConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.queue.mode, QueueMode::Distributed);
        assert_eq!(config.queue.concurrency, 4);
        assert_eq!(config.staging.max_pending_per_dataset, 16);
        assert!(config.staging.resume_interrupted_flushes);
        assert_eq!(config.catalog.mode, CatalogMode::Memory);
        assert!(!config.streaming.enabled);
        assert!(!config.connectors.enabled);
    }

    #[test]
    fn recognized_options_parse() {
        let config: ServiceConfig = serde_json::from_value(serde_json::json!({
            "catalog": {"mode": "postgres", "dsn": "postgres://localhost/timestore"},
            "storage": {"driver": "local-file", "root": "/var/lib/timestore/storage"},
            "staging": {
                "directory": "/var/lib/timestore/staging",
                "maxDatasetBytes": 1073741824u64,
                "maxTotalBytes": 10737418240u64,
                "maxPendingPerDataset": 8,
                "flush": {"maxRows": 50000, "maxBytes": 67108864, "maxAgeMs": 30000,
                          "eagerWhenBytesOnly": true},
            },
            "queue": {"mode": "inline", "name": "ingest", "concurrency": 1},
            "streaming": {
                "enabled": true,
                "brokerUrl": "file:///var/lib/timestore/stream.ndjson",
                "batchers": [{
                    "connectorId": "conn-1",
                    "topic": "observations",
                    "groupId": "timestore",
                    "datasetSlug": "obs-1",
                    "schema": {"fields": [{"name": "t", "type": "timestamp"}]},
                    "timeField": "t",
                    "windowSeconds": 60,
                    "maxRowsPerPartition": 5000,
                    "maxBatchLatencyMs": 2000,
                }],
            },
            "connectors": {
                "enabled": true,
                "streaming": [],
                "bulk": [],
                "backpressure": {"highWatermark": 256, "lowWatermark": 64,
                                 "minPauseMs": 50, "maxPauseMs": 2000},
            },
            "partitionIndex": {"columns": ["t"], "histogramBins": 16,
                               "bloomFalsePositiveRate": 0.05},
        }))
        .unwrap();

        assert_eq!(config.catalog.mode, CatalogMode::Postgres);
        assert_eq!(config.queue.mode, QueueMode::Inline);
        assert_eq!(config.streaming.batchers.len(), 1);
        assert_eq!(config.streaming.batchers[0].retry_delay_ms, 5_000);
        assert!(config.staging.flush.eager_when_bytes_only);
    }

    #[test]
    fn unknown_options_are_rejected() {
        let result: Result<ServiceConfig, _> =
            serde_json::from_value(serde_json::json!({"surprise": true}));
        assert!(result.is_err());
    }
}
