//! Traits and data types for the catalog.

use async_trait::async_trait;
use data_types::{
    ColumnStatistics, Dataset, DatasetId, FileFormat, IngestionBatch, Manifest, ManifestId,
    Partition, SchemaField, SchemaVersion, SchemaVersionId, ShardKey, StorageTarget,
    StorageTargetId, StorageTargetKind, StreamingWatermark, Timestamp,
};
use snafu::Snafu;
use std::{collections::BTreeMap, fmt::Debug, sync::Arc};
use uuid::Uuid;

/// Errors surfaced by catalog operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("dataset {id} not found"))]
    DatasetNotFound { id: DatasetId },

    #[snafu(display("storage target {id} not found"))]
    StorageTargetNotFound { id: StorageTargetId },

    #[snafu(display("manifest {id} not found"))]
    ManifestNotFound { id: ManifestId },

    #[snafu(display("manifest {id} is not published; cannot append partitions"))]
    ManifestNotPublished { id: ManifestId },

    #[snafu(display("schema version {id} not found"))]
    SchemaVersionNotFound { id: SchemaVersionId },

    #[snafu(display("catalog row could not be decoded: {reason}"))]
    MalformedRow { reason: String },

    #[snafu(display("sqlx error: {source}"))]
    SqlxError { source: sqlx::Error },
}

impl Error {
    /// Whether a retry of the failed operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::SqlxError { .. })
    }
}

/// A specialized `Result` for catalog errors.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A published manifest together with its partitions, read as one consistent
/// snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestSnapshot {
    /// The manifest.
    pub manifest: Manifest,
    /// Its partitions, ordered by id.
    pub partitions: Vec<Partition>,
}

/// A partition to be inserted by a manifest create or append.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionInsert {
    /// Target the file was written to.
    pub storage_target_id: StorageTargetId,
    /// Uuid naming the file within the target.
    pub object_store_id: Uuid,
    /// File format.
    pub file_format: FileFormat,
    /// Path relative to the target root.
    pub file_path: String,
    /// Caller-facing partition key.
    pub partition_key: BTreeMap<String, String>,
    /// Minimum row timestamp.
    pub start_time: Timestamp,
    /// Maximum row timestamp.
    pub end_time: Timestamp,
    /// File size in bytes.
    pub file_size_bytes: i64,
    /// Row count.
    pub row_count: i64,
    /// Content hash of the file.
    pub checksum: String,
    /// Per-column statistics, if computed.
    pub column_statistics: Option<BTreeMap<String, ColumnStatistics>>,
    /// Logical table the rows belong to.
    pub table_name: String,
    /// Schema the rows were written with.
    pub schema_version_id: SchemaVersionId,
}

/// Parameters for creating a manifest and its partitions atomically.
#[derive(Debug, Clone)]
pub struct ManifestCreate {
    /// The dataset the manifest belongs to.
    pub dataset_id: DatasetId,
    /// The shard it covers.
    pub shard_key: ShardKey,
    /// The schema its partitions share.
    pub schema_version_id: SchemaVersionId,
    /// The manifest it evolved from, if any.
    pub parent_manifest_id: Option<ManifestId>,
    /// Free-form summary.
    pub summary: serde_json::Value,
    /// Free-form statistics.
    pub statistics: serde_json::Value,
    /// Free-form metadata.
    pub metadata: serde_json::Value,
    /// Creator identity.
    pub created_by: Option<String>,
    /// The partitions to insert.
    pub partitions: Vec<PartitionInsert>,
}

/// A catalog backend.
///
/// All multi-row write operations behave atomically; reads of the latest
/// published manifest return a consistent manifest+partition snapshot.
#[async_trait]
pub trait Catalog: Send + Sync + Debug {
    /// Create the backing schema if it does not yet exist.
    async fn setup(&self) -> Result<()>;

    /// Accessor to the repositories.
    fn repositories(&self) -> Box<dyn RepoCollection>;

    /// The metric registry associated with this catalog.
    fn metrics(&self) -> Arc<metric::Registry>;

    /// The time provider associated with this catalog.
    fn time_provider(&self) -> Arc<dyn timestore_time::TimeProvider>;

    /// Backend name, for logs.
    fn name(&self) -> &'static str;
}

/// Collects the repositories of one catalog backend.
pub trait RepoCollection: Send + Sync + Debug {
    /// Repository for datasets.
    fn datasets(&mut self) -> &mut dyn DatasetRepo;

    /// Repository for storage targets.
    fn storage_targets(&mut self) -> &mut dyn StorageTargetRepo;

    /// Repository for schema versions.
    fn schema_versions(&mut self) -> &mut dyn SchemaVersionRepo;

    /// Repository for manifests and their partitions.
    fn manifests(&mut self) -> &mut dyn ManifestRepo;

    /// Repository for ingestion-batch idempotency records.
    fn ingestion_batches(&mut self) -> &mut dyn IngestionBatchRepo;

    /// Repository for streaming watermarks.
    fn streaming_watermarks(&mut self) -> &mut dyn StreamingWatermarkRepo;
}

/// Operations on datasets.
#[async_trait]
pub trait DatasetRepo: Send + Sync {
    /// Create a dataset or return the existing one with the same slug.
    async fn create_or_get(
        &mut self,
        slug: &str,
        name: &str,
        description: Option<&str>,
        metadata: &serde_json::Value,
    ) -> Result<Dataset>;

    /// Look up a dataset by slug.
    async fn get_by_slug(&mut self, slug: &str) -> Result<Option<Dataset>>;

    /// Look up a dataset by id.
    async fn get_by_id(&mut self, id: DatasetId) -> Result<Option<Dataset>>;

    /// List all datasets.
    async fn list(&mut self) -> Result<Vec<Dataset>>;

    /// Set the dataset's default storage target.
    async fn update_default_storage_target(
        &mut self,
        id: DatasetId,
        storage_target_id: StorageTargetId,
    ) -> Result<Dataset>;
}

/// Operations on storage targets.
#[async_trait]
pub trait StorageTargetRepo: Send + Sync {
    /// Create a storage target or return the existing one with the same
    /// name.
    async fn create_or_get(
        &mut self,
        name: &str,
        kind: StorageTargetKind,
        config: &serde_json::Value,
    ) -> Result<StorageTarget>;

    /// Look up a storage target by id.
    async fn get_by_id(&mut self, id: StorageTargetId) -> Result<Option<StorageTarget>>;

    /// Look up a storage target by name.
    async fn get_by_name(&mut self, name: &str) -> Result<Option<StorageTarget>>;

    /// List all storage targets.
    async fn list(&mut self) -> Result<Vec<StorageTarget>>;
}

/// Operations on dataset schema versions.
#[async_trait]
pub trait SchemaVersionRepo: Send + Sync {
    /// Find the schema version of a dataset matching `checksum`.
    async fn find_by_checksum(
        &mut self,
        dataset_id: DatasetId,
        checksum: &str,
    ) -> Result<Option<SchemaVersion>>;

    /// Record `fields` as the next schema version of the dataset, or return
    /// the existing version with the same checksum.
    async fn create_or_get(
        &mut self,
        dataset_id: DatasetId,
        fields: &[SchemaField],
    ) -> Result<SchemaVersion>;

    /// The version the next schema of the dataset will get.
    async fn next_version(&mut self, dataset_id: DatasetId) -> Result<i64>;

    /// Look up a schema version by id.
    async fn get_by_id(&mut self, id: SchemaVersionId) -> Result<Option<SchemaVersion>>;
}

/// Operations on manifests and their partitions.
#[async_trait]
pub trait ManifestRepo: Send + Sync {
    /// The latest published manifest of the dataset, optionally scoped to a
    /// shard, together with its partitions.
    async fn get_latest_published(
        &mut self,
        dataset_id: DatasetId,
        shard: Option<&ShardKey>,
    ) -> Result<Option<ManifestSnapshot>>;

    /// The version the next manifest of the dataset will get.
    async fn next_version(&mut self, dataset_id: DatasetId) -> Result<i64>;

    /// Insert a new published manifest and all its partitions atomically,
    /// superseding the previously published manifest of the same shard.
    async fn create_with_partitions(&mut self, create: ManifestCreate) -> Result<ManifestSnapshot>;

    /// Append partitions to a published manifest.
    ///
    /// Copy-on-write: a successor manifest (version + 1, parent = the given
    /// manifest) takes ownership of the existing partitions plus the new
    /// ones, and becomes the published manifest of the shard in the same
    /// transaction. Partitions are never deleted.
    async fn append_partitions(
        &mut self,
        manifest_id: ManifestId,
        partitions: Vec<PartitionInsert>,
        summary_patch: serde_json::Value,
        metadata_patch: serde_json::Value,
        schema_version_id: SchemaVersionId,
    ) -> Result<ManifestSnapshot>;

    /// Look up a manifest (any status) by id, with its partitions.
    async fn get_by_id(&mut self, id: ManifestId) -> Result<Option<ManifestSnapshot>>;
}

/// Operations on ingestion-batch idempotency records.
#[async_trait]
pub trait IngestionBatchRepo: Send + Sync {
    /// Record that `idempotency_key` produced `manifest_id`, or return the
    /// pre-existing record for the key.
    async fn create_or_get(
        &mut self,
        dataset_id: DatasetId,
        idempotency_key: &str,
        manifest_id: ManifestId,
    ) -> Result<IngestionBatch>;

    /// Look up the record for `(dataset_id, idempotency_key)`.
    async fn get(
        &mut self,
        dataset_id: DatasetId,
        idempotency_key: &str,
    ) -> Result<Option<IngestionBatch>>;
}

/// Operations on streaming watermarks.
#[async_trait]
pub trait StreamingWatermarkRepo: Send + Sync {
    /// Advance the watermark of `(dataset_id, connector_id)`.
    ///
    /// `sealed_through` never regresses: the stored value is the maximum of
    /// the existing and offered positions. `records_processed_delta` is
    /// added to the stored total.
    async fn upsert(
        &mut self,
        connector_id: &str,
        dataset_id: DatasetId,
        dataset_slug: &str,
        sealed_through: Timestamp,
        backlog_lag_ms: i64,
        records_processed_delta: i64,
    ) -> Result<StreamingWatermark>;

    /// Look up the watermark for `(dataset_id, connector_id)`.
    async fn get(
        &mut self,
        dataset_id: DatasetId,
        connector_id: &str,
    ) -> Result<Option<StreamingWatermark>>;
}

/// Merge `patch` into `base`, recursively for objects. `null` patch values
/// remove the key. Used for manifest summary/metadata patches.
pub fn merge_json_patch(base: &mut serde_json::Value, patch: &serde_json::Value) {
    use serde_json::Value;

    if let (Value::Object(base_map), Value::Object(patch_map)) = (&mut *base, patch) {
        for (k, v) in patch_map {
            match v {
                Value::Null => {
                    base_map.remove(k);
                }
                Value::Object(_) => {
                    let slot = base_map.entry(k.clone()).or_insert(Value::Null);
                    if !slot.is_object() {
                        *slot = Value::Object(Default::default());
                    }
                    merge_json_patch(slot, v);
                }
                other => {
                    base_map.insert(k.clone(), other.clone());
                }
            }
        }
    } else if !patch.is_null() {
        *base = patch.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_patch_merges_recursively_and_removes_nulls() {
        let mut base = serde_json::json!({
            "rowCount": 2,
            "evolution": {"addedColumns": ["tag"], "stale": true},
        });
        let patch = serde_json::json!({
            "rowCount": 5,
            "evolution": {"stale": null, "plan": "additive"},
            "extra": 1,
        });

        merge_json_patch(&mut base, &patch);
        assert_eq!(
            base,
            serde_json::json!({
                "rowCount": 5,
                "evolution": {"addedColumns": ["tag"], "plan": "additive"},
                "extra": 1,
            })
        );
    }
}
