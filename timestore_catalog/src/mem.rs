//! In-memory catalog backend, used by tests and inline deployments.

use crate::interface::{
    merge_json_patch, Catalog, DatasetRepo, Error, IngestionBatchRepo, ManifestCreate,
    ManifestRepo, ManifestSnapshot, PartitionInsert, RepoCollection, Result, SchemaVersionRepo,
    StorageTargetRepo, StreamingWatermarkRepo,
};
use async_trait::async_trait;
use data_types::{
    schema_checksum, Dataset, DatasetId, IngestionBatch, IngestionBatchId, Manifest, ManifestId,
    ManifestStatus, Partition, PartitionId, PartitionMetadata, SchemaField, SchemaVersion,
    SchemaVersionId, ShardKey, StorageTarget, StorageTargetId, StorageTargetKind,
    StreamingWatermark, Timestamp,
};
use parking_lot::Mutex;
use std::sync::Arc;
use timestore_time::TimeProvider;

/// In-memory catalog. A single mutex over all collections makes every
/// operation trivially serializable.
#[derive(Debug)]
pub struct MemCatalog {
    metrics: Arc<metric::Registry>,
    time_provider: Arc<dyn TimeProvider>,
    collections: Arc<Mutex<MemCollections>>,
}

impl MemCatalog {
    /// Create an empty in-memory catalog.
    pub fn new(metrics: Arc<metric::Registry>, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            metrics,
            time_provider,
            collections: Default::default(),
        }
    }
}

#[derive(Debug, Default)]
struct MemCollections {
    datasets: Vec<Dataset>,
    storage_targets: Vec<StorageTarget>,
    schema_versions: Vec<SchemaVersion>,
    manifests: Vec<Manifest>,
    partitions: Vec<Partition>,
    ingestion_batches: Vec<IngestionBatch>,
    watermarks: Vec<StreamingWatermark>,
    next_id: i64,
}

impl MemCollections {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn snapshot(&self, manifest: &Manifest) -> ManifestSnapshot {
        let mut partitions: Vec<_> = self
            .partitions
            .iter()
            .filter(|p| p.manifest_id == manifest.id)
            .cloned()
            .collect();
        partitions.sort_by_key(|p| p.id);
        ManifestSnapshot {
            manifest: manifest.clone(),
            partitions,
        }
    }
}

#[async_trait]
impl Catalog for MemCatalog {
    async fn setup(&self) -> Result<()> {
        Ok(())
    }

    fn repositories(&self) -> Box<dyn RepoCollection> {
        Box::new(MemTxn {
            collections: Arc::clone(&self.collections),
            time_provider: Arc::clone(&self.time_provider),
        })
    }

    fn metrics(&self) -> Arc<metric::Registry> {
        Arc::clone(&self.metrics)
    }

    fn time_provider(&self) -> Arc<dyn TimeProvider> {
        Arc::clone(&self.time_provider)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// One handle onto the shared in-memory collections.
#[derive(Debug)]
struct MemTxn {
    collections: Arc<Mutex<MemCollections>>,
    time_provider: Arc<dyn TimeProvider>,
}

impl MemTxn {
    fn now(&self) -> Timestamp {
        Timestamp::from_time(self.time_provider.now())
    }
}

impl RepoCollection for MemTxn {
    fn datasets(&mut self) -> &mut dyn DatasetRepo {
        self
    }

    fn storage_targets(&mut self) -> &mut dyn StorageTargetRepo {
        self
    }

    fn schema_versions(&mut self) -> &mut dyn SchemaVersionRepo {
        self
    }

    fn manifests(&mut self) -> &mut dyn ManifestRepo {
        self
    }

    fn ingestion_batches(&mut self) -> &mut dyn IngestionBatchRepo {
        self
    }

    fn streaming_watermarks(&mut self) -> &mut dyn StreamingWatermarkRepo {
        self
    }
}

#[async_trait]
impl DatasetRepo for MemTxn {
    async fn create_or_get(
        &mut self,
        slug: &str,
        name: &str,
        description: Option<&str>,
        metadata: &serde_json::Value,
    ) -> Result<Dataset> {
        let now = self.now();
        let mut c = self.collections.lock();

        if let Some(dataset) = c.datasets.iter().find(|d| d.slug == slug) {
            return Ok(dataset.clone());
        }

        let dataset = Dataset {
            id: DatasetId::new(c.next_id()),
            slug: slug.to_string(),
            name: name.to_string(),
            description: description.map(ToString::to_string),
            default_storage_target_id: None,
            metadata: metadata.clone(),
            created_at: now,
            updated_at: now,
        };
        c.datasets.push(dataset.clone());
        Ok(dataset)
    }

    async fn get_by_slug(&mut self, slug: &str) -> Result<Option<Dataset>> {
        let c = self.collections.lock();
        Ok(c.datasets.iter().find(|d| d.slug == slug).cloned())
    }

    async fn get_by_id(&mut self, id: DatasetId) -> Result<Option<Dataset>> {
        let c = self.collections.lock();
        Ok(c.datasets.iter().find(|d| d.id == id).cloned())
    }

    async fn list(&mut self) -> Result<Vec<Dataset>> {
        let c = self.collections.lock();
        Ok(c.datasets.clone())
    }

    async fn update_default_storage_target(
        &mut self,
        id: DatasetId,
        storage_target_id: StorageTargetId,
    ) -> Result<Dataset> {
        let now = self.now();
        let mut c = self.collections.lock();

        if !c.storage_targets.iter().any(|t| t.id == storage_target_id) {
            return Err(Error::StorageTargetNotFound {
                id: storage_target_id,
            });
        }

        let dataset = c
            .datasets
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or(Error::DatasetNotFound { id })?;
        dataset.default_storage_target_id = Some(storage_target_id);
        dataset.updated_at = now;
        Ok(dataset.clone())
    }
}

#[async_trait]
impl StorageTargetRepo for MemTxn {
    async fn create_or_get(
        &mut self,
        name: &str,
        kind: StorageTargetKind,
        config: &serde_json::Value,
    ) -> Result<StorageTarget> {
        let mut c = self.collections.lock();

        if let Some(target) = c.storage_targets.iter().find(|t| t.name == name) {
            return Ok(target.clone());
        }

        let target = StorageTarget {
            id: StorageTargetId::new(c.next_id()),
            name: name.to_string(),
            kind,
            config: config.clone(),
        };
        c.storage_targets.push(target.clone());
        Ok(target)
    }

    async fn get_by_id(&mut self, id: StorageTargetId) -> Result<Option<StorageTarget>> {
        let c = self.collections.lock();
        Ok(c.storage_targets.iter().find(|t| t.id == id).cloned())
    }

    async fn get_by_name(&mut self, name: &str) -> Result<Option<StorageTarget>> {
        let c = self.collections.lock();
        Ok(c.storage_targets.iter().find(|t| t.name == name).cloned())
    }

    async fn list(&mut self) -> Result<Vec<StorageTarget>> {
        let c = self.collections.lock();
        Ok(c.storage_targets.clone())
    }
}

#[async_trait]
impl SchemaVersionRepo for MemTxn {
    async fn find_by_checksum(
        &mut self,
        dataset_id: DatasetId,
        checksum: &str,
    ) -> Result<Option<SchemaVersion>> {
        let c = self.collections.lock();
        Ok(c.schema_versions
            .iter()
            .find(|s| s.dataset_id == dataset_id && s.checksum == checksum)
            .cloned())
    }

    async fn create_or_get(
        &mut self,
        dataset_id: DatasetId,
        fields: &[SchemaField],
    ) -> Result<SchemaVersion> {
        let now = self.now();
        let checksum = schema_checksum(fields);
        let mut c = self.collections.lock();

        if let Some(existing) = c
            .schema_versions
            .iter()
            .find(|s| s.dataset_id == dataset_id && s.checksum == checksum)
        {
            return Ok(existing.clone());
        }

        let version = c
            .schema_versions
            .iter()
            .filter(|s| s.dataset_id == dataset_id)
            .map(|s| s.version)
            .max()
            .unwrap_or(0)
            + 1;

        let schema_version = SchemaVersion {
            id: SchemaVersionId::new(c.next_id()),
            dataset_id,
            version,
            fields: fields.to_vec(),
            checksum,
            created_at: now,
        };
        c.schema_versions.push(schema_version.clone());
        Ok(schema_version)
    }

    async fn next_version(&mut self, dataset_id: DatasetId) -> Result<i64> {
        let c = self.collections.lock();
        Ok(c.schema_versions
            .iter()
            .filter(|s| s.dataset_id == dataset_id)
            .map(|s| s.version)
            .max()
            .unwrap_or(0)
            + 1)
    }

    async fn get_by_id(&mut self, id: SchemaVersionId) -> Result<Option<SchemaVersion>> {
        let c = self.collections.lock();
        Ok(c.schema_versions.iter().find(|s| s.id == id).cloned())
    }
}

fn insert_partitions(
    c: &mut MemCollections,
    manifest_id: ManifestId,
    inserts: Vec<PartitionInsert>,
) {
    for insert in inserts {
        let partition = Partition {
            id: PartitionId::new(c.next_id()),
            manifest_id,
            storage_target_id: insert.storage_target_id,
            object_store_id: insert.object_store_id,
            file_format: insert.file_format,
            file_path: insert.file_path,
            partition_key: insert.partition_key,
            start_time: insert.start_time,
            end_time: insert.end_time,
            file_size_bytes: insert.file_size_bytes,
            row_count: insert.row_count,
            checksum: insert.checksum,
            column_statistics: insert.column_statistics,
            metadata: PartitionMetadata {
                table_name: insert.table_name,
                schema_version_id: insert.schema_version_id,
            },
        };
        c.partitions.push(partition);
    }
}

#[async_trait]
impl ManifestRepo for MemTxn {
    async fn get_latest_published(
        &mut self,
        dataset_id: DatasetId,
        shard: Option<&ShardKey>,
    ) -> Result<Option<ManifestSnapshot>> {
        let c = self.collections.lock();
        let manifest = c
            .manifests
            .iter()
            .filter(|m| {
                m.dataset_id == dataset_id
                    && m.status == ManifestStatus::Published
                    && shard.map(|s| &m.shard_key == s).unwrap_or(true)
            })
            .max_by_key(|m| m.version);
        Ok(manifest.map(|m| c.snapshot(m)))
    }

    async fn next_version(&mut self, dataset_id: DatasetId) -> Result<i64> {
        let c = self.collections.lock();
        Ok(c.manifests
            .iter()
            .filter(|m| m.dataset_id == dataset_id)
            .map(|m| m.version)
            .max()
            .unwrap_or(0)
            + 1)
    }

    async fn create_with_partitions(&mut self, create: ManifestCreate) -> Result<ManifestSnapshot> {
        let now = self.now();
        let mut c = self.collections.lock();

        let version = c
            .manifests
            .iter()
            .filter(|m| m.dataset_id == create.dataset_id)
            .map(|m| m.version)
            .max()
            .unwrap_or(0)
            + 1;

        // publishing atomically supersedes the previous manifest of the shard
        for manifest in c.manifests.iter_mut().filter(|m| {
            m.dataset_id == create.dataset_id
                && m.shard_key == create.shard_key
                && m.status == ManifestStatus::Published
        }) {
            manifest.status = ManifestStatus::Superseded;
        }

        let manifest = Manifest {
            id: ManifestId::new(c.next_id()),
            dataset_id: create.dataset_id,
            version,
            status: ManifestStatus::Published,
            shard_key: create.shard_key,
            schema_version_id: create.schema_version_id,
            parent_manifest_id: create.parent_manifest_id,
            summary: create.summary,
            statistics: create.statistics,
            metadata: create.metadata,
            created_by: create.created_by,
            created_at: now,
            published_at: Some(now),
        };
        c.manifests.push(manifest.clone());
        insert_partitions(&mut c, manifest.id, create.partitions);

        Ok(c.snapshot(&manifest))
    }

    async fn append_partitions(
        &mut self,
        manifest_id: ManifestId,
        partitions: Vec<PartitionInsert>,
        summary_patch: serde_json::Value,
        metadata_patch: serde_json::Value,
        schema_version_id: SchemaVersionId,
    ) -> Result<ManifestSnapshot> {
        let now = self.now();
        let mut c = self.collections.lock();

        let previous = c
            .manifests
            .iter()
            .find(|m| m.id == manifest_id)
            .cloned()
            .ok_or(Error::ManifestNotFound { id: manifest_id })?;
        if previous.status != ManifestStatus::Published {
            return Err(Error::ManifestNotPublished { id: manifest_id });
        }

        let version = c
            .manifests
            .iter()
            .filter(|m| m.dataset_id == previous.dataset_id)
            .map(|m| m.version)
            .max()
            .unwrap_or(0)
            + 1;

        let mut summary = previous.summary.clone();
        merge_json_patch(&mut summary, &summary_patch);
        let mut metadata = previous.metadata.clone();
        merge_json_patch(&mut metadata, &metadata_patch);

        let successor = Manifest {
            id: ManifestId::new(c.next_id()),
            dataset_id: previous.dataset_id,
            version,
            status: ManifestStatus::Published,
            shard_key: previous.shard_key.clone(),
            schema_version_id,
            parent_manifest_id: Some(previous.id),
            summary,
            statistics: previous.statistics.clone(),
            metadata,
            created_by: previous.created_by.clone(),
            created_at: now,
            published_at: Some(now),
        };

        for manifest in c.manifests.iter_mut().filter(|m| m.id == manifest_id) {
            manifest.status = ManifestStatus::Superseded;
        }
        c.manifests.push(successor.clone());

        // the successor takes ownership of the previous manifest's
        // partitions; each partition is referenced by exactly one manifest
        for partition in c
            .partitions
            .iter_mut()
            .filter(|p| p.manifest_id == manifest_id)
        {
            partition.manifest_id = successor.id;
        }
        insert_partitions(&mut c, successor.id, partitions);

        Ok(c.snapshot(&successor))
    }

    async fn get_by_id(&mut self, id: ManifestId) -> Result<Option<ManifestSnapshot>> {
        let c = self.collections.lock();
        Ok(c.manifests.iter().find(|m| m.id == id).map(|m| c.snapshot(m)))
    }
}

#[async_trait]
impl IngestionBatchRepo for MemTxn {
    async fn create_or_get(
        &mut self,
        dataset_id: DatasetId,
        idempotency_key: &str,
        manifest_id: ManifestId,
    ) -> Result<IngestionBatch> {
        let now = self.now();
        let mut c = self.collections.lock();

        if let Some(existing) = c
            .ingestion_batches
            .iter()
            .find(|b| b.dataset_id == dataset_id && b.idempotency_key == idempotency_key)
        {
            return Ok(existing.clone());
        }

        let batch = IngestionBatch {
            id: IngestionBatchId::new(c.next_id()),
            dataset_id,
            idempotency_key: idempotency_key.to_string(),
            manifest_id,
            created_at: now,
        };
        c.ingestion_batches.push(batch.clone());
        Ok(batch)
    }

    async fn get(
        &mut self,
        dataset_id: DatasetId,
        idempotency_key: &str,
    ) -> Result<Option<IngestionBatch>> {
        let c = self.collections.lock();
        Ok(c.ingestion_batches
            .iter()
            .find(|b| b.dataset_id == dataset_id && b.idempotency_key == idempotency_key)
            .cloned())
    }
}

#[async_trait]
impl StreamingWatermarkRepo for MemTxn {
    async fn upsert(
        &mut self,
        connector_id: &str,
        dataset_id: DatasetId,
        dataset_slug: &str,
        sealed_through: Timestamp,
        backlog_lag_ms: i64,
        records_processed_delta: i64,
    ) -> Result<StreamingWatermark> {
        let now = self.now();
        let mut c = self.collections.lock();

        if let Some(watermark) = c
            .watermarks
            .iter_mut()
            .find(|w| w.dataset_id == dataset_id && w.connector_id == connector_id)
        {
            // sealed_through is monotonic non-decreasing
            watermark.sealed_through = watermark.sealed_through.max(sealed_through);
            watermark.backlog_lag_ms = backlog_lag_ms;
            watermark.records_processed += records_processed_delta;
            watermark.updated_at = now;
            return Ok(watermark.clone());
        }

        let watermark = StreamingWatermark {
            connector_id: connector_id.to_string(),
            dataset_id,
            dataset_slug: dataset_slug.to_string(),
            sealed_through,
            backlog_lag_ms,
            records_processed: records_processed_delta,
            updated_at: now,
        };
        c.watermarks.push(watermark.clone());
        Ok(watermark)
    }

    async fn get(
        &mut self,
        dataset_id: DatasetId,
        connector_id: &str,
    ) -> Result<Option<StreamingWatermark>> {
        let c = self.collections.lock();
        Ok(c.watermarks
            .iter()
            .find(|w| w.dataset_id == dataset_id && w.connector_id == connector_id)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_types::FieldType;
    use std::collections::BTreeMap;
    use timestore_time::{MockProvider, Time};
    use uuid::Uuid;

    fn catalog() -> MemCatalog {
        MemCatalog::new(
            Arc::new(metric::Registry::new()),
            Arc::new(MockProvider::new(Time::from_timestamp_millis(1_700_000_000_000))),
        )
    }

    fn partition_insert(
        target: StorageTargetId,
        schema: SchemaVersionId,
        start: &str,
        end: &str,
    ) -> PartitionInsert {
        PartitionInsert {
            storage_target_id: target,
            object_store_id: Uuid::new_v4(),
            file_format: data_types::FileFormat::Parquet,
            file_path: "obs-1/some.parquet".to_string(),
            partition_key: BTreeMap::from([("window".to_string(), "w1".to_string())]),
            start_time: data_types::ingest::parse_rfc3339(start).unwrap(),
            end_time: data_types::ingest::parse_rfc3339(end).unwrap(),
            file_size_bytes: 1024,
            row_count: 2,
            checksum: "abc".to_string(),
            column_statistics: None,
            table_name: "records".to_string(),
            schema_version_id: schema,
        }
    }

    #[tokio::test]
    async fn dataset_create_is_idempotent_by_slug() {
        let catalog = catalog();
        let mut repos = catalog.repositories();

        let a = repos
            .datasets()
            .create_or_get("obs-1", "Observations", None, &serde_json::json!({}))
            .await
            .unwrap();
        let b = repos
            .datasets()
            .create_or_get("obs-1", "Renamed", Some("ignored"), &serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(a, b);

        let fetched = repos.datasets().get_by_slug("obs-1").await.unwrap().unwrap();
        assert_eq!(fetched.name, "Observations");
    }

    #[tokio::test]
    async fn default_storage_target_requires_existing_target() {
        let catalog = catalog();
        let mut repos = catalog.repositories();
        let dataset = repos
            .datasets()
            .create_or_get("obs-1", "Observations", None, &serde_json::json!({}))
            .await
            .unwrap();

        let err = repos
            .datasets()
            .update_default_storage_target(dataset.id, StorageTargetId::new(999))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StorageTargetNotFound { .. }));

        let target = repos
            .storage_targets()
            .create_or_get(
                "default",
                StorageTargetKind::LocalFile,
                &serde_json::json!({"root": "/tmp"}),
            )
            .await
            .unwrap();
        let updated = repos
            .datasets()
            .update_default_storage_target(dataset.id, target.id)
            .await
            .unwrap();
        assert_eq!(updated.default_storage_target_id, Some(target.id));
    }

    #[tokio::test]
    async fn schema_versions_are_monotonic_and_deduped_by_checksum() {
        let catalog = catalog();
        let mut repos = catalog.repositories();
        let dataset = repos
            .datasets()
            .create_or_get("obs-1", "Observations", None, &serde_json::json!({}))
            .await
            .unwrap();

        let v1_fields = vec![
            SchemaField::new("t", FieldType::Timestamp),
            SchemaField::new("v", FieldType::Double),
        ];
        let v1 = repos
            .schema_versions()
            .create_or_get(dataset.id, &v1_fields)
            .await
            .unwrap();
        assert_eq!(v1.version, 1);

        let again = repos
            .schema_versions()
            .create_or_get(dataset.id, &v1_fields)
            .await
            .unwrap();
        assert_eq!(again.id, v1.id);

        assert_eq!(repos.schema_versions().next_version(dataset.id).await.unwrap(), 2);

        let mut v2_fields = v1_fields.clone();
        v2_fields.push(SchemaField::new("tag", FieldType::String));
        let v2 = repos
            .schema_versions()
            .create_or_get(dataset.id, &v2_fields)
            .await
            .unwrap();
        assert_eq!(v2.version, 2);

        let by_checksum = repos
            .schema_versions()
            .find_by_checksum(dataset.id, &v1.checksum)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_checksum.id, v1.id);
    }

    #[tokio::test]
    async fn manifest_publish_supersedes_previous_shard_manifest() {
        let catalog = catalog();
        let mut repos = catalog.repositories();
        let dataset = repos
            .datasets()
            .create_or_get("obs-1", "Observations", None, &serde_json::json!({}))
            .await
            .unwrap();
        let target = repos
            .storage_targets()
            .create_or_get("default", StorageTargetKind::LocalFile, &serde_json::json!({}))
            .await
            .unwrap();
        let schema = repos
            .schema_versions()
            .create_or_get(dataset.id, &[SchemaField::new("t", FieldType::Timestamp)])
            .await
            .unwrap();

        let shard = ShardKey::from_string("2024-01-01");
        let first = repos
            .manifests()
            .create_with_partitions(ManifestCreate {
                dataset_id: dataset.id,
                shard_key: shard.clone(),
                schema_version_id: schema.id,
                parent_manifest_id: None,
                summary: serde_json::json!({"rowCount": 2}),
                statistics: serde_json::json!({}),
                metadata: serde_json::json!({}),
                created_by: None,
                partitions: vec![partition_insert(
                    target.id,
                    schema.id,
                    "2024-01-01T00:00:00Z",
                    "2024-01-01T00:05:00Z",
                )],
            })
            .await
            .unwrap();
        assert_eq!(first.manifest.version, 1);
        assert_eq!(first.partitions.len(), 1);

        let second = repos
            .manifests()
            .create_with_partitions(ManifestCreate {
                dataset_id: dataset.id,
                shard_key: shard.clone(),
                schema_version_id: schema.id,
                parent_manifest_id: Some(first.manifest.id),
                summary: serde_json::json!({"rowCount": 4}),
                statistics: serde_json::json!({}),
                metadata: serde_json::json!({}),
                created_by: None,
                partitions: vec![partition_insert(
                    target.id,
                    schema.id,
                    "2024-01-01T01:00:00Z",
                    "2024-01-01T01:05:00Z",
                )],
            })
            .await
            .unwrap();
        assert_eq!(second.manifest.version, 2);

        // only one published manifest per (dataset, shard)
        let latest = repos
            .manifests()
            .get_latest_published(dataset.id, Some(&shard))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.manifest.id, second.manifest.id);

        let old = repos
            .manifests()
            .get_by_id(first.manifest.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(old.manifest.status, ManifestStatus::Superseded);
    }

    #[tokio::test]
    async fn append_partitions_is_copy_on_write() {
        let catalog = catalog();
        let mut repos = catalog.repositories();
        let dataset = repos
            .datasets()
            .create_or_get("obs-1", "Observations", None, &serde_json::json!({}))
            .await
            .unwrap();
        let target = repos
            .storage_targets()
            .create_or_get("default", StorageTargetKind::LocalFile, &serde_json::json!({}))
            .await
            .unwrap();
        let schema = repos
            .schema_versions()
            .create_or_get(dataset.id, &[SchemaField::new("t", FieldType::Timestamp)])
            .await
            .unwrap();

        let shard = ShardKey::from_string("2024-01-01");
        let first = repos
            .manifests()
            .create_with_partitions(ManifestCreate {
                dataset_id: dataset.id,
                shard_key: shard.clone(),
                schema_version_id: schema.id,
                parent_manifest_id: None,
                summary: serde_json::json!({"rowCount": 2, "partitionCount": 1}),
                statistics: serde_json::json!({}),
                metadata: serde_json::json!({}),
                created_by: None,
                partitions: vec![partition_insert(
                    target.id,
                    schema.id,
                    "2024-01-01T00:00:00Z",
                    "2024-01-01T00:05:00Z",
                )],
            })
            .await
            .unwrap();

        let appended = repos
            .manifests()
            .append_partitions(
                first.manifest.id,
                vec![partition_insert(
                    target.id,
                    schema.id,
                    "2024-01-01T02:00:00Z",
                    "2024-01-01T02:05:00Z",
                )],
                serde_json::json!({"rowCount": 4, "partitionCount": 2}),
                serde_json::json!({"evolution": "additive"}),
                schema.id,
            )
            .await
            .unwrap();

        assert_eq!(appended.manifest.version, 2);
        assert_eq!(appended.manifest.parent_manifest_id, Some(first.manifest.id));
        assert_eq!(appended.partitions.len(), 2);
        assert_eq!(
            appended.manifest.summary,
            serde_json::json!({"rowCount": 4, "partitionCount": 2})
        );

        // the previous manifest no longer owns any partitions
        let old = repos
            .manifests()
            .get_by_id(first.manifest.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(old.manifest.status, ManifestStatus::Superseded);
        assert!(old.partitions.is_empty());

        // appending to a superseded manifest is rejected
        let err = repos
            .manifests()
            .append_partitions(
                first.manifest.id,
                vec![],
                serde_json::json!({}),
                serde_json::json!({}),
                schema.id,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ManifestNotPublished { .. }));
    }

    #[tokio::test]
    async fn ingestion_batch_records_are_unique_per_key() {
        let catalog = catalog();
        let mut repos = catalog.repositories();
        let dataset = repos
            .datasets()
            .create_or_get("obs-1", "Observations", None, &serde_json::json!({}))
            .await
            .unwrap();

        let first = repos
            .ingestion_batches()
            .create_or_get(dataset.id, "k1", ManifestId::new(10))
            .await
            .unwrap();
        let replay = repos
            .ingestion_batches()
            .create_or_get(dataset.id, "k1", ManifestId::new(99))
            .await
            .unwrap();
        assert_eq!(first, replay);
        assert_eq!(replay.manifest_id, ManifestId::new(10));

        let missing = repos.ingestion_batches().get(dataset.id, "k2").await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn watermarks_never_regress() {
        let catalog = catalog();
        let mut repos = catalog.repositories();
        let dataset = repos
            .datasets()
            .create_or_get("obs-1", "Observations", None, &serde_json::json!({}))
            .await
            .unwrap();

        let t1 = data_types::ingest::parse_rfc3339("2024-01-01T00:01:00Z").unwrap();
        let t2 = data_types::ingest::parse_rfc3339("2024-01-01T00:02:00Z").unwrap();

        let w = repos
            .streaming_watermarks()
            .upsert("conn-1", dataset.id, "obs-1", t2, 100, 5)
            .await
            .unwrap();
        assert_eq!(w.sealed_through, t2);
        assert_eq!(w.records_processed, 5);

        // a replayed (older) window must not move the watermark backwards
        let w = repos
            .streaming_watermarks()
            .upsert("conn-1", dataset.id, "obs-1", t1, 50, 5)
            .await
            .unwrap();
        assert_eq!(w.sealed_through, t2);
        assert_eq!(w.records_processed, 10);
    }
}
