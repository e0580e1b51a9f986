//! The ingestion processor: request validation, staging, flush
//! materialization, manifest updates and event publishing.

use crate::{
    cache::ManifestCache,
    events::{
        Event, EventPublisher, PartitionCreated, SchemaBackfillRequested, SchemaEvolved,
        StreamingWatermarkUpdated,
    },
    job::{IngestError, IngestOutcome, JobPayload, WatermarkUpdate},
    staging_queue::StagingWriteManager,
};
use data_types::{
    evolution::{classify, MigrationPlan, SchemaTransition},
    ingest::{IngestionRequest, ValidationError},
    shard_window, Dataset, ShardKey, StorageTarget, StorageTargetId, Timestamp,
};
use metric::{Metric, U64Counter};
use parking_lot::Mutex;
use partition_file::{driver_for_target, StorageDriver, WritePartitionRequest};
use spool::{FlushPolicy, PreparedBatch, SpoolManager, StagePartitionRequest};
use std::{collections::HashMap, sync::Arc};
use timestore_catalog::{
    interface::{Catalog, ManifestCreate, ManifestSnapshot, PartitionInsert, RepoCollection},
    DEFAULT_STORAGE_TARGET_NAME,
};
use timestore_time::{Time, TimeProvider};
use tracing::{info, warn};
use uuid::Uuid;

/// Orchestrates the ingestion path end to end.
pub struct IngestionProcessor {
    catalog: Arc<dyn Catalog>,
    spool: Arc<SpoolManager>,
    staging: Arc<StagingWriteManager>,
    flush_policy: FlushPolicy,
    events: Arc<dyn EventPublisher>,
    cache: Arc<dyn ManifestCache>,
    time_provider: Arc<dyn TimeProvider>,

    /// Drivers are constructed once per storage target and reused.
    drivers: Mutex<HashMap<StorageTargetId, Arc<dyn StorageDriver>>>,
    /// At most one in-flight flush per dataset.
    flush_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,

    flush_counter: Metric<U64Counter>,
    job_counter: Metric<U64Counter>,
}

impl std::fmt::Debug for IngestionProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionProcessor").finish_non_exhaustive()
    }
}

impl IngestionProcessor {
    /// Create a processor over the given collaborators.
    pub fn new(
        catalog: Arc<dyn Catalog>,
        spool: Arc<SpoolManager>,
        staging: Arc<StagingWriteManager>,
        flush_policy: FlushPolicy,
        events: Arc<dyn EventPublisher>,
        cache: Arc<dyn ManifestCache>,
        metrics: &metric::Registry,
    ) -> Self {
        let flush_counter = metrics.register_metric(
            "ingester_flush_count",
            "counter for different triggers that cause a dataset flush",
        );
        let job_counter = metrics.register_metric(
            "ingester_job_count",
            "processed ingestion jobs by outcome",
        );
        let time_provider = catalog.time_provider();
        Self {
            catalog,
            spool,
            staging,
            flush_policy,
            events,
            cache,
            time_provider,
            drivers: Default::default(),
            flush_locks: Default::default(),
            flush_counter,
            job_counter,
        }
    }

    /// Process one job.
    pub async fn process(&self, payload: JobPayload) -> Result<IngestOutcome, IngestError> {
        let result = match &payload {
            JobPayload::Ingest { ingestion } => self.ingest(ingestion).await,
            JobPayload::Flush { dataset_slug } => {
                self.flush_dataset(dataset_slug)
                    .await
                    .map(|snapshot| match snapshot {
                        Some(snapshot) => materialized(&snapshot, false),
                        None => IngestOutcome::NoOp,
                    })
            }
            JobPayload::StreamingWindow {
                ingestion,
                watermark,
            } => self.streaming_window(ingestion, watermark).await,
        };

        let outcome_label = match &result {
            Ok(IngestOutcome::Materialized { .. }) => "materialized",
            Ok(IngestOutcome::Staged { .. }) => "staged",
            Ok(IngestOutcome::NoOp) => "noop",
            Err(_) => "error",
        };
        self.job_counter
            .recorder(&[("outcome", outcome_label)])
            .inc(1);
        result
    }

    /// Ingest one record batch: validate, resolve, stage, and flush when the
    /// policy fires.
    async fn ingest(&self, request: &IngestionRequest) -> Result<IngestOutcome, IngestError> {
        let validated = request.validate()?;

        // the partition must stay within the shard derived from its start
        let (_, shard_end) = shard_window(validated.start_time);
        if validated.end_time > shard_end {
            return Err(IngestError::Validation {
                source: ValidationError::TimeRangeCrossesShard {
                    start: request.partition.time_range.start.clone(),
                    end: request.partition.time_range.end.clone(),
                },
            });
        }

        let mut repos = self.catalog.repositories();

        let dataset = repos
            .datasets()
            .create_or_get(
                &request.dataset_slug,
                request.dataset_name.as_deref().unwrap_or(&request.dataset_slug),
                None,
                &serde_json::json!({}),
            )
            .await?;

        let target = self
            .resolve_target(repos.as_mut(), &dataset, request.storage_target_id)
            .await?;
        if dataset.default_storage_target_id.is_none() {
            repos
                .datasets()
                .update_default_storage_target(dataset.id, target.id)
                .await?;
        }

        // idempotency short-circuit: a key that already produced a manifest
        // returns it unchanged, with no new partition and no new events
        if let Some(key) = &request.idempotency_key {
            if let Some(batch) = repos.ingestion_batches().get(dataset.id, key).await? {
                let snapshot = repos
                    .manifests()
                    .get_by_id(batch.manifest_id)
                    .await?
                    .ok_or(IngestError::Catalog {
                        source: timestore_catalog::interface::Error::ManifestNotFound {
                            id: batch.manifest_id,
                        },
                    })?;
                info!(
                    dataset=%request.dataset_slug,
                    idempotency_key=%key,
                    manifest=%snapshot.manifest.id,
                    "idempotent replay; returning prior manifest",
                );
                return Ok(materialized(&snapshot, true));
            }
        }

        if request.rows.is_empty() {
            return Ok(IngestOutcome::NoOp);
        }

        let outcome = self
            .staging
            .stage(StagePartitionRequest {
                dataset_slug: request.dataset_slug.clone(),
                ingestion_signature: request.ingestion_signature(),
                table_name: validated.table_name.clone(),
                fields: request.schema.fields.clone(),
                evolution: request.schema.evolution.clone(),
                partition_key: request.partition.key.clone(),
                partition_attributes: request.partition.attributes.clone(),
                start_time: validated.start_time,
                end_time: validated.end_time,
                idempotency_key: request.idempotency_key.clone(),
                received_at: request
                    .received_at
                    .as_deref()
                    .and_then(|s| Time::from_rfc3339(s).ok())
                    .map(Timestamp::from_time),
                rows: request.rows.clone(),
            })
            .await?;

        let summary = self.spool.refresh_gauges(&request.dataset_slug).await?;
        let trigger = self.flush_policy.should_flush(
            &summary,
            dataset.flush_overrides(),
            self.time_provider.now(),
        );

        match trigger {
            Some(trigger) => {
                self.flush_counter
                    .recorder(&[("trigger", trigger.as_str())])
                    .inc(1);
                match self.flush_dataset(&request.dataset_slug).await? {
                    Some(snapshot) => Ok(materialized(&snapshot, false)),
                    // another task flushed the batch first; report it staged
                    None => Ok(IngestOutcome::Staged {
                        batch_id: outcome.batch_id,
                        row_count: outcome.row_count,
                    }),
                }
            }
            None => Ok(IngestOutcome::Staged {
                batch_id: outcome.batch_id,
                row_count: outcome.row_count,
            }),
        }
    }

    async fn streaming_window(
        &self,
        request: &IngestionRequest,
        watermark: &WatermarkUpdate,
    ) -> Result<IngestOutcome, IngestError> {
        let outcome = self.ingest(request).await?;

        let mut repos = self.catalog.repositories();
        let dataset = repos
            .datasets()
            .create_or_get(&request.dataset_slug, &request.dataset_slug, None, &serde_json::json!({}))
            .await?;

        let now = self.time_provider.now();
        let backlog_lag_ms = (now.timestamp_millis()
            - watermark.sealed_through.to_time().timestamp_millis())
        .max(0);
        let stored = repos
            .streaming_watermarks()
            .upsert(
                &watermark.connector_id,
                dataset.id,
                &request.dataset_slug,
                watermark.sealed_through,
                backlog_lag_ms,
                watermark.records_processed,
            )
            .await?;

        self.publish(Event::StreamingWatermarkUpdated(StreamingWatermarkUpdated {
            connector_id: stored.connector_id.clone(),
            dataset_id: stored.dataset_id,
            dataset_slug: stored.dataset_slug.clone(),
            sealed_through: stored.sealed_through,
            backlog_lag_ms: stored.backlog_lag_ms,
        }))
        .await;

        Ok(outcome)
    }

    /// Materialize everything the dataset has staged.
    ///
    /// Returns the final manifest snapshot, or `None` when nothing was
    /// pending. On failure the selected batches return to the pending set
    /// and the error propagates; any already-written partition file stays
    /// behind for an external janitor.
    pub async fn flush_dataset(
        &self,
        slug: &str,
    ) -> Result<Option<ManifestSnapshot>, IngestError> {
        let flush_lock = {
            let mut locks = self.flush_locks.lock();
            Arc::clone(locks.entry(slug.to_string()).or_default())
        };
        let _guard = flush_lock.lock().await;

        let Some(prep) = self.spool.prepare_flush(slug).await? else {
            return Ok(None);
        };

        let mut repos = self.catalog.repositories();
        let mut last_snapshot = None;
        let mut failure = None;
        for batch in &prep.batches {
            match self.materialize_batch(repos.as_mut(), slug, batch).await {
                Ok(snapshot) => last_snapshot = Some(snapshot),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        match failure {
            None => {
                self.spool.finalize_flush(slug, &prep.flush_token).await?;
                Ok(last_snapshot)
            }
            Some(e) => {
                if let Err(abort_err) = self.spool.abort_flush(slug, &prep.flush_token).await {
                    warn!(
                        dataset=%slug,
                        token=%prep.flush_token,
                        %abort_err,
                        "failed to abort flush after materialization error",
                    );
                }
                Err(e)
            }
        }
    }

    /// Steps 5–12 of the ingestion contract for one staged batch.
    async fn materialize_batch(
        &self,
        repos: &mut dyn RepoCollection,
        slug: &str,
        batch: &PreparedBatch,
    ) -> Result<ManifestSnapshot, IngestError> {
        let dataset = repos
            .datasets()
            .create_or_get(slug, slug, None, &serde_json::json!({}))
            .await?;
        let target = self.resolve_target(repos, &dataset, None).await?;

        let shard = ShardKey::derive(batch.meta.start_time);
        let previous_shard = repos
            .manifests()
            .get_latest_published(dataset.id, Some(&shard))
            .await?;
        // the dataset-wide latest is consulted only as the schema baseline
        let baseline = match &previous_shard {
            Some(snapshot) => Some(snapshot.clone()),
            None => repos.manifests().get_latest_published(dataset.id, None).await?,
        };

        let baseline_fields = match &baseline {
            Some(snapshot) => repos
                .schema_versions()
                .get_by_id(snapshot.manifest.schema_version_id)
                .await?
                .map(|v| v.fields),
            None => None,
        };
        let transition = baseline_fields
            .as_deref()
            .map(|fields| classify(fields, &batch.meta.fields));
        let added = match &transition {
            Some(SchemaTransition::Breaking { reasons }) => {
                return Err(IngestError::SchemaEvolution {
                    reasons: reasons.clone(),
                })
            }
            Some(SchemaTransition::Additive { added }) if !added.is_empty() => {
                Some(added.clone())
            }
            _ => None,
        };

        let schema_version = repos
            .schema_versions()
            .create_or_get(dataset.id, &batch.meta.fields)
            .await?;

        let driver = self.driver_for(&target)?;
        let object_store_id = Uuid::new_v4();
        let written = driver
            .write_partition(WritePartitionRequest {
                dataset_slug: slug,
                object_store_id,
                table_name: &batch.meta.table_name,
                partition_key: &batch.meta.partition_key,
                fields: &batch.meta.fields,
                rows: &batch.rows,
            })
            .await?;

        let insert = PartitionInsert {
            storage_target_id: target.id,
            object_store_id,
            file_format: data_types::FileFormat::Parquet,
            file_path: written.relative_path.clone(),
            partition_key: batch.meta.partition_key.clone(),
            start_time: batch.meta.start_time,
            end_time: batch.meta.end_time,
            file_size_bytes: written.file_size_bytes,
            row_count: written.row_count,
            checksum: written.checksum.clone(),
            column_statistics: Some(written.column_statistics.clone()),
            table_name: batch.meta.table_name.clone(),
            schema_version_id: schema_version.id,
        };

        let evolution_metadata = added.as_ref().map(|added| {
            serde_json::json!({
                "evolution": {
                    "addedColumns": added.iter().map(|f| f.name.clone()).collect::<Vec<_>>(),
                    "fromSchemaVersionId": baseline
                        .as_ref()
                        .map(|s| s.manifest.schema_version_id.get()),
                }
            })
        });

        let snapshot = match &previous_shard {
            // a published manifest exists for this shard and the schema is
            // unchanged or additive: append copy-on-write
            Some(previous) => {
                let previous_rows = previous
                    .manifest
                    .summary
                    .get("rowCount")
                    .and_then(serde_json::Value::as_i64)
                    .unwrap_or(0);
                let summary_patch = serde_json::json!({
                    "rowCount": previous_rows + written.row_count,
                    "partitionCount": previous.partitions.len() as i64 + 1,
                });
                repos
                    .manifests()
                    .append_partitions(
                        previous.manifest.id,
                        vec![insert],
                        summary_patch,
                        evolution_metadata.clone().unwrap_or_else(|| serde_json::json!({})),
                        schema_version.id,
                    )
                    .await?
            }
            None => {
                repos
                    .manifests()
                    .create_with_partitions(ManifestCreate {
                        dataset_id: dataset.id,
                        shard_key: shard.clone(),
                        schema_version_id: schema_version.id,
                        parent_manifest_id: baseline.as_ref().map(|s| s.manifest.id),
                        summary: serde_json::json!({
                            "rowCount": written.row_count,
                            "partitionCount": 1,
                        }),
                        statistics: serde_json::json!({}),
                        metadata: evolution_metadata
                            .clone()
                            .unwrap_or_else(|| serde_json::json!({})),
                        created_by: None,
                        partitions: vec![insert],
                    })
                    .await?
            }
        };

        if let Some(key) = &batch.meta.idempotency_key {
            repos
                .ingestion_batches()
                .create_or_get(dataset.id, key, snapshot.manifest.id)
                .await?;
        }

        // refresh the advisory cache; readers tolerate staleness, so this
        // must never fail the job
        self.cache
            .put(dataset.id, shard.clone(), Arc::new(snapshot.clone()));

        info!(
            dataset=%slug,
            shard=%shard,
            manifest=%snapshot.manifest.id,
            version=snapshot.manifest.version,
            rows=written.row_count,
            "materialized staged batch",
        );

        let partition = snapshot
            .partitions
            .iter()
            .find(|p| p.object_store_id == object_store_id);
        if let Some(partition) = partition {
            self.publish(Event::PartitionCreated(PartitionCreated {
                dataset_id: dataset.id,
                dataset_slug: slug.to_string(),
                manifest_id: snapshot.manifest.id,
                partition_id: partition.id,
                partition_key: partition.partition_key.clone(),
                storage_target_id: target.id,
                file_path: partition.file_path.clone(),
                row_count: partition.row_count,
                file_size_bytes: partition.file_size_bytes,
                checksum: Some(partition.checksum.clone()),
                received_at: batch.meta.received_at,
            }))
            .await;
        }

        if let Some(added) = &added {
            let evolution = SchemaEvolved {
                dataset_id: dataset.id,
                dataset_slug: slug.to_string(),
                manifest_id: snapshot.manifest.id,
                previous_manifest_id: baseline.as_ref().map(|s| s.manifest.id),
                schema_version_id: schema_version.id,
                added_columns: added.iter().map(|f| f.name.clone()).collect(),
            };
            self.publish(Event::SchemaEvolved(evolution.clone())).await;

            let backfill_requested = batch
                .meta
                .evolution
                .as_ref()
                .map(|e| e.backfill)
                .unwrap_or(false);
            if backfill_requested {
                let caller_defaults = batch
                    .meta
                    .evolution
                    .as_ref()
                    .map(|e| e.defaults.clone())
                    .unwrap_or_default();
                let plan = MigrationPlan::for_additions(added, &caller_defaults);
                let defaults = plan
                    .added_columns
                    .into_iter()
                    .map(|c| (c.name, c.default.unwrap_or(serde_json::Value::Null)))
                    .collect();
                // fire-and-forget; the ingest does not wait for the backfill
                self.publish(Event::SchemaBackfillRequested(SchemaBackfillRequested {
                    evolution,
                    defaults,
                }))
                .await;
            }
        }

        Ok(snapshot)
    }

    async fn resolve_target(
        &self,
        repos: &mut dyn RepoCollection,
        dataset: &Dataset,
        explicit: Option<StorageTargetId>,
    ) -> Result<StorageTarget, IngestError> {
        if let Some(id) = explicit {
            return repos
                .storage_targets()
                .get_by_id(id)
                .await?
                .ok_or(IngestError::StorageTargetNotFound { id });
        }
        if let Some(id) = dataset.default_storage_target_id {
            return repos
                .storage_targets()
                .get_by_id(id)
                .await?
                .ok_or(IngestError::StorageTargetNotFound { id });
        }
        repos
            .storage_targets()
            .get_by_name(DEFAULT_STORAGE_TARGET_NAME)
            .await?
            .ok_or(IngestError::NoDefaultStorageTarget)
    }

    fn driver_for(&self, target: &StorageTarget) -> Result<Arc<dyn StorageDriver>, IngestError> {
        let mut drivers = self.drivers.lock();
        if let Some(driver) = drivers.get(&target.id) {
            return Ok(Arc::clone(driver));
        }
        let driver = driver_for_target(target)?;
        drivers.insert(target.id, Arc::clone(&driver));
        Ok(driver)
    }

    async fn publish(&self, event: Event) {
        let topic = event.topic();
        if let Err(e) = self.events.publish(event).await {
            warn!(topic, %e, "event publish failed");
        }
    }
}

fn materialized(snapshot: &ManifestSnapshot, replayed: bool) -> IngestOutcome {
    IngestOutcome::Materialized {
        manifest_id: snapshot.manifest.id,
        manifest_version: snapshot.manifest.version,
        partition_count: snapshot.partitions.len(),
        replayed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MockEventPublisher;
    use crate::cache::MemoryManifestCache;
    use assert_matches::assert_matches;
    use data_types::{FlushThresholds, ManifestStatus, StorageTargetKind};
    use spool::{SpoolConfig, SpoolManager};
    use timestore_catalog::mem::MemCatalog;
    use timestore_time::MockProvider;

    struct TestContext {
        catalog: Arc<dyn Catalog>,
        processor: IngestionProcessor,
        events: Arc<MockEventPublisher>,
        time_provider: Arc<MockProvider>,
        _dir: tempfile::TempDir,
    }

    async fn context() -> TestContext {
        context_with_policy(FlushPolicy::default()).await
    }

    async fn context_with_policy(flush_policy: FlushPolicy) -> TestContext {
        test_helpers::maybe_start_logging();
        let dir = test_helpers::tmp_dir().unwrap();
        let metrics = Arc::new(metric::Registry::new());
        let time_provider = Arc::new(MockProvider::new(Time::from_rfc3339(
            "2024-01-02T00:00:00Z",
        )
        .unwrap()));
        let catalog: Arc<dyn Catalog> = Arc::new(MemCatalog::new(
            Arc::clone(&metrics),
            Arc::<MockProvider>::clone(&time_provider),
        ));

        let mut repos = catalog.repositories();
        repos
            .storage_targets()
            .create_or_get(
                DEFAULT_STORAGE_TARGET_NAME,
                StorageTargetKind::LocalFile,
                &serde_json::json!({"root": dir.path().join("storage").to_string_lossy()}),
            )
            .await
            .unwrap();

        let spool = Arc::new(SpoolManager::new(
            SpoolConfig::new(dir.path().join("staging")),
            &metrics,
            Arc::<MockProvider>::clone(&time_provider) as _,
        ));
        let staging = Arc::new(StagingWriteManager::new(Arc::clone(&spool) as _, 4));
        let events = Arc::new(MockEventPublisher::default());

        let processor = IngestionProcessor::new(
            Arc::clone(&catalog),
            spool,
            staging,
            flush_policy,
            Arc::clone(&events) as _,
            Arc::new(MemoryManifestCache::default()),
            &metrics,
        );

        TestContext {
            catalog,
            processor,
            events,
            time_provider,
            _dir: dir,
        }
    }

    fn ingest_request(json: serde_json::Value) -> JobPayload {
        JobPayload::Ingest {
            ingestion: serde_json::from_value(json).unwrap(),
        }
    }

    fn happy_request() -> JobPayload {
        ingest_request(serde_json::json!({
            "datasetSlug": "obs-1",
            "schema": {
                "fields": [
                    {"name": "t", "type": "timestamp"},
                    {"name": "v", "type": "double"},
                ],
            },
            "partition": {
                "key": {"window": "2024-01-01"},
                "timeRange": {
                    "start": "2024-01-01T00:00:00Z",
                    "end": "2024-01-01T00:05:00Z",
                },
            },
            "rows": [
                {"t": "2024-01-01T00:00:00Z", "v": 1.0},
                {"t": "2024-01-01T00:04:00Z", "v": 2.0},
            ],
            "idempotencyKey": "k1",
        }))
    }

    #[tokio::test]
    async fn happy_ingest_creates_dataset_schema_and_manifest() {
        let ctx = context().await;

        let outcome = ctx.processor.process(happy_request()).await.unwrap();
        let manifest_id = assert_matches!(
            outcome,
            IngestOutcome::Materialized {
                manifest_id,
                manifest_version: 1,
                partition_count: 1,
                replayed: false,
            } => manifest_id
        );

        let mut repos = ctx.catalog.repositories();
        let dataset = repos.datasets().get_by_slug("obs-1").await.unwrap().unwrap();
        assert!(dataset.default_storage_target_id.is_some());

        let snapshot = repos
            .manifests()
            .get_by_id(manifest_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.manifest.status, ManifestStatus::Published);
        assert_eq!(snapshot.manifest.shard_key, ShardKey::from_string("2024-01-01"));
        assert_eq!(snapshot.partitions.len(), 1);
        assert_eq!(snapshot.partitions[0].row_count, 2);

        let schema = repos
            .schema_versions()
            .get_by_id(snapshot.manifest.schema_version_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(schema.version, 1);

        assert_eq!(ctx.events.topics(), vec!["partition.created"]);
    }

    #[tokio::test]
    async fn idempotent_replay_returns_the_same_manifest() {
        let ctx = context().await;

        let first = ctx.processor.process(happy_request()).await.unwrap();
        let first_id = assert_matches!(
            first,
            IngestOutcome::Materialized { manifest_id, .. } => manifest_id
        );
        let events_after_first = ctx.events.events().len();

        let replay = ctx.processor.process(happy_request()).await.unwrap();
        assert_matches!(
            replay,
            IngestOutcome::Materialized {
                manifest_id,
                partition_count: 1,
                replayed: true,
                ..
            } => assert_eq!(manifest_id, first_id)
        );

        // no new partition and no new event
        assert_eq!(ctx.events.events().len(), events_after_first);
    }

    #[tokio::test]
    async fn additive_evolution_appends_with_parent_manifest() {
        let ctx = context().await;
        ctx.processor.process(happy_request()).await.unwrap();

        let outcome = ctx
            .processor
            .process(ingest_request(serde_json::json!({
                "datasetSlug": "obs-1",
                "schema": {
                    "fields": [
                        {"name": "t", "type": "timestamp"},
                        {"name": "v", "type": "double"},
                        {"name": "tag", "type": "string"},
                    ],
                },
                "partition": {
                    "key": {"window": "2024-01-01"},
                    "timeRange": {
                        "start": "2024-01-01T01:00:00Z",
                        "end": "2024-01-01T01:05:00Z",
                    },
                },
                "rows": [
                    {"t": "2024-01-01T01:00:00Z", "v": 3.0, "tag": "a"},
                ],
                "idempotencyKey": "k2",
            })))
            .await
            .unwrap();

        let manifest_id = assert_matches!(
            outcome,
            IngestOutcome::Materialized {
                manifest_id,
                manifest_version: 2,
                partition_count: 2,
                replayed: false,
            } => manifest_id
        );

        let mut repos = ctx.catalog.repositories();
        let snapshot = repos
            .manifests()
            .get_by_id(manifest_id)
            .await
            .unwrap()
            .unwrap();
        assert!(snapshot.manifest.parent_manifest_id.is_some());
        assert_eq!(
            snapshot.manifest.summary["rowCount"],
            serde_json::json!(3)
        );

        let schema = repos
            .schema_versions()
            .get_by_id(snapshot.manifest.schema_version_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(schema.version, 2);

        let topics = ctx.events.topics();
        assert_eq!(
            topics,
            vec!["partition.created", "partition.created", "schema.evolved"]
        );
        let evolved = ctx
            .events
            .events()
            .into_iter()
            .find_map(|e| match e {
                Event::SchemaEvolved(payload) => Some(payload),
                _ => None,
            })
            .unwrap();
        assert_eq!(evolved.added_columns, vec!["tag"]);
    }

    #[tokio::test]
    async fn backfill_request_is_published_with_per_column_defaults() {
        let ctx = context().await;
        ctx.processor.process(happy_request()).await.unwrap();

        ctx.processor
            .process(ingest_request(serde_json::json!({
                "datasetSlug": "obs-1",
                "schema": {
                    "fields": [
                        {"name": "t", "type": "timestamp"},
                        {"name": "v", "type": "double"},
                        {"name": "tag", "type": "string"},
                        {"name": "weight", "type": "double"},
                    ],
                    "evolution": {
                        "defaults": {"tag": "unknown"},
                        "backfill": true,
                    },
                },
                "partition": {
                    "key": {"window": "2024-01-01"},
                    "timeRange": {
                        "start": "2024-01-01T03:00:00Z",
                        "end": "2024-01-01T03:05:00Z",
                    },
                },
                "rows": [
                    {"t": "2024-01-01T03:00:00Z", "v": 1.0, "tag": "a", "weight": 0.5},
                ],
                "idempotencyKey": "k3",
            })))
            .await
            .unwrap();

        let backfill = ctx
            .events
            .events()
            .into_iter()
            .find_map(|e| match e {
                Event::SchemaBackfillRequested(payload) => Some(payload),
                _ => None,
            })
            .unwrap();
        assert_eq!(backfill.evolution.added_columns, vec!["tag", "weight"]);
        // columns without a caller-supplied default carry an explicit null
        assert_eq!(backfill.defaults["tag"], serde_json::json!("unknown"));
        assert_eq!(backfill.defaults["weight"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn breaking_evolution_fails_without_catalog_changes() {
        let ctx = context().await;
        let first = ctx.processor.process(happy_request()).await.unwrap();
        let first_id = assert_matches!(
            first,
            IngestOutcome::Materialized { manifest_id, .. } => manifest_id
        );

        let err = ctx
            .processor
            .process(ingest_request(serde_json::json!({
                "datasetSlug": "obs-1",
                "schema": {
                    "fields": [
                        {"name": "t", "type": "timestamp"},
                        {"name": "v", "type": "integer"},
                    ],
                },
                "partition": {
                    "key": {"window": "2024-01-01"},
                    "timeRange": {
                        "start": "2024-01-01T02:00:00Z",
                        "end": "2024-01-01T02:05:00Z",
                    },
                },
                "rows": [{"t": "2024-01-01T02:00:00Z", "v": 1}],
            })))
            .await
            .unwrap_err();

        assert_matches!(&err, IngestError::SchemaEvolution { reasons } => {
            assert_eq!(reasons, &["column v changed type from double to integer"]);
        });
        assert!(!err.is_retryable());

        // the published manifest is unchanged
        let mut repos = ctx.catalog.repositories();
        let dataset = repos.datasets().get_by_slug("obs-1").await.unwrap().unwrap();
        let latest = repos
            .manifests()
            .get_latest_published(dataset.id, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.manifest.id, first_id);
        assert_eq!(latest.partitions.len(), 1);
    }

    #[tokio::test]
    async fn empty_rows_are_a_noop() {
        let ctx = context().await;
        let outcome = ctx
            .processor
            .process(ingest_request(serde_json::json!({
                "datasetSlug": "obs-1",
                "schema": {"fields": [{"name": "t", "type": "timestamp"}]},
                "partition": {
                    "key": {},
                    "timeRange": {
                        "start": "2024-01-01T00:00:00Z",
                        "end": "2024-01-01T00:00:00Z",
                    },
                },
                "rows": [],
            })))
            .await
            .unwrap();
        assert_matches!(outcome, IngestOutcome::NoOp);

        let mut repos = ctx.catalog.repositories();
        let dataset = repos.datasets().get_by_slug("obs-1").await.unwrap().unwrap();
        assert!(repos
            .manifests()
            .get_latest_published(dataset.id, None)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn thresholds_keep_batches_staged_until_a_flush_job() {
        let ctx = context_with_policy(FlushPolicy::new(
            FlushThresholds {
                max_rows: 100,
                max_bytes: 0,
                max_age_ms: 0,
            },
            false,
        ))
        .await;

        let outcome = ctx.processor.process(happy_request()).await.unwrap();
        assert_matches!(outcome, IngestOutcome::Staged { row_count: 2, .. });
        assert!(ctx.events.events().is_empty());

        let flushed = ctx
            .processor
            .process(JobPayload::Flush {
                dataset_slug: "obs-1".to_string(),
            })
            .await
            .unwrap();
        assert_matches!(
            flushed,
            IngestOutcome::Materialized {
                manifest_version: 1,
                partition_count: 1,
                ..
            }
        );
        assert_eq!(ctx.events.topics(), vec!["partition.created"]);

        // nothing staged, nothing to flush
        let nothing = ctx
            .processor
            .process(JobPayload::Flush {
                dataset_slug: "obs-1".to_string(),
            })
            .await
            .unwrap();
        assert_matches!(nothing, IngestOutcome::NoOp);
    }

    #[tokio::test]
    async fn streaming_window_advances_the_watermark() {
        let ctx = context().await;
        let sealed_through =
            data_types::ingest::parse_rfc3339("2024-01-01T00:05:00Z").unwrap();

        let payload = assert_matches!(happy_request(), JobPayload::Ingest { ingestion } => {
            JobPayload::StreamingWindow {
                ingestion,
                watermark: WatermarkUpdate {
                    connector_id: "conn-1".to_string(),
                    sealed_through,
                    records_processed: 2,
                },
            }
        });

        let outcome = ctx.processor.process(payload).await.unwrap();
        assert_matches!(outcome, IngestOutcome::Materialized { .. });

        let mut repos = ctx.catalog.repositories();
        let dataset = repos.datasets().get_by_slug("obs-1").await.unwrap().unwrap();
        let watermark = repos
            .streaming_watermarks()
            .get(dataset.id, "conn-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(watermark.sealed_through, sealed_through);
        assert_eq!(watermark.records_processed, 2);
        // the mock clock sits at 2024-01-02T00:00:00Z
        assert_eq!(
            watermark.backlog_lag_ms,
            ctx.time_provider.now().timestamp_millis()
                - sealed_through.to_time().timestamp_millis()
        );

        assert!(ctx
            .events
            .topics()
            .contains(&"streaming.watermark.updated"));
    }

    #[tokio::test]
    async fn time_range_crossing_its_shard_is_rejected() {
        let ctx = context().await;
        let err = ctx
            .processor
            .process(ingest_request(serde_json::json!({
                "datasetSlug": "obs-1",
                "schema": {"fields": [{"name": "t", "type": "timestamp"}]},
                "partition": {
                    "key": {},
                    "timeRange": {
                        "start": "2024-01-01T23:00:00Z",
                        "end": "2024-01-02T01:00:00Z",
                    },
                },
                "rows": [{"t": "2024-01-01T23:30:00Z"}],
            })))
            .await
            .unwrap_err();
        assert_matches!(
            err,
            IngestError::Validation {
                source: ValidationError::TimeRangeCrossesShard { .. }
            }
        );
    }

    #[tokio::test]
    async fn unknown_explicit_storage_target_is_rejected() {
        let ctx = context().await;
        let err = ctx
            .processor
            .process(ingest_request(serde_json::json!({
                "datasetSlug": "obs-1",
                "storageTargetId": 999,
                "schema": {"fields": [{"name": "t", "type": "timestamp"}]},
                "partition": {
                    "key": {},
                    "timeRange": {
                        "start": "2024-01-01T00:00:00Z",
                        "end": "2024-01-01T00:00:00Z",
                    },
                },
                "rows": [{"t": "2024-01-01T00:00:00Z"}],
            })))
            .await
            .unwrap_err();
        assert_matches!(err, IngestError::StorageTargetNotFound { .. });
        assert!(!err.is_retryable());
    }
}
