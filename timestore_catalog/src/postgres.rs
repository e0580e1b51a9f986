//! Postgres catalog backend.

use crate::interface::{
    merge_json_patch, Catalog, DatasetRepo, Error, IngestionBatchRepo, ManifestCreate,
    ManifestRepo, ManifestSnapshot, PartitionInsert, RepoCollection, Result, SchemaVersionRepo,
    SqlxSnafu, StorageTargetRepo, StreamingWatermarkRepo,
};
use async_trait::async_trait;
use data_types::{
    schema_checksum, ColumnStatistics, Dataset, DatasetId, FileFormat, IngestionBatch, Manifest,
    ManifestId, ManifestStatus, Partition, PartitionMetadata, SchemaField, SchemaVersion,
    SchemaVersionId, ShardKey, StorageTarget, StorageTargetId, StorageTargetKind,
    StreamingWatermark, Timestamp,
};
use snafu::ResultExt;
use sqlx::{
    postgres::{PgPool, PgPoolOptions, PgRow},
    Postgres, Row, Transaction,
};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use timestore_time::TimeProvider;
use tracing::info;
use uuid::Uuid;

/// Maximum number of connections the catalog pool holds.
const MAX_CONNECTIONS: u32 = 10;

/// How long to wait for a connection before erroring.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Postgres-backed catalog.
#[derive(Debug)]
pub struct PostgresCatalog {
    pool: PgPool,
    metrics: Arc<metric::Registry>,
    time_provider: Arc<dyn TimeProvider>,
}

impl PostgresCatalog {
    /// Connect to the database at `dsn`.
    pub async fn connect(
        dsn: &str,
        metrics: Arc<metric::Registry>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(CONNECT_TIMEOUT)
            .connect(dsn)
            .await
            .context(SqlxSnafu)?;
        info!(max_connections = MAX_CONNECTIONS, "connected postgres catalog");
        Ok(Self {
            pool,
            metrics,
            time_provider,
        })
    }
}

const SCHEMA_DDL: &[&str] = &[
    r#"
CREATE TABLE IF NOT EXISTS datasets (
    id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    slug TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    description TEXT,
    default_storage_target_id BIGINT,
    metadata TEXT NOT NULL,
    created_at BIGINT NOT NULL,
    updated_at BIGINT NOT NULL
)
"#,
    r#"
CREATE TABLE IF NOT EXISTS storage_targets (
    id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    kind TEXT NOT NULL,
    config TEXT NOT NULL
)
"#,
    r#"
CREATE TABLE IF NOT EXISTS dataset_schema_versions (
    id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    dataset_id BIGINT NOT NULL,
    version BIGINT NOT NULL,
    fields TEXT NOT NULL,
    checksum TEXT NOT NULL,
    created_at BIGINT NOT NULL,
    UNIQUE (dataset_id, checksum),
    UNIQUE (dataset_id, version)
)
"#,
    r#"
CREATE TABLE IF NOT EXISTS dataset_manifests (
    id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    dataset_id BIGINT NOT NULL,
    version BIGINT NOT NULL,
    status TEXT NOT NULL,
    shard_key TEXT NOT NULL,
    schema_version_id BIGINT NOT NULL,
    parent_manifest_id BIGINT,
    summary TEXT NOT NULL,
    statistics TEXT NOT NULL,
    metadata TEXT NOT NULL,
    created_by TEXT,
    created_at BIGINT NOT NULL,
    published_at BIGINT,
    UNIQUE (dataset_id, version)
)
"#,
    // at most one published manifest per (dataset, shard)
    r#"
CREATE UNIQUE INDEX IF NOT EXISTS dataset_manifests_published_shard
    ON dataset_manifests (dataset_id, shard_key)
    WHERE status = 'published'
"#,
    r#"
CREATE TABLE IF NOT EXISTS dataset_partitions (
    id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    manifest_id BIGINT NOT NULL,
    storage_target_id BIGINT NOT NULL,
    object_store_id UUID NOT NULL,
    file_format TEXT NOT NULL,
    file_path TEXT NOT NULL,
    partition_key TEXT NOT NULL,
    start_time BIGINT NOT NULL,
    end_time BIGINT NOT NULL,
    file_size_bytes BIGINT NOT NULL,
    row_count BIGINT NOT NULL,
    checksum TEXT NOT NULL,
    column_statistics TEXT,
    table_name TEXT NOT NULL,
    schema_version_id BIGINT NOT NULL
)
"#,
    r#"
CREATE INDEX IF NOT EXISTS dataset_partitions_manifest
    ON dataset_partitions (manifest_id)
"#,
    r#"
CREATE TABLE IF NOT EXISTS dataset_ingestion_batches (
    id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    dataset_id BIGINT NOT NULL,
    idempotency_key TEXT NOT NULL,
    manifest_id BIGINT NOT NULL,
    created_at BIGINT NOT NULL,
    UNIQUE (dataset_id, idempotency_key)
)
"#,
    r#"
CREATE TABLE IF NOT EXISTS streaming_watermarks (
    connector_id TEXT NOT NULL,
    dataset_id BIGINT NOT NULL,
    dataset_slug TEXT NOT NULL,
    sealed_through BIGINT NOT NULL,
    backlog_lag_ms BIGINT NOT NULL,
    records_processed BIGINT NOT NULL,
    updated_at BIGINT NOT NULL,
    PRIMARY KEY (dataset_id, connector_id)
)
"#,
];

#[async_trait]
impl Catalog for PostgresCatalog {
    async fn setup(&self) -> Result<()> {
        for ddl in SCHEMA_DDL {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .context(SqlxSnafu)?;
        }
        Ok(())
    }

    fn repositories(&self) -> Box<dyn RepoCollection> {
        Box::new(PostgresTxn {
            pool: self.pool.clone(),
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
        "postgres"
    }
}

#[derive(Debug)]
struct PostgresTxn {
    pool: PgPool,
    time_provider: Arc<dyn TimeProvider>,
}

impl PostgresTxn {
    fn now(&self) -> Timestamp {
        Timestamp::from_time(self.time_provider.now())
    }
}

impl RepoCollection for PostgresTxn {
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

fn json_column(row: &PgRow, column: &str) -> Result<serde_json::Value> {
    let raw: String = row.try_get(column).context(SqlxSnafu)?;
    serde_json::from_str(&raw).map_err(|e| Error::MalformedRow {
        reason: format!("column {column}: {e}"),
    })
}

fn dataset_from_row(row: &PgRow) -> Result<Dataset> {
    Ok(Dataset {
        id: row.try_get("id").context(SqlxSnafu)?,
        slug: row.try_get("slug").context(SqlxSnafu)?,
        name: row.try_get("name").context(SqlxSnafu)?,
        description: row.try_get("description").context(SqlxSnafu)?,
        default_storage_target_id: row
            .try_get("default_storage_target_id")
            .context(SqlxSnafu)?,
        metadata: json_column(row, "metadata")?,
        created_at: row.try_get("created_at").context(SqlxSnafu)?,
        updated_at: row.try_get("updated_at").context(SqlxSnafu)?,
    })
}

fn storage_target_from_row(row: &PgRow) -> Result<StorageTarget> {
    let kind: String = row.try_get("kind").context(SqlxSnafu)?;
    Ok(StorageTarget {
        id: row.try_get("id").context(SqlxSnafu)?,
        name: row.try_get("name").context(SqlxSnafu)?,
        kind: kind.parse().map_err(|reason| Error::MalformedRow { reason })?,
        config: json_column(row, "config")?,
    })
}

fn schema_version_from_row(row: &PgRow) -> Result<SchemaVersion> {
    let fields: String = row.try_get("fields").context(SqlxSnafu)?;
    let fields: Vec<SchemaField> = serde_json::from_str(&fields).map_err(|e| Error::MalformedRow {
        reason: format!("column fields: {e}"),
    })?;
    Ok(SchemaVersion {
        id: row.try_get("id").context(SqlxSnafu)?,
        dataset_id: row.try_get("dataset_id").context(SqlxSnafu)?,
        version: row.try_get("version").context(SqlxSnafu)?,
        fields,
        checksum: row.try_get("checksum").context(SqlxSnafu)?,
        created_at: row.try_get("created_at").context(SqlxSnafu)?,
    })
}

fn manifest_from_row(row: &PgRow) -> Result<Manifest> {
    let status: String = row.try_get("status").context(SqlxSnafu)?;
    let shard_key: String = row.try_get("shard_key").context(SqlxSnafu)?;
    Ok(Manifest {
        id: row.try_get("id").context(SqlxSnafu)?,
        dataset_id: row.try_get("dataset_id").context(SqlxSnafu)?,
        version: row.try_get("version").context(SqlxSnafu)?,
        status: status.parse().map_err(|reason| Error::MalformedRow { reason })?,
        shard_key: ShardKey::from_string(shard_key),
        schema_version_id: row.try_get("schema_version_id").context(SqlxSnafu)?,
        parent_manifest_id: row.try_get("parent_manifest_id").context(SqlxSnafu)?,
        summary: json_column(row, "summary")?,
        statistics: json_column(row, "statistics")?,
        metadata: json_column(row, "metadata")?,
        created_by: row.try_get("created_by").context(SqlxSnafu)?,
        created_at: row.try_get("created_at").context(SqlxSnafu)?,
        published_at: row.try_get("published_at").context(SqlxSnafu)?,
    })
}

fn partition_from_row(row: &PgRow) -> Result<Partition> {
    let file_format: String = row.try_get("file_format").context(SqlxSnafu)?;
    let file_format = match file_format.as_str() {
        "parquet" => FileFormat::Parquet,
        other => {
            return Err(Error::MalformedRow {
                reason: format!("unknown file format: {other}"),
            })
        }
    };
    let partition_key: String = row.try_get("partition_key").context(SqlxSnafu)?;
    let partition_key: BTreeMap<String, String> =
        serde_json::from_str(&partition_key).map_err(|e| Error::MalformedRow {
            reason: format!("column partition_key: {e}"),
        })?;
    let column_statistics: Option<String> = row.try_get("column_statistics").context(SqlxSnafu)?;
    let column_statistics: Option<BTreeMap<String, ColumnStatistics>> = column_statistics
        .map(|raw| {
            serde_json::from_str(&raw).map_err(|e| Error::MalformedRow {
                reason: format!("column column_statistics: {e}"),
            })
        })
        .transpose()?;

    Ok(Partition {
        id: row.try_get("id").context(SqlxSnafu)?,
        manifest_id: row.try_get("manifest_id").context(SqlxSnafu)?,
        storage_target_id: row.try_get("storage_target_id").context(SqlxSnafu)?,
        object_store_id: row.try_get("object_store_id").context(SqlxSnafu)?,
        file_format,
        file_path: row.try_get("file_path").context(SqlxSnafu)?,
        partition_key,
        start_time: row.try_get("start_time").context(SqlxSnafu)?,
        end_time: row.try_get("end_time").context(SqlxSnafu)?,
        file_size_bytes: row.try_get("file_size_bytes").context(SqlxSnafu)?,
        row_count: row.try_get("row_count").context(SqlxSnafu)?,
        checksum: row.try_get("checksum").context(SqlxSnafu)?,
        column_statistics,
        metadata: PartitionMetadata {
            table_name: row.try_get("table_name").context(SqlxSnafu)?,
            schema_version_id: row.try_get("schema_version_id").context(SqlxSnafu)?,
        },
    })
}

fn ingestion_batch_from_row(row: &PgRow) -> Result<IngestionBatch> {
    Ok(IngestionBatch {
        id: row.try_get("id").context(SqlxSnafu)?,
        dataset_id: row.try_get("dataset_id").context(SqlxSnafu)?,
        idempotency_key: row.try_get("idempotency_key").context(SqlxSnafu)?,
        manifest_id: row.try_get("manifest_id").context(SqlxSnafu)?,
        created_at: row.try_get("created_at").context(SqlxSnafu)?,
    })
}

fn watermark_from_row(row: &PgRow) -> Result<StreamingWatermark> {
    Ok(StreamingWatermark {
        connector_id: row.try_get("connector_id").context(SqlxSnafu)?,
        dataset_id: row.try_get("dataset_id").context(SqlxSnafu)?,
        dataset_slug: row.try_get("dataset_slug").context(SqlxSnafu)?,
        sealed_through: row.try_get("sealed_through").context(SqlxSnafu)?,
        backlog_lag_ms: row.try_get("backlog_lag_ms").context(SqlxSnafu)?,
        records_processed: row.try_get("records_processed").context(SqlxSnafu)?,
        updated_at: row.try_get("updated_at").context(SqlxSnafu)?,
    })
}

async fn insert_partition(
    tx: &mut Transaction<'_, Postgres>,
    manifest_id: ManifestId,
    insert: &PartitionInsert,
) -> Result<()> {
    let partition_key =
        serde_json::to_string(&insert.partition_key).expect("map serialization is infallible");
    let column_statistics = insert
        .column_statistics
        .as_ref()
        .map(|s| serde_json::to_string(s).expect("map serialization is infallible"));

    sqlx::query(
        r#"
INSERT INTO dataset_partitions (
    manifest_id, storage_target_id, object_store_id, file_format, file_path,
    partition_key, start_time, end_time, file_size_bytes, row_count,
    checksum, column_statistics, table_name, schema_version_id
) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
"#,
    )
    .bind(manifest_id)
    .bind(insert.storage_target_id)
    .bind(insert.object_store_id)
    .bind(insert.file_format.as_str())
    .bind(&insert.file_path)
    .bind(partition_key)
    .bind(insert.start_time)
    .bind(insert.end_time)
    .bind(insert.file_size_bytes)
    .bind(insert.row_count)
    .bind(&insert.checksum)
    .bind(column_statistics)
    .bind(&insert.table_name)
    .bind(insert.schema_version_id)
    .execute(&mut *tx)
    .await
    .context(SqlxSnafu)?;
    Ok(())
}

async fn manifest_partitions(pool: &PgPool, manifest_id: ManifestId) -> Result<Vec<Partition>> {
    let rows = sqlx::query("SELECT * FROM dataset_partitions WHERE manifest_id = $1 ORDER BY id")
        .bind(manifest_id)
        .fetch_all(pool)
        .await
        .context(SqlxSnafu)?;
    rows.iter().map(partition_from_row).collect()
}

#[async_trait]
impl DatasetRepo for PostgresTxn {
    async fn create_or_get(
        &mut self,
        slug: &str,
        name: &str,
        description: Option<&str>,
        metadata: &serde_json::Value,
    ) -> Result<Dataset> {
        let now = self.now();
        let inserted = sqlx::query(
            r#"
INSERT INTO datasets (slug, name, description, metadata, created_at, updated_at)
VALUES ($1, $2, $3, $4, $5, $5)
ON CONFLICT (slug) DO NOTHING
RETURNING *
"#,
        )
        .bind(slug)
        .bind(name)
        .bind(description)
        .bind(metadata.to_string())
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .context(SqlxSnafu)?;

        match inserted {
            Some(row) => dataset_from_row(&row),
            None => {
                let row = sqlx::query("SELECT * FROM datasets WHERE slug = $1")
                    .bind(slug)
                    .fetch_one(&self.pool)
                    .await
                    .context(SqlxSnafu)?;
                dataset_from_row(&row)
            }
        }
    }

    async fn get_by_slug(&mut self, slug: &str) -> Result<Option<Dataset>> {
        let row = sqlx::query("SELECT * FROM datasets WHERE slug = $1")
            .bind(slug)
            .fetch_optional(&self.pool)
            .await
            .context(SqlxSnafu)?;
        row.as_ref().map(dataset_from_row).transpose()
    }

    async fn get_by_id(&mut self, id: DatasetId) -> Result<Option<Dataset>> {
        let row = sqlx::query("SELECT * FROM datasets WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context(SqlxSnafu)?;
        row.as_ref().map(dataset_from_row).transpose()
    }

    async fn list(&mut self) -> Result<Vec<Dataset>> {
        let rows = sqlx::query("SELECT * FROM datasets ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .context(SqlxSnafu)?;
        rows.iter().map(dataset_from_row).collect()
    }

    async fn update_default_storage_target(
        &mut self,
        id: DatasetId,
        storage_target_id: StorageTargetId,
    ) -> Result<Dataset> {
        let target = sqlx::query("SELECT id FROM storage_targets WHERE id = $1")
            .bind(storage_target_id)
            .fetch_optional(&self.pool)
            .await
            .context(SqlxSnafu)?;
        if target.is_none() {
            return Err(Error::StorageTargetNotFound {
                id: storage_target_id,
            });
        }

        let row = sqlx::query(
            r#"
UPDATE datasets SET default_storage_target_id = $2, updated_at = $3
WHERE id = $1
RETURNING *
"#,
        )
        .bind(id)
        .bind(storage_target_id)
        .bind(self.now())
        .fetch_optional(&self.pool)
        .await
        .context(SqlxSnafu)?;

        match row {
            Some(row) => dataset_from_row(&row),
            None => Err(Error::DatasetNotFound { id }),
        }
    }
}

#[async_trait]
impl StorageTargetRepo for PostgresTxn {
    async fn create_or_get(
        &mut self,
        name: &str,
        kind: StorageTargetKind,
        config: &serde_json::Value,
    ) -> Result<StorageTarget> {
        let inserted = sqlx::query(
            r#"
INSERT INTO storage_targets (name, kind, config)
VALUES ($1, $2, $3)
ON CONFLICT (name) DO NOTHING
RETURNING *
"#,
        )
        .bind(name)
        .bind(kind.as_str())
        .bind(config.to_string())
        .fetch_optional(&self.pool)
        .await
        .context(SqlxSnafu)?;

        match inserted {
            Some(row) => storage_target_from_row(&row),
            None => {
                let row = sqlx::query("SELECT * FROM storage_targets WHERE name = $1")
                    .bind(name)
                    .fetch_one(&self.pool)
                    .await
                    .context(SqlxSnafu)?;
                storage_target_from_row(&row)
            }
        }
    }

    async fn get_by_id(&mut self, id: StorageTargetId) -> Result<Option<StorageTarget>> {
        let row = sqlx::query("SELECT * FROM storage_targets WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context(SqlxSnafu)?;
        row.as_ref().map(storage_target_from_row).transpose()
    }

    async fn get_by_name(&mut self, name: &str) -> Result<Option<StorageTarget>> {
        let row = sqlx::query("SELECT * FROM storage_targets WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .context(SqlxSnafu)?;
        row.as_ref().map(storage_target_from_row).transpose()
    }

    async fn list(&mut self) -> Result<Vec<StorageTarget>> {
        let rows = sqlx::query("SELECT * FROM storage_targets ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .context(SqlxSnafu)?;
        rows.iter().map(storage_target_from_row).collect()
    }
}

#[async_trait]
impl SchemaVersionRepo for PostgresTxn {
    async fn find_by_checksum(
        &mut self,
        dataset_id: DatasetId,
        checksum: &str,
    ) -> Result<Option<SchemaVersion>> {
        let row = sqlx::query(
            "SELECT * FROM dataset_schema_versions WHERE dataset_id = $1 AND checksum = $2",
        )
        .bind(dataset_id)
        .bind(checksum)
        .fetch_optional(&self.pool)
        .await
        .context(SqlxSnafu)?;
        row.as_ref().map(schema_version_from_row).transpose()
    }

    async fn create_or_get(
        &mut self,
        dataset_id: DatasetId,
        fields: &[SchemaField],
    ) -> Result<SchemaVersion> {
        let checksum = schema_checksum(fields);
        let fields_json =
            serde_json::to_string(fields).expect("field serialization is infallible");

        let mut tx = self.pool.begin().await.context(SqlxSnafu)?;
        let inserted = sqlx::query(
            r#"
INSERT INTO dataset_schema_versions (dataset_id, version, fields, checksum, created_at)
SELECT $1,
       COALESCE((SELECT MAX(version) FROM dataset_schema_versions WHERE dataset_id = $1), 0) + 1,
       $2, $3, $4
ON CONFLICT (dataset_id, checksum) DO NOTHING
RETURNING *
"#,
        )
        .bind(dataset_id)
        .bind(fields_json)
        .bind(&checksum)
        .bind(self.now())
        .fetch_optional(&mut tx)
        .await
        .context(SqlxSnafu)?;
        tx.commit().await.context(SqlxSnafu)?;

        match inserted {
            Some(row) => schema_version_from_row(&row),
            None => {
                let row = sqlx::query(
                    "SELECT * FROM dataset_schema_versions WHERE dataset_id = $1 AND checksum = $2",
                )
                .bind(dataset_id)
                .bind(&checksum)
                .fetch_one(&self.pool)
                .await
                .context(SqlxSnafu)?;
                schema_version_from_row(&row)
            }
        }
    }

    async fn next_version(&mut self, dataset_id: DatasetId) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(version), 0) + 1 AS next FROM dataset_schema_versions WHERE dataset_id = $1",
        )
        .bind(dataset_id)
        .fetch_one(&self.pool)
        .await
        .context(SqlxSnafu)?;
        row.try_get("next").context(SqlxSnafu)
    }

    async fn get_by_id(&mut self, id: SchemaVersionId) -> Result<Option<SchemaVersion>> {
        let row = sqlx::query("SELECT * FROM dataset_schema_versions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context(SqlxSnafu)?;
        row.as_ref().map(schema_version_from_row).transpose()
    }
}

#[async_trait]
impl ManifestRepo for PostgresTxn {
    async fn get_latest_published(
        &mut self,
        dataset_id: DatasetId,
        shard: Option<&ShardKey>,
    ) -> Result<Option<ManifestSnapshot>> {
        let row = match shard {
            Some(shard) => sqlx::query(
                r#"
SELECT * FROM dataset_manifests
WHERE dataset_id = $1 AND shard_key = $2 AND status = 'published'
ORDER BY version DESC LIMIT 1
"#,
            )
            .bind(dataset_id)
            .bind(shard.get())
            .fetch_optional(&self.pool)
            .await
            .context(SqlxSnafu)?,
            None => sqlx::query(
                r#"
SELECT * FROM dataset_manifests
WHERE dataset_id = $1 AND status = 'published'
ORDER BY version DESC LIMIT 1
"#,
            )
            .bind(dataset_id)
            .fetch_optional(&self.pool)
            .await
            .context(SqlxSnafu)?,
        };

        let manifest = match row {
            Some(row) => manifest_from_row(&row)?,
            None => return Ok(None),
        };
        let partitions = manifest_partitions(&self.pool, manifest.id).await?;
        Ok(Some(ManifestSnapshot {
            manifest,
            partitions,
        }))
    }

    async fn next_version(&mut self, dataset_id: DatasetId) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(version), 0) + 1 AS next FROM dataset_manifests WHERE dataset_id = $1",
        )
        .bind(dataset_id)
        .fetch_one(&self.pool)
        .await
        .context(SqlxSnafu)?;
        row.try_get("next").context(SqlxSnafu)
    }

    async fn create_with_partitions(&mut self, create: ManifestCreate) -> Result<ManifestSnapshot> {
        let now = self.now();
        let mut tx = self.pool.begin().await.context(SqlxSnafu)?;

        sqlx::query(
            r#"
UPDATE dataset_manifests SET status = 'superseded'
WHERE dataset_id = $1 AND shard_key = $2 AND status = 'published'
"#,
        )
        .bind(create.dataset_id)
        .bind(create.shard_key.get())
        .execute(&mut tx)
        .await
        .context(SqlxSnafu)?;

        let row = sqlx::query(
            r#"
INSERT INTO dataset_manifests (
    dataset_id, version, status, shard_key, schema_version_id,
    parent_manifest_id, summary, statistics, metadata, created_by,
    created_at, published_at
)
SELECT $1,
       COALESCE((SELECT MAX(version) FROM dataset_manifests WHERE dataset_id = $1), 0) + 1,
       'published', $2, $3, $4, $5, $6, $7, $8, $9, $9
RETURNING *
"#,
        )
        .bind(create.dataset_id)
        .bind(create.shard_key.get())
        .bind(create.schema_version_id)
        .bind(create.parent_manifest_id)
        .bind(create.summary.to_string())
        .bind(create.statistics.to_string())
        .bind(create.metadata.to_string())
        .bind(create.created_by.as_deref())
        .bind(now)
        .fetch_one(&mut tx)
        .await
        .context(SqlxSnafu)?;
        let manifest = manifest_from_row(&row)?;

        for insert in &create.partitions {
            insert_partition(&mut tx, manifest.id, insert).await?;
        }
        tx.commit().await.context(SqlxSnafu)?;

        let partitions = manifest_partitions(&self.pool, manifest.id).await?;
        Ok(ManifestSnapshot {
            manifest,
            partitions,
        })
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
        let mut tx = self.pool.begin().await.context(SqlxSnafu)?;

        let row = sqlx::query("SELECT * FROM dataset_manifests WHERE id = $1 FOR UPDATE")
            .bind(manifest_id)
            .fetch_optional(&mut tx)
            .await
            .context(SqlxSnafu)?;
        let previous = match row {
            Some(row) => manifest_from_row(&row)?,
            None => return Err(Error::ManifestNotFound { id: manifest_id }),
        };
        if previous.status != ManifestStatus::Published {
            return Err(Error::ManifestNotPublished { id: manifest_id });
        }

        let mut summary = previous.summary.clone();
        merge_json_patch(&mut summary, &summary_patch);
        let mut metadata = previous.metadata.clone();
        merge_json_patch(&mut metadata, &metadata_patch);

        sqlx::query("UPDATE dataset_manifests SET status = 'superseded' WHERE id = $1")
            .bind(manifest_id)
            .execute(&mut tx)
            .await
            .context(SqlxSnafu)?;

        let row = sqlx::query(
            r#"
INSERT INTO dataset_manifests (
    dataset_id, version, status, shard_key, schema_version_id,
    parent_manifest_id, summary, statistics, metadata, created_by,
    created_at, published_at
)
SELECT $1,
       COALESCE((SELECT MAX(version) FROM dataset_manifests WHERE dataset_id = $1), 0) + 1,
       'published', $2, $3, $4, $5, $6, $7, $8, $9, $9
RETURNING *
"#,
        )
        .bind(previous.dataset_id)
        .bind(previous.shard_key.get())
        .bind(schema_version_id)
        .bind(previous.id)
        .bind(summary.to_string())
        .bind(previous.statistics.to_string())
        .bind(metadata.to_string())
        .bind(previous.created_by.as_deref())
        .bind(now)
        .fetch_one(&mut tx)
        .await
        .context(SqlxSnafu)?;
        let successor = manifest_from_row(&row)?;

        // the successor takes ownership of the existing partitions
        sqlx::query("UPDATE dataset_partitions SET manifest_id = $2 WHERE manifest_id = $1")
            .bind(manifest_id)
            .bind(successor.id)
            .execute(&mut tx)
            .await
            .context(SqlxSnafu)?;
        for insert in &partitions {
            insert_partition(&mut tx, successor.id, insert).await?;
        }
        tx.commit().await.context(SqlxSnafu)?;

        let partitions = manifest_partitions(&self.pool, successor.id).await?;
        Ok(ManifestSnapshot {
            manifest: successor,
            partitions,
        })
    }

    async fn get_by_id(&mut self, id: ManifestId) -> Result<Option<ManifestSnapshot>> {
        let row = sqlx::query("SELECT * FROM dataset_manifests WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context(SqlxSnafu)?;
        let manifest = match row {
            Some(row) => manifest_from_row(&row)?,
            None => return Ok(None),
        };
        let partitions = manifest_partitions(&self.pool, manifest.id).await?;
        Ok(Some(ManifestSnapshot {
            manifest,
            partitions,
        }))
    }
}

#[async_trait]
impl IngestionBatchRepo for PostgresTxn {
    async fn create_or_get(
        &mut self,
        dataset_id: DatasetId,
        idempotency_key: &str,
        manifest_id: ManifestId,
    ) -> Result<IngestionBatch> {
        let inserted = sqlx::query(
            r#"
INSERT INTO dataset_ingestion_batches (dataset_id, idempotency_key, manifest_id, created_at)
VALUES ($1, $2, $3, $4)
ON CONFLICT (dataset_id, idempotency_key) DO NOTHING
RETURNING *
"#,
        )
        .bind(dataset_id)
        .bind(idempotency_key)
        .bind(manifest_id)
        .bind(self.now())
        .fetch_optional(&self.pool)
        .await
        .context(SqlxSnafu)?;

        match inserted {
            Some(row) => ingestion_batch_from_row(&row),
            None => {
                let row = sqlx::query(
                    "SELECT * FROM dataset_ingestion_batches WHERE dataset_id = $1 AND idempotency_key = $2",
                )
                .bind(dataset_id)
                .bind(idempotency_key)
                .fetch_one(&self.pool)
                .await
                .context(SqlxSnafu)?;
                ingestion_batch_from_row(&row)
            }
        }
    }

    async fn get(
        &mut self,
        dataset_id: DatasetId,
        idempotency_key: &str,
    ) -> Result<Option<IngestionBatch>> {
        let row = sqlx::query(
            "SELECT * FROM dataset_ingestion_batches WHERE dataset_id = $1 AND idempotency_key = $2",
        )
        .bind(dataset_id)
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await
        .context(SqlxSnafu)?;
        row.as_ref().map(ingestion_batch_from_row).transpose()
    }
}

#[async_trait]
impl StreamingWatermarkRepo for PostgresTxn {
    async fn upsert(
        &mut self,
        connector_id: &str,
        dataset_id: DatasetId,
        dataset_slug: &str,
        sealed_through: Timestamp,
        backlog_lag_ms: i64,
        records_processed_delta: i64,
    ) -> Result<StreamingWatermark> {
        let row = sqlx::query(
            r#"
INSERT INTO streaming_watermarks (
    connector_id, dataset_id, dataset_slug, sealed_through,
    backlog_lag_ms, records_processed, updated_at
) VALUES ($1, $2, $3, $4, $5, $6, $7)
ON CONFLICT (dataset_id, connector_id) DO UPDATE SET
    sealed_through = GREATEST(streaming_watermarks.sealed_through, EXCLUDED.sealed_through),
    backlog_lag_ms = EXCLUDED.backlog_lag_ms,
    records_processed = streaming_watermarks.records_processed + EXCLUDED.records_processed,
    updated_at = EXCLUDED.updated_at
RETURNING *
"#,
        )
        .bind(connector_id)
        .bind(dataset_id)
        .bind(dataset_slug)
        .bind(sealed_through)
        .bind(backlog_lag_ms)
        .bind(records_processed_delta)
        .bind(self.now())
        .fetch_one(&self.pool)
        .await
        .context(SqlxSnafu)?;
        watermark_from_row(&row)
    }

    async fn get(
        &mut self,
        dataset_id: DatasetId,
        connector_id: &str,
    ) -> Result<Option<StreamingWatermark>> {
        let row = sqlx::query(
            "SELECT * FROM streaming_watermarks WHERE dataset_id = $1 AND connector_id = $2",
        )
        .bind(dataset_id)
        .bind(connector_id)
        .fetch_optional(&self.pool)
        .await
        .context(SqlxSnafu)?;
        row.as_ref().map(watermark_from_row).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use timestore_time::SystemProvider;

    /// Returns the database DSN, or skips the calling test when the
    /// integration environment is not configured.
    macro_rules! maybe_skip_postgres_integration {
        () => {{
            let _ = dotenvy::dotenv();

            match (
                std::env::var("TEST_INTEGRATION").is_ok(),
                std::env::var("DATABASE_URL").ok(),
            ) {
                (true, Some(dsn)) => dsn,
                (true, None) => {
                    panic!(
                        "TEST_INTEGRATION is set which requires running integration tests, but \
                        DATABASE_URL is not set; point it at a scratch postgres database"
                    )
                }
                (false, _) => {
                    eprintln!(
                        "skipping postgres catalog integration test - set TEST_INTEGRATION and \
                        DATABASE_URL to run"
                    );
                    return;
                }
            }
        }};
    }

    #[tokio::test]
    async fn dataset_round_trip() {
        let dsn = maybe_skip_postgres_integration!();
        let catalog = PostgresCatalog::connect(
            &dsn,
            Arc::new(metric::Registry::new()),
            Arc::new(SystemProvider::new()),
        )
        .await
        .unwrap();
        catalog.setup().await.unwrap();

        let mut repos = catalog.repositories();
        let slug = format!("it-{}", Uuid::new_v4());
        let created = repos
            .datasets()
            .create_or_get(&slug, "integration", None, &serde_json::json!({}))
            .await
            .unwrap();
        let fetched = repos.datasets().get_by_slug(&slug).await.unwrap().unwrap();
        assert_eq!(created, fetched);
    }
}
