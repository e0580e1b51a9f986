//! The spool manager: staging, flush preparation, finalize/abort and
//! corruption recovery for every dataset under one staging root.

use crate::{
    lock::{DatasetLocks, DatasetState, FsLock},
    DatasetSummary, Error, Result,
};
use data_types::{
    ingest::{EvolutionOptions, Row, SchemaDescriptor},
    sanitize_dataset_slug,
    schema::FieldType,
    SchemaField, Timestamp,
};
use metric::{Metric, U64Counter, U64Gauge};
use parking_lot::{Mutex, RwLock};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqliteRow},
    ConnectOptions, Connection, Row as SqlxRow,
};
use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use timestore_time::{Time, TimeProvider};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long an operation waits for the cross-process lock file.
const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Total attempts an operation gets when the database keeps surfacing
/// corruption (quarantine + reopen between attempts).
const MAX_OPEN_ATTEMPTS: usize = 3;

const METADATA_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS staging_batches (
    ingestion_signature TEXT PRIMARY KEY,
    batch_id TEXT NOT NULL UNIQUE,
    table_name TEXT NOT NULL,
    schema_json TEXT NOT NULL,
    partition_key TEXT NOT NULL,
    partition_attributes TEXT NOT NULL,
    start_time INTEGER NOT NULL,
    end_time INTEGER NOT NULL,
    row_count INTEGER NOT NULL,
    received_at INTEGER,
    staged_at INTEGER NOT NULL,
    idempotency_key TEXT,
    flush_token TEXT,
    flush_started_at INTEGER
)
"#;

/// Configuration of the spool.
#[derive(Debug, Clone)]
pub struct SpoolConfig {
    /// Directory holding one subdirectory per dataset.
    pub root: PathBuf,
    /// Warn once a single dataset's spool exceeds this many bytes on disk
    /// (0 disables the check).
    pub max_dataset_bytes: u64,
    /// Warn once all spools together exceed this many bytes (0 disables).
    pub max_total_bytes: u64,
    /// Reset interrupted flushes on first open so they become eligible
    /// again. Operators can disable this to inspect a wedged flush.
    pub resume_interrupted_flushes: bool,
}

impl SpoolConfig {
    /// Config with enforcement disabled, rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_dataset_bytes: 0,
            max_total_bytes: 0,
            resume_interrupted_flushes: true,
        }
    }
}

/// Notified when a dataset's staged content changes, so dependent caches can
/// drop stale state.
pub trait StalenessListener: Send + Sync {
    /// The staged content of `dataset_slug` changed.
    fn staging_changed(&self, dataset_slug: &str);
}

/// A request to stage one batch of rows.
#[derive(Debug, Clone)]
pub struct StagePartitionRequest {
    /// Target dataset slug.
    pub dataset_slug: String,
    /// Signature making the request idempotent.
    pub ingestion_signature: String,
    /// Logical table of the rows.
    pub table_name: String,
    /// Schema of the rows.
    pub fields: Vec<SchemaField>,
    /// Evolution options supplied with the request; carried through the
    /// spool so the flush can honour them.
    pub evolution: Option<EvolutionOptions>,
    /// Caller-facing partition key.
    pub partition_key: BTreeMap<String, String>,
    /// Informational partition attributes.
    pub partition_attributes: BTreeMap<String, String>,
    /// Partition time range start.
    pub start_time: Timestamp,
    /// Partition time range end.
    pub end_time: Timestamp,
    /// Caller-supplied idempotency key, if any.
    pub idempotency_key: Option<String>,
    /// When the records were received upstream.
    pub received_at: Option<Timestamp>,
    /// The rows.
    pub rows: Vec<Row>,
}

/// Outcome of [`SpoolManager::stage_partition`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageOutcome {
    /// Id of the staged batch.
    pub batch_id: String,
    /// Rows in the batch.
    pub row_count: i64,
    /// Whether the signature was already staged; if so `batch_id` is the
    /// original batch's id and nothing was written.
    pub already_staged: bool,
}

/// Metadata of one staged batch.
#[derive(Debug, Clone, PartialEq)]
pub struct StagingBatchMeta {
    /// Signature the batch was staged under.
    pub ingestion_signature: String,
    /// Batch id.
    pub batch_id: String,
    /// Logical table of the rows.
    pub table_name: String,
    /// Schema of the rows.
    pub fields: Vec<SchemaField>,
    /// Evolution options supplied with the original request.
    pub evolution: Option<EvolutionOptions>,
    /// Caller-facing partition key.
    pub partition_key: BTreeMap<String, String>,
    /// Informational partition attributes.
    pub partition_attributes: BTreeMap<String, String>,
    /// Partition time range start.
    pub start_time: Timestamp,
    /// Partition time range end.
    pub end_time: Timestamp,
    /// Rows in the batch.
    pub row_count: i64,
    /// When the records were received upstream.
    pub received_at: Option<Timestamp>,
    /// When the batch was staged.
    pub staged_at: Timestamp,
    /// Caller-supplied idempotency key.
    pub idempotency_key: Option<String>,
    /// Flush token if the batch is part of an in-flight flush.
    pub flush_token: Option<String>,
}

/// One batch selected by a flush, with its rows and intermediate export.
#[derive(Debug, Clone)]
pub struct PreparedBatch {
    /// Metadata of the batch.
    pub meta: StagingBatchMeta,
    /// The staged rows, in staging order.
    pub rows: Vec<Row>,
    /// Intermediate parquet export for downstream writers.
    pub parquet_file_path: PathBuf,
}

/// Everything a flush run needs to materialize a dataset's staged batches.
#[derive(Debug, Clone)]
pub struct FlushPreparation {
    /// Token marking the selected batches.
    pub flush_token: String,
    /// When the batches were marked.
    pub prepared_at: Timestamp,
    /// The selected batches, oldest first.
    pub batches: Vec<PreparedBatch>,
}

/// Outcome of [`SpoolManager::abort_flush`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbortSummary {
    /// Batches returned to the pending set.
    pub batches: i64,
    /// Rows across those batches.
    pub rows: i64,
}

/// Retry an operation, quarantining the dataset between attempts when the
/// database surfaces corruption.
macro_rules! with_corruption_recovery {
    ($self:ident, $state:ident, $slug:expr, $op:expr) => {{
        let mut attempts = 1;
        loop {
            let result = $op;
            match result {
                Err($crate::Error::Corruption { reason }) if attempts < MAX_OPEN_ATTEMPTS => {
                    attempts += 1;
                    $self.quarantine(&mut $state, $slug, &reason).await?;
                }
                other => break other,
            }
        }
    }};
}

/// Manages the staging spools of all datasets under one root directory.
pub struct SpoolManager {
    config: SpoolConfig,
    time_provider: Arc<dyn TimeProvider>,
    locks: DatasetLocks,
    listeners: RwLock<Vec<Arc<dyn StalenessListener>>>,
    dataset_bytes: Mutex<HashMap<String, u64>>,

    on_disk_bytes_gauge: Metric<U64Gauge>,
    pending_batches_gauge: Metric<U64Gauge>,
    total_bytes_gauge: U64Gauge,
    corruption_counter: Metric<U64Counter>,
}

impl std::fmt::Debug for SpoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpoolManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SpoolManager {
    /// Create a manager rooted at `config.root`.
    pub fn new(
        config: SpoolConfig,
        metrics: &metric::Registry,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        let on_disk_bytes_gauge = metrics.register_metric(
            "spool_on_disk_bytes",
            "bytes the staging database of a dataset occupies on disk",
        );
        let pending_batches_gauge = metrics.register_metric(
            "spool_pending_batches",
            "staged batches not part of an in-flight flush",
        );
        let total_bytes_gauge = metrics
            .register_metric::<U64Gauge>(
                "spool_total_bytes",
                "bytes all staging databases occupy on disk",
            )
            .recorder(&[("scope", "all")]);
        let corruption_counter = metrics.register_metric(
            "spool_corruption_recovered",
            "times a corrupted staging database was quarantined and reopened",
        );

        Self {
            config,
            time_provider,
            locks: Default::default(),
            listeners: Default::default(),
            dataset_bytes: Default::default(),
            on_disk_bytes_gauge,
            pending_batches_gauge,
            total_bytes_gauge,
            corruption_counter,
        }
    }

    /// Register a listener notified when staged content changes.
    pub fn register_listener(&self, listener: Arc<dyn StalenessListener>) {
        self.listeners.write().push(listener);
    }

    /// Directory holding a dataset's spool.
    pub fn dataset_dir(&self, slug: &str) -> PathBuf {
        self.config.root.join(sanitize_dataset_slug(slug))
    }

    fn db_path(dir: &Path) -> PathBuf {
        dir.join("staging.db")
    }

    fn now(&self) -> Timestamp {
        Timestamp::from_time(self.time_provider.now())
    }

    fn notify_listeners(&self, slug: &str) {
        for listener in self.listeners.read().iter() {
            listener.staging_changed(slug);
        }
    }

    /// Idempotently create the dataset's spool and metadata table.
    pub async fn ensure_schema(&self, slug: &str) -> Result<()> {
        let lock = self.locks.get(slug);
        let mut state = lock.lock().await;
        let dir = self.prepare_dir(slug).await?;
        let _fs_lock = FsLock::acquire(&dir.join("staging.lock"), LOCK_TIMEOUT).await?;

        with_corruption_recovery!(self, state, slug, self.try_ensure(&mut state, &dir).await)
    }

    /// Stage one batch, idempotently by `ingestion_signature`.
    pub async fn stage_partition(&self, request: StagePartitionRequest) -> Result<StageOutcome> {
        check_identifier("table name", &request.table_name)?;
        for field in &request.fields {
            check_identifier("field name", &field.name)?;
        }

        let slug = request.dataset_slug.clone();
        let lock = self.locks.get(&slug);
        let mut state = lock.lock().await;
        let dir = self.prepare_dir(&slug).await?;
        let _fs_lock = FsLock::acquire(&dir.join("staging.lock"), LOCK_TIMEOUT).await?;

        let outcome = with_corruption_recovery!(
            self,
            state,
            &slug,
            self.try_stage(&mut state, &dir, &request).await
        )?;

        self.update_size_bookkeeping(&slug, &dir).await;
        if !outcome.already_staged {
            debug!(
                dataset=%slug,
                batch=%outcome.batch_id,
                rows=outcome.row_count,
                "staged batch",
            );
            self.notify_listeners(&slug);
        }
        Ok(outcome)
    }

    /// Select every pending batch for flushing and export the staged rows.
    ///
    /// Returns `None` when nothing is pending. Batches already carrying a
    /// flush token are never selected, so at most one flush per dataset is
    /// in flight.
    pub async fn prepare_flush(&self, slug: &str) -> Result<Option<FlushPreparation>> {
        let lock = self.locks.get(slug);
        let mut state = lock.lock().await;
        let dir = self.prepare_dir(slug).await?;
        let _fs_lock = FsLock::acquire(&dir.join("staging.lock"), LOCK_TIMEOUT).await?;

        with_corruption_recovery!(self, state, slug, self.try_prepare(&mut state, &dir).await)
    }

    /// Drop the batches of a completed flush and their intermediate files.
    pub async fn finalize_flush(&self, slug: &str, flush_token: &str) -> Result<()> {
        let lock = self.locks.get(slug);
        let mut state = lock.lock().await;
        let dir = self.prepare_dir(slug).await?;
        let _fs_lock = FsLock::acquire(&dir.join("staging.lock"), LOCK_TIMEOUT).await?;

        let (batches, rows) = with_corruption_recovery!(
            self,
            state,
            slug,
            self.try_finalize(&mut state, &dir, flush_token).await
        )?;
        drop(state);

        remove_flush_dir(&dir, flush_token).await;
        self.update_size_bookkeeping(slug, &dir).await;
        info!(dataset=%slug, token=%flush_token, batches, rows, "finalized flush");
        self.notify_listeners(slug);
        Ok(())
    }

    /// Return an interrupted flush's batches to the pending set.
    pub async fn abort_flush(&self, slug: &str, flush_token: &str) -> Result<AbortSummary> {
        let lock = self.locks.get(slug);
        let mut state = lock.lock().await;
        let dir = self.prepare_dir(slug).await?;
        let _fs_lock = FsLock::acquire(&dir.join("staging.lock"), LOCK_TIMEOUT).await?;

        let summary = with_corruption_recovery!(
            self,
            state,
            slug,
            self.try_abort(&mut state, &dir, flush_token).await
        )?;
        drop(state);

        remove_flush_dir(&dir, flush_token).await;
        warn!(
            dataset=%slug,
            token=%flush_token,
            batches=summary.batches,
            rows=summary.rows,
            "aborted flush; batches are pending again",
        );
        Ok(summary)
    }

    /// Aggregate state of the dataset's spool.
    pub async fn dataset_summary(&self, slug: &str) -> Result<DatasetSummary> {
        let lock = self.locks.get(slug);
        let mut state = lock.lock().await;
        let dir = self.prepare_dir(slug).await?;
        let _fs_lock = FsLock::acquire(&dir.join("staging.lock"), LOCK_TIMEOUT).await?;

        with_corruption_recovery!(self, state, slug, self.try_summary(&mut state, &dir).await)
    }

    /// Metadata of every batch not part of an in-flight flush.
    pub async fn list_pending_batches(&self, slug: &str) -> Result<Vec<StagingBatchMeta>> {
        let lock = self.locks.get(slug);
        let mut state = lock.lock().await;
        let dir = self.prepare_dir(slug).await?;
        let _fs_lock = FsLock::acquire(&dir.join("staging.lock"), LOCK_TIMEOUT).await?;

        with_corruption_recovery!(self, state, slug, self.try_list(&mut state, &dir).await)
    }

    /// Quarantine the dataset's staging database; the next operation starts
    /// from an empty spool.
    pub async fn mark_dataset_corrupted(&self, slug: &str, reason: &str) -> Result<()> {
        let lock = self.locks.get(slug);
        let mut state = lock.lock().await;
        let dir = self.prepare_dir(slug).await?;
        let _fs_lock = FsLock::acquire(&dir.join("staging.lock"), LOCK_TIMEOUT).await?;

        self.quarantine(&mut state, slug, reason).await?;
        state.corrupted_reason = Some(reason.to_string());
        Ok(())
    }

    /// Remove the dataset's spool entirely.
    pub async fn drop_dataset_schema(&self, slug: &str) -> Result<()> {
        let lock = self.locks.get(slug);
        let _state = lock.lock().await;

        let dir = self.dataset_dir(slug);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(Error::Io { source }),
        }

        self.dataset_bytes.lock().remove(slug);
        self.on_disk_bytes_gauge
            .recorder(&[("dataset", slug)])
            .set(0);
        self.pending_batches_gauge
            .recorder(&[("dataset", slug)])
            .set(0);
        info!(dataset=%slug, "dropped staging spool");
        Ok(())
    }

    async fn prepare_dir(&self, slug: &str) -> Result<PathBuf> {
        let dir = self.dataset_dir(slug);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| Error::Io { source })?;
        Ok(dir)
    }

    async fn open_conn(dir: &Path) -> Result<SqliteConnection> {
        let options = SqliteConnectOptions::new()
            .filename(Self::db_path(dir))
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        options.connect().await.map_err(classify_sqlx)
    }

    /// Create the metadata table and, once per process generation, reset any
    /// flush interrupted by a crash so its batches become eligible again.
    async fn ensure_open(&self, state: &mut DatasetState, conn: &mut SqliteConnection) -> Result<()> {
        sqlx::query(METADATA_DDL)
            .execute(&mut *conn)
            .await
            .map_err(classify_sqlx)?;

        if !state.recovered {
            if self.config.resume_interrupted_flushes {
                let reset = sqlx::query(
                    "UPDATE staging_batches SET flush_token = NULL, flush_started_at = NULL \
                     WHERE flush_token IS NOT NULL",
                )
                .execute(&mut *conn)
                .await
                .map_err(classify_sqlx)?;
                if reset.rows_affected() > 0 {
                    info!(
                        batches = reset.rows_affected(),
                        "reset interrupted flush; batches are pending again"
                    );
                }
            }
            state.recovered = true;
            state.corrupted_reason = None;
        }
        Ok(())
    }

    async fn try_ensure(&self, state: &mut DatasetState, dir: &Path) -> Result<()> {
        let mut conn = Self::open_conn(dir).await?;
        let result = self.ensure_open(state, &mut conn).await;
        let _ = conn.close().await;
        result
    }

    async fn try_stage(
        &self,
        state: &mut DatasetState,
        dir: &Path,
        request: &StagePartitionRequest,
    ) -> Result<StageOutcome> {
        let mut conn = Self::open_conn(dir).await?;
        let result = self.stage_on_conn(state, &mut conn, request).await;
        let _ = conn.close().await;
        result
    }

    async fn stage_on_conn(
        &self,
        state: &mut DatasetState,
        conn: &mut SqliteConnection,
        request: &StagePartitionRequest,
    ) -> Result<StageOutcome> {
        self.ensure_open(state, conn).await?;

        let mut tx = conn.begin().await.map_err(classify_sqlx)?;

        let existing = sqlx::query(
            "SELECT batch_id, row_count FROM staging_batches WHERE ingestion_signature = ?",
        )
        .bind(&request.ingestion_signature)
        .fetch_optional(&mut tx)
        .await
        .map_err(classify_sqlx)?;
        if let Some(row) = existing {
            return Ok(StageOutcome {
                batch_id: row.try_get("batch_id").map_err(classify_sqlx)?,
                row_count: row.try_get("row_count").map_err(classify_sqlx)?,
                already_staged: true,
            });
        }

        let table = data_table_name(&request.table_name);
        ensure_data_table(&mut tx, &table, &request.fields).await?;

        let batch_id = Uuid::new_v4().to_string();
        let staged_at = self.now();

        let insert_sql = {
            let mut columns: Vec<String> = request
                .fields
                .iter()
                .map(|f| quote_ident(&f.name))
                .collect();
            columns.push(quote_ident("__batch_id"));
            columns.push(quote_ident("__staged_at"));
            let placeholders = vec!["?"; columns.len()].join(", ");
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote_ident(&table),
                columns.join(", "),
                placeholders
            )
        };

        for (i, row) in request.rows.iter().enumerate() {
            let mut query = sqlx::query(&insert_sql);
            for field in &request.fields {
                query = bind_row_value(query, field, i, row)?;
            }
            query = query.bind(&batch_id).bind(staged_at.get());
            query.execute(&mut tx).await.map_err(classify_sqlx)?;
        }

        sqlx::query(
            r#"
INSERT INTO staging_batches (
    ingestion_signature, batch_id, table_name, schema_json, partition_key,
    partition_attributes, start_time, end_time, row_count, received_at,
    staged_at, idempotency_key, flush_token, flush_started_at
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, NULL)
"#,
        )
        .bind(&request.ingestion_signature)
        .bind(&batch_id)
        .bind(&request.table_name)
        .bind(
            serde_json::to_string(&SchemaDescriptor {
                fields: request.fields.clone(),
                evolution: request.evolution.clone(),
            })
            .expect("schema serialization is infallible"),
        )
        .bind(serde_json::to_string(&request.partition_key).expect("map serialization is infallible"))
        .bind(
            serde_json::to_string(&request.partition_attributes)
                .expect("map serialization is infallible"),
        )
        .bind(request.start_time.get())
        .bind(request.end_time.get())
        .bind(request.rows.len() as i64)
        .bind(request.received_at.map(|t| t.get()))
        .bind(staged_at.get())
        .bind(request.idempotency_key.as_deref())
        .execute(&mut tx)
        .await
        .map_err(classify_sqlx)?;

        tx.commit().await.map_err(classify_sqlx)?;

        Ok(StageOutcome {
            batch_id,
            row_count: request.rows.len() as i64,
            already_staged: false,
        })
    }

    async fn try_prepare(
        &self,
        state: &mut DatasetState,
        dir: &Path,
    ) -> Result<Option<FlushPreparation>> {
        let mut conn = Self::open_conn(dir).await?;
        let result = self.prepare_on_conn(state, &mut conn, dir).await;
        let _ = conn.close().await;
        result
    }

    async fn prepare_on_conn(
        &self,
        state: &mut DatasetState,
        conn: &mut SqliteConnection,
        dir: &Path,
    ) -> Result<Option<FlushPreparation>> {
        self.ensure_open(state, conn).await?;

        let flush_token = Uuid::new_v4().to_string();
        let prepared_at = self.now();

        let metas = {
            let mut tx = conn.begin().await.map_err(classify_sqlx)?;
            let rows = sqlx::query(
                "SELECT * FROM staging_batches WHERE flush_token IS NULL \
                 ORDER BY staged_at, rowid",
            )
            .fetch_all(&mut tx)
            .await
            .map_err(classify_sqlx)?;
            if rows.is_empty() {
                return Ok(None);
            }

            sqlx::query(
                "UPDATE staging_batches SET flush_token = ?, flush_started_at = ? \
                 WHERE flush_token IS NULL",
            )
            .bind(&flush_token)
            .bind(prepared_at.get())
            .execute(&mut tx)
            .await
            .map_err(classify_sqlx)?;
            tx.commit().await.map_err(classify_sqlx)?;

            rows.iter()
                .map(batch_meta_from_row)
                .collect::<Result<Vec<_>>>()?
        };

        let flush_dir = dir.join("flush").join(&flush_token);
        tokio::fs::create_dir_all(&flush_dir)
            .await
            .map_err(|source| Error::Io { source })?;

        let mut batches = Vec::with_capacity(metas.len());
        for mut meta in metas {
            meta.flush_token = Some(flush_token.clone());
            let rows = read_batch_rows(conn, &meta).await?;

            // intermediate columnar export for downstream writers
            let export = partition_file::serialize::serialize_rows(
                &meta.fields,
                &rows,
                &serde_json::json!({
                    "batchId": meta.batch_id,
                    "tableName": meta.table_name,
                    "partitionKey": meta.partition_key,
                }),
            )
            .map_err(|source| Error::Export { source })?;
            let parquet_file_path = flush_dir.join(format!("{}.parquet", meta.batch_id));
            tokio::fs::write(&parquet_file_path, &export.bytes)
                .await
                .map_err(|source| Error::Io { source })?;

            batches.push(PreparedBatch {
                meta,
                rows,
                parquet_file_path,
            });
        }

        debug!(token=%flush_token, batches=batches.len(), "prepared flush");
        Ok(Some(FlushPreparation {
            flush_token,
            prepared_at,
            batches,
        }))
    }

    async fn try_finalize(
        &self,
        state: &mut DatasetState,
        dir: &Path,
        flush_token: &str,
    ) -> Result<(i64, i64)> {
        let mut conn = Self::open_conn(dir).await?;
        let result = self.finalize_on_conn(state, &mut conn, flush_token).await;
        let _ = conn.close().await;
        result
    }

    async fn finalize_on_conn(
        &self,
        state: &mut DatasetState,
        conn: &mut SqliteConnection,
        flush_token: &str,
    ) -> Result<(i64, i64)> {
        self.ensure_open(state, conn).await?;

        let mut tx = conn.begin().await.map_err(classify_sqlx)?;
        let rows = sqlx::query(
            "SELECT batch_id, table_name, row_count FROM staging_batches WHERE flush_token = ?",
        )
        .bind(flush_token)
        .fetch_all(&mut tx)
        .await
        .map_err(classify_sqlx)?;

        let mut row_total = 0_i64;
        for row in &rows {
            let batch_id: String = row.try_get("batch_id").map_err(classify_sqlx)?;
            let table_name: String = row.try_get("table_name").map_err(classify_sqlx)?;
            row_total += row.try_get::<i64, _>("row_count").map_err(classify_sqlx)?;
            check_identifier("table name", &table_name)?;

            let delete_sql = format!(
                "DELETE FROM {} WHERE \"__batch_id\" = ?",
                quote_ident(&data_table_name(&table_name))
            );
            sqlx::query(&delete_sql)
                .bind(&batch_id)
                .execute(&mut tx)
                .await
                .map_err(classify_sqlx)?;
        }

        sqlx::query("DELETE FROM staging_batches WHERE flush_token = ?")
            .bind(flush_token)
            .execute(&mut tx)
            .await
            .map_err(classify_sqlx)?;
        tx.commit().await.map_err(classify_sqlx)?;

        Ok((rows.len() as i64, row_total))
    }

    async fn try_abort(
        &self,
        state: &mut DatasetState,
        dir: &Path,
        flush_token: &str,
    ) -> Result<AbortSummary> {
        let mut conn = Self::open_conn(dir).await?;
        let result = self.abort_on_conn(state, &mut conn, flush_token).await;
        let _ = conn.close().await;
        result
    }

    async fn abort_on_conn(
        &self,
        state: &mut DatasetState,
        conn: &mut SqliteConnection,
        flush_token: &str,
    ) -> Result<AbortSummary> {
        self.ensure_open(state, conn).await?;

        let mut tx = conn.begin().await.map_err(classify_sqlx)?;
        let row = sqlx::query(
            "SELECT COUNT(*) AS batches, COALESCE(SUM(row_count), 0) AS row_total \
             FROM staging_batches WHERE flush_token = ?",
        )
        .bind(flush_token)
        .fetch_one(&mut tx)
        .await
        .map_err(classify_sqlx)?;
        let summary = AbortSummary {
            batches: row.try_get("batches").map_err(classify_sqlx)?,
            rows: row.try_get("row_total").map_err(classify_sqlx)?,
        };

        sqlx::query(
            "UPDATE staging_batches SET flush_token = NULL, flush_started_at = NULL \
             WHERE flush_token = ?",
        )
        .bind(flush_token)
        .execute(&mut tx)
        .await
        .map_err(classify_sqlx)?;
        tx.commit().await.map_err(classify_sqlx)?;

        Ok(summary)
    }

    async fn try_summary(&self, state: &mut DatasetState, dir: &Path) -> Result<DatasetSummary> {
        let mut conn = Self::open_conn(dir).await?;
        let result = self.summary_on_conn(state, &mut conn, dir).await;
        let _ = conn.close().await;
        result
    }

    async fn summary_on_conn(
        &self,
        state: &mut DatasetState,
        conn: &mut SqliteConnection,
        dir: &Path,
    ) -> Result<DatasetSummary> {
        self.ensure_open(state, conn).await?;

        let row = sqlx::query(
            "SELECT COUNT(*) AS batches, COALESCE(SUM(row_count), 0) AS row_total, \
                    MIN(staged_at) AS oldest \
             FROM staging_batches WHERE flush_token IS NULL",
        )
        .fetch_one(&mut *conn)
        .await
        .map_err(classify_sqlx)?;
        let flushing = sqlx::query(
            "SELECT COUNT(*) AS batches FROM staging_batches WHERE flush_token IS NOT NULL",
        )
        .fetch_one(&mut *conn)
        .await
        .map_err(classify_sqlx)?;

        Ok(DatasetSummary {
            pending_batch_count: row.try_get("batches").map_err(classify_sqlx)?,
            pending_row_count: row.try_get("row_total").map_err(classify_sqlx)?,
            flushing_batch_count: flushing.try_get("batches").map_err(classify_sqlx)?,
            oldest_staged_at: row
                .try_get::<Option<i64>, _>("oldest")
                .map_err(classify_sqlx)?
                .map(Timestamp::new),
            on_disk_bytes: on_disk_bytes(dir) as i64,
        })
    }

    async fn try_list(
        &self,
        state: &mut DatasetState,
        dir: &Path,
    ) -> Result<Vec<StagingBatchMeta>> {
        let mut conn = Self::open_conn(dir).await?;
        let result = async {
            self.ensure_open(state, &mut conn).await?;
            let rows = sqlx::query(
                "SELECT * FROM staging_batches WHERE flush_token IS NULL \
                 ORDER BY staged_at, rowid",
            )
            .fetch_all(&mut conn)
            .await
            .map_err(classify_sqlx)?;
            rows.iter().map(batch_meta_from_row).collect()
        }
        .await;
        let _ = conn.close().await;
        result
    }

    /// Rename the corrupted database aside and delete its WAL so the next
    /// open starts fresh.
    async fn quarantine(&self, state: &mut DatasetState, slug: &str, reason: &str) -> Result<()> {
        let dir = self.dataset_dir(slug);
        let db = Self::db_path(&dir);

        if db.exists() {
            let quarantined = dir.join(format!(
                "staging.db.corrupt-{}",
                self.time_provider.now().timestamp_millis()
            ));
            tokio::fs::rename(&db, &quarantined)
                .await
                .map_err(|source| Error::Io { source })?;
            warn!(
                dataset=%slug,
                reason=%reason,
                quarantined=%quarantined.display(),
                "quarantined corrupted staging database",
            );
        }
        for suffix in ["-wal", "-shm"] {
            let sidecar = dir.join(format!("staging.db{suffix}"));
            if let Err(e) = tokio::fs::remove_file(&sidecar).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path=%sidecar.display(), %e, "failed to remove staging sidecar");
                }
            }
        }

        self.corruption_counter.recorder(&[("dataset", slug)]).inc(1);
        state.recovered = false;
        Ok(())
    }

    async fn update_size_bookkeeping(&self, slug: &str, dir: &Path) {
        let bytes = on_disk_bytes(dir);
        self.on_disk_bytes_gauge
            .recorder(&[("dataset", slug)])
            .set(bytes);

        let total: u64 = {
            let mut sizes = self.dataset_bytes.lock();
            sizes.insert(slug.to_string(), bytes);
            sizes.values().sum()
        };
        self.total_bytes_gauge.set(total);

        // ceilings only warn; eviction is an operator decision
        if self.config.max_dataset_bytes > 0 && bytes > self.config.max_dataset_bytes {
            warn!(
                dataset=%slug,
                bytes,
                ceiling=self.config.max_dataset_bytes,
                "dataset spool exceeds its byte ceiling",
            );
        }
        if self.config.max_total_bytes > 0 && total > self.config.max_total_bytes {
            warn!(
                total,
                ceiling = self.config.max_total_bytes,
                "staging spools exceed the aggregate byte ceiling",
            );
        }
    }

    /// Update the pending-batches gauge from a fresh summary.
    pub async fn refresh_gauges(&self, slug: &str) -> Result<DatasetSummary> {
        let summary = self.dataset_summary(slug).await?;
        self.pending_batches_gauge
            .recorder(&[("dataset", slug)])
            .set(summary.pending_batch_count as u64);
        Ok(summary)
    }
}

fn data_table_name(table: &str) -> String {
    format!("data_{table}")
}

fn quote_ident(ident: &str) -> String {
    format!("\"{ident}\"")
}

fn check_identifier(what: &'static str, value: &str) -> Result<()> {
    let mut chars = value.chars();
    let ok = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidIdentifier {
            what,
            value: value.to_string(),
        })
    }
}

fn sqlite_type(field_type: FieldType) -> &'static str {
    match field_type {
        FieldType::Timestamp | FieldType::Integer | FieldType::Boolean => "INTEGER",
        FieldType::Double => "REAL",
        FieldType::String => "TEXT",
    }
}

/// Map a sqlx error onto the spool error model, recognizing the corruption
/// signatures SQLite reports for a damaged database or WAL.
fn classify_sqlx(source: sqlx::Error) -> Error {
    let message = source.to_string();
    let lower = message.to_ascii_lowercase();
    let corrupted = [
        "database disk image is malformed",
        "file is not a database",
        "malformed database schema",
    ]
    .iter()
    .any(|marker| lower.contains(marker));

    if corrupted {
        Error::Corruption { reason: message }
    } else {
        Error::Sqlx { source }
    }
}

async fn ensure_data_table(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    table: &str,
    fields: &[SchemaField],
) -> Result<()> {
    let mut columns = vec![
        "\"__batch_id\" TEXT NOT NULL".to_string(),
        "\"__staged_at\" INTEGER NOT NULL".to_string(),
    ];
    columns.extend(
        fields
            .iter()
            .map(|f| format!("{} {}", quote_ident(&f.name), sqlite_type(f.field_type))),
    );
    let create_sql = format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_ident(table),
        columns.join(", ")
    );
    sqlx::query(&create_sql)
        .execute(&mut *tx)
        .await
        .map_err(classify_sqlx)?;

    let pragma = format!("PRAGMA table_info({})", quote_ident(table));
    let existing = sqlx::query(&pragma)
        .fetch_all(&mut *tx)
        .await
        .map_err(classify_sqlx)?;
    let mut existing_types = HashMap::new();
    for row in &existing {
        let name: String = row.try_get("name").map_err(classify_sqlx)?;
        let ty: String = row.try_get("type").map_err(classify_sqlx)?;
        existing_types.insert(name, ty);
    }

    for field in fields {
        let wanted = sqlite_type(field.field_type);
        match existing_types.get(&field.name) {
            Some(existing) if existing.eq_ignore_ascii_case(wanted) => {}
            Some(existing) => {
                // staged data of an earlier batch no longer matches; this is
                // not recoverable in place
                return Err(Error::SchemaDrift {
                    table: table.to_string(),
                    column: field.name.clone(),
                    existing: existing.clone(),
                    requested: wanted.to_string(),
                });
            }
            None => {
                let alter_sql = format!(
                    "ALTER TABLE {} ADD COLUMN {} {}",
                    quote_ident(table),
                    quote_ident(&field.name),
                    wanted
                );
                sqlx::query(&alter_sql)
                    .execute(&mut *tx)
                    .await
                    .map_err(classify_sqlx)?;
            }
        }
    }
    Ok(())
}

type SqliteQuery<'q> = sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>;

fn bind_row_value<'q>(
    query: SqliteQuery<'q>,
    field: &SchemaField,
    row_index: usize,
    row: &Row,
) -> Result<SqliteQuery<'q>> {
    use serde_json::Value;

    let value = row.get(&field.name).filter(|v| !v.is_null());
    let mismatch = || Error::InvalidRow {
        reason: format!(
            "row {} column {:?} is not a valid {}",
            row_index, field.name, field.field_type
        ),
    };

    Ok(match field.field_type {
        FieldType::Timestamp => {
            let micros = value
                .map(|v| match v {
                    Value::String(s) => Time::from_rfc3339(s)
                        .map(|t| t.timestamp_micros())
                        .map_err(|_| mismatch()),
                    // epoch milliseconds from streaming producers
                    Value::Number(n) => n.as_i64().map(|ms| ms * 1_000).ok_or_else(mismatch),
                    _ => Err(mismatch()),
                })
                .transpose()?;
            query.bind(micros)
        }
        FieldType::Integer => {
            let v = value.map(|v| v.as_i64().ok_or_else(mismatch)).transpose()?;
            query.bind(v)
        }
        FieldType::Double => {
            let v = value.map(|v| v.as_f64().ok_or_else(mismatch)).transpose()?;
            query.bind(v)
        }
        FieldType::Boolean => {
            let v = value.map(|v| v.as_bool().ok_or_else(mismatch)).transpose()?;
            query.bind(v)
        }
        FieldType::String => {
            let v = value
                .map(|v| v.as_str().map(ToString::to_string).ok_or_else(mismatch))
                .transpose()?;
            query.bind(v)
        }
    })
}

fn batch_meta_from_row(row: &SqliteRow) -> Result<StagingBatchMeta> {
    let schema_json: String = row.try_get("schema_json").map_err(classify_sqlx)?;
    let schema: SchemaDescriptor =
        serde_json::from_str(&schema_json).map_err(|e| Error::InvalidRow {
            reason: format!("stored schema does not parse: {e}"),
        })?;
    let partition_key: String = row.try_get("partition_key").map_err(classify_sqlx)?;
    let partition_key = serde_json::from_str(&partition_key).map_err(|e| Error::InvalidRow {
        reason: format!("stored partition key does not parse: {e}"),
    })?;
    let partition_attributes: String =
        row.try_get("partition_attributes").map_err(classify_sqlx)?;
    let partition_attributes =
        serde_json::from_str(&partition_attributes).map_err(|e| Error::InvalidRow {
            reason: format!("stored partition attributes do not parse: {e}"),
        })?;

    Ok(StagingBatchMeta {
        ingestion_signature: row.try_get("ingestion_signature").map_err(classify_sqlx)?,
        batch_id: row.try_get("batch_id").map_err(classify_sqlx)?,
        table_name: row.try_get("table_name").map_err(classify_sqlx)?,
        fields: schema.fields,
        evolution: schema.evolution,
        partition_key,
        partition_attributes,
        start_time: Timestamp::new(row.try_get("start_time").map_err(classify_sqlx)?),
        end_time: Timestamp::new(row.try_get("end_time").map_err(classify_sqlx)?),
        row_count: row.try_get("row_count").map_err(classify_sqlx)?,
        received_at: row
            .try_get::<Option<i64>, _>("received_at")
            .map_err(classify_sqlx)?
            .map(Timestamp::new),
        staged_at: Timestamp::new(row.try_get("staged_at").map_err(classify_sqlx)?),
        idempotency_key: row.try_get("idempotency_key").map_err(classify_sqlx)?,
        flush_token: row.try_get("flush_token").map_err(classify_sqlx)?,
    })
}

async fn read_batch_rows(conn: &mut SqliteConnection, meta: &StagingBatchMeta) -> Result<Vec<Row>> {
    check_identifier("table name", &meta.table_name)?;
    for field in &meta.fields {
        check_identifier("field name", &field.name)?;
    }

    let columns: Vec<String> = meta.fields.iter().map(|f| quote_ident(&f.name)).collect();
    let select_sql = format!(
        "SELECT {} FROM {} WHERE \"__batch_id\" = ? ORDER BY rowid",
        columns.join(", "),
        quote_ident(&data_table_name(&meta.table_name))
    );

    let db_rows = sqlx::query(&select_sql)
        .bind(&meta.batch_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(classify_sqlx)?;

    let mut rows = Vec::with_capacity(db_rows.len());
    for db_row in &db_rows {
        let mut row = Row::new();
        for (idx, field) in meta.fields.iter().enumerate() {
            let value = match field.field_type {
                FieldType::Timestamp => db_row
                    .try_get::<Option<i64>, _>(idx)
                    .map_err(classify_sqlx)?
                    .map(|micros| {
                        serde_json::Value::String(
                            Time::from_timestamp_nanos(micros * 1_000).to_rfc3339(),
                        )
                    }),
                FieldType::Integer => db_row
                    .try_get::<Option<i64>, _>(idx)
                    .map_err(classify_sqlx)?
                    .map(|v| serde_json::json!(v)),
                FieldType::Double => db_row
                    .try_get::<Option<f64>, _>(idx)
                    .map_err(classify_sqlx)?
                    .map(|v| serde_json::json!(v)),
                FieldType::Boolean => db_row
                    .try_get::<Option<bool>, _>(idx)
                    .map_err(classify_sqlx)?
                    .map(|v| serde_json::json!(v)),
                FieldType::String => db_row
                    .try_get::<Option<String>, _>(idx)
                    .map_err(classify_sqlx)?
                    .map(serde_json::Value::String),
            };
            row.insert(field.name.clone(), value.unwrap_or(serde_json::Value::Null));
        }
        rows.push(row);
    }
    Ok(rows)
}

fn on_disk_bytes(dir: &Path) -> u64 {
    ["staging.db", "staging.db-wal", "staging.db-shm"]
        .iter()
        .filter_map(|name| std::fs::metadata(dir.join(name)).ok())
        .map(|m| m.len())
        .sum()
}

async fn remove_flush_dir(dir: &Path, flush_token: &str) {
    let flush_dir = dir.join("flush").join(flush_token);
    if let Err(e) = tokio::fs::remove_dir_all(&flush_dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path=%flush_dir.display(), %e, "failed to remove flush directory");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use data_types::ingest::parse_rfc3339;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use timestore_time::{MockProvider, SystemProvider};

    fn manager(root: &Path) -> SpoolManager {
        SpoolManager::new(
            SpoolConfig::new(root),
            &metric::Registry::new(),
            Arc::new(SystemProvider::new()),
        )
    }

    fn request(slug: &str, signature: &str, rows: serde_json::Value) -> StagePartitionRequest {
        StagePartitionRequest {
            dataset_slug: slug.to_string(),
            ingestion_signature: signature.to_string(),
            table_name: "records".to_string(),
            fields: vec![
                SchemaField::new("t", FieldType::Timestamp),
                SchemaField::new("v", FieldType::Double),
            ],
            evolution: None,
            partition_key: BTreeMap::from([("window".to_string(), "w1".to_string())]),
            partition_attributes: BTreeMap::new(),
            start_time: parse_rfc3339("2024-01-01T00:00:00Z").unwrap(),
            end_time: parse_rfc3339("2024-01-01T00:05:00Z").unwrap(),
            idempotency_key: Some("k1".to_string()),
            received_at: None,
            rows: serde_json::from_value(rows).unwrap(),
        }
    }

    fn two_rows() -> serde_json::Value {
        serde_json::json!([
            {"t": "2024-01-01T00:00:00Z", "v": 1.0},
            {"t": "2024-01-01T00:04:00Z", "v": 2.0},
        ])
    }

    #[tokio::test]
    async fn stage_is_idempotent_by_signature() {
        test_helpers::maybe_start_logging();
        let dir = test_helpers::tmp_dir().unwrap();
        let spool = manager(dir.path());

        let first = spool
            .stage_partition(request("obs-1", "sig-1", two_rows()))
            .await
            .unwrap();
        assert!(!first.already_staged);
        assert_eq!(first.row_count, 2);

        let replay = spool
            .stage_partition(request("obs-1", "sig-1", two_rows()))
            .await
            .unwrap();
        assert!(replay.already_staged);
        assert_eq!(replay.batch_id, first.batch_id);

        let summary = spool.dataset_summary("obs-1").await.unwrap();
        assert_eq!(summary.pending_batch_count, 1);
        assert_eq!(summary.pending_row_count, 2);
        assert!(summary.on_disk_bytes > 0);
    }

    #[tokio::test]
    async fn stage_prepare_finalize_round_trips_rows() {
        let dir = test_helpers::tmp_dir().unwrap();
        let spool = manager(dir.path());

        spool
            .stage_partition(request("obs-1", "sig-1", two_rows()))
            .await
            .unwrap();

        let prep = spool.prepare_flush("obs-1").await.unwrap().unwrap();
        assert_eq!(prep.batches.len(), 1);
        let batch = &prep.batches[0];
        assert_eq!(batch.rows.len(), 2);
        assert_eq!(
            batch.rows[0]["t"],
            serde_json::json!("2024-01-01T00:00:00.000Z")
        );
        assert_eq!(batch.rows[0]["v"], serde_json::json!(1.0));
        assert_eq!(batch.rows[1]["v"], serde_json::json!(2.0));
        assert!(batch.parquet_file_path.exists());

        // a second prepare has nothing eligible while the flush is in flight
        assert!(spool.prepare_flush("obs-1").await.unwrap().is_none());

        spool
            .finalize_flush("obs-1", &prep.flush_token)
            .await
            .unwrap();
        let summary = spool.dataset_summary("obs-1").await.unwrap();
        assert_eq!(summary.pending_batch_count, 0);
        assert_eq!(summary.pending_row_count, 0);
        assert_eq!(summary.flushing_batch_count, 0);
        assert!(!batch.parquet_file_path.exists());
    }

    #[tokio::test]
    async fn abort_returns_batches_to_the_pending_set() {
        let dir = test_helpers::tmp_dir().unwrap();
        let spool = manager(dir.path());

        spool
            .stage_partition(request("obs-1", "sig-1", two_rows()))
            .await
            .unwrap();
        let prep = spool.prepare_flush("obs-1").await.unwrap().unwrap();

        let aborted = spool
            .abort_flush("obs-1", &prep.flush_token)
            .await
            .unwrap();
        assert_eq!(aborted, AbortSummary { batches: 1, rows: 2 });

        // eligible again
        let again = spool.prepare_flush("obs-1").await.unwrap().unwrap();
        assert_eq!(again.batches.len(), 1);
        assert_ne!(again.flush_token, prep.flush_token);
    }

    #[tokio::test]
    async fn interrupted_flush_is_reset_on_reopen() {
        let dir = test_helpers::tmp_dir().unwrap();

        {
            let spool = manager(dir.path());
            spool
                .stage_partition(request("obs-1", "sig-1", two_rows()))
                .await
                .unwrap();
            // prepare but never finalize, simulating a crash mid-flush
            spool.prepare_flush("obs-1").await.unwrap().unwrap();
        }

        // a new process generation sees the batch as pending again
        let spool = manager(dir.path());
        let pending = spool.list_pending_batches("obs-1").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].flush_token, None);
    }

    #[tokio::test]
    async fn interrupted_flush_is_kept_when_resume_is_disabled() {
        let dir = test_helpers::tmp_dir().unwrap();

        {
            let spool = manager(dir.path());
            spool
                .stage_partition(request("obs-1", "sig-1", two_rows()))
                .await
                .unwrap();
            spool.prepare_flush("obs-1").await.unwrap().unwrap();
        }

        let mut config = SpoolConfig::new(dir.path());
        config.resume_interrupted_flushes = false;
        let spool = SpoolManager::new(
            config,
            &metric::Registry::new(),
            Arc::new(SystemProvider::new()),
        );
        assert!(spool.list_pending_batches("obs-1").await.unwrap().is_empty());
        let summary = spool.dataset_summary("obs-1").await.unwrap();
        assert_eq!(summary.flushing_batch_count, 1);
    }

    #[tokio::test]
    async fn additive_schema_extends_the_staging_table() {
        let dir = test_helpers::tmp_dir().unwrap();
        let spool = manager(dir.path());

        spool
            .stage_partition(request("obs-1", "sig-1", two_rows()))
            .await
            .unwrap();

        let mut wider = request(
            "obs-1",
            "sig-2",
            serde_json::json!([
                {"t": "2024-01-01T00:06:00Z", "v": 3.0, "tag": "a"},
            ]),
        );
        wider.fields.push(SchemaField::new("tag", FieldType::String));
        spool.stage_partition(wider).await.unwrap();

        let pending = spool.list_pending_batches("obs-1").await.unwrap();
        assert_eq!(pending.len(), 2);
    }

    #[tokio::test]
    async fn incompatible_type_drift_is_fatal() {
        let dir = test_helpers::tmp_dir().unwrap();
        let spool = manager(dir.path());

        spool
            .stage_partition(request("obs-1", "sig-1", two_rows()))
            .await
            .unwrap();

        let mut drifted = request(
            "obs-1",
            "sig-2",
            serde_json::json!([{"t": "2024-01-01T00:06:00Z", "v": "oops"}]),
        );
        drifted.fields[1] = SchemaField::new("v", FieldType::String);

        let err = spool.stage_partition(drifted).await.unwrap_err();
        assert_matches!(err, Error::SchemaDrift { .. });
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn corrupted_database_is_quarantined_and_reopened() {
        test_helpers::maybe_start_logging();
        let dir = test_helpers::tmp_dir().unwrap();

        {
            let spool = manager(dir.path());
            spool
                .stage_partition(request("obs-1", "sig-1", two_rows()))
                .await
                .unwrap();
        }

        // clobber the database file; the next operation must recover
        let db = dir.path().join("obs-1").join("staging.db");
        std::fs::write(&db, b"definitely not a sqlite file").unwrap();

        let spool = manager(dir.path());
        let outcome = spool
            .stage_partition(request("obs-1", "sig-2", two_rows()))
            .await
            .unwrap();
        assert!(!outcome.already_staged);

        let quarantined: Vec<_> = std::fs::read_dir(dir.path().join("obs-1"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with("staging.db.corrupt-"))
            .collect();
        assert_eq!(quarantined.len(), 1);
    }

    #[tokio::test]
    async fn listeners_fire_on_staging_changes() {
        #[derive(Default)]
        struct CountingListener(AtomicUsize);
        impl StalenessListener for CountingListener {
            fn staging_changed(&self, _dataset_slug: &str) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let dir = test_helpers::tmp_dir().unwrap();
        let spool = manager(dir.path());
        let listener = Arc::new(CountingListener::default());
        spool.register_listener(Arc::clone(&listener) as _);

        spool
            .stage_partition(request("obs-1", "sig-1", two_rows()))
            .await
            .unwrap();
        assert_eq!(listener.0.load(Ordering::SeqCst), 1);

        // replay does not change staged content
        spool
            .stage_partition(request("obs-1", "sig-1", two_rows()))
            .await
            .unwrap();
        assert_eq!(listener.0.load(Ordering::SeqCst), 1);

        let prep = spool.prepare_flush("obs-1").await.unwrap().unwrap();
        spool
            .finalize_flush("obs-1", &prep.flush_token)
            .await
            .unwrap();
        assert_eq!(listener.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn drop_dataset_schema_removes_the_spool() {
        let dir = test_helpers::tmp_dir().unwrap();
        let spool = manager(dir.path());

        spool
            .stage_partition(request("obs-1", "sig-1", two_rows()))
            .await
            .unwrap();
        assert!(dir.path().join("obs-1").exists());

        spool.drop_dataset_schema("obs-1").await.unwrap();
        assert!(!dir.path().join("obs-1").exists());
    }

    #[tokio::test]
    async fn summary_reports_oldest_staged_batch() {
        let dir = test_helpers::tmp_dir().unwrap();
        let time_provider = Arc::new(MockProvider::new(Time::from_timestamp_millis(1_000)));
        let spool = SpoolManager::new(
            SpoolConfig::new(dir.path()),
            &metric::Registry::new(),
            Arc::<MockProvider>::clone(&time_provider),
        );

        spool
            .stage_partition(request("obs-1", "sig-1", two_rows()))
            .await
            .unwrap();
        time_provider.inc(Duration::from_secs(60));
        spool
            .stage_partition(request("obs-1", "sig-2", two_rows()))
            .await
            .unwrap();

        let summary = spool.dataset_summary("obs-1").await.unwrap();
        assert_eq!(summary.pending_batch_count, 2);
        assert_eq!(
            summary.oldest_staged_at,
            Some(Timestamp::from_time(Time::from_timestamp_millis(1_000)))
        );
    }
}
