//! Shared data types for the Timestore catalog, spool, ingestion and
//! streaming paths.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt::{Display, Formatter},
};
use timestore_time::Time;
use uuid::Uuid;

pub mod evolution;
pub mod ingest;
pub mod schema;

pub use schema::{schema_checksum, FieldType, SchemaField};

/// Unique ID for a `Dataset`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, sqlx::Type, Serialize, Deserialize,
)]
#[sqlx(transparent)]
pub struct DatasetId(i64);

#[allow(missing_docs)]
impl DatasetId {
    pub fn new(v: i64) -> Self {
        Self(v)
    }
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl Display for DatasetId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique ID for a `StorageTarget`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, sqlx::Type, Serialize, Deserialize,
)]
#[sqlx(transparent)]
pub struct StorageTargetId(i64);

#[allow(missing_docs)]
impl StorageTargetId {
    pub fn new(v: i64) -> Self {
        Self(v)
    }
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl Display for StorageTargetId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique ID for a `SchemaVersion`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, sqlx::Type, Serialize, Deserialize,
)]
#[sqlx(transparent)]
pub struct SchemaVersionId(i64);

#[allow(missing_docs)]
impl SchemaVersionId {
    pub fn new(v: i64) -> Self {
        Self(v)
    }
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl Display for SchemaVersionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique ID for a `Manifest`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, sqlx::Type, Serialize, Deserialize,
)]
#[sqlx(transparent)]
pub struct ManifestId(i64);

#[allow(missing_docs)]
impl ManifestId {
    pub fn new(v: i64) -> Self {
        Self(v)
    }
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl Display for ManifestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique ID for a `Partition`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, sqlx::Type, Serialize, Deserialize,
)]
#[sqlx(transparent)]
pub struct PartitionId(i64);

#[allow(missing_docs)]
impl PartitionId {
    pub fn new(v: i64) -> Self {
        Self(v)
    }
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl Display for PartitionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique ID for an `IngestionBatch` idempotency record.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, sqlx::Type, Serialize, Deserialize,
)]
#[sqlx(transparent)]
pub struct IngestionBatchId(i64);

#[allow(missing_docs)]
impl IngestionBatchId {
    pub fn new(v: i64) -> Self {
        Self(v)
    }
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl Display for IngestionBatchId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A civil timestamp stored as microseconds since the unix epoch.
///
/// Used for all persisted instants so the catalog backends share one column
/// representation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, sqlx::Type, Serialize, Deserialize,
)]
#[sqlx(transparent)]
pub struct Timestamp(i64);

#[allow(missing_docs)]
impl Timestamp {
    pub fn new(micros: i64) -> Self {
        Self(micros)
    }

    pub fn get(&self) -> i64 {
        self.0
    }

    pub fn from_time(time: Time) -> Self {
        Self(time.timestamp_micros())
    }

    pub fn to_time(self) -> Time {
        Time::from_timestamp_nanos(self.0 * 1_000)
    }

    /// Render as RFC 3339 (UTC, millisecond precision).
    pub fn to_rfc3339(self) -> String {
        self.to_time().to_rfc3339()
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_rfc3339())
    }
}

/// A coarse time bucket manifests are sharded by, derived from a partition's
/// start time.
///
/// One UTC day per shard; all partitions whose start time falls on the same
/// day share a shard, and at most one published manifest exists per
/// `(dataset, shard)`.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, sqlx::Type, Serialize, Deserialize,
)]
#[sqlx(transparent)]
pub struct ShardKey(String);

impl ShardKey {
    /// Derive the shard for a partition start time.
    pub fn derive(start_time: Timestamp) -> Self {
        Self(start_time.to_time().date_time().format("%Y-%m-%d").to_string())
    }

    /// Reconstruct from a previously derived value.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// The shard as a string.
    pub fn get(&self) -> &str {
        &self.0
    }
}

impl Display for ShardKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The time window `[day start, next day start]` of the shard derived from
/// `start_time`. A partition's time range must stay within this window for
/// the shard derivation to be meaningful.
pub fn shard_window(start_time: Timestamp) -> (Timestamp, Timestamp) {
    const DAY_MICROS: i64 = 24 * 60 * 60 * 1_000_000;
    let day_start = start_time.get().div_euclid(DAY_MICROS) * DAY_MICROS;
    (Timestamp::new(day_start), Timestamp::new(day_start + DAY_MICROS))
}

/// Characters preserved as-is when a dataset slug is turned into a directory
/// name; everything else is percent-encoded.
const SLUG_KEEP: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.');

/// Turn a dataset slug into a filesystem-safe directory name.
pub fn sanitize_dataset_slug(slug: &str) -> String {
    utf8_percent_encode(&slug.to_ascii_lowercase(), SLUG_KEEP).to_string()
}

/// A dataset: the unit of ingestion, manifest versioning and spooling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    /// The id of the dataset.
    pub id: DatasetId,
    /// Unique, caller-facing slug.
    pub slug: String,
    /// Human readable name.
    pub name: String,
    /// Optional description.
    pub description: Option<String>,
    /// Storage target used when an ingestion does not name one.
    pub default_storage_target_id: Option<StorageTargetId>,
    /// Opaque metadata, including optional staging/flush overrides.
    pub metadata: serde_json::Value,
    /// When the dataset was first created.
    pub created_at: Timestamp,
    /// When the dataset was last modified.
    pub updated_at: Timestamp,
}

impl Dataset {
    /// Parse the flush threshold overrides carried in the dataset metadata,
    /// if any. Negative override values clamp to zero.
    pub fn flush_overrides(&self) -> FlushOverrides {
        FlushOverrides::from_metadata(&self.metadata)
    }
}

/// The kind of backend a [`StorageTarget`] writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageTargetKind {
    /// Partition files on a local filesystem root.
    LocalFile,
    /// Partition files in an object store bucket.
    ObjectStore,
    /// An external columnar warehouse; writes are delegated to an external
    /// writer and not performed by the core storage driver.
    ColumnarDb,
}

impl StorageTargetKind {
    /// Stable string form, matching the wire/config representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LocalFile => "local-file",
            Self::ObjectStore => "object-store",
            Self::ColumnarDb => "columnar-db",
        }
    }
}

impl std::str::FromStr for StorageTargetKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local-file" => Ok(Self::LocalFile),
            "object-store" => Ok(Self::ObjectStore),
            "columnar-db" => Ok(Self::ColumnarDb),
            other => Err(format!("unknown storage target kind: {other}")),
        }
    }
}

impl Display for StorageTargetKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A place partition files can be written to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageTarget {
    /// The id of the storage target.
    pub id: StorageTargetId,
    /// Unique name.
    pub name: String,
    /// Which backend this target uses.
    pub kind: StorageTargetKind,
    /// Backend-specific configuration (e.g. the filesystem root).
    pub config: serde_json::Value,
}

/// An immutable, versioned dataset schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaVersion {
    /// The id of the schema version.
    pub id: SchemaVersionId,
    /// The dataset this schema belongs to.
    pub dataset_id: DatasetId,
    /// Monotonic version, starting at 1.
    pub version: i64,
    /// Ordered field list.
    pub fields: Vec<SchemaField>,
    /// Canonical hash of the ordered `(name, type)` list.
    pub checksum: String,
    /// When this version was recorded.
    pub created_at: Timestamp,
}

/// Lifecycle state of a [`Manifest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestStatus {
    /// Being assembled, not yet visible to readers.
    Draft,
    /// The current manifest for its `(dataset, shard)`.
    Published,
    /// Replaced by a newer published manifest.
    Superseded,
}

impl ManifestStatus {
    /// Stable string form used by the catalog backends.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Published => "published",
            Self::Superseded => "superseded",
        }
    }
}

impl std::str::FromStr for ManifestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "published" => Ok(Self::Published),
            "superseded" => Ok(Self::Superseded),
            other => Err(format!("unknown manifest status: {other}")),
        }
    }
}

impl Display for ManifestStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A versioned, published set of partitions for one dataset shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// The id of the manifest.
    pub id: ManifestId,
    /// The dataset this manifest belongs to.
    pub dataset_id: DatasetId,
    /// Monotonic version per dataset.
    pub version: i64,
    /// Lifecycle state.
    pub status: ManifestStatus,
    /// The time shard this manifest covers.
    pub shard_key: ShardKey,
    /// The schema its partitions were written with.
    pub schema_version_id: SchemaVersionId,
    /// The manifest this one evolved from, if any.
    pub parent_manifest_id: Option<ManifestId>,
    /// Free-form summary (row/partition counts and the like).
    pub summary: serde_json::Value,
    /// Free-form statistics.
    pub statistics: serde_json::Value,
    /// Free-form metadata (e.g. recorded schema evolution).
    pub metadata: serde_json::Value,
    /// Who created the manifest.
    pub created_by: Option<String>,
    /// When the manifest row was created.
    pub created_at: Timestamp,
    /// When the manifest became the published one for its shard.
    pub published_at: Option<Timestamp>,
}

/// File format of a partition file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    /// Apache Parquet.
    Parquet,
}

impl FileFormat {
    /// Stable string form (also the file extension).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parquet => "parquet",
        }
    }
}

impl Display for FileFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-column statistics recorded when a partition is written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnStatistics {
    /// Minimum non-null value, rendered as JSON.
    pub min: Option<serde_json::Value>,
    /// Maximum non-null value, rendered as JSON.
    pub max: Option<serde_json::Value>,
    /// Number of null values.
    pub null_count: i64,
}

/// Extra metadata carried by each partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionMetadata {
    /// Logical table the rows belong to.
    pub table_name: String,
    /// Schema the rows were written with.
    pub schema_version_id: SchemaVersionId,
}

/// One immutable columnar file plus its metadata, covering a bounded time
/// range of a dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    /// The id of the partition.
    pub id: PartitionId,
    /// The manifest that owns this partition.
    pub manifest_id: ManifestId,
    /// Where the file lives.
    pub storage_target_id: StorageTargetId,
    /// The uuid naming the file within the storage target.
    pub object_store_id: Uuid,
    /// File format of the partition file.
    pub file_format: FileFormat,
    /// Path of the file relative to the storage target root.
    pub file_path: String,
    /// Caller-facing partition key.
    pub partition_key: BTreeMap<String, String>,
    /// Minimum row timestamp.
    pub start_time: Timestamp,
    /// Maximum row timestamp; `end_time >= start_time`.
    pub end_time: Timestamp,
    /// Size of the file in bytes.
    pub file_size_bytes: i64,
    /// Number of rows.
    pub row_count: i64,
    /// Content hash of the serialized file.
    pub checksum: String,
    /// Per-column statistics, if computed.
    pub column_statistics: Option<BTreeMap<String, ColumnStatistics>>,
    /// Table name and schema version the rows were written with.
    pub metadata: PartitionMetadata,
}

impl Partition {
    /// The shard this partition belongs to, derived from its start time.
    pub fn shard_key(&self) -> ShardKey {
        ShardKey::derive(self.start_time)
    }
}

/// Idempotency record mapping a caller-supplied key to the manifest its
/// ingestion produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestionBatch {
    /// The id of the record.
    pub id: IngestionBatchId,
    /// The dataset the ingestion targeted.
    pub dataset_id: DatasetId,
    /// Caller-supplied idempotency key, unique per dataset.
    pub idempotency_key: String,
    /// The manifest the ingestion landed in.
    pub manifest_id: ManifestId,
    /// When the record was created.
    pub created_at: Timestamp,
}

/// The monotonically advancing sealed-through position of a streaming
/// connector for a dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingWatermark {
    /// The connector that produced the records.
    pub connector_id: String,
    /// The dataset they were ingested into.
    pub dataset_id: DatasetId,
    /// Slug of that dataset, denormalized for operator queries.
    pub dataset_slug: String,
    /// All windows ending at or before this instant have been flushed.
    pub sealed_through: Timestamp,
    /// How far behind real time the connector was at the last flush.
    pub backlog_lag_ms: i64,
    /// Total records flushed by the connector into the dataset.
    pub records_processed: i64,
    /// When the watermark was last advanced.
    pub updated_at: Timestamp,
}

/// Thresholds deciding when a dataset's staged batches should be flushed.
///
/// A value of zero disables the corresponding trigger; if all three are zero
/// the dataset flushes whenever anything is staged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FlushThresholds {
    /// Flush once this many rows are pending.
    pub max_rows: i64,
    /// Flush once the spool holds this many bytes for the dataset.
    pub max_bytes: i64,
    /// Flush once the oldest staged batch is this old.
    pub max_age_ms: i64,
}

/// Per-dataset flush overrides parsed from dataset metadata.
///
/// `{"staging": {"flush": {"maxRows": 100, ...}}}`; absent fields fall back
/// to the service-level thresholds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushOverrides {
    /// Override for [`FlushThresholds::max_rows`].
    pub max_rows: Option<i64>,
    /// Override for [`FlushThresholds::max_bytes`].
    pub max_bytes: Option<i64>,
    /// Override for [`FlushThresholds::max_age_ms`].
    pub max_age_ms: Option<i64>,
}

impl FlushOverrides {
    /// Parse overrides from dataset metadata. Non-integer values are
    /// ignored; negative values clamp to zero.
    pub fn from_metadata(metadata: &serde_json::Value) -> Self {
        let flush = metadata.get("staging").and_then(|s| s.get("flush"));

        let field = |name: &str| {
            flush
                .and_then(|f| f.get(name))
                .and_then(serde_json::Value::as_i64)
                .map(|v| v.max(0))
        };

        Self {
            max_rows: field("maxRows"),
            max_bytes: field("maxBytes"),
            max_age_ms: field("maxAgeMs"),
        }
    }

    /// Apply these overrides on top of the service-level thresholds.
    pub fn apply(&self, base: FlushThresholds) -> FlushThresholds {
        FlushThresholds {
            max_rows: self.max_rows.unwrap_or(base.max_rows),
            max_bytes: self.max_bytes.unwrap_or(base.max_bytes),
            max_age_ms: self.max_age_ms.unwrap_or(base.max_age_ms),
        }
    }
}
