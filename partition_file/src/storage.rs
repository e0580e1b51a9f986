//! Storage drivers that place serialized partition files into a backend.

use crate::serialize::{serialize_rows, SerializeError};
use async_trait::async_trait;
use bytes::Bytes;
use data_types::{
    ingest::Row, sanitize_dataset_slug, ColumnStatistics, SchemaField, StorageTarget,
    StorageTargetKind,
};
use object_store::{local::LocalFileSystem, memory::InMemory, path::Path as ObjectPath, ObjectStore};
use std::{collections::BTreeMap, fmt::Debug, path::PathBuf, sync::Arc};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Errors surfaced by [`StorageDriver::write_partition`].
#[derive(Debug, Error)]
pub enum StorageError {
    /// The rows could not be serialized; retrying cannot help.
    #[error(transparent)]
    Serialize(#[from] SerializeError),

    /// The backend failed; a retry may succeed. No partial file remains
    /// visible.
    #[error("transient storage I/O failure: {source}")]
    TransientIo {
        /// The backend error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// This process has no driver for the target kind (e.g. an external
    /// warehouse owns the writes).
    #[error("storage target kind {kind} has no local driver")]
    UnsupportedKind {
        /// The unsupported kind.
        kind: StorageTargetKind,
    },

    /// The storage target configuration is unusable.
    #[error("storage target config invalid: {reason}")]
    InvalidConfig {
        /// Why it was rejected.
        reason: String,
    },
}

impl StorageError {
    /// Whether a retry of the failed write may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientIo { .. })
    }
}

/// A request to write one partition file.
#[derive(Debug, Clone)]
pub struct WritePartitionRequest<'a> {
    /// Slug of the dataset; determines the file's directory.
    pub dataset_slug: &'a str,
    /// Uuid naming the file.
    pub object_store_id: Uuid,
    /// Logical table the rows belong to.
    pub table_name: &'a str,
    /// Caller-facing partition key, embedded into the file footer.
    pub partition_key: &'a BTreeMap<String, String>,
    /// Schema of the rows.
    pub fields: &'a [SchemaField],
    /// The rows.
    pub rows: &'a [Row],
}

impl WritePartitionRequest<'_> {
    /// Path of the file relative to the storage root.
    pub fn relative_path(&self) -> String {
        format!(
            "{}/{}.parquet",
            sanitize_dataset_slug(self.dataset_slug),
            self.object_store_id
        )
    }

    fn file_metadata(&self) -> serde_json::Value {
        serde_json::json!({
            "datasetSlug": self.dataset_slug,
            "tableName": self.table_name,
            "partitionKey": self.partition_key,
        })
    }
}

/// The outcome of a successful partition write.
#[derive(Debug, Clone)]
pub struct WrittenPartition {
    /// Path of the file relative to the storage root.
    pub relative_path: String,
    /// Size of the file in bytes.
    pub file_size_bytes: i64,
    /// Number of rows written.
    pub row_count: i64,
    /// SHA-256 of the file contents.
    pub checksum: String,
    /// Per-column statistics gathered during serialization.
    pub column_statistics: BTreeMap<String, ColumnStatistics>,
}

/// Writes partition files so that readers only ever observe complete files.
#[async_trait]
pub trait StorageDriver: Debug + Send + Sync + 'static {
    /// Serialize and store one partition file atomically.
    async fn write_partition(
        &self,
        request: WritePartitionRequest<'_>,
    ) -> Result<WrittenPartition, StorageError>;

    /// Driver name, for logs.
    fn name(&self) -> &'static str;
}

/// Build the driver for a storage target.
pub fn driver_for_target(target: &StorageTarget) -> Result<Arc<dyn StorageDriver>, StorageError> {
    match target.kind {
        StorageTargetKind::LocalFile => {
            let root = target
                .config
                .get("root")
                .and_then(serde_json::Value::as_str)
                .ok_or_else(|| StorageError::InvalidConfig {
                    reason: format!("local-file target {} has no root", target.name),
                })?;
            Ok(Arc::new(LocalFileDriver::new(root)))
        }
        StorageTargetKind::ObjectStore => {
            let backend = target
                .config
                .get("backend")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("file");
            let store: Arc<dyn ObjectStore> = match backend {
                "memory" => Arc::new(InMemory::new()),
                "file" => {
                    let root = target
                        .config
                        .get("root")
                        .and_then(serde_json::Value::as_str)
                        .ok_or_else(|| StorageError::InvalidConfig {
                            reason: format!("object-store target {} has no root", target.name),
                        })?;
                    Arc::new(LocalFileSystem::new_with_prefix(root).map_err(|e| {
                        StorageError::InvalidConfig {
                            reason: e.to_string(),
                        }
                    })?)
                }
                other => {
                    return Err(StorageError::InvalidConfig {
                        reason: format!("unknown object store backend: {other}"),
                    })
                }
            };
            Ok(Arc::new(ObjectStoreDriver::new(store)))
        }
        StorageTargetKind::ColumnarDb => Err(StorageError::UnsupportedKind { kind: target.kind }),
    }
}

/// Driver writing partition files under a local filesystem root via
/// write-then-rename.
#[derive(Debug)]
pub struct LocalFileDriver {
    root: PathBuf,
}

impl LocalFileDriver {
    /// Create a driver rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory partition files are written under.
    pub fn root(&self) -> &std::path::Path {
        &self.root
    }
}

fn transient(e: impl std::error::Error + Send + Sync + 'static) -> StorageError {
    StorageError::TransientIo {
        source: Box::new(e),
    }
}

#[async_trait]
impl StorageDriver for LocalFileDriver {
    async fn write_partition(
        &self,
        request: WritePartitionRequest<'_>,
    ) -> Result<WrittenPartition, StorageError> {
        let serialized = serialize_rows(request.fields, request.rows, &request.file_metadata())?;
        let relative_path = request.relative_path();

        let absolute = self.root.join(&relative_path);
        let parent = absolute
            .parent()
            .expect("partition paths always have a dataset directory");
        tokio::fs::create_dir_all(parent).await.map_err(transient)?;

        // scratch file in the same directory, then rename: readers never see
        // a partial file
        let scratch = parent.join(format!(".{}.tmp", request.object_store_id));
        tokio::fs::write(&scratch, &serialized.bytes)
            .await
            .map_err(transient)?;
        if let Err(e) = tokio::fs::rename(&scratch, &absolute).await {
            if let Err(cleanup) = tokio::fs::remove_file(&scratch).await {
                warn!(scratch=%scratch.display(), %cleanup, "failed to remove scratch file");
            }
            return Err(transient(e));
        }

        debug!(
            path=%absolute.display(),
            bytes=serialized.bytes.len(),
            rows=serialized.row_count,
            "wrote partition file",
        );

        Ok(WrittenPartition {
            relative_path,
            file_size_bytes: serialized.bytes.len() as i64,
            row_count: serialized.row_count as i64,
            checksum: serialized.checksum,
            column_statistics: serialized.column_statistics,
        })
    }

    fn name(&self) -> &'static str {
        "local_file"
    }
}

/// Driver writing partition files via an [`ObjectStore`]; a single `put` is
/// atomic on all supported backends.
#[derive(Debug)]
pub struct ObjectStoreDriver {
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreDriver {
    /// Create a driver over `store`.
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// The underlying object store.
    pub fn store(&self) -> Arc<dyn ObjectStore> {
        Arc::clone(&self.store)
    }
}

#[async_trait]
impl StorageDriver for ObjectStoreDriver {
    async fn write_partition(
        &self,
        request: WritePartitionRequest<'_>,
    ) -> Result<WrittenPartition, StorageError> {
        let serialized = serialize_rows(request.fields, request.rows, &request.file_metadata())?;
        let relative_path = request.relative_path();

        let path = ObjectPath::from(relative_path.as_str());
        let size = serialized.bytes.len();
        self.store
            .put(&path, Bytes::from(serialized.bytes))
            .await
            .map_err(transient)?;

        debug!(%path, bytes=size, rows=serialized.row_count, "put partition object");

        Ok(WrittenPartition {
            relative_path,
            file_size_bytes: size as i64,
            row_count: serialized.row_count as i64,
            checksum: serialized.checksum,
            column_statistics: serialized.column_statistics,
        })
    }

    fn name(&self) -> &'static str {
        "object_store"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_types::{schema::FieldType, StorageTargetId};

    fn request_parts() -> (Vec<SchemaField>, Vec<Row>, BTreeMap<String, String>) {
        let fields = vec![
            SchemaField::new("t", FieldType::Timestamp),
            SchemaField::new("v", FieldType::Double),
        ];
        let rows: Vec<Row> = serde_json::from_value(serde_json::json!([
            {"t": "2024-01-01T00:00:00Z", "v": 1.0},
            {"t": "2024-01-01T00:04:00Z", "v": 2.0},
        ]))
        .unwrap();
        let key = BTreeMap::from([("window".to_string(), "2024-01-01".to_string())]);
        (fields, rows, key)
    }

    #[tokio::test]
    async fn local_driver_leaves_only_the_final_file() {
        let dir = test_helpers::tmp_dir().unwrap();
        let driver = LocalFileDriver::new(dir.path());
        let (fields, rows, key) = request_parts();
        let id = Uuid::new_v4();

        let written = driver
            .write_partition(WritePartitionRequest {
                dataset_slug: "obs-1",
                object_store_id: id,
                table_name: "records",
                partition_key: &key,
                fields: &fields,
                rows: &rows,
            })
            .await
            .unwrap();

        assert_eq!(written.relative_path, format!("obs-1/{id}.parquet"));
        assert_eq!(written.row_count, 2);

        let on_disk = std::fs::read(dir.path().join(&written.relative_path)).unwrap();
        assert_eq!(on_disk.len() as i64, written.file_size_bytes);
        assert_eq!(crate::serialize::sha256_hex(&on_disk), written.checksum);

        // no scratch files left behind
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("obs-1"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .filter(|n| n.to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn object_store_driver_puts_the_file() {
        let store = Arc::new(InMemory::new());
        let driver = ObjectStoreDriver::new(Arc::clone(&store) as _);
        let (fields, rows, key) = request_parts();
        let id = Uuid::new_v4();

        let written = driver
            .write_partition(WritePartitionRequest {
                dataset_slug: "obs-1",
                object_store_id: id,
                table_name: "records",
                partition_key: &key,
                fields: &fields,
                rows: &rows,
            })
            .await
            .unwrap();

        let fetched = store
            .get(&ObjectPath::from(written.relative_path.as_str()))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(fetched.len() as i64, written.file_size_bytes);
    }

    #[tokio::test]
    async fn columnar_db_targets_have_no_local_driver() {
        let target = StorageTarget {
            id: StorageTargetId::new(1),
            name: "warehouse".to_string(),
            kind: StorageTargetKind::ColumnarDb,
            config: serde_json::json!({}),
        };
        let err = driver_for_target(&target).unwrap_err();
        assert!(matches!(err, StorageError::UnsupportedKind { .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn bad_rows_are_permanent_errors() {
        let dir = test_helpers::tmp_dir().unwrap();
        let driver = LocalFileDriver::new(dir.path());
        let (fields, mut rows, key) = request_parts();
        rows[0].insert("v".to_string(), serde_json::json!("nope"));

        let err = driver
            .write_partition(WritePartitionRequest {
                dataset_slug: "obs-1",
                object_store_id: Uuid::new_v4(),
                table_name: "records",
                partition_key: &key,
                fields: &fields,
                rows: &rows,
            })
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }
}
