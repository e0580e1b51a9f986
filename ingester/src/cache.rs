//! Advisory caching of the latest published manifest per dataset shard.
//!
//! Stale reads are tolerated: partitions are immutable and manifest
//! supersession is idempotent, so a reader holding an old snapshot only sees
//! slightly old data, never wrong data.

use data_types::{DatasetId, ShardKey};
use parking_lot::RwLock;
use std::{collections::HashMap, fmt::Debug, sync::Arc};
use timestore_catalog::interface::ManifestSnapshot;

/// An abstract cache of the latest published [`ManifestSnapshot`] per
/// `(dataset, shard)`.
pub trait ManifestCache: Debug + Send + Sync {
    /// Return the cached snapshot for `(dataset_id, shard)`.
    fn get(&self, dataset_id: DatasetId, shard: &ShardKey) -> Option<Arc<ManifestSnapshot>>;

    /// Place `snapshot` in the cache, unconditionally overwriting any
    /// existing entry, returning the previous value, if any.
    fn put(
        &self,
        dataset_id: DatasetId,
        shard: ShardKey,
        snapshot: Arc<ManifestSnapshot>,
    ) -> Option<Arc<ManifestSnapshot>>;

    /// Drop the entry for `(dataset_id, shard)`.
    fn invalidate(&self, dataset_id: DatasetId, shard: &ShardKey);
}

/// An in-memory [`ManifestCache`] backed by a hashmap protected with a
/// read-write mutex.
#[derive(Debug, Default)]
pub struct MemoryManifestCache {
    cache: RwLock<HashMap<(DatasetId, ShardKey), Arc<ManifestSnapshot>>>,
}

impl ManifestCache for MemoryManifestCache {
    fn get(&self, dataset_id: DatasetId, shard: &ShardKey) -> Option<Arc<ManifestSnapshot>> {
        self.cache
            .read()
            .get(&(dataset_id, shard.clone()))
            .map(Arc::clone)
    }

    fn put(
        &self,
        dataset_id: DatasetId,
        shard: ShardKey,
        snapshot: Arc<ManifestSnapshot>,
    ) -> Option<Arc<ManifestSnapshot>> {
        self.cache.write().insert((dataset_id, shard), snapshot)
    }

    fn invalidate(&self, dataset_id: DatasetId, shard: &ShardKey) {
        self.cache.write().remove(&(dataset_id, shard.clone()));
    }
}
