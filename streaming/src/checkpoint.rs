//! On-disk checkpoints and the time-bounded dedupe cache of the file
//! tailer.

use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Duration,
};
use timestore_time::Time;

/// One remembered idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DedupeEntry {
    /// The key.
    pub key: String,
    /// When it was last seen, epoch milliseconds.
    pub seen_at_ms: i64,
}

/// Durable position of a file tailer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TailerCheckpoint {
    /// Lines of the tailed file already consumed.
    pub last_line: u64,
    /// The `offset` field of the last consumed envelope, opaque to the
    /// tailer.
    pub last_offset: Option<serde_json::Value>,
    /// Recently seen idempotency keys.
    pub dedupe: Vec<DedupeEntry>,
}

/// Loads and atomically saves a [`TailerCheckpoint`].
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    /// A store persisting to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The checkpoint path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the checkpoint, or `None` if none was written yet. A corrupt
    /// checkpoint file is treated as absent; the tailer then re-reads from
    /// its configured starting position and relies on idempotency keys.
    pub async fn load(&self) -> std::io::Result<Option<TailerCheckpoint>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => Ok(serde_json::from_str(&raw).ok()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Persist the checkpoint via write-then-rename.
    pub async fn save(&self, checkpoint: &TailerCheckpoint) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let scratch = self.path.with_extension("tmp");
        let raw = serde_json::to_vec(checkpoint).expect("checkpoint serialization is infallible");
        tokio::fs::write(&scratch, raw).await?;
        tokio::fs::rename(&scratch, &self.path).await
    }
}

/// Remembers idempotency keys for a bounded time so re-read lines are not
/// re-enqueued.
#[derive(Debug)]
pub struct DedupeCache {
    ttl: Duration,
    entries: HashMap<String, Time>,
}

impl DedupeCache {
    /// An empty cache with the given ttl.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Restore from checkpoint entries, dropping those already expired.
    pub fn from_entries(ttl: Duration, entries: &[DedupeEntry], now: Time) -> Self {
        let mut cache = Self::new(ttl);
        for entry in entries {
            let seen_at = Time::from_timestamp_millis(entry.seen_at_ms);
            if !cache.expired(seen_at, now) {
                cache.entries.insert(entry.key.clone(), seen_at);
            }
        }
        cache
    }

    fn expired(&self, seen_at: Time, now: Time) -> bool {
        now.checked_duration_since(seen_at)
            .map(|age| age >= self.ttl)
            .unwrap_or(false)
    }

    /// Record `key` at `now`. Returns `false` when the key was already seen
    /// within the ttl (a duplicate).
    pub fn observe(&mut self, key: &str, now: Time) -> bool {
        if let Some(seen_at) = self.entries.get(key) {
            if !self.expired(*seen_at, now) {
                return false;
            }
        }
        self.entries.insert(key.to_string(), now);
        true
    }

    /// Drop expired entries.
    pub fn prune(&mut self, now: Time) {
        let ttl = self.ttl;
        self.entries.retain(|_, seen_at| {
            now.checked_duration_since(*seen_at)
                .map(|age| age < ttl)
                .unwrap_or(true)
        });
    }

    /// Snapshot for the checkpoint.
    pub fn to_entries(&self) -> Vec<DedupeEntry> {
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .map(|(key, seen_at)| DedupeEntry {
                key: key.clone(),
                seen_at_ms: seen_at.timestamp_millis(),
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn checkpoint_round_trips_and_survives_corruption() {
        let dir = test_helpers::tmp_dir().unwrap();
        let store = CheckpointStore::new(dir.path().join("tailer.checkpoint"));

        assert!(store.load().await.unwrap().is_none());

        let checkpoint = TailerCheckpoint {
            last_line: 42,
            last_offset: Some(serde_json::json!("0042")),
            dedupe: vec![DedupeEntry {
                key: "k1".to_string(),
                seen_at_ms: 1_000,
            }],
        };
        store.save(&checkpoint).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(checkpoint));

        std::fs::write(store.path(), b"{not json").unwrap();
        assert!(store.load().await.unwrap().is_none());
    }

    #[test]
    fn dedupe_expires_by_ttl() {
        let ttl = Duration::from_millis(1_000);
        let t0 = Time::from_timestamp_millis(10_000);
        let mut cache = DedupeCache::new(ttl);

        assert!(cache.observe("k1", t0));
        assert!(!cache.observe("k1", t0 + Duration::from_millis(999)));
        // at the ttl boundary the key is forgotten
        assert!(cache.observe("k1", t0 + Duration::from_millis(1_000)));
    }

    #[test]
    fn restore_drops_expired_entries() {
        let ttl = Duration::from_millis(1_000);
        let now = Time::from_timestamp_millis(10_000);
        let entries = vec![
            DedupeEntry {
                key: "fresh".to_string(),
                seen_at_ms: 9_500,
            },
            DedupeEntry {
                key: "stale".to_string(),
                seen_at_ms: 1_000,
            },
        ];

        let mut cache = DedupeCache::from_entries(ttl, &entries, now);
        assert!(!cache.observe("fresh", now));
        assert!(cache.observe("stale", now));

        // everything ages out eventually
        cache.prune(now + Duration::from_millis(2_000));
        assert!(cache.to_entries().is_empty());
    }
}
