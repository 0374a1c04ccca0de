//! Per-process materialization of the latest index snapshots.
//!
//! The cache is an explicit object owned by the process and injected into
//! the search engine — there is no ambient/global index state. Invalidation
//! is explicit: [`IndexCache::ensure_fresh`] probes the store's latest
//! pointer (at most once per refresh interval) and re-downloads when the
//! promoted version changed.
//!
//! Concurrent callers may race to refresh the same kind. That is tolerated
//! by design: materialization writes a temp file and renames it over the
//! previous copy, and the in-memory map insert is last-writer-wins, so no
//! refresh lock is held across downloads. Staleness is bounded by the
//! refresh interval, not eliminated — cross-process coherency beyond
//! "eventually refreshes" is a non-goal.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::index::IndexSnapshot;
use crate::store::SnapshotStore;

/// Sentinel version id used before any snapshot has been promoted.
const EMPTY_VERSION: &str = "empty";

/// A materialized snapshot, shared read-only across concurrent requests.
pub struct CachedIndex {
    pub kind: String,
    pub version_id: String,
    pub snapshot: IndexSnapshot,
}

struct CacheEntry {
    index: Arc<CachedIndex>,
    checked_at: Instant,
}

/// Process-owned cache of latest snapshots, one slot per index kind.
pub struct IndexCache {
    store: Arc<dyn SnapshotStore>,
    cache_dir: PathBuf,
    refresh_interval: Duration,
    slots: RwLock<HashMap<String, CacheEntry>>,
}

impl IndexCache {
    pub fn new(store: Arc<dyn SnapshotStore>, cache_dir: PathBuf, refresh_interval: Duration) -> Self {
        Self {
            store,
            cache_dir,
            refresh_interval,
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Return a ready-to-query handle for `kind`, refreshing it first if the
    /// store has promoted a newer version.
    ///
    /// The staleness probe is best-effort: within the refresh interval it is
    /// skipped entirely, and if the probe itself fails while a previously
    /// materialized copy exists, the stale copy is served rather than
    /// failing the request.
    pub async fn ensure_fresh(&self, kind: &str) -> Result<Arc<CachedIndex>> {
        // Fast path: fresh-enough slot.
        if let Some(index) = self.fresh_slot(kind) {
            return Ok(index);
        }

        let cached = self.any_slot(kind);

        let latest_id = match self.store.latest_version_id(kind).await {
            Ok(id) => id,
            Err(e) => {
                if let Some(index) = cached {
                    tracing::warn!(kind, error = %e, "latest-pointer probe failed; serving stale index");
                    return Ok(index);
                }
                return Err(e).context("Failed to probe latest index version");
            }
        };

        match latest_id {
            None => {
                // Nothing promoted yet: serve an empty index so searches
                // return no results instead of erroring.
                let index = Arc::new(CachedIndex {
                    kind: kind.to_string(),
                    version_id: EMPTY_VERSION.to_string(),
                    snapshot: IndexSnapshot::new(kind, "none", 0, 0),
                });
                self.install(kind, index.clone());
                Ok(index)
            }
            Some(latest) => {
                if let Some(index) = cached {
                    if index.version_id == latest {
                        // Still current; just restart the probe clock.
                        self.install(kind, index.clone());
                        return Ok(index);
                    }
                }
                self.refresh(kind).await
            }
        }
    }

    /// Download and materialize the latest snapshot for `kind`.
    async fn refresh(&self, kind: &str) -> Result<Arc<CachedIndex>> {
        let Some((version_id, bytes)) = self
            .store
            .read_latest(kind)
            .await
            .context("Failed to download latest snapshot")?
        else {
            let index = Arc::new(CachedIndex {
                kind: kind.to_string(),
                version_id: EMPTY_VERSION.to_string(),
                snapshot: IndexSnapshot::new(kind, "none", 0, 0),
            });
            self.install(kind, index.clone());
            return Ok(index);
        };

        let snapshot = IndexSnapshot::from_bytes(&bytes)?;
        self.materialize_to_disk(kind, &bytes)?;

        tracing::debug!(kind, version = %version_id, entries = snapshot.entries.len(), "index refreshed");

        let index = Arc::new(CachedIndex {
            kind: kind.to_string(),
            version_id,
            snapshot,
        });
        self.install(kind, index.clone());
        Ok(index)
    }

    /// Write the local copy with overwrite semantics; concurrent refreshers
    /// both succeed and the last rename wins.
    fn materialize_to_disk(&self, kind: &str, bytes: &[u8]) -> Result<()> {
        std::fs::create_dir_all(&self.cache_dir)
            .with_context(|| format!("Failed to create cache dir {}", self.cache_dir.display()))?;
        let dest = self.cache_dir.join(format!("{kind}_latest.idx"));
        let tmp = self
            .cache_dir
            .join(format!("{kind}_latest.idx.tmp-{}", uuid::Uuid::new_v4()));
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &dest)
            .with_context(|| format!("Failed to move cached snapshot to {}", dest.display()))?;
        Ok(())
    }

    fn fresh_slot(&self, kind: &str) -> Option<Arc<CachedIndex>> {
        let slots = self.slots.read().expect("cache lock poisoned");
        let entry = slots.get(kind)?;
        if entry.checked_at.elapsed() < self.refresh_interval {
            Some(entry.index.clone())
        } else {
            None
        }
    }

    fn any_slot(&self, kind: &str) -> Option<Arc<CachedIndex>> {
        let slots = self.slots.read().expect("cache lock poisoned");
        slots.get(kind).map(|e| e.index.clone())
    }

    fn install(&self, kind: &str, index: Arc<CachedIndex>) {
        let mut slots = self.slots.write().expect("cache lock poisoned");
        slots.insert(
            kind.to_string(),
            CacheEntry {
                index,
                checked_at: Instant::now(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexEntry;
    use crate::store::{FsSnapshotStore, SnapshotStore};

    fn snapshot_bytes(marker: i64) -> Vec<u8> {
        let mut snap = IndexSnapshot::new("receipts", "token-hash", 2, marker);
        snap.upsert(IndexEntry::new(marker, marker, format!("r{marker}"), &[1.0, 0.0]));
        snap.to_bytes().unwrap()
    }

    async fn setup() -> (tempfile::TempDir, Arc<FsSnapshotStore>, IndexCache) {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = Arc::new(FsSnapshotStore::new(tmp.path().join("store"), ""));
        let cache = IndexCache::new(
            store.clone(),
            tmp.path().join("cache"),
            Duration::from_secs(0), // probe on every call in tests
        );
        (tmp, store, cache)
    }

    #[tokio::test]
    async fn empty_store_yields_empty_index() {
        let (_tmp, _store, cache) = setup().await;
        let index = cache.ensure_fresh("receipts").await.unwrap();
        assert_eq!(index.version_id, "empty");
        assert!(index.snapshot.entries.is_empty());
    }

    #[tokio::test]
    async fn picks_up_promoted_snapshot() {
        let (_tmp, store, cache) = setup().await;

        // Prime with the empty index, then promote a real one.
        let _ = cache.ensure_fresh("receipts").await.unwrap();
        let v = store.write_version("receipts", &snapshot_bytes(1)).await.unwrap();
        store.promote_latest(&v).await.unwrap();

        let index = cache.ensure_fresh("receipts").await.unwrap();
        assert_eq!(index.version_id, v.version_id);
        assert_eq!(index.snapshot.entries.len(), 1);
    }

    #[tokio::test]
    async fn refresh_follows_new_promotions() {
        let (_tmp, store, cache) = setup().await;

        let v1 = store.write_version("receipts", &snapshot_bytes(1)).await.unwrap();
        store.promote_latest(&v1).await.unwrap();
        let first = cache.ensure_fresh("receipts").await.unwrap();
        assert_eq!(first.version_id, v1.version_id);

        let v2 = store.write_version("receipts", &snapshot_bytes(2)).await.unwrap();
        store.promote_latest(&v2).await.unwrap();
        let second = cache.ensure_fresh("receipts").await.unwrap();
        assert_eq!(second.version_id, v2.version_id);
        assert_eq!(second.snapshot.entries[0].record_id, 2);
    }

    #[tokio::test]
    async fn interval_skips_probe_and_serves_cached() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = Arc::new(FsSnapshotStore::new(tmp.path().join("store"), ""));
        let cache = IndexCache::new(
            store.clone(),
            tmp.path().join("cache"),
            Duration::from_secs(3600),
        );

        let v1 = store.write_version("receipts", &snapshot_bytes(1)).await.unwrap();
        store.promote_latest(&v1).await.unwrap();
        let first = cache.ensure_fresh("receipts").await.unwrap();

        // Promote a newer version; within the interval the cache must not
        // even probe, so the old handle is returned.
        let v2 = store.write_version("receipts", &snapshot_bytes(2)).await.unwrap();
        store.promote_latest(&v2).await.unwrap();
        let second = cache.ensure_fresh("receipts").await.unwrap();
        assert_eq!(second.version_id, first.version_id);
    }

    #[tokio::test]
    async fn concurrent_refreshes_all_succeed() {
        let (_tmp, store, cache) = setup().await;
        let v = store.write_version("receipts", &snapshot_bytes(7)).await.unwrap();
        store.promote_latest(&v).await.unwrap();

        let cache = Arc::new(cache);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache.ensure_fresh("receipts").await.unwrap().version_id.clone()
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), v.version_id);
        }
    }
}
