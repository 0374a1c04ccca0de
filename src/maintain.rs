//! Index maintenance jobs: incremental append and full rebuild.
//!
//! Both jobs run off the request path — fired from the CLI or spawned as
//! background tasks by the HTTP triggers — and talk to the request path
//! only through immutable snapshots in the versioned store. Neither holds
//! any lock a live query could block on.
//!
//! Failure semantics: a snapshot write error is surfaced to the caller and
//! the latest alias is left untouched, so the alias never references a
//! snapshot that does not exist.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::embedding::Embedder;
use crate::index::{IndexEntry, IndexSnapshot};
use crate::models::IndexVersion;
use crate::records;
use crate::store::SnapshotStore;

/// The one index kind this service maintains today. Search and cache code
/// is kind-agnostic; adding a second kind means adding a second maintainer
/// call site, not new plumbing.
pub const RECEIPTS_KIND: &str = "receipts";

/// Upper bound on corpus size for a rebuild.
const REBUILD_CORPUS_CAP: usize = 1_000_000;

/// Runs maintenance jobs against one store + embedder pair.
pub struct Maintainer {
    pool: SqlitePool,
    store: Arc<dyn SnapshotStore>,
    embedder: Arc<dyn Embedder>,
}

impl Maintainer {
    pub fn new(pool: SqlitePool, store: Arc<dyn SnapshotStore>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            pool,
            store,
            embedder,
        }
    }

    /// Embed one new/updated record and fold it into a fresh snapshot
    /// derived from the current latest, then write and promote.
    ///
    /// If the latest snapshot was built with a different embedding model or
    /// dimensionality, appending to it would mix incompatible vectors, so
    /// the job falls back to a full rebuild.
    pub async fn append(&self, record_id: i64) -> Result<IndexVersion> {
        let receipt = records::fetch_receipt(&self.pool, record_id)
            .await?
            .with_context(|| format!("Receipt {record_id} not found"))?;

        let mut snapshot = match self.store.read_latest(RECEIPTS_KIND).await? {
            Some((_, bytes)) => {
                let snap = IndexSnapshot::from_bytes(&bytes)?;
                if snap.dims != self.embedder.dims() || snap.model != self.embedder.model_name() {
                    tracing::info!(
                        old_model = %snap.model,
                        new_model = %self.embedder.model_name(),
                        "embedding drift detected; rebuilding instead of appending"
                    );
                    return self.full_rebuild().await;
                }
                snap
            }
            None => IndexSnapshot::new(
                RECEIPTS_KIND,
                self.embedder.model_name(),
                self.embedder.dims(),
                Utc::now().timestamp(),
            ),
        };

        let vectors = self.embedder.embed(&[receipt.index_text()]).await?;
        let vector = vectors
            .first()
            .with_context(|| "Embedding service returned no vector")?;

        snapshot.upsert(IndexEntry::new(
            receipt.id,
            receipt.created_at,
            receipt.snippet(),
            vector,
        ));
        snapshot.built_at = Utc::now().timestamp();

        self.write_and_promote(snapshot).await
    }

    /// Re-embed the entire corpus into a new snapshot and promote it.
    /// Recovery path for drift or corruption; also the bootstrap path.
    pub async fn full_rebuild(&self) -> Result<IndexVersion> {
        let receipts = records::fetch_all(&self.pool, REBUILD_CORPUS_CAP).await?;

        let texts: Vec<String> = receipts.iter().map(|r| r.index_text()).collect();
        let vectors = if texts.is_empty() {
            Vec::new()
        } else {
            self.embedder.embed(&texts).await?
        };

        if vectors.len() != receipts.len() {
            anyhow::bail!(
                "Embedding service returned {} vectors for {} records",
                vectors.len(),
                receipts.len()
            );
        }

        let mut snapshot = IndexSnapshot::new(
            RECEIPTS_KIND,
            self.embedder.model_name(),
            self.embedder.dims(),
            Utc::now().timestamp(),
        );
        for (receipt, vector) in receipts.iter().zip(vectors.iter()) {
            snapshot.upsert(IndexEntry::new(
                receipt.id,
                receipt.created_at,
                receipt.snippet(),
                vector,
            ));
        }

        tracing::info!(entries = snapshot.entries.len(), "rebuilt receipts index");
        self.write_and_promote(snapshot).await
    }

    /// Write-then-promote. Promotion only runs once the write succeeded.
    async fn write_and_promote(&self, snapshot: IndexSnapshot) -> Result<IndexVersion> {
        let bytes = snapshot.to_bytes()?;
        let version = self
            .store
            .write_version(RECEIPTS_KIND, &bytes)
            .await
            .context("Snapshot write failed; latest alias left unchanged")?;
        self.store
            .promote_latest(&version)
            .await
            .context("Snapshot promotion failed")?;

        tracing::info!(version = %version.version_id, "promoted new index version");
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use crate::store::FsSnapshotStore;

    async fn setup() -> (tempfile::TempDir, SqlitePool, Maintainer, Arc<FsSnapshotStore>) {
        let tmp = tempfile::TempDir::new().unwrap();

        let options = sqlx::sqlite::SqliteConnectOptions::new()
            .filename(tmp.path().join("tally.sqlite"))
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await.unwrap();
        crate::migrate::apply(&pool).await.unwrap();

        let store = Arc::new(FsSnapshotStore::new(tmp.path().join("store"), "test/"));
        let maintainer = Maintainer::new(
            pool.clone(),
            store.clone(),
            Arc::new(HashEmbedder::new(64)),
        );
        (tmp, pool, maintainer, store)
    }

    #[tokio::test]
    async fn append_bootstraps_and_promotes() {
        let (_tmp, pool, maintainer, store) = setup().await;
        let id = records::insert_receipt(&pool, "Green Grocer", "groceries", "2025-06-03", 54.2)
            .await
            .unwrap();

        let version = maintainer.append(id).await.unwrap();

        let (latest_id, bytes) = store.read_latest(RECEIPTS_KIND).await.unwrap().unwrap();
        assert_eq!(latest_id, version.version_id);
        let snap = IndexSnapshot::from_bytes(&bytes).unwrap();
        assert_eq!(snap.entries.len(), 1);
        assert_eq!(snap.entries[0].record_id, id);
    }

    #[tokio::test]
    async fn append_merges_into_latest() {
        let (_tmp, pool, maintainer, store) = setup().await;
        let a = records::insert_receipt(&pool, "Green Grocer", "groceries", "2025-06-03", 54.2)
            .await
            .unwrap();
        let b = records::insert_receipt(&pool, "City Power", "utilities", "2025-06-12", 118.4)
            .await
            .unwrap();

        maintainer.append(a).await.unwrap();
        maintainer.append(b).await.unwrap();

        let (_, bytes) = store.read_latest(RECEIPTS_KIND).await.unwrap().unwrap();
        let snap = IndexSnapshot::from_bytes(&bytes).unwrap();
        assert_eq!(snap.entries.len(), 2);

        // Re-appending the same record must not duplicate it.
        maintainer.append(a).await.unwrap();
        let (_, bytes) = store.read_latest(RECEIPTS_KIND).await.unwrap().unwrap();
        let snap = IndexSnapshot::from_bytes(&bytes).unwrap();
        assert_eq!(snap.entries.len(), 2);
    }

    #[tokio::test]
    async fn append_missing_record_fails_without_promoting() {
        let (_tmp, _pool, maintainer, store) = setup().await;
        assert!(maintainer.append(12345).await.is_err());
        assert!(store.read_latest(RECEIPTS_KIND).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn full_rebuild_covers_corpus() {
        let (_tmp, pool, maintainer, store) = setup().await;
        for i in 0..4 {
            records::insert_receipt(&pool, &format!("m{i}"), "other", "2025-01-01", i as f64)
                .await
                .unwrap();
        }

        maintainer.full_rebuild().await.unwrap();

        let (_, bytes) = store.read_latest(RECEIPTS_KIND).await.unwrap().unwrap();
        let snap = IndexSnapshot::from_bytes(&bytes).unwrap();
        assert_eq!(snap.entries.len(), 4);
    }

    #[tokio::test]
    async fn rebuild_of_empty_corpus_promotes_empty_snapshot() {
        let (_tmp, _pool, maintainer, store) = setup().await;
        maintainer.full_rebuild().await.unwrap();
        let (_, bytes) = store.read_latest(RECEIPTS_KIND).await.unwrap().unwrap();
        let snap = IndexSnapshot::from_bytes(&bytes).unwrap();
        assert!(snap.entries.is_empty());
    }

    #[tokio::test]
    async fn dims_drift_triggers_rebuild() {
        let (_tmp, pool, maintainer, store) = setup().await;
        let a = records::insert_receipt(&pool, "Green Grocer", "groceries", "2025-06-03", 54.2)
            .await
            .unwrap();
        maintainer.append(a).await.unwrap();

        // Same store, different embedder dims: append must rebuild.
        let drifted = Maintainer::new(
            pool.clone(),
            store.clone(),
            Arc::new(HashEmbedder::new(128)),
        );
        let b = records::insert_receipt(&pool, "City Power", "utilities", "2025-06-12", 118.4)
            .await
            .unwrap();
        drifted.append(b).await.unwrap();

        let (_, bytes) = store.read_latest(RECEIPTS_KIND).await.unwrap().unwrap();
        let snap = IndexSnapshot::from_bytes(&bytes).unwrap();
        assert_eq!(snap.dims, 128);
        assert_eq!(snap.entries.len(), 2);
    }
}
