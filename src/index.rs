//! Similarity index snapshot format and nearest-neighbor scan.
//!
//! A snapshot is one immutable, serialized state of an index: the embedding
//! model it was built with, the vector dimensionality, and one entry per
//! record. Snapshots are serialized as JSON with each embedding packed as a
//! base64-encoded little-endian f32 blob, and are only ever replaced whole —
//! never patched in place.
//!
//! Search is an exact cosine scan. Corpora here are per-user receipt sets,
//! small enough that approximate structures would add complexity without
//! buying latency.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::models::SearchResult;

/// One record's entry in a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub record_id: i64,
    /// Record last-modified time (epoch seconds); search tie-break key.
    pub updated_at: i64,
    /// Short text excerpt surfaced in search results.
    pub snippet: String,
    /// Base64 of the little-endian f32 embedding blob.
    pub embedding_b64: String,
}

impl IndexEntry {
    pub fn new(record_id: i64, updated_at: i64, snippet: String, embedding: &[f32]) -> Self {
        Self {
            record_id,
            updated_at,
            snippet,
            embedding_b64: BASE64.encode(vec_to_blob(embedding)),
        }
    }

    pub fn embedding(&self) -> Result<Vec<f32>> {
        let blob = BASE64
            .decode(&self.embedding_b64)
            .context("Invalid base64 embedding in index entry")?;
        Ok(blob_to_vec(&blob))
    }
}

/// One immutable serialized state of a similarity index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSnapshot {
    /// Index kind (e.g. `"receipts"`).
    pub kind: String,
    /// Embedding model the vectors were produced with.
    pub model: String,
    /// Vector dimensionality; queries with other dims are rejected.
    pub dims: usize,
    /// Build timestamp (epoch seconds).
    pub built_at: i64,
    pub entries: Vec<IndexEntry>,
}

impl IndexSnapshot {
    pub fn new(kind: &str, model: &str, dims: usize, built_at: i64) -> Self {
        Self {
            kind: kind.to_string(),
            model: model.to_string(),
            dims,
            built_at,
            entries: Vec::new(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("Failed to serialize index snapshot")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).context("Failed to parse index snapshot")
    }

    /// Insert or replace the entry for a record. Used by the append job so
    /// re-indexing a record never duplicates it.
    pub fn upsert(&mut self, entry: IndexEntry) {
        self.entries.retain(|e| e.record_id != entry.record_id);
        self.entries.push(entry);
    }

    /// Exact top-k cosine scan.
    ///
    /// Ranked by similarity descending; ties broken by record recency
    /// descending, then record id ascending, so result order is
    /// reproducible across runs.
    pub fn top_k(&self, query_vec: &[f32], k: usize) -> Result<Vec<SearchResult>> {
        if query_vec.len() != self.dims {
            anyhow::bail!(
                "Query vector has {} dims but index '{}' was built with {}",
                query_vec.len(),
                self.kind,
                self.dims
            );
        }

        let mut results: Vec<SearchResult> = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            let vec = entry.embedding()?;
            results.push(SearchResult {
                source_id: entry.record_id,
                score: cosine_similarity(query_vec, &vec),
                updated_at: entry.updated_at,
                snippet: entry.snippet.clone(),
            });
        }

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.updated_at.cmp(&a.updated_at))
                .then(a.source_id.cmp(&b.source_id))
        });
        results.truncate(k);

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_with(entries: &[(i64, i64, &[f32])]) -> IndexSnapshot {
        let dims = entries.first().map(|(_, _, v)| v.len()).unwrap_or(2);
        let mut snap = IndexSnapshot::new("receipts", "token-hash", dims, 1_700_000_000);
        for (id, updated_at, vec) in entries {
            snap.upsert(IndexEntry::new(*id, *updated_at, format!("r{id}"), vec));
        }
        snap
    }

    #[test]
    fn snapshot_roundtrip() {
        let snap = snapshot_with(&[(1, 10, &[1.0, 0.0]), (2, 20, &[0.0, 1.0])]);
        let bytes = snap.to_bytes().unwrap();
        let back = IndexSnapshot::from_bytes(&bytes).unwrap();
        assert_eq!(back.entries.len(), 2);
        assert_eq!(back.entries[0].embedding().unwrap(), vec![1.0, 0.0]);
    }

    #[test]
    fn top_k_ranks_by_similarity() {
        let snap = snapshot_with(&[
            (1, 10, &[1.0, 0.0]),
            (2, 10, &[0.7, 0.7]),
            (3, 10, &[0.0, 1.0]),
        ]);
        let results = snap.top_k(&[1.0, 0.0], 2).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].source_id, 1);
        assert_eq!(results[1].source_id, 2);
    }

    #[test]
    fn ties_break_by_recency_then_id() {
        let snap = snapshot_with(&[
            (5, 100, &[1.0, 0.0]),
            (2, 200, &[1.0, 0.0]),
            (9, 200, &[1.0, 0.0]),
        ]);
        let results = snap.top_k(&[1.0, 0.0], 3).unwrap();
        let ids: Vec<i64> = results.iter().map(|r| r.source_id).collect();
        // Equal scores: newer first, then lower id.
        assert_eq!(ids, vec![2, 9, 5]);
    }

    #[test]
    fn upsert_replaces_existing_entry() {
        let mut snap = snapshot_with(&[(1, 10, &[1.0, 0.0])]);
        snap.upsert(IndexEntry::new(1, 99, "updated".to_string(), &[0.0, 1.0]));
        assert_eq!(snap.entries.len(), 1);
        assert_eq!(snap.entries[0].updated_at, 99);
    }

    #[test]
    fn dims_mismatch_rejected() {
        let snap = snapshot_with(&[(1, 10, &[1.0, 0.0])]);
        assert!(snap.top_k(&[1.0, 0.0, 0.0], 1).is_err());
    }
}
