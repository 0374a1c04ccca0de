//! Similarity search over cached index snapshots.
//!
//! Embeds an extracted term set and runs a top-k scan against each cached
//! index kind, then merges the per-kind rankings into one sequence. Scores
//! are cosine similarities, computed with the same metric the snapshots
//! were built under, so build-time and query-time rankings agree.
//!
//! Merge order is fully deterministic: score descending, then record
//! recency descending, then record id ascending. An empty term set returns
//! an empty result sequence without touching the embedding service — never
//! a whole-index dump.

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::cache::CachedIndex;
use crate::embedding::{embed_one, Embedder};
use crate::models::SearchResult;

/// Top-k search across one or more cached indexes.
pub async fn search(
    embedder: &dyn Embedder,
    indexes: &[Arc<CachedIndex>],
    terms: &[String],
    k: usize,
) -> Result<Vec<SearchResult>> {
    if terms.is_empty() || k == 0 {
        return Ok(Vec::new());
    }

    let query_text = terms.join(" ");
    let query_vec = embed_one(embedder, &query_text)
        .await
        .context("Failed to embed search terms")?;

    let mut merged: Vec<SearchResult> = Vec::new();

    for index in indexes {
        // An empty placeholder (nothing promoted yet) contributes nothing.
        if index.snapshot.entries.is_empty() {
            continue;
        }
        let hits = index
            .snapshot
            .top_k(&query_vec, k)
            .with_context(|| format!("Search failed against index '{}'", index.kind))?;
        merged.extend(hits);
    }

    merged.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.updated_at.cmp(&a.updated_at))
            .then(a.source_id.cmp(&b.source_id))
    });
    merged.truncate(k);

    Ok(merged)
}
