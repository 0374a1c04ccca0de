//! The query-to-answer pipeline.
//!
//! One request flows through the stages strictly in order: safety gate,
//! term extraction, index cache refresh, similarity search, code
//! generation, sandboxed execution, formatting. Each stage's output is the
//! next stage's input; failures are tagged with the stage they occurred at
//! and returned as [`QueryOutcome`] variants, never thrown.
//!
//! The pipeline holds only shared read-only state (cache, adapters), so one
//! instance serves concurrent requests.

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;

use crate::cache::IndexCache;
use crate::codegen;
use crate::config::Config;
use crate::embedding::{create_embedder, Embedder};
use crate::format;
use crate::maintain::RECEIPTS_KIND;
use crate::model::{create_model, ChatModel};
use crate::models::{ExecutionResult, GenerationOutcome, QueryOutcome, Stage};
use crate::records;
use crate::safety;
use crate::sandbox::{self, SandboxLimits};
use crate::search;
use crate::store;
use crate::terms;

/// Everything one query needs, shared across concurrent requests.
pub struct Pipeline {
    pool: SqlitePool,
    cache: Arc<IndexCache>,
    embedder: Arc<dyn Embedder>,
    model: Arc<dyn ChatModel>,
    max_attempts: u32,
    context_k: usize,
    sandbox_limits: SandboxLimits,
    max_rows: usize,
    format_with_model: bool,
}

impl Pipeline {
    /// Assemble a pipeline with explicit collaborators. Tests inject
    /// doubles here; production callers use [`Pipeline::from_config`].
    pub fn new(
        config: &Config,
        pool: SqlitePool,
        cache: Arc<IndexCache>,
        embedder: Arc<dyn Embedder>,
        model: Arc<dyn ChatModel>,
    ) -> Self {
        Self {
            pool,
            cache,
            embedder,
            model,
            max_attempts: config.generation.max_attempts,
            context_k: config.generation.context_k,
            sandbox_limits: SandboxLimits {
                timeout: Duration::from_millis(config.sandbox.timeout_ms),
                memory_bytes: config.sandbox.memory_kb * 1024,
            },
            max_rows: config.sandbox.max_rows,
            format_with_model: config.model.format_answers,
        }
    }

    /// Build the production wiring from configuration.
    pub fn from_config(config: &Config, pool: SqlitePool) -> anyhow::Result<Self> {
        let snapshot_store = store::create_store(&config.store)?;
        let cache = Arc::new(IndexCache::new(
            snapshot_store,
            config.store.cache_dir.clone(),
            Duration::from_secs(config.store.refresh_interval_secs),
        ));
        let embedder: Arc<dyn Embedder> = Arc::from(create_embedder(&config.embedding)?);
        let model: Arc<dyn ChatModel> = Arc::from(create_model(&config.model)?);
        Ok(Self::new(config, pool, cache, embedder, model))
    }

    /// Run one query to a terminal outcome. Never panics, never returns a
    /// bare error: every failure mode is a [`QueryOutcome`] variant.
    pub async fn answer(&self, raw_query: &str) -> QueryOutcome {
        let request_id = uuid::Uuid::new_v4();
        tracing::debug!(id = %request_id, "processing query");

        // Input validation, before any stage runs.
        let query = raw_query.trim();
        if query.is_empty() {
            return QueryOutcome::Failed {
                stage: Stage::Validate,
                message: "query is empty".to_string(),
            };
        }

        // Safety gate: fail-closed, runs before any external call.
        let verdict = safety::classify_checked(query);
        if verdict.is_rejected {
            let reason = verdict
                .reason
                .unwrap_or_else(|| "query not allowed".to_string());
            tracing::warn!(%reason, "query rejected by safety gate");
            return QueryOutcome::Rejected { reason };
        }

        // Term extraction: pure, possibly empty.
        let search_terms = terms::extract(query);
        tracing::debug!(terms = search_terms.len(), "extracted search terms");

        // Cache refresh (best-effort staleness check inside).
        let index = match self.cache.ensure_fresh(RECEIPTS_KIND).await {
            Ok(index) => index,
            Err(e) => {
                return QueryOutcome::Failed {
                    stage: Stage::CacheRefresh,
                    message: format!("{e:#}"),
                }
            }
        };

        // Similarity search; empty terms yield empty context, not an error.
        let results = match search::search(
            self.embedder.as_ref(),
            std::slice::from_ref(&index),
            &search_terms,
            self.context_k,
        )
        .await
        {
            Ok(results) => results,
            Err(e) => {
                return QueryOutcome::Failed {
                    stage: Stage::Search,
                    message: format!("{e:#}"),
                }
            }
        };
        tracing::debug!(hits = results.len(), "similarity search complete");

        // Bounded generation loop.
        let outcome = match codegen::generate(
            self.model.as_ref(),
            query,
            &results,
            self.max_attempts,
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                return QueryOutcome::Failed {
                    stage: Stage::Generate,
                    message: format!("{e:#}"),
                }
            }
        };

        let artifact = match outcome {
            GenerationOutcome::Accepted { artifact, attempts } => {
                tracing::debug!(attempts = attempts.len(), "artifact accepted");
                artifact
            }
            GenerationOutcome::Exhausted {
                attempts,
                last_feedback,
            } => {
                tracing::info!(attempts = attempts.len(), "generation exhausted");
                return QueryOutcome::Exhausted {
                    detail: format!(
                        "unable to produce runnable code after {} attempts: {}",
                        attempts.len(),
                        last_feedback
                    ),
                };
            }
        };

        // Sandboxed execution over the caller's rows.
        let rows = match records::fetch_all(&self.pool, self.max_rows).await {
            Ok(receipts) => receipts.iter().map(|r| r.to_row()).collect(),
            Err(e) => {
                return QueryOutcome::Failed {
                    stage: Stage::Execute,
                    message: format!("{e:#}"),
                }
            }
        };
        let result = sandbox::execute(artifact.clone(), rows, self.sandbox_limits).await;

        // File outputs stream back to the caller as-is; everything else is
        // formatted into prose.
        match result {
            ExecutionResult::File { filename, bytes } => QueryOutcome::FileProduced {
                filename,
                bytes,
                code: artifact,
            },
            result => {
                let formatter_model = if self.format_with_model {
                    Some(self.model.as_ref())
                } else {
                    None
                };
                let answer =
                    format::format_answer(formatter_model, query, &artifact, &result).await;
                QueryOutcome::Answered(answer)
            }
        }
    }
}
