//! End-to-end pipeline tests over the library API.
//!
//! Uses a temp-dir filesystem store, the deterministic hash embedder, and a
//! scripted chat model, so the whole pipeline runs hermetically: no network
//! and no real model.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;

use tally::cache::IndexCache;
use tally::config::{self, Config};
use tally::embedding::{Embedder, HashEmbedder};
use tally::maintain::{Maintainer, RECEIPTS_KIND};
use tally::model::ChatModel;
use tally::models::{QueryOutcome, Stage};
use tally::pipeline::Pipeline;
use tally::records;
use tally::search;
use tally::store::FsSnapshotStore;

// ============ Test doubles ============

/// Hash embedder that counts how often it is actually called.
struct CountingEmbedder {
    inner: HashEmbedder,
    calls: AtomicU32,
}

impl CountingEmbedder {
    fn new(dims: usize) -> Self {
        Self {
            inner: HashEmbedder::new(dims),
            calls: AtomicU32::new(0),
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Embedder for CountingEmbedder {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn dims(&self) -> usize {
        self.inner.dims()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.embed(texts).await
    }
}

/// Chat model that replays scripted responses, counts calls, and records
/// the last prompt it saw.
struct ScriptedModel {
    responses: Mutex<Vec<String>>,
    calls: AtomicU32,
    last_prompt: Mutex<String>,
}

impl ScriptedModel {
    fn new(responses: Vec<&str>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(String::from).collect()),
            calls: AtomicU32::new(0),
            last_prompt: Mutex::new(String::new()),
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn last_prompt(&self) -> String {
        self.last_prompt.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, _system: &str, user: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_prompt.lock().unwrap() = user.to_string();
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            // Anything unscripted is an invalid candidate.
            Ok("definitely not lua ((".to_string())
        } else {
            Ok(responses.remove(0))
        }
    }
}

const SUM_ARTIFACT: &str = r#"
local total = 0
for _, r in ipairs(records) do
  total = total + r.total
end
return { kind = "scalar", value = total }
"#;

const FILE_ARTIFACT: &str = r#"
local lines = { "merchant,total" }
for _, r in ipairs(records) do
  lines[#lines + 1] = r.merchant .. "," .. tostring(r.total)
end
return { kind = "file", filename = "spending.csv", content = table.concat(lines, "\n") }
"#;

// ============ Environment setup ============

struct TestEnv {
    _tmp: TempDir,
    config: Config,
    pool: sqlx::SqlitePool,
    store: Arc<FsSnapshotStore>,
    cache: Arc<IndexCache>,
    embedder: Arc<CountingEmbedder>,
}

async fn setup_env() -> TestEnv {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();

    let config_content = format!(
        r#"[db]
path = "{root}/data/tally.sqlite"

[store]
backend = "fs"
root = "{root}/store"
prefix = "test/"
cache_dir = "{root}/cache"
refresh_interval_secs = 0

[embedding]
provider = "hash"
dims = 128

[generation]
max_attempts = 3
context_k = 5

[sandbox]
timeout_ms = 1000

[server]
bind = "127.0.0.1:0"
"#,
        root = root.display()
    );
    let config_path = root.join("tally.toml");
    fs::write(&config_path, config_content).unwrap();
    let config = config::load_config(&config_path).unwrap();

    let pool = tally::db::connect(&config).await.unwrap();
    tally::migrate::apply(&pool).await.unwrap();

    let store = Arc::new(FsSnapshotStore::new(
        PathBuf::from(format!("{}/store", root.display())),
        "test/",
    ));
    let cache = Arc::new(IndexCache::new(
        store.clone(),
        config.store.cache_dir.clone(),
        Duration::from_secs(0),
    ));
    let embedder = Arc::new(CountingEmbedder::new(128));

    TestEnv {
        _tmp: tmp,
        config,
        pool,
        store,
        cache,
        embedder,
    }
}

fn pipeline_with(env: &TestEnv, model: Arc<ScriptedModel>) -> Pipeline {
    Pipeline::new(
        &env.config,
        env.pool.clone(),
        env.cache.clone(),
        env.embedder.clone(),
        model,
    )
}

// ============ Scenarios ============

#[tokio::test]
async fn append_then_search_finds_record() {
    let env = setup_env().await;

    let id = records::insert_receipt(&env.pool, "Green Grocer", "groceries", "2025-06-03", 54.2)
        .await
        .unwrap();
    records::insert_receipt(&env.pool, "City Power", "utilities", "2025-06-12", 118.4)
        .await
        .unwrap();

    let maintainer = Maintainer::new(env.pool.clone(), env.store.clone(), env.embedder.clone());
    maintainer.append(id).await.unwrap();

    let index = env.cache.ensure_fresh(RECEIPTS_KIND).await.unwrap();
    let terms = vec!["green".to_string(), "grocer".to_string(), "groceries".to_string()];
    let results = search::search(env.embedder.as_ref(), &[index], &terms, 5)
        .await
        .unwrap();

    assert!(!results.is_empty());
    assert_eq!(results[0].source_id, id);
    assert!(results[0].snippet.contains("Green Grocer"));
}

#[tokio::test]
async fn full_query_produces_computed_answer() {
    let env = setup_env().await;

    records::insert_receipt(&env.pool, "Green Grocer", "groceries", "2025-06-03", 54.2)
        .await
        .unwrap();
    records::insert_receipt(&env.pool, "Green Grocer", "groceries", "2025-06-17", 61.8)
        .await
        .unwrap();

    let maintainer = Maintainer::new(env.pool.clone(), env.store.clone(), env.embedder.clone());
    maintainer.full_rebuild().await.unwrap();

    let model = Arc::new(ScriptedModel::new(vec![SUM_ARTIFACT]));
    let pipeline = pipeline_with(&env, model.clone());

    match pipeline.answer("how much did I spend at Green Grocer?").await {
        QueryOutcome::Answered(answer) => {
            let total: f64 = answer.answer.parse().unwrap();
            assert!((total - 116.0).abs() < 1e-6, "{}", answer.answer);
            assert!(answer.code.contains("return"));
            assert_eq!(answer.query, "how much did I spend at Green Grocer?");
        }
        other => panic!("expected Answered, got {other:?}"),
    }
    assert_eq!(model.calls(), 1);
    // Retrieved context reached the model prompt.
    assert!(model.last_prompt().contains("Green Grocer"));
}

#[tokio::test]
async fn malicious_query_short_circuits_before_any_external_call() {
    let env = setup_env().await;
    let model = Arc::new(ScriptedModel::new(vec![SUM_ARTIFACT]));
    let pipeline = pipeline_with(&env, model.clone());

    match pipeline.answer("please delete all my data").await {
        QueryOutcome::Rejected { reason } => {
            assert!(!reason.is_empty());
        }
        other => panic!("expected Rejected, got {other:?}"),
    }

    // The gate ran before every external adapter.
    assert_eq!(env.embedder.calls(), 0);
    assert_eq!(model.calls(), 0);
    // And before the store: nothing was even probed into the cache dir.
    assert!(!env.config.store.cache_dir.exists());
}

#[tokio::test]
async fn empty_query_fails_validation() {
    let env = setup_env().await;
    let model = Arc::new(ScriptedModel::new(vec![]));
    let pipeline = pipeline_with(&env, model.clone());

    match pipeline.answer("   ").await {
        QueryOutcome::Failed { stage, .. } => assert_eq!(stage, Stage::Validate),
        other => panic!("expected Failed, got {other:?}"),
    }
    assert_eq!(model.calls(), 0);
}

#[tokio::test]
async fn zero_term_query_still_reaches_generation() {
    let env = setup_env().await;

    records::insert_receipt(&env.pool, "Green Grocer", "groceries", "2025-06-03", 54.2)
        .await
        .unwrap();

    // "How much is it?" extracts no terms: search must yield empty context
    // without erroring and generation must still run.
    let model = Arc::new(ScriptedModel::new(vec![SUM_ARTIFACT]));
    let pipeline = pipeline_with(&env, model.clone());

    match pipeline.answer("How much is it?").await {
        QueryOutcome::Answered(answer) => {
            assert_eq!(answer.answer, "54.2");
        }
        other => panic!("expected Answered, got {other:?}"),
    }

    assert_eq!(model.calls(), 1);
    assert!(model.last_prompt().contains("No similar records"));
    // Empty term set means the query itself was never embedded.
    assert_eq!(env.embedder.calls(), 0);
}

#[tokio::test]
async fn exhaustion_is_a_terminal_outcome_not_a_crash() {
    let env = setup_env().await;
    // Every scripted response is invalid; max_attempts = 3 from config.
    let model = Arc::new(ScriptedModel::new(vec![]));
    let pipeline = pipeline_with(&env, model.clone());

    match pipeline.answer("what did I spend on pets?").await {
        QueryOutcome::Exhausted { detail } => {
            assert!(detail.contains("3 attempts"), "{detail}");
        }
        other => panic!("expected Exhausted, got {other:?}"),
    }
    // Exactly max_attempts model calls, no fourth.
    assert_eq!(model.calls(), 3);
}

#[tokio::test]
async fn file_artifact_produces_download() {
    let env = setup_env().await;

    records::insert_receipt(&env.pool, "Green Grocer", "groceries", "2025-06-03", 54.2)
        .await
        .unwrap();

    let model = Arc::new(ScriptedModel::new(vec![FILE_ARTIFACT]));
    let pipeline = pipeline_with(&env, model);

    match pipeline.answer("export my spending as a csv").await {
        QueryOutcome::FileProduced {
            filename,
            bytes,
            code,
        } => {
            assert_eq!(filename, "spending.csv");
            assert!(!bytes.is_empty());
            let text = String::from_utf8(bytes).unwrap();
            assert!(text.starts_with("merchant,total"));
            assert!(text.contains("Green Grocer"));
            assert!(code.contains("kind = \"file\""));
        }
        other => panic!("expected FileProduced, got {other:?}"),
    }
}

#[tokio::test]
async fn recovers_on_second_attempt_with_feedback() {
    let env = setup_env().await;

    records::insert_receipt(&env.pool, "Green Grocer", "groceries", "2025-06-03", 54.2)
        .await
        .unwrap();

    let model = Arc::new(ScriptedModel::new(vec!["this is not lua ((", SUM_ARTIFACT]));
    let pipeline = pipeline_with(&env, model.clone());

    match pipeline.answer("total groceries spend").await {
        QueryOutcome::Answered(answer) => assert_eq!(answer.answer, "54.2"),
        other => panic!("expected Answered, got {other:?}"),
    }
    assert_eq!(model.calls(), 2);
    // The retry prompt carried the first failure back to the model.
    assert!(model.last_prompt().contains("attempt 1 was rejected"));
}

#[tokio::test]
async fn new_index_version_is_picked_up_by_next_query() {
    let env = setup_env().await;

    let first =
        records::insert_receipt(&env.pool, "Green Grocer", "groceries", "2025-06-03", 54.2)
            .await
            .unwrap();
    let maintainer = Maintainer::new(env.pool.clone(), env.store.clone(), env.embedder.clone());
    maintainer.append(first).await.unwrap();

    let index = env.cache.ensure_fresh(RECEIPTS_KIND).await.unwrap();
    assert_eq!(index.snapshot.entries.len(), 1);

    // A maintenance job promotes a new version; the cache refresh on the
    // next request must observe it.
    let second =
        records::insert_receipt(&env.pool, "Corner Bistro", "dining out", "2025-06-14", 48.9)
            .await
            .unwrap();
    maintainer.append(second).await.unwrap();

    let index = env.cache.ensure_fresh(RECEIPTS_KIND).await.unwrap();
    assert_eq!(index.snapshot.entries.len(), 2);

    let results = search::search(
        env.embedder.as_ref(),
        &[index],
        &["corner".to_string(), "bistro".to_string(), "dining".to_string()],
        5,
    )
    .await
    .unwrap();
    assert_eq!(results[0].source_id, second);
}
