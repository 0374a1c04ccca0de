use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Versioned snapshot store settings.
#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// Backend: `fs` (directory) or `s3` (bucket).
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Environment namespace prefix (e.g. `"prod/"`); keeps staging and
    /// production snapshots apart inside a shared store.
    #[serde(default)]
    pub prefix: String,
    /// Root directory for the `fs` backend.
    #[serde(default)]
    pub root: Option<PathBuf>,
    /// Bucket name for the `s3` backend.
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint for S3-compatible services (MinIO, LocalStack).
    #[serde(default)]
    pub endpoint_url: Option<String>,
    /// Expiry for presigned latest-snapshot reads, in seconds.
    #[serde(default = "default_presign_expiry")]
    pub presign_expiry_secs: u64,
    /// Local directory where snapshots are materialized per process.
    pub cache_dir: PathBuf,
    /// Minimum interval between latest-pointer staleness probes.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
}

fn default_backend() -> String {
    "fs".to_string()
}
fn default_region() -> String {
    "us-east-1".to_string()
}
fn default_presign_expiry() -> u64 {
    1200
}
fn default_refresh_interval() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `openai`, `hash`, or `disabled`.
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: default_dims(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_dims() -> usize {
    384
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

/// Chat-completion model used for code generation and answer formatting.
#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    /// `openai` or `disabled`.
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_model_timeout")]
    pub timeout_secs: u64,
    /// Also run the formatter through the model; plain rendering is the
    /// fallback either way.
    #[serde(default)]
    pub format_answers: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            max_retries: default_max_retries(),
            timeout_secs: default_model_timeout(),
            format_answers: false,
        }
    }
}

fn default_model_timeout() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Number of search results handed to the model as context.
    #[serde(default = "default_context_k")]
    pub context_k: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            context_k: default_context_k(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_context_k() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct SandboxConfig {
    /// Hard wall-clock limit for one artifact run.
    #[serde(default = "default_sandbox_timeout")]
    pub timeout_ms: u64,
    /// Lua allocator quota in kilobytes.
    #[serde(default = "default_memory_kb")]
    pub memory_kb: usize,
    /// Maximum number of receipt rows exposed to an artifact.
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_sandbox_timeout(),
            memory_kb: default_memory_kb(),
            max_rows: default_max_rows(),
        }
    }
}

fn default_sandbox_timeout() -> u64 {
    2_000
}
fn default_memory_kb() -> usize {
    16 * 1024
}
fn default_max_rows() -> usize {
    10_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    match config.store.backend.as_str() {
        "fs" => {
            if config.store.root.is_none() {
                anyhow::bail!("store.root is required when store.backend = \"fs\"");
            }
        }
        "s3" => {
            if config.store.bucket.is_none() {
                anyhow::bail!("store.bucket is required when store.backend = \"s3\"");
            }
        }
        other => anyhow::bail!("Unknown store backend: '{}'. Must be fs or s3.", other),
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "hash" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or hash.",
            other
        ),
    }

    if config.embedding.provider == "openai" && config.embedding.model.is_none() {
        anyhow::bail!("embedding.model must be specified when provider is 'openai'");
    }

    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }

    match config.model.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown model provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    if config.model.provider == "openai" && config.model.model.is_none() {
        anyhow::bail!("model.model must be specified when provider is 'openai'");
    }

    if config.generation.max_attempts == 0 {
        anyhow::bail!("generation.max_attempts must be >= 1");
    }

    if config.sandbox.timeout_ms == 0 {
        anyhow::bail!("sandbox.timeout_ms must be > 0");
    }

    Ok(config)
}
