//! Versioned snapshot store.
//!
//! Durable, multi-version storage of index snapshots with an atomically
//! updated "latest" alias per index kind. Two backends implement the
//! [`SnapshotStore`] trait: a directory-backed store (dev, tests) and an
//! S3-backed store ([`crate::store_s3`]).
//!
//! # Naming
//!
//! ```text
//! <prefix><kind>_<YYYYMMDDHHMMSS>.idx    immutable, versioned snapshot
//! <prefix><kind>_latest.idx              alias of the most recent snapshot
//! ```
//!
//! The prefix isolates environments (e.g. `prod/` vs `staging/`) inside a
//! shared store.
//!
//! # Promotion atomicity
//!
//! `promote_latest` replaces the alias with a complete copy of the promoted
//! snapshot — temp-file + rename locally, server-side object copy on S3 —
//! so a concurrent `read_latest` observes either the old or the new
//! snapshot in full, never a half-written one. A snapshot that failed to
//! write is never promoted: `write_version` surfaces the failure to the
//! maintenance job before any repointing happens.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;

use crate::models::IndexVersion;

pub const SNAPSHOT_EXT: &str = "idx";

/// Durable multi-version snapshot storage with atomic latest promotion.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Backend label for logging (`"fs"`, `"s3"`).
    fn name(&self) -> &str;

    /// Write an immutable snapshot and return its version descriptor.
    /// Does not touch the latest alias.
    async fn write_version(&self, kind: &str, bytes: &[u8]) -> Result<IndexVersion>;

    /// Atomically repoint the latest alias at an already-written version.
    async fn promote_latest(&self, version: &IndexVersion) -> Result<()>;

    /// Cheap staleness probe: the version id the latest alias points at,
    /// or `None` if no snapshot has been promoted yet.
    async fn latest_version_id(&self, kind: &str) -> Result<Option<String>>;

    /// Download the latest snapshot: `(version_id, bytes)`.
    async fn read_latest(&self, kind: &str) -> Result<Option<(String, Vec<u8>)>>;

    /// All immutable versions of a kind, oldest first.
    async fn list_versions(&self, kind: &str) -> Result<Vec<IndexVersion>>;
}

/// Instantiate the backend named by the configuration.
pub fn create_store(config: &crate::config::StoreConfig) -> Result<std::sync::Arc<dyn SnapshotStore>> {
    match config.backend.as_str() {
        "fs" => {
            let root = config
                .root
                .clone()
                .ok_or_else(|| anyhow::anyhow!("store.root required for fs backend"))?;
            Ok(std::sync::Arc::new(FsSnapshotStore::new(
                root,
                config.prefix.clone(),
            )))
        }
        "s3" => Ok(std::sync::Arc::new(crate::store_s3::S3SnapshotStore::new(
            config,
        )?)),
        other => anyhow::bail!("Unknown store backend: {}", other),
    }
}

/// Key of an immutable snapshot object.
pub fn version_key(prefix: &str, kind: &str, version_id: &str) -> String {
    format!("{prefix}{kind}_{version_id}.{SNAPSHOT_EXT}")
}

/// Key of the mutable latest alias.
pub fn latest_key(prefix: &str, kind: &str) -> String {
    format!("{prefix}{kind}_latest.{SNAPSHOT_EXT}")
}

/// Timestamp-derived version id (UTC, second resolution).
pub fn new_version_id() -> String {
    Utc::now().format("%Y%m%d%H%M%S").to_string()
}

/// Parse the version id back out of an immutable snapshot key.
pub fn parse_version_id<'a>(key: &'a str, prefix: &str, kind: &str) -> Option<&'a str> {
    let name = key.strip_prefix(prefix)?;
    let rest = name.strip_prefix(kind)?.strip_prefix('_')?;
    let id = rest.strip_suffix(&format!(".{SNAPSHOT_EXT}"))?;
    if id == "latest" {
        None
    } else {
        Some(id)
    }
}

// ============ Filesystem backend ============

/// Directory-backed snapshot store.
///
/// Both version writes and latest promotion go through a temp file in the
/// same directory followed by `rename`, which is atomic on POSIX
/// filesystems. A sidecar `<latest>.version` marker records which version
/// id the alias currently holds, giving `latest_version_id` a byte-free
/// probe.
pub struct FsSnapshotStore {
    root: PathBuf,
    prefix: String,
}

impl FsSnapshotStore {
    pub fn new(root: PathBuf, prefix: impl Into<String>) -> Self {
        Self {
            root,
            prefix: prefix.into(),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn write_atomic(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let dest = self.path_for(key);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create store dir {}", parent.display()))?;
        }
        let tmp = dest.with_extension(format!("{SNAPSHOT_EXT}.tmp-{}", uuid::Uuid::new_v4()));
        std::fs::write(&tmp, bytes)
            .with_context(|| format!("Failed to write snapshot temp file {}", tmp.display()))?;
        std::fs::rename(&tmp, &dest)
            .with_context(|| format!("Failed to move snapshot into place at {}", dest.display()))?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for FsSnapshotStore {
    fn name(&self) -> &str {
        "fs"
    }

    async fn write_version(&self, kind: &str, bytes: &[u8]) -> Result<IndexVersion> {
        let mut version_id = new_version_id();
        // Second-resolution ids can collide under rapid writes; suffix
        // until the name is free so versions stay immutable.
        let mut n = 1;
        while self
            .path_for(&version_key(&self.prefix, kind, &version_id))
            .exists()
        {
            n += 1;
            version_id = format!("{}-{n}", new_version_id());
        }

        let storage_key = version_key(&self.prefix, kind, &version_id);
        self.write_atomic(&storage_key, bytes)?;

        Ok(IndexVersion {
            kind: kind.to_string(),
            version_id,
            storage_key,
        })
    }

    async fn promote_latest(&self, version: &IndexVersion) -> Result<()> {
        let src = self.path_for(&version.storage_key);
        let bytes = std::fs::read(&src).with_context(|| {
            format!(
                "Cannot promote {}: snapshot not readable at {}",
                version.version_id,
                src.display()
            )
        })?;

        let alias = latest_key(&self.prefix, &version.kind);
        self.write_atomic(&alias, &bytes)?;
        self.write_atomic(&format!("{alias}.version"), version.version_id.as_bytes())?;
        Ok(())
    }

    async fn latest_version_id(&self, kind: &str) -> Result<Option<String>> {
        let marker = self.path_for(&format!("{}.version", latest_key(&self.prefix, kind)));
        match std::fs::read_to_string(&marker) {
            Ok(id) => Ok(Some(id.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).context("Failed to read latest version marker"),
        }
    }

    async fn read_latest(&self, kind: &str) -> Result<Option<(String, Vec<u8>)>> {
        // Marker first: if a promotion lands between the two reads we
        // record an older id with newer bytes, and the next staleness
        // probe simply refreshes again.
        let Some(version_id) = self.latest_version_id(kind).await? else {
            return Ok(None);
        };

        let alias = self.path_for(&latest_key(&self.prefix, kind));
        match std::fs::read(&alias) {
            Ok(bytes) => Ok(Some((version_id, bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).context("Failed to read latest snapshot"),
        }
    }

    async fn list_versions(&self, kind: &str) -> Result<Vec<IndexVersion>> {
        // The prefix may carry a directory part ("prod/") and a file-name
        // part ("prod/rcpt-"); split on the last slash.
        let (dir_part, _name_part) = match self.prefix.rsplit_once('/') {
            Some((d, n)) => (d.to_string(), n.to_string()),
            None => (String::new(), self.prefix.clone()),
        };
        let dir = if dir_part.is_empty() {
            self.root.clone()
        } else {
            self.root.join(&dir_part)
        };

        let mut versions = Vec::new();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(versions),
            Err(e) => return Err(e).context("Failed to list snapshot directory"),
        };

        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().to_string();
            let key = if dir_part.is_empty() {
                file_name
            } else {
                format!("{}/{}", dir_part, file_name)
            };
            if let Some(id) = parse_version_id(&key, &self.prefix, kind) {
                versions.push(IndexVersion {
                    kind: kind.to_string(),
                    version_id: id.to_string(),
                    storage_key: key.clone(),
                });
            }
        }

        versions.sort_by(|a, b| a.version_id.cmp(&b.version_id));
        Ok(versions)
    }
}
