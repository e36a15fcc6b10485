use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};

use crate::store::DurableStore;
use crate::TermKeepError;

pub const ROLLBACK_METADATA_KEY: &str = "rollback-metadata";
pub const ROLLBACK_PENDING_KEY: &str = "rollback-pending";

/// How many prior releases are kept on disk.
pub const DEFAULT_RETAIN: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackVersionMetadata {
    pub version: String,
    pub path: String,
    pub preserved_at: DateTime<Utc>,
    pub size_bytes: u64,
}

/// Instruction consumed on next launch. Written by `install_rollback`;
/// the running process never performs the rollback itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingRollback {
    pub target_version: String,
    pub source_path: String,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct VersionMarker {
    version: String,
    platform: String,
    arch: String,
    preserved_at: DateTime<Utc>,
}

/// Snapshots whole-application version state before upgrades and stages a
/// rollback instruction for the next launch.
///
/// Preserved releases live under `<root>/versions/v<version>/`. Those
/// directories hold arbitrary payload trees rather than keyed documents,
/// so this service manages them directly; its metadata and the pending
/// instruction still go through the [`DurableStore`].
pub struct VersionKeeper {
    store: Arc<DurableStore>,
    retain: usize,
    version_pattern: Regex,
}

impl VersionKeeper {
    pub fn new(store: Arc<DurableStore>, retain: usize) -> Self {
        Self {
            store,
            retain,
            // Strict semver shape. Anything else (path separators, `..`)
            // is rejected before a directory name is built from it.
            version_pattern: Regex::new(r"^[0-9]+\.[0-9]+\.[0-9]+(-[0-9A-Za-z.]+)?$")
                .expect("version pattern is valid"),
        }
    }

    fn version_dir(&self, version: &str) -> PathBuf {
        self.store.root().join("versions").join(format!("v{}", version))
    }

    pub async fn preserved_versions(&self) -> crate::Result<Vec<RollbackVersionMetadata>> {
        Ok(self
            .store
            .read_as(ROLLBACK_METADATA_KEY)
            .await?
            .unwrap_or_default())
    }

    /// Preserve `version` for later rollback: create its directory, write
    /// the marker document, record metadata, and evict the oldest preserved
    /// versions beyond the retention bound.
    pub async fn keep_previous_version(
        &self,
        version: &str,
    ) -> crate::Result<RollbackVersionMetadata> {
        if !self.version_pattern.is_match(version) {
            return Err(TermKeepError::InvalidVersion(version.to_string()));
        }

        let dir = self.version_dir(version);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| TermKeepError::FileSystem(e.to_string()))?;

        let marker = VersionMarker {
            version: version.to_string(),
            platform: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            preserved_at: Utc::now(),
        };
        let marker_json = serde_json::to_string_pretty(&marker)?;
        fs::write(dir.join(".app-version"), marker_json)
            .await
            .map_err(|e| TermKeepError::FileSystem(e.to_string()))?;

        let size_bytes = directory_size(&dir).await?;

        let entry = RollbackVersionMetadata {
            version: version.to_string(),
            path: dir.to_string_lossy().to_string(),
            preserved_at: Utc::now(),
            size_bytes,
        };

        let mut metadata = self.preserved_versions().await?;
        metadata.retain(|m| m.version != version);
        metadata.push(entry.clone());

        // Metadata is append-ordered, so the front holds the oldest
        // preserved versions.
        while metadata.len() > self.retain {
            let evicted = metadata.remove(0);
            info!("Evicting preserved version {}", evicted.version);
            if let Err(e) = fs::remove_dir_all(&evicted.path).await {
                warn!(
                    "Failed to remove preserved version directory {}: {}",
                    evicted.path, e
                );
            }
        }

        self.store.write_as(ROLLBACK_METADATA_KEY, &metadata).await?;
        Ok(entry)
    }

    /// Stage a rollback to `version`. Writes the pending instruction only;
    /// a restart completes the rollback. Metadata pointing at a directory
    /// that no longer exists is purged and reported as not found.
    pub async fn install_rollback(&self, version: &str) -> crate::Result<PendingRollback> {
        let mut metadata = self.preserved_versions().await?;
        let position = metadata
            .iter()
            .position(|m| m.version == version)
            .ok_or_else(|| TermKeepError::VersionNotFound(version.to_string()))?;

        if !Path::new(&metadata[position].path).exists() {
            warn!(
                "Preserved version {} vanished from disk, purging metadata",
                version
            );
            metadata.remove(position);
            self.store.write_as(ROLLBACK_METADATA_KEY, &metadata).await?;
            return Err(TermKeepError::VersionNotFound(version.to_string()));
        }

        let pending = PendingRollback {
            target_version: version.to_string(),
            source_path: metadata[position].path.clone(),
            requested_at: Utc::now(),
        };
        self.store.write_as(ROLLBACK_PENDING_KEY, &pending).await?;
        info!("Rollback to {} staged for next launch", version);
        Ok(pending)
    }

    /// Absence of the instruction file is the normal case, not an error.
    pub async fn check_pending_rollback(&self) -> crate::Result<Option<PendingRollback>> {
        self.store.read_as(ROLLBACK_PENDING_KEY).await
    }

    pub async fn clear_pending_rollback(&self) -> crate::Result<()> {
        self.store.remove(ROLLBACK_PENDING_KEY).await
    }
}

/// Total byte size of every file under `path`, walked iteratively.
async fn directory_size(path: &Path) -> crate::Result<u64> {
    let mut total = 0u64;
    let mut stack = vec![path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| TermKeepError::FileSystem(e.to_string()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| TermKeepError::FileSystem(e.to_string()))?
        {
            let meta = entry
                .metadata()
                .await
                .map_err(|e| TermKeepError::FileSystem(e.to_string()))?;
            if meta.is_dir() {
                stack.push(entry.path());
            } else {
                total += meta.len();
            }
        }
    }
    Ok(total)
}
