//! Filesystem capability consumed by the snapshot protocol and replication jobs.
//!
//! Paths passed to a [`FileSystem`] are staging URIs or plain absolute paths;
//! implementations strip the scheme and authority themselves.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// One snapshot of a snapshottable directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    /// Snapshot name, unique within its directory.
    pub name: String,
    /// Creation time (milliseconds since epoch).
    pub created_at_ms: u64,
}

/// Kind of change reported by a snapshot diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiffKind {
    /// Entry exists only in the later state.
    Create,
    /// Entry content or metadata changed.
    Modify,
    /// Entry exists only in the earlier state.
    Delete,
}

/// One line of a snapshot diff report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffEntry {
    /// Change kind.
    pub kind: DiffKind,
    /// Path relative to the snapshottable directory.
    pub path: String,
}

/// A handle to one cluster's filesystem.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Endpoint this handle was opened against.
    fn endpoint(&self) -> &str;

    /// Whether `path` exists.
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Create `path` and any missing parents.
    async fn mkdirs(&self, path: &str) -> Result<()>;

    /// Every directory on this filesystem that allows snapshots.
    async fn snapshottable_dirs(&self) -> Result<Vec<String>>;

    /// Snapshots of `dir`, in no particular order.
    async fn list_snapshots(&self, dir: &str) -> Result<Vec<SnapshotEntry>>;

    /// Create snapshot `name` of `dir`.
    async fn create_snapshot(&self, dir: &str, name: &str) -> Result<()>;

    /// Delete snapshot `name` of `dir`.
    async fn delete_snapshot(&self, dir: &str, name: &str) -> Result<()>;

    /// Rename snapshot `from` of `dir` to `to`, keeping its creation time.
    async fn rename_snapshot(&self, dir: &str, from: &str, to: &str) -> Result<()>;

    /// Changes between snapshot `from` and snapshot `to` of `dir`.
    async fn snapshot_diff(&self, dir: &str, from: &str, to: &str) -> Result<Vec<DiffEntry>>;

    /// Release the handle. Further calls may fail.
    async fn close(&self) -> Result<()>;

    /// Whether snapshot `name` of `dir` exists.
    async fn snapshot_exists(&self, dir: &str, name: &str) -> Result<bool> {
        Ok(self
            .list_snapshots(dir)
            .await?
            .iter()
            .any(|s| s.name == name))
    }
}

/// Opens filesystem handles for cluster endpoints.
#[async_trait]
pub trait FileSystemProvider: Send + Sync {
    /// Open a fresh, uncached handle for `endpoint` using client configuration `conf`.
    async fn open(
        &self,
        endpoint: &str,
        conf: &BTreeMap<String, String>,
    ) -> Result<Arc<dyn FileSystem>>;
}

/// Source and target handles owned by exactly one job execution.
///
/// A remote end has no handle.
pub struct FsHandles {
    /// Source filesystem, absent when the source is remote.
    pub source: Option<Arc<dyn FileSystem>>,
    /// Target filesystem, absent when the target is remote.
    pub target: Option<Arc<dyn FileSystem>>,
}

impl FsHandles {
    /// Close both handles; every handle is closed even if one fails.
    pub async fn close(self) -> Result<()> {
        let mut first_err = None;
        for (side, fs) in [("source", self.source), ("target", self.target)] {
            if let Some(fs) = fs {
                debug!(side, endpoint = %fs.endpoint(), "Closing filesystem handle");
                if let Err(e) = fs.close().await {
                    warn!(side, endpoint = %fs.endpoint(), error = %e, "Failed to close filesystem");
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
