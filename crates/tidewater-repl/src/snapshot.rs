//! Snapshot protocol: eligibility, common-snapshot discovery, and idempotent
//! create/rename/delete helpers shared by every snapshot-based job.
//!
//! Names follow two families. Promoted snapshots are `tidewater-snapshot-<policy>-<millis>`
//! and are the only names considered when pairing source and target. Temporary names
//! (`<promoted>.inflight` and [`RECOVERY_SNAPSHOT`]) mark work that has not been
//! confirmed by the copy engine and never count as a common point.

use crate::catalog::SnapshotCatalog;
use crate::error::{ReplError, Result};
use crate::fs::{DiffEntry, FileSystem};
use crate::uri;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Prefix of every promoted snapshot name.
pub const SNAPSHOT_PREFIX: &str = "tidewater-snapshot-";

/// Suffix of a snapshot taken for a copy the engine has not yet confirmed.
pub const INFLIGHT_SUFFIX: &str = ".inflight";

/// Target-side snapshot taken while deciding whether a recovery copy is needed.
pub const RECOVERY_SNAPSHOT: &str = "tempRecoverySnapshot";

/// Wall-clock milliseconds since the Unix epoch.
pub fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Promoted snapshot name for `policy` taken at `now_ms`.
pub fn snapshot_name(policy: &str, now_ms: u64) -> String {
    format!("{}{}-{}", SNAPSHOT_PREFIX, policy, now_ms)
}

/// Temporary name under which `name` lives until the copy engine confirms success.
pub fn inflight_name(name: &str) -> String {
    format!("{}{}", name, INFLIGHT_SUFFIX)
}

/// True for names that mark unconfirmed work.
pub fn is_temporary(name: &str) -> bool {
    name == RECOVERY_SNAPSHOT || name.ends_with(INFLIGHT_SUFFIX)
}

/// One end of a replication: which cluster, its handle, and the dataset path.
#[derive(Clone, Copy)]
pub struct Endpoint<'a> {
    /// Cluster name, used as the catalog key.
    pub cluster: &'a str,
    /// Filesystem handle.
    pub fs: &'a dyn FileSystem,
    /// Staging URI or path of the dataset.
    pub path: &'a str,
}

/// Snapshot operations used by replication jobs.
pub struct SnapshottingProtocol {
    catalog: Arc<SnapshotCatalog>,
}

impl SnapshottingProtocol {
    /// Create a protocol backed by `catalog`.
    pub fn new(catalog: Arc<SnapshotCatalog>) -> Self {
        Self { catalog }
    }

    /// Whether a replication between `source` and `target` can use snapshot diffs.
    ///
    /// Remote locations are never eligible. Both paths must exist.
    pub async fn is_eligible(&self, source: Endpoint<'_>, target: Endpoint<'_>) -> Result<bool> {
        if uri::is_hcfs(source.path) || uri::is_hcfs(target.path) {
            return Ok(false);
        }
        for end in [source, target] {
            if !end.fs.exists(end.path).await? {
                return Err(ReplError::PathMissing {
                    path: end.path.to_string(),
                });
            }
        }
        let eligible = self
            .catalog
            .is_snapshottable(source.cluster, source.fs, source.path)
            .await?
            && self
                .catalog
                .is_snapshottable(target.cluster, target.fs, target.path)
                .await?;
        debug!(source = %source.path, target = %target.path, eligible, "Checked snapshot eligibility");
        Ok(eligible)
    }

    /// The most recently created promoted snapshot that exists under the same name on both ends.
    pub async fn latest_common_snapshot(
        &self,
        source: Endpoint<'_>,
        target: Endpoint<'_>,
    ) -> Result<Option<String>> {
        let source_names: HashSet<String> = source
            .fs
            .list_snapshots(source.path)
            .await?
            .into_iter()
            .filter(|s| !is_temporary(&s.name))
            .map(|s| s.name)
            .collect();
        if source_names.is_empty() {
            return Ok(None);
        }

        let mut target_snaps = target.fs.list_snapshots(target.path).await?;
        target_snaps.sort_by(|a, b| {
            b.created_at_ms
                .cmp(&a.created_at_ms)
                .then_with(|| b.name.cmp(&a.name))
        });
        Ok(target_snaps
            .into_iter()
            .filter(|s| !is_temporary(&s.name))
            .find(|s| source_names.contains(&s.name))
            .map(|s| s.name))
    }

    /// Create snapshot `name`, replacing any snapshot already holding that name.
    pub async fn create(&self, fs: &dyn FileSystem, dir: &str, name: &str) -> Result<()> {
        if fs.snapshot_exists(dir, name).await? {
            debug!(dir, snapshot = name, "Replacing existing snapshot");
            fs.delete_snapshot(dir, name).await?;
        }
        fs.create_snapshot(dir, name).await?;
        info!(dir, snapshot = name, "Created snapshot");
        Ok(())
    }

    /// Rename temporary snapshot `temp` to `permanent`.
    ///
    /// Succeeds without change when `permanent` already exists and `temp` does not.
    pub async fn promote(
        &self,
        fs: &dyn FileSystem,
        dir: &str,
        temp: &str,
        permanent: &str,
    ) -> Result<()> {
        let temp_exists = fs.snapshot_exists(dir, temp).await?;
        let permanent_exists = fs.snapshot_exists(dir, permanent).await?;
        match (temp_exists, permanent_exists) {
            (true, true) => {
                fs.delete_snapshot(dir, permanent).await?;
                fs.rename_snapshot(dir, temp, permanent).await?;
            }
            (true, false) => fs.rename_snapshot(dir, temp, permanent).await?,
            (false, true) => {
                debug!(dir, snapshot = permanent, "Snapshot already promoted");
                return Ok(());
            }
            (false, false) => {
                return Err(ReplError::snapshot(
                    dir,
                    temp,
                    "temporary snapshot missing, nothing to promote",
                ))
            }
        }
        info!(dir, from = temp, to = permanent, "Promoted snapshot");
        Ok(())
    }

    /// Delete snapshot `name` if present; returns whether it existed.
    pub async fn delete_if_exists(&self, fs: &dyn FileSystem, dir: &str, name: &str) -> Result<bool> {
        if !fs.snapshot_exists(dir, name).await? {
            return Ok(false);
        }
        fs.delete_snapshot(dir, name).await?;
        info!(dir, snapshot = name, "Deleted snapshot");
        Ok(true)
    }

    /// Delete every temporary snapshot under `dir`; returns the deleted names.
    pub async fn discard_temporaries(&self, fs: &dyn FileSystem, dir: &str) -> Result<Vec<String>> {
        let mut discarded = Vec::new();
        for snap in fs.list_snapshots(dir).await? {
            if !is_temporary(&snap.name) {
                continue;
            }
            match fs.delete_snapshot(dir, &snap.name).await {
                Ok(()) => discarded.push(snap.name),
                Err(e) => warn!(dir, snapshot = %snap.name, error = %e, "Failed to discard temporary snapshot"),
            }
        }
        if !discarded.is_empty() {
            info!(dir, count = discarded.len(), "Discarded temporary snapshots");
        }
        Ok(discarded)
    }

    /// Changes under `dir` between snapshots `from` and `to`.
    pub async fn diff(
        &self,
        fs: &dyn FileSystem,
        dir: &str,
        from: &str,
        to: &str,
    ) -> Result<Vec<DiffEntry>> {
        fs.snapshot_diff(dir, from, to).await
    }
}
