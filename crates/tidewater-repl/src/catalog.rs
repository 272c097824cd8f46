//! Per-cluster cache of snapshottable directories.
//!
//! Answers "is `path`, or one of its ancestors, snapshot-enabled on this cluster?"
//! without listing the filesystem on every call. Listings expire after a TTL, a
//! lookup for `/` always refreshes, and callers can invalidate explicitly.

use crate::error::Result;
use crate::fs::FileSystem;
use crate::uri;
use dashmap::DashMap;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
struct CachedListing {
    dirs: HashSet<String>,
    fetched_at: Instant,
}

/// Time-bounded cache of snapshottable directories, keyed by cluster name.
#[derive(Debug)]
pub struct SnapshotCatalog {
    ttl: Duration,
    listings: DashMap<String, CachedListing>,
}

impl SnapshotCatalog {
    /// Create an empty catalog whose listings live for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            listings: DashMap::new(),
        }
    }

    /// Configured TTL.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Whether `path` or an ancestor is snapshottable on `cluster`.
    pub async fn is_snapshottable(
        &self,
        cluster: &str,
        fs: &dyn FileSystem,
        path: &str,
    ) -> Result<bool> {
        Ok(self.snapshot_root(cluster, fs, path).await?.is_some())
    }

    /// The nearest snapshottable directory at or above `path`, shallowest first.
    pub async fn snapshot_root(
        &self,
        cluster: &str,
        fs: &dyn FileSystem,
        path: &str,
    ) -> Result<Option<String>> {
        let path = uri::path_of(path);
        self.refresh_if_needed(cluster, fs, path == "/").await?;

        let listing = match self.listings.get(cluster) {
            Some(l) => l,
            None => return Ok(None),
        };

        let mut candidate = String::from("/");
        if listing.dirs.contains(&candidate) {
            return Ok(Some(candidate));
        }
        for part in path.split('/').filter(|p| !p.is_empty()) {
            candidate.push_str(part);
            candidate.push('/');
            if listing.dirs.contains(&candidate) {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    /// Drop the cached listing for one cluster.
    pub fn invalidate(&self, cluster: &str) {
        self.listings.remove(cluster);
    }

    /// Drop every cached listing.
    pub fn invalidate_all(&self) {
        self.listings.clear();
    }

    /// Whether the listing for `cluster` is present and younger than the TTL.
    pub fn is_fresh(&self, cluster: &str) -> bool {
        self.listings
            .get(cluster)
            .map(|l| l.fetched_at.elapsed() < self.ttl)
            .unwrap_or(false)
    }

    async fn refresh_if_needed(
        &self,
        cluster: &str,
        fs: &dyn FileSystem,
        force: bool,
    ) -> Result<()> {
        if !force && self.is_fresh(cluster) {
            return Ok(());
        }
        debug!(cluster, "Refreshing snapshottable directory listing");
        let dirs = fs
            .snapshottable_dirs()
            .await?
            .iter()
            .map(|d| {
                let p = uri::path_of(d);
                if p == "/" {
                    p
                } else {
                    format!("{}/", p)
                }
            })
            .collect();
        self.listings.insert(
            cluster.to_string(),
            CachedListing {
                dirs,
                fetched_at: Instant::now(),
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::MemFs;

    #[tokio::test]
    async fn test_exact_directory_is_snapshottable() {
        let fs = MemFs::new("hdfs://nn1:8020");
        fs.mkdirs("/data/a").await.unwrap();
        fs.allow_snapshot("/data/a");

        let catalog = SnapshotCatalog::new(Duration::from_secs(60));
        assert!(catalog
            .is_snapshottable("c1", &fs, "hdfs://nn1:8020/data/a")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_descendant_is_snapshottable() {
        let fs = MemFs::new("hdfs://nn1:8020");
        fs.mkdirs("/data/a/b/c").await.unwrap();
        fs.allow_snapshot("/data/a");

        let catalog = SnapshotCatalog::new(Duration::from_secs(60));
        let root = catalog
            .snapshot_root("c1", &fs, "/data/a/b/c")
            .await
            .unwrap();
        assert_eq!(root.as_deref(), Some("/data/a/"));
    }

    #[tokio::test]
    async fn test_sibling_prefix_is_not_snapshottable() {
        let fs = MemFs::new("hdfs://nn1:8020");
        fs.mkdirs("/data/ab").await.unwrap();
        fs.allow_snapshot("/data/a");

        let catalog = SnapshotCatalog::new(Duration::from_secs(60));
        assert!(!catalog.is_snapshottable("c1", &fs, "/data/ab").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_listing_cached_until_ttl() {
        let fs = MemFs::new("hdfs://nn1:8020");
        fs.mkdirs("/data/a").await.unwrap();
        let catalog = SnapshotCatalog::new(Duration::from_secs(60));

        assert!(!catalog.is_snapshottable("c1", &fs, "/data/a").await.unwrap());
        fs.allow_snapshot("/data/a");
        // still served from the stale listing
        assert!(!catalog.is_snapshottable("c1", &fs, "/data/a").await.unwrap());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(catalog.is_snapshottable("c1", &fs, "/data/a").await.unwrap());
    }

    #[tokio::test]
    async fn test_invalidate_forces_refresh() {
        let fs = MemFs::new("hdfs://nn1:8020");
        fs.mkdirs("/data/a").await.unwrap();
        let catalog = SnapshotCatalog::new(Duration::from_secs(3600));

        assert!(!catalog.is_snapshottable("c1", &fs, "/data/a").await.unwrap());
        fs.allow_snapshot("/data/a");
        catalog.invalidate("c1");
        assert!(!catalog.is_fresh("c1"));
        assert!(catalog.is_snapshottable("c1", &fs, "/data/a").await.unwrap());
    }

    #[tokio::test]
    async fn test_listings_are_per_cluster() {
        let fs1 = MemFs::new("hdfs://nn1:8020");
        let fs2 = MemFs::new("hdfs://nn2:8020");
        fs1.mkdirs("/data").await.unwrap();
        fs2.mkdirs("/data").await.unwrap();
        fs1.allow_snapshot("/data");

        let catalog = SnapshotCatalog::new(Duration::from_secs(3600));
        assert!(catalog.is_snapshottable("c1", &fs1, "/data").await.unwrap());
        assert!(!catalog.is_snapshottable("c2", &fs2, "/data").await.unwrap());

        catalog.invalidate_all();
        assert!(!catalog.is_fresh("c1"));
        assert!(!catalog.is_fresh("c2"));
    }

    #[tokio::test]
    async fn test_root_lookup_always_refreshes() {
        let fs = MemFs::new("hdfs://nn1:8020");
        let catalog = SnapshotCatalog::new(Duration::from_secs(3600));

        assert!(!catalog.is_snapshottable("c1", &fs, "/").await.unwrap());
        fs.allow_snapshot("/");
        assert!(catalog.is_snapshottable("c1", &fs, "/").await.unwrap());
    }
}
