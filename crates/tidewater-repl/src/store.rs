//! Persistence boundary: policies, clusters and per-instance tracking.
//!
//! The engine only reads policies and clusters and writes instance outcomes and
//! tracking info. [`MemoryStore`] is a key-indexed, optimistically versioned
//! implementation used by tests, the simulator and the CLI.

use crate::context::InstanceOutcome;
use crate::error::{ReplError, Result};
use crate::metrics::TrackingInfo;
use crate::model::{Cluster, Policy};
use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

/// Read access to policy and cluster records.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// The named policy; retired or absent policies are [`ReplError::NotFound`].
    async fn active_policy(&self, name: &str) -> Result<Policy>;

    /// The named cluster; retired or absent clusters are [`ReplError::NotFound`].
    async fn active_cluster(&self, name: &str) -> Result<Cluster>;
}

/// Per-instance status and tracking info.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Persist the outcome of one attempt.
    async fn record_outcome(&self, instance_id: &str, outcome: &InstanceOutcome) -> Result<()>;

    /// Tracking info recorded by earlier attempts; empty when none.
    async fn tracking_info(&self, instance_id: &str) -> Result<TrackingInfo>;

    /// Replace the tracking info of an instance.
    async fn store_tracking_info(&self, instance_id: &str, info: &TrackingInfo) -> Result<()>;
}

/// A stored record with its version and retirement flag.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    /// Monotonic version, starting at 1.
    pub version: u64,
    /// Retired records are invisible to lookups.
    pub retired: bool,
    /// Stored value.
    pub value: T,
}

/// Stored state of one policy instance.
#[derive(Debug, Clone, Default)]
pub struct InstanceRecord {
    /// Bumped on every write.
    pub version: u64,
    /// Tracking info.
    pub tracking: TrackingInfo,
    /// Last reported outcome.
    pub outcome: Option<InstanceOutcome>,
}

/// In-memory store with optimistic versioning.
#[derive(Debug, Default)]
pub struct MemoryStore {
    policies: DashMap<String, Versioned<Policy>>,
    clusters: DashMap<String, Versioned<Cluster>>,
    instances: DashMap<String, InstanceRecord>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new policy; returns its version.
    pub fn put_policy(&self, policy: Policy) -> u64 {
        put(&self.policies, policy.name.clone(), policy)
    }

    /// Replace a policy when `expected_version` matches the stored version.
    pub fn update_policy(&self, policy: Policy, expected_version: u64) -> Result<u64> {
        update(&self.policies, "policy", policy.name.clone(), policy, expected_version)
    }

    /// Retire a policy so lookups fail.
    pub fn retire_policy(&self, name: &str) -> Result<()> {
        retire(&self.policies, "policy", name)
    }

    /// Current version of a policy, retired or not.
    pub fn policy_version(&self, name: &str) -> Option<u64> {
        self.policies.get(name).map(|v| v.version)
    }

    /// Insert a new cluster; returns its version.
    pub fn put_cluster(&self, cluster: Cluster) -> u64 {
        put(&self.clusters, cluster.name.clone(), cluster)
    }

    /// Replace a cluster when `expected_version` matches the stored version.
    pub fn update_cluster(&self, cluster: Cluster, expected_version: u64) -> Result<u64> {
        update(&self.clusters, "cluster", cluster.name.clone(), cluster, expected_version)
    }

    /// Retire a cluster so lookups fail.
    pub fn retire_cluster(&self, name: &str) -> Result<()> {
        retire(&self.clusters, "cluster", name)
    }

    /// Snapshot of an instance record.
    pub fn instance(&self, instance_id: &str) -> Option<InstanceRecord> {
        self.instances.get(instance_id).map(|r| r.clone())
    }
}

fn put<T>(map: &DashMap<String, Versioned<T>>, key: String, value: T) -> u64 {
    let version = map.get(&key).map(|v| v.version + 1).unwrap_or(1);
    map.insert(
        key,
        Versioned {
            version,
            retired: false,
            value,
        },
    );
    version
}

fn update<T>(
    map: &DashMap<String, Versioned<T>>,
    entity: &'static str,
    key: String,
    value: T,
    expected_version: u64,
) -> Result<u64> {
    let mut entry = map.get_mut(&key).ok_or_else(|| ReplError::NotFound {
        entity,
        name: key.clone(),
    })?;
    if entry.version != expected_version {
        return Err(ReplError::VersionConflict {
            key,
            expected: expected_version,
            found: entry.version,
        });
    }
    entry.version += 1;
    entry.value = value;
    Ok(entry.version)
}

fn retire<T>(map: &DashMap<String, Versioned<T>>, entity: &'static str, key: &str) -> Result<()> {
    let mut entry = map.get_mut(key).ok_or_else(|| ReplError::NotFound {
        entity,
        name: key.to_string(),
    })?;
    entry.retired = true;
    entry.version += 1;
    Ok(())
}

fn active<T: Clone>(
    map: &DashMap<String, Versioned<T>>,
    entity: &'static str,
    key: &str,
) -> Result<T> {
    map.get(key)
        .filter(|v| !v.retired)
        .map(|v| v.value.clone())
        .ok_or_else(|| ReplError::NotFound {
            entity,
            name: key.to_string(),
        })
}

#[async_trait]
impl PolicyStore for MemoryStore {
    async fn active_policy(&self, name: &str) -> Result<Policy> {
        active(&self.policies, "policy", name)
    }

    async fn active_cluster(&self, name: &str) -> Result<Cluster> {
        active(&self.clusters, "cluster", name)
    }
}

#[async_trait]
impl InstanceStore for MemoryStore {
    async fn record_outcome(&self, instance_id: &str, outcome: &InstanceOutcome) -> Result<()> {
        let mut record = self.instances.entry(instance_id.to_string()).or_default();
        record.version += 1;
        record.outcome = Some(outcome.clone());
        debug!(instance_id, status = %outcome.status, version = record.version, "Stored outcome");
        Ok(())
    }

    async fn tracking_info(&self, instance_id: &str) -> Result<TrackingInfo> {
        Ok(self
            .instances
            .get(instance_id)
            .map(|r| r.tracking.clone())
            .unwrap_or_default())
    }

    async fn store_tracking_info(&self, instance_id: &str, info: &TrackingInfo) -> Result<()> {
        let mut record = self.instances.entry(instance_id.to_string()).or_default();
        record.version += 1;
        record.tracking = info.clone();
        Ok(())
    }
}
