//! Policy and cluster records consumed from the persistence boundary.
//!
//! Both are read-only to the engine and immutable for the duration of one instance.

use crate::error::{ReplError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Cluster property naming the HA nameservices.
pub const DFS_NAMESERVICES: &str = "dfs.nameservices";
/// HA nameservices the target cluster treats as its own.
pub const DFS_INTERNAL_NAMESERVICES: &str = "dfs.internal.nameservices";
/// Prefix of the failover proxy provider key, suffixed by a nameservice.
pub const DFS_CLIENT_FAILOVER_PROXY_PROVIDER: &str = "dfs.client.failover.proxy.provider";
/// Key listing every HA configuration key carried into the engine.
pub const HA_CONFIG_KEYS: &str = "ha.config.keys";

/// Kind of replication a policy describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PolicyType {
    /// Filesystem dataset replication.
    Fs,
    /// Snapshot-only filesystem replication.
    Snapshot,
    /// Replication to or from a cloud object store.
    Cloud,
    /// Hive metadata replication (handled elsewhere).
    Hive,
}

impl fmt::Display for PolicyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PolicyType::Fs => "FS",
            PolicyType::Snapshot => "SNAPSHOT",
            PolicyType::Cloud => "CLOUD",
            PolicyType::Hive => "HIVE",
        };
        f.write_str(s)
    }
}

/// Retry settings enforced by the orchestrator, carried for reporting only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Attempts per instance.
    pub attempts: u32,
    /// Delay between attempts in seconds.
    pub delay_seconds: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay_seconds: 30,
        }
    }
}

/// Tuning and behavior keys looked up in a policy's custom property bag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyProperty {
    /// Maximum concurrent copy workers.
    MaxMaps,
    /// Bandwidth per worker in MB/s.
    MapBandwidthMb,
    /// Age expression after which source snapshots may be evicted.
    SourceRetentionAgeLimit,
    /// Snapshots always kept on the source.
    SourceRetentionNumber,
    /// Age expression after which target snapshots may be evicted.
    TargetRetentionAgeLimit,
    /// Snapshots always kept on the target.
    TargetRetentionNumber,
    /// Dataset lives in an encryption zone.
    TdeEncryptionEnabled,
    /// Source and target encryption zones share a key; copy raw bytes.
    TdeSameKey,
    /// Scheduler queue for the copy job.
    QueueName,
    /// Overwrite target files instead of syncing.
    Overwrite,
    /// Skip checksum comparison.
    SkipChecksum,
    /// Delete target entries missing on the source.
    RemoveDeletedFiles,
    /// Keep copying when individual files fail.
    IgnoreErrors,
    /// Preserve block size.
    PreserveBlockSize,
    /// Preserve replication factor.
    PreserveReplicationNumber,
    /// Preserve permissions.
    PreservePermission,
    /// Preserve owner.
    PreserveUser,
    /// Preserve group.
    PreserveGroup,
    /// Preserve checksum type.
    PreserveChecksumType,
    /// Preserve ACLs.
    PreserveAcl,
    /// Preserve extended attributes.
    PreserveXattr,
    /// Preserve modification times.
    PreserveTimes,
}

impl PolicyProperty {
    /// The key under which this property is stored.
    pub fn key(&self) -> &'static str {
        match self {
            PolicyProperty::MaxMaps => "distcpMaxMaps",
            PolicyProperty::MapBandwidthMb => "distcpMapBandwidth",
            PolicyProperty::SourceRetentionAgeLimit => "sourceSnapshotRetentionAgeLimit",
            PolicyProperty::SourceRetentionNumber => "sourceSnapshotRetentionNumber",
            PolicyProperty::TargetRetentionAgeLimit => "targetSnapshotRetentionAgeLimit",
            PolicyProperty::TargetRetentionNumber => "targetSnapshotRetentionNumber",
            PolicyProperty::TdeEncryptionEnabled => "tdeEncryptionEnabled",
            PolicyProperty::TdeSameKey => "tde.sameKey",
            PolicyProperty::QueueName => "queueName",
            PolicyProperty::Overwrite => "distcp.options.overwrite",
            PolicyProperty::SkipChecksum => "distcp.options.skipChecksum",
            PolicyProperty::RemoveDeletedFiles => "distcp.options.removeDeletedFiles",
            PolicyProperty::IgnoreErrors => "distcp.options.ignoreErrors",
            PolicyProperty::PreserveBlockSize => "distcp.options.preserveBlockSize",
            PolicyProperty::PreserveReplicationNumber => "distcp.options.preserveReplicationNumber",
            PolicyProperty::PreservePermission => "distcp.options.preservePermission",
            PolicyProperty::PreserveUser => "distcp.options.preserveUser",
            PolicyProperty::PreserveGroup => "distcp.options.preserveGroup",
            PolicyProperty::PreserveChecksumType => "distcp.options.preserveChecksumType",
            PolicyProperty::PreserveAcl => "distcp.options.preserveAcl",
            PolicyProperty::PreserveXattr => "distcp.options.preserveXattr",
            PolicyProperty::PreserveTimes => "distcp.options.preserveTimes",
        }
    }
}

/// A replication policy: what replicates from where to where.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    /// Unique policy name.
    pub name: String,
    /// Replication type.
    #[serde(rename = "type")]
    pub policy_type: PolicyType,
    /// Name of the source cluster.
    pub source_cluster: String,
    /// Name of the target cluster.
    pub target_cluster: String,
    /// Source dataset path or cloud URI.
    pub source_dataset: String,
    /// Target dataset path or cloud URI.
    pub target_dataset: String,
    /// Scheduling frequency in seconds.
    #[serde(default)]
    pub frequency_secs: u64,
    /// Retry configuration.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Free-form tuning properties.
    #[serde(default)]
    pub custom_properties: BTreeMap<String, String>,
}

impl Policy {
    /// Raw value of a policy property.
    pub fn property(&self, prop: PolicyProperty) -> Option<&str> {
        self.custom_properties.get(prop.key()).map(String::as_str)
    }

    /// Value of a policy property, trimmed and ignoring blanks.
    pub fn non_blank(&self, prop: PolicyProperty) -> Option<&str> {
        self.property(prop).map(str::trim).filter(|v| !v.is_empty())
    }

    /// Boolean property: only a case-insensitive `true` is true; unset yields `default`.
    pub fn flag(&self, prop: PolicyProperty, default: bool) -> bool {
        match self.non_blank(prop) {
            Some(v) => v.eq_ignore_ascii_case("true"),
            None => default,
        }
    }

    /// Whether a boolean property was set at all.
    pub fn is_set(&self, prop: PolicyProperty) -> bool {
        self.non_blank(prop).is_some()
    }

    /// Numeric property; unparsable values are configuration errors.
    pub fn numeric<T>(&self, prop: PolicyProperty) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.non_blank(prop) {
            None => Ok(None),
            Some(v) => v.parse::<T>().map(Some).map_err(|e| {
                ReplError::config(format!("{}: invalid value '{}': {}", prop.key(), v, e))
            }),
        }
    }

    /// TDE is enabled on the dataset.
    pub fn tde_enabled(&self) -> bool {
        self.flag(PolicyProperty::TdeEncryptionEnabled, false)
    }

    /// TDE with the same key on both ends; bytes are copied raw.
    pub fn tde_same_key(&self) -> bool {
        self.flag(PolicyProperty::TdeSameKey, false)
    }

    /// All four retention properties are present.
    pub fn has_retention(&self) -> bool {
        [
            PolicyProperty::SourceRetentionAgeLimit,
            PolicyProperty::SourceRetentionNumber,
            PolicyProperty::TargetRetentionAgeLimit,
            PolicyProperty::TargetRetentionNumber,
        ]
        .iter()
        .all(|p| self.property(*p).is_some())
    }
}

/// A paired cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    /// Logical cluster name.
    pub name: String,
    /// Filesystem endpoint, e.g. `hdfs://nn1:8020`.
    pub fs_endpoint: String,
    /// Whether this cluster is the one the engine runs on.
    #[serde(default)]
    pub local: bool,
    /// Custom properties, including HA keys.
    #[serde(default)]
    pub custom_properties: BTreeMap<String, String>,
}

impl Cluster {
    /// Create a cluster without custom properties.
    pub fn new(name: &str, fs_endpoint: &str, local: bool) -> Self {
        Self {
            name: name.to_string(),
            fs_endpoint: fs_endpoint.to_string(),
            local,
            custom_properties: BTreeMap::new(),
        }
    }

    /// The cluster runs HA namenodes.
    pub fn is_highly_available(&self) -> bool {
        self.custom_properties
            .get(DFS_NAMESERVICES)
            .map(|v| !v.trim().is_empty())
            .unwrap_or(false)
    }
}

/// Merge the HA client configuration of both clusters so one engine job can address both.
///
/// The result also carries [`HA_CONFIG_KEYS`], a comma-separated list of every key set.
pub fn ha_configs(source: &Cluster, target: &Cluster) -> BTreeMap<String, String> {
    let mut configs = BTreeMap::new();
    let mut keys: Vec<String> = Vec::new();

    for props in [&source.custom_properties, &target.custom_properties] {
        for (k, v) in props.iter().filter(|(k, _)| k.starts_with("dfs.")) {
            configs.insert(k.clone(), v.clone());
            keys.push(k.clone());
        }
    }

    let source_ns = source
        .custom_properties
        .get(DFS_NAMESERVICES)
        .cloned()
        .unwrap_or_default();
    let target_ns = target
        .custom_properties
        .get(DFS_NAMESERVICES)
        .cloned()
        .unwrap_or_default();

    configs.insert(
        DFS_NAMESERVICES.to_string(),
        format!("{},{}", source_ns, target_ns),
    );
    keys.push(DFS_NAMESERVICES.to_string());
    configs.insert(DFS_INTERNAL_NAMESERVICES.to_string(), target_ns);
    keys.push(DFS_INTERNAL_NAMESERVICES.to_string());

    let failover_key = format!("{}.{}", DFS_CLIENT_FAILOVER_PROXY_PROVIDER, source_ns);
    if let Some(v) = source.custom_properties.get(&failover_key) {
        configs.insert(failover_key.clone(), v.clone());
    }
    keys.push(failover_key);

    keys.sort();
    keys.dedup();
    configs.insert(HA_CONFIG_KEYS.to_string(), keys.join(","));
    configs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy_with(props: &[(&str, &str)]) -> Policy {
        Policy {
            name: "daily".to_string(),
            policy_type: PolicyType::Fs,
            source_cluster: "src".to_string(),
            target_cluster: "tgt".to_string(),
            source_dataset: "/data/a".to_string(),
            target_dataset: "/data/a".to_string(),
            frequency_secs: 3600,
            retry: RetryPolicy::default(),
            custom_properties: props
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    mod properties {
        use super::*;

        #[test]
        fn test_flag_case_insensitive() {
            let p = policy_with(&[("distcp.options.overwrite", "TRUE")]);
            assert!(p.flag(PolicyProperty::Overwrite, false));
        }

        #[test]
        fn test_flag_non_true_is_false() {
            let p = policy_with(&[("distcp.options.overwrite", "yes")]);
            assert!(!p.flag(PolicyProperty::Overwrite, true));
        }

        #[test]
        fn test_flag_default_when_unset_or_blank() {
            let p = policy_with(&[("distcp.options.preserveUser", "  ")]);
            assert!(p.flag(PolicyProperty::PreserveUser, true));
            assert!(!p.flag(PolicyProperty::PreserveAcl, false));
            assert!(!p.is_set(PolicyProperty::PreserveUser));
        }

        #[test]
        fn test_numeric_parse() {
            let p = policy_with(&[("distcpMaxMaps", " 20 ")]);
            assert_eq!(p.numeric::<u32>(PolicyProperty::MaxMaps).unwrap(), Some(20));
            assert_eq!(p.numeric::<u32>(PolicyProperty::MapBandwidthMb).unwrap(), None);
        }

        #[test]
        fn test_numeric_parse_failure_is_config_error() {
            let p = policy_with(&[("distcpMapBandwidth", "fast")]);
            let err = p.numeric::<u32>(PolicyProperty::MapBandwidthMb).unwrap_err();
            assert!(matches!(err, ReplError::Config { .. }));
            assert!(err.to_string().contains("distcpMapBandwidth"));
        }

        #[test]
        fn test_has_retention_requires_all_four() {
            let mut props = vec![
                ("sourceSnapshotRetentionAgeLimit", "days(3)"),
                ("sourceSnapshotRetentionNumber", "5"),
                ("targetSnapshotRetentionAgeLimit", "days(3)"),
            ];
            assert!(!policy_with(&props).has_retention());
            props.push(("targetSnapshotRetentionNumber", "5"));
            assert!(policy_with(&props).has_retention());
        }

        #[test]
        fn test_policy_json_shape() {
            let json = r#"{
                "name": "p1", "type": "FS",
                "sourceCluster": "a", "targetCluster": "b",
                "sourceDataset": "/x", "targetDataset": "/y",
                "customProperties": {"queueName": "dr"}
            }"#;
            let p: Policy = serde_json::from_str(json).unwrap();
            assert_eq!(p.policy_type, PolicyType::Fs);
            assert_eq!(p.non_blank(PolicyProperty::QueueName), Some("dr"));
            assert_eq!(p.retry, RetryPolicy::default());
        }
    }

    mod ha {
        use super::*;

        fn ha_cluster(name: &str, ns: &str) -> Cluster {
            let mut c = Cluster::new(name, &format!("hdfs://{}", ns), false);
            c.custom_properties
                .insert(DFS_NAMESERVICES.to_string(), ns.to_string());
            c.custom_properties.insert(
                format!("dfs.ha.namenodes.{}", ns),
                "nn1,nn2".to_string(),
            );
            c.custom_properties.insert(
                format!("{}.{}", DFS_CLIENT_FAILOVER_PROXY_PROVIDER, ns),
                "ConfiguredFailoverProxyProvider".to_string(),
            );
            c.custom_properties
                .insert("hive.metastore.uris".to_string(), "thrift://x".to_string());
            c
        }

        #[test]
        fn test_is_highly_available() {
            assert!(ha_cluster("a", "nsA").is_highly_available());
            assert!(!Cluster::new("b", "hdfs://b:8020", true).is_highly_available());
        }

        #[test]
        fn test_ha_configs_merge() {
            let src = ha_cluster("a", "nsA");
            let tgt = ha_cluster("b", "nsB");
            let conf = ha_configs(&src, &tgt);

            assert_eq!(conf.get(DFS_NAMESERVICES).unwrap(), "nsA,nsB");
            assert_eq!(conf.get(DFS_INTERNAL_NAMESERVICES).unwrap(), "nsB");
            assert_eq!(conf.get("dfs.ha.namenodes.nsA").unwrap(), "nn1,nn2");
            assert_eq!(conf.get("dfs.ha.namenodes.nsB").unwrap(), "nn1,nn2");
            assert!(!conf.contains_key("hive.metastore.uris"));

            let keys: Vec<&str> = conf.get(HA_CONFIG_KEYS).unwrap().split(',').collect();
            assert!(keys.contains(&"dfs.ha.namenodes.nsA"));
            assert!(keys.contains(&DFS_INTERNAL_NAMESERVICES));
            for k in keys {
                assert!(conf.contains_key(k), "missing key {}", k);
            }
        }
    }
}
