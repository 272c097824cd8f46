//! Translation of a policy into copy-engine options.
//!
//! The builder is pure: it never touches a filesystem. When the options require the
//! target directory to exist before submission, [`CopyOptions::create_target_first`]
//! says so and the caller creates it.

use crate::config::EngineConfig;
use crate::error::{ReplError, Result};
use crate::model::{Policy, PolicyProperty};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Engine property naming the scheduler queue.
pub const QUEUE_NAME_KEY: &str = "mapreduce.job.queuename";
/// Engine property carrying the credential provider path for cloud stores.
pub const CREDENTIAL_PROVIDER_KEY: &str = "hadoop.security.credential.provider.path";
/// Engine property for the number of listing threads.
pub const LIST_STATUS_THREADS_KEY: &str = "copy.listing.threads";
/// Engine property holding the exclusion regex.
pub const EXCLUDE_FILE_REGEX_KEY: &str = "copy.exclude.regex";

/// File attributes the engine can carry to the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileAttribute {
    /// Block size.
    BlockSize,
    /// Replication factor.
    Replication,
    /// Permission bits.
    Permission,
    /// Owner.
    User,
    /// Group.
    Group,
    /// Checksum type.
    ChecksumType,
    /// Access control lists.
    Acl,
    /// Extended attributes.
    Xattr,
    /// Access and modification times.
    Times,
}

impl FileAttribute {
    /// Policy flag controlling this attribute and its default.
    fn policy_flag(self) -> (PolicyProperty, bool) {
        match self {
            FileAttribute::BlockSize => (PolicyProperty::PreserveBlockSize, false),
            FileAttribute::Replication => (PolicyProperty::PreserveReplicationNumber, false),
            FileAttribute::Permission => (PolicyProperty::PreservePermission, true),
            FileAttribute::User => (PolicyProperty::PreserveUser, true),
            FileAttribute::Group => (PolicyProperty::PreserveGroup, true),
            FileAttribute::ChecksumType => (PolicyProperty::PreserveChecksumType, false),
            FileAttribute::Acl => (PolicyProperty::PreserveAcl, false),
            FileAttribute::Xattr => (PolicyProperty::PreserveXattr, true),
            FileAttribute::Times => (PolicyProperty::PreserveTimes, false),
        }
    }

    const ALL: [FileAttribute; 9] = [
        FileAttribute::BlockSize,
        FileAttribute::Replication,
        FileAttribute::Permission,
        FileAttribute::User,
        FileAttribute::Group,
        FileAttribute::ChecksumType,
        FileAttribute::Acl,
        FileAttribute::Xattr,
        FileAttribute::Times,
    ];
}

/// Snapshot pair restricting the copy to what changed between them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotDiff {
    /// Earlier snapshot.
    pub from: String,
    /// Later snapshot.
    pub to: String,
    /// Apply the diff in reverse, restoring the target to `to`.
    pub reverse: bool,
}

/// How a copy relates to existing snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyMode {
    /// Plain copy of the whole dataset.
    Full,
    /// Snapshot-based copy. With `from`, only changes since `from` up to `to` are copied.
    Incremental {
        /// Last snapshot both ends agree on.
        from: Option<String>,
        /// Source snapshot the copy reads.
        to: String,
    },
    /// Roll the target back from its current state `from` to snapshot `to`.
    Recovery {
        /// Snapshot of the target's current state.
        from: String,
        /// Snapshot the target is restored to.
        to: String,
    },
}

impl CopyMode {
    fn is_snapshot_based(&self) -> bool {
        !matches!(self, CopyMode::Full)
    }
}

/// Options for one copy-engine job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyOptions {
    /// Source paths.
    pub source_paths: Vec<String>,
    /// Target path.
    pub target_path: String,
    /// Make the target mirror the source folder.
    pub sync_folder: bool,
    /// Overwrite target files unconditionally.
    pub overwrite: bool,
    /// Delete target entries absent on the source.
    pub delete_missing: bool,
    /// Skip checksum comparison.
    pub skip_checksum: bool,
    /// Keep going when individual files fail.
    pub ignore_failures: bool,
    /// Attributes carried to the target.
    pub preserve: BTreeSet<FileAttribute>,
    /// Maximum concurrent workers.
    pub max_maps: Option<u32>,
    /// Bandwidth per worker in MB/s.
    pub map_bandwidth_mb: Option<u32>,
    /// Restrict the copy to a snapshot diff.
    pub snapshot_diff: Option<SnapshotDiff>,
    /// Scheduler queue.
    pub queue_name: Option<String>,
    /// Target directory must exist before submission.
    pub create_target_first: bool,
    /// Properties handed to the engine verbatim.
    pub engine_conf: BTreeMap<String, String>,
}

/// Builds [`CopyOptions`] from a policy.
pub struct CopyOptionsBuilder<'a> {
    policy: &'a Policy,
    sources: Vec<String>,
    target: String,
    mode: CopyMode,
    engine_conf: BTreeMap<String, String>,
    config: Option<&'a EngineConfig>,
}

impl<'a> CopyOptionsBuilder<'a> {
    /// Start building options for `policy` with a full copy.
    pub fn new(policy: &'a Policy) -> Self {
        Self {
            policy,
            sources: Vec::new(),
            target: String::new(),
            mode: CopyMode::Full,
            engine_conf: BTreeMap::new(),
            config: None,
        }
    }

    /// Source paths.
    pub fn sources<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sources = sources.into_iter().map(Into::into).collect();
        self
    }

    /// Target path.
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    /// Snapshot mode.
    pub fn mode(mut self, mode: CopyMode) -> Self {
        self.mode = mode;
        self
    }

    /// Extra engine properties, such as merged HA settings.
    pub fn engine_conf(mut self, conf: BTreeMap<String, String>) -> Self {
        self.engine_conf.extend(conf);
        self
    }

    /// Engine-wide settings that feed listing threads and exclusions.
    pub fn engine_config(mut self, config: &'a EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Produce the options; malformed numeric properties are configuration errors.
    pub fn build(self) -> Result<CopyOptions> {
        if self.sources.is_empty() {
            return Err(ReplError::config("copy requires at least one source path"));
        }
        if self.target.trim().is_empty() {
            return Err(ReplError::config("copy requires a target path"));
        }
        let policy = self.policy;

        let max_maps = positive(policy, PolicyProperty::MaxMaps)?;
        let map_bandwidth_mb = positive(policy, PolicyProperty::MapBandwidthMb)?;

        let mut sync_folder = false;
        let mut overwrite = false;
        let mut skip_checksum = false;
        if policy.tde_enabled() || policy.tde_same_key() {
            // encrypted bytes differ per zone, checksums never match
            sync_folder = true;
            skip_checksum = true;
        } else {
            if !self.mode.is_snapshot_based() {
                if policy.flag(PolicyProperty::Overwrite, false) {
                    overwrite = true;
                } else {
                    sync_folder = true;
                }
            }
            skip_checksum = policy.flag(PolicyProperty::SkipChecksum, false);
        }

        let mut delete_missing = false;
        let mut create_target_first = false;
        let snapshot_diff = match &self.mode {
            CopyMode::Full => {
                delete_missing = policy.flag(PolicyProperty::RemoveDeletedFiles, true);
                create_target_first = delete_missing;
                None
            }
            CopyMode::Incremental { from, to } => {
                sync_folder = true;
                delete_missing = true;
                from.as_ref().map(|from| SnapshotDiff {
                    from: from.clone(),
                    to: to.clone(),
                    reverse: false,
                })
            }
            CopyMode::Recovery { from, to } => {
                sync_folder = true;
                delete_missing = true;
                Some(SnapshotDiff {
                    from: from.clone(),
                    to: to.clone(),
                    reverse: true,
                })
            }
        };
        if sync_folder {
            overwrite = false;
        }

        let preserve = FileAttribute::ALL
            .iter()
            .copied()
            .filter(|attr| {
                let (prop, default) = attr.policy_flag();
                policy.flag(prop, default)
            })
            .collect();

        let mut engine_conf = self.engine_conf;
        let queue_name = policy
            .non_blank(PolicyProperty::QueueName)
            .map(str::to_string);
        if let Some(queue) = &queue_name {
            engine_conf.insert(QUEUE_NAME_KEY.to_string(), queue.clone());
        }
        if let Some(config) = self.config {
            engine_conf.insert(
                LIST_STATUS_THREADS_KEY.to_string(),
                config.list_status_threads.to_string(),
            );
            if let Some(re) = &config.exclude_file_regex {
                engine_conf.insert(EXCLUDE_FILE_REGEX_KEY.to_string(), re.clone());
            }
        }

        Ok(CopyOptions {
            source_paths: self.sources,
            target_path: self.target,
            sync_folder,
            overwrite,
            delete_missing,
            skip_checksum,
            ignore_failures: policy.flag(PolicyProperty::IgnoreErrors, false),
            preserve,
            max_maps,
            map_bandwidth_mb,
            snapshot_diff,
            queue_name,
            create_target_first,
            engine_conf,
        })
    }
}

fn positive(policy: &Policy, prop: PolicyProperty) -> Result<Option<u32>> {
    match policy.numeric::<u32>(prop)? {
        Some(0) => Err(ReplError::config(format!("{} must be positive", prop.key()))),
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PolicyType, RetryPolicy};

    fn policy(props: &[(&str, &str)]) -> Policy {
        Policy {
            name: "p1".to_string(),
            policy_type: PolicyType::Fs,
            source_cluster: "a".to_string(),
            target_cluster: "b".to_string(),
            source_dataset: "/data".to_string(),
            target_dataset: "/data".to_string(),
            frequency_secs: 60,
            retry: RetryPolicy::default(),
            custom_properties: props
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn build(p: &Policy, mode: CopyMode) -> Result<CopyOptions> {
        CopyOptionsBuilder::new(p)
            .sources(["hdfs://a:8020/data"])
            .target("hdfs://b:8020/data")
            .mode(mode)
            .build()
    }

    mod decision_table {
        use super::*;

        #[test]
        fn test_first_full_copy_defaults() {
            let p = policy(&[]);
            let opts = build(&p, CopyMode::Full).unwrap();
            assert!(opts.sync_folder);
            assert!(!opts.overwrite);
            assert!(opts.delete_missing);
            assert!(opts.create_target_first);
            assert!(!opts.skip_checksum);
            assert!(opts.snapshot_diff.is_none());
        }

        #[test]
        fn test_overwrite_without_snapshots() {
            let p = policy(&[("distcp.options.overwrite", "true")]);
            let opts = build(&p, CopyMode::Full).unwrap();
            assert!(opts.overwrite);
            assert!(!opts.sync_folder);
        }

        #[test]
        fn test_tde_same_key_overrides_overwrite() {
            let p = policy(&[("tde.sameKey", "true"), ("distcp.options.overwrite", "true")]);
            let opts = build(&p, CopyMode::Full).unwrap();
            assert!(opts.sync_folder);
            assert!(opts.skip_checksum);
            assert!(!opts.overwrite);
        }

        #[test]
        fn test_tde_ignores_explicit_checksum_setting() {
            let p = policy(&[
                ("tdeEncryptionEnabled", "true"),
                ("distcp.options.skipChecksum", "false"),
            ]);
            let opts = build(&p, CopyMode::Full).unwrap();
            assert!(opts.skip_checksum);
        }

        #[test]
        fn test_explicit_skip_checksum() {
            let p = policy(&[("distcp.options.skipChecksum", "true")]);
            assert!(build(&p, CopyMode::Full).unwrap().skip_checksum);
        }

        #[test]
        fn test_remove_deleted_files_false() {
            let p = policy(&[("distcp.options.removeDeletedFiles", "false")]);
            let opts = build(&p, CopyMode::Full).unwrap();
            assert!(!opts.delete_missing);
            assert!(!opts.create_target_first);
        }

        #[test]
        fn test_incremental_with_common_snapshot() {
            let p = policy(&[("distcp.options.overwrite", "true")]);
            let opts = build(
                &p,
                CopyMode::Incremental {
                    from: Some("s1".to_string()),
                    to: "s2.inflight".to_string(),
                },
            )
            .unwrap();
            assert!(opts.sync_folder);
            assert!(opts.delete_missing);
            assert!(!opts.overwrite);
            assert!(!opts.create_target_first);
            assert_eq!(
                opts.snapshot_diff,
                Some(SnapshotDiff {
                    from: "s1".to_string(),
                    to: "s2.inflight".to_string(),
                    reverse: false,
                })
            );
        }

        #[test]
        fn test_incremental_first_run_has_no_diff() {
            let p = policy(&[]);
            let opts = build(
                &p,
                CopyMode::Incremental {
                    from: None,
                    to: "s1.inflight".to_string(),
                },
            )
            .unwrap();
            assert!(opts.snapshot_diff.is_none());
            assert!(opts.delete_missing);
        }

        #[test]
        fn test_recovery_uses_reverse_diff() {
            let p = policy(&[]);
            let opts = build(
                &p,
                CopyMode::Recovery {
                    from: "tempRecoverySnapshot".to_string(),
                    to: "s1".to_string(),
                },
            )
            .unwrap();
            let diff = opts.snapshot_diff.unwrap();
            assert!(diff.reverse);
            assert_eq!(diff.from, "tempRecoverySnapshot");
            assert_eq!(diff.to, "s1");
        }
    }

    mod tuning {
        use super::*;

        #[test]
        fn test_preserve_defaults() {
            let opts = build(&policy(&[]), CopyMode::Full).unwrap();
            let expected: BTreeSet<FileAttribute> = [
                FileAttribute::Permission,
                FileAttribute::User,
                FileAttribute::Group,
                FileAttribute::Xattr,
            ]
            .into_iter()
            .collect();
            assert_eq!(opts.preserve, expected);
        }

        #[test]
        fn test_preserve_overrides() {
            let p = policy(&[
                ("distcp.options.preserveTimes", "true"),
                ("distcp.options.preserveUser", "false"),
            ]);
            let opts = build(&p, CopyMode::Full).unwrap();
            assert!(opts.preserve.contains(&FileAttribute::Times));
            assert!(!opts.preserve.contains(&FileAttribute::User));
        }

        #[test]
        fn test_numeric_properties() {
            let p = policy(&[("distcpMaxMaps", "20"), ("distcpMapBandwidth", "100")]);
            let opts = build(&p, CopyMode::Full).unwrap();
            assert_eq!(opts.max_maps, Some(20));
            assert_eq!(opts.map_bandwidth_mb, Some(100));
        }

        #[test]
        fn test_malformed_bandwidth_is_config_error() {
            let p = policy(&[("distcpMapBandwidth", "lots")]);
            let err = build(&p, CopyMode::Full).unwrap_err();
            assert!(matches!(err, ReplError::Config { .. }));
        }

        #[test]
        fn test_zero_max_maps_rejected() {
            let p = policy(&[("distcpMaxMaps", "0")]);
            assert!(build(&p, CopyMode::Full).is_err());
        }

        #[test]
        fn test_queue_and_engine_settings() {
            let p = policy(&[("queueName", "dr")]);
            let config = EngineConfig {
                exclude_file_regex: Some("\\.tmp$".to_string()),
                ..Default::default()
            };
            let mut ha = BTreeMap::new();
            ha.insert("dfs.nameservices".to_string(), "nsA,nsB".to_string());
            let opts = CopyOptionsBuilder::new(&p)
                .sources(["/a"])
                .target("/b")
                .engine_conf(ha)
                .engine_config(&config)
                .build()
                .unwrap();
            assert_eq!(opts.queue_name.as_deref(), Some("dr"));
            assert_eq!(opts.engine_conf.get(QUEUE_NAME_KEY).unwrap(), "dr");
            assert_eq!(opts.engine_conf.get("dfs.nameservices").unwrap(), "nsA,nsB");
            assert_eq!(opts.engine_conf.get(LIST_STATUS_THREADS_KEY).unwrap(), "20");
            assert_eq!(opts.engine_conf.get(EXCLUDE_FILE_REGEX_KEY).unwrap(), "\\.tmp$");
        }

        #[test]
        fn test_missing_paths_rejected() {
            let p = policy(&[]);
            assert!(CopyOptionsBuilder::new(&p).target("/b").build().is_err());
            assert!(CopyOptionsBuilder::new(&p).sources(["/a"]).build().is_err());
        }
    }
}
