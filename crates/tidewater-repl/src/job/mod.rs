//! Replication jobs: the state machine that owns one policy-instance execution.
//!
//! Every job goes `Created -> Initialized -> Running -> {Succeeded, Failed, Killed}`,
//! or enters `Recovering` instead of `Running` when the orchestrator resumes an
//! instance that may still be executing. `clean_up` is valid from any state.

mod common;
mod hcfs;
mod hdfs;

pub use common::{JobDeps, Topology};
pub use hcfs::HcfsReplication;
pub use hdfs::HdfsReplication;

use crate::context::JobContext;
use crate::error::{ReplError, Result};
use crate::model::{Cluster, Policy, PolicyType};
use crate::uri;
use async_trait::async_trait;
use std::fmt;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    /// Built, nothing resolved.
    Created,
    /// Endpoints resolved and handles open.
    Initialized,
    /// Regular copy in progress.
    Running,
    /// Reconciling a prior attempt.
    Recovering,
    /// Finished successfully.
    Succeeded,
    /// Finished with an error.
    Failed,
    /// Cancelled.
    Killed,
}

impl JobState {
    /// No further transitions except `clean_up`.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::Killed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Created => "CREATED",
            JobState::Initialized => "INITIALIZED",
            JobState::Running => "RUNNING",
            JobState::Recovering => "RECOVERING",
            JobState::Succeeded => "SUCCEEDED",
            JobState::Failed => "FAILED",
            JobState::Killed => "KILLED",
        };
        f.write_str(s)
    }
}

/// Capability contract shared by every job type.
#[async_trait]
pub trait ReplicationJob: Send {
    /// Current lifecycle state.
    fn state(&self) -> JobState;

    /// Resolve endpoints, open filesystem handles and decide on snapshot mode.
    async fn init(&mut self, ctx: &mut JobContext) -> Result<()>;

    /// Run a fresh copy.
    async fn perform(&mut self, ctx: &mut JobContext) -> Result<()>;

    /// Reconcile a prior attempt of the same instance.
    async fn recover(&mut self, ctx: &mut JobContext) -> Result<()>;

    /// Release every filesystem handle. Safe to call more than once.
    async fn clean_up(&mut self, ctx: &mut JobContext) -> Result<()>;
}

/// Which strategy executes a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    /// Both ends on managed filesystems; snapshot diffs possible.
    Hdfs,
    /// One end is a remote object store; plain copies only.
    Hcfs,
}

impl JobKind {
    /// Pick the strategy for `policy`.
    pub fn for_policy(policy: &Policy) -> Result<Self> {
        match policy.policy_type {
            PolicyType::Hive => Err(ReplError::config(format!(
                "policy {} is a HIVE policy and is not replicated by this engine",
                policy.name
            ))),
            PolicyType::Cloud => Ok(JobKind::Hcfs),
            PolicyType::Fs | PolicyType::Snapshot => {
                if uri::is_hcfs(&policy.source_dataset) || uri::is_hcfs(&policy.target_dataset) {
                    Ok(JobKind::Hcfs)
                } else {
                    Ok(JobKind::Hdfs)
                }
            }
        }
    }
}

/// Build the job executing `policy` between `source` and `target`.
pub fn build_job(
    policy: Policy,
    source: Cluster,
    target: Cluster,
    deps: JobDeps,
) -> Result<Box<dyn ReplicationJob>> {
    Ok(match JobKind::for_policy(&policy)? {
        JobKind::Hdfs => Box::new(HdfsReplication::new(policy, source, target, deps)),
        JobKind::Hcfs => Box::new(HcfsReplication::new(policy, source, target, deps)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RetryPolicy;
    use std::collections::BTreeMap;

    fn policy(policy_type: PolicyType, source: &str, target: &str) -> Policy {
        Policy {
            name: "p1".to_string(),
            policy_type,
            source_cluster: "a".to_string(),
            target_cluster: "b".to_string(),
            source_dataset: source.to_string(),
            target_dataset: target.to_string(),
            frequency_secs: 60,
            retry: RetryPolicy::default(),
            custom_properties: BTreeMap::new(),
        }
    }

    #[test]
    fn test_kind_for_local_pair() {
        let p = policy(PolicyType::Fs, "/data", "/data");
        assert_eq!(JobKind::for_policy(&p).unwrap(), JobKind::Hdfs);
    }

    #[test]
    fn test_kind_for_cloud_dataset() {
        let p = policy(PolicyType::Fs, "/data", "s3a://bucket/data");
        assert_eq!(JobKind::for_policy(&p).unwrap(), JobKind::Hcfs);
        let p = policy(PolicyType::Cloud, "/data", "/data");
        assert_eq!(JobKind::for_policy(&p).unwrap(), JobKind::Hcfs);
    }

    #[test]
    fn test_hive_rejected() {
        let p = policy(PolicyType::Hive, "db", "db");
        let err = JobKind::for_policy(&p).unwrap_err();
        assert!(matches!(err, ReplError::Config { .. }));
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobState::Succeeded.is_terminal());
        assert!(JobState::Killed.is_terminal());
        assert!(!JobState::Recovering.is_terminal());
        assert_eq!(JobState::Initialized.to_string(), "INITIALIZED");
    }
}
