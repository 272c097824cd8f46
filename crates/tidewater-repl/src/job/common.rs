//! State and helpers shared by every job strategy.

use super::JobState;
use crate::catalog::SnapshotCatalog;
use crate::config::EngineConfig;
use crate::context::{InstanceOutcome, JobContext};
use crate::engine::{CopyEngine, EngineJobState, EngineJobStatus};
use crate::error::{ReplError, Result};
use crate::fs::{FileSystem, FileSystemProvider, FsHandles};
use crate::metrics::{JobType, ReplicationMetrics};
use crate::model::{ha_configs, Cluster, Policy};
use crate::options::CopyOptions;
use crate::progress::{capture_metrics, ProgressPoller};
use crate::uri::{self, StagingPair};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Engine property recording which cluster drives the copy.
pub const TOPOLOGY_KEY: &str = "tidewater.replication.topology";

/// Collaborators a job needs; shared across jobs.
#[derive(Clone)]
pub struct JobDeps {
    /// Engine-wide settings.
    pub config: Arc<EngineConfig>,
    /// Bulk copy engine.
    pub engine: Arc<dyn CopyEngine>,
    /// Opens filesystem handles.
    pub filesystems: Arc<dyn FileSystemProvider>,
    /// Snapshottable-directory cache.
    pub catalog: Arc<SnapshotCatalog>,
}

/// Which end of the pair the engine runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topology {
    /// The engine runs on the source cluster and pushes to the target.
    Push,
    /// The engine runs on the target cluster and pulls from the source.
    Pull,
}

impl Topology {
    /// Push when the source is the local cluster, otherwise pull.
    pub fn of(source: &Cluster) -> Self {
        if source.local {
            Topology::Push
        } else {
            Topology::Pull
        }
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topology::Push => f.write_str("push"),
            Topology::Pull => f.write_str("pull"),
        }
    }
}

/// A finished (or killed) engine job.
#[derive(Debug, Clone)]
pub(crate) struct CopyRun {
    pub job_id: String,
    pub status: EngineJobStatus,
    pub metrics: Option<ReplicationMetrics>,
}

impl CopyRun {
    pub fn succeeded(&self) -> bool {
        self.status.state == EngineJobState::Succeeded
    }

    /// Engine failure as an error carrying the job id.
    pub fn failure(&self) -> ReplError {
        ReplError::Engine {
            job_id: Some(self.job_id.clone()),
            msg: self
                .status
                .message
                .clone()
                .unwrap_or_else(|| format!("engine job ended in state {}", self.status.state)),
        }
    }

    pub fn outcome(&self, outcome: InstanceOutcome) -> InstanceOutcome {
        outcome.with_job(Some(self.job_id.clone()), self.metrics.clone())
    }
}

/// What the engine knows about a job recorded by an earlier attempt.
#[derive(Debug, Clone)]
pub(crate) enum PriorJob {
    Found(EngineJobStatus),
    Missing,
    Unreachable(String),
}

/// Policy, clusters, handles and lifecycle state of one job.
pub(crate) struct JobCore {
    pub policy: Policy,
    pub source: Cluster,
    pub target: Cluster,
    pub deps: JobDeps,
    pub state: JobState,
    pub topology: Topology,
    pub staging: Option<StagingPair>,
    handles: Option<FsHandles>,
}

impl JobCore {
    pub fn new(policy: Policy, source: Cluster, target: Cluster, deps: JobDeps) -> Self {
        let topology = Topology::of(&source);
        Self {
            policy,
            source,
            target,
            deps,
            state: JobState::Created,
            topology,
            staging: None,
            handles: None,
        }
    }

    pub fn transition(&mut self, to: JobState) {
        debug!(policy = %self.policy.name, from = %self.state, to = %to, "Job state change");
        self.state = to;
    }

    pub fn expect_state(&self, expected: JobState, op: &str) -> Result<()> {
        if self.state != expected {
            return Err(ReplError::config(format!(
                "{} called in state {}, expected {}",
                op, self.state, expected
            )));
        }
        Ok(())
    }

    /// Staging URIs; remote datasets keep their own location instead of the cluster endpoint.
    pub fn resolve_staging(&self, raw_namespace: bool) -> Result<StagingPair> {
        let endpoint = |cluster: &Cluster, dataset: &str| {
            if uri::is_hcfs(dataset) {
                dataset.to_string()
            } else {
                cluster.fs_endpoint.clone()
            }
        };
        StagingPair::resolve(
            &endpoint(&self.source, &self.policy.source_dataset),
            &self.policy.source_dataset,
            &endpoint(&self.target, &self.policy.target_dataset),
            &self.policy.target_dataset,
            raw_namespace,
        )
    }

    /// Open handles for the requested ends; already-open handles stay owned by the job.
    pub async fn open_handles(&mut self, pair: &StagingPair, source: bool, target: bool) -> Result<()> {
        let provider = Arc::clone(&self.deps.filesystems);
        self.handles = Some(FsHandles {
            source: None,
            target: None,
        });
        if source {
            let conf = self.client_conf(&self.source);
            let fs = provider.open(&filesystem_uri(&pair.source, &self.source), &conf).await?;
            if let Some(h) = self.handles.as_mut() {
                h.source = Some(fs);
            }
        }
        if target {
            let conf = self.client_conf(&self.target);
            let fs = provider.open(&filesystem_uri(&pair.target, &self.target), &conf).await?;
            if let Some(h) = self.handles.as_mut() {
                h.target = Some(fs);
            }
        }
        Ok(())
    }

    pub fn source_fs(&self) -> Result<Arc<dyn FileSystem>> {
        self.handles
            .as_ref()
            .and_then(|h| h.source.clone())
            .ok_or_else(|| ReplError::fs(&self.source.fs_endpoint, "no open source handle"))
    }

    pub fn target_fs(&self) -> Result<Arc<dyn FileSystem>> {
        self.handles
            .as_ref()
            .and_then(|h| h.target.clone())
            .ok_or_else(|| ReplError::fs(&self.target.fs_endpoint, "no open target handle"))
    }

    pub fn target_handle(&self) -> Option<Arc<dyn FileSystem>> {
        self.handles.as_ref().and_then(|h| h.target.clone())
    }

    pub fn staging(&self) -> Result<&StagingPair> {
        self.staging
            .as_ref()
            .ok_or_else(|| ReplError::config("job has not been initialized"))
    }

    pub async fn close_handles(&mut self) -> Result<()> {
        match self.handles.take() {
            Some(handles) => handles.close().await,
            None => Ok(()),
        }
    }

    fn client_conf(&self, cluster: &Cluster) -> BTreeMap<String, String> {
        cluster.custom_properties.clone()
    }

    /// Engine properties common to every copy of this job.
    pub fn engine_conf(&self) -> BTreeMap<String, String> {
        let mut conf = BTreeMap::new();
        if self.source.is_highly_available() {
            conf.extend(ha_configs(&self.source, &self.target));
        }
        conf.insert(TOPOLOGY_KEY.to_string(), self.topology.to_string());
        conf
    }

    /// Submit `options`, record the job id, then wait for it.
    pub async fn run_copy(
        &self,
        ctx: &mut JobContext,
        options: &CopyOptions,
        job_type: JobType,
        snapshot: Option<String>,
    ) -> Result<CopyRun> {
        let job_id = self.deps.engine.submit(options).await?;
        info!(job_id = %job_id, job_type = %job_type, source = ?options.source_paths, target = %options.target_path, "Submitted copy");
        ctx.recorder()
            .record(ReplicationMetrics::new(&job_id, job_type, snapshot.clone()))
            .await?;
        self.await_job(ctx, job_id, job_type, snapshot).await
    }

    /// Poll `job_id` to completion; on cancellation kill it and report KILLED.
    pub async fn await_job(
        &self,
        ctx: &mut JobContext,
        job_id: String,
        job_type: JobType,
        snapshot: Option<String>,
    ) -> Result<CopyRun> {
        let engine = Arc::clone(&self.deps.engine);
        let poller = ProgressPoller::start(
            Arc::clone(&engine),
            ctx.recorder(),
            job_id.clone(),
            job_type,
            snapshot.clone(),
            self.deps.config.metrics_interval(),
        );

        let cancel = ctx.cancellation().clone();
        let waited = tokio::select! {
            _ = cancel.cancelled() => None,
            status = self.wait_for_completion(&job_id) => Some(status),
        };
        poller.stop().await;

        let status = match waited {
            Some(status) => status?,
            None => {
                warn!(job_id = %job_id, "Cancellation requested, killing engine job");
                if let Err(e) = engine.kill(&job_id).await {
                    error!(job_id = %job_id, error = %e, "Failed to kill engine job");
                }
                let metrics = capture_metrics(engine.as_ref(), &ctx.recorder(), &job_id, job_type, snapshot)
                    .await
                    .ok();
                let outcome = InstanceOutcome::killed(format!("engine job {} killed on request", job_id))
                    .with_job(Some(job_id), metrics);
                if let Err(e) = ctx.report(outcome).await {
                    error!(error = %e, "Failed to record KILLED outcome");
                }
                return Err(ReplError::Interrupted {
                    instance_id: ctx.instance_id().to_string(),
                });
            }
        };

        let metrics = match capture_metrics(engine.as_ref(), &ctx.recorder(), &job_id, job_type, snapshot).await {
            Ok(m) => Some(m),
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Failed to capture final metrics");
                None
            }
        };
        info!(job_id = %job_id, state = %status.state, "Engine job finished");
        Ok(CopyRun {
            job_id,
            status,
            metrics,
        })
    }

    async fn wait_for_completion(&self, job_id: &str) -> Result<EngineJobStatus> {
        let interval = self.deps.config.engine_poll_interval();
        loop {
            match self.deps.engine.status(job_id).await? {
                Some(status) if !status.state.is_active() => return Ok(status),
                Some(_) => tokio::time::sleep(interval).await,
                None => {
                    return Err(ReplError::Engine {
                        job_id: Some(job_id.to_string()),
                        msg: "engine no longer knows the job".to_string(),
                    })
                }
            }
        }
    }

    /// Look up a job recorded by an earlier attempt, retrying while it is missing or unreachable.
    pub async fn lookup_job(&self, job_id: &str) -> Result<PriorJob> {
        let attempts = self.deps.config.effective_lookup_retries().max(1);
        let delay = self.deps.config.job_lookup_delay();
        let mut last = PriorJob::Missing;
        for attempt in 1..=attempts {
            match self.deps.engine.status(job_id).await {
                Ok(Some(status)) => return Ok(PriorJob::Found(status)),
                Ok(None) => last = PriorJob::Missing,
                Err(ReplError::EngineUnreachable { msg }) => last = PriorJob::Unreachable(msg),
                Err(e) => return Err(e),
            }
            debug!(job_id, attempt, attempts, "Prior engine job not available yet");
            if attempt < attempts {
                tokio::time::sleep(delay).await;
            }
        }
        Ok(last)
    }

    /// Report FAILED for `err`, keeping the engine job id when one is known.
    pub async fn fail(&mut self, ctx: &mut JobContext, err: &ReplError) {
        let current = match ctx.tracking_info().await {
            Ok(info) => info.current().cloned(),
            Err(e) => {
                warn!(error = %e, "Failed to read tracking info");
                None
            }
        };
        let job_id = err
            .job_id()
            .map(str::to_string)
            .or_else(|| current.as_ref().map(|m| m.job_id.clone()));
        let metrics = current.filter(|m| Some(&m.job_id) == job_id.as_ref());
        error!(policy = %self.policy.name, kind = ?err.kind(), error = %err, "Replication failed");
        if let Err(e) = ctx
            .report(InstanceOutcome::failed(err.to_string()).with_job(job_id, metrics))
            .await
        {
            error!(error = %e, "Failed to record FAILED outcome");
        }
        self.transition(JobState::Failed);
    }

    /// Route an error from `perform`/`recover` to the right terminal state.
    pub async fn settle_error(&mut self, ctx: &mut JobContext, err: &ReplError) {
        match err {
            ReplError::Interrupted { .. } => self.transition(JobState::Killed),
            _ => self.fail(ctx, err).await,
        }
    }
}

/// URI a provider should open for a staging path: its authority, or the cluster endpoint.
fn filesystem_uri(staging: &str, cluster: &Cluster) -> String {
    uri::authority_of(staging).unwrap_or_else(|| cluster.fs_endpoint.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PolicyType, RetryPolicy, DFS_NAMESERVICES};
    use crate::sim::{MemCopyEngine, MemFsProvider};
    use std::time::Duration;

    fn core_for(source_dataset: &str, target_dataset: &str) -> (JobCore, Arc<MemCopyEngine>) {
        let policy = Policy {
            name: "p1".to_string(),
            policy_type: PolicyType::Fs,
            source_cluster: "a".to_string(),
            target_cluster: "b".to_string(),
            source_dataset: source_dataset.to_string(),
            target_dataset: target_dataset.to_string(),
            frequency_secs: 60,
            retry: RetryPolicy::default(),
            custom_properties: BTreeMap::new(),
        };
        let provider = Arc::new(MemFsProvider::new());
        provider.register("hdfs://a:8020");
        provider.register("hdfs://b:8020");
        let engine = Arc::new(MemCopyEngine::with_filesystems(provider.clone()));
        let deps = JobDeps {
            config: Arc::new(EngineConfig {
                job_lookup_retries: 3,
                job_lookup_delay_secs: 1,
                ..Default::default()
            }),
            engine: engine.clone(),
            filesystems: provider,
            catalog: Arc::new(SnapshotCatalog::new(Duration::from_secs(60))),
        };
        let core = JobCore::new(
            policy,
            Cluster::new("a", "hdfs://a:8020", true),
            Cluster::new("b", "hdfs://b:8020", false),
            deps,
        );
        (core, engine)
    }

    #[test]
    fn test_topology_follows_local_flag() {
        assert_eq!(Topology::of(&Cluster::new("a", "hdfs://a", true)), Topology::Push);
        assert_eq!(Topology::of(&Cluster::new("a", "hdfs://a", false)), Topology::Pull);
    }

    #[test]
    fn test_resolve_staging_with_cloud_target() {
        let (core, _) = core_for("/data", "s3a://bucket/data");
        let pair = core.resolve_staging(false).unwrap();
        assert_eq!(pair.source, "hdfs://a:8020/data");
        assert_eq!(pair.target, "s3a://bucket/data");
    }

    #[test]
    fn test_engine_conf_merges_ha_when_source_is_ha() {
        let (mut core, _) = core_for("/data", "/data");
        assert!(!core.engine_conf().contains_key(DFS_NAMESERVICES));
        assert_eq!(core.engine_conf().get(TOPOLOGY_KEY).unwrap(), "push");

        core.source
            .custom_properties
            .insert(DFS_NAMESERVICES.to_string(), "nsA".to_string());
        core.target
            .custom_properties
            .insert(DFS_NAMESERVICES.to_string(), "nsB".to_string());
        assert_eq!(core.engine_conf().get(DFS_NAMESERVICES).unwrap(), "nsA,nsB");
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_job_missing_after_retries() {
        let (core, engine) = core_for("/data", "/data");
        let found = core.lookup_job("job_404").await.unwrap();
        assert!(matches!(found, PriorJob::Missing));
        assert_eq!(engine.status_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_job_unreachable() {
        let (core, engine) = core_for("/data", "/data");
        engine.set_reachable(false);
        let found = core.lookup_job("job_1").await.unwrap();
        assert!(matches!(found, PriorJob::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_close_handles_is_idempotent() {
        let (mut core, _) = core_for("/data", "/data");
        let pair = core.resolve_staging(false).unwrap();
        core.open_handles(&pair, true, true).await.unwrap();
        assert!(core.source_fs().is_ok());
        core.close_handles().await.unwrap();
        core.close_handles().await.unwrap();
        assert!(core.source_fs().is_err());
    }
}
