//! Replication between two managed filesystems, incremental through snapshot diffs
//! whenever both ends allow it.

use super::common::{CopyRun, JobCore, JobDeps, PriorJob};
use super::{JobState, ReplicationJob};
use crate::context::{InstanceOutcome, JobContext};
use crate::engine::EngineJobState;
use crate::error::{ReplError, Result};
use crate::metrics::{JobType, ReplicationMetrics};
use crate::model::{Cluster, Policy, PolicyProperty};
use crate::options::{CopyMode, CopyOptionsBuilder};
use crate::retention::{RetentionEvictor, RetentionRule};
use crate::snapshot::{
    current_time_ms, inflight_name, snapshot_name, Endpoint, SnapshottingProtocol,
    RECOVERY_SNAPSHOT,
};
use async_trait::async_trait;
use tracing::{info, info_span, warn, Instrument};

/// Result of rolling the target back to the last common snapshot.
enum Revert {
    /// No snapshot is shared by both ends.
    NoCommonSnapshot,
    /// The target has not changed since the common snapshot.
    Unchanged,
    /// A recovery copy restored the target.
    Restored(CopyRun),
}

/// Retention rules for the source and target directories.
#[derive(Debug, Clone, Copy)]
struct Retention {
    source: RetentionRule,
    target: RetentionRule,
}

impl Retention {
    fn from_policy(policy: &Policy) -> Result<Option<Self>> {
        if !policy.has_retention() {
            return Ok(None);
        }
        let prop = |p: PolicyProperty| policy.property(p).unwrap_or_default();
        Ok(Some(Self {
            source: RetentionRule::parse(
                prop(PolicyProperty::SourceRetentionAgeLimit),
                prop(PolicyProperty::SourceRetentionNumber),
            )?,
            target: RetentionRule::parse(
                prop(PolicyProperty::TargetRetentionAgeLimit),
                prop(PolicyProperty::TargetRetentionNumber),
            )?,
        }))
    }
}

/// Filesystem-to-filesystem replication job.
pub struct HdfsReplication {
    core: JobCore,
    protocol: SnapshottingProtocol,
    evictor: RetentionEvictor,
    retention: Option<Retention>,
    snapshot_mode: bool,
}

impl HdfsReplication {
    /// Create a job for `policy`.
    pub fn new(policy: Policy, source: Cluster, target: Cluster, deps: JobDeps) -> Self {
        let protocol = SnapshottingProtocol::new(deps.catalog.clone());
        Self {
            core: JobCore::new(policy, source, target, deps),
            protocol,
            evictor: RetentionEvictor::new(),
            retention: None,
            snapshot_mode: false,
        }
    }

    /// Whether `init` selected the incremental snapshot path.
    pub fn is_snapshot_mode(&self) -> bool {
        self.snapshot_mode
    }

    fn span(&self, op: &'static str, ctx: &JobContext) -> tracing::Span {
        info_span!("hdfs_replication", op, policy = %self.core.policy.name, instance_id = %ctx.instance_id())
    }

    async fn initialize(&mut self, ctx: &mut JobContext) -> Result<()> {
        self.core.expect_state(JobState::Created, "init")?;
        let policy = &self.core.policy;
        let tde = policy.tde_enabled() || policy.tde_same_key();
        let pair = self.core.resolve_staging(policy.tde_same_key())?;
        self.retention = Retention::from_policy(policy)?;

        self.core.open_handles(&pair, true, true).await?;
        self.core.staging = Some(pair.clone());

        let source_fs = self.core.source_fs()?;
        let target_fs = self.core.target_fs()?;
        let source = Endpoint {
            cluster: &self.core.source.name,
            fs: source_fs.as_ref(),
            path: &pair.source,
        };
        let target = Endpoint {
            cluster: &self.core.target.name,
            fs: target_fs.as_ref(),
            path: &pair.target,
        };
        if tde {
            if !source_fs.exists(&pair.source).await? {
                return Err(ReplError::PathMissing {
                    path: pair.source.clone(),
                });
            }
        } else {
            let eligible = self.protocol.is_eligible(source, target).await?;
            self.snapshot_mode = eligible && self.retention.is_some();
        }
        info!(
            source = %pair.source,
            target = %pair.target,
            topology = %self.core.topology,
            snapshot_mode = self.snapshot_mode,
            "Initialized replication"
        );

        if self.snapshot_mode && ctx.tracking_info().await?.is_empty() {
            // stray writes on the target would break the next diff copy
            match self.revert_target(ctx).await? {
                Revert::Restored(run) => {
                    info!(job_id = %run.job_id, "Restored target to last common snapshot")
                }
                Revert::Unchanged | Revert::NoCommonSnapshot => {}
            }
        }
        self.core.transition(JobState::Initialized);
        Ok(())
    }

    async fn run_main(&mut self, ctx: &mut JobContext) -> Result<()> {
        let pair = self.core.staging()?.clone();
        let source_fs = self.core.source_fs()?;
        let target_fs = self.core.target_fs()?;

        let (mode, snapshot) = if self.snapshot_mode {
            let name = snapshot_name(&self.core.policy.name, current_time_ms());
            let source = Endpoint {
                cluster: &self.core.source.name,
                fs: source_fs.as_ref(),
                path: &pair.source,
            };
            let target = Endpoint {
                cluster: &self.core.target.name,
                fs: target_fs.as_ref(),
                path: &pair.target,
            };
            // leftovers of failed or killed instances
            self.protocol
                .discard_temporaries(source_fs.as_ref(), &pair.source)
                .await?;
            self.protocol
                .discard_temporaries(target_fs.as_ref(), &pair.target)
                .await?;
            let from = self.protocol.latest_common_snapshot(source, target).await?;
            let temp = inflight_name(&name);
            self.protocol.create(source_fs.as_ref(), &pair.source, &temp).await?;
            (CopyMode::Incremental { from, to: temp }, Some(name))
        } else {
            (CopyMode::Full, None)
        };

        let options = CopyOptionsBuilder::new(&self.core.policy)
            .sources([pair.source.clone()])
            .target(pair.target.clone())
            .mode(mode)
            .engine_conf(self.core.engine_conf())
            .engine_config(&self.core.deps.config)
            .build()?;
        if options.create_target_first {
            target_fs.mkdirs(&pair.target).await?;
        }

        let run = match self
            .core
            .run_copy(ctx, &options, JobType::Main, snapshot.clone())
            .await
        {
            Ok(run) => run,
            Err(e) => {
                if matches!(e, ReplError::Interrupted { .. }) {
                    self.drop_inflight(snapshot.as_deref()).await;
                }
                return Err(e);
            }
        };
        if !run.succeeded() {
            self.drop_inflight(snapshot.as_deref()).await;
        }
        self.finish_main(ctx, run, snapshot).await
    }

    /// Remove the source in-flight snapshot of a copy the engine ended without success.
    async fn drop_inflight(&self, name: Option<&str>) {
        let name = match name {
            Some(n) => n,
            None => return,
        };
        let temp = inflight_name(name);
        let dropped: Result<bool> = async {
            let pair = self.core.staging()?;
            let fs = self.core.source_fs()?;
            self.protocol
                .delete_if_exists(fs.as_ref(), &pair.source, &temp)
                .await
        }
        .await;
        if let Err(e) = dropped {
            warn!(snapshot = %temp, error = %e, "Failed to drop in-flight snapshot");
        }
    }

    /// Post-copy steps shared by `perform` and recovery of a MAIN job.
    async fn finish_main(
        &mut self,
        ctx: &mut JobContext,
        run: CopyRun,
        snapshot: Option<String>,
    ) -> Result<()> {
        if !run.succeeded() {
            return Err(run.failure());
        }
        if let Some(name) = snapshot.as_deref() {
            self.promote(name).await?;
            self.evict().await?;
        }
        ctx.report(run.outcome(InstanceOutcome::success(format!(
            "replicated {} bytes",
            run.metrics.as_ref().map(|m| m.progress.bytes_copied).unwrap_or(0)
        ))))
        .await?;
        self.core.transition(JobState::Succeeded);
        Ok(())
    }

    /// Promote the in-flight snapshot on both ends so they agree on `name`.
    async fn promote(&self, name: &str) -> Result<()> {
        let pair = self.core.staging()?;
        let temp = inflight_name(name);
        let source_fs = self.core.source_fs()?;
        let target_fs = self.core.target_fs()?;

        self.protocol
            .promote(source_fs.as_ref(), &pair.source, &temp, name)
            .await?;
        if target_fs.snapshot_exists(&pair.target, name).await? {
            // already promoted by an earlier attempt of this instance
            return Ok(());
        }
        self.protocol
            .create(target_fs.as_ref(), &pair.target, &temp)
            .await?;
        self.protocol
            .promote(target_fs.as_ref(), &pair.target, &temp, name)
            .await
    }

    async fn evict(&self) -> Result<()> {
        let retention = match self.retention {
            Some(r) => r,
            None => return Ok(()),
        };
        let pair = self.core.staging()?;
        let now = current_time_ms();
        let source_fs = self.core.source_fs()?;
        let target_fs = self.core.target_fs()?;
        self.evictor
            .evict(source_fs.as_ref(), &pair.source, &retention.source, now)
            .await?;
        self.evictor
            .evict(target_fs.as_ref(), &pair.target, &retention.target, now)
            .await?;
        Ok(())
    }

    /// Roll the target back to the latest common snapshot if it changed since.
    async fn revert_target(&mut self, ctx: &mut JobContext) -> Result<Revert> {
        let pair = self.core.staging()?.clone();
        let source_fs = self.core.source_fs()?;
        let target_fs = self.core.target_fs()?;
        let source = Endpoint {
            cluster: &self.core.source.name,
            fs: source_fs.as_ref(),
            path: &pair.source,
        };
        let target = Endpoint {
            cluster: &self.core.target.name,
            fs: target_fs.as_ref(),
            path: &pair.target,
        };
        let common = match self.protocol.latest_common_snapshot(source, target).await? {
            Some(c) => c,
            None => return Ok(Revert::NoCommonSnapshot),
        };

        self.protocol
            .create(target_fs.as_ref(), &pair.target, RECOVERY_SNAPSHOT)
            .await?;
        let diff = self
            .protocol
            .diff(target_fs.as_ref(), &pair.target, &common, RECOVERY_SNAPSHOT)
            .await?;
        if diff.is_empty() {
            self.protocol
                .delete_if_exists(target_fs.as_ref(), &pair.target, RECOVERY_SNAPSHOT)
                .await?;
            info!(common = %common, "Target unchanged since last common snapshot");
            return Ok(Revert::Unchanged);
        }

        info!(common = %common, changes = diff.len(), "Target diverged, restoring last common snapshot");
        let options = CopyOptionsBuilder::new(&self.core.policy)
            .sources([pair.target.clone()])
            .target(pair.target.clone())
            .mode(CopyMode::Recovery {
                from: RECOVERY_SNAPSHOT.to_string(),
                to: common.clone(),
            })
            .engine_conf(self.core.engine_conf())
            .engine_config(&self.core.deps.config)
            .build()?;
        let run = self
            .core
            .run_copy(ctx, &options, JobType::Recovery, Some(common.clone()))
            .await?;
        if !run.succeeded() {
            return Err(run.failure());
        }
        self.finish_revert(&common).await?;
        Ok(Revert::Restored(run))
    }

    /// After a restore: drop the recovery snapshot and retake `common` on the restored target.
    async fn finish_revert(&self, common: &str) -> Result<()> {
        let pair = self.core.staging()?;
        let target_fs = self.core.target_fs()?;
        self.protocol
            .delete_if_exists(target_fs.as_ref(), &pair.target, RECOVERY_SNAPSHOT)
            .await?;
        self.protocol
            .create(target_fs.as_ref(), &pair.target, common)
            .await
    }

    async fn run_recovery(&mut self, ctx: &mut JobContext) -> Result<()> {
        self.core.expect_state(JobState::Initialized, "recover")?;
        self.core.transition(JobState::Recovering);

        let prior = match ctx.tracking_info().await?.current().cloned() {
            Some(prior) => prior,
            None => {
                info!("No engine job recorded for this instance, performing from scratch");
                ctx.set_perform_after_recovery(true);
                self.core.transition(JobState::Initialized);
                return Ok(());
            }
        };

        match self.core.lookup_job(&prior.job_id).await? {
            PriorJob::Found(status)
                if status.state.is_active() || status.state == EngineJobState::Succeeded =>
            {
                // an active job is awaited; a finished one returns at the first poll
                info!(job_id = %prior.job_id, state = %status.state, "Re-attaching to prior engine job");
                let run = self
                    .core
                    .await_job(ctx, prior.job_id.clone(), prior.job_type, prior.snapshot.clone())
                    .await?;
                self.complete_prior(ctx, &prior, run).await
            }
            other => {
                match &other {
                    PriorJob::Found(status) => {
                        info!(job_id = %prior.job_id, state = %status.state, "Prior engine job did not succeed")
                    }
                    PriorJob::Missing => warn!(job_id = %prior.job_id, "Prior engine job not found"),
                    PriorJob::Unreachable(msg) => {
                        warn!(job_id = %prior.job_id, error = %msg, "Copy engine unreachable during recovery")
                    }
                }
                ctx.set_perform_after_recovery(true);
                if !self.snapshot_mode {
                    // plain copies are re-run as a whole
                    self.core.transition(JobState::Initialized);
                    return Ok(());
                }
                self.diff_recovery(ctx).await
            }
        }
    }

    async fn complete_prior(
        &mut self,
        ctx: &mut JobContext,
        prior: &ReplicationMetrics,
        run: CopyRun,
    ) -> Result<()> {
        match prior.job_type {
            JobType::Main => self.finish_main(ctx, run, prior.snapshot.clone()).await,
            JobType::Recovery => {
                if !run.succeeded() {
                    return Err(run.failure());
                }
                if let Some(common) = prior.snapshot.as_deref() {
                    self.finish_revert(common).await?;
                }
                ctx.report(run.outcome(InstanceOutcome::success(
                    "restored target to last common snapshot",
                )))
                .await?;
                ctx.set_perform_after_recovery(true);
                self.core.transition(JobState::Initialized);
                Ok(())
            }
        }
    }

    async fn diff_recovery(&mut self, ctx: &mut JobContext) -> Result<()> {
        let pair = self.core.staging()?.clone();
        let source_fs = self.core.source_fs()?;
        let target_fs = self.core.target_fs()?;
        self.protocol
            .discard_temporaries(source_fs.as_ref(), &pair.source)
            .await?;
        self.protocol
            .discard_temporaries(target_fs.as_ref(), &pair.target)
            .await?;

        let outcome = match self.revert_target(ctx).await? {
            Revert::NoCommonSnapshot => {
                InstanceOutcome::success("no common snapshot, nothing to restore")
            }
            Revert::Unchanged => {
                InstanceOutcome::success("target matches last common snapshot")
            }
            Revert::Restored(run) => {
                run.outcome(InstanceOutcome::success("restored target to last common snapshot"))
            }
        };
        ctx.report(outcome).await?;
        self.core.transition(JobState::Initialized);
        Ok(())
    }
}

#[async_trait]
impl ReplicationJob for HdfsReplication {
    fn state(&self) -> JobState {
        self.core.state
    }

    async fn init(&mut self, ctx: &mut JobContext) -> Result<()> {
        let span = self.span("init", ctx);
        async {
            match self.initialize(ctx).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    self.core.settle_error(ctx, &e).await;
                    if let Err(close_err) = self.core.close_handles().await {
                        warn!(error = %close_err, "Failed to release handles after init failure");
                    }
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn perform(&mut self, ctx: &mut JobContext) -> Result<()> {
        let span = self.span("perform", ctx);
        async {
            self.core.expect_state(JobState::Initialized, "perform")?;
            self.core.transition(JobState::Running);
            let result = self.run_main(ctx).await;
            if let Err(e) = &result {
                self.core.settle_error(ctx, e).await;
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn recover(&mut self, ctx: &mut JobContext) -> Result<()> {
        let span = self.span("recover", ctx);
        async {
            let result = self.run_recovery(ctx).await;
            if let Err(e) = &result {
                self.core.settle_error(ctx, e).await;
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn clean_up(&mut self, ctx: &mut JobContext) -> Result<()> {
        let span = self.span("clean_up", ctx);
        self.core.close_handles().instrument(span).await
    }
}
