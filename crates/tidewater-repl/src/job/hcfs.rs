//! Replication to or from a remote object store. Always a plain copy; remote
//! locations have no snapshots.

use super::common::{CopyRun, JobCore, JobDeps, PriorJob};
use super::{JobState, ReplicationJob};
use crate::context::{InstanceOutcome, JobContext};
use crate::engine::EngineJobState;
use crate::error::{ReplError, Result};
use crate::metrics::JobType;
use crate::model::{Cluster, Policy};
use crate::options::{CopyMode, CopyOptionsBuilder, CREDENTIAL_PROVIDER_KEY};
use crate::uri;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::{info, info_span, warn, Instrument};

/// Replication job with at least one remote end.
pub struct HcfsReplication {
    core: JobCore,
}

impl HcfsReplication {
    /// Create a job for `policy`.
    pub fn new(policy: Policy, source: Cluster, target: Cluster, deps: JobDeps) -> Self {
        Self {
            core: JobCore::new(policy, source, target, deps),
        }
    }

    fn span(&self, op: &'static str, ctx: &JobContext) -> tracing::Span {
        info_span!("hcfs_replication", op, policy = %self.core.policy.name, instance_id = %ctx.instance_id())
    }

    /// Credential store for the remote end: `<prefix><cluster>.jceks`.
    fn credential_conf(&self) -> BTreeMap<String, String> {
        let mut conf = BTreeMap::new();
        let prefix = match &self.core.deps.config.cloud_cred_provider_path {
            Some(p) if !p.trim().is_empty() => p.trim(),
            _ => return conf,
        };
        let remote = match self.core.staging.as_ref() {
            Some(pair) if uri::is_hcfs(&pair.source) && !uri::is_hcfs(&pair.target) => {
                &self.core.source.name
            }
            _ => &self.core.target.name,
        };
        conf.insert(
            CREDENTIAL_PROVIDER_KEY.to_string(),
            format!("{}{}.jceks", prefix, remote),
        );
        conf
    }

    async fn initialize(&mut self) -> Result<()> {
        self.core.expect_state(JobState::Created, "init")?;
        let pair = self.core.resolve_staging(false)?;
        let source_local = !uri::is_hcfs(&pair.source);
        let target_local = !uri::is_hcfs(&pair.target);
        self.core
            .open_handles(&pair, source_local, target_local)
            .await?;
        self.core.staging = Some(pair.clone());

        if source_local && !self.core.source_fs()?.exists(&pair.source).await? {
            return Err(ReplError::PathMissing { path: pair.source });
        }
        info!(source = %pair.source, target = %pair.target, topology = %self.core.topology, "Initialized cloud replication");
        self.core.transition(JobState::Initialized);
        Ok(())
    }

    async fn run_main(&mut self, ctx: &mut JobContext) -> Result<()> {
        let pair = self.core.staging()?.clone();
        let mut conf = self.core.engine_conf();
        conf.extend(self.credential_conf());
        let options = CopyOptionsBuilder::new(&self.core.policy)
            .sources([pair.source.clone()])
            .target(pair.target.clone())
            .mode(CopyMode::Full)
            .engine_conf(conf)
            .engine_config(&self.core.deps.config)
            .build()?;
        if options.create_target_first {
            if let Some(fs) = self.core.target_handle() {
                fs.mkdirs(&pair.target).await?;
            }
        }
        let run = self.core.run_copy(ctx, &options, JobType::Main, None).await?;
        self.finish(ctx, run).await
    }

    async fn finish(&mut self, ctx: &mut JobContext, run: CopyRun) -> Result<()> {
        if !run.succeeded() {
            return Err(run.failure());
        }
        ctx.report(run.outcome(InstanceOutcome::success("replicated to remote store")))
            .await?;
        self.core.transition(JobState::Succeeded);
        Ok(())
    }

    async fn run_recovery(&mut self, ctx: &mut JobContext) -> Result<()> {
        self.core.expect_state(JobState::Initialized, "recover")?;
        self.core.transition(JobState::Recovering);

        let prior = ctx.tracking_info().await?.current().cloned();
        let prior = match prior {
            Some(p) => p,
            None => {
                ctx.set_perform_after_recovery(true);
                self.core.transition(JobState::Initialized);
                return Ok(());
            }
        };
        match self.core.lookup_job(&prior.job_id).await? {
            PriorJob::Found(status)
                if status.state.is_active() || status.state == EngineJobState::Succeeded =>
            {
                let run = self
                    .core
                    .await_job(ctx, prior.job_id.clone(), JobType::Main, None)
                    .await?;
                self.finish(ctx, run).await
            }
            _ => {
                warn!(job_id = %prior.job_id, "Prior engine job did not complete, copying again");
                ctx.set_perform_after_recovery(true);
                self.core.transition(JobState::Initialized);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl ReplicationJob for HcfsReplication {
    fn state(&self) -> JobState {
        self.core.state
    }

    async fn init(&mut self, ctx: &mut JobContext) -> Result<()> {
        let span = self.span("init", ctx);
        async {
            match self.initialize().await {
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
