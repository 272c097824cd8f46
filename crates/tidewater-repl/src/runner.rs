//! Thin driver the external scheduler calls once per policy firing.

use crate::context::{InstanceOutcome, JobContext};
use crate::error::Result;
use crate::job::{build_job, JobDeps, JobState, ReplicationJob};
use crate::store::{InstanceStore, PolicyStore};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How to start an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// New instance: `init` then `perform`.
    Fresh,
    /// Possibly interrupted instance: `init`, `recover`, then `perform` if asked.
    Resume,
    /// Resume when the instance has tracking info, otherwise fresh.
    Auto,
}

/// What happened to one instance.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Instance identifier.
    pub instance_id: String,
    /// Mode actually used.
    pub mode: RunMode,
    /// State the job ended in.
    pub final_state: JobState,
    /// Recovery asked for a fresh copy and `perform` ran.
    pub performed_after_recovery: bool,
    /// Last reported outcome.
    pub outcome: Option<InstanceOutcome>,
}

/// Runs policy instances against shared collaborators.
pub struct InstanceRunner {
    policies: Arc<dyn PolicyStore>,
    instances: Arc<dyn InstanceStore>,
    deps: JobDeps,
}

impl InstanceRunner {
    /// Create a runner.
    pub fn new(policies: Arc<dyn PolicyStore>, instances: Arc<dyn InstanceStore>, deps: JobDeps) -> Self {
        Self {
            policies,
            instances,
            deps,
        }
    }

    /// Run one instance of `policy_name` to a terminal outcome.
    ///
    /// The job's handles are always released. Errors are returned after the outcome is persisted.
    pub async fn run(
        &self,
        policy_name: &str,
        instance_id: &str,
        mode: RunMode,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        let mut job = match self.build(policy_name).await {
            Ok(job) => job,
            Err(e) => {
                error!(policy = policy_name, instance_id, error = %e, "Cannot start instance");
                let outcome = InstanceOutcome::failed(e.to_string());
                if let Err(store_err) = self.instances.record_outcome(instance_id, &outcome).await {
                    error!(instance_id, error = %store_err, "Failed to record outcome");
                }
                return Err(e);
            }
        };

        let mode = match mode {
            RunMode::Auto => {
                if self.instances.tracking_info(instance_id).await?.is_empty() {
                    RunMode::Fresh
                } else {
                    RunMode::Resume
                }
            }
            other => other,
        };

        let mut ctx = JobContext::new(instance_id, Arc::clone(&self.instances)).with_cancellation(cancel);
        let result = drive(job.as_mut(), &mut ctx, mode).await;
        if let Err(e) = job.clean_up(&mut ctx).await {
            warn!(instance_id, error = %e, "Failed to release filesystem handles");
        }
        let performed_after_recovery = result?;

        info!(policy = policy_name, instance_id, state = %job.state(), "Instance finished");
        Ok(RunReport {
            instance_id: instance_id.to_string(),
            mode,
            final_state: job.state(),
            performed_after_recovery,
            outcome: ctx.outcome().cloned(),
        })
    }

    async fn build(&self, policy_name: &str) -> Result<Box<dyn ReplicationJob>> {
        let policy = self.policies.active_policy(policy_name).await?;
        let source = self.policies.active_cluster(&policy.source_cluster).await?;
        let target = self.policies.active_cluster(&policy.target_cluster).await?;
        build_job(policy, source, target, self.deps.clone())
    }
}

async fn drive(job: &mut dyn ReplicationJob, ctx: &mut JobContext, mode: RunMode) -> Result<bool> {
    job.init(ctx).await?;
    match mode {
        RunMode::Resume => {
            job.recover(ctx).await?;
            if ctx.perform_after_recovery() {
                job.perform(ctx).await?;
                return Ok(true);
            }
            Ok(false)
        }
        _ => {
            job.perform(ctx).await?;
            Ok(false)
        }
    }
}
