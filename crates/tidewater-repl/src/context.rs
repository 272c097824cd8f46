//! Per-instance execution handle and the outcome it reports.

use crate::error::Result;
use crate::metrics::{ReplicationMetrics, TrackingInfo};
use crate::store::InstanceStore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Terminal status of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReplicationStatus {
    /// The attempt completed and both ends agree.
    Success,
    /// The attempt failed.
    Failed,
    /// The attempt was cancelled and its engine job killed.
    Killed,
}

impl fmt::Display for ReplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReplicationStatus::Success => "SUCCESS",
            ReplicationStatus::Failed => "FAILED",
            ReplicationStatus::Killed => "KILLED",
        };
        f.write_str(s)
    }
}

/// What one attempt reports to the instance store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceOutcome {
    /// Terminal status.
    pub status: ReplicationStatus,
    /// Human-readable detail.
    pub message: String,
    /// Engine job the attempt ran, if any.
    pub engine_job_id: Option<String>,
    /// Final metrics of that job.
    pub metrics: Option<ReplicationMetrics>,
}

impl InstanceOutcome {
    /// Successful outcome.
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: ReplicationStatus::Success,
            message: message.into(),
            engine_job_id: None,
            metrics: None,
        }
    }

    /// Failed outcome.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: ReplicationStatus::Failed,
            message: message.into(),
            engine_job_id: None,
            metrics: None,
        }
    }

    /// Killed outcome.
    pub fn killed(message: impl Into<String>) -> Self {
        Self {
            status: ReplicationStatus::Killed,
            message: message.into(),
            engine_job_id: None,
            metrics: None,
        }
    }

    /// Attach the engine job and its final metrics.
    pub fn with_job(mut self, job_id: Option<String>, metrics: Option<ReplicationMetrics>) -> Self {
        self.engine_job_id = job_id;
        self.metrics = metrics;
        self
    }

    /// Bytes copied by the reported job, zero when none ran.
    pub fn bytes_copied(&self) -> u64 {
        self.metrics
            .as_ref()
            .map(|m| m.progress.bytes_copied)
            .unwrap_or(0)
    }
}

/// Writes tracking info for one instance; cheap to clone into background tasks.
#[derive(Clone)]
pub struct TrackingRecorder {
    instance_id: String,
    store: Arc<dyn InstanceStore>,
}

impl TrackingRecorder {
    /// Merge `metrics` into the persisted tracking info.
    pub async fn record(&self, metrics: ReplicationMetrics) -> Result<()> {
        let mut info = self.store.tracking_info(&self.instance_id).await?;
        info.record(metrics);
        self.store
            .store_tracking_info(&self.instance_id, &info)
            .await
    }

    /// Persisted tracking info.
    pub async fn load(&self) -> Result<TrackingInfo> {
        self.store.tracking_info(&self.instance_id).await
    }
}

/// Execution handle for one policy instance, created by the orchestrator before `init`.
pub struct JobContext {
    instance_id: String,
    perform_after_recovery: bool,
    cancel: CancellationToken,
    store: Arc<dyn InstanceStore>,
    outcome: Option<InstanceOutcome>,
}

impl JobContext {
    /// Create a context reporting to `store`.
    pub fn new(instance_id: impl Into<String>, store: Arc<dyn InstanceStore>) -> Self {
        Self {
            instance_id: instance_id.into(),
            perform_after_recovery: false,
            cancel: CancellationToken::new(),
            store,
            outcome: None,
        }
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Stable identifier of the instance across attempts.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Cancellation signal observed during blocking copies.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether recovery asked the orchestrator to run `perform` next.
    pub fn perform_after_recovery(&self) -> bool {
        self.perform_after_recovery
    }

    /// Set by recovery when no copy ran and the data still needs moving.
    pub fn set_perform_after_recovery(&mut self, value: bool) {
        self.perform_after_recovery = value;
    }

    /// Last outcome reported in this context.
    pub fn outcome(&self) -> Option<&InstanceOutcome> {
        self.outcome.as_ref()
    }

    /// Recorder for this instance's tracking info.
    pub fn recorder(&self) -> TrackingRecorder {
        TrackingRecorder {
            instance_id: self.instance_id.clone(),
            store: Arc::clone(&self.store),
        }
    }

    /// Persisted tracking info for this instance.
    pub async fn tracking_info(&self) -> Result<TrackingInfo> {
        self.store.tracking_info(&self.instance_id).await
    }

    /// Report an outcome to the store and remember it.
    pub async fn report(&mut self, outcome: InstanceOutcome) -> Result<()> {
        debug!(instance_id = %self.instance_id, status = %outcome.status, "Recording outcome");
        let result = self.store.record_outcome(&self.instance_id, &outcome).await;
        self.outcome = Some(outcome);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::JobType;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_report_persists_and_remembers() {
        let store = Arc::new(MemoryStore::new());
        let mut ctx = JobContext::new("p1@1", store.clone());
        assert!(ctx.outcome().is_none());

        ctx.report(InstanceOutcome::failed("engine said no")).await.unwrap();
        assert_eq!(ctx.outcome().unwrap().status, ReplicationStatus::Failed);
        let record = store.instance("p1@1").unwrap();
        assert_eq!(record.outcome.unwrap().message, "engine said no");
    }

    #[tokio::test]
    async fn test_recorder_merges_entries() {
        let store = Arc::new(MemoryStore::new());
        let ctx = JobContext::new("p1@1", store);
        let recorder = ctx.recorder();
        recorder
            .record(ReplicationMetrics::new("job_1", JobType::Main, None))
            .await
            .unwrap();
        recorder
            .record(ReplicationMetrics::new("job_2", JobType::Recovery, None))
            .await
            .unwrap();
        let info = ctx.tracking_info().await.unwrap();
        assert_eq!(info.entries().len(), 2);
        assert_eq!(info.current().unwrap().job_id, "job_2");
    }

    #[test]
    fn test_perform_after_recovery_flag() {
        let mut ctx = JobContext::new("p1@1", Arc::new(MemoryStore::new()));
        assert!(!ctx.perform_after_recovery());
        ctx.set_perform_after_recovery(true);
        assert!(ctx.perform_after_recovery());
    }

    #[test]
    fn test_outcome_bytes() {
        let mut m = ReplicationMetrics::new("job_1", JobType::Main, None);
        m.progress.bytes_copied = 12;
        let outcome = InstanceOutcome::success("ok").with_job(Some("job_1".to_string()), Some(m));
        assert_eq!(outcome.bytes_copied(), 12);
        assert_eq!(InstanceOutcome::killed("x").bytes_copied(), 0);
    }
}
