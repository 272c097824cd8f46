//! Background poller that mirrors engine counters into tracking info.

use crate::context::TrackingRecorder;
use crate::engine::CopyEngine;
use crate::error::Result;
use crate::metrics::{JobType, ReplicationMetrics};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Read the engine's counters for `job_id` and persist them.
pub async fn capture_metrics(
    engine: &dyn CopyEngine,
    recorder: &TrackingRecorder,
    job_id: &str,
    job_type: JobType,
    snapshot: Option<String>,
) -> Result<ReplicationMetrics> {
    let counters = engine.counters(job_id).await?;
    let mut metrics = ReplicationMetrics::new(job_id, job_type, snapshot);
    metrics.progress = counters.into();
    recorder.record(metrics.clone()).await?;
    Ok(metrics)
}

/// A running poller; [`ProgressPoller::stop`] cancels and joins it.
///
/// Dropping the poller cancels it without waiting.
pub struct ProgressPoller {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ProgressPoller {
    /// Start polling `job_id` every `interval`.
    pub fn start(
        engine: Arc<dyn CopyEngine>,
        recorder: TrackingRecorder,
        job_id: String,
        job_type: JobType,
        snapshot: Option<String>,
        interval: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // first tick fires immediately; the submission already recorded zero progress
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        match capture_metrics(
                            engine.as_ref(),
                            &recorder,
                            &job_id,
                            job_type,
                            snapshot.clone(),
                        )
                        .await
                        {
                            Ok(m) => debug!(
                                job_id = %job_id,
                                bytes = m.progress.bytes_copied,
                                files = m.progress.files_copied,
                                "Copy progress"
                            ),
                            Err(e) => warn!(job_id = %job_id, error = %e, "Failed to capture copy progress"),
                        }
                    }
                }
            }
        });
        Self {
            cancel,
            handle: Some(handle),
        }
    }

    /// Stop the poller and wait for it to exit.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Progress poller task ended abnormally");
            }
        }
    }
}

impl Drop for ProgressPoller {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::JobContext;
    use crate::options::CopyOptions;
    use crate::sim::{CopyBehavior, MemCopyEngine};
    use crate::store::MemoryStore;
    use std::collections::{BTreeMap, BTreeSet};

    fn options() -> CopyOptions {
        CopyOptions {
            source_paths: vec!["hdfs://a:8020/data".to_string()],
            target_path: "hdfs://b:8020/data".to_string(),
            sync_folder: true,
            overwrite: false,
            delete_missing: true,
            skip_checksum: false,
            ignore_failures: false,
            preserve: BTreeSet::new(),
            max_maps: None,
            map_bandwidth_mb: None,
            snapshot_diff: None,
            queue_name: None,
            create_target_first: false,
            engine_conf: BTreeMap::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_records_progress_until_stopped() {
        let engine = Arc::new(MemCopyEngine::new());
        engine.set_behavior(CopyBehavior::Hang);
        let job_id = engine.submit(&options()).await.unwrap();
        engine.set_counters(&job_id, 3, 300);

        let store = Arc::new(MemoryStore::new());
        let ctx = JobContext::new("p1@1", store.clone());
        let poller = ProgressPoller::start(
            engine.clone(),
            ctx.recorder(),
            job_id.clone(),
            JobType::Main,
            None,
            Duration::from_secs(5),
        );

        tokio::time::sleep(Duration::from_secs(6)).await;
        poller.stop().await;

        let info = ctx.tracking_info().await.unwrap();
        let current = info.current().unwrap();
        assert_eq!(current.job_id, job_id);
        assert_eq!(current.progress.bytes_copied, 300);
        assert_eq!(current.progress.files_copied, 3);
    }

    #[tokio::test]
    async fn test_capture_metrics_persists_snapshot_name() {
        let engine = MemCopyEngine::new();
        let job_id = engine.submit(&options()).await.unwrap();
        let store = Arc::new(MemoryStore::new());
        let ctx = JobContext::new("p1@1", store);

        let m = capture_metrics(
            &engine,
            &ctx.recorder(),
            &job_id,
            JobType::Main,
            Some("tidewater-snapshot-p-1".to_string()),
        )
        .await
        .unwrap();
        assert_eq!(m.snapshot.as_deref(), Some("tidewater-snapshot-p-1"));
        let info = ctx.tracking_info().await.unwrap();
        assert_eq!(info.current().unwrap(), &m);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_poller_stops_recording() {
        let engine = Arc::new(MemCopyEngine::new());
        engine.set_behavior(CopyBehavior::Hang);
        let job_id = engine.submit(&options()).await.unwrap();

        let store = Arc::new(MemoryStore::new());
        let ctx = JobContext::new("p1@1", store.clone());
        let poller = ProgressPoller::start(
            engine.clone(),
            ctx.recorder(),
            job_id.clone(),
            JobType::Main,
            None,
            Duration::from_secs(5),
        );
        drop(poller);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(ctx.tracking_info().await.unwrap().is_empty());
    }
}
