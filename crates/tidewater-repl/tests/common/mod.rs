//! Shared fixtures: two simulated clusters, a copy engine and an in-memory store.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tidewater_repl::catalog::SnapshotCatalog;
use tidewater_repl::model::{PolicyProperty, RetryPolicy};
use tidewater_repl::sim::{MemCopyEngine, MemFs, MemFsProvider};
use tidewater_repl::snapshot::is_temporary;
use tidewater_repl::store::MemoryStore;
use tidewater_repl::{
    Cluster, EngineConfig, InstanceRunner, JobDeps, Policy, PolicyType, RunMode, RunReport,
};
use tokio_util::sync::CancellationToken;

pub const SOURCE: &str = "hdfs://src-nn:8020";
pub const TARGET: &str = "hdfs://dst-nn:8020";
pub const DATASET: &str = "/data/sales";

pub struct Harness {
    pub provider: Arc<MemFsProvider>,
    pub engine: Arc<MemCopyEngine>,
    pub store: Arc<MemoryStore>,
    pub source: Arc<MemFs>,
    pub target: Arc<MemFs>,
    pub deps: JobDeps,
    pub runner: Arc<InstanceRunner>,
}

pub fn config() -> EngineConfig {
    EngineConfig {
        engine_poll_interval_ms: 10,
        job_lookup_retries: 2,
        job_lookup_delay_secs: 1,
        ..Default::default()
    }
}

pub fn policy(name: &str) -> Policy {
    Policy {
        name: name.to_string(),
        policy_type: PolicyType::Fs,
        source_cluster: "src".to_string(),
        target_cluster: "dst".to_string(),
        source_dataset: DATASET.to_string(),
        target_dataset: DATASET.to_string(),
        frequency_secs: 3600,
        retry: RetryPolicy::default(),
        custom_properties: BTreeMap::new(),
    }
}

/// `policy` with age and count retention on both ends.
pub fn snapshot_policy(name: &str, age: &str, keep: &str) -> Policy {
    let mut p = policy(name);
    for (prop, value) in [
        (PolicyProperty::SourceRetentionAgeLimit, age),
        (PolicyProperty::SourceRetentionNumber, keep),
        (PolicyProperty::TargetRetentionAgeLimit, age),
        (PolicyProperty::TargetRetentionNumber, keep),
    ] {
        p.custom_properties
            .insert(prop.key().to_string(), value.to_string());
    }
    p
}

impl Harness {
    /// Both clusters registered, the dataset present and snapshottable on both.
    pub fn new(policy: Policy) -> Self {
        Self::with_config(policy, config())
    }

    pub fn with_config(policy: Policy, config: EngineConfig) -> Self {
        let provider = Arc::new(MemFsProvider::new());
        let source = provider.register(SOURCE);
        let target = provider.register(TARGET);
        source.allow_snapshot(DATASET);
        target.allow_snapshot(DATASET);

        let engine = Arc::new(MemCopyEngine::with_filesystems(provider.clone()));
        let store = Arc::new(MemoryStore::new());
        store.put_cluster(Cluster::new("src", SOURCE, true));
        store.put_cluster(Cluster::new("dst", TARGET, false));
        store.put_policy(policy);

        let deps = JobDeps {
            config: Arc::new(config),
            engine: engine.clone(),
            filesystems: provider.clone(),
            catalog: Arc::new(SnapshotCatalog::new(Duration::from_secs(600))),
        };
        let runner = Arc::new(InstanceRunner::new(store.clone(), store.clone(), deps.clone()));
        Self {
            provider,
            engine,
            store,
            source,
            target,
            deps,
            runner,
        }
    }

    pub fn write_source(&self, name: &str, data: &[u8]) {
        self.source.write_file(&format!("{}/{}", DATASET, name), data);
    }

    pub fn write_target(&self, name: &str, data: &[u8]) {
        self.target.write_file(&format!("{}/{}", DATASET, name), data);
    }

    pub fn in_sync(&self) -> bool {
        self.source.tree(DATASET) == self.target.tree(DATASET)
    }

    pub fn source_snapshots(&self) -> Vec<String> {
        self.source.snapshot_names(DATASET)
    }

    pub fn target_snapshots(&self) -> Vec<String> {
        self.target.snapshot_names(DATASET)
    }

    /// Promoted snapshots present on both ends, oldest first by target time.
    pub fn common_snapshots(&self) -> Vec<String> {
        let source = self.source_snapshots();
        self.target_snapshots()
            .into_iter()
            .filter(|n| !is_temporary(n) && source.contains(n))
            .collect()
    }

    pub fn temporaries(&self) -> Vec<String> {
        self.source_snapshots()
            .into_iter()
            .chain(self.target_snapshots())
            .filter(|n| is_temporary(n))
            .collect()
    }

    pub async fn run(&self, policy: &str, instance: &str, mode: RunMode) -> tidewater_repl::Result<RunReport> {
        // snapshot names carry wall-clock millis
        std::thread::sleep(Duration::from_millis(2));
        self.runner
            .run(policy, instance, mode, CancellationToken::new())
            .await
    }

    /// Wait until the engine has seen `count` submissions.
    pub async fn wait_for_submissions(&self, count: usize) {
        while self.engine.submissions().len() < count {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    /// Id the simulator assigned to the `n`th submission (1-based).
    pub fn job_id(n: usize) -> String {
        format!("job_sim_{:04}", n)
    }
}
