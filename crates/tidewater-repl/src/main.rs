#![warn(missing_docs)]

//! Tidewater replication CLI: inspect the copy options and retention rules a
//! policy produces, or run it end to end against the in-process simulator.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tidewater_repl::catalog::SnapshotCatalog;
use tidewater_repl::options::{CopyMode, CopyOptionsBuilder};
use tidewater_repl::retention::parse_age_limit;
use tidewater_repl::sim::{MemCopyEngine, MemFsProvider};
use tidewater_repl::store::{InstanceStore, MemoryStore};
use tidewater_repl::{uri, Cluster, EngineConfig, InstanceRunner, JobDeps, Policy, RunMode};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "tw-repl")]
#[command(about = "Tidewater replication engine", long_about = None)]
struct Cli {
    /// Engine configuration (.toml or .json).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log as JSON lines.
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the copy options a policy produces for a full copy.
    Options {
        /// Policy file (JSON).
        policy: PathBuf,
    },
    /// Print a retention age expression in milliseconds.
    Retention {
        /// Expression such as `days(7)`.
        expr: String,
    },
    /// Replicate a policy between two in-memory clusters.
    Simulate {
        /// Policy file (JSON).
        policy: PathBuf,
        /// Files seeded into the source dataset.
        #[arg(short, long, default_value = "4")]
        files: usize,
        /// Instances to run; the source changes between runs.
        #[arg(short, long, default_value = "2")]
        runs: usize,
        /// Also print each instance's copy counters in Prometheus text format.
        #[arg(long)]
        metrics: bool,
    },
}

fn init_logging(json: bool) {
    let registry = tracing_subscriber::registry().with(EnvFilter::from_default_env());
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

fn load_policy(path: &Path) -> Result<Policy> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading policy {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing policy {}", path.display()))
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(p) => Ok(EngineConfig::from_file(p)?),
        None => Ok(EngineConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json);
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Options { policy } => {
            let policy = load_policy(&policy)?;
            let options = CopyOptionsBuilder::new(&policy)
                .sources([policy.source_dataset.clone()])
                .target(policy.target_dataset.clone())
                .mode(CopyMode::Full)
                .engine_config(&config)
                .build()?;
            println!("{}", serde_json::to_string_pretty(&options)?);
        }
        Command::Retention { expr } => {
            let age = parse_age_limit(&expr)?;
            println!("{}", age.as_millis());
        }
        Command::Simulate {
            policy,
            files,
            runs,
            metrics,
        } => {
            let policy = load_policy(&policy)?;
            simulate(policy, config, files, runs, metrics).await?;
        }
    }
    Ok(())
}

async fn simulate(
    policy: Policy,
    config: EngineConfig,
    files: usize,
    runs: usize,
    metrics: bool,
) -> Result<()> {
    let provider = Arc::new(MemFsProvider::new());
    let store = Arc::new(MemoryStore::new());

    let source = Cluster::new(
        &policy.source_cluster,
        &format!("hdfs://{}:8020", policy.source_cluster),
        true,
    );
    let target = Cluster::new(
        &policy.target_cluster,
        &format!("hdfs://{}:8020", policy.target_cluster),
        false,
    );

    let source_fs = provider.register(&endpoint_for(&policy.source_dataset, &source));
    let target_fs = provider.register(&endpoint_for(&policy.target_dataset, &target));
    let source_dir = uri::path_of(&policy.source_dataset);
    let target_dir = uri::path_of(&policy.target_dataset);
    source_fs.allow_snapshot(&source_dir);
    target_fs.allow_snapshot(&target_dir);
    for i in 0..files {
        source_fs.write_file(&format!("{}/part-{:05}", source_dir, i), format!("record {}", i).as_bytes());
    }

    store.put_cluster(source);
    store.put_cluster(target);
    store.put_policy(policy.clone());

    let config = Arc::new(config);
    let deps = JobDeps {
        config: Arc::clone(&config),
        engine: Arc::new(MemCopyEngine::with_filesystems(provider.clone())),
        filesystems: provider.clone(),
        catalog: Arc::new(SnapshotCatalog::new(config.snapshot_refresh())),
    };
    let runner = InstanceRunner::new(store.clone(), store.clone(), deps);

    for run in 1..=runs {
        if run > 1 {
            source_fs.write_file(
                &format!("{}/delta-{:03}", source_dir, run),
                format!("delta {}", run).as_bytes(),
            );
        }
        let instance_id = format!("{}@{}", policy.name, run);
        let report = runner
            .run(&policy.name, &instance_id, RunMode::Auto, CancellationToken::new())
            .await?;
        let outcome = match &report.outcome {
            Some(o) => serde_json::to_value(o)?,
            None => serde_json::Value::Null,
        };
        println!(
            "{}",
            serde_json::json!({
                "instance": report.instance_id,
                "state": report.final_state.to_string(),
                "outcome": outcome,
                "targetSnapshots": target_fs.snapshot_names(&target_dir),
            })
        );
        if metrics {
            let tracking = store.tracking_info(&instance_id).await?;
            print!("{}", tracking.exposition(&instance_id));
        }
    }
    Ok(())
}

/// Remote datasets are served by their own authority, local ones by the cluster.
fn endpoint_for(dataset: &str, cluster: &Cluster) -> String {
    if uri::is_hcfs(dataset) {
        dataset.to_string()
    } else {
        cluster.fs_endpoint.clone()
    }
}
