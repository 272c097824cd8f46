#![warn(missing_docs)]

//! Tidewater replication subsystem: snapshot-based disaster-recovery copies between
//! filesystems and object stores, crash recovery of interrupted instances, and
//! snapshot retention.

pub mod catalog;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod fs;
pub mod job;
pub mod metrics;
pub mod model;
pub mod options;
pub mod progress;
pub mod retention;
pub mod runner;
pub mod sim;
pub mod snapshot;
pub mod store;
pub mod uri;

pub use config::EngineConfig;
pub use context::{InstanceOutcome, JobContext, ReplicationStatus};
pub use error::{ReplError, Result};
pub use job::{build_job, JobDeps, JobKind, JobState, ReplicationJob};
pub use model::{Cluster, Policy, PolicyType};
pub use runner::{InstanceRunner, RunMode, RunReport};
