//! Copy engine capability: submits bulk copies and reports their status.

use crate::error::Result;
use crate::options::CopyOptions;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of an engine job as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EngineJobState {
    /// Accepted, not yet running.
    Prep,
    /// Copying.
    Running,
    /// Finished successfully.
    Succeeded,
    /// Finished with an error.
    Failed,
    /// Killed before finishing.
    Killed,
}

impl EngineJobState {
    /// The job may still change state.
    pub fn is_active(self) -> bool {
        matches!(self, EngineJobState::Prep | EngineJobState::Running)
    }
}

impl fmt::Display for EngineJobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EngineJobState::Prep => "PREP",
            EngineJobState::Running => "RUNNING",
            EngineJobState::Succeeded => "SUCCEEDED",
            EngineJobState::Failed => "FAILED",
            EngineJobState::Killed => "KILLED",
        };
        f.write_str(s)
    }
}

/// Status snapshot of one engine job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineJobStatus {
    /// Engine-assigned identifier.
    pub job_id: String,
    /// Current state.
    pub state: EngineJobState,
    /// Diagnostic message for failed jobs.
    pub message: Option<String>,
}

/// Progress counters of an engine job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyCounters {
    /// Work units planned.
    pub total: u64,
    /// Work units finished.
    pub completed: u64,
    /// Work units failed.
    pub failed: u64,
    /// Work units killed.
    pub killed: u64,
    /// Bytes copied so far.
    pub bytes_copied: u64,
    /// Files copied so far.
    pub files_copied: u64,
    /// Elapsed time in milliseconds.
    pub time_taken_ms: u64,
}

/// Bulk copy engine.
///
/// `status` distinguishes an unknown job (`Ok(None)`) from an engine that cannot be
/// reached ([`crate::error::ReplError::EngineUnreachable`]).
#[async_trait]
pub trait CopyEngine: Send + Sync {
    /// Submit a copy and return its job identifier.
    async fn submit(&self, options: &CopyOptions) -> Result<String>;

    /// Current status of `job_id`.
    async fn status(&self, job_id: &str) -> Result<Option<EngineJobStatus>>;

    /// Current progress counters of `job_id`.
    async fn counters(&self, job_id: &str) -> Result<CopyCounters>;

    /// Kill `job_id`. Killing a finished job is not an error.
    async fn kill(&self, job_id: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_states() {
        assert!(EngineJobState::Prep.is_active());
        assert!(EngineJobState::Running.is_active());
        assert!(!EngineJobState::Succeeded.is_active());
        assert!(!EngineJobState::Failed.is_active());
        assert!(!EngineJobState::Killed.is_active());
    }

    #[test]
    fn test_state_wire_format() {
        let json = serde_json::to_string(&EngineJobState::Succeeded).unwrap();
        assert_eq!(json, "\"SUCCEEDED\"");
        assert_eq!(EngineJobState::Prep.to_string(), "PREP");
    }
}
