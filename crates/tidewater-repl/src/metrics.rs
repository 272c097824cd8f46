//! Per-instance copy metrics and the tracking info persisted between attempts.
//!
//! Tracking info holds at most one MAIN entry (the regular copy) and one RECOVERY
//! entry (a roll-back copy issued during recovery). Recording a MAIN entry replaces
//! everything; recording a RECOVERY entry keeps the MAIN entry beside it.

use crate::engine::CopyCounters;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which copy a metrics entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobType {
    /// The instance's regular copy.
    Main,
    /// A roll-back copy issued during recovery.
    Recovery,
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobType::Main => f.write_str("MAIN"),
            JobType::Recovery => f.write_str("RECOVERY"),
        }
    }
}

/// Progress of one engine job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    /// Work units planned.
    pub total: u64,
    /// Work units finished.
    pub completed: u64,
    /// Work units failed.
    pub failed: u64,
    /// Work units killed.
    pub killed: u64,
    /// Bytes copied.
    pub bytes_copied: u64,
    /// Files copied.
    pub files_copied: u64,
    /// Elapsed time in milliseconds.
    pub time_taken_ms: u64,
}

impl From<CopyCounters> for Progress {
    fn from(c: CopyCounters) -> Self {
        Self {
            total: c.total,
            completed: c.completed,
            failed: c.failed,
            killed: c.killed,
            bytes_copied: c.bytes_copied,
            files_copied: c.files_copied,
            time_taken_ms: c.time_taken_ms,
        }
    }
}

/// Metrics of one engine job, identified by its job id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationMetrics {
    /// Engine job id.
    pub job_id: String,
    /// MAIN or RECOVERY.
    pub job_type: JobType,
    /// Snapshot this copy promotes on success, if snapshot-based.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,
    /// Latest progress.
    #[serde(default)]
    pub progress: Progress,
}

impl ReplicationMetrics {
    /// Metrics for a freshly submitted job.
    pub fn new(job_id: &str, job_type: JobType, snapshot: Option<String>) -> Self {
        Self {
            job_id: job_id.to_string(),
            job_type,
            snapshot,
            progress: Progress::default(),
        }
    }

    fn labels(&self, instance_id: &str) -> String {
        format!(
            "instance_id=\"{}\",job_id=\"{}\",job_type=\"{}\"",
            instance_id, self.job_id, self.job_type
        )
    }
}

/// Counter families exported per engine job.
const COUNTERS: [(&str, &str, fn(&Progress) -> u64); 5] = [
    ("tidewater_copy_bytes_total", "Bytes copied by the engine job", |p| p.bytes_copied),
    ("tidewater_copy_files_total", "Files copied by the engine job", |p| p.files_copied),
    ("tidewater_copy_units_failed_total", "Work units failed", |p| p.failed),
    ("tidewater_copy_units_completed_total", "Work units completed", |p| p.completed),
    ("tidewater_copy_time_ms", "Elapsed copy time in milliseconds", |p| p.time_taken_ms),
];

/// Ordered metrics entries persisted for one instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackingInfo(Vec<ReplicationMetrics>);

impl TrackingInfo {
    /// Parse persisted tracking info; a blank string is empty tracking info.
    pub fn from_json(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(raw)?)
    }

    /// Serialize for persistence.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Record `metrics`, keeping at most one MAIN and one RECOVERY entry.
    pub fn record(&mut self, metrics: ReplicationMetrics) {
        match metrics.job_type {
            JobType::Main => self.0 = vec![metrics],
            JobType::Recovery => {
                self.0.retain(|m| m.job_type == JobType::Main);
                self.0.push(metrics);
            }
        }
    }

    /// The most recent job: the RECOVERY entry if present, otherwise MAIN.
    pub fn current(&self) -> Option<&ReplicationMetrics> {
        self.entry(JobType::Recovery).or_else(|| self.entry(JobType::Main))
    }

    /// Entry of the given type.
    pub fn entry(&self, job_type: JobType) -> Option<&ReplicationMetrics> {
        self.0.iter().find(|m| m.job_type == job_type)
    }

    /// All entries, MAIN first.
    pub fn entries(&self) -> &[ReplicationMetrics] {
        &self.0
    }

    /// Prometheus text exposition of every entry, labelled by `instance_id`.
    ///
    /// Each counter family is written once with one sample per entry.
    pub fn exposition(&self, instance_id: &str) -> String {
        let mut out = String::new();
        if self.0.is_empty() {
            return out;
        }
        for (name, help, value) in COUNTERS {
            out.push_str(&format!("# HELP {} {}\n", name, help));
            out.push_str(&format!("# TYPE {} counter\n", name));
            for m in &self.0 {
                out.push_str(&format!(
                    "{}{{{}}} {}\n",
                    name,
                    m.labels(instance_id),
                    value(&m.progress)
                ));
            }
        }
        out
    }

    /// No entries recorded.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(job_id: &str, job_type: JobType, bytes: u64) -> ReplicationMetrics {
        let mut m = ReplicationMetrics::new(job_id, job_type, None);
        m.progress.bytes_copied = bytes;
        m
    }

    #[test]
    fn test_blank_tracking_info_is_empty() {
        assert!(TrackingInfo::from_json("").unwrap().is_empty());
        assert!(TrackingInfo::from_json("  ").unwrap().current().is_none());
    }

    #[test]
    fn test_main_replaces_everything() {
        let mut info = TrackingInfo::default();
        info.record(entry("job_1", JobType::Main, 0));
        info.record(entry("job_2", JobType::Recovery, 0));
        info.record(entry("job_3", JobType::Main, 10));
        assert_eq!(info.entries().len(), 1);
        assert_eq!(info.current().unwrap().job_id, "job_3");
    }

    #[test]
    fn test_recovery_kept_beside_main() {
        let mut info = TrackingInfo::default();
        info.record(entry("job_1", JobType::Main, 5));
        info.record(entry("job_2", JobType::Recovery, 0));
        info.record(entry("job_2", JobType::Recovery, 7));
        assert_eq!(info.entries().len(), 2);
        assert_eq!(info.entry(JobType::Main).unwrap().job_id, "job_1");
        let current = info.current().unwrap();
        assert_eq!(current.job_id, "job_2");
        assert_eq!(current.progress.bytes_copied, 7);
    }

    #[test]
    fn test_json_shape() {
        let mut info = TrackingInfo::default();
        let mut m = entry("job_1", JobType::Main, 42);
        m.snapshot = Some("tidewater-snapshot-p-1".to_string());
        info.record(m);
        let json = info.to_json().unwrap();
        assert!(json.starts_with('['));
        assert!(json.contains("\"jobId\":\"job_1\""));
        assert!(json.contains("\"jobType\":\"MAIN\""));
        assert!(json.contains("\"bytesCopied\":42"));
        assert_eq!(TrackingInfo::from_json(&json).unwrap(), info);
    }

    #[test]
    fn test_exposition_labels() {
        let mut info = TrackingInfo::default();
        info.record(entry("job_9", JobType::Recovery, 3));
        let text = info.exposition("p1@1");
        assert!(text.contains("# TYPE tidewater_copy_bytes_total counter"));
        assert!(text.contains(
            "tidewater_copy_bytes_total{instance_id=\"p1@1\",job_id=\"job_9\",job_type=\"RECOVERY\"} 3"
        ));
    }

    #[test]
    fn test_exposition_writes_each_family_once() {
        let mut info = TrackingInfo::default();
        info.record(entry("job_1", JobType::Main, 10));
        info.record(entry("job_2", JobType::Recovery, 4));
        let text = info.exposition("p1@2");
        assert_eq!(text.matches("# HELP tidewater_copy_bytes_total").count(), 1);
        assert!(text.contains("job_id=\"job_1\",job_type=\"MAIN\"} 10"));
        assert!(text.contains("job_id=\"job_2\",job_type=\"RECOVERY\"} 4"));
        assert!(TrackingInfo::default().exposition("p1@3").is_empty());
    }
}
