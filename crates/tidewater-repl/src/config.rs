//! Engine-wide settings shared by every replication instance.

use crate::error::{ReplError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Upper bound on engine job lookups during recovery, regardless of configuration.
pub const MAX_JOB_LOOKUP_RETRIES: u32 = 10;

/// Configuration for the replication engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Period of the progress poller in seconds.
    pub metrics_interval_secs: u64,
    /// TTL of the per-cluster snapshottable-directory listing in seconds.
    pub snapshot_refresh_secs: u64,
    /// Attempts to look up a prior engine job during recovery.
    pub job_lookup_retries: u32,
    /// Delay between engine job lookups in seconds.
    pub job_lookup_delay_secs: u64,
    /// How often to poll the engine for job completion, in milliseconds.
    pub engine_poll_interval_ms: u64,
    /// Listing threads handed to the copy engine.
    pub list_status_threads: u32,
    /// Regex of file names the copy engine should skip.
    pub exclude_file_regex: Option<String>,
    /// Prefix of the credential store path for cloud targets.
    pub cloud_cred_provider_path: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            metrics_interval_secs: 60,
            snapshot_refresh_secs: 600,
            job_lookup_retries: 5,
            job_lookup_delay_secs: 2,
            engine_poll_interval_ms: 1000,
            list_status_threads: 20,
            exclude_file_regex: None,
            cloud_cred_provider_path: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: EngineConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)
                .map_err(|e| ReplError::config(format!("{}: {}", path.display(), e)))?,
            "json" => serde_json::from_str(&contents)?,
            _ => {
                return Err(ReplError::config(format!(
                    "unsupported config file extension: {}",
                    ext
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make polling or caching meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.metrics_interval_secs == 0 {
            return Err(ReplError::config("metrics_interval_secs must be > 0"));
        }
        if self.engine_poll_interval_ms == 0 {
            return Err(ReplError::config("engine_poll_interval_ms must be > 0"));
        }
        if let Some(re) = &self.exclude_file_regex {
            regex::Regex::new(re)
                .map_err(|e| ReplError::config(format!("exclude_file_regex: {}", e)))?;
        }
        Ok(())
    }

    /// Progress poller period.
    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs)
    }

    /// Snapshot catalog TTL.
    pub fn snapshot_refresh(&self) -> Duration {
        Duration::from_secs(self.snapshot_refresh_secs)
    }

    /// Engine completion polling period.
    pub fn engine_poll_interval(&self) -> Duration {
        Duration::from_millis(self.engine_poll_interval_ms)
    }

    /// Delay between engine job lookups.
    pub fn job_lookup_delay(&self) -> Duration {
        Duration::from_secs(self.job_lookup_delay_secs)
    }

    /// Effective lookup attempts, capped at [`MAX_JOB_LOOKUP_RETRIES`].
    pub fn effective_lookup_retries(&self) -> u32 {
        self.job_lookup_retries.min(MAX_JOB_LOOKUP_RETRIES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.metrics_interval_secs, 60);
        assert_eq!(config.snapshot_refresh_secs, 600);
        assert_eq!(config.job_lookup_retries, 5);
        assert_eq!(config.list_status_threads, 20);
        assert!(config.exclude_file_regex.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_lookup_retries_capped() {
        let config = EngineConfig {
            job_lookup_retries: 50,
            ..Default::default()
        };
        assert_eq!(config.effective_lookup_retries(), MAX_JOB_LOOKUP_RETRIES);

        let config = EngineConfig {
            job_lookup_retries: 3,
            ..Default::default()
        };
        assert_eq!(config.effective_lookup_retries(), 3);
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
metrics_interval_secs = 5
snapshot_refresh_secs = 30
exclude_file_regex = "\\.tmp$"
"#
        )
        .unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.metrics_interval_secs, 5);
        assert_eq!(config.snapshot_refresh(), Duration::from_secs(30));
        assert_eq!(config.exclude_file_regex.as_deref(), Some("\\.tmp$"));
        // unspecified fields fall back to defaults
        assert_eq!(config.job_lookup_retries, 5);
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{"job_lookup_retries": 2, "cloud_cred_provider_path": "jceks://hdfs/creds/"}}"#
        )
        .unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.job_lookup_retries, 2);
        assert_eq!(
            config.cloud_cred_provider_path.as_deref(),
            Some("jceks://hdfs/creds/")
        );
    }

    #[test]
    fn test_from_file_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        let err = EngineConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ReplError::Config { .. }));
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let config = EngineConfig {
            metrics_interval_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_regex() {
        let config = EngineConfig {
            exclude_file_regex: Some("([".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
