//! Age-and-count snapshot retention.
//!
//! Retention ages are written as `minutes(N)`, `hours(N)`, `days(N)` or `months(N)`,
//! where a month is 30 days. A snapshot is evicted only when it is older than the
//! age limit and more than `min_keep` snapshots would remain.

use crate::error::{ReplError, Result};
use crate::fs::{FileSystem, SnapshotEntry};
use crate::snapshot::is_temporary;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, info, warn};

const MINUTE_MS: u64 = 60 * 1000;

fn age_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^\s*(minutes|hours|days|months)\s*\(\s*(\d+)\s*\)\s*$").ok())
        .as_ref()
}

/// Parse an age expression such as `days(7)`.
pub fn parse_age_limit(expr: &str) -> Result<Duration> {
    let caps = age_pattern().and_then(|re| re.captures(expr)).ok_or_else(|| {
        ReplError::config(format!(
            "invalid retention age '{}', expected minutes(N), hours(N), days(N) or months(N)",
            expr
        ))
    })?;
    let amount: u64 = caps[2]
        .parse()
        .map_err(|e| ReplError::config(format!("invalid retention age '{}': {}", expr, e)))?;
    let unit_ms = match &caps[1] {
        "minutes" => MINUTE_MS,
        "hours" => 60 * MINUTE_MS,
        "days" => 24 * 60 * MINUTE_MS,
        _ => 30 * 24 * 60 * MINUTE_MS,
    };
    let ms = amount
        .checked_mul(unit_ms)
        .ok_or_else(|| ReplError::config(format!("retention age '{}' overflows", expr)))?;
    Ok(Duration::from_millis(ms))
}

/// Retention settings for one end of a replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionRule {
    /// Snapshots younger than this are never evicted.
    pub age_limit: Duration,
    /// Snapshots always kept regardless of age.
    pub min_keep: usize,
}

impl RetentionRule {
    /// Build a rule from a raw age expression and keep count.
    pub fn parse(age_expr: &str, min_keep: &str) -> Result<Self> {
        let min_keep = min_keep.trim().parse::<usize>().map_err(|e| {
            ReplError::config(format!("invalid retention count '{}': {}", min_keep, e))
        })?;
        Ok(Self {
            age_limit: parse_age_limit(age_expr)?,
            min_keep,
        })
    }
}

/// Snapshots `rule` would evict at `now_ms`, oldest first.
///
/// Never selects so many that fewer than `min_keep` would remain.
pub fn plan_eviction(
    snapshots: &[SnapshotEntry],
    rule: &RetentionRule,
    now_ms: u64,
) -> Vec<SnapshotEntry> {
    if snapshots.len() <= rule.min_keep {
        return Vec::new();
    }
    let cutoff = now_ms.saturating_sub(rule.age_limit.as_millis() as u64);
    let mut sorted = snapshots.to_vec();
    sorted.sort_by(|a, b| {
        a.created_at_ms
            .cmp(&b.created_at_ms)
            .then_with(|| a.name.cmp(&b.name))
    });
    let evictable = sorted.len() - rule.min_keep;
    sorted
        .into_iter()
        .take(evictable)
        .take_while(|s| s.created_at_ms < cutoff)
        .collect()
}

/// Outcome of one eviction pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvictionReport {
    /// Snapshots present before eviction.
    pub examined: usize,
    /// Snapshots deleted.
    pub deleted: Vec<String>,
    /// Snapshots selected but not deleted, with the error.
    pub failed: Vec<(String, String)>,
}

/// Deletes snapshots that fall outside a [`RetentionRule`].
#[derive(Debug, Default, Clone, Copy)]
pub struct RetentionEvictor;

impl RetentionEvictor {
    /// Create an evictor.
    pub fn new() -> Self {
        Self
    }

    /// Evict snapshots of `dir` older than the age limit, keeping at least `min_keep`.
    ///
    /// Temporary snapshots are neither counted nor evicted. A failed individual
    /// delete is logged and the pass continues.
    pub async fn evict(
        &self,
        fs: &dyn FileSystem,
        dir: &str,
        rule: &RetentionRule,
        now_ms: u64,
    ) -> Result<EvictionReport> {
        let snapshots: Vec<SnapshotEntry> = fs
            .list_snapshots(dir)
            .await?
            .into_iter()
            .filter(|s| !is_temporary(&s.name))
            .collect();
        let mut report = EvictionReport {
            examined: snapshots.len(),
            ..Default::default()
        };

        let victims = plan_eviction(&snapshots, rule, now_ms);
        debug!(dir, examined = report.examined, selected = victims.len(), "Planned eviction");

        for victim in victims {
            match fs.delete_snapshot(dir, &victim.name).await {
                Ok(()) => report.deleted.push(victim.name),
                Err(e) => {
                    warn!(dir, snapshot = %victim.name, error = %e, "Failed to evict snapshot");
                    report.failed.push((victim.name, e.to_string()));
                }
            }
        }
        if !report.deleted.is_empty() {
            info!(dir, deleted = report.deleted.len(), "Evicted snapshots");
        }
        Ok(report)
    }
}
