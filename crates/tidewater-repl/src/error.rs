//! Error types for the replication subsystem.

use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplError>;

/// Errors that can occur while executing or recovering a replication instance.
#[derive(Debug, Error)]
pub enum ReplError {
    /// A policy property or engine setting is missing or malformed.
    #[error("configuration error: {msg}")]
    Config {
        /// Error message describing the bad setting.
        msg: String,
    },

    /// A policy or cluster is absent or retired.
    #[error("{entity} not found: {name}")]
    NotFound {
        /// Kind of record that was looked up ("policy", "cluster").
        entity: &'static str,
        /// Name that was looked up.
        name: String,
    },

    /// A dataset path does not exist on its filesystem.
    #[error("path does not exist: {path}")]
    PathMissing {
        /// The missing path.
        path: String,
    },

    /// Filesystem call failed or the filesystem is unreachable.
    #[error("filesystem error on {endpoint}: {msg}")]
    FileSystem {
        /// Filesystem endpoint the call was issued against.
        endpoint: String,
        /// Error message.
        msg: String,
    },

    /// The copy engine reported a failed job or rejected a request.
    #[error("copy engine error: {msg}")]
    Engine {
        /// Engine job identifier, when one was assigned.
        job_id: Option<String>,
        /// Error message reported by the engine.
        msg: String,
    },

    /// The copy engine could not be reached for status.
    #[error("copy engine unreachable: {msg}")]
    EngineUnreachable {
        /// Error message.
        msg: String,
    },

    /// Snapshot create/delete/rename/diff failed.
    #[error("snapshot error on {dir} ({snapshot}): {msg}")]
    SnapshotProtocol {
        /// Snapshottable directory.
        dir: String,
        /// Snapshot name involved.
        snapshot: String,
        /// Error message.
        msg: String,
    },

    /// Execution was cancelled while a copy was in flight.
    #[error("replication interrupted for instance {instance_id}")]
    Interrupted {
        /// Instance that was interrupted.
        instance_id: String,
    },

    /// Optimistic version check failed on a store update.
    #[error("version conflict on {key}: expected {expected}, found {found}")]
    VersionConflict {
        /// Record key.
        key: String,
        /// Version the caller read.
        expected: u64,
        /// Version currently stored.
        found: u64,
    },

    /// JSON serialization/deserialization error.
    #[error("serialization error")]
    Serialization(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of a [`ReplError`], used for reporting and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad or missing configuration; never retried.
    Configuration,
    /// Missing path or unreachable filesystem; terminal for the instance.
    Resource,
    /// The copy engine failed.
    Engine,
    /// External cancellation.
    Interruption,
    /// Snapshot protocol failure.
    Snapshot,
    /// Persistence boundary failure.
    Store,
}

impl ReplError {
    /// Build a [`ReplError::Config`] from anything printable.
    pub fn config(msg: impl Into<String>) -> Self {
        ReplError::Config { msg: msg.into() }
    }

    /// Build a [`ReplError::FileSystem`].
    pub fn fs(endpoint: impl Into<String>, msg: impl Into<String>) -> Self {
        ReplError::FileSystem {
            endpoint: endpoint.into(),
            msg: msg.into(),
        }
    }

    /// Build a [`ReplError::SnapshotProtocol`].
    pub fn snapshot(dir: impl Into<String>, snapshot: impl Into<String>, msg: impl Into<String>) -> Self {
        ReplError::SnapshotProtocol {
            dir: dir.into(),
            snapshot: snapshot.into(),
            msg: msg.into(),
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReplError::Config { .. } => ErrorKind::Configuration,
            ReplError::NotFound { .. } | ReplError::PathMissing { .. } | ReplError::FileSystem { .. } => {
                ErrorKind::Resource
            }
            ReplError::Engine { .. } | ReplError::EngineUnreachable { .. } => ErrorKind::Engine,
            ReplError::Interrupted { .. } => ErrorKind::Interruption,
            ReplError::SnapshotProtocol { .. } => ErrorKind::Snapshot,
            ReplError::VersionConflict { .. } | ReplError::Serialization(_) | ReplError::Io(_) => {
                ErrorKind::Store
            }
        }
    }

    /// Engine job id carried by this error, if any.
    pub fn job_id(&self) -> Option<&str> {
        match self {
            ReplError::Engine { job_id, .. } => job_id.as_deref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_kind() {
        let err = ReplError::config("distcpMaxMaps: not a number");
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(
            err.to_string(),
            "configuration error: distcpMaxMaps: not a number"
        );
    }

    #[test]
    fn test_resource_kinds() {
        let missing = ReplError::PathMissing {
            path: "/data/a".to_string(),
        };
        assert_eq!(missing.kind(), ErrorKind::Resource);
        assert_eq!(ReplError::fs("hdfs://nn1:8020", "refused").kind(), ErrorKind::Resource);
        let not_found = ReplError::NotFound {
            entity: "policy",
            name: "p1".to_string(),
        };
        assert_eq!(not_found.to_string(), "policy not found: p1");
    }

    #[test]
    fn test_engine_error_carries_job_id() {
        let err = ReplError::Engine {
            job_id: Some("job_1_0001".to_string()),
            msg: "map task failed".to_string(),
        };
        assert_eq!(err.job_id(), Some("job_1_0001"));
        assert_eq!(err.kind(), ErrorKind::Engine);
        assert_eq!(ReplError::config("x").job_id(), None);
    }

    #[test]
    fn test_interrupted_kind() {
        let err = ReplError::Interrupted {
            instance_id: "p1@3".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Interruption);
    }

    #[test]
    fn test_snapshot_error_display() {
        let err = ReplError::snapshot("/data/a", "s1", "already exists");
        assert_eq!(err.to_string(), "snapshot error on /data/a (s1): already exists");
        assert_eq!(err.kind(), ErrorKind::Snapshot);
    }

    #[test]
    fn test_from_json_error() {
        let parse: std::result::Result<u32, _> = serde_json::from_str("{");
        let err: ReplError = parse.unwrap_err().into();
        assert_eq!(err.kind(), ErrorKind::Store);
    }
}
