//! Staging URI resolution and remote ("HCFS") location classification.

use crate::error::{ReplError, Result};
use serde::{Deserialize, Serialize};
use url::Url;

/// Reserved namespace that exposes encrypted bytes without decryption.
pub const RAW_NAMESPACE_PATH: &str = "/.reserved/raw";

/// Schemes served by the managed, snapshot-capable filesystem.
const LOCAL_SCHEMES: [&str; 6] = ["file", "hdfs", "hftp", "hsftp", "webhdfs", "swebhdfs"];

/// True when `path` lives outside the managed filesystem (e.g. `s3a://`, `wasb://`).
///
/// Schemeless paths are local.
pub fn is_hcfs(path: &str) -> bool {
    match Url::parse(path.trim()) {
        Ok(url) => !LOCAL_SCHEMES.contains(&url.scheme().to_ascii_lowercase().as_str()),
        Err(_) => false,
    }
}

/// Resolve the fully qualified path handed to the copy engine.
///
/// Remote datasets and datasets that already carry an authority are used verbatim;
/// anything else is qualified with the cluster's filesystem endpoint.
pub fn staging_uri(endpoint: &str, dataset: &str) -> Result<String> {
    let dataset = dataset.trim();
    if dataset.is_empty() {
        return Err(ReplError::config("dataset path is empty"));
    }
    if is_hcfs(dataset) {
        return Ok(dataset.to_string());
    }
    if let Ok(url) = Url::parse(dataset) {
        if url.has_host() {
            return Ok(dataset.to_string());
        }
    }
    let endpoint = endpoint.trim();
    if endpoint.is_empty() {
        return Err(ReplError::config(format!(
            "no filesystem endpoint to qualify {}",
            dataset
        )));
    }
    Ok(format!(
        "{}/{}",
        endpoint.trim_end_matches('/'),
        dataset.trim_start_matches('/')
    ))
}

/// Path component of a URI with scheme and authority removed and no trailing slash.
pub fn path_of(uri: &str) -> String {
    let raw = match Url::parse(uri.trim()) {
        Ok(url) => url.path().to_string(),
        Err(_) => uri.trim().to_string(),
    };
    normalize(&raw)
}

/// `scheme://authority` of a URI, or `None` for schemeless paths.
pub fn authority_of(uri: &str) -> Option<String> {
    let url = Url::parse(uri.trim()).ok()?;
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
        None => format!("{}://{}", url.scheme(), host),
    })
}

/// Collapse duplicate slashes and drop a trailing slash (root stays `/`).
pub fn normalize(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    format!("/{}", parts.join("/"))
}

/// The fully qualified source and target paths for one instance.
///
/// Computed once in `init`; never changes for the lifetime of a job context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingPair {
    /// Source staging URI.
    pub source: String,
    /// Target staging URI.
    pub target: String,
}

impl StagingPair {
    /// Resolve both ends; `raw_namespace` prefixes local datasets with [`RAW_NAMESPACE_PATH`].
    pub fn resolve(
        source_endpoint: &str,
        source_dataset: &str,
        target_endpoint: &str,
        target_dataset: &str,
        raw_namespace: bool,
    ) -> Result<Self> {
        let prefix = |dataset: &str| {
            if raw_namespace && !is_hcfs(dataset) && Url::parse(dataset).is_err() {
                format!("{}{}", RAW_NAMESPACE_PATH, dataset)
            } else {
                dataset.to_string()
            }
        };
        Ok(Self {
            source: staging_uri(source_endpoint, &prefix(source_dataset))?,
            target: staging_uri(target_endpoint, &prefix(target_dataset))?,
        })
    }

    /// Either end is a remote location.
    pub fn involves_hcfs(&self) -> bool {
        is_hcfs(&self.source) || is_hcfs(&self.target)
    }
}
