//! In-process filesystem and copy engine.
//!
//! [`MemFs`] is a snapshot-capable tree of files keyed by absolute path.
//! [`MemCopyEngine`] applies [`CopyOptions`] to filesystems registered with a
//! [`MemFsProvider`], including forward and reverse snapshot diffs, and can be
//! scripted to fail, hang or become unreachable.

use crate::engine::{CopyCounters, CopyEngine, EngineJobState, EngineJobStatus};
use crate::error::{ReplError, Result};
use crate::fs::{DiffEntry, DiffKind, FileSystem, FileSystemProvider, SnapshotEntry};
use crate::options::CopyOptions;
use crate::snapshot::current_time_ms;
use crate::uri;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Files under a directory, keyed by path relative to it.
pub type Tree = BTreeMap<String, Vec<u8>>;

#[derive(Debug, Clone)]
struct SnapshotImage {
    name: String,
    created_at_ms: u64,
    files: Tree,
}

#[derive(Debug, Default)]
struct FsState {
    dirs: BTreeSet<String>,
    files: BTreeMap<String, Vec<u8>>,
    snapshottable: BTreeSet<String>,
    snapshots: BTreeMap<String, Vec<SnapshotImage>>,
    failing_deletes: HashSet<String>,
    last_snapshot_ms: u64,
}

impl FsState {
    fn tree(&self, dir: &str) -> Tree {
        self.files
            .iter()
            .filter_map(|(path, data)| relative(dir, path).map(|rel| (rel, data.clone())))
            .collect()
    }

    fn image(&self, dir: &str, name: &str) -> Option<&SnapshotImage> {
        self.snapshots.get(dir)?.iter().find(|s| s.name == name)
    }

    fn add_dirs(&mut self, path: &str) {
        let mut current = String::new();
        self.dirs.insert("/".to_string());
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current.push('/');
            current.push_str(part);
            self.dirs.insert(current.clone());
        }
    }
}

/// Path of `path` relative to `dir`, or `None` when outside it.
fn relative(dir: &str, path: &str) -> Option<String> {
    if dir == "/" {
        return Some(path.trim_start_matches('/').to_string());
    }
    path.strip_prefix(dir)
        .and_then(|rest| rest.strip_prefix('/'))
        .map(str::to_string)
}

fn join(dir: &str, rel: &str) -> String {
    if dir == "/" {
        format!("/{}", rel)
    } else {
        format!("{}/{}", dir, rel)
    }
}

/// In-memory snapshot-capable filesystem.
#[derive(Debug)]
pub struct MemFs {
    endpoint: String,
    state: Mutex<FsState>,
}

impl MemFs {
    /// Create an empty filesystem served at `endpoint`.
    pub fn new(endpoint: &str) -> Self {
        let mut state = FsState::default();
        state.dirs.insert("/".to_string());
        Self {
            endpoint: endpoint.to_string(),
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FsState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mark `path` snapshottable, creating it if needed.
    pub fn allow_snapshot(&self, path: &str) {
        let path = uri::path_of(path);
        let mut state = self.lock();
        state.add_dirs(&path);
        state.snapshottable.insert(path);
    }

    /// Write a file, creating parent directories.
    pub fn write_file(&self, path: &str, data: &[u8]) {
        let path = uri::path_of(path);
        let mut state = self.lock();
        if let Some((parent, _)) = path.rsplit_once('/') {
            state.add_dirs(parent);
        }
        state.files.insert(path, data.to_vec());
    }

    /// Remove a file; returns whether it existed.
    pub fn remove_file(&self, path: &str) -> bool {
        self.lock().files.remove(&uri::path_of(path)).is_some()
    }

    /// Contents of a file.
    pub fn read_file(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().files.get(&uri::path_of(path)).cloned()
    }

    /// Every file under `dir`, keyed by relative path.
    pub fn tree(&self, dir: &str) -> Tree {
        self.lock().tree(&uri::path_of(dir))
    }

    /// Replace every file under `dir` with `files`.
    pub fn replace_tree(&self, dir: &str, files: &Tree) {
        let dir = uri::path_of(dir);
        let mut state = self.lock();
        state.files.retain(|path, _| relative(&dir, path).is_none());
        for (rel, data) in files {
            let path = join(&dir, rel);
            if let Some((parent, _)) = path.rsplit_once('/') {
                state.add_dirs(parent);
            }
            state.files.insert(path, data.clone());
        }
    }

    /// Contents of `path` as captured by snapshot `name` of `dir`.
    pub fn snapshot_file(&self, dir: &str, name: &str, path: &str) -> Option<Vec<u8>> {
        let dir = uri::path_of(dir);
        let rel = relative(&dir, &uri::path_of(path))?;
        self.lock().image(&dir, name)?.files.get(&rel).cloned()
    }

    /// Files captured by snapshot `name` of `dir`.
    pub fn snapshot_tree(&self, dir: &str, name: &str) -> Option<Tree> {
        let dir = uri::path_of(dir);
        self.lock().image(&dir, name).map(|s| s.files.clone())
    }

    /// Snapshot names of `dir`, oldest first.
    pub fn snapshot_names(&self, dir: &str) -> Vec<String> {
        let dir = uri::path_of(dir);
        let state = self.lock();
        let mut snaps: Vec<&SnapshotImage> = state
            .snapshots
            .get(&dir)
            .map(|v| v.iter().collect())
            .unwrap_or_default();
        snaps.sort_by_key(|s| s.created_at_ms);
        snaps.iter().map(|s| s.name.clone()).collect()
    }

    /// Backdate or postdate a snapshot.
    pub fn set_snapshot_time(&self, dir: &str, name: &str, created_at_ms: u64) {
        let dir = uri::path_of(dir);
        let mut state = self.lock();
        if let Some(snap) = state
            .snapshots
            .get_mut(&dir)
            .and_then(|v| v.iter_mut().find(|s| s.name == name))
        {
            snap.created_at_ms = created_at_ms;
        }
    }

    /// Make every delete of snapshot `name` fail.
    pub fn fail_snapshot_delete(&self, name: &str) {
        self.lock().failing_deletes.insert(name.to_string());
    }
}

#[async_trait]
impl FileSystem for MemFs {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let path = uri::path_of(path);
        let state = self.lock();
        Ok(state.dirs.contains(&path) || state.files.contains_key(&path))
    }

    async fn mkdirs(&self, path: &str) -> Result<()> {
        self.lock().add_dirs(&uri::path_of(path));
        Ok(())
    }

    async fn snapshottable_dirs(&self) -> Result<Vec<String>> {
        Ok(self.lock().snapshottable.iter().cloned().collect())
    }

    async fn list_snapshots(&self, dir: &str) -> Result<Vec<SnapshotEntry>> {
        let dir = uri::path_of(dir);
        let state = self.lock();
        if !state.dirs.contains(&dir) {
            return Err(ReplError::fs(&self.endpoint, format!("no such directory: {}", dir)));
        }
        Ok(state
            .snapshots
            .get(&dir)
            .map(|v| {
                v.iter()
                    .map(|s| SnapshotEntry {
                        name: s.name.clone(),
                        created_at_ms: s.created_at_ms,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn create_snapshot(&self, dir: &str, name: &str) -> Result<()> {
        let dir = uri::path_of(dir);
        let mut state = self.lock();
        if !state.snapshottable.contains(&dir) {
            return Err(ReplError::snapshot(&dir, name, "directory is not snapshottable"));
        }
        if state.image(&dir, name).is_some() {
            return Err(ReplError::snapshot(&dir, name, "snapshot already exists"));
        }
        let created_at_ms = current_time_ms().max(state.last_snapshot_ms + 1);
        state.last_snapshot_ms = created_at_ms;
        let files = state.tree(&dir);
        state.snapshots.entry(dir).or_default().push(SnapshotImage {
            name: name.to_string(),
            created_at_ms,
            files,
        });
        Ok(())
    }

    async fn delete_snapshot(&self, dir: &str, name: &str) -> Result<()> {
        let dir = uri::path_of(dir);
        let mut state = self.lock();
        if state.failing_deletes.contains(name) {
            return Err(ReplError::snapshot(&dir, name, "delete rejected"));
        }
        let snaps = state.snapshots.entry(dir.clone()).or_default();
        let before = snaps.len();
        snaps.retain(|s| s.name != name);
        if snaps.len() == before {
            return Err(ReplError::snapshot(&dir, name, "no such snapshot"));
        }
        Ok(())
    }

    async fn rename_snapshot(&self, dir: &str, from: &str, to: &str) -> Result<()> {
        let dir = uri::path_of(dir);
        let mut state = self.lock();
        if state.image(&dir, to).is_some() {
            return Err(ReplError::snapshot(&dir, to, "snapshot already exists"));
        }
        let snap = state
            .snapshots
            .get_mut(&dir)
            .and_then(|v| v.iter_mut().find(|s| s.name == from))
            .ok_or_else(|| ReplError::snapshot(&dir, from, "no such snapshot"))?;
        snap.name = to.to_string();
        Ok(())
    }

    async fn snapshot_diff(&self, dir: &str, from: &str, to: &str) -> Result<Vec<DiffEntry>> {
        let dir = uri::path_of(dir);
        let state = self.lock();
        let before = state
            .image(&dir, from)
            .ok_or_else(|| ReplError::snapshot(&dir, from, "no such snapshot"))?;
        let after = state
            .image(&dir, to)
            .ok_or_else(|| ReplError::snapshot(&dir, to, "no such snapshot"))?;
        Ok(tree_diff(&before.files, &after.files))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

fn tree_diff(before: &Tree, after: &Tree) -> Vec<DiffEntry> {
    let mut entries = Vec::new();
    for (path, data) in after {
        match before.get(path) {
            None => entries.push(DiffEntry {
                kind: DiffKind::Create,
                path: path.clone(),
            }),
            Some(old) if old != data => entries.push(DiffEntry {
                kind: DiffKind::Modify,
                path: path.clone(),
            }),
            Some(_) => {}
        }
    }
    for path in before.keys().filter(|p| !after.contains_key(*p)) {
        entries.push(DiffEntry {
            kind: DiffKind::Delete,
            path: path.clone(),
        });
    }
    entries
}

/// A closable handle onto a shared [`MemFs`].
struct MemFsHandle {
    fs: Arc<MemFs>,
    closed: AtomicBool,
    open_handles: Arc<AtomicUsize>,
}

impl MemFsHandle {
    fn check(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ReplError::fs(self.fs.endpoint(), "handle is closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl FileSystem for MemFsHandle {
    fn endpoint(&self) -> &str {
        self.fs.endpoint()
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.check()?;
        self.fs.exists(path).await
    }

    async fn mkdirs(&self, path: &str) -> Result<()> {
        self.check()?;
        self.fs.mkdirs(path).await
    }

    async fn snapshottable_dirs(&self) -> Result<Vec<String>> {
        self.check()?;
        self.fs.snapshottable_dirs().await
    }

    async fn list_snapshots(&self, dir: &str) -> Result<Vec<SnapshotEntry>> {
        self.check()?;
        self.fs.list_snapshots(dir).await
    }

    async fn create_snapshot(&self, dir: &str, name: &str) -> Result<()> {
        self.check()?;
        self.fs.create_snapshot(dir, name).await
    }

    async fn delete_snapshot(&self, dir: &str, name: &str) -> Result<()> {
        self.check()?;
        self.fs.delete_snapshot(dir, name).await
    }

    async fn rename_snapshot(&self, dir: &str, from: &str, to: &str) -> Result<()> {
        self.check()?;
        self.fs.rename_snapshot(dir, from, to).await
    }

    async fn snapshot_diff(&self, dir: &str, from: &str, to: &str) -> Result<Vec<DiffEntry>> {
        self.check()?;
        self.fs.snapshot_diff(dir, from, to).await
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.open_handles.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Registry of in-memory filesystems keyed by `scheme://authority`.
#[derive(Debug, Default)]
pub struct MemFsProvider {
    filesystems: DashMap<String, Arc<MemFs>>,
    open_handles: Arc<AtomicUsize>,
}

impl MemFsProvider {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn key(endpoint: &str) -> String {
        uri::authority_of(endpoint).unwrap_or_else(|| endpoint.trim().to_string())
    }

    /// Register (or return the existing) filesystem for `endpoint`.
    pub fn register(&self, endpoint: &str) -> Arc<MemFs> {
        let key = Self::key(endpoint);
        self.filesystems
            .entry(key.clone())
            .or_insert_with(|| Arc::new(MemFs::new(&key)))
            .clone()
    }

    /// Filesystem serving `uri`, if registered.
    pub fn get(&self, uri: &str) -> Option<Arc<MemFs>> {
        self.filesystems.get(&Self::key(uri)).map(|fs| fs.clone())
    }

    /// Handles opened and not yet closed.
    pub fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FileSystemProvider for MemFsProvider {
    async fn open(
        &self,
        endpoint: &str,
        _conf: &BTreeMap<String, String>,
    ) -> Result<Arc<dyn FileSystem>> {
        let fs = self
            .get(endpoint)
            .ok_or_else(|| ReplError::fs(endpoint, "filesystem unreachable"))?;
        self.open_handles.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemFsHandle {
            fs,
            closed: AtomicBool::new(false),
            open_handles: Arc::clone(&self.open_handles),
        }))
    }
}

/// How newly submitted jobs behave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyBehavior {
    /// Apply the copy immediately and succeed.
    Succeed,
    /// Fail immediately without touching the target.
    Fail(String),
    /// Stay running until completed, failed or killed by hand.
    Hang,
}

#[derive(Debug, Clone)]
struct SimJob {
    options: CopyOptions,
    state: EngineJobState,
    message: Option<String>,
    counters: CopyCounters,
}

/// Copy engine working on [`MemFs`] filesystems.
#[derive(Debug)]
pub struct MemCopyEngine {
    filesystems: Option<Arc<MemFsProvider>>,
    jobs: DashMap<String, SimJob>,
    next_id: AtomicU64,
    behavior: Mutex<CopyBehavior>,
    reachable: AtomicBool,
    status_calls: AtomicUsize,
    submissions: Mutex<Vec<CopyOptions>>,
}

impl Default for MemCopyEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemCopyEngine {
    /// Engine that records jobs but moves no data.
    pub fn new() -> Self {
        Self {
            filesystems: None,
            jobs: DashMap::new(),
            next_id: AtomicU64::new(1),
            behavior: Mutex::new(CopyBehavior::Succeed),
            reachable: AtomicBool::new(true),
            status_calls: AtomicUsize::new(0),
            submissions: Mutex::new(Vec::new()),
        }
    }

    /// Engine copying between filesystems registered with `provider`.
    pub fn with_filesystems(provider: Arc<MemFsProvider>) -> Self {
        Self {
            filesystems: Some(provider),
            ..Self::new()
        }
    }

    /// Behavior of subsequent submissions.
    pub fn set_behavior(&self, behavior: CopyBehavior) {
        *self.behavior.lock().unwrap_or_else(|e| e.into_inner()) = behavior;
    }

    /// Make every call fail with [`ReplError::EngineUnreachable`] while `false`.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Number of `status` calls served.
    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    /// Options of every submission, oldest first.
    pub fn submissions(&self) -> Vec<CopyOptions> {
        self.submissions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Current state of a job.
    pub fn job_state(&self, job_id: &str) -> Option<EngineJobState> {
        self.jobs.get(job_id).map(|j| j.state)
    }

    /// Override a job's progress counters.
    pub fn set_counters(&self, job_id: &str, files: u64, bytes: u64) {
        if let Some(mut job) = self.jobs.get_mut(job_id) {
            job.counters.files_copied = files;
            job.counters.bytes_copied = bytes;
        }
    }

    /// Finish a hanging job by applying its copy.
    pub fn complete(&self, job_id: &str) -> Result<()> {
        let options = self
            .jobs
            .get(job_id)
            .map(|j| j.options.clone())
            .ok_or_else(|| unknown_job(job_id))?;
        let applied = self.apply(&options);
        if let Some(mut job) = self.jobs.get_mut(job_id) {
            match applied {
                Ok(counters) => {
                    job.state = EngineJobState::Succeeded;
                    job.counters = counters;
                }
                Err(e) => {
                    job.state = EngineJobState::Failed;
                    job.message = Some(e.to_string());
                }
            }
        }
        Ok(())
    }

    /// Apply only part of a hanging job's copy: the first `files` changed files.
    pub fn partially_apply(&self, job_id: &str, files: usize) -> Result<()> {
        let options = self
            .jobs
            .get(job_id)
            .map(|j| j.options.clone())
            .ok_or_else(|| unknown_job(job_id))?;
        self.apply_limited(&options, Some(files)).map(|_| ())
    }

    /// Fail a job with `message`.
    pub fn fail_job(&self, job_id: &str, message: &str) {
        if let Some(mut job) = self.jobs.get_mut(job_id) {
            job.state = EngineJobState::Failed;
            job.message = Some(message.to_string());
        }
    }

    /// Drop every trace of a job, as if the engine lost its history.
    pub fn forget(&self, job_id: &str) {
        self.jobs.remove(job_id);
    }

    fn check_reachable(&self) -> Result<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ReplError::EngineUnreachable {
                msg: "simulated engine is offline".to_string(),
            })
        }
    }

    fn resolve(&self, path: &str) -> Result<Arc<MemFs>> {
        self.filesystems
            .as_ref()
            .and_then(|p| p.get(path))
            .ok_or_else(|| ReplError::Engine {
                job_id: None,
                msg: format!("no filesystem serves {}", path),
            })
    }

    fn apply(&self, options: &CopyOptions) -> Result<CopyCounters> {
        self.apply_limited(options, None)
    }

    fn apply_limited(&self, options: &CopyOptions, limit: Option<usize>) -> Result<CopyCounters> {
        if self.filesystems.is_none() {
            return Ok(CopyCounters::default());
        }
        let target_fs = self.resolve(&options.target_path)?;
        let target_dir = uri::path_of(&options.target_path);
        let current = target_fs.tree(&target_dir);

        let desired = match &options.snapshot_diff {
            Some(diff) if diff.reverse => {
                let from = snapshot_tree(&target_fs, &target_dir, &diff.from)?;
                if current != from {
                    return Err(engine_error(format!(
                        "target changed since snapshot {}",
                        diff.from
                    )));
                }
                snapshot_tree(&target_fs, &target_dir, &diff.to)?
            }
            Some(diff) => {
                let source = options
                    .source_paths
                    .first()
                    .ok_or_else(|| engine_error("no source path".to_string()))?;
                let source_fs = self.resolve(source)?;
                let source_dir = uri::path_of(source);
                let before = snapshot_tree(&source_fs, &source_dir, &diff.from)?;
                let after = snapshot_tree(&source_fs, &source_dir, &diff.to)?;
                let target_base = snapshot_tree(&target_fs, &target_dir, &diff.from)?;
                if current != target_base {
                    return Err(engine_error(format!(
                        "target has been modified since snapshot {}",
                        diff.from
                    )));
                }
                let mut desired = current.clone();
                for entry in tree_diff(&before, &after) {
                    match entry.kind {
                        DiffKind::Delete => {
                            desired.remove(&entry.path);
                        }
                        DiffKind::Create | DiffKind::Modify => {
                            if let Some(data) = after.get(&entry.path) {
                                desired.insert(entry.path, data.clone());
                            }
                        }
                    }
                }
                desired
            }
            None => {
                let mut sources = Tree::new();
                for source in &options.source_paths {
                    let source_fs = self.resolve(source)?;
                    sources.extend(source_fs.tree(&uri::path_of(source)));
                }
                let mut desired = current.clone();
                for (path, data) in &sources {
                    if options.overwrite || current.get(path) != Some(data) {
                        desired.insert(path.clone(), data.clone());
                    }
                }
                if options.delete_missing {
                    desired.retain(|path, _| sources.contains_key(path));
                }
                desired
            }
        };

        let mut changes = tree_diff(&current, &desired);
        if options.overwrite && options.snapshot_diff.is_none() {
            // overwrite rewrites unchanged files as well
            for path in desired.keys() {
                if current.contains_key(path) && !changes.iter().any(|c| &c.path == path) {
                    changes.push(DiffEntry {
                        kind: DiffKind::Modify,
                        path: path.clone(),
                    });
                }
            }
        }
        if let Some(limit) = limit {
            changes.truncate(limit);
        }

        let mut next = current;
        let mut counters = CopyCounters::default();
        for change in &changes {
            match change.kind {
                DiffKind::Delete => {
                    next.remove(&change.path);
                }
                DiffKind::Create | DiffKind::Modify => {
                    if let Some(data) = desired.get(&change.path) {
                        counters.files_copied += 1;
                        counters.bytes_copied += data.len() as u64;
                        next.insert(change.path.clone(), data.clone());
                    }
                }
            }
        }
        target_fs.replace_tree(&target_dir, &next);
        counters.total = changes.len() as u64;
        counters.completed = counters.total;
        debug!(target = %options.target_path, files = counters.files_copied, bytes = counters.bytes_copied, "Simulated copy applied");
        Ok(counters)
    }
}

fn snapshot_tree(fs: &MemFs, dir: &str, name: &str) -> Result<Tree> {
    fs.snapshot_tree(dir, name)
        .ok_or_else(|| ReplError::snapshot(dir, name, "no such snapshot"))
}

fn engine_error(msg: String) -> ReplError {
    ReplError::Engine { job_id: None, msg }
}

fn unknown_job(job_id: &str) -> ReplError {
    ReplError::Engine {
        job_id: Some(job_id.to_string()),
        msg: "unknown job".to_string(),
    }
}

#[async_trait]
impl CopyEngine for MemCopyEngine {
    async fn submit(&self, options: &CopyOptions) -> Result<String> {
        self.check_reachable()?;
        let job_id = format!("job_sim_{:04}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.submissions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(options.clone());
        let behavior = self
            .behavior
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let mut job = SimJob {
            options: options.clone(),
            state: EngineJobState::Running,
            message: None,
            counters: CopyCounters::default(),
        };
        match behavior {
            CopyBehavior::Succeed => match self.apply(options) {
                Ok(counters) => {
                    job.state = EngineJobState::Succeeded;
                    job.counters = counters;
                }
                Err(e) => {
                    job.state = EngineJobState::Failed;
                    job.message = Some(e.to_string());
                }
            },
            CopyBehavior::Fail(msg) => {
                job.state = EngineJobState::Failed;
                job.message = Some(msg);
            }
            CopyBehavior::Hang => {}
        }
        self.jobs.insert(job_id.clone(), job);
        Ok(job_id)
    }

    async fn status(&self, job_id: &str) -> Result<Option<EngineJobStatus>> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        Ok(self.jobs.get(job_id).map(|j| EngineJobStatus {
            job_id: job_id.to_string(),
            state: j.state,
            message: j.message.clone(),
        }))
    }

    async fn counters(&self, job_id: &str) -> Result<CopyCounters> {
        self.check_reachable()?;
        self.jobs
            .get(job_id)
            .map(|j| j.counters)
            .ok_or_else(|| unknown_job(job_id))
    }

    async fn kill(&self, job_id: &str) -> Result<()> {
        self.check_reachable()?;
        if let Some(mut job) = self.jobs.get_mut(job_id) {
            if job.state.is_active() {
                job.state = EngineJobState::Killed;
            }
        }
        Ok(())
    }
}
