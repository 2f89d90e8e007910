// Per-session file layout and lifecycle.
//
//   {data_root}/tmp_sessions/{token}/{request}/input_{i}.png   removed when the request ends
//   {data_root}/colorizedImages/{token}/colorized_{n}.png      kept until reaped

use crate::worker_pool::WorkerPool;
use serde::Serialize;
use std::collections::HashMap;
use std::io;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub const TEMP_DIR_NAME: &str = "tmp_sessions";
pub const RESULTS_DIR_NAME: &str = "colorizedImages";
const RESULT_PREFIX: &str = "colorized_";
const RESULT_SUFFIX: &str = ".png";
const MAX_TOKEN_LEN: usize = 128;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid session token")]
    InvalidToken,
    #[error("invalid result file name")]
    InvalidFileName,
    #[error("session not found")]
    NotFound,
    #[error("session storage error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPaths {
    pub token: String,
    pub temp_dir: PathBuf,
    pub results_dir: PathBuf,
}

impl SessionPaths {
    pub fn result_path(&self, index: u64) -> PathBuf {
        self.results_dir.join(result_file_name(index))
    }
}

pub fn result_file_name(index: u64) -> String {
    format!("{}{}{}", RESULT_PREFIX, index, RESULT_SUFFIX)
}

/// Index carried by a `colorized_{n}.png` name.
pub fn parse_result_index(file_name: &str) -> Option<u64> {
    let digits = file_name
        .strip_prefix(RESULT_PREFIX)?
        .strip_suffix(RESULT_SUFFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

pub fn validate_token(token: &str) -> Result<(), SessionError> {
    let valid = !token.is_empty()
        && token.len() <= MAX_TOKEN_LEN
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if valid {
        Ok(())
    } else {
        Err(SessionError::InvalidToken)
    }
}

fn validate_file_name(name: &str) -> Result<(), SessionError> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && !name.contains(['/', '\\'])
        && Path::new(name).file_name().is_some_and(|n| n == name);
    if valid {
        Ok(())
    } else {
        Err(SessionError::InvalidFileName)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResultEntry {
    pub filename: String,
    pub size: u64,
    /// Modification time, seconds since the unix epoch.
    pub created: f64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    pub removed: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct SessionStore {
    temp_root: PathBuf,
    results_root: PathBuf,
    // Next free index per session, so concurrent batches never share one.
    high_water: Arc<Mutex<HashMap<String, u64>>>,
}

impl SessionStore {
    /// Creates both roots under `data_root` if they do not exist yet.
    pub fn open(data_root: impl AsRef<Path>) -> io::Result<Self> {
        let data_root = data_root.as_ref();
        let store = Self {
            temp_root: data_root.join(TEMP_DIR_NAME),
            results_root: data_root.join(RESULTS_DIR_NAME),
            high_water: Arc::new(Mutex::new(HashMap::new())),
        };
        std::fs::create_dir_all(&store.temp_root)?;
        std::fs::create_dir_all(&store.results_root)?;
        Ok(store)
    }

    pub fn temp_root(&self) -> &Path {
        &self.temp_root
    }

    pub fn results_root(&self) -> &Path {
        &self.results_root
    }

    /// Paths for `token`, or for a fresh token when none is given. Creates nothing.
    pub fn paths(&self, token: Option<&str>) -> Result<SessionPaths, SessionError> {
        let token = match token.filter(|t| !t.is_empty()) {
            Some(token) => {
                validate_token(token)?;
                token.to_string()
            }
            None => Uuid::new_v4().to_string(),
        };
        Ok(SessionPaths {
            temp_dir: self.temp_root.join(&token),
            results_dir: self.results_root.join(&token),
            token,
        })
    }

    /// Resolves the session paths and creates the results directory.
    pub async fn allocate(&self, token: Option<&str>) -> Result<SessionPaths, SessionError> {
        let paths = self.paths(token)?;
        tokio::fs::create_dir_all(&paths.results_dir).await?;
        Ok(paths)
    }

    /// Creates a staging directory under the session's temp dir that belongs to one request.
    /// The returned guard removes it, and the session's temp dir once that is empty.
    pub async fn stage(&self, paths: &SessionPaths) -> Result<TempDirGuard, SessionError> {
        let dir = paths.temp_dir.join(Uuid::new_v4().simple().to_string());
        let mut attempts = 0;
        loop {
            match tokio::fs::create_dir_all(&dir).await {
                Ok(()) => break,
                // Another request's guard pruned the session dir mid-create.
                Err(err) if err.kind() == io::ErrorKind::NotFound && attempts < 3 => attempts += 1,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(TempDirGuard {
            path: dir,
            prune_parent: true,
        })
    }

    /// One past the largest result index on disk, 0 for an empty session.
    pub fn next_result_index(&self, paths: &SessionPaths) -> io::Result<u64> {
        let entries = match std::fs::read_dir(&paths.results_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err),
        };

        let mut next = 0;
        for entry in entries {
            let entry = entry?;
            if let Some(index) = entry.file_name().to_str().and_then(parse_result_index) {
                next = next.max(index + 1);
            }
        }
        Ok(next)
    }

    /// Reserves `count` consecutive indices for a batch before it is dispatched.
    pub fn reserve_indices(&self, paths: &SessionPaths, count: u64) -> io::Result<Range<u64>> {
        let mut high_water = self.high_water.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Session index lock was poisoned, recovering");
            poisoned.into_inner()
        });
        // Scanning under the lock keeps scan-then-reserve atomic within the process.
        let on_disk = self.next_result_index(paths)?;
        let start = on_disk.max(high_water.get(&paths.token).copied().unwrap_or(0));
        high_water.insert(paths.token.clone(), start + count);
        Ok(start..start + count)
    }

    pub async fn list_results(&self, token: &str) -> Result<Vec<ResultEntry>, SessionError> {
        validate_token(token)?;
        let dir = self.results_root.join(token);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Err(SessionError::NotFound),
            Err(err) => return Err(err.into()),
        };

        let mut results = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !name.ends_with(RESULT_SUFFIX) {
                continue;
            }
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            results.push(ResultEntry {
                filename: name,
                size: metadata.len(),
                created: metadata
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_secs_f64())
                    .unwrap_or_default(),
            });
        }
        results.sort_by_key(|entry| parse_result_index(&entry.filename).unwrap_or(u64::MAX));
        Ok(results)
    }

    /// Path of an existing result file.
    pub async fn result_file(&self, token: &str, file_name: &str) -> Result<PathBuf, SessionError> {
        validate_token(token)?;
        validate_file_name(file_name)?;
        let path = self.results_root.join(token).join(file_name);
        match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => Ok(path),
            Ok(_) => Err(SessionError::NotFound),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(SessionError::NotFound),
            Err(err) => Err(err.into()),
        }
    }

    /// Removes session directories (temp and results) at least `max_age` old.
    /// Blocking; run it on the worker pool.
    pub fn reap_older_than(&self, max_age: Duration) -> ReapReport {
        self.reap_with(max_age, |path| std::fs::remove_dir_all(path))
    }

    fn reap_with<F>(&self, max_age: Duration, remove: F) -> ReapReport
    where
        F: Fn(&Path) -> io::Result<()>,
    {
        let now = SystemTime::now();
        let report = [&self.temp_root, &self.results_root]
            .into_iter()
            .flat_map(|root| stale_session_dirs(root, now, max_age))
            .fold(ReapReport::default(), |mut report, dir| {
                match remove(&dir) {
                    Ok(()) => report.removed += 1,
                    Err(err) => {
                        tracing::warn!("Failed to remove session directory {}: {}", dir.display(), err);
                        report.failed += 1;
                    }
                }
                report
            });

        if report.removed > 0 {
            self.forget_missing_sessions();
        }
        report
    }

    fn forget_missing_sessions(&self) {
        let mut high_water = self.high_water.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        high_water.retain(|token, _| self.results_root.join(token).is_dir());
    }
}

fn stale_session_dirs(root: &Path, now: SystemTime, max_age: Duration) -> Vec<PathBuf> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(err) => {
            tracing::warn!("Cannot scan {}: {}", root.display(), err);
            return Vec::new();
        }
    };

    entries
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_ok_and(|t| t.is_dir()))
        .filter(|entry| {
            entry
                .metadata()
                .and_then(|m| m.modified())
                .map(|modified| now.duration_since(modified).unwrap_or_default() >= max_age)
                .unwrap_or(false)
        })
        .map(|entry| entry.path())
        .collect()
}

/// Runs [`SessionStore::reap_older_than`] on the worker pool every `interval`.
pub fn spawn_reaper(
    store: SessionStore,
    workers: WorkerPool,
    interval: Duration,
    max_age: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let store = store.clone();
            match workers.run(move || store.reap_older_than(max_age)).await {
                Ok(report) if report.removed > 0 || report.failed > 0 => tracing::info!(
                    removed = report.removed,
                    failed = report.failed,
                    "Reaped expired sessions"
                ),
                Ok(_) => {}
                Err(err) => {
                    tracing::info!("Session reaper stopping: {}", err);
                    break;
                }
            }
        }
    })
}

/// Removes a request's temporary input directory when dropped, on every exit path.
pub struct TempDirGuard {
    path: PathBuf,
    prune_parent: bool,
}

impl TempDirGuard {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            prune_parent: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn input_path(&self, item: usize) -> PathBuf {
        self.path.join(format!("input_{}.png", item))
    }
}

impl Drop for TempDirGuard {
    fn drop(&mut self) {
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => tracing::debug!("Removed temporary directory {}", self.path.display()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => tracing::warn!(
                "Failed to remove temporary directory {}: {}",
                self.path.display(),
                err
            ),
        }

        if self.prune_parent {
            if let Some(parent) = self.path.parent() {
                // Fails while other requests of the session are still staging.
                if std::fs::remove_dir(parent).is_ok() {
                    tracing::debug!("Removed empty session directory {}", parent.display());
                }
            }
        }
    }
}
