//! Session lockfile registry: cross-process mutual exclusion and discovery.
//!
//! One lock file per (project path, normalized branch) under the logs root.
//! Lock existence plus owner-PID liveness is the entire correctness mechanism;
//! staleness never depends on elapsed time, and a lock whose owner is alive is
//! never reclaimed no matter how old it is. PID liveness checks are racy under
//! PID reuse; that is an accepted limitation of filesystem coordination.
//!
//! Each CLI invocation is a fresh process, so this registry is the sole source
//! of truth for "is a session running" and keeps no in-memory state.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

/// A live (or recorded) session, as persisted in its lock file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActiveSession {
    pub session_name: String,
    /// RFC 3339 start timestamp.
    pub started_at: String,
    /// Owning process.
    pub pid: u32,
    /// Canonicalized project root.
    pub project_path: PathBuf,
    /// Normalized branch; `None` means the default branch / no branch.
    pub branch: Option<String>,
    pub lock_path: PathBuf,
}

/// Acquisition failed because a live session already holds the lock.
#[derive(Debug, Clone)]
pub struct AlreadyRunningError {
    pub existing: ActiveSession,
}

impl fmt::Display for AlreadyRunningError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "session '{}' already running for {} (pid {})",
            self.existing.session_name,
            self.existing.project_path.display(),
            self.existing.pid
        )
    }
}

impl std::error::Error for AlreadyRunningError {}

/// Map the configured default branch to "no branch" for lock identity.
pub fn normalize_branch(branch: Option<&str>, default_branch: &str) -> Option<String> {
    match branch {
        Some(name) if name.is_empty() || name == default_branch => None,
        Some(name) => Some(name.to_string()),
        None => None,
    }
}

/// Deterministic lock file path for a (project, branch) identity.
pub fn lock_path_for(logs_root: &Path, project: &Path, branch: Option<&str>) -> PathBuf {
    let basename = project
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "project".to_string());
    let mut slug = sanitize(&basename, 32);
    if let Some(branch) = branch {
        slug.push('-');
        slug.push_str(&sanitize(branch, 24));
    }
    logs_root.join(format!("{slug}-{}.lock", identity_digest(project, branch)))
}

/// Acquire the exclusive session lock for (project, branch).
///
/// Creation is atomic (`create_new`). If a lock already exists its owner PID
/// decides the outcome: a dead owner means the lock is stale and is reclaimed
/// with exactly one retry; a live owner fails acquisition with
/// [`AlreadyRunningError`]. An unreadable lock is treated as stale, since its
/// writer crashed mid-write.
pub fn acquire(logs_root: &Path, project: &Path, branch: Option<&str>) -> Result<ActiveSession> {
    fs::create_dir_all(logs_root)
        .with_context(|| format!("create logs root {}", logs_root.display()))?;
    let project = fs::canonicalize(project)
        .with_context(|| format!("resolve project path {}", project.display()))?;
    let lock_path = lock_path_for(logs_root, &project, branch);

    if let Some(file) = create_exclusive(&lock_path)? {
        return write_owner(file, &lock_path, project, branch);
    }

    let existing = match read_lock(&lock_path) {
        Ok(session) => Some(session),
        Err(err) => {
            warn!(lock = %lock_path.display(), error = %err, "unreadable lock treated as stale");
            None
        }
    };
    if let Some(existing) = existing {
        if !is_stale(&existing) {
            debug!(
                lock = %lock_path.display(),
                pid = existing.pid,
                "lock held by live session"
            );
            return Err(anyhow::Error::new(AlreadyRunningError { existing }));
        }
        warn!(
            lock = %lock_path.display(),
            pid = existing.pid,
            "reclaiming stale session lock"
        );
    }

    fs::remove_file(&lock_path)
        .with_context(|| format!("remove stale lock {}", lock_path.display()))?;
    match create_exclusive(&lock_path)? {
        Some(file) => write_owner(file, &lock_path, project, branch),
        None => Err(anyhow!(
            "lock {} reappeared while reclaiming",
            lock_path.display()
        )),
    }
}

/// Delete the session's lock file. Idempotent: crash cleanup and normal
/// shutdown may race, so absence is not an error.
pub fn release(session: &ActiveSession) -> Result<()> {
    match fs::remove_file(&session.lock_path) {
        Ok(()) => {
            debug!(lock = %session.lock_path.display(), "session lock released");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => {
            Err(err).with_context(|| format!("remove lock {}", session.lock_path.display()))
        }
    }
}

/// True when the lock's owner process no longer exists.
pub fn is_stale(session: &ActiveSession) -> bool {
    !pid_alive(session.pid)
}

/// Remove the lock if its owner is dead; returns whether it was removed.
pub fn cleanup_stale(session: &ActiveSession) -> Result<bool> {
    if !is_stale(session) {
        return Ok(false);
    }
    release(session)?;
    Ok(true)
}

/// Enumerate live sessions across all projects under the logs root.
///
/// Locks owned by dead processes and unreadable locks are skipped, so callers
/// only ever see genuinely running sessions.
pub fn list_active(logs_root: &Path) -> Result<Vec<ActiveSession>> {
    let mut sessions = Vec::new();
    let entries = match fs::read_dir(logs_root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(sessions),
        Err(err) => {
            return Err(err).with_context(|| format!("read logs root {}", logs_root.display()));
        }
    };
    for entry in entries {
        let entry = entry.with_context(|| format!("read logs root {}", logs_root.display()))?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("lock") {
            continue;
        }
        match read_lock(&path) {
            Ok(mut session) => {
                session.lock_path = path;
                if pid_alive(session.pid) {
                    sessions.push(session);
                }
            }
            Err(err) => warn!(lock = %path.display(), error = %err, "skipping unreadable lock"),
        }
    }
    sessions.sort_by(|a, b| a.session_name.cmp(&b.session_name));
    Ok(sessions)
}

/// Parse one lock file.
pub fn read_lock(path: &Path) -> Result<ActiveSession> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read lock {}", path.display()))?;
    let session =
        serde_json::from_str(&contents).with_context(|| format!("parse lock {}", path.display()))?;
    Ok(session)
}

/// Liveness probe for a recorded owner PID.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    true
}

fn create_exclusive(path: &Path) -> Result<Option<fs::File>> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => Ok(Some(file)),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
        Err(err) => Err(err).with_context(|| format!("create lock {}", path.display())),
    }
}

fn write_owner(
    mut file: fs::File,
    lock_path: &Path,
    project: PathBuf,
    branch: Option<&str>,
) -> Result<ActiveSession> {
    let started = Utc::now();
    let session = ActiveSession {
        session_name: session_name(&project, branch, &started),
        started_at: started.to_rfc3339(),
        pid: std::process::id(),
        project_path: project,
        branch: branch.map(str::to_string),
        lock_path: lock_path.to_path_buf(),
    };
    let mut buf = serde_json::to_string_pretty(&session).context("serialize lock")?;
    buf.push('\n');
    file.write_all(buf.as_bytes())
        .with_context(|| format!("write lock {}", lock_path.display()))?;
    info!(session = %session.session_name, lock = %lock_path.display(), "session lock acquired");
    Ok(session)
}

/// Human-readable, unique-enough session name: slugged project, branch, start time.
fn session_name(project: &Path, branch: Option<&str>, started: &DateTime<Utc>) -> String {
    let basename = project
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "project".to_string());
    let mut name = sanitize(&basename, 32);
    if let Some(branch) = branch {
        name.push('-');
        name.push_str(&sanitize(branch, 24));
    }
    name.push('-');
    name.push_str(&started.format("%Y%m%d-%H%M%S").to_string());
    name
}

fn identity_digest(project: &Path, branch: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(project.to_string_lossy().as_bytes());
    hasher.update([0u8]);
    hasher.update(branch.unwrap_or("").as_bytes());
    hex::encode(&hasher.finalize()[..4])
}

/// Sanitize a string for file names (keep alphanumerics, `-`, `_`; collapse runs).
fn sanitize(s: &str, max_len: usize) -> String {
    let mapped: String = s
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '-',
        })
        .collect();
    let collapsed = mapped
        .split('-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if collapsed.is_empty() {
        return "x".to_string();
    }
    if collapsed.len() <= max_len {
        collapsed
    } else {
        collapsed[..max_len].trim_end_matches('-').to_string()
    }
}
