//! Durable per-session log: one JSON value per line, system entry first.
//!
//! The log is append-only. Each iteration entry is written (and synced) before
//! the next iteration begins, so a crash mid-loop leaves a valid, inspectable
//! partial history for the status and attach collaborators.

use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::types::{AppliedFix, FixDecision, PhaseError, SkippedFinding};

/// First line of every session log: session-level metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SystemEntry {
    pub session_name: String,
    pub started_at: String,
    pub pid: u32,
    pub project_path: PathBuf,
    pub branch: Option<String>,
    pub agent: String,
    pub max_iterations: u32,
}

/// One completed loop iteration. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IterationEntry {
    /// 1-indexed, monotonically increasing.
    pub iter: u32,
    pub started_at: String,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<FixDecision>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fixes: Vec<AppliedFix>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<SkippedFinding>,
    /// Set when this iteration ended the session early.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PhaseError>,
}

/// A parsed line of the session log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionLogEntry {
    System(SystemEntry),
    Iteration(IterationEntry),
}

/// Append-only writer for one session's log file.
#[derive(Debug)]
pub struct SessionLog {
    path: PathBuf,
}

impl SessionLog {
    /// Create the log with its leading system entry.
    pub fn create(path: impl Into<PathBuf>, system: &SystemEntry) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create log dir {}", parent.display()))?;
        }
        let line = to_line(&SessionLogEntry::System(system.clone()))?;
        fs::write(&path, line)
            .with_context(|| format!("write session log {}", path.display()))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one iteration entry and sync it before returning.
    pub fn append(&self, entry: &IterationEntry) -> Result<()> {
        let line = to_line(&SessionLogEntry::Iteration(entry.clone()))?;
        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open session log {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append session log {}", self.path.display()))?;
        file.sync_data()
            .with_context(|| format!("sync session log {}", self.path.display()))?;
        Ok(())
    }
}

/// Read a session log back into entries.
pub fn read_log(path: &Path) -> Result<Vec<SessionLogEntry>> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read session log {}", path.display()))?;
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line)
                .with_context(|| format!("parse session log line in {}", path.display()))
        })
        .collect()
}

fn to_line(entry: &SessionLogEntry) -> Result<String> {
    let mut buf = serde_json::to_string(entry).context("serialize session log entry")?;
    buf.push('\n');
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{FindingPriority, SessionPhase};

    fn system_entry() -> SystemEntry {
        SystemEntry {
            session_name: "widget-20260806-101500".to_string(),
            started_at: "2026-08-06T10:15:00+00:00".to_string(),
            pid: 4242,
            project_path: PathBuf::from("/srv/widget"),
            branch: Some("dev".to_string()),
            agent: "claude".to_string(),
            max_iterations: 5,
        }
    }

    #[test]
    fn log_round_trips_system_then_iterations() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("session.jsonl");

        let log = SessionLog::create(&path, &system_entry()).expect("create");
        log.append(&IterationEntry {
            iter: 1,
            started_at: "2026-08-06T10:15:01+00:00".to_string(),
            duration_ms: 1200,
            decision: Some(FixDecision::Applied),
            fixes: vec![AppliedFix {
                priority: FindingPriority::High,
                title: "null check".to_string(),
                file: Some("src/api.rs".to_string()),
            }],
            skipped: vec![SkippedFinding {
                title: "style nit".to_string(),
                reason: "out of scope".to_string(),
            }],
            error: None,
        })
        .expect("append 1");
        log.append(&IterationEntry {
            iter: 2,
            started_at: "2026-08-06T10:17:01+00:00".to_string(),
            duration_ms: 300,
            decision: None,
            fixes: Vec::new(),
            skipped: Vec::new(),
            error: Some(PhaseError {
                phase: SessionPhase::Fix,
                message: "fixer timed out".to_string(),
            }),
        })
        .expect("append 2");

        let entries = read_log(&path).expect("read");
        assert_eq!(entries.len(), 3);
        assert!(matches!(entries[0], SessionLogEntry::System(_)));
        match &entries[1] {
            SessionLogEntry::Iteration(entry) => {
                assert_eq!(entry.iter, 1);
                assert_eq!(entry.fixes[0].title, "null check");
            }
            other => panic!("expected iteration entry, got {other:?}"),
        }
        match &entries[2] {
            SessionLogEntry::Iteration(entry) => {
                assert_eq!(entry.error.as_ref().expect("error").phase, SessionPhase::Fix);
            }
            other => panic!("expected iteration entry, got {other:?}"),
        }
    }

    #[test]
    fn empty_lists_are_omitted_from_the_line() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("session.jsonl");
        let log = SessionLog::create(&path, &system_entry()).expect("create");
        log.append(&IterationEntry {
            iter: 1,
            started_at: "2026-08-06T10:15:01+00:00".to_string(),
            duration_ms: 10,
            decision: None,
            fixes: Vec::new(),
            skipped: Vec::new(),
            error: None,
        })
        .expect("append");

        let contents = fs::read_to_string(&path).expect("read");
        let line = contents.lines().nth(1).expect("iteration line");
        assert!(!line.contains("fixes"));
        assert!(!line.contains("error"));
    }
}
