//! Test-only helpers: scripted agents and payload builders.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use crate::core::protocol;
use crate::core::types::AgentRole;
use crate::io::config::LoopConfig;
use crate::io::process::{AgentExec, AgentInvocation, AgentResult};
use crate::signals::StopFlag;

/// Wrap a payload in its role delimiters the way a well-behaved agent would,
/// surrounded by the free-form chatter real agents produce.
pub fn delimited(role: AgentRole, json: &str) -> String {
    let (begin, end) = protocol::delimiters(role);
    format!("working...\nsome narration\n{begin}\n{json}\n{end}\n")
}

/// Reviewer output with an empty findings list.
pub fn review_clean() -> String {
    delimited(AgentRole::Reviewer, r#"{"findings":[],"overall_correct":true}"#)
}

/// Reviewer output with `count` medium-priority findings.
pub fn review_with_findings(count: usize) -> String {
    let findings: Vec<String> = (0..count)
        .map(|i| format!(r#"{{"priority":"medium","title":"finding {i}","file":"src/lib.rs"}}"#))
        .collect();
    delimited(
        AgentRole::Reviewer,
        &format!(
            r#"{{"findings":[{}],"overall_correct":false}}"#,
            findings.join(",")
        ),
    )
}

/// Fixer output applying `count` fixes.
pub fn fix_applied(count: usize) -> String {
    let fixes: Vec<String> = (0..count)
        .map(|i| format!(r#"{{"priority":"medium","title":"fix {i}","file":"src/lib.rs"}}"#))
        .collect();
    delimited(
        AgentRole::Fixer,
        &format!(r#"{{"decision":"applied","fixes":[{}],"skipped":[]}}"#, fixes.join(",")),
    )
}

/// Fixer output declaring no changes needed.
pub fn fix_no_changes() -> String {
    delimited(AgentRole::Fixer, r#"{"decision":"no_changes_needed"}"#)
}

/// Successful [`AgentResult`] with the given combined output.
pub fn ok_result(output: impl Into<String>) -> AgentResult {
    AgentResult {
        success: true,
        exit_code: 0,
        output: output.into(),
        duration: Duration::from_millis(5),
    }
}

/// Failed [`AgentResult`] with the given exit code and output.
pub fn failed_result(exit_code: i32, output: impl Into<String>) -> AgentResult {
    AgentResult {
        success: false,
        exit_code,
        output: output.into(),
        duration: Duration::from_millis(5),
    }
}

/// Config pointing all session state at a test-owned directory.
pub fn test_config(logs_root: &Path) -> LoopConfig {
    LoopConfig {
        agent: "scripted".to_string(),
        logs_root: Some(logs_root.to_path_buf()),
        ..LoopConfig::default()
    }
}

/// Temp directory holding a project root and a logs root for session tests.
pub struct TestProject {
    temp: tempfile::TempDir,
}

impl TestProject {
    pub fn new() -> std::io::Result<Self> {
        let temp = tempfile::tempdir()?;
        std::fs::create_dir_all(temp.path().join("project"))?;
        Ok(Self { temp })
    }

    pub fn project(&self) -> std::path::PathBuf {
        self.temp.path().join("project")
    }

    pub fn logs_root(&self) -> std::path::PathBuf {
        self.temp.path().join("sessions")
    }

    /// Session request scoped entirely to this temp directory.
    pub fn request(&self, branch: Option<&str>) -> crate::session::SessionRequest {
        crate::session::SessionRequest {
            project: self.project(),
            branch: branch.map(str::to_string),
            config: test_config(&self.logs_root()),
        }
    }
}

/// Agent executor that replays a fixed queue of results and records the
/// invocations it saw, in order.
pub struct ScriptedAgent {
    queue: Mutex<VecDeque<AgentResult>>,
    calls: Mutex<Vec<AgentInvocation>>,
    /// Trip the stop flag after this many runs (simulates an external stop).
    stop_after: Option<usize>,
}

impl ScriptedAgent {
    pub fn new(results: Vec<AgentResult>) -> Self {
        Self {
            queue: Mutex::new(results.into()),
            calls: Mutex::new(Vec::new()),
            stop_after: None,
        }
    }

    pub fn stopping_after(mut self, calls: usize) -> Self {
        self.stop_after = Some(calls);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("calls lock").len()
    }

    /// Roles of the recorded invocations, in call order.
    pub fn roles(&self) -> Vec<AgentRole> {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .map(|call| call.role)
            .collect()
    }

    /// Prompts of the recorded invocations, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .map(|call| call.prompt.clone())
            .collect()
    }
}

impl AgentExec for ScriptedAgent {
    fn run(&self, invocation: &AgentInvocation, stop: &StopFlag) -> AgentResult {
        let call_number = {
            let mut calls = self.calls.lock().expect("calls lock");
            calls.push(invocation.clone());
            calls.len()
        };
        if let Some(limit) = self.stop_after
            && call_number >= limit
        {
            stop.trip();
        }
        self.queue
            .lock()
            .expect("queue lock")
            .pop_front()
            .unwrap_or_else(|| failed_result(1, "[Error: scripted agent queue exhausted]"))
    }
}
