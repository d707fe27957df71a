//! Shared deterministic types for the review-fix loop.
//!
//! These types define stable contracts between components. They must not
//! depend on external state or I/O.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Function an agent is invoked for in a given call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentRole {
    Reviewer,
    Fixer,
    CodeSimplifier,
}

impl AgentRole {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentRole::Reviewer => "reviewer",
            AgentRole::Fixer => "fixer",
            AgentRole::CodeSimplifier => "code-simplifier",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity a reviewer attaches to a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FindingPriority {
    High,
    Medium,
    Low,
}

/// One issue reported by the reviewer agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub priority: FindingPriority,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Structured payload the reviewer must emit between its delimiters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewPayload {
    pub findings: Vec<Finding>,
    pub overall_correct: bool,
}

/// Terminal decision declared by the fixer agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixDecision {
    /// Fixes were applied; another review pass is warranted.
    Applied,
    /// The findings require no changes; the session can complete.
    NoChangesNeeded,
}

/// One fix the fixer applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedFix {
    pub priority: FindingPriority,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

/// One finding the fixer declined to address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedFinding {
    pub title: String,
    pub reason: String,
}

/// Structured payload the fixer must emit between its delimiters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixPayload {
    pub decision: FixDecision,
    #[serde(default)]
    pub fixes: Vec<AppliedFix>,
    #[serde(default)]
    pub skipped: Vec<SkippedFinding>,
}

/// Phase in which a session ended early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    Review,
    Fix,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionPhase::Review => f.write_str("review"),
            SessionPhase::Fix => f.write_str("fix"),
        }
    }
}

/// A fatal condition recorded against the phase that raised it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseError {
    pub phase: SessionPhase,
    pub message: String,
}

/// Why a session reached `Completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionReason {
    /// The reviewer reported an empty findings list.
    NoFindings,
    /// The fixer declared no changes needed.
    NoChangesNeeded,
}

/// Terminal state of a session.
///
/// `MaxIterationsReached` is terminal but not an error, and is distinct from
/// both completion-by-decision and failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed(CompletionReason),
    MaxIterationsReached,
    Failed(PhaseError),
    Interrupted,
}

impl SessionOutcome {
    /// True for terminal states that are not failures or interruptions.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            SessionOutcome::Completed(_) | SessionOutcome::MaxIterationsReached
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_serialize_kebab_case() {
        let json = serde_json::to_string(&AgentRole::CodeSimplifier).expect("serialize");
        assert_eq!(json, "\"code-simplifier\"");
        assert_eq!(AgentRole::Reviewer.to_string(), "reviewer");
    }

    #[test]
    fn fix_payload_lists_default_to_empty() {
        let payload: FixPayload =
            serde_json::from_str(r#"{"decision":"no_changes_needed"}"#).expect("parse");
        assert_eq!(payload.decision, FixDecision::NoChangesNeeded);
        assert!(payload.fixes.is_empty());
        assert!(payload.skipped.is_empty());
    }

    #[test]
    fn outcome_success_classification() {
        assert!(SessionOutcome::Completed(CompletionReason::NoFindings).is_success());
        assert!(SessionOutcome::MaxIterationsReached.is_success());
        assert!(!SessionOutcome::Interrupted.is_success());
        assert!(
            !SessionOutcome::Failed(PhaseError {
                phase: SessionPhase::Review,
                message: "boom".to_string(),
            })
            .is_success()
        );
    }
}
