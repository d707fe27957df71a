//! Review-fix session engine: the iteration state machine.
//!
//! One session is a strict sequence of blocking phases — reviewer, then fixer,
//! then back — bounded by `max_iterations`. Iterations are ordered because the
//! fixer consumes the prior reviewer's output; there is no parallelism above
//! the per-invocation stream/timeout tasks inside the process runner. The
//! session lock is acquired before any phase runs and released on every
//! terminal transition, so it can never outlive the engine.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::core::protocol;
use crate::core::types::{
    AgentRole, CompletionReason, FixDecision, PhaseError, ReviewPayload, SessionOutcome,
    SessionPhase,
};
use crate::io::config::LoopConfig;
use crate::io::lockfile::{self, ActiveSession};
use crate::io::process::{AgentExec, AgentInvocation, AgentResult, TIMEOUT_EXIT_CODE};
use crate::io::prompt;
use crate::io::session_log::{IterationEntry, SessionLog, SystemEntry};
use crate::signals::StopFlag;

/// Inputs for one session run.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub project: PathBuf,
    /// Branch as reported by git; normalized against the configured default.
    pub branch: Option<String>,
    pub config: LoopConfig,
}

/// What a finished session looked like.
#[derive(Debug)]
pub struct SessionReport {
    pub session: ActiveSession,
    pub outcome: SessionOutcome,
    /// Number of iteration entries written to the session log.
    pub iterations: u32,
    pub log_path: PathBuf,
}

/// Run a full review-fix session against `request.project`.
///
/// Acquires the session lock (a conflict surfaces as
/// [`lockfile::AlreadyRunningError`] and is never auto-retried), loops
/// reviewer/fixer up to `max_iterations`, appends each iteration durably
/// before the next begins, and always releases the lock as the last action.
#[instrument(skip_all, fields(project = %request.project.display()))]
pub fn run_session<E: AgentExec>(
    request: &SessionRequest,
    exec: &E,
    stop: &StopFlag,
) -> Result<SessionReport> {
    request.config.validate()?;
    let logs_root = request.config.resolved_logs_root()?;
    let branch =
        lockfile::normalize_branch(request.branch.as_deref(), &request.config.default_branch);

    let session = lockfile::acquire(&logs_root, &request.project, branch.as_deref())?;
    info!(session = %session.session_name, "session started");

    let driven = drive(request, &session, &logs_root, exec, stop);

    // The lock must never outlive the engine's terminal state.
    if let Err(err) = lockfile::release(&session) {
        warn!(error = %err, "failed to release session lock");
    }

    let (outcome, iterations, log_path) = driven?;
    info!(
        session = %session.session_name,
        iterations,
        outcome = ?outcome,
        "session finished"
    );
    Ok(SessionReport {
        session,
        outcome,
        iterations,
        log_path,
    })
}

/// Result of one structured phase: payload, stop observed, or fatal error.
enum Phase<T> {
    Done(T),
    Stopped,
    Failed(PhaseError),
}

fn drive<E: AgentExec>(
    request: &SessionRequest,
    session: &ActiveSession,
    logs_root: &Path,
    exec: &E,
    stop: &StopFlag,
) -> Result<(SessionOutcome, u32, PathBuf)> {
    let cfg = &request.config;
    let log_path = logs_root.join(format!("{}.jsonl", session.session_name));
    let log = SessionLog::create(
        &log_path,
        &SystemEntry {
            session_name: session.session_name.clone(),
            started_at: session.started_at.clone(),
            pid: session.pid,
            project_path: session.project_path.clone(),
            branch: session.branch.clone(),
            agent: cfg.agent.clone(),
            max_iterations: cfg.max_iterations,
        },
    )?;

    let mut iterations = 0u32;
    let outcome = loop {
        let iter = iterations + 1;
        if iter > cfg.max_iterations {
            info!(max_iterations = cfg.max_iterations, "iteration bound reached");
            break SessionOutcome::MaxIterationsReached;
        }
        if stop.is_tripped() {
            break SessionOutcome::Interrupted;
        }

        let iter_started_at = Utc::now().to_rfc3339();
        let t0 = Instant::now();

        info!(iter, "review phase");
        let review = match review_phase(cfg, session, iter, exec, stop) {
            Phase::Done(payload) => payload,
            Phase::Stopped => {
                log.append(&interrupted_entry(iter, &iter_started_at, t0, SessionPhase::Review))?;
                iterations = iter;
                break SessionOutcome::Interrupted;
            }
            Phase::Failed(error) => {
                log.append(&failed_entry(iter, &iter_started_at, t0, error.clone()))?;
                iterations = iter;
                break SessionOutcome::Failed(error);
            }
        };

        if review.findings.is_empty() {
            log.append(&IterationEntry {
                iter,
                started_at: iter_started_at,
                duration_ms: t0.elapsed().as_millis() as u64,
                decision: None,
                fixes: Vec::new(),
                skipped: Vec::new(),
                error: None,
            })?;
            iterations = iter;
            info!(iter, "no findings, session complete");
            break SessionOutcome::Completed(CompletionReason::NoFindings);
        }

        info!(iter, findings = review.findings.len(), "fix phase");
        let fix = match fix_phase(cfg, session, iter, &review, exec, stop) {
            Phase::Done(payload) => payload,
            Phase::Stopped => {
                log.append(&interrupted_entry(iter, &iter_started_at, t0, SessionPhase::Fix))?;
                iterations = iter;
                break SessionOutcome::Interrupted;
            }
            Phase::Failed(error) => {
                log.append(&failed_entry(iter, &iter_started_at, t0, error.clone()))?;
                iterations = iter;
                break SessionOutcome::Failed(error);
            }
        };

        let decision = fix.decision;
        log.append(&IterationEntry {
            iter,
            started_at: iter_started_at,
            duration_ms: t0.elapsed().as_millis() as u64,
            decision: Some(decision),
            fixes: fix.fixes,
            skipped: fix.skipped,
            error: None,
        })?;
        iterations = iter;

        if decision == FixDecision::NoChangesNeeded {
            info!(iter, "fixer declared no changes needed, session complete");
            break SessionOutcome::Completed(CompletionReason::NoChangesNeeded);
        }
    };

    Ok((outcome, iterations, log_path))
}

fn review_phase<E: AgentExec>(
    cfg: &LoopConfig,
    session: &ActiveSession,
    iter: u32,
    exec: &E,
    stop: &StopFlag,
) -> Phase<ReviewPayload> {
    let prompt = prompt::build_review_prompt(iter, session.branch.as_deref());
    run_structured(
        cfg,
        &session.project_path,
        AgentRole::Reviewer,
        prompt,
        Duration::from_secs(cfg.review_timeout_secs),
        exec,
        stop,
        protocol::extract_review,
    )
}

fn fix_phase<E: AgentExec>(
    cfg: &LoopConfig,
    session: &ActiveSession,
    iter: u32,
    review: &ReviewPayload,
    exec: &E,
    stop: &StopFlag,
) -> Phase<crate::core::types::FixPayload> {
    let prompt = prompt::build_fix_prompt(iter, review);
    run_structured(
        cfg,
        &session.project_path,
        AgentRole::Fixer,
        prompt,
        Duration::from_secs(cfg.fix_timeout_secs),
        exec,
        stop,
        |text| protocol::extract_fix(AgentRole::Fixer, text),
    )
}

/// Run one agent invocation and extract its structured payload, re-invoking
/// once with the retry prompt when extraction fails. A retry re-emits output;
/// it never redoes the work.
#[allow(clippy::too_many_arguments)]
fn run_structured<T, E, F>(
    cfg: &LoopConfig,
    workdir: &Path,
    role: AgentRole,
    prompt: String,
    timeout: Duration,
    exec: &E,
    stop: &StopFlag,
    extract: F,
) -> Phase<T>
where
    E: AgentExec,
    F: Fn(&str) -> Option<T>,
{
    let invocation = AgentInvocation {
        role,
        agent: cfg.agent.clone(),
        model: cfg.model.clone(),
        provider: cfg.provider.clone(),
        reasoning: cfg.reasoning.clone(),
        prompt,
        timeout,
        workdir: workdir.to_path_buf(),
        env_overrides: Vec::new(),
    };

    let result = exec.run(&invocation, stop);
    if stop.is_tripped() {
        return Phase::Stopped;
    }
    if !result.success {
        return Phase::Failed(phase_error(role, &result));
    }
    if let Some(payload) = extract(&result.output) {
        return Phase::Done(payload);
    }

    warn!(%role, "structured output missing, retrying once");
    let retry = AgentInvocation {
        prompt: protocol::build_retry_prompt(role),
        ..invocation
    };
    let result = exec.run(&retry, stop);
    if stop.is_tripped() {
        return Phase::Stopped;
    }
    if !result.success {
        return Phase::Failed(phase_error(role, &result));
    }
    match extract(&result.output) {
        Some(payload) => Phase::Done(payload),
        None => Phase::Failed(PhaseError {
            phase: role_phase(role),
            message: format!("{role} did not emit a parseable structured payload after retry"),
        }),
    }
}

fn phase_error(role: AgentRole, result: &AgentResult) -> PhaseError {
    let message = if result.exit_code == TIMEOUT_EXIT_CODE {
        format!("{role} agent timed out")
    } else {
        format!("{role} agent exited with code {}", result.exit_code)
    };
    PhaseError {
        phase: role_phase(role),
        message,
    }
}

fn role_phase(role: AgentRole) -> SessionPhase {
    match role {
        AgentRole::Reviewer => SessionPhase::Review,
        AgentRole::Fixer | AgentRole::CodeSimplifier => SessionPhase::Fix,
    }
}

fn failed_entry(iter: u32, started_at: &str, t0: Instant, error: PhaseError) -> IterationEntry {
    IterationEntry {
        iter,
        started_at: started_at.to_string(),
        duration_ms: t0.elapsed().as_millis() as u64,
        decision: None,
        fixes: Vec::new(),
        skipped: Vec::new(),
        error: Some(error),
    }
}

fn interrupted_entry(
    iter: u32,
    started_at: &str,
    t0: Instant,
    phase: SessionPhase,
) -> IterationEntry {
    failed_entry(
        iter,
        started_at,
        t0,
        PhaseError {
            phase,
            message: "interrupted by stop request".to_string(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::AgentRole;
    use crate::io::session_log::{SessionLogEntry, read_log};
    use crate::test_support::{
        ScriptedAgent, TestProject, failed_result, fix_applied, ok_result, review_clean,
        review_with_findings,
    };

    #[test]
    fn clean_review_completes_without_fixer() {
        let temp = TestProject::new().expect("test project");
        let exec = ScriptedAgent::new(vec![ok_result(review_clean())]);

        let report =
            run_session(&temp.request(Some("dev")), &exec, &StopFlag::new()).expect("session");

        assert_eq!(
            report.outcome,
            SessionOutcome::Completed(CompletionReason::NoFindings)
        );
        assert_eq!(report.iterations, 1);
        assert_eq!(exec.roles(), vec![AgentRole::Reviewer]);
        assert!(!report.session.lock_path.exists(), "lock released");
    }

    #[test]
    fn extraction_failure_retries_once_with_retry_prompt() {
        let temp = TestProject::new().expect("test project");
        let exec = ScriptedAgent::new(vec![
            ok_result("chatty output with no payload"),
            ok_result(review_clean()),
        ]);

        let report =
            run_session(&temp.request(None), &exec, &StopFlag::new()).expect("session");

        assert_eq!(
            report.outcome,
            SessionOutcome::Completed(CompletionReason::NoFindings)
        );
        let calls = exec.prompts();
        assert_eq!(calls.len(), 2);
        assert!(calls[1].contains("did not contain a parseable result payload"));
    }

    #[test]
    fn double_extraction_failure_fails_the_review_phase() {
        let temp = TestProject::new().expect("test project");
        let exec = ScriptedAgent::new(vec![
            ok_result("garbage"),
            ok_result("still garbage"),
        ]);

        let report =
            run_session(&temp.request(None), &exec, &StopFlag::new()).expect("session");

        match &report.outcome {
            SessionOutcome::Failed(error) => {
                assert_eq!(error.phase, SessionPhase::Review);
                assert!(error.message.contains("after retry"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        // The failed iteration is still on record.
        let entries = read_log(&report.log_path).expect("log");
        assert_eq!(entries.len(), 2);
        match &entries[1] {
            SessionLogEntry::Iteration(entry) => assert!(entry.error.is_some()),
            other => panic!("expected iteration entry, got {other:?}"),
        }
    }

    #[test]
    fn reviewer_timeout_is_a_review_phase_error() {
        let temp = TestProject::new().expect("test project");
        let exec = ScriptedAgent::new(vec![failed_result(
            TIMEOUT_EXIT_CODE,
            "partial\n[Timeout after 100ms]",
        )]);

        let report =
            run_session(&temp.request(None), &exec, &StopFlag::new()).expect("session");

        match &report.outcome {
            SessionOutcome::Failed(error) => {
                assert_eq!(error.phase, SessionPhase::Review);
                assert!(error.message.contains("timed out"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn stop_during_fix_phase_interrupts_and_releases_lock() {
        let temp = TestProject::new().expect("test project");
        // Reviewer succeeds; the fixer call trips the stop flag.
        let exec = ScriptedAgent::new(vec![
            ok_result(review_with_findings(1)),
            ok_result(fix_applied(1)),
        ])
        .stopping_after(2);

        let report =
            run_session(&temp.request(None), &exec, &StopFlag::new()).expect("session");

        assert_eq!(report.outcome, SessionOutcome::Interrupted);
        assert!(!report.session.lock_path.exists(), "lock released");
    }
}
