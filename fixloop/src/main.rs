//! Unattended review→fix loop driver for external AI coding agents.

use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};

use fixloop::core::types::SessionOutcome;
use fixloop::exit_codes;
use fixloop::io::agents::AgentRegistry;
use fixloop::io::config::{LoopConfig, load_config};
use fixloop::io::git::Git;
use fixloop::io::lockfile::{self, AlreadyRunningError};
use fixloop::io::process::AgentRunner;
use fixloop::session::{SessionRequest, run_session};
use fixloop::signals::{StopFlag, request_stop};

#[derive(Parser)]
#[command(
    name = "fixloop",
    version,
    about = "Unattended review-fix loop for AI coding agents"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a review-fix session for a project.
    Run {
        /// Project root (defaults to the current directory).
        #[arg(long)]
        project: Option<PathBuf>,
        /// Branch override (defaults to the current git branch).
        #[arg(long)]
        branch: Option<String>,
        /// Agent identifier from the registry.
        #[arg(long)]
        agent: Option<String>,
        /// Iteration bound override.
        #[arg(long)]
        max_iterations: Option<u32>,
        /// Path to fixloop.toml (defaults to <project>/fixloop.toml).
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// List live sessions across all projects.
    Sessions,
    /// Stop a running session by name.
    Stop {
        /// Session name as shown by `fixloop sessions`.
        session: String,
    },
}

fn main() {
    fixloop::logging::init();
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Run {
            project,
            branch,
            agent,
            max_iterations,
            config,
        } => cmd_run(project, branch, agent, max_iterations, config),
        Command::Sessions => cmd_sessions(),
        Command::Stop { session } => cmd_stop(&session),
    }
}

fn cmd_run(
    project: Option<PathBuf>,
    branch: Option<String>,
    agent: Option<String>,
    max_iterations: Option<u32>,
    config: Option<PathBuf>,
) -> Result<i32> {
    let project = match project {
        Some(path) => path,
        None => std::env::current_dir().context("determine current directory")?,
    };
    let config_path = config.unwrap_or_else(|| project.join("fixloop.toml"));
    let mut cfg = load_config(&config_path)?;
    if let Some(agent) = agent {
        cfg.agent = agent;
    }
    if let Some(limit) = max_iterations {
        cfg.max_iterations = limit;
    }
    cfg.validate()?;

    // Branch discovery is best-effort: outside a repo the session is branch-less.
    let branch = branch.or_else(|| Git::new(&project).current_branch().ok());

    let stop = StopFlag::new();
    stop.install_handler()?;
    let runner = AgentRunner::new(AgentRegistry::builtin());
    let request = SessionRequest {
        project,
        branch,
        config: cfg,
    };

    match run_session(&request, &runner, &stop) {
        Ok(report) => {
            println!(
                "session {} finished after {} iteration(s): {}",
                report.session.session_name,
                report.iterations,
                describe_outcome(&report.outcome)
            );
            println!("log: {}", report.log_path.display());
            Ok(outcome_exit_code(&report.outcome))
        }
        Err(err) => match err.downcast_ref::<AlreadyRunningError>() {
            Some(conflict) => {
                eprintln!("{conflict}");
                eprintln!("use `fixloop stop {}` to end it", conflict.existing.session_name);
                Ok(exit_codes::ALREADY_RUNNING)
            }
            None => Err(err),
        },
    }
}

fn describe_outcome(outcome: &SessionOutcome) -> String {
    use fixloop::core::types::CompletionReason;
    match outcome {
        SessionOutcome::Completed(CompletionReason::NoFindings) => {
            "completed (review clean)".to_string()
        }
        SessionOutcome::Completed(CompletionReason::NoChangesNeeded) => {
            "completed (no changes needed)".to_string()
        }
        SessionOutcome::MaxIterationsReached => "iteration bound reached".to_string(),
        SessionOutcome::Failed(error) => format!("failed in {} phase: {}", error.phase, error.message),
        SessionOutcome::Interrupted => "interrupted".to_string(),
    }
}

fn outcome_exit_code(outcome: &SessionOutcome) -> i32 {
    match outcome {
        SessionOutcome::Completed(_) => exit_codes::OK,
        SessionOutcome::MaxIterationsReached => exit_codes::MAX_ITERATIONS,
        SessionOutcome::Failed(_) => exit_codes::SESSION_FAILED,
        SessionOutcome::Interrupted => exit_codes::INTERRUPTED,
    }
}

fn cmd_sessions() -> Result<i32> {
    let logs_root = LoopConfig::default().resolved_logs_root()?;
    let sessions = lockfile::list_active(&logs_root)?;
    if sessions.is_empty() {
        println!("no active sessions");
        return Ok(exit_codes::OK);
    }
    for session in &sessions {
        let branch = session.branch.as_deref().unwrap_or("-");
        println!(
            "{}  pid {}  {}  branch {}  since {}",
            session.session_name,
            session.pid,
            session.project_path.display(),
            branch,
            session.started_at
        );
    }
    Ok(exit_codes::OK)
}

fn cmd_stop(name: &str) -> Result<i32> {
    let logs_root = LoopConfig::default().resolved_logs_root()?;
    let sessions = lockfile::list_active(&logs_root)?;
    let session = sessions
        .iter()
        .find(|session| session.session_name == name)
        .ok_or_else(|| anyhow!("no active session named '{name}'"))?;
    request_stop(session.pid)?;
    println!("stop requested for {} (pid {})", session.session_name, session.pid);
    Ok(exit_codes::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_overrides() {
        let cli = Cli::parse_from([
            "fixloop",
            "run",
            "--agent",
            "codex",
            "--max-iterations",
            "3",
        ]);
        match cli.command {
            Command::Run {
                agent,
                max_iterations,
                ..
            } => {
                assert_eq!(agent.as_deref(), Some("codex"));
                assert_eq!(max_iterations, Some(3));
            }
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn parse_stop_takes_session_name() {
        let cli = Cli::parse_from(["fixloop", "stop", "widget-dev-20260806-101500"]);
        match cli.command {
            Command::Stop { session } => assert_eq!(session, "widget-dev-20260806-101500"),
            _ => panic!("expected stop command"),
        }
    }

    #[test]
    fn outcome_exit_codes_are_distinct() {
        use fixloop::core::types::{CompletionReason, PhaseError, SessionPhase};
        let codes = [
            outcome_exit_code(&SessionOutcome::Completed(CompletionReason::NoFindings)),
            outcome_exit_code(&SessionOutcome::MaxIterationsReached),
            outcome_exit_code(&SessionOutcome::Failed(PhaseError {
                phase: SessionPhase::Fix,
                message: "x".to_string(),
            })),
            outcome_exit_code(&SessionOutcome::Interrupted),
        ];
        let mut unique = codes.to_vec();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), codes.len());
    }
}
