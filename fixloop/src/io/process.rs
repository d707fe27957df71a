//! Agent process runner: spawn, concurrent capture, timeout, uniform result.
//!
//! Stdout and stderr drain on dedicated threads while the wait loop polls the
//! child in short slices, so large structured streams can never deadlock the
//! child and both a timeout and an external stop can interrupt the wait. All
//! failure modes collapse into the same [`AgentResult`] contract; retry policy
//! lives with the session engine, never here.

use std::io::Write as _;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::types::AgentRole;
use crate::io::agents::{AgentRegistry, AgentSpec};
use crate::io::stream::{CaptureMode, CaptureOutcome, LiveSink, NullSink, WriterSink, capture_stream};
use crate::signals::StopFlag;

/// Exit code reported when an invocation exceeds its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;
/// Exit code reported when the process could not be spawned or streamed.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = 1;
/// Exit code reported when a stop request killed the invocation.
pub const INTERRUPT_EXIT_CODE: i32 = 130;

/// How long the wait loop sleeps between deadline/stop checks.
const WAIT_SLICE: Duration = Duration::from_millis(25);

/// One agent run. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    pub role: AgentRole,
    /// Registry key of the agent to run.
    pub agent: String,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub reasoning: Option<String>,
    pub prompt: String,
    pub timeout: Duration,
    pub workdir: PathBuf,
    pub env_overrides: Vec<(String, String)>,
}

/// Uniform result contract for one agent run.
///
/// `success` is true iff the process exited 0 and no stream error occurred
/// before completion.
#[derive(Debug, Clone)]
pub struct AgentResult {
    pub success: bool,
    pub exit_code: i32,
    /// Stdout text, then (when non-empty) stderr under a `[stderr]` marker,
    /// then a timeout/interrupt marker when applicable.
    pub output: String,
    pub duration: Duration,
}

impl AgentResult {
    fn failure(exit_code: i32, output: String, started: Instant) -> Self {
        Self {
            success: false,
            exit_code,
            output,
            duration: started.elapsed(),
        }
    }
}

/// Abstraction over agent execution so the session engine can be scripted.
pub trait AgentExec {
    fn run(&self, invocation: &AgentInvocation, stop: &StopFlag) -> AgentResult;
}

/// Runner backed by real subprocesses resolved through an [`AgentRegistry`].
#[derive(Debug, Clone)]
pub struct AgentRunner {
    registry: AgentRegistry,
    echo: bool,
}

impl AgentRunner {
    pub fn new(registry: AgentRegistry) -> Self {
        Self {
            registry,
            echo: true,
        }
    }

    /// Discard live output instead of forwarding it to stderr.
    pub fn quiet(mut self) -> Self {
        self.echo = false;
        self
    }

    fn sinks(&self) -> (Box<dyn LiveSink>, Box<dyn LiveSink>) {
        if self.echo {
            (
                Box::new(WriterSink::new(std::io::stderr())),
                Box::new(WriterSink::new(std::io::stderr())),
            )
        } else {
            (Box::new(NullSink), Box::new(NullSink))
        }
    }
}

impl AgentExec for AgentRunner {
    #[instrument(skip_all, fields(agent = %invocation.agent, role = %invocation.role, timeout_ms = invocation.timeout.as_millis() as u64))]
    fn run(&self, invocation: &AgentInvocation, stop: &StopFlag) -> AgentResult {
        let started = Instant::now();
        let Some(spec) = self.registry.get(&invocation.agent) else {
            error!(agent = %invocation.agent, "unknown agent identifier");
            return AgentResult::failure(
                SPAWN_FAILURE_EXIT_CODE,
                format!("[Error: unknown agent '{}']", invocation.agent),
                started,
            );
        };
        let (stdout_sink, stderr_sink) = self.sinks();
        run_agent_process(spec, invocation, stdout_sink, stderr_sink, stop)
    }
}

/// How the wait loop ended.
enum WaitEnd {
    Exited,
    TimedOut,
    Interrupted,
}

/// Spawn the agent process described by `spec` and produce its [`AgentResult`].
pub fn run_agent_process(
    spec: &AgentSpec,
    invocation: &AgentInvocation,
    stdout_sink: Box<dyn LiveSink>,
    stderr_sink: Box<dyn LiveSink>,
    stop: &StopFlag,
) -> AgentResult {
    let started = Instant::now();

    let mut cmd = Command::new(spec.command);
    cmd.args((spec.build_args)(invocation))
        .envs(
            (spec.build_env)(invocation)
                .into_iter()
                .chain(invocation.env_overrides.iter().cloned()),
        )
        .current_dir(&invocation.workdir)
        .stdin(if spec.stdin_prompt {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!(command = spec.command, "spawning agent process");
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            error!(error = %err, command = spec.command, "failed to spawn agent");
            return AgentResult::failure(
                SPAWN_FAILURE_EXIT_CODE,
                format!("[Error: {err}]"),
                started,
            );
        }
    };

    if spec.stdin_prompt {
        let Some(mut stdin) = child.stdin.take() else {
            kill_and_reap(&mut child);
            return AgentResult::failure(
                SPAWN_FAILURE_EXIT_CODE,
                "[Error: stdin was not piped]".to_string(),
                started,
            );
        };
        if let Err(err) = stdin.write_all(invocation.prompt.as_bytes()) {
            warn!(error = %err, "failed to write prompt to agent stdin");
            kill_and_reap(&mut child);
            return AgentResult::failure(
                SPAWN_FAILURE_EXIT_CODE,
                format!("[Error: {err}]"),
                started,
            );
        }
        // stdin drops here, closing the pipe so the agent sees EOF.
    }

    let Some(stdout) = child.stdout.take() else {
        kill_and_reap(&mut child);
        return AgentResult::failure(
            SPAWN_FAILURE_EXIT_CODE,
            "[Error: stdout was not piped]".to_string(),
            started,
        );
    };
    let Some(stderr) = child.stderr.take() else {
        kill_and_reap(&mut child);
        return AgentResult::failure(
            SPAWN_FAILURE_EXIT_CODE,
            "[Error: stderr was not piped]".to_string(),
            started,
        );
    };

    let stdout_mode = match spec.line_format {
        Some(fmt) => CaptureMode::Jsonl(fmt),
        None => CaptureMode::Raw,
    };
    let stdout_handle = thread::spawn(move || {
        let mut sink = stdout_sink;
        capture_stream(stdout, stdout_mode, sink.as_mut())
    });
    let stderr_handle = thread::spawn(move || {
        let mut sink = stderr_sink;
        capture_stream(stderr, CaptureMode::Raw, sink.as_mut())
    });

    let deadline = started + invocation.timeout;
    let mut ended = WaitEnd::Exited;
    let status: Option<ExitStatus> = loop {
        if stop.is_tripped() {
            warn!("stop requested, killing agent process");
            ended = WaitEnd::Interrupted;
            break kill_and_reap(&mut child);
        }
        let now = Instant::now();
        if now >= deadline {
            warn!(
                timeout_ms = invocation.timeout.as_millis() as u64,
                "agent timed out, killing"
            );
            ended = WaitEnd::TimedOut;
            break kill_and_reap(&mut child);
        }
        let slice = WAIT_SLICE
            .min(deadline.saturating_duration_since(now))
            .max(Duration::from_millis(1));
        match child.wait_timeout(slice) {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {}
            Err(err) => {
                warn!(error = %err, "wait for agent process failed");
                break None;
            }
        }
    };

    // Killing the child closes its pipes, so both captures terminate.
    let stdout_capture = join_capture(stdout_handle);
    let stderr_capture = join_capture(stderr_handle);
    let streams_clean = stdout_capture.is_clean() && stderr_capture.is_clean();

    let mut output = stdout_capture.text;
    if !stderr_capture.text.is_empty() {
        if !output.is_empty() && !output.ends_with('\n') {
            output.push('\n');
        }
        output.push_str("[stderr]\n");
        output.push_str(&stderr_capture.text);
    }

    let duration = started.elapsed();
    match ended {
        WaitEnd::TimedOut => {
            push_marker(
                &mut output,
                &format!("[Timeout after {}ms]", invocation.timeout.as_millis()),
            );
            AgentResult {
                success: false,
                exit_code: TIMEOUT_EXIT_CODE,
                output,
                duration,
            }
        }
        WaitEnd::Interrupted => {
            push_marker(&mut output, "[Interrupted]");
            AgentResult {
                success: false,
                exit_code: INTERRUPT_EXIT_CODE,
                output,
                duration,
            }
        }
        WaitEnd::Exited => {
            let raw_code = status.and_then(|s| s.code()).unwrap_or(SPAWN_FAILURE_EXIT_CODE);
            if !streams_clean {
                warn!("stream capture reported an error");
            }
            let exit_code = if streams_clean || raw_code != 0 {
                raw_code
            } else {
                SPAWN_FAILURE_EXIT_CODE
            };
            debug!(exit_code, duration_ms = duration.as_millis() as u64, "agent finished");
            AgentResult {
                success: raw_code == 0 && streams_clean,
                exit_code,
                output,
                duration,
            }
        }
    }
}

fn push_marker(output: &mut String, marker: &str) {
    if !output.is_empty() && !output.ends_with('\n') {
        output.push('\n');
    }
    output.push_str(marker);
}

fn kill_and_reap(child: &mut Child) -> Option<ExitStatus> {
    if let Err(err) = child.kill() {
        warn!(error = %err, "failed to kill agent process");
    }
    match child.wait() {
        Ok(status) => Some(status),
        Err(err) => {
            warn!(error = %err, "failed to reap agent process");
            None
        }
    }
}

fn join_capture(handle: JoinHandle<CaptureOutcome>) -> CaptureOutcome {
    handle.join().unwrap_or_else(|_| CaptureOutcome {
        text: String::new(),
        error: Some(std::io::Error::other("capture thread panicked")),
    })
}
