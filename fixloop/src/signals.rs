//! Stop-flag wiring for SIGINT/SIGTERM and the `stop` command.
//!
//! A session runs as a plain foreground process, so an external stop is just a
//! SIGTERM to the PID recorded in the session's lock file. The handler raises
//! a shared flag; the process runner's wait loop and the session engine both
//! observe it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};

/// Shared cancellation flag observed by the process runner and the engine.
#[derive(Debug, Clone, Default)]
pub struct StopFlag {
    inner: Arc<AtomicBool>,
}

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag. Safe to call from signal context and from tests.
    pub fn trip(&self) {
        self.inner.store(true, Ordering::SeqCst);
    }

    pub fn is_tripped(&self) -> bool {
        self.inner.load(Ordering::SeqCst)
    }

    /// Raise this flag on SIGINT/SIGTERM. Call at most once per process.
    pub fn install_handler(&self) -> Result<()> {
        let flag = self.inner.clone();
        ctrlc::set_handler(move || {
            flag.store(true, Ordering::SeqCst);
        })
        .context("install signal handler")
    }
}

/// Ask the session owned by `pid` to stop.
#[cfg(unix)]
pub fn request_stop(pid: u32) -> Result<()> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
        .with_context(|| format!("signal pid {pid}"))?;
    Ok(())
}

#[cfg(not(unix))]
pub fn request_stop(_pid: u32) -> Result<()> {
    Err(anyhow::anyhow!("stopping sessions is only supported on unix"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_starts_lowered_and_latches() {
        let flag = StopFlag::new();
        assert!(!flag.is_tripped());
        flag.trip();
        assert!(flag.is_tripped());

        // Clones observe the same underlying flag.
        let clone = flag.clone();
        assert!(clone.is_tripped());
    }
}
