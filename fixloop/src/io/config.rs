//! Loop configuration stored in `fixloop.toml` at the project root.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Session configuration (TOML).
///
/// Intended to be edited by humans and kept stable. Missing fields default to
/// sensible values; a missing file is equivalent to an empty one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoopConfig {
    /// Agent identifier used for both reviewer and fixer runs.
    pub agent: String,

    /// Model selector passed through to the agent, when set.
    pub model: Option<String>,

    /// Provider selector passed through to the agent, when set.
    pub provider: Option<String>,

    /// Reasoning level selector ("low" | "medium" | "high").
    pub reasoning: Option<String>,

    /// Upper bound on review→fix iterations per session.
    pub max_iterations: u32,

    /// Wall-clock budget for one reviewer run, in seconds.
    pub review_timeout_secs: u64,

    /// Wall-clock budget for one fixer run, in seconds.
    pub fix_timeout_secs: u64,

    /// Branch name treated as "no branch" for session identity.
    pub default_branch: String,

    /// Override for the lock/log directory (defaults under the user home).
    pub logs_root: Option<PathBuf>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            agent: "claude".to_string(),
            model: None,
            provider: None,
            reasoning: None,
            max_iterations: 5,
            review_timeout_secs: 15 * 60,
            fix_timeout_secs: 30 * 60,
            default_branch: "main".to_string(),
            logs_root: None,
        }
    }
}

impl LoopConfig {
    pub fn validate(&self) -> Result<()> {
        if self.agent.trim().is_empty() {
            return Err(anyhow!("agent must be non-empty"));
        }
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.review_timeout_secs == 0 {
            return Err(anyhow!("review_timeout_secs must be > 0"));
        }
        if self.fix_timeout_secs == 0 {
            return Err(anyhow!("fix_timeout_secs must be > 0"));
        }
        if self.default_branch.trim().is_empty() {
            return Err(anyhow!("default_branch must be non-empty"));
        }
        Ok(())
    }

    /// Resolved logs root: explicit override or `~/.fixloop/sessions`.
    pub fn resolved_logs_root(&self) -> Result<PathBuf> {
        if let Some(root) = &self.logs_root {
            return Ok(root.clone());
        }
        let home =
            dirs::home_dir().ok_or_else(|| anyhow!("cannot determine home directory for logs root"))?;
        Ok(home.join(".fixloop").join("sessions"))
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `LoopConfig::default()`.
pub fn load_config(path: &Path) -> Result<LoopConfig> {
    if !path.exists() {
        let cfg = LoopConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: LoopConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &LoopConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
