//! Agent registry: per-agent command lines, environments, and display formatting.
//!
//! The registry is an explicit configuration map handed to the runner at
//! construction, so tests substitute fake descriptors without touching shared
//! state. Capabilities are plain struct fields: the argument and environment
//! builders are required, the line formatter is optional and its presence is
//! what puts a stream into JSONL mode.

use std::collections::HashMap;

use serde_json::Value;

use crate::io::process::AgentInvocation;
use crate::io::stream::{LineFormatter, LineRender};

/// Capability descriptor for one external agent command.
#[derive(Debug, Clone)]
pub struct AgentSpec {
    /// Binary to execute.
    pub command: &'static str,
    /// Build the argument list for an invocation.
    pub build_args: fn(&AgentInvocation) -> Vec<String>,
    /// Build additional environment variables for an invocation.
    pub build_env: fn(&AgentInvocation) -> Vec<(String, String)>,
    /// Whether the prompt is written to the agent's stdin (vs. passed in args).
    pub stdin_prompt: bool,
    /// Per-line display formatter. Present iff the agent emits JSONL events.
    pub line_format: Option<LineFormatter>,
}

impl AgentSpec {
    pub fn emits_jsonl(&self) -> bool {
        self.line_format.is_some()
    }
}

/// Registry of agent descriptors keyed by agent identifier.
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    specs: HashMap<String, AgentSpec>,
}

impl AgentRegistry {
    /// Registry with the built-in `claude` and `codex` descriptors.
    pub fn builtin() -> Self {
        Self::default()
            .with_spec("claude", claude_spec())
            .with_spec("codex", codex_spec())
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Insert or replace a descriptor. Tests inject fakes this way.
    pub fn with_spec(mut self, name: impl Into<String>, spec: AgentSpec) -> Self {
        self.specs.insert(name.into(), spec);
        self
    }

    pub fn get(&self, name: &str) -> Option<&AgentSpec> {
        self.specs.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.specs.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

fn claude_spec() -> AgentSpec {
    AgentSpec {
        command: "claude",
        build_args: claude_args,
        build_env: claude_env,
        stdin_prompt: true,
        line_format: Some(format_claude_line),
    }
}

fn claude_args(invocation: &AgentInvocation) -> Vec<String> {
    let mut args = vec![
        "-p".to_string(),
        "--verbose".to_string(),
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--dangerously-skip-permissions".to_string(),
    ];
    if let Some(model) = &invocation.model {
        args.push("--model".to_string());
        args.push(model.clone());
    }
    args
}

fn claude_env(invocation: &AgentInvocation) -> Vec<(String, String)> {
    let mut env = Vec::new();
    if let Some(level) = &invocation.reasoning {
        let budget = match level.as_str() {
            "low" => "4096",
            "medium" => "16384",
            _ => "31999",
        };
        env.push(("MAX_THINKING_TOKENS".to_string(), budget.to_string()));
    }
    env
}

/// Render one `claude --output-format stream-json` event for live display.
///
/// Assistant text blocks become plain text; bookkeeping events are silenced;
/// unknown event shapes fall back to the raw line.
fn format_claude_line(event: &Value) -> LineRender {
    match event.get("type").and_then(Value::as_str) {
        Some("system") | Some("user") => LineRender::Suppress,
        Some("assistant") => {
            let Some(blocks) = event.pointer("/message/content").and_then(Value::as_array) else {
                return LineRender::Suppress;
            };
            let mut text = String::new();
            for block in blocks {
                if block.get("type").and_then(Value::as_str) == Some("text")
                    && let Some(chunk) = block.get("text").and_then(Value::as_str)
                {
                    text.push_str(chunk);
                }
            }
            if text.is_empty() {
                LineRender::Suppress
            } else {
                LineRender::Rendered(text)
            }
        }
        Some("result") => match event.get("result").and_then(Value::as_str) {
            Some(summary) => LineRender::Rendered(summary.to_string()),
            None => LineRender::Suppress,
        },
        _ => LineRender::PassThrough,
    }
}

fn codex_spec() -> AgentSpec {
    AgentSpec {
        command: "codex",
        build_args: codex_args,
        build_env: codex_env,
        stdin_prompt: true,
        line_format: Some(format_codex_line),
    }
}

fn codex_args(invocation: &AgentInvocation) -> Vec<String> {
    let mut args = vec![
        "exec".to_string(),
        "--json".to_string(),
        "--sandbox".to_string(),
        "danger-full-access".to_string(),
        "--skip-git-repo-check".to_string(),
    ];
    if let Some(model) = &invocation.model {
        args.push("-c".to_string());
        args.push(format!("model={model}"));
    }
    if let Some(provider) = &invocation.provider {
        args.push("-c".to_string());
        args.push(format!("model_provider={provider}"));
    }
    if let Some(level) = &invocation.reasoning {
        args.push("-c".to_string());
        args.push(format!("model_reasoning_effort={level}"));
    }
    // Prompt arrives on stdin.
    args.push("-".to_string());
    args
}

fn codex_env(_invocation: &AgentInvocation) -> Vec<(String, String)> {
    Vec::new()
}

/// Render one `codex exec --json` event for live display.
fn format_codex_line(event: &Value) -> LineRender {
    match event.pointer("/msg/type").and_then(Value::as_str) {
        Some("agent_message") => match event.pointer("/msg/message").and_then(Value::as_str) {
            Some(text) => LineRender::Rendered(text.to_string()),
            None => LineRender::Suppress,
        },
        Some(_) => LineRender::Suppress,
        None => LineRender::PassThrough,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::AgentRole;
    use std::path::PathBuf;
    use std::time::Duration;

    fn invocation() -> AgentInvocation {
        AgentInvocation {
            role: AgentRole::Reviewer,
            agent: "claude".to_string(),
            model: Some("opus".to_string()),
            provider: None,
            reasoning: Some("medium".to_string()),
            prompt: "review this".to_string(),
            timeout: Duration::from_secs(60),
            workdir: PathBuf::from("."),
            env_overrides: Vec::new(),
        }
    }

    #[test]
    fn builtin_registry_knows_claude_and_codex() {
        let registry = AgentRegistry::builtin();
        assert_eq!(registry.names(), vec!["claude", "codex"]);
        assert!(registry.get("claude").expect("claude").emits_jsonl());
        assert!(registry.get("codex").expect("codex").emits_jsonl());
        assert!(registry.get("gemini").is_none());
    }

    #[test]
    fn claude_args_carry_model_and_stream_format() {
        let args = claude_args(&invocation());
        assert!(args.contains(&"stream-json".to_string()));
        let model_pos = args.iter().position(|a| a == "--model").expect("--model");
        assert_eq!(args[model_pos + 1], "opus");
    }

    #[test]
    fn claude_env_maps_reasoning_to_thinking_budget() {
        let env = claude_env(&invocation());
        assert_eq!(
            env,
            vec![("MAX_THINKING_TOKENS".to_string(), "16384".to_string())]
        );
    }

    #[test]
    fn codex_args_end_with_stdin_marker() {
        let mut inv = invocation();
        inv.provider = Some("openai".to_string());
        let args = codex_args(&inv);
        assert_eq!(args.last().map(String::as_str), Some("-"));
        assert!(args.contains(&"model_provider=openai".to_string()));
        assert!(args.contains(&"model_reasoning_effort=medium".to_string()));
    }

    #[test]
    fn claude_formatter_extracts_assistant_text() {
        let event: Value = serde_json::from_str(
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hi "},{"type":"text","text":"there"}]}}"#,
        )
        .expect("event");
        assert_eq!(
            format_claude_line(&event),
            LineRender::Rendered("hi there".to_string())
        );

        let init: Value = serde_json::from_str(r#"{"type":"system","subtype":"init"}"#).expect("event");
        assert_eq!(format_claude_line(&init), LineRender::Suppress);

        let unknown: Value = serde_json::from_str(r#"{"event":"custom"}"#).expect("event");
        assert_eq!(format_claude_line(&unknown), LineRender::PassThrough);
    }

    #[test]
    fn codex_formatter_renders_agent_messages_only() {
        let message: Value = serde_json::from_str(
            r#"{"id":"1","msg":{"type":"agent_message","message":"done"}}"#,
        )
        .expect("event");
        assert_eq!(
            format_codex_line(&message),
            LineRender::Rendered("done".to_string())
        );

        let count: Value =
            serde_json::from_str(r#"{"id":"2","msg":{"type":"token_count","count":5}}"#)
                .expect("event");
        assert_eq!(format_codex_line(&count), LineRender::Suppress);
    }
}
