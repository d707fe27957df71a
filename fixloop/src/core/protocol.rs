//! Structured output protocol: role-delimited JSON payloads.
//!
//! Agents work in free-form text but must end their output with a single JSON
//! object bracketed by role-unique delimiter tokens. Extraction takes the
//! *last* start token and the first end token after it, so agents that echo
//! their instructions (which mention the tokens literally) earlier in the
//! output still parse. Extraction failures yield `None`, never an error; the
//! caller owns the retry policy.

use std::sync::LazyLock;

use jsonschema::{Draft, Validator};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::core::types::{AgentRole, FixPayload, ReviewPayload};

const REVIEW_SCHEMA: &str = include_str!("../../schemas/review_output.schema.json");
const FIX_SCHEMA: &str = include_str!("../../schemas/fix_output.schema.json");

/// Start/end delimiter tokens owned by a role.
pub fn delimiters(role: AgentRole) -> (&'static str, &'static str) {
    match role {
        AgentRole::Reviewer => ("[[REVIEW-RESULT-BEGIN]]", "[[REVIEW-RESULT-END]]"),
        AgentRole::Fixer => ("[[FIX-RESULT-BEGIN]]", "[[FIX-RESULT-END]]"),
        AgentRole::CodeSimplifier => ("[[SIMPLIFY-RESULT-BEGIN]]", "[[SIMPLIFY-RESULT-END]]"),
    }
}

/// Extract and validate the reviewer payload from raw agent output.
pub fn extract_review(text: &str) -> Option<ReviewPayload> {
    extract_payload(AgentRole::Reviewer, text)
}

/// Extract and validate a fixer-shaped payload (fixer or code-simplifier).
pub fn extract_fix(role: AgentRole, text: &str) -> Option<FixPayload> {
    debug_assert!(role != AgentRole::Reviewer);
    extract_payload(role, text)
}

/// Extract the delimiter-bounded JSON for `role`, validate its shape against
/// the role's schema, and deserialize it. Any failure yields `None`.
pub fn extract_payload<T: DeserializeOwned>(role: AgentRole, text: &str) -> Option<T> {
    let raw = bounded_payload(role, text)?;
    let value: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(err) => {
            debug!(%role, error = %err, "delimited payload is not valid JSON");
            return None;
        }
    };
    let validator = validator_for(role);
    if let Some(err) = validator.iter_errors(&value).next() {
        debug!(%role, error = %err, "delimited payload failed schema validation");
        return None;
    }
    match serde_json::from_value(value) {
        Ok(payload) => Some(payload),
        Err(err) => {
            debug!(%role, error = %err, "delimited payload failed deserialization");
            None
        }
    }
}

/// Corrective prompt for an agent that failed to emit a parseable payload.
///
/// A retry is for re-emitting output, not redoing work, so the fixer variant
/// forbids further file edits.
pub fn build_retry_prompt(role: AgentRole) -> String {
    let (begin, end) = delimiters(role);
    let mut prompt = format!(
        "Your previous output did not contain a parseable result payload.\n\
         Emit exactly one JSON object matching the required shape for the \
         {role} role, between the tokens {begin} and {end}, and nothing else."
    );
    if role != AgentRole::Reviewer {
        prompt.push_str("\nDo not edit any files: only re-emit the result of the work you already did.");
    }
    prompt
}

/// Slice the text between the last start token and the first end token after it.
fn bounded_payload(role: AgentRole, text: &str) -> Option<&str> {
    let (begin, end) = delimiters(role);
    let start = text.rfind(begin)?;
    let after = &text[start + begin.len()..];
    let stop = after.find(end)?;
    Some(after[..stop].trim())
}

fn validator_for(role: AgentRole) -> &'static Validator {
    static REVIEW: LazyLock<Validator> = LazyLock::new(|| compile(REVIEW_SCHEMA));
    static FIX: LazyLock<Validator> = LazyLock::new(|| compile(FIX_SCHEMA));
    match role {
        AgentRole::Reviewer => &REVIEW,
        AgentRole::Fixer | AgentRole::CodeSimplifier => &FIX,
    }
}

fn compile(raw: &str) -> Validator {
    let schema: Value = serde_json::from_str(raw).expect("embedded schema should be valid JSON");
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .expect("embedded schema should compile")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{FindingPriority, FixDecision};

    const CLEAN_REVIEW: &str = r#"{"findings":[],"overall_correct":true}"#;

    fn wrapped(role: AgentRole, json: &str) -> String {
        let (begin, end) = delimiters(role);
        format!("thinking...\n{begin}\n{json}\n{end}\ntrailing note\n")
    }

    #[test]
    fn extracts_clean_review_payload() {
        let text = wrapped(AgentRole::Reviewer, CLEAN_REVIEW);
        let payload = extract_review(&text).expect("payload");
        assert!(payload.findings.is_empty());
        assert!(payload.overall_correct);
    }

    #[test]
    fn extraction_uses_last_delimiter_pair() {
        // Agents often restate their instructions, which mention the tokens
        // literally, before the real payload.
        let (begin, end) = delimiters(AgentRole::Reviewer);
        let text = format!(
            "I will emit my result between {begin} and {end} as instructed.\n\
             {begin}\n{{\"findings\":[{{\"priority\":\"low\",\"title\":\"old\"}}],\"overall_correct\":false}}\n{end}\n\
             Wait, correcting myself:\n\
             {begin}\n{CLEAN_REVIEW}\n{end}\n"
        );
        let payload = extract_review(&text).expect("payload");
        assert!(payload.findings.is_empty(), "must take the last payload");
    }

    #[test]
    fn extraction_returns_none_without_end_token() {
        let (begin, _) = delimiters(AgentRole::Reviewer);
        let text = format!("{begin}\n{CLEAN_REVIEW}\n");
        assert!(extract_review(&text).is_none());
    }

    #[test]
    fn malformed_json_yields_none() {
        let text = wrapped(AgentRole::Reviewer, "{not json");
        assert!(extract_review(&text).is_none());
    }

    #[test]
    fn schema_violation_yields_none() {
        // `findings` present but `overall_correct` missing.
        let text = wrapped(AgentRole::Reviewer, r#"{"findings":[]}"#);
        assert!(extract_review(&text).is_none());

        // Unknown priority value.
        let text = wrapped(
            AgentRole::Reviewer,
            r#"{"findings":[{"priority":"urgent","title":"x"}],"overall_correct":false}"#,
        );
        assert!(extract_review(&text).is_none());
    }

    #[test]
    fn fixer_payload_round_trips_with_lists() {
        let json = r#"{
            "decision": "applied",
            "fixes": [{"priority": "high", "title": "null check", "file": "src/api.rs"}],
            "skipped": [{"title": "style nit", "reason": "out of scope"}]
        }"#;
        let text = wrapped(AgentRole::Fixer, json);
        let payload = extract_fix(AgentRole::Fixer, &text).expect("payload");
        assert_eq!(payload.decision, FixDecision::Applied);
        assert_eq!(payload.fixes.len(), 1);
        assert_eq!(payload.fixes[0].priority, FindingPriority::High);
        assert_eq!(payload.skipped[0].reason, "out of scope");
    }

    #[test]
    fn reviewer_delimiters_do_not_match_fixer_output() {
        let text = wrapped(AgentRole::Fixer, r#"{"decision":"no_changes_needed"}"#);
        assert!(extract_review(&text).is_none());
    }

    #[test]
    fn retry_prompt_names_the_delimiters() {
        let prompt = build_retry_prompt(AgentRole::Reviewer);
        assert!(prompt.contains("[[REVIEW-RESULT-BEGIN]]"));
        assert!(prompt.contains("[[REVIEW-RESULT-END]]"));
        assert!(!prompt.contains("Do not edit any files"));

        let prompt = build_retry_prompt(AgentRole::Fixer);
        assert!(prompt.contains("[[FIX-RESULT-BEGIN]]"));
        assert!(prompt.contains("Do not edit any files"));
    }
}
