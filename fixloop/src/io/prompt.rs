//! Prompt builders for reviewer and fixer runs.
//!
//! Templates carry the delimiter instructions of the structured output
//! protocol; the engine only ever matches the delimiter tokens themselves.
//! Prompt wording is deliberately free to evolve without touching the core.

use minijinja::{Environment, context};

use crate::core::protocol;
use crate::core::types::{AgentRole, ReviewPayload};

const REVIEWER_TEMPLATE: &str = include_str!("prompts/reviewer.md");
const FIXER_TEMPLATE: &str = include_str!("prompts/fixer.md");

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("reviewer", REVIEWER_TEMPLATE)
            .expect("reviewer template should be valid");
        env.add_template("fixer", FIXER_TEMPLATE)
            .expect("fixer template should be valid");
        Self { env }
    }
}

/// Build the reviewer prompt for one iteration.
pub fn build_review_prompt(iteration: u32, branch: Option<&str>) -> String {
    let (begin, end) = protocol::delimiters(AgentRole::Reviewer);
    PromptEngine::new()
        .env
        .get_template("reviewer")
        .expect("reviewer template is registered")
        .render(context! {
            iteration => iteration,
            branch => branch,
            begin => begin,
            end => end,
        })
        .expect("reviewer template rendering should not fail")
}

/// Build the fixer prompt carrying the reviewer's findings payload.
pub fn build_fix_prompt(iteration: u32, review: &ReviewPayload) -> String {
    let (begin, end) = protocol::delimiters(AgentRole::Fixer);
    let findings =
        serde_json::to_string_pretty(&review.findings).expect("findings should serialize");
    PromptEngine::new()
        .env
        .get_template("fixer")
        .expect("fixer template is registered")
        .render(context! {
            iteration => iteration,
            findings => findings,
            begin => begin,
            end => end,
        })
        .expect("fixer template rendering should not fail")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Finding, FindingPriority};

    #[test]
    fn review_prompt_names_the_reviewer_delimiters() {
        let prompt = build_review_prompt(2, Some("dev"));
        assert!(prompt.contains("iteration 2"));
        assert!(prompt.contains("`dev`"));
        assert!(prompt.contains("[[REVIEW-RESULT-BEGIN]]"));
        assert!(prompt.contains("[[REVIEW-RESULT-END]]"));
    }

    #[test]
    fn review_prompt_omits_branch_when_absent() {
        let prompt = build_review_prompt(1, None);
        assert!(!prompt.contains("branch `"));
    }

    #[test]
    fn fix_prompt_embeds_findings_and_fixer_delimiters() {
        let review = ReviewPayload {
            findings: vec![Finding {
                priority: FindingPriority::High,
                title: "off-by-one in pager".to_string(),
                file: Some("src/pager.rs".to_string()),
                line: Some(42),
                detail: None,
            }],
            overall_correct: false,
        };
        let prompt = build_fix_prompt(1, &review);
        assert!(prompt.contains("off-by-one in pager"));
        assert!(prompt.contains("[[FIX-RESULT-BEGIN]]"));
        assert!(prompt.contains("[[FIX-RESULT-END]]"));
        // Reviewer tokens must not leak into the fixer prompt.
        assert!(!prompt.contains("[[REVIEW-RESULT-BEGIN]]"));
    }
}
