//! Prompt rendering for the improve, review and fix roles.

use anyhow::Result;
use minijinja::{Environment, context};

use crate::core::types::{Goal, PrRef};

const IMPROVE_TEMPLATE: &str = include_str!("prompts/improve.md");
const REVIEW_TEMPLATE: &str = include_str!("prompts/review.md");
const FIX_TEMPLATE: &str = include_str!("prompts/fix.md");

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("improve", IMPROVE_TEMPLATE)
            .expect("improve template should be valid");
        env.add_template("review", REVIEW_TEMPLATE)
            .expect("review template should be valid");
        env.add_template("fix", FIX_TEMPLATE)
            .expect("fix template should be valid");
        Self { env }
    }

    /// `scope` is the directory the cycle is confined to, or `None` for the whole project.
    pub fn improve(&self, goal: &Goal, scope: Option<&str>) -> Result<String> {
        let template = self.env.get_template("improve")?;
        Ok(template.render(context! {
            scope => scope,
            title => goal.title.trim(),
            prompt => goal.prompt.trim(),
        })?)
    }

    pub fn review(&self, pr: &PrRef, goal: &Goal, base: &str, scope: Option<&str>) -> Result<String> {
        let template = self.env.get_template("review")?;
        Ok(template.render(context! {
            number => pr.number,
            url => pr.url.as_str(),
            base => base,
            title => goal.title.trim(),
            scope => scope,
        })?)
    }

    pub fn fix(&self, pr: &PrRef, feedback: &str, round: u32, scope: Option<&str>) -> Result<String> {
        let template = self.env.get_template("fix")?;
        let feedback = feedback.trim();
        let feedback = if feedback.is_empty() {
            "(the reviewer gave no details; re-check the change against its goal)"
        } else {
            feedback
        };
        Ok(template.render(context! {
            number => pr.number,
            feedback => feedback,
            round => round,
            scope => scope,
        })?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn goal() -> Goal {
        Goal {
            title: "Fix Bugs".to_string(),
            slug: "fix-bugs".to_string(),
            prompt: "Find and fix bugs.".to_string(),
        }
    }

    fn pr() -> PrRef {
        PrRef {
            number: 42,
            url: "https://github.com/o/r/pull/42".to_string(),
        }
    }

    #[test]
    fn improve_without_scope_has_no_constraints() {
        let engine = PromptEngine::new();
        let text = engine.improve(&goal(), None).expect("render");
        assert!(text.contains("# Task: Fix Bugs"));
        assert!(text.contains("Find and fix bugs."));
        assert!(!text.contains("ONLY on the directory"));
    }

    #[test]
    fn improve_with_scope_confines_directory() {
        let engine = PromptEngine::new();
        let text = engine.improve(&goal(), Some("src/api")).expect("render");
        assert!(text.starts_with("You are working ONLY on the directory: src/api"));
        assert!(text.contains("`src/api/`"));
    }

    #[test]
    fn review_names_pr_and_verdict_markers() {
        let engine = PromptEngine::new();
        let text = engine.review(&pr(), &goal(), "main", None).expect("render");
        assert!(text.contains("#42"));
        assert!(text.contains("git diff main...HEAD"));
        assert!(text.contains("APPROVED"));
        assert!(text.contains("CHANGES_REQUESTED"));
    }

    #[test]
    fn fix_carries_feedback_and_round() {
        let engine = PromptEngine::new();
        let text = engine
            .fix(&pr(), "Rename the helper", 2, Some("docs"))
            .expect("render");
        assert!(text.contains("Rename the helper"));
        assert!(text.contains("fix round 2"));
        assert!(text.contains("`docs/`"));

        let empty = engine.fix(&pr(), "  ", 1, None).expect("render");
        assert!(empty.contains("gave no details"));
    }
}
