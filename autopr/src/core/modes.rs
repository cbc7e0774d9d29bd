//! Preset improvement modes and goal construction.

use anyhow::{Result, bail};

use crate::core::branch::slugify;
use crate::core::types::Goal;

/// A named, reusable improvement goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mode {
    pub key: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub prompt: &'static str,
}

pub const MODES: &[Mode] = &[
    Mode {
        key: "fix_bugs",
        name: "Fix Bugs",
        description: "Find and fix bugs, logic errors and unhandled edge cases",
        prompt: "Find and fix bugs in this codebase. Look for logic errors, unhandled \
                 edge cases, incorrect error handling and resource leaks. Fix the most \
                 impactful issues you can verify.",
    },
    Mode {
        key: "security",
        name: "Security Review",
        description: "Find and fix security vulnerabilities",
        prompt: "Review this codebase for security vulnerabilities: injection, unsafe \
                 input handling, secrets in code, insecure defaults and missing \
                 authorization checks. Fix what you find.",
    },
    Mode {
        key: "tests",
        name: "Add Tests",
        description: "Add missing tests for untested code paths",
        prompt: "Identify important code paths without test coverage and add focused, \
                 deterministic tests for them. Do not change production behavior.",
    },
    Mode {
        key: "docs",
        name: "Improve Documentation",
        description: "Improve docs, comments and READMEs",
        prompt: "Improve documentation: fix outdated or misleading comments, document \
                 public interfaces and keep README instructions accurate.",
    },
    Mode {
        key: "refactor",
        name: "Refactor",
        description: "Simplify code without changing behavior",
        prompt: "Refactor code to reduce duplication and complexity without changing \
                 behavior. Keep each change small and easy to review.",
    },
    Mode {
        key: "performance",
        name: "Performance",
        description: "Find and fix performance problems",
        prompt: "Find performance problems such as needless allocations, quadratic \
                 loops and redundant I/O, and fix the ones with clear impact.",
    },
];

/// Selects every preset mode.
pub const ALL_MODES: &str = "all";
/// Uses the project's NORTHSTAR.md as the goal.
pub const NORTHSTAR_MODE: &str = "northstar";

pub fn find_mode(key: &str) -> Option<&'static Mode> {
    MODES.iter().find(|mode| mode.key == key)
}

/// Resolve mode keys, expanding `all`. Errors on unknown keys.
pub fn resolve_modes(keys: &[String]) -> Result<Vec<&'static Mode>> {
    let mut resolved: Vec<&'static Mode> = Vec::new();
    for key in keys {
        if key == ALL_MODES {
            for mode in MODES {
                if !resolved.contains(&mode) {
                    resolved.push(mode);
                }
            }
            continue;
        }
        let Some(mode) = find_mode(key) else {
            let known: Vec<&str> = MODES.iter().map(|m| m.key).collect();
            bail!("unknown mode '{key}' (known: {}, {ALL_MODES}, {NORTHSTAR_MODE})", known.join(", "));
        };
        if !resolved.contains(&mode) {
            resolved.push(mode);
        }
    }
    if resolved.is_empty() {
        bail!("no modes selected");
    }
    Ok(resolved)
}

/// Prompt for one or more modes. A single mode uses its prompt verbatim.
pub fn combined_prompt(modes: &[&Mode]) -> String {
    if let [mode] = modes {
        return mode.prompt.to_string();
    }
    let mut out = String::from(
        "You are performing multiple types of code improvements in this session. \
         Address each area below.\n",
    );
    for mode in modes {
        out.push_str(&format!("\n## {}\n{}\n", mode.name, mode.prompt));
    }
    out
}

pub fn mode_names(modes: &[&Mode]) -> String {
    modes
        .iter()
        .map(|mode| mode.name)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Text for `autopr modes`.
pub fn mode_listing() -> String {
    let mut out = String::from("Available modes:\n");
    for mode in MODES {
        out.push_str(&format!("  {:<12} {}\n", mode.key, mode.description));
    }
    out.push_str(&format!("  {ALL_MODES:<12} Run every mode above in one session\n"));
    out.push_str(&format!(
        "  {NORTHSTAR_MODE:<12} Work toward the goals in NORTHSTAR.md\n"
    ));
    out
}

impl Goal {
    pub fn from_modes(modes: &[&Mode]) -> Self {
        let slug = modes
            .iter()
            .map(|mode| mode.key)
            .collect::<Vec<_>>()
            .join("-");
        Self {
            title: mode_names(modes),
            slug: slugify(&slug, 40),
            prompt: combined_prompt(modes),
        }
    }

    /// Goal from free-form text, titled by its first line.
    pub fn from_text(title_hint: &str, text: &str) -> Self {
        let first_line = text
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or(title_hint)
            .trim_start_matches('#')
            .trim();
        let title: String = first_line.chars().take(72).collect();
        Self {
            title,
            slug: slugify(title_hint, 40),
            prompt: text.trim().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn single_mode_prompt_is_verbatim() {
        let modes = resolve_modes(&keys(&["fix_bugs"])).expect("resolve");
        assert_eq!(combined_prompt(&modes), find_mode("fix_bugs").unwrap().prompt);
    }

    #[test]
    fn multiple_modes_are_combined() {
        let modes = resolve_modes(&keys(&["fix_bugs", "security"])).expect("resolve");
        let prompt = combined_prompt(&modes);
        assert!(prompt.contains("multiple types of code improvements"));
        assert!(prompt.contains("## Fix Bugs"));
        assert!(prompt.contains("## Security Review"));
        assert_eq!(mode_names(&modes), "Fix Bugs, Security Review");
    }

    #[test]
    fn all_expands_without_duplicates() {
        let modes = resolve_modes(&keys(&["security", "all"])).expect("resolve");
        assert_eq!(modes.len(), MODES.len());
        assert_eq!(modes[0].key, "security");
    }

    #[test]
    fn unknown_mode_is_rejected() {
        let err = resolve_modes(&keys(&["nope"])).expect_err("unknown");
        assert!(err.to_string().contains("unknown mode 'nope'"));
    }

    #[test]
    fn listing_mentions_every_mode() {
        let listing = mode_listing();
        for mode in MODES {
            assert!(listing.contains(mode.key));
        }
        assert!(listing.contains("all"));
        assert!(listing.contains("northstar"));
    }

    #[test]
    fn goal_from_modes_has_branch_slug() {
        let modes = resolve_modes(&keys(&["fix_bugs"])).expect("resolve");
        let goal = Goal::from_modes(&modes);
        assert_eq!(goal.slug, "fix-bugs");
        assert_eq!(goal.title, "Fix Bugs");
    }

    #[test]
    fn goal_from_text_uses_first_line_as_title() {
        let goal = Goal::from_text("goal", "\n# Ship the API\n\nDetails here\n");
        assert_eq!(goal.title, "Ship the API");
        assert_eq!(goal.slug, "goal");
        assert!(goal.prompt.starts_with("# Ship the API"));
    }
}
