//! Branch naming and validation.

use anyhow::{Result, bail};

const MAX_BRANCH_LEN: usize = 250;

/// Characters that are either shell metacharacters or invalid in git refs.
const FORBIDDEN: &[char] = &[
    ';', '&', '|', '$', '`', '<', '>', '(', ')', '\\', '\'', '"', '~', '^', ':', '?', '*', '[',
];

/// Lowercase `input` into `[a-z0-9-]`, collapsing runs of other characters
/// into a single dash and trimming to `max_len`.
pub fn slugify(input: &str, max_len: usize) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_dash = false;
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    if out.len() > max_len {
        out.truncate(max_len);
    }
    let trimmed = out.trim_end_matches('-');
    if trimmed.is_empty() {
        "root".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Branch for a whole-project cycle: `auto-<slug>/<stamp>-<token>`.
pub fn cycle_branch_name(slug: &str, stamp: &str, token: &str) -> String {
    format!("auto-{}/{stamp}-{token}", slugify(slug, 40))
}

/// Branch for a directory worker: `auto-worker<id>-<dir>/<stamp>-<token>`.
pub fn worker_branch_name(id: usize, directory: &str, stamp: &str, token: &str) -> String {
    format!("auto-worker{id}-{}/{stamp}-{token}", slugify(directory, 20))
}

/// Reject names that git would refuse or that could be misread by a shell.
pub fn validate_branch_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("branch name cannot be empty");
    }
    if name.len() > MAX_BRANCH_LEN {
        bail!("branch name too long ({} > {MAX_BRANCH_LEN})", name.len());
    }
    if let Some(ch) = name
        .chars()
        .find(|c| FORBIDDEN.contains(c) || c.is_whitespace() || c.is_control())
    {
        bail!("branch name contains invalid character {ch:?}: {name}");
    }
    if name.starts_with('-') || name.starts_with('.') {
        bail!("branch name cannot start with '-' or '.': {name}");
    }
    if name.contains("..") || name.contains("//") || name.contains("@{") {
        bail!("branch name contains an invalid sequence: {name}");
    }
    if name.ends_with(".lock") || name.ends_with('/') || name.ends_with('.') {
        bail!("branch name has an invalid ending: {name}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_collapses_separators() {
        assert_eq!(slugify("Fix Bugs & Security!", 40), "fix-bugs-security");
        assert_eq!(slugify("src/core/api", 40), "src-core-api");
        assert_eq!(slugify("  --  ", 40), "root");
        assert_eq!(slugify(".", 20), "root");
    }

    #[test]
    fn slugify_truncates_without_trailing_dash() {
        assert_eq!(slugify("abcdef ghij", 7), "abcdef");
    }

    #[test]
    fn generated_names_are_valid() {
        let cycle = cycle_branch_name("fix_bugs-security", "20260101-120000", "abcd");
        assert_eq!(cycle, "auto-fix-bugs-security/20260101-120000-abcd");
        validate_branch_name(&cycle).expect("valid cycle branch");

        let worker = worker_branch_name(2, "src/api", "20260101-120000", "wxyz");
        assert_eq!(worker, "auto-worker2-src-api/20260101-120000-wxyz");
        validate_branch_name(&worker).expect("valid worker branch");
    }

    #[test]
    fn rejects_shell_metacharacters() {
        for name in ["feat;rm -rf", "a|b", "x$(id)", "a`b`", "quote'd", "sp ace"] {
            let err = validate_branch_name(name).expect_err(name);
            assert!(err.to_string().contains("invalid character"), "{err}");
        }
    }

    #[test]
    fn rejects_git_ref_violations() {
        for name in ["", "-lead", ".hidden", "a..b", "a//b", "x@{1}", "y.lock", "dir/", "end."] {
            assert!(validate_branch_name(name).is_err(), "accepted {name:?}");
        }
        let long = "a".repeat(MAX_BRANCH_LEN + 1);
        let err = validate_branch_name(&long).expect_err("too long");
        assert!(err.to_string().contains("too long"));
    }

    #[test]
    fn accepts_ordinary_names() {
        for name in ["main", "feature/x-1", "release_2.0", "auto-docs/20260101-000000-abcd"] {
            validate_branch_name(name).expect(name);
        }
    }
}
