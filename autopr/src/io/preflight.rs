//! Environment checks that must pass before any cycle starts.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{debug, instrument};

use crate::io::git::Git;
use crate::io::process::run_command;

const VERSION_TIMEOUT: Duration = Duration::from_secs(30);

/// What the upcoming run will need.
#[derive(Debug, Clone)]
pub struct Requirements<'a> {
    pub agent_binary: &'a str,
    /// Pushing branches and opening PRs (false in commit-only mode).
    pub needs_github: bool,
    pub remote: &'a str,
    pub base_branch: &'a str,
}

pub fn ensure_directory(path: &Path) -> Result<()> {
    if !path.exists() {
        bail!("project directory does not exist: {}", path.display());
    }
    if !path.is_dir() {
        bail!("project path is not a directory: {}", path.display());
    }
    Ok(())
}

/// Fail fast on missing tools, a missing remote, or a missing base branch.
#[instrument(skip_all, fields(root = %root.display()))]
pub fn check_environment(root: &Path, req: &Requirements<'_>) -> Result<()> {
    ensure_directory(root)?;
    check_binary("git", "git")?;
    check_binary(req.agent_binary, "agent CLI")?;
    if req.needs_github {
        check_binary("gh", "GitHub CLI")?;
    }

    let git = Git::new(root);
    if !git.is_repository() {
        bail!("not a git repository: {}", root.display());
    }
    if req.needs_github {
        let remotes = git.remotes()?;
        if remotes.is_empty() {
            bail!("no git remote configured (add one, or use --no-pr to commit locally)");
        }
        if !remotes.iter().any(|r| r == req.remote) {
            bail!(
                "git remote '{}' not found (have: {})",
                req.remote,
                remotes.join(", ")
            );
        }
        if !git.branch_exists(req.base_branch)? {
            bail!("base branch '{}' does not exist locally", req.base_branch);
        }
    }
    debug!("environment ok");
    Ok(())
}

fn check_binary(binary: &str, label: &str) -> Result<()> {
    let mut cmd = Command::new(binary);
    cmd.arg("--version");
    let output = run_command(cmd, None, VERSION_TIMEOUT, 4096, None)
        .with_context(|| format!("{label} not found: '{binary}' is not installed or not on PATH"))?;
    if !output.success() {
        bail!("{label} '{binary}' is not usable: {}", output.failure_summary());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;

    #[test]
    fn missing_directory_is_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = ensure_directory(&temp.path().join("nope")).expect_err("missing");
        assert!(err.to_string().contains("does not exist"));

        let file = temp.path().join("file.txt");
        std::fs::write(&file, "x").expect("write");
        let err = ensure_directory(&file).expect_err("file");
        assert!(err.to_string().contains("not a directory"));
    }

    #[test]
    fn missing_agent_binary_is_reported() {
        let repo = TestRepo::new();
        let req = Requirements {
            agent_binary: "definitely-not-an-agent-cli",
            needs_github: false,
            remote: "origin",
            base_branch: "main",
        };
        let err = check_environment(repo.path(), &req).expect_err("missing binary");
        assert!(format!("{err:#}").contains("agent CLI not found"));
    }

    #[test]
    fn non_repository_is_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        let req = Requirements {
            agent_binary: "git",
            needs_github: false,
            remote: "origin",
            base_branch: "main",
        };
        let err = check_environment(temp.path(), &req).expect_err("not a repo");
        assert!(err.to_string().contains("not a git repository"));
    }

    #[test]
    fn local_repository_passes_commit_only_checks() {
        let repo = TestRepo::new();
        let req = Requirements {
            agent_binary: "git",
            needs_github: false,
            remote: "origin",
            base_branch: "main",
        };
        check_environment(repo.path(), &req).expect("ok");
    }
}
