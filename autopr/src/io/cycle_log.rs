//! Per-cycle logging under `<git-common-dir>/autopr/`.
//!
//! State lives in the git common directory so it is shared by worker
//! worktrees and never picked up by `git add -A`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::branch::slugify;
use crate::core::types::{CycleResult, Role};
use crate::io::config::write_atomic;
use crate::io::git::Git;

pub const STATE_DIR_NAME: &str = "autopr";

/// `<git-common-dir>/autopr` for the repository at `git`'s working directory.
pub fn state_dir(git: &Git) -> Result<PathBuf> {
    Ok(git.common_dir()?.join(STATE_DIR_NAME))
}

#[derive(Debug, Clone)]
pub struct CyclePaths {
    pub dir: PathBuf,
    pub record_path: PathBuf,
}

impl CyclePaths {
    /// `cycles/<stamp>-<label>-<token>/` under the state directory.
    pub fn new(state_dir: &Path, stamp: &str, label: &str, token: &str) -> Self {
        let dir = state_dir
            .join("cycles")
            .join(format!("{stamp}-{}-{token}", slugify(label, 30)));
        Self {
            record_path: dir.join("cycle.json"),
            dir,
        }
    }

    /// Log file for one agent run; `round` distinguishes repeated review/fix runs.
    pub fn run_log(&self, role: Role, round: u32) -> PathBuf {
        match role {
            Role::Improve => self.dir.join("improve.log"),
            Role::Review | Role::Fix => self.dir.join(format!("{}-{round}.log", role.as_str())),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CycleRecord<'a> {
    pub goal: &'a str,
    pub started_at: String,
    pub ended_at: String,
    #[serde(flatten)]
    pub result: &'a CycleResult,
}

pub fn write_cycle_record(paths: &CyclePaths, record: &CycleRecord<'_>) -> Result<()> {
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create cycle dir {}", paths.dir.display()))?;
    let mut buf = serde_json::to_string_pretty(record).context("serialize cycle record")?;
    buf.push('\n');
    write_atomic(&paths.record_path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ledger::CostLedger;
    use crate::core::types::CycleOutcome;

    #[test]
    fn run_logs_are_named_by_role_and_round() {
        let paths = CyclePaths::new(Path::new("/state"), "20260101-000000", "src/api", "abcd");
        assert_eq!(
            paths.dir,
            PathBuf::from("/state/cycles/20260101-000000-src-api-abcd")
        );
        assert!(paths.run_log(Role::Improve, 0).ends_with("improve.log"));
        assert!(paths.run_log(Role::Review, 2).ends_with("review-2.log"));
        assert!(paths.run_log(Role::Fix, 1).ends_with("fix-1.log"));
    }

    #[test]
    fn record_is_written_as_json() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = CyclePaths::new(temp.path(), "20260101-000000", ".", "wxyz");
        let result = CycleResult {
            label: ".".to_string(),
            branch: "auto-docs/20260101-000000-wxyz".to_string(),
            pr: None,
            fix_runs: 0,
            outcome: CycleOutcome::NoChanges,
            ledger: CostLedger::default(),
            commits: Vec::new(),
            duration_ms: 12,
        };
        let record = CycleRecord {
            goal: "Improve Documentation",
            started_at: "2026-01-01T00:00:00+00:00".to_string(),
            ended_at: "2026-01-01T00:00:01+00:00".to_string(),
            result: &result,
        };
        write_cycle_record(&paths, &record).expect("write");
        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&paths.record_path).expect("read"))
                .expect("json");
        assert_eq!(value["outcome"]["state"], "no_changes");
        assert_eq!(value["goal"], "Improve Documentation");
        assert_eq!(value["duration_ms"], 12);
    }
}
