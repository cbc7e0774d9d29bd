//! Shared plain-data types for the cycle controller.
//!
//! These types cross the boundary between the controller, the agent and PR
//! adapters, and the cycle records written to disk, so they stay free of I/O.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::ledger::CostLedger;

/// Purpose of a single agent run within a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Improve,
    Review,
    Fix,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Improve => "improve",
            Role::Review => "review",
            Role::Fix => "fix",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token and cost usage reported by one agent run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    pub cost_usd: f64,
}

/// Successful reply from an agent invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentReply {
    /// Final free-text message from the agent.
    pub text: String,
    /// Session identifier usable to resume the conversation, if the backend reports one.
    pub session_id: Option<String>,
    pub usage: Usage,
}

/// What the agent should work toward in the improve step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goal {
    /// Human-readable title, used in PR titles and summaries.
    pub title: String,
    /// Branch-safe slug, used in generated branch names.
    pub slug: String,
    /// Instructions handed to the improve prompt.
    pub prompt: String,
}

/// Reference to an opened pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrRef {
    pub number: u64,
    pub url: String,
}

/// Review decision as reported by the git hosting service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewState {
    Approved,
    ChangesRequested,
    Pending,
}

/// Strategy used when merging an approved pull request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeMethod {
    Merge,
    #[default]
    Squash,
    Rebase,
}

impl MergeMethod {
    pub fn gh_flag(self) -> &'static str {
        match self {
            MergeMethod::Merge => "--merge",
            MergeMethod::Squash => "--squash",
            MergeMethod::Rebase => "--rebase",
        }
    }
}

/// Cycle step at which a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Setup,
    Improve,
    Publish,
    Review,
    Fix,
    Merge,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Setup => "setup",
            Stage::Improve => "improve",
            Stage::Publish => "publish",
            Stage::Review => "review",
            Stage::Fix => "fix",
            Stage::Merge => "merge",
        };
        f.write_str(s)
    }
}

/// Terminal state of a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CycleOutcome {
    /// Reviewer approved and the PR was merged.
    Merged,
    /// Reviewer approved; the PR stays open (auto-merge off or vetoed).
    Approved,
    /// Fix budget spent without approval; the PR stays open.
    Exhausted,
    /// The improve step produced nothing to commit.
    NoChanges,
    /// Commit-only mode committed to the current branch.
    Committed,
    Failed { stage: Stage, reason: String },
}

impl CycleOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, CycleOutcome::Failed { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            CycleOutcome::Merged => "merged",
            CycleOutcome::Approved => "approved",
            CycleOutcome::Exhausted => "exhausted",
            CycleOutcome::NoChanges => "no changes",
            CycleOutcome::Committed => "committed",
            CycleOutcome::Failed { .. } => "failed",
        }
    }
}

/// Summary of one finished cycle. Individual runs are folded into `ledger`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleResult {
    /// Directory the cycle was scoped to (`.` for the whole project).
    pub label: String,
    pub branch: String,
    pub pr: Option<PrRef>,
    /// Number of fixer runs that completed.
    pub fix_runs: u32,
    pub outcome: CycleOutcome,
    pub ledger: CostLedger,
    /// One-line subjects of the commits the cycle produced.
    pub commits: Vec<String>,
    pub duration_ms: u64,
}

impl CycleResult {
    /// Result for a cycle that never got to run its controller.
    pub fn failed_before_start(label: &str, branch: &str, stage: Stage, reason: String) -> Self {
        Self {
            label: label.to_string(),
            branch: branch.to_string(),
            pr: None,
            fix_runs: 0,
            outcome: CycleOutcome::Failed { stage, reason },
            ledger: CostLedger::default(),
            commits: Vec::new(),
            duration_ms: 0,
        }
    }
}
