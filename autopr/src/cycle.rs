//! The iteration controller: one Improve → Publish → Review → Fix* cycle.
//!
//! Every error inside a cycle is converted into [`CycleOutcome::Failed`] at
//! the cycle boundary, so callers always get a [`CycleResult`] back.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use chrono::Local;
use tracing::{debug, info, instrument, warn};

use crate::core::branch::validate_branch_name;
use crate::core::ledger::CostLedger;
use crate::core::types::{
    AgentReply, CycleOutcome, CycleResult, Goal, MergeMethod, PrRef, ReviewState, Role, Stage,
};
use crate::core::verdict::{Verdict, parse_verdict};
use crate::io::agent::{Agent, AgentRequest};
use crate::io::cycle_log::{CyclePaths, CycleRecord, write_cycle_record};
use crate::io::git::Git;
use crate::io::github::{PrClient, PrRequest};
use crate::io::prompt::PromptEngine;

/// Whether the cycle creates its branch or finds it already checked out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchPlan {
    /// Checkout base, update it, and create the branch.
    Create,
    /// The branch is already checked out (worker worktrees).
    Existing,
}

/// What a single cycle works on.
#[derive(Debug, Clone)]
pub struct CycleSpec {
    /// Directory label for summaries (`.` for the whole project).
    pub label: String,
    /// Git working directory the agent and git run in.
    pub workdir: PathBuf,
    /// Directory the agent is confined to, relative to `workdir`.
    pub scope: Option<String>,
    pub goal: Goal,
    pub branch: String,
    pub base_branch: String,
    pub plan: BranchPlan,
    /// Where run logs go; `None` disables them.
    pub logs: Option<CyclePaths>,
}

/// Knobs shared by every cycle of a run.
#[derive(Debug, Clone)]
pub struct CycleOptions {
    pub max_iterations: u32,
    pub auto_merge: bool,
    /// Commit to the current branch after Improve and stop.
    pub no_pr: bool,
    pub remote: String,
    pub run_timeout: Duration,
    pub output_limit_bytes: usize,
    pub resume_sessions: bool,
    pub comment_reviews: bool,
    pub merge_method: MergeMethod,
}

impl Default for CycleOptions {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            auto_merge: false,
            no_pr: false,
            remote: "origin".to_string(),
            run_timeout: Duration::from_secs(30 * 60),
            output_limit_bytes: 1_000_000,
            resume_sessions: true,
            comment_reviews: true,
            merge_method: MergeMethod::Squash,
        }
    }
}

/// Run one cycle to a terminal state.
#[instrument(skip_all, fields(label = %spec.label, branch = %spec.branch))]
pub fn run_cycle<A: Agent, P: PrClient>(
    spec: &CycleSpec,
    agent: &A,
    prs: &P,
    options: &CycleOptions,
) -> CycleResult {
    let start = Instant::now();
    let mut cycle = Cycle {
        spec,
        agent,
        prs,
        options,
        git: Git::new(&spec.workdir),
        prompts: PromptEngine::new(),
        branch: spec.branch.clone(),
        ledger: CostLedger::default(),
        sessions: Sessions::default(),
        fix_runs: 0,
        pr: None,
        improve_summary: String::new(),
        head_before: None,
        created_branch: false,
    };

    let outcome = match cycle.drive() {
        Ok(outcome) => outcome,
        Err(StageError { stage, error }) => {
            warn!(%stage, err = %format!("{error:#}"), "cycle failed");
            CycleOutcome::Failed {
                stage,
                reason: format!("{error:#}"),
            }
        }
    };
    let commits = cycle.finish(&outcome);
    info!(outcome = outcome.label(), fix_runs = cycle.fix_runs, "cycle finished");

    CycleResult {
        label: spec.label.clone(),
        branch: cycle.branch,
        pr: cycle.pr,
        fix_runs: cycle.fix_runs,
        outcome,
        ledger: cycle.ledger,
        commits,
        duration_ms: u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
    }
}

/// [`run_cycle`], then persist the cycle record when `spec.logs` is set.
pub fn run_recorded<A: Agent, P: PrClient>(
    spec: &CycleSpec,
    agent: &A,
    prs: &P,
    options: &CycleOptions,
) -> CycleResult {
    let started_at = Local::now();
    let result = run_cycle(spec, agent, prs, options);
    if let Some(paths) = &spec.logs {
        let record = CycleRecord {
            goal: &spec.goal.title,
            started_at: started_at.to_rfc3339(),
            ended_at: Local::now().to_rfc3339(),
            result: &result,
        };
        if let Err(e) = write_cycle_record(paths, &record) {
            warn!(err = %format!("{e:#}"), "could not write cycle record");
        }
    }
    result
}

struct StageError {
    stage: Stage,
    error: anyhow::Error,
}

type StageResult<T> = std::result::Result<T, StageError>;

trait AtStage<T> {
    fn at(self, stage: Stage) -> StageResult<T>;
}

impl<T> AtStage<T> for Result<T> {
    fn at(self, stage: Stage) -> StageResult<T> {
        self.map_err(|error| StageError { stage, error })
    }
}

/// Session ids carried between runs: the fixer continues the author's
/// conversation, the reviewer continues its own.
#[derive(Debug, Default)]
struct Sessions {
    author: Option<String>,
    reviewer: Option<String>,
}

struct Cycle<'a, A, P> {
    spec: &'a CycleSpec,
    agent: &'a A,
    prs: &'a P,
    options: &'a CycleOptions,
    git: Git,
    prompts: PromptEngine,
    branch: String,
    ledger: CostLedger,
    sessions: Sessions,
    fix_runs: u32,
    pr: Option<PrRef>,
    improve_summary: String,
    head_before: Option<String>,
    created_branch: bool,
}

impl<A: Agent, P: PrClient> Cycle<'_, A, P> {
    fn drive(&mut self) -> StageResult<CycleOutcome> {
        self.prepare().at(Stage::Setup)?;
        self.improve().at(Stage::Improve)?;

        if self.options.no_pr {
            return self.commit_only().at(Stage::Publish);
        }

        let Some(pr) = self.publish().at(Stage::Publish)? else {
            info!("improve step produced no changes");
            return Ok(CycleOutcome::NoChanges);
        };
        self.review_loop(&pr)
    }

    fn prepare(&mut self) -> Result<()> {
        self.git.ensure_clean()?;
        if self.options.no_pr {
            self.branch = self.git.current_branch()?;
        } else {
            validate_branch_name(&self.branch)?;
            match self.spec.plan {
                BranchPlan::Create => {
                    if self.git.branch_exists(&self.branch)? {
                        return Err(anyhow!("branch '{}' already exists", self.branch));
                    }
                    self.git.checkout_branch(&self.spec.base_branch)?;
                    if let Err(e) = self.git.pull_rebase() {
                        warn!(err = %format!("{e:#}"), "could not update base branch, continuing");
                    }
                    self.git.checkout_new_branch(&self.branch)?;
                    self.created_branch = true;
                }
                BranchPlan::Existing => {
                    let current = self.git.current_branch()?;
                    if current != self.branch {
                        return Err(anyhow!(
                            "expected branch '{}' to be checked out, found '{current}'",
                            self.branch
                        ));
                    }
                }
            }
        }
        self.head_before = Some(self.git.head_sha()?);
        debug!(branch = %self.branch, "cycle prepared");
        Ok(())
    }

    fn improve(&mut self) -> Result<()> {
        info!(goal = %self.spec.goal.title, "improve");
        let prompt = self
            .prompts
            .improve(&self.spec.goal, self.spec.scope.as_deref())?;
        let reply = self.invoke(Role::Improve, prompt, None, 0)?;
        self.sessions.author = reply.session_id;
        self.improve_summary = reply.text;
        Ok(())
    }

    fn commit_only(&mut self) -> Result<CycleOutcome> {
        self.git.add_all()?;
        self.git.commit_staged(&self.commit_message(None))?;
        let head = self.git.head_sha()?;
        if self.head_before.as_deref() == Some(head.as_str()) {
            info!("improve step produced no changes");
            return Ok(CycleOutcome::NoChanges);
        }
        info!(branch = %self.branch, "committed without opening a pull request");
        Ok(CycleOutcome::Committed)
    }

    /// Commit leftovers, push, and open the PR. `None` when there is nothing to publish.
    fn publish(&mut self) -> Result<Option<PrRef>> {
        self.git.add_all()?;
        self.git.commit_staged(&self.commit_message(None))?;
        if self.git.commits_ahead(&self.spec.base_branch)? == 0 {
            return Ok(None);
        }
        self.git.push_branch(&self.options.remote, &self.branch)?;
        let pr = self.prs.create_pr(&PrRequest {
            head: self.branch.clone(),
            base: self.spec.base_branch.clone(),
            title: self.pr_title(),
            body: self.pr_body(),
        })?;
        info!(number = pr.number, url = %pr.url, "published");
        self.pr = Some(pr.clone());
        Ok(Some(pr))
    }

    fn review_loop(&mut self, pr: &PrRef) -> StageResult<CycleOutcome> {
        let scope = self.spec.scope.clone();
        loop {
            let round = self.fix_runs + 1;
            info!(pr = pr.number, round, "review");
            let prompt = self
                .prompts
                .review(pr, &self.spec.goal, &self.spec.base_branch, scope.as_deref())
                .at(Stage::Review)?;
            let resume = self.sessions.reviewer.clone();
            let reply = self
                .invoke(Role::Review, prompt, resume, round)
                .at(Stage::Review)?;
            if reply.session_id.is_some() {
                self.sessions.reviewer = reply.session_id.clone();
            }
            if self.options.comment_reviews {
                let body = format!("**autopr review, round {round}**\n\n{}", reply.text.trim());
                if let Err(e) = self.prs.comment(pr, &body) {
                    warn!(err = %format!("{e:#}"), "could not post review comment");
                }
            }

            let feedback = match parse_verdict(&reply.text) {
                Verdict::Approved => return self.approved(pr).at(Stage::Merge),
                Verdict::ChangesRequested { feedback, explicit } => {
                    if !explicit {
                        warn!("reviewer gave no clear verdict, treating as changes requested");
                    }
                    feedback
                }
            };

            if self.fix_runs >= self.options.max_iterations {
                info!(fix_runs = self.fix_runs, "fix budget exhausted, leaving pull request open");
                return Ok(CycleOutcome::Exhausted);
            }

            info!(pr = pr.number, round, "fix");
            let prompt = self
                .prompts
                .fix(pr, &feedback, round, scope.as_deref())
                .at(Stage::Fix)?;
            let resume = self.sessions.author.clone();
            let reply = self.invoke(Role::Fix, prompt, resume, round).at(Stage::Fix)?;
            if reply.session_id.is_some() {
                self.sessions.author = reply.session_id;
            }
            self.fix_runs += 1;

            self.git.add_all().at(Stage::Publish)?;
            self.git
                .commit_staged(&self.commit_message(Some(round)))
                .at(Stage::Publish)?;
            self.git
                .push_branch(&self.options.remote, &self.branch)
                .at(Stage::Publish)?;
        }
    }

    fn approved(&mut self, pr: &PrRef) -> Result<CycleOutcome> {
        info!(pr = pr.number, "reviewer approved");
        if !self.options.auto_merge {
            return Ok(CycleOutcome::Approved);
        }
        match self.prs.review_state(pr) {
            Ok(ReviewState::ChangesRequested) => {
                warn!(pr = pr.number, "a human reviewer requested changes, not merging");
                return Ok(CycleOutcome::Approved);
            }
            Ok(state) => debug!(?state, "hosting review state allows merge"),
            Err(e) => {
                warn!(err = %format!("{e:#}"), "could not read review state, not merging");
                return Ok(CycleOutcome::Approved);
            }
        }
        self.prs.merge(pr, self.options.merge_method)?;
        if let Err(e) = self.prs.delete_branch(&self.branch) {
            warn!(err = %format!("{e:#}"), "could not delete remote branch");
        }
        Ok(CycleOutcome::Merged)
    }

    /// One agent run. A failed run that tried to resume a session is retried
    /// once in a fresh session.
    fn invoke(
        &mut self,
        role: Role,
        prompt: String,
        resume: Option<String>,
        round: u32,
    ) -> Result<AgentReply> {
        let mut request = AgentRequest {
            role,
            workdir: self.spec.workdir.clone(),
            prompt,
            resume: resume.filter(|_| self.options.resume_sessions),
            timeout: self.options.run_timeout,
            output_limit_bytes: self.options.output_limit_bytes,
            log_path: self.spec.logs.as_ref().map(|p| p.run_log(role, round)),
        };
        let reply = match self.agent.invoke(&request) {
            Ok(reply) => reply,
            Err(e) if request.resume.is_some() => {
                warn!(%role, err = %format!("{e:#}"), "resumed run failed, retrying in a fresh session");
                request.resume = None;
                self.agent.invoke(&request)?
            }
            Err(e) => return Err(e),
        };
        self.ledger.record(&reply.usage);
        debug!(%role, cost_usd = reply.usage.cost_usd, "run recorded");
        Ok(reply)
    }

    /// Collect commits and return the working copy to the base branch.
    fn finish(&self, outcome: &CycleOutcome) -> Vec<String> {
        let owns_branch = self.created_branch
            || (self.spec.plan == BranchPlan::Existing && self.head_before.is_some());
        if outcome.is_failure() && owns_branch && !self.options.no_pr {
            self.save_leftovers();
        }

        let range = if self.options.no_pr {
            self.head_before.as_ref().map(|head| format!("{head}..HEAD"))
        } else if self.head_before.is_some() {
            Some(format!("{}..HEAD", self.spec.base_branch))
        } else {
            None
        };
        let commits = match range {
            Some(range) => self.git.commit_subjects(&range).unwrap_or_else(|e| {
                warn!(err = %format!("{e:#}"), "could not list cycle commits");
                Vec::new()
            }),
            None => Vec::new(),
        };

        if self.created_branch {
            if let Err(e) = self.git.checkout_branch(&self.spec.base_branch) {
                warn!(err = %format!("{e:#}"), "could not return to base branch");
            } else if *outcome == CycleOutcome::NoChanges
                && let Err(e) = self.git.delete_local_branch(&self.branch)
            {
                warn!(err = %format!("{e:#}"), "could not delete empty branch");
            }
        }
        commits
    }

    /// Keep a failed cycle's uncommitted work on its own branch so the base stays clean.
    fn save_leftovers(&self) {
        let saved = self
            .git
            .add_all()
            .and_then(|()| self.git.commit_staged("autopr: save work from failed cycle"));
        match saved {
            Ok(true) => info!(branch = %self.branch, "saved uncommitted work from failed cycle"),
            Ok(false) => {}
            Err(e) => warn!(err = %format!("{e:#}"), "could not save uncommitted work"),
        }
    }

    fn commit_message(&self, fix_round: Option<u32>) -> String {
        let prefix = match &self.spec.scope {
            Some(scope) => format!("autopr({scope})"),
            None => "autopr".to_string(),
        };
        match fix_round {
            Some(round) => format!("{prefix}: address review feedback (round {round})"),
            None => format!("{prefix}: {}", self.spec.goal.title),
        }
    }

    fn pr_title(&self) -> String {
        match &self.spec.scope {
            Some(scope) => format!("[autopr] {} ({scope})", self.spec.goal.title),
            None => format!("[autopr] {}", self.spec.goal.title),
        }
    }

    fn pr_body(&self) -> String {
        let mut body = format!("Automated change: **{}**\n", self.spec.goal.title);
        if let Some(scope) = &self.spec.scope {
            body.push_str(&format!("\nScope: `{scope}/`\n"));
        }
        let summary = self.improve_summary.trim();
        if !summary.is_empty() {
            body.push_str("\n## Summary\n\n");
            body.push_str(summary);
            body.push('\n');
        }
        body
    }
}
