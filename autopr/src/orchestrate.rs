//! One scheduled batch: a single project-wide cycle or a worker fan-out.

use std::path::PathBuf;

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::core::branch::cycle_branch_name;
use crate::core::types::{CycleResult, Goal};
use crate::cycle::{BranchPlan, CycleOptions, CycleSpec, run_recorded};
use crate::io::agent::Agent;
use crate::io::cycle_log::CyclePaths;
use crate::io::github::PrClient;
use crate::io::lock::LockFile;
use crate::io::naming::{branch_stamp, branch_token};
use crate::io::notify::{Notifier, notify_best_effort};
use crate::summary::notification_text;
use crate::workers::{FanOutOptions, WorkerTask, fan_out};

pub const LOCK_FILE_NAME: &str = "autopr.lock";

/// What each batch runs.
#[derive(Debug, Clone)]
pub enum BatchPlan {
    /// One cycle over the whole project.
    Single { goal: Goal },
    Workers {
        tasks: Vec<WorkerTask>,
        parallel: bool,
        max_workers: Option<usize>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    Ran(Vec<CycleResult>),
    /// Another orchestrator holds the repository lock.
    Skipped,
}

/// Everything a batch needs, fixed for the lifetime of the process.
pub struct Orchestrator<A, P, N> {
    pub root: PathBuf,
    /// `<git-common-dir>/autopr`.
    pub state_dir: PathBuf,
    pub base_branch: String,
    pub options: CycleOptions,
    pub agent: A,
    pub prs: P,
    pub notifier: N,
}

impl<A, P, N> Orchestrator<A, P, N>
where
    A: Agent + Sync,
    P: PrClient + Sync,
    N: Notifier,
{
    /// Run one batch under the repository lock, then notify per cycle.
    #[instrument(skip_all, fields(root = %self.root.display()))]
    pub fn run_batch(&self, plan: &BatchPlan) -> Result<BatchOutcome> {
        let mut lock = LockFile::new(self.state_dir.join(LOCK_FILE_NAME));
        if !lock.acquire()? {
            warn!(lock = %lock.path().display(), "another autopr instance is working on this repository, skipping batch");
            return Ok(BatchOutcome::Skipped);
        }

        let results = match plan {
            BatchPlan::Single { goal } => vec![self.single_cycle(goal)],
            BatchPlan::Workers {
                tasks,
                parallel,
                max_workers,
            } => {
                let options = FanOutOptions {
                    parallel: *parallel,
                    max_workers: *max_workers,
                    base_branch: self.base_branch.clone(),
                    cycle: self.options.clone(),
                    state_dir: self.state_dir.clone(),
                };
                fan_out(&self.root, tasks, &self.agent, &self.prs, &options)
            }
        };
        lock.release();

        for result in &results {
            notify_best_effort(&self.notifier, &notification_text(result));
        }
        Ok(BatchOutcome::Ran(results))
    }

    fn single_cycle(&self, goal: &Goal) -> CycleResult {
        let stamp = branch_stamp();
        let token = branch_token();
        let spec = CycleSpec {
            label: ".".to_string(),
            workdir: self.root.clone(),
            scope: None,
            goal: goal.clone(),
            branch: cycle_branch_name(&goal.slug, &stamp, &token),
            base_branch: self.base_branch.clone(),
            plan: BranchPlan::Create,
            logs: Some(CyclePaths::new(&self.state_dir, &stamp, &goal.slug, &token)),
        };
        info!(goal = %goal.title, branch = %spec.branch, "starting cycle");
        run_recorded(&spec, &self.agent, &self.prs, &self.options)
    }
}
