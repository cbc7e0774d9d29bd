//! Concurrent worker manager: one cycle per directory, each on its own branch.
//!
//! Sequential mode shares the project working copy. Parallel mode gives every
//! worker its own git worktree under the state directory, so workers never
//! see each other's uncommitted files.

use std::collections::HashSet;
use std::fs;
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use anyhow::{Context, Result, bail};
use tracing::{debug, error, info, instrument, warn};

use crate::core::branch::worker_branch_name;
use crate::core::types::{CycleOutcome, CycleResult, Goal, Stage};
use crate::cycle::{BranchPlan, CycleOptions, CycleSpec, run_recorded};
use crate::io::agent::Agent;
use crate::io::config::WorkerEntry;
use crate::io::cycle_log::CyclePaths;
use crate::io::git::Git;
use crate::io::github::PrClient;
use crate::io::goal::{GoalSelection, resolve_goal};
use crate::io::naming::{branch_stamp, branch_token};

/// Instructions for a worker that has neither its own prompt nor a shared goal.
pub const DEFAULT_WORKER_PROMPT: &str = "Review and improve code quality in this directory";

/// Top-level directories `--auto-partition` never assigns.
const SKIPPED_DIRS: &[&str] = &["node_modules", "target", "venv", "__pycache__", "results"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerTask {
    /// 1-based, in input order.
    pub id: usize,
    /// Directory relative to the project root.
    pub directory: String,
    pub goal: Goal,
}

/// Sorted top-level directories of `root`, minus hidden and build/vendor dirs.
pub fn auto_partition(root: &Path) -> Result<Vec<String>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(root).with_context(|| format!("read {}", root.display()))? {
        let entry = entry.with_context(|| format!("read {}", root.display()))?;
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || SKIPPED_DIRS.contains(&name.as_str()) {
            continue;
        }
        dirs.push(name);
    }
    dirs.sort();
    if dirs.is_empty() {
        bail!("no directories to partition in {}", root.display());
    }
    Ok(dirs)
}

/// `./src/api/` → `src/api`.
pub fn normalize_directory(directory: &str) -> String {
    let trimmed = directory.trim();
    let trimmed = trimmed.strip_prefix("./").unwrap_or(trimmed);
    trimmed.trim_end_matches('/').to_string()
}

/// Entries for plain directory names.
pub fn entries_for(directories: &[String]) -> Vec<WorkerEntry> {
    directories
        .iter()
        .map(|directory| WorkerEntry {
            directory: directory.clone(),
            prompt: None,
            modes: Vec::new(),
        })
        .collect()
}

/// Resolve each entry's goal and assign ids.
///
/// An entry's own prompt wins, then its modes, then `shared`, then
/// [`DEFAULT_WORKER_PROMPT`].
pub fn plan_tasks(root: &Path, entries: &[WorkerEntry], shared: Option<&Goal>) -> Result<Vec<WorkerTask>> {
    if entries.is_empty() {
        bail!("no worker directories given");
    }
    let mut seen = HashSet::new();
    let mut tasks = Vec::with_capacity(entries.len());
    for (index, entry) in entries.iter().enumerate() {
        let directory = normalize_directory(&entry.directory);
        if directory.is_empty() || directory == "." {
            bail!("worker directory must name a subdirectory: '{}'", entry.directory);
        }
        if !seen.insert(directory.clone()) {
            bail!("directory '{directory}' is listed more than once");
        }
        let goal = match (&entry.prompt, entry.modes.is_empty(), shared) {
            (Some(prompt), _, _) if !prompt.trim().is_empty() => Goal::from_text(&directory, prompt),
            (_, false, _) => {
                let selection = GoalSelection {
                    modes: entry.modes.clone(),
                    ..GoalSelection::default()
                };
                resolve_goal(&selection, root)
                    .with_context(|| format!("worker '{directory}'"))?
            }
            (_, true, Some(goal)) => goal.clone(),
            (_, true, None) => Goal::from_text(&directory, DEFAULT_WORKER_PROMPT),
        };
        tasks.push(WorkerTask {
            id: index + 1,
            directory,
            goal,
        });
    }
    Ok(tasks)
}

#[derive(Debug, Clone)]
pub struct FanOutOptions {
    pub parallel: bool,
    /// Cap on concurrently running workers in parallel mode.
    pub max_workers: Option<usize>,
    pub base_branch: String,
    pub cycle: CycleOptions,
    /// `<git-common-dir>/autopr`; worktrees and cycle logs go here.
    pub state_dir: PathBuf,
}

/// Run one cycle per task. Returns exactly one result per task, in task order.
#[instrument(skip_all, fields(workers = tasks.len(), parallel = options.parallel))]
pub fn fan_out<A, P>(
    root: &Path,
    tasks: &[WorkerTask],
    agent: &A,
    prs: &P,
    options: &FanOutOptions,
) -> Vec<CycleResult>
where
    A: Agent + Sync,
    P: PrClient + Sync,
{
    let stamp = branch_stamp();
    let slots: Vec<Slot> = tasks
        .iter()
        .map(|task| Slot::new(task, &stamp, &options.state_dir))
        .collect();
    let results = if options.parallel {
        fan_out_parallel(root, &slots, agent, prs, options)
    } else {
        fan_out_sequential(root, &slots, agent, prs, options)
    };
    let failed = results.iter().filter(|r| r.outcome.is_failure()).count();
    info!(total = results.len(), failed, "workers finished");
    results
}

/// A task with its branch and log location fixed.
struct Slot<'a> {
    task: &'a WorkerTask,
    branch: String,
    token: String,
    logs: CyclePaths,
}

impl<'a> Slot<'a> {
    fn new(task: &'a WorkerTask, stamp: &str, state_dir: &Path) -> Self {
        let token = branch_token();
        Self {
            branch: worker_branch_name(task.id, &task.directory, stamp, &token),
            logs: CyclePaths::new(state_dir, stamp, &task.directory, &token),
            token,
            task,
        }
    }

    fn spec(&self, workdir: &Path, plan: BranchPlan, base_branch: &str) -> CycleSpec {
        CycleSpec {
            label: self.task.directory.clone(),
            workdir: workdir.to_path_buf(),
            scope: Some(self.task.directory.clone()),
            goal: self.task.goal.clone(),
            branch: self.branch.clone(),
            base_branch: base_branch.to_string(),
            plan,
            logs: Some(self.logs.clone()),
        }
    }

    fn setup_failure(&self, reason: String) -> CycleResult {
        warn!(worker = self.task.id, directory = %self.task.directory, %reason, "worker setup failed");
        CycleResult::failed_before_start(&self.task.directory, &self.branch, Stage::Setup, reason)
    }
}

fn fan_out_sequential<A: Agent, P: PrClient>(
    root: &Path,
    slots: &[Slot<'_>],
    agent: &A,
    prs: &P,
    options: &FanOutOptions,
) -> Vec<CycleResult> {
    slots
        .iter()
        .map(|slot| {
            if !root.join(&slot.task.directory).is_dir() {
                return slot.setup_failure(format!("directory not found: {}", slot.task.directory));
            }
            info!(worker = slot.task.id, directory = %slot.task.directory, "starting worker");
            let spec = slot.spec(root, BranchPlan::Create, &options.base_branch);
            run_isolated(slot, || run_recorded(&spec, agent, prs, &options.cycle))
        })
        .collect()
}

/// A worker that is ready to run in its worktree, or already failed.
enum Prepared {
    Ready { spec: CycleSpec, worktree: PathBuf },
    Failed(CycleResult),
}

fn fan_out_parallel<A, P>(
    root: &Path,
    slots: &[Slot<'_>],
    agent: &A,
    prs: &P,
    options: &FanOutOptions,
) -> Vec<CycleResult>
where
    A: Agent + Sync,
    P: PrClient + Sync,
{
    let git = Git::new(root);
    // Worktrees are created one at a time; git locks the shared index while adding.
    let prepared: Vec<Prepared> = slots
        .iter()
        .map(|slot| prepare_worktree(&git, root, slot, options))
        .collect();

    let limit = worker_limit(options.max_workers, slots.len());
    debug!(limit, "running workers");
    let next = AtomicUsize::new(0);
    let results: Vec<Mutex<Option<CycleResult>>> = slots.iter().map(|_| Mutex::new(None)).collect();

    thread::scope(|scope| {
        for _ in 0..limit {
            scope.spawn(|| {
                loop {
                    let index = next.fetch_add(1, Ordering::SeqCst);
                    let Some(slot) = slots.get(index) else {
                        break;
                    };
                    let result = match &prepared[index] {
                        Prepared::Failed(result) => result.clone(),
                        Prepared::Ready { spec, .. } => {
                            info!(worker = slot.task.id, directory = %slot.task.directory, "starting worker");
                            run_isolated(slot, || run_recorded(spec, agent, prs, &options.cycle))
                        }
                    };
                    *results[index].lock().unwrap_or_else(|p| p.into_inner()) = Some(result);
                }
            });
        }
    });

    let results: Vec<CycleResult> = results
        .into_iter()
        .zip(slots)
        .map(|(cell, slot)| {
            cell.into_inner()
                .unwrap_or_else(|p| p.into_inner())
                .unwrap_or_else(|| slot.setup_failure("worker did not report a result".to_string()))
        })
        .collect();

    for (item, result) in prepared.iter().zip(&results) {
        if let Prepared::Ready { worktree, spec } = item {
            cleanup_worktree(&git, worktree, &spec.branch, &result.outcome);
        }
    }
    results
}

fn prepare_worktree(git: &Git, root: &Path, slot: &Slot<'_>, options: &FanOutOptions) -> Prepared {
    if !root.join(&slot.task.directory).is_dir() {
        return Prepared::Failed(
            slot.setup_failure(format!("directory not found: {}", slot.task.directory)),
        );
    }
    let worktree = options
        .state_dir
        .join("worktrees")
        .join(format!("worker-{}-{}", slot.task.id, slot.token));
    if let Err(e) = git.worktree_add(&worktree, &slot.branch, &options.base_branch) {
        return Prepared::Failed(slot.setup_failure(format!("create worktree: {e:#}")));
    }
    if !worktree.join(&slot.task.directory).is_dir() {
        cleanup_worktree(git, &worktree, &slot.branch, &CycleOutcome::NoChanges);
        return Prepared::Failed(slot.setup_failure(format!(
            "directory '{}' is not tracked on {}",
            slot.task.directory, options.base_branch
        )));
    }
    debug!(worktree = %worktree.display(), branch = %slot.branch, "worktree ready");
    Prepared::Ready {
        spec: slot.spec(&worktree, BranchPlan::Existing, &options.base_branch),
        worktree,
    }
}

/// Remove the worktree; the branch survives unless the worker produced nothing.
fn cleanup_worktree(git: &Git, worktree: &Path, branch: &str, outcome: &CycleOutcome) {
    if let Err(e) = git.worktree_remove(worktree) {
        warn!(err = %format!("{e:#}"), worktree = %worktree.display(), "could not remove worktree");
        return;
    }
    if *outcome == CycleOutcome::NoChanges
        && let Err(e) = git.delete_local_branch(branch)
    {
        warn!(err = %format!("{e:#}"), %branch, "could not delete empty worker branch");
    }
}

/// Turn a panicking worker into a failed result.
fn run_isolated<F: FnOnce() -> CycleResult>(slot: &Slot<'_>, run: F) -> CycleResult {
    match panic::catch_unwind(AssertUnwindSafe(run)) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(worker = slot.task.id, %message, "worker panicked");
            slot.setup_failure(format!("worker panicked: {message}"))
        }
    }
}

fn worker_limit(max_workers: Option<usize>, tasks: usize) -> usize {
    let default = thread::available_parallelism().map_or(1, NonZeroUsize::get);
    max_workers.unwrap_or(default).min(tasks).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn goal(title: &str) -> Goal {
        Goal {
            title: title.to_string(),
            slug: "shared".to_string(),
            prompt: "do the thing".to_string(),
        }
    }

    #[test]
    fn auto_partition_skips_hidden_and_vendor_dirs() {
        let temp = tempfile::tempdir().expect("tempdir");
        for dir in ["src", "docs", ".git", ".github", "node_modules", "target", ".venv", "venv", "results", "api"] {
            fs::create_dir_all(temp.path().join(dir)).expect("mkdir");
        }
        fs::write(temp.path().join("README.md"), "x").expect("write");
        let dirs = auto_partition(temp.path()).expect("partition");
        assert_eq!(dirs, vec!["api", "docs", "src"]);
    }

    #[test]
    fn auto_partition_fails_without_directories() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("main.rs"), "x").expect("write");
        let err = auto_partition(temp.path()).expect_err("empty");
        assert!(err.to_string().contains("no directories"));
    }

    #[test]
    fn plan_assigns_ids_in_input_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let entries = entries_for(&["./src/".to_string(), "docs".to_string()]);
        let shared = goal("Shared");
        let tasks = plan_tasks(temp.path(), &entries, Some(&shared)).expect("plan");
        assert_eq!(tasks.len(), 2);
        assert_eq!((tasks[0].id, tasks[0].directory.as_str()), (1, "src"));
        assert_eq!((tasks[1].id, tasks[1].directory.as_str()), (2, "docs"));
        assert_eq!(tasks[1].goal, shared);
    }

    #[test]
    fn entry_prompt_and_modes_override_shared_goal() {
        let temp = tempfile::tempdir().expect("tempdir");
        let entries = vec![
            WorkerEntry {
                directory: "api".to_string(),
                prompt: Some("Harden input validation".to_string()),
                modes: vec!["tests".to_string()],
            },
            WorkerEntry {
                directory: "web".to_string(),
                prompt: None,
                modes: vec!["docs".to_string()],
            },
            WorkerEntry {
                directory: "cli".to_string(),
                prompt: None,
                modes: Vec::new(),
            },
        ];
        let tasks = plan_tasks(temp.path(), &entries, None).expect("plan");
        assert_eq!(tasks[0].goal.title, "Harden input validation");
        assert_eq!(tasks[1].goal.title, "Improve Documentation");
        assert_eq!(tasks[2].goal.prompt, DEFAULT_WORKER_PROMPT);
    }

    #[test]
    fn plan_rejects_empty_and_duplicate_directories() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(plan_tasks(temp.path(), &[], None).is_err());

        let dupes = entries_for(&["src".to_string(), "src/".to_string()]);
        let err = plan_tasks(temp.path(), &dupes, None).expect_err("duplicate");
        assert!(err.to_string().contains("more than once"));

        let root = entries_for(&[".".to_string()]);
        assert!(plan_tasks(temp.path(), &root, None).is_err());
    }

    #[test]
    fn unknown_entry_mode_names_the_worker() {
        let temp = tempfile::tempdir().expect("tempdir");
        let entries = vec![WorkerEntry {
            directory: "api".to_string(),
            prompt: None,
            modes: vec!["speed".to_string()],
        }];
        let err = plan_tasks(temp.path(), &entries, None).expect_err("unknown mode");
        let msg = format!("{err:#}");
        assert!(msg.contains("worker 'api'"));
        assert!(msg.contains("unknown mode"));
    }

    #[test]
    fn worker_limit_is_bounded_by_task_count() {
        assert_eq!(worker_limit(Some(8), 3), 3);
        assert_eq!(worker_limit(Some(2), 5), 2);
        assert_eq!(worker_limit(Some(0), 5), 1);
        assert!(worker_limit(None, 4) >= 1);
    }

    #[test]
    fn normalize_strips_dot_and_trailing_slashes() {
        assert_eq!(normalize_directory("./src/api/"), "src/api");
        assert_eq!(normalize_directory(" docs "), "docs");
    }
}
