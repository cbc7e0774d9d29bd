//! autopr: improve, review and fix pull requests with an AI coding agent.
//!
//! Each cycle asks the agent to improve the project, opens a PR, has a
//! reviewer session judge it, and feeds change requests back to the author
//! session until the reviewer approves or the fix budget runs out.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{error, info};

use autopr::core::ledger::CostLedger;
use autopr::core::modes::mode_listing;
use autopr::cycle::CycleOptions;
use autopr::exit_codes;
use autopr::io::agent::CliAgent;
use autopr::io::config::{AgentBackend, CONFIG_FILE, Config, WorkerEntry, load_config, load_workers_file};
use autopr::io::cycle_log::state_dir;
use autopr::io::git::Git;
use autopr::io::github::GhClient;
use autopr::io::goal::{GoalSelection, create_default_northstar, resolve_goal};
use autopr::io::notify::ConfiguredNotifier;
use autopr::io::preflight::{Requirements, check_environment, ensure_directory};
use autopr::logging;
use autopr::orchestrate::{BatchOutcome, BatchPlan, Orchestrator};
use autopr::schedule::{SchedulePolicy, Shutdown, drive, install_ctrl_c};
use autopr::summary::{render_batch, render_plan, render_session};
use autopr::workers::{auto_partition, entries_for, plan_tasks};

#[derive(Parser)]
#[command(
    name = "autopr",
    version,
    about = "Drive an AI coding agent through improve, review and fix cycles on pull requests"
)]
struct Cli {
    /// More log output (-v debug, -vv trace). `RUST_LOG` overrides.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run cycles over the whole project.
    Run(RunArgs),
    /// Run one cycle per directory, each on its own branch.
    Workers(WorkersArgs),
    /// List the preset improvement modes.
    Modes,
    /// Write a NORTHSTAR.md template into the project.
    InitNorthstar {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
        #[arg(long, default_value = ".")]
        project_dir: PathBuf,
    },
}

#[derive(Args, Debug)]
struct ScheduleArgs {
    /// Start the next cycle as soon as the previous one ends.
    #[arg(long = "loop", conflicts_with_all = ["interval", "cron"])]
    run_loop: bool,
    /// Start cycles this many seconds apart (0 behaves like --loop).
    #[arg(long, value_name = "SECS", conflicts_with = "cron")]
    interval: Option<u64>,
    /// Start cycles on a 5-field cron schedule, e.g. "0 9-17 * * 1-5".
    /// Day-of-month and day-of-week cannot both be restricted.
    #[arg(long, value_name = "EXPR")]
    cron: Option<String>,
    /// Stop after this many batches.
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u32).range(1..))]
    max_cycles: Option<u32>,
}

#[derive(Args, Debug)]
struct GoalArgs {
    /// Improvement mode; repeat to combine. `all` selects every mode, `northstar` uses NORTHSTAR.md.
    #[arg(short, long = "mode", value_name = "MODE", conflicts_with_all = ["goal_file", "prompt"])]
    modes: Vec<String>,
    /// File whose contents are the goal.
    #[arg(long, value_name = "PATH", conflicts_with = "prompt")]
    goal_file: Option<PathBuf>,
    /// Goal text.
    #[arg(short, long, value_name = "TEXT")]
    prompt: Option<String>,
}

impl GoalArgs {
    fn selection(&self) -> GoalSelection {
        GoalSelection {
            modes: self.modes.clone(),
            goal_file: self.goal_file.clone(),
            prompt: self.prompt.clone(),
        }
    }
}

#[derive(Args, Debug)]
struct CycleArgs {
    #[arg(long, default_value = ".")]
    project_dir: PathBuf,
    /// Config file (default: <project>/.autopr.toml).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, value_name = "BRANCH")]
    base_branch: Option<String>,
    /// Fixer runs allowed per cycle.
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u32).range(1..=20))]
    max_iterations: Option<u32>,
    /// Merge when the reviewer approves and no human requested changes.
    #[arg(long)]
    auto_merge: bool,
    /// Commit to the current branch instead of opening pull requests.
    #[arg(long, conflicts_with = "auto_merge")]
    no_pr: bool,
    #[arg(long, value_enum)]
    agent: Option<AgentBackend>,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    schedule: ScheduleArgs,
    #[command(flatten)]
    goal: GoalArgs,
    #[command(flatten)]
    cycle: CycleArgs,
}

#[derive(Args, Debug)]
struct WorkersArgs {
    #[command(flatten)]
    schedule: ScheduleArgs,
    #[command(flatten)]
    goal: GoalArgs,
    #[command(flatten)]
    cycle: CycleArgs,
    /// Directories to assign, one worker each.
    #[arg(short, long, num_args = 1.., value_name = "DIR", conflicts_with_all = ["auto_partition", "workers_file"])]
    directories: Vec<String>,
    /// One worker per top-level directory.
    #[arg(short, long, conflicts_with = "workers_file")]
    auto_partition: bool,
    /// JSON or TOML file mapping directories to prompts and modes.
    #[arg(long, value_name = "PATH")]
    workers_file: Option<PathBuf>,
    /// Run workers concurrently, each in its own git worktree.
    #[arg(long)]
    parallel: bool,
    #[arg(short = 'w', long, value_name = "N", value_parser = clap::value_parser!(u64).range(1..))]
    max_workers: Option<u64>,
    /// Print the worker plan and exit.
    #[arg(long)]
    dry_run: bool,
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::ENVIRONMENT);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Run(args) => cmd_run(&args),
        Command::Workers(args) => cmd_workers(&args),
        Command::Modes => {
            print!("{}", mode_listing());
            Ok(exit_codes::OK)
        }
        Command::InitNorthstar { force, project_dir } => {
            ensure_directory(&project_dir)?;
            let path = create_default_northstar(&project_dir, force)?;
            println!("wrote {}", path.display());
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_run(args: &RunArgs) -> Result<i32> {
    let setup = Setup::load(&args.cycle)?;
    let policy = schedule_policy(&args.schedule)?;
    let goal = resolve_goal(&args.goal.selection(), &setup.root)?;
    setup.preflight()?;
    let plan = BatchPlan::Single { goal };
    run_scheduled(&setup, &plan, &policy, args.schedule.max_cycles)
}

fn cmd_workers(args: &WorkersArgs) -> Result<i32> {
    let setup = Setup::load(&args.cycle)?;
    let policy = schedule_policy(&args.schedule)?;
    let selection = args.goal.selection();
    let shared = if selection.is_empty() {
        None
    } else {
        Some(resolve_goal(&selection, &setup.root)?)
    };

    let entries = worker_entries(args, &setup)?;
    let tasks = plan_tasks(&setup.root, &entries, shared.as_ref())?;
    let max_workers = args
        .max_workers
        .map(|n| usize::try_from(n).unwrap_or(usize::MAX));
    if args.dry_run {
        print!("{}", render_plan(&tasks, args.parallel, max_workers));
        return Ok(exit_codes::OK);
    }

    setup.preflight()?;
    let plan = BatchPlan::Workers {
        tasks,
        parallel: args.parallel,
        max_workers,
    };
    run_scheduled(&setup, &plan, &policy, args.schedule.max_cycles)
}

fn worker_entries(args: &WorkersArgs, setup: &Setup) -> Result<Vec<WorkerEntry>> {
    if !args.directories.is_empty() {
        return Ok(entries_for(&args.directories));
    }
    if args.auto_partition {
        return Ok(entries_for(&auto_partition(&setup.root)?));
    }
    if let Some(path) = &args.workers_file {
        return load_workers_file(path);
    }
    if !setup.config.workers.is_empty() {
        return Ok(setup.config.workers.clone());
    }
    bail!("no workers: pass --directories, --auto-partition or --workers-file, or add [[workers]] to {CONFIG_FILE}")
}

fn schedule_policy(args: &ScheduleArgs) -> Result<SchedulePolicy> {
    SchedulePolicy::from_args(args.run_loop, args.interval, args.cron.as_deref())
}

/// Resolved project directory, configuration and cycle options.
struct Setup {
    root: PathBuf,
    config: Config,
    options: CycleOptions,
}

impl Setup {
    fn load(args: &CycleArgs) -> Result<Self> {
        ensure_directory(&args.project_dir)?;
        let root = fs::canonicalize(&args.project_dir)
            .with_context(|| format!("resolve {}", args.project_dir.display()))?;
        let config_path = args
            .config
            .clone()
            .unwrap_or_else(|| root.join(CONFIG_FILE));
        let mut config = load_config(&config_path)?;
        apply_overrides(&mut config, args);
        config.validate()?;

        let options = CycleOptions {
            max_iterations: config.max_iterations,
            auto_merge: config.auto_merge,
            no_pr: args.no_pr,
            remote: config.remote.clone(),
            run_timeout: Duration::from_secs(config.run_timeout_secs),
            output_limit_bytes: config.output_limit_bytes,
            resume_sessions: config.resume_sessions,
            comment_reviews: config.comment_reviews,
            merge_method: config.merge_method,
        };
        Ok(Self {
            root,
            config,
            options,
        })
    }

    fn preflight(&self) -> Result<()> {
        check_environment(
            &self.root,
            &Requirements {
                agent_binary: self.config.agent.binary_name(),
                needs_github: !self.options.no_pr,
                remote: &self.config.remote,
                base_branch: &self.config.base_branch,
            },
        )
    }

    fn orchestrator(&self) -> Result<Orchestrator<CliAgent, GhClient, ConfiguredNotifier>> {
        Ok(Orchestrator {
            root: self.root.clone(),
            state_dir: state_dir(&Git::new(&self.root))?,
            base_branch: self.config.base_branch.clone(),
            options: self.options.clone(),
            agent: CliAgent::from_config(&self.config.agent),
            prs: GhClient::new(&self.root),
            notifier: ConfiguredNotifier::from_config(&self.config.notify)?,
        })
    }
}

fn apply_overrides(config: &mut Config, args: &CycleArgs) {
    if let Some(base) = &args.base_branch {
        config.base_branch.clone_from(base);
    }
    if let Some(n) = args.max_iterations {
        config.max_iterations = n;
    }
    if args.auto_merge {
        config.auto_merge = true;
    }
    if args.no_pr {
        config.auto_merge = false;
    }
    if let Some(backend) = args.agent {
        if backend != config.agent.backend {
            config.agent.binary = None;
        }
        config.agent.backend = backend;
    }
}

/// Drive batches until the schedule stops, printing each batch summary.
fn run_scheduled(
    setup: &Setup,
    plan: &BatchPlan,
    policy: &SchedulePolicy,
    max_cycles: Option<u32>,
) -> Result<i32> {
    let orchestrator = setup.orchestrator()?;
    let shutdown = Shutdown::new();
    install_ctrl_c(shutdown.clone())?;

    let mut session = CostLedger::default();
    let mut failed_cycles = 0usize;
    let report = drive(policy, &shutdown, max_cycles, |batch| {
        info!(batch, "starting batch");
        match orchestrator.run_batch(plan) {
            Ok(BatchOutcome::Ran(results)) => {
                println!("{}", render_batch(&results));
                for result in &results {
                    session.absorb(&result.ledger);
                }
                failed_cycles += results.iter().filter(|r| r.outcome.is_failure()).count();
            }
            Ok(BatchOutcome::Skipped) => {}
            Err(e) => {
                error!(err = %format!("{e:#}"), "batch could not run");
                failed_cycles += 1;
            }
        }
    });
    println!("{}", render_session(&report, &session, failed_cycles));

    if policy.is_once() && failed_cycles > 0 {
        return Ok(exit_codes::CYCLE_FAILED);
    }
    Ok(exit_codes::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_modes_and_interval() {
        let cli = Cli::parse_from([
            "autopr", "run", "-m", "tests", "-m", "docs", "--interval", "3600", "--auto-merge",
        ]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.goal.modes, vec!["tests", "docs"]);
        assert_eq!(args.schedule.interval, Some(3600));
        assert!(args.cycle.auto_merge);
        assert!(!args.cycle.no_pr);
    }

    #[test]
    fn schedule_flags_are_exclusive() {
        let result = Cli::try_parse_from(["autopr", "run", "--loop", "--cron", "0 9 * * *"]);
        assert!(result.is_err());
    }

    #[test]
    fn goal_flags_are_exclusive() {
        let result = Cli::try_parse_from(["autopr", "run", "-m", "tests", "-p", "do it"]);
        assert!(result.is_err());
    }

    #[test]
    fn max_iterations_is_bounded() {
        assert!(Cli::try_parse_from(["autopr", "run", "--max-iterations", "0"]).is_err());
        assert!(Cli::try_parse_from(["autopr", "run", "--max-iterations", "21"]).is_err());
        assert!(Cli::try_parse_from(["autopr", "run", "--max-iterations", "20"]).is_ok());
    }

    #[test]
    fn parse_workers_with_directories() {
        let cli = Cli::parse_from([
            "autopr", "workers", "-d", "src", "docs", "--parallel", "-w", "2", "--agent", "codex",
        ]);
        let Command::Workers(args) = cli.command else {
            panic!("expected workers");
        };
        assert_eq!(args.directories, vec!["src", "docs"]);
        assert!(args.parallel);
        assert_eq!(args.max_workers, Some(2));
        assert_eq!(args.cycle.agent, Some(AgentBackend::Codex));
    }

    #[test]
    fn partition_sources_are_exclusive() {
        let result = Cli::try_parse_from(["autopr", "workers", "-a", "--workers-file", "w.toml"]);
        assert!(result.is_err());
    }

    #[test]
    fn parse_init_northstar_force() {
        let cli = Cli::parse_from(["autopr", "init-northstar", "--force"]);
        assert!(matches!(cli.command, Command::InitNorthstar { force: true, .. }));
    }

    #[test]
    fn overrides_apply_on_top_of_config() {
        let args = CycleArgs {
            project_dir: PathBuf::from("."),
            config: None,
            base_branch: Some("develop".to_string()),
            max_iterations: Some(5),
            auto_merge: true,
            no_pr: false,
            agent: Some(AgentBackend::Codex),
        };
        let mut config = Config::default();
        config.agent.binary = Some("/opt/claude".to_string());
        apply_overrides(&mut config, &args);
        assert_eq!(config.base_branch, "develop");
        assert_eq!(config.max_iterations, 5);
        assert!(config.auto_merge);
        assert_eq!(config.agent.backend, AgentBackend::Codex);
        assert_eq!(config.agent.binary_name(), "codex");
    }
}
