//! Batch orchestration: locking, cycle records and notifications.

use std::fs;

use autopr::core::types::{CycleOutcome, Goal};
use autopr::cycle::CycleOptions;
use autopr::io::cycle_log::state_dir;
use autopr::io::lock::LockFile;
use autopr::orchestrate::{BatchOutcome, BatchPlan, LOCK_FILE_NAME, Orchestrator};
use autopr::schedule::{DriveReport, SchedulePolicy, Shutdown, StopReason, drive};
use autopr::test_support::{
    RecordingNotifier, RecordingPrClient, ScriptedAgent, ScriptedStep, TestRepo,
};

fn goal() -> Goal {
    Goal {
        title: "Fix Bugs".to_string(),
        slug: "fix_bugs".to_string(),
        prompt: "Find and fix bugs.".to_string(),
    }
}

fn orchestrator(
    repo: &TestRepo,
    steps: Vec<ScriptedStep>,
) -> Orchestrator<ScriptedAgent, RecordingPrClient, RecordingNotifier> {
    Orchestrator {
        root: repo.path().to_path_buf(),
        state_dir: state_dir(&repo.git()).expect("state dir"),
        base_branch: "main".to_string(),
        options: CycleOptions::default(),
        agent: ScriptedAgent::new(steps),
        prs: RecordingPrClient::new(),
        notifier: RecordingNotifier::default(),
    }
}

#[test]
fn single_batch_records_and_notifies() {
    let repo = TestRepo::new();
    let orch = orchestrator(
        &repo,
        vec![
            ScriptedStep::reply("fixed an off-by-one").writes("src/lib.txt", "fn main() { 1 }\n"),
            ScriptedStep::reply("APPROVED"),
        ],
    );

    let outcome = orch
        .run_batch(&BatchPlan::Single { goal: goal() })
        .expect("batch");

    let BatchOutcome::Ran(results) = outcome else {
        panic!("batch was skipped");
    };
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].outcome, CycleOutcome::Approved);
    assert!(results[0].branch.starts_with("auto-fix-bugs/"));

    let messages = orch.notifier.messages();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].starts_with("autopr: . approved (PR #1"));

    let cycles: Vec<_> = fs::read_dir(orch.state_dir.join("cycles"))
        .expect("cycles dir")
        .map(|e| e.expect("entry").path())
        .collect();
    assert_eq!(cycles.len(), 1);
    let record: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(cycles[0].join("cycle.json")).expect("read"))
            .expect("json");
    assert_eq!(record["goal"], "Fix Bugs");
    assert_eq!(record["outcome"]["state"], "approved");
    assert_eq!(record["pr"]["number"], 1);

    assert!(!orch.state_dir.join(LOCK_FILE_NAME).exists());
}

#[test]
fn held_lock_skips_batch() {
    let repo = TestRepo::new();
    let orch = orchestrator(&repo, vec![ScriptedStep::reply("unused")]);
    let mut held = LockFile::new(orch.state_dir.join(LOCK_FILE_NAME));
    assert!(held.acquire().expect("acquire"));

    let outcome = orch
        .run_batch(&BatchPlan::Single { goal: goal() })
        .expect("batch");

    assert_eq!(outcome, BatchOutcome::Skipped);
    assert!(orch.agent.requests().is_empty());
    assert!(orch.notifier.messages().is_empty());
    held.release();
}

/// Loop schedule over real batches: each batch gets a fresh branch.
#[test]
fn looped_batches_use_distinct_branches() {
    let repo = TestRepo::new();
    let orch = orchestrator(
        &repo,
        vec![
            ScriptedStep::reply("one").writes("src/one.txt", "1\n"),
            ScriptedStep::reply("APPROVED"),
            ScriptedStep::reply("two").writes("src/two.txt", "2\n"),
            ScriptedStep::reply("APPROVED"),
        ],
    );
    let plan = BatchPlan::Single { goal: goal() };
    let mut branches = Vec::new();

    let report = drive(&SchedulePolicy::Loop, &Shutdown::new(), Some(2), |_| {
        if let Ok(BatchOutcome::Ran(results)) = orch.run_batch(&plan) {
            branches.extend(results.into_iter().map(|r| r.branch));
        }
    });

    assert_eq!(
        report,
        DriveReport {
            batches: 2,
            stop: StopReason::CycleLimit
        }
    );
    assert_eq!(branches.len(), 2);
    assert_ne!(branches[0], branches[1]);
    assert_eq!(orch.prs.log().created.len(), 2);
}
