//! Human-readable summaries printed to stdout and sent as notifications.

use std::fmt::Write as _;

use crate::core::ledger::CostLedger;
use crate::core::types::{CycleOutcome, CycleResult};
use crate::schedule::{DriveReport, StopReason};
use crate::workers::WorkerTask;

/// Outcome labels in the order totals are listed.
const OUTCOME_ORDER: &[&str] = &[
    "merged",
    "approved",
    "exhausted",
    "committed",
    "no changes",
    "failed",
];

pub fn format_duration(ms: u64) -> String {
    let secs = ms / 1000;
    match secs {
        0..=59 => format!("{secs}s"),
        60..=3599 => format!("{}m {:02}s", secs / 60, secs % 60),
        _ => format!("{}h {:02}m", secs / 3600, (secs % 3600) / 60),
    }
}

pub fn format_cost(ledger: &CostLedger) -> String {
    format!(
        "${:.4} ({} runs, {} tokens)",
        ledger.cost_usd,
        ledger.runs,
        ledger.total_tokens()
    )
}

pub fn render_cycle(result: &CycleResult) -> String {
    let mut out = format!("[{}] {}\n", result.label, result.outcome.label());
    let _ = writeln!(out, "  branch:   {}", result.branch);
    if let Some(pr) = &result.pr {
        let _ = writeln!(out, "  pr:       #{} {}", pr.number, pr.url);
    }
    if result.fix_runs > 0 {
        let _ = writeln!(out, "  fix runs: {}", result.fix_runs);
    }
    let _ = writeln!(out, "  cost:     {}", format_cost(&result.ledger));
    let _ = writeln!(out, "  duration: {}", format_duration(result.duration_ms));
    if let CycleOutcome::Failed { stage, reason } = &result.outcome {
        let _ = writeln!(out, "  failed:   {stage}: {reason}");
    }
    if !result.commits.is_empty() {
        out.push_str("  commits:\n");
        for commit in &result.commits {
            let _ = writeln!(out, "    {commit}");
        }
    }
    out
}

/// Every cycle of a batch, then totals and the branches that carry changes.
pub fn render_batch(results: &[CycleResult]) -> String {
    let mut out = String::new();
    for result in results {
        out.push_str(&render_cycle(result));
    }
    if results.len() > 1 {
        let mut total = CostLedger::default();
        for result in results {
            total.absorb(&result.ledger);
        }
        let _ = writeln!(
            out,
            "\n{} cycles: {}; cost {}",
            results.len(),
            outcome_counts(results),
            format_cost(&total)
        );
        let changed: Vec<&CycleResult> =
            results.iter().filter(|r| !r.commits.is_empty()).collect();
        if !changed.is_empty() {
            out.push_str("branches with changes:\n");
            for result in changed {
                let _ = writeln!(out, "  {} ({})", result.branch, result.label);
            }
        }
    }
    out
}

/// `2 merged, 1 failed`, in a fixed order.
pub fn outcome_counts(results: &[CycleResult]) -> String {
    OUTCOME_ORDER
        .iter()
        .filter_map(|label| {
            let count = results
                .iter()
                .filter(|r| r.outcome.label() == *label)
                .count();
            (count > 0).then(|| format!("{count} {label}"))
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Closing line after the scheduler stops.
pub fn render_session(report: &DriveReport, total: &CostLedger, failed_cycles: usize) -> String {
    let stop = match report.stop {
        StopReason::Completed => "completed",
        StopReason::CycleLimit => "cycle limit reached",
        StopReason::Shutdown => "shutdown requested",
        StopReason::ScheduleExhausted => "schedule has no further runs",
    };
    format!(
        "session: {} batch(es), {failed_cycles} failed cycle(s), {stop}; total cost {}",
        report.batches,
        format_cost(total)
    )
}

/// One-line message for the notification sink.
pub fn notification_text(result: &CycleResult) -> String {
    let mut text = format!("autopr: {} {}", result.label, result.outcome.label());
    if let Some(pr) = &result.pr {
        let _ = write!(text, " (PR #{} {})", pr.number, pr.url);
    }
    if let CycleOutcome::Failed { stage, reason } = &result.outcome {
        let first_line = reason.lines().next().unwrap_or_default();
        let _ = write!(text, " at {stage}: {first_line}");
    }
    let _ = write!(
        text,
        " [{} fix run(s), ${:.2}, {}]",
        result.fix_runs,
        result.ledger.cost_usd,
        format_duration(result.duration_ms)
    );
    text
}

/// What `workers --dry-run` prints.
pub fn render_plan(tasks: &[WorkerTask], parallel: bool, max_workers: Option<usize>) -> String {
    let mode = if parallel {
        match max_workers {
            Some(n) => format!("parallel, at most {n} at once"),
            None => "parallel".to_string(),
        }
    } else {
        "sequential".to_string()
    };
    let mut out = format!("{} worker(s), {mode}:\n", tasks.len());
    for task in tasks {
        let _ = writeln!(out, "  {:>2}. {:<24} {}", task.id, task.directory, task.goal.title);
    }
    out
}
