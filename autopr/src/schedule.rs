//! Scheduler: decides when the next batch of cycles starts.
//!
//! Shutdown is cooperative. It is observed before each batch and while
//! sleeping between batches, never in the middle of a running cycle.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use chrono::Local;
use tracing::{error, info, warn};

use crate::core::trigger::{CronTrigger, Trigger};
use crate::exit_codes;

/// Upper bound for `--interval`, one week.
pub const MAX_INTERVAL_SECS: u64 = 7 * 24 * 60 * 60;

pub enum SchedulePolicy {
    Once,
    /// Start the next batch as soon as the previous one ends.
    Loop,
    /// Start batches this far apart; a long batch delays the next one, never overlaps it.
    Interval(Duration),
    Cron(Box<dyn Trigger>),
}

impl fmt::Debug for SchedulePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulePolicy::Once => f.write_str("Once"),
            SchedulePolicy::Loop => f.write_str("Loop"),
            SchedulePolicy::Interval(d) => f.debug_tuple("Interval").field(d).finish(),
            SchedulePolicy::Cron(t) => f.debug_tuple("Cron").field(&t.describe()).finish(),
        }
    }
}

impl SchedulePolicy {
    /// Build from the mutually exclusive CLI flags. An interval of zero means loop.
    pub fn from_args(run_loop: bool, interval_secs: Option<u64>, cron: Option<&str>) -> Result<Self> {
        match (run_loop, interval_secs, cron) {
            (false, None, None) => Ok(SchedulePolicy::Once),
            (true, None, None) | (false, Some(0), None) => Ok(SchedulePolicy::Loop),
            (false, Some(secs), None) => {
                if secs > MAX_INTERVAL_SECS {
                    bail!("interval must be at most {MAX_INTERVAL_SECS} seconds");
                }
                Ok(SchedulePolicy::Interval(Duration::from_secs(secs)))
            }
            (false, None, Some(expr)) => Ok(SchedulePolicy::Cron(Box::new(CronTrigger::parse(expr)?))),
            _ => bail!("choose only one of --loop, --interval and --cron"),
        }
    }

    pub fn is_once(&self) -> bool {
        matches!(self, SchedulePolicy::Once)
    }

    pub fn describe(&self) -> String {
        match self {
            SchedulePolicy::Once => "once".to_string(),
            SchedulePolicy::Loop => "loop".to_string(),
            SchedulePolicy::Interval(d) => format!("every {}s", d.as_secs()),
            SchedulePolicy::Cron(t) => t.describe(),
        }
    }
}

/// Cloneable stop flag that can interrupt sleeps.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        let (lock, cvar) = &*self.inner;
        let mut stopped = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *stopped = true;
        cvar.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        let (lock, _) = &*self.inner;
        *lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Sleep up to `timeout`. Returns true if shutdown was requested.
    pub fn wait(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let (guard, _) = cvar
            .wait_timeout_while(guard, timeout, |stopped| !*stopped)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The once policy ran its batch.
    Completed,
    /// `max_cycles` batches ran.
    CycleLimit,
    Shutdown,
    /// The trigger has no further fire time.
    ScheduleExhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriveReport {
    pub batches: u32,
    pub stop: StopReason,
}

/// Run `on_batch` according to `policy` until it stops.
///
/// `on_batch` receives the 1-based batch number.
pub fn drive<F: FnMut(u32)>(
    policy: &SchedulePolicy,
    shutdown: &Shutdown,
    max_cycles: Option<u32>,
    mut on_batch: F,
) -> DriveReport {
    let mut batches = 0u32;
    let report = |batches, stop| DriveReport { batches, stop };
    info!(schedule = %policy.describe(), ?max_cycles, "scheduler started");

    loop {
        if shutdown.is_triggered() {
            return report(batches, StopReason::Shutdown);
        }

        if let SchedulePolicy::Cron(trigger) = policy {
            let now = Local::now();
            let Some(next) = trigger.next_fire(now) else {
                info!("schedule has no further fire times");
                return report(batches, StopReason::ScheduleExhausted);
            };
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            info!(next = %next.format("%Y-%m-%d %H:%M:%S"), "waiting for next scheduled run");
            if shutdown.wait(wait) {
                return report(batches, StopReason::Shutdown);
            }
        }

        let started = Instant::now();
        batches += 1;
        on_batch(batches);

        if policy.is_once() {
            return report(batches, StopReason::Completed);
        }
        if max_cycles.is_some_and(|max| batches >= max) {
            info!(batches, "cycle limit reached");
            return report(batches, StopReason::CycleLimit);
        }

        if let SchedulePolicy::Interval(interval) = policy {
            let remaining = interval.saturating_sub(started.elapsed());
            if !remaining.is_zero() {
                info!(sleep_secs = remaining.as_secs(), "sleeping until next interval");
                if shutdown.wait(remaining) {
                    return report(batches, StopReason::Shutdown);
                }
            }
        }
    }
}

/// Route Ctrl-C to `shutdown`. A second Ctrl-C exits immediately.
pub fn install_ctrl_c(shutdown: Shutdown) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build signal runtime")?;
    thread::Builder::new()
        .name("autopr-signals".to_string())
        .spawn(move || {
            runtime.block_on(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!(err = %e, "could not listen for Ctrl-C");
                    return;
                }
                warn!("interrupt received, stopping after the current cycle (Ctrl-C again to abort)");
                shutdown.trigger();
                if tokio::signal::ctrl_c().await.is_ok() {
                    error!("second interrupt, exiting now");
                    std::process::exit(exit_codes::INTERRUPTED);
                }
            });
        })
        .context("spawn signal thread")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fires a fixed number of times, a few milliseconds apart.
    struct CountdownTrigger {
        remaining: AtomicU32,
    }

    impl Trigger for CountdownTrigger {
        fn next_fire(&self, after: DateTime<Local>) -> Option<DateTime<Local>> {
            let left = self.remaining.load(Ordering::SeqCst);
            if left == 0 {
                return None;
            }
            self.remaining.store(left - 1, Ordering::SeqCst);
            Some(after + chrono::Duration::milliseconds(5))
        }

        fn describe(&self) -> String {
            "countdown".to_string()
        }
    }

    #[test]
    fn once_runs_exactly_one_batch() {
        let mut calls = 0;
        let report = drive(&SchedulePolicy::Once, &Shutdown::new(), None, |_| calls += 1);
        assert_eq!(calls, 1);
        assert_eq!(report.stop, StopReason::Completed);
    }

    #[test]
    fn loop_respects_cycle_limit() {
        let mut seen = Vec::new();
        let report = drive(&SchedulePolicy::Loop, &Shutdown::new(), Some(3), |n| seen.push(n));
        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(report, DriveReport { batches: 3, stop: StopReason::CycleLimit });
    }

    #[test]
    fn interval_waits_between_batches() {
        let policy = SchedulePolicy::Interval(Duration::from_millis(50));
        let start = Instant::now();
        let report = drive(&policy, &Shutdown::new(), Some(2), |_| {});
        assert_eq!(report.batches, 2);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn interval_does_not_sleep_after_long_batch() {
        let policy = SchedulePolicy::Interval(Duration::from_millis(20));
        let start = Instant::now();
        drive(&policy, &Shutdown::new(), Some(2), |_| {
            thread::sleep(Duration::from_millis(30));
        });
        // Two 30ms batches with no extra 20ms sleep in between.
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn shutdown_is_observed_between_batches() {
        let shutdown = Shutdown::new();
        let inner = shutdown.clone();
        let report = drive(&SchedulePolicy::Loop, &shutdown, None, |n| {
            if n == 2 {
                inner.trigger();
            }
        });
        assert_eq!(report, DriveReport { batches: 2, stop: StopReason::Shutdown });
    }

    #[test]
    fn shutdown_interrupts_interval_sleep() {
        let shutdown = Shutdown::new();
        let trigger = shutdown.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            trigger.trigger();
        });
        let policy = SchedulePolicy::Interval(Duration::from_secs(3600));
        let start = Instant::now();
        let report = drive(&policy, &shutdown, None, |_| {});
        handle.join().expect("join");
        assert_eq!(report.stop, StopReason::Shutdown);
        assert_eq!(report.batches, 1);
        assert!(start.elapsed() < Duration::from_secs(60));
    }

    #[test]
    fn cron_runs_until_trigger_exhausted() {
        let policy = SchedulePolicy::Cron(Box::new(CountdownTrigger {
            remaining: AtomicU32::new(2),
        }));
        let mut calls = 0;
        let report = drive(&policy, &Shutdown::new(), None, |_| calls += 1);
        assert_eq!(calls, 2);
        assert_eq!(report.stop, StopReason::ScheduleExhausted);
    }

    #[test]
    fn from_args_selects_policy() {
        assert!(matches!(
            SchedulePolicy::from_args(false, None, None).unwrap(),
            SchedulePolicy::Once
        ));
        assert!(matches!(
            SchedulePolicy::from_args(false, Some(0), None).unwrap(),
            SchedulePolicy::Loop
        ));
        assert!(matches!(
            SchedulePolicy::from_args(false, Some(60), None).unwrap(),
            SchedulePolicy::Interval(d) if d == Duration::from_secs(60)
        ));
        assert!(matches!(
            SchedulePolicy::from_args(false, None, Some("*/5 * * * *")).unwrap(),
            SchedulePolicy::Cron(_)
        ));
        assert!(SchedulePolicy::from_args(true, Some(5), None).is_err());
        assert!(SchedulePolicy::from_args(false, Some(MAX_INTERVAL_SECS + 1), None).is_err());
        assert!(SchedulePolicy::from_args(false, None, Some("bad")).is_err());
    }

    #[test]
    fn wait_returns_false_on_timeout() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.wait(Duration::from_millis(5)));
        shutdown.trigger();
        assert!(shutdown.wait(Duration::from_secs(5)));
        assert!(shutdown.is_triggered());
    }
}
