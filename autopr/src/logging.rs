//! Diagnostic tracing for the orchestrator.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: progress and diagnostics via `RUST_LOG` or
//!   `-v`, written to stderr.
//! - **Cycle records (`io/cycle_log`)**: per-cycle JSON and agent run logs
//!   under `<git-common-dir>/autopr/cycles/`. Always written, unaffected by
//!   the log level.
//! - **Summaries (`summary`)**: human-facing results on stdout.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Default filter for a `-v` count when `RUST_LOG` is unset.
pub fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn,autopr=info",
        1 => "warn,autopr=debug",
        _ => "info,autopr=trace",
    }
}

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` wins over `-v` when set.
///
/// # Example
/// ```bash
/// RUST_LOG=autopr::cycle=debug autopr run --mode tests
/// ```
pub fn init(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false).compact())
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_raises_crate_level() {
        assert_eq!(default_directive(0), "warn,autopr=info");
        assert!(default_directive(1).contains("autopr=debug"));
        assert!(default_directive(5).contains("autopr=trace"));
    }
}
