//! Drives an external AI coding agent through improve, review and fix cycles
//! on pull requests.
//!
//! The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (verdict parsing, branch names,
//!   cost accounting, cron triggers, modes). No I/O.
//! - **[`io`]**: Side-effecting adapters (processes, git, agent CLIs, `gh`,
//!   lock and log files). Behind traits where tests need fakes.
//!
//! Orchestration modules ([`cycle`], [`schedule`], [`workers`],
//! [`orchestrate`]) combine the two to implement the CLI commands.

pub mod core;
pub mod cycle;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrate;
pub mod schedule;
pub mod summary;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod workers;
