//! Side-effecting adapters: processes, git, agents, GitHub, files.

pub mod agent;
pub mod config;
pub mod cycle_log;
pub mod git;
pub mod github;
pub mod goal;
pub mod lock;
pub mod naming;
pub mod notify;
pub mod preflight;
pub mod process;
pub mod prompt;
