//! Fire-and-forget notifications for finished cycles.

use std::process::Command;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use tracing::{info, warn};

use crate::io::config::NotifyConfig;
use crate::io::process::{run_command};

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(30);

pub trait Notifier {
    fn notify(&self, message: &str) -> Result<()>;
}

/// Writes the message to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, message: &str) -> Result<()> {
        info!(target: "autopr::notify", "{message}");
        Ok(())
    }
}

/// Runs a user-supplied command with the message on stdin.
#[derive(Debug, Clone)]
pub struct CommandNotifier {
    command: Vec<String>,
}

impl CommandNotifier {
    pub fn new(command: Vec<String>) -> Result<Self> {
        if command.first().is_none_or(|program| program.trim().is_empty()) {
            bail!("notify command must not be empty");
        }
        Ok(Self { command })
    }
}

impl Notifier for CommandNotifier {
    fn notify(&self, message: &str) -> Result<()> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("notify command must not be empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        let output = run_command(cmd, Some(message.as_bytes()), NOTIFY_TIMEOUT, 64 * 1024, None)?;
        if !output.success() {
            bail!("notify command failed: {}", output.failure_summary());
        }
        Ok(())
    }
}

/// Notifier selected by configuration.
#[derive(Debug, Clone)]
pub enum ConfiguredNotifier {
    Log(LogNotifier),
    Command(CommandNotifier),
}

impl ConfiguredNotifier {
    pub fn from_config(config: &NotifyConfig) -> Result<Self> {
        if config.command.is_empty() {
            Ok(ConfiguredNotifier::Log(LogNotifier))
        } else {
            Ok(ConfiguredNotifier::Command(CommandNotifier::new(
                config.command.clone(),
            )?))
        }
    }
}

impl Notifier for ConfiguredNotifier {
    fn notify(&self, message: &str) -> Result<()> {
        match self {
            ConfiguredNotifier::Log(n) => n.notify(message),
            ConfiguredNotifier::Command(n) => n.notify(message),
        }
    }
}

/// Deliver a notification, logging failures instead of propagating them.
pub fn notify_best_effort<N: Notifier + ?Sized>(notifier: &N, message: &str) {
    if let Err(e) = notifier.notify(message) {
        warn!(err = %format!("{e:#}"), "notification failed");
    }
}
