//! Project configuration stored in `<project>/.autopr.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::core::types::MergeMethod;

pub const CONFIG_FILE: &str = ".autopr.toml";

/// Inclusive bounds for `max_iterations`.
pub const MAX_ITERATIONS_RANGE: std::ops::RangeInclusive<u32> = 1..=20;

/// Orchestrator configuration (TOML).
///
/// Missing fields take their defaults, and CLI flags override file values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Branch PRs target and cycles start from.
    pub base_branch: String,

    /// Remote that branches are pushed to.
    pub remote: String,

    /// Maximum fixer runs per cycle before giving up.
    pub max_iterations: u32,

    pub auto_merge: bool,

    /// Per-run wall-clock budget for agent invocations.
    pub run_timeout_secs: u64,

    /// Truncate captured agent stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Continue agent sessions between runs of a cycle.
    pub resume_sessions: bool,

    /// Post reviewer output as a PR comment.
    pub comment_reviews: bool,

    pub merge_method: MergeMethod,

    pub agent: AgentConfig,

    pub notify: NotifyConfig,

    /// Per-directory worker assignments for `autopr workers`.
    pub workers: Vec<WorkerEntry>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AgentBackend {
    #[default]
    Claude,
    Codex,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    pub backend: AgentBackend,
    /// Executable to run; defaults to `claude` or `codex` per backend.
    pub binary: Option<String>,
    pub model: Option<String>,
    /// Extra arguments appended to every invocation (e.g. permission flags).
    pub extra_args: Vec<String>,
}

impl AgentConfig {
    pub fn binary_name(&self) -> &str {
        match (&self.binary, self.backend) {
            (Some(binary), _) => binary,
            (None, AgentBackend::Claude) => "claude",
            (None, AgentBackend::Codex) => "codex",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NotifyConfig {
    /// Command run after each cycle with the summary on stdin (e.g. `["notify-send-wrapper"]`).
    pub command: Vec<String>,
}

/// One directory assignment for the worker manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerEntry {
    pub directory: String,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub modes: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_branch: "main".to_string(),
            remote: "origin".to_string(),
            max_iterations: 3,
            auto_merge: false,
            run_timeout_secs: 30 * 60,
            output_limit_bytes: 1_000_000,
            resume_sessions: true,
            comment_reviews: true,
            merge_method: MergeMethod::Squash,
            agent: AgentConfig::default(),
            notify: NotifyConfig::default(),
            workers: Vec::new(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.base_branch.trim().is_empty() {
            return Err(anyhow!("base_branch must not be empty"));
        }
        if self.remote.trim().is_empty() {
            return Err(anyhow!("remote must not be empty"));
        }
        if !MAX_ITERATIONS_RANGE.contains(&self.max_iterations) {
            return Err(anyhow!(
                "max_iterations must be between {} and {}",
                MAX_ITERATIONS_RANGE.start(),
                MAX_ITERATIONS_RANGE.end()
            ));
        }
        if self.run_timeout_secs == 0 {
            return Err(anyhow!("run_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self
            .agent
            .binary
            .as_deref()
            .is_some_and(|b| b.trim().is_empty())
        {
            return Err(anyhow!("agent.binary must not be empty when set"));
        }
        if self
            .notify
            .command
            .first()
            .is_some_and(|c| c.trim().is_empty())
        {
            return Err(anyhow!("notify.command must start with a program name"));
        }
        for worker in &self.workers {
            validate_worker_entry(worker)?;
        }
        Ok(())
    }
}

fn validate_worker_entry(entry: &WorkerEntry) -> Result<()> {
    if entry.directory.trim().is_empty() {
        bail!("worker directory must not be empty");
    }
    if Path::new(&entry.directory).is_absolute() || entry.directory.split('/').any(|c| c == "..")
    {
        bail!(
            "worker directory must be relative to the project: {}",
            entry.directory
        );
    }
    Ok(())
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `Config::default()`.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        let cfg = Config::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: Config =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

#[derive(Debug, Deserialize)]
struct WorkersFile {
    workers: Vec<WorkerEntry>,
}

/// Load worker assignments from a `.json` array or a TOML file with `[[workers]]` tables.
pub fn load_workers_file(path: &Path) -> Result<Vec<WorkerEntry>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("workers file not found: {}", path.display()))?;
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let entries: Vec<WorkerEntry> = if is_json {
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?
    } else {
        let file: WorkersFile =
            toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
        file.workers
    };
    for entry in &entries {
        validate_worker_entry(entry)?;
    }
    Ok(entries)
}

/// Atomically write a file (temp file + rename).
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
