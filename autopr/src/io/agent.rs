//! Agent abstraction for coding-agent invocation.
//!
//! The [`Agent`] trait decouples the cycle controller from the actual agent
//! backend (`claude` or `codex`). Tests use scripted agents that return
//! predetermined replies without spawning processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::core::types::{AgentReply, Role, Usage};
use crate::io::config::{AgentBackend, AgentConfig};
use crate::io::process::{CommandOutput, run_command};

/// Parameters for one agent run.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub role: Role,
    /// Working directory for the agent process.
    pub workdir: PathBuf,
    /// Prompt text fed to the agent on stdin.
    pub prompt: String,
    /// Session to continue, if any.
    pub resume: Option<String>,
    /// Maximum time to wait for the agent to complete.
    pub timeout: Duration,
    /// Bound on captured stdout/stderr.
    pub output_limit_bytes: usize,
    /// Where to write the run log (prompt, stdout, stderr). `None` disables logging.
    pub log_path: Option<PathBuf>,
}

/// Abstraction over agent backends.
pub trait Agent {
    /// Run the agent once. Any failure (spawn error, timeout, non-zero exit,
    /// unparseable output, agent-reported error) is returned as `Err`.
    fn invoke(&self, request: &AgentRequest) -> Result<AgentReply>;
}

impl<T: Agent + ?Sized> Agent for &T {
    fn invoke(&self, request: &AgentRequest) -> Result<AgentReply> {
        (**self).invoke(request)
    }
}

/// Agent that spawns `claude --print --output-format json`.
#[derive(Debug, Clone)]
pub struct ClaudeAgent {
    pub binary: String,
    pub model: Option<String>,
    pub extra_args: Vec<String>,
}

impl ClaudeAgent {
    fn command(&self, request: &AgentRequest) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["--print", "--output-format", "json"]);
        if let Some(session) = &request.resume {
            cmd.arg("--resume").arg(session);
        }
        if let Some(model) = &self.model {
            cmd.arg("--model").arg(model);
        }
        cmd.args(&self.extra_args).current_dir(&request.workdir);
        cmd
    }
}

impl Agent for ClaudeAgent {
    #[instrument(skip_all, fields(role = %request.role, resume = request.resume.is_some()))]
    fn invoke(&self, request: &AgentRequest) -> Result<AgentReply> {
        info!(workdir = %request.workdir.display(), "starting claude");
        let output = spawn_agent(self.command(request), request, "claude")?;
        let reply = parse_claude_output(&output.stdout_lossy())?;
        debug!(
            cost_usd = reply.usage.cost_usd,
            session = reply.session_id.as_deref().unwrap_or("-"),
            "claude completed"
        );
        Ok(reply)
    }
}

/// Agent that spawns `codex exec --json`.
#[derive(Debug, Clone)]
pub struct CodexAgent {
    pub binary: String,
    pub model: Option<String>,
    pub extra_args: Vec<String>,
}

impl CodexAgent {
    fn command(&self, request: &AgentRequest) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("exec")
            .arg("--json")
            // Worker worktrees and scratch directories may not look like repositories.
            .arg("--skip-git-repo-check");
        if let Some(model) = &self.model {
            cmd.arg("--model").arg(model);
        }
        cmd.args(&self.extra_args);
        if let Some(session) = &request.resume {
            cmd.arg("resume").arg(session);
        }
        cmd.arg("-").current_dir(&request.workdir);
        cmd
    }
}

impl Agent for CodexAgent {
    #[instrument(skip_all, fields(role = %request.role, resume = request.resume.is_some()))]
    fn invoke(&self, request: &AgentRequest) -> Result<AgentReply> {
        info!(workdir = %request.workdir.display(), "starting codex exec");
        let output = spawn_agent(self.command(request), request, "codex exec")?;
        let reply = parse_codex_events(&output.stdout_lossy())?;
        debug!(
            output_tokens = reply.usage.output_tokens,
            session = reply.session_id.as_deref().unwrap_or("-"),
            "codex exec completed"
        );
        Ok(reply)
    }
}

/// The configured backend.
#[derive(Debug, Clone)]
pub enum CliAgent {
    Claude(ClaudeAgent),
    Codex(CodexAgent),
}

impl CliAgent {
    pub fn from_config(config: &AgentConfig) -> Self {
        let binary = config.binary_name().to_string();
        let model = config.model.clone();
        let extra_args = config.extra_args.clone();
        match config.backend {
            AgentBackend::Claude => CliAgent::Claude(ClaudeAgent {
                binary,
                model,
                extra_args,
            }),
            AgentBackend::Codex => CliAgent::Codex(CodexAgent {
                binary,
                model,
                extra_args,
            }),
        }
    }
}

impl Agent for CliAgent {
    fn invoke(&self, request: &AgentRequest) -> Result<AgentReply> {
        match self {
            CliAgent::Claude(agent) => agent.invoke(request),
            CliAgent::Codex(agent) => agent.invoke(request),
        }
    }
}

fn spawn_agent(cmd: Command, request: &AgentRequest, label: &str) -> Result<CommandOutput> {
    let stream_path = request
        .log_path
        .as_ref()
        .map(|path| path.with_extension("stream"));
    let output = run_command(
        cmd,
        Some(request.prompt.as_bytes()),
        request.timeout,
        request.output_limit_bytes,
        stream_path.as_deref(),
    )
    .with_context(|| format!("run {label}"))?;

    if let Some(path) = &request.log_path
        && let Err(e) = write_agent_log(path, request, &output, label)
    {
        warn!(err = %e, path = %path.display(), "failed to write agent log");
    }

    if output.timed_out {
        warn!(timeout_secs = request.timeout.as_secs(), "{label} timed out");
        bail!("{label} timed out after {}s", request.timeout.as_secs());
    }
    if !output.status.success() {
        warn!(exit_code = ?output.status.code(), "{label} failed");
        return Err(anyhow!("{label} failed: {}", output.failure_summary()));
    }
    Ok(output)
}

#[derive(Debug, Deserialize)]
struct ClaudeResult {
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    total_cost_usd: Option<f64>,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    usage: ClaudeUsage,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ClaudeUsage {
    input_tokens: u64,
    output_tokens: u64,
    cache_read_input_tokens: u64,
    cache_creation_input_tokens: u64,
}

/// Parse the single JSON object printed by `claude --output-format json`.
pub fn parse_claude_output(stdout: &str) -> Result<AgentReply> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        bail!("claude produced no output");
    }
    let parsed: ClaudeResult = match serde_json::from_str(trimmed) {
        Ok(parsed) => parsed,
        Err(whole) => {
            // Some versions print progress lines before the result object.
            let last_object = trimmed
                .lines()
                .rev()
                .map(str::trim)
                .find(|line| line.starts_with('{'));
            match last_object {
                Some(line) => serde_json::from_str(line).context("parse claude JSON output")?,
                None => return Err(whole).context("parse claude JSON output"),
            }
        }
    };
    if parsed.is_error {
        let detail = parsed
            .result
            .or(parsed.subtype)
            .unwrap_or_else(|| "unknown error".to_string());
        bail!("claude reported an error: {detail}");
    }
    Ok(AgentReply {
        text: parsed.result.unwrap_or_default(),
        session_id: parsed.session_id.filter(|s| !s.is_empty()),
        usage: Usage {
            input_tokens: parsed.usage.input_tokens,
            output_tokens: parsed.usage.output_tokens,
            cache_read_tokens: parsed.usage.cache_read_input_tokens,
            cache_write_tokens: parsed.usage.cache_creation_input_tokens,
            cost_usd: parsed.total_cost_usd.unwrap_or(0.0),
        },
    })
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum CodexEvent {
    #[serde(rename = "thread.started")]
    ThreadStarted { thread_id: String },
    #[serde(rename = "item.completed")]
    ItemCompleted { item: CodexItem },
    #[serde(rename = "turn.completed")]
    TurnCompleted {
        #[serde(default)]
        usage: CodexUsage,
    },
    #[serde(rename = "turn.failed")]
    TurnFailed { error: CodexError },
    #[serde(rename = "error")]
    Error { message: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct CodexItem {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CodexUsage {
    input_tokens: u64,
    cached_input_tokens: u64,
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct CodexError {
    message: String,
}

/// Parse the JSONL event stream printed by `codex exec --json`.
///
/// The reply text is the last agent message; usage is summed over turns.
/// Non-JSON lines are skipped.
pub fn parse_codex_events(stdout: &str) -> Result<AgentReply> {
    let mut reply = AgentReply::default();
    let mut saw_message = false;
    let mut saw_event = false;

    for line in stdout.lines().map(str::trim).filter(|l| l.starts_with('{')) {
        let event: CodexEvent = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(e) => {
                debug!(err = %e, "skipping unrecognized codex event");
                continue;
            }
        };
        saw_event = true;
        match event {
            CodexEvent::ThreadStarted { thread_id } => reply.session_id = Some(thread_id),
            CodexEvent::ItemCompleted { item } if item.kind == "agent_message" => {
                if let Some(text) = item.text {
                    reply.text = text;
                    saw_message = true;
                }
            }
            CodexEvent::ItemCompleted { .. } | CodexEvent::Other => {}
            CodexEvent::TurnCompleted { usage } => {
                reply.usage.input_tokens += usage.input_tokens;
                reply.usage.cache_read_tokens += usage.cached_input_tokens;
                reply.usage.output_tokens += usage.output_tokens;
            }
            CodexEvent::TurnFailed { error } => bail!("codex turn failed: {}", error.message),
            CodexEvent::Error { message } => bail!("codex reported an error: {message}"),
        }
    }

    if !saw_event {
        bail!("codex produced no JSON events");
    }
    if !saw_message {
        warn!("codex finished without an agent message");
    }
    Ok(reply)
}

/// Write prompt and captured output for one run.
pub fn write_agent_log(
    path: &Path,
    request: &AgentRequest,
    output: &CommandOutput,
    label: &str,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create agent log dir {}", parent.display()))?;
    }
    let mut buf = String::new();
    buf.push_str(&format!(
        "=== {label} ({}) resume={} ===\n",
        request.role,
        request.resume.as_deref().unwrap_or("-")
    ));
    buf.push_str("=== prompt ===\n");
    buf.push_str(&request.prompt);
    buf.push_str("\n=== stdout ===\n");
    buf.push_str(&output.stdout_lossy());
    buf.push_str(&output.stdout_truncated_notice(label));
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(&output.stderr_lossy());
    buf.push_str(&output.stderr_truncated_notice(label));
    if output.timed_out {
        buf.push_str(&format!("\n[{label} timed out]\n"));
    }
    fs::write(path, buf).with_context(|| format!("write agent log {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_claude_result() {
        let stdout = r#"{"type":"result","subtype":"success","is_error":false,"result":"APPROVED - looks good","session_id":"abc-123","total_cost_usd":0.0421,"usage":{"input_tokens":1200,"cache_creation_input_tokens":300,"cache_read_input_tokens":4000,"output_tokens":250}}"#;
        let reply = parse_claude_output(stdout).expect("parse");
        assert_eq!(reply.text, "APPROVED - looks good");
        assert_eq!(reply.session_id.as_deref(), Some("abc-123"));
        assert_eq!(reply.usage.input_tokens, 1200);
        assert_eq!(reply.usage.cache_read_tokens, 4000);
        assert_eq!(reply.usage.cache_write_tokens, 300);
        assert!((reply.usage.cost_usd - 0.0421).abs() < 1e-9);
    }

    #[test]
    fn claude_error_result_is_failure() {
        let stdout = r#"{"type":"result","subtype":"error_max_turns","is_error":true,"session_id":"s"}"#;
        let err = parse_claude_output(stdout).expect_err("is_error");
        assert!(err.to_string().contains("error_max_turns"));
    }

    #[test]
    fn claude_malformed_output_is_failure() {
        assert!(parse_claude_output("").is_err());
        assert!(parse_claude_output("Claude CLI crashed").is_err());
    }

    #[test]
    fn claude_result_after_progress_lines() {
        let stdout = "warming up\n{\"result\":\"done\",\"session_id\":\"s1\"}\n";
        let reply = parse_claude_output(stdout).expect("parse");
        assert_eq!(reply.text, "done");
        assert_eq!(reply.usage, Usage::default());
    }

    #[test]
    fn parses_codex_event_stream() {
        let stdout = concat!(
            "{\"type\":\"thread.started\",\"thread_id\":\"th_1\"}\n",
            "{\"type\":\"turn.started\"}\n",
            "{\"type\":\"item.completed\",\"item\":{\"id\":\"i0\",\"type\":\"reasoning\",\"text\":\"thinking\"}}\n",
            "{\"type\":\"item.completed\",\"item\":{\"id\":\"i1\",\"type\":\"agent_message\",\"text\":\"CHANGES_REQUESTED: add tests\"}}\n",
            "{\"type\":\"turn.completed\",\"usage\":{\"input_tokens\":900,\"cached_input_tokens\":100,\"output_tokens\":40}}\n",
        );
        let reply = parse_codex_events(stdout).expect("parse");
        assert_eq!(reply.session_id.as_deref(), Some("th_1"));
        assert_eq!(reply.text, "CHANGES_REQUESTED: add tests");
        assert_eq!(reply.usage.input_tokens, 900);
        assert_eq!(reply.usage.cache_read_tokens, 100);
        assert_eq!(reply.usage.output_tokens, 40);
    }

    #[test]
    fn codex_failed_turn_is_failure() {
        let stdout = concat!(
            "{\"type\":\"thread.started\",\"thread_id\":\"th_1\"}\n",
            "{\"type\":\"turn.failed\",\"error\":{\"message\":\"rate limited\"}}\n",
        );
        let err = parse_codex_events(stdout).expect_err("failed turn");
        assert!(err.to_string().contains("rate limited"));
        assert!(parse_codex_events("not json at all").is_err());
    }

    #[test]
    fn claude_command_includes_resume_and_model() {
        let agent = ClaudeAgent {
            binary: "claude".to_string(),
            model: Some("sonnet".to_string()),
            extra_args: vec!["--permission-mode".to_string(), "acceptEdits".to_string()],
        };
        let request = AgentRequest {
            role: Role::Fix,
            workdir: PathBuf::from("/tmp"),
            prompt: String::new(),
            resume: Some("sess-9".to_string()),
            timeout: Duration::from_secs(1),
            output_limit_bytes: 10,
            log_path: None,
        };
        let cmd = agent.command(&request);
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            [
                "--print",
                "--output-format",
                "json",
                "--resume",
                "sess-9",
                "--model",
                "sonnet",
                "--permission-mode",
                "acceptEdits"
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn failing_binary_is_invocation_error_and_logged() {
        let temp = tempfile::tempdir().expect("tempdir");
        let agent = ClaudeAgent {
            binary: "false".to_string(),
            model: None,
            extra_args: Vec::new(),
        };
        let log_path = temp.path().join("runs").join("improve.log");
        let request = AgentRequest {
            role: Role::Improve,
            workdir: temp.path().to_path_buf(),
            prompt: "do things".to_string(),
            resume: None,
            timeout: Duration::from_secs(10),
            output_limit_bytes: 1000,
            log_path: Some(log_path.clone()),
        };
        let err = agent.invoke(&request).expect_err("false exits 1");
        assert!(err.to_string().contains("claude failed"));
        let log = fs::read_to_string(&log_path).expect("log written");
        assert!(log.contains("do things"));
    }
}
