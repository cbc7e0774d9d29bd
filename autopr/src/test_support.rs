//! Test-only helpers: scripted agents, a recording PR client, and throwaway repositories.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use anyhow::{Result, anyhow, bail};
use tempfile::TempDir;

use crate::core::types::{AgentReply, MergeMethod, PrRef, ReviewState, Role, Usage};
use crate::io::agent::{Agent, AgentRequest};
use crate::io::git::Git;
use crate::io::github::{PrClient, PrRequest};
use crate::io::notify::Notifier;

/// One scripted agent run.
#[derive(Debug, Clone, Default)]
pub struct ScriptedStep {
    pub text: String,
    pub session_id: Option<String>,
    pub usage: Usage,
    /// Files written relative to the request's working directory before replying.
    pub writes: Vec<(String, String)>,
    /// Fail the run with this message instead of replying.
    pub error: Option<String>,
}

impl ScriptedStep {
    pub fn reply(text: &str) -> Self {
        Self {
            text: text.to_string(),
            ..Self::default()
        }
    }

    pub fn fail(message: &str) -> Self {
        Self {
            error: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn with_session(mut self, id: &str) -> Self {
        self.session_id = Some(id.to_string());
        self
    }

    pub fn with_cost(mut self, cost_usd: f64, input_tokens: u64, output_tokens: u64) -> Self {
        self.usage = Usage {
            input_tokens,
            output_tokens,
            cost_usd,
            ..Usage::default()
        };
        self
    }

    pub fn writes(mut self, path: &str, contents: &str) -> Self {
        self.writes.push((path.to_string(), contents.to_string()));
        self
    }
}

/// What a scripted agent was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub role: Role,
    pub resume: Option<String>,
    pub prompt: String,
    pub workdir: PathBuf,
}

/// Agent that replays a fixed queue of steps and records every request.
#[derive(Debug, Default)]
pub struct ScriptedAgent {
    steps: Mutex<VecDeque<ScriptedStep>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedAgent {
    pub fn new(steps: Vec<ScriptedStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn roles(&self) -> Vec<Role> {
        self.requests().into_iter().map(|r| r.role).collect()
    }

    pub fn remaining(&self) -> usize {
        self.steps.lock().expect("steps lock").len()
    }
}

impl Agent for ScriptedAgent {
    fn invoke(&self, request: &AgentRequest) -> Result<AgentReply> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(RecordedRequest {
                role: request.role,
                resume: request.resume.clone(),
                prompt: request.prompt.clone(),
                workdir: request.workdir.clone(),
            });
        let step = self
            .steps
            .lock()
            .expect("steps lock")
            .pop_front()
            .ok_or_else(|| anyhow!("scripted agent has no step left for {}", request.role))?;
        if let Some(message) = step.error {
            bail!(message);
        }
        write_files(&request.workdir, &step.writes)?;
        Ok(AgentReply {
            text: step.text,
            session_id: step.session_id,
            usage: step.usage,
        })
    }
}

/// Agent backed by a closure, for tests where replies depend on the request.
pub struct FnAgent<F>(pub F);

impl<F> Agent for FnAgent<F>
where
    F: Fn(&AgentRequest) -> Result<AgentReply>,
{
    fn invoke(&self, request: &AgentRequest) -> Result<AgentReply> {
        (self.0)(request)
    }
}

pub fn write_files(root: &Path, files: &[(String, String)]) -> Result<()> {
    for (rel, contents) in files {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, contents)?;
    }
    Ok(())
}

/// Everything the recording client was asked to do.
#[derive(Debug, Clone, Default)]
pub struct PrLog {
    pub created: Vec<PrRequest>,
    pub comments: Vec<(u64, String)>,
    pub merged: Vec<(u64, MergeMethod)>,
    pub deleted_branches: Vec<String>,
}

/// In-memory PR client. PR numbers count up from 1.
#[derive(Debug)]
pub struct RecordingPrClient {
    log: Mutex<PrLog>,
    review_state: Option<ReviewState>,
    fail_create: bool,
    fail_merge: bool,
}

impl Default for RecordingPrClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingPrClient {
    pub fn new() -> Self {
        Self {
            log: Mutex::new(PrLog::default()),
            review_state: Some(ReviewState::Pending),
            fail_create: false,
            fail_merge: false,
        }
    }

    /// Review state reported by the host; `None` makes the lookup fail.
    pub fn with_review_state(mut self, state: Option<ReviewState>) -> Self {
        self.review_state = state;
        self
    }

    pub fn failing_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    pub fn failing_merge(mut self) -> Self {
        self.fail_merge = true;
        self
    }

    pub fn log(&self) -> PrLog {
        self.log.lock().expect("pr log lock").clone()
    }
}

impl PrClient for RecordingPrClient {
    fn create_pr(&self, request: &PrRequest) -> Result<PrRef> {
        if self.fail_create {
            bail!("gh pr create failed: exit code 1: no permission");
        }
        let mut log = self.log.lock().expect("pr log lock");
        log.created.push(request.clone());
        let number = log.created.len() as u64;
        Ok(PrRef {
            number,
            url: format!("https://github.com/acme/widgets/pull/{number}"),
        })
    }

    fn review_state(&self, _pr: &PrRef) -> Result<ReviewState> {
        self.review_state
            .ok_or_else(|| anyhow!("gh pr view failed: exit code 1: rate limited"))
    }

    fn comment(&self, pr: &PrRef, body: &str) -> Result<()> {
        self.log
            .lock()
            .expect("pr log lock")
            .comments
            .push((pr.number, body.to_string()));
        Ok(())
    }

    fn merge(&self, pr: &PrRef, method: MergeMethod) -> Result<()> {
        if self.fail_merge {
            bail!("gh pr merge failed: exit code 1: not mergeable");
        }
        self.log
            .lock()
            .expect("pr log lock")
            .merged
            .push((pr.number, method));
        Ok(())
    }

    fn delete_branch(&self, branch: &str) -> Result<()> {
        self.log
            .lock()
            .expect("pr log lock")
            .deleted_branches
            .push(branch.to_string());
        Ok(())
    }
}

/// Notifier that keeps every message.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().expect("messages lock").clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, message: &str) -> Result<()> {
        self.messages
            .lock()
            .expect("messages lock")
            .push(message.to_string());
        Ok(())
    }
}

/// Working clone on `main` with a bare `origin`, both in a temp directory.
///
/// Layout: `README.md`, `src/lib.txt`, `docs/guide.md`.
pub struct TestRepo {
    _temp: TempDir,
    origin: PathBuf,
    work: PathBuf,
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}

impl TestRepo {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let origin = temp.path().join("origin.git");
        let work = temp.path().join("work");
        fs::create_dir_all(&work).expect("create work dir");

        git_in(temp.path(), &["init", "--bare", "-q", "origin.git"]);
        git_in(&work, &["init", "-q", "-b", "main"]);
        git_in(&work, &["config", "user.email", "autopr-tests@example.com"]);
        git_in(&work, &["config", "user.name", "autopr tests"]);
        git_in(&work, &["config", "commit.gpgsign", "false"]);
        git_in(&work, &["remote", "add", "origin", &origin.to_string_lossy()]);

        let repo = Self {
            _temp: temp,
            origin,
            work,
        };
        repo.write("README.md", "# widgets\n");
        repo.write("src/lib.txt", "fn main() {}\n");
        repo.write("docs/guide.md", "# Guide\n");
        repo.commit_all("initial commit");
        git_in(&repo.work, &["push", "-q", "-u", "origin", "main"]);
        repo
    }

    pub fn path(&self) -> &Path {
        &self.work
    }

    pub fn origin(&self) -> &Path {
        &self.origin
    }

    pub fn git(&self) -> Git {
        Git::new(&self.work)
    }

    pub fn write(&self, rel: &str, contents: &str) {
        write_files(&self.work, &[(rel.to_string(), contents.to_string())]).expect("write file");
    }

    pub fn commit_all(&self, message: &str) {
        git_in(&self.work, &["add", "-A"]);
        git_in(&self.work, &["commit", "-q", "-m", message]);
    }

    pub fn remote_branch_exists(&self, branch: &str) -> bool {
        let output = Command::new("git")
            .args(["ls-remote", "--heads", "origin", &format!("refs/heads/{branch}")])
            .current_dir(&self.work)
            .output()
            .expect("git ls-remote");
        !String::from_utf8_lossy(&output.stdout).trim().is_empty()
    }

    pub fn local_branches(&self) -> Vec<String> {
        let output = Command::new("git")
            .args(["branch", "--format=%(refname:short)"])
            .current_dir(&self.work)
            .output()
            .expect("git branch");
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .collect()
    }
}

fn git_in(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .expect("spawn git");
    assert!(
        output.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr)
    );
}
