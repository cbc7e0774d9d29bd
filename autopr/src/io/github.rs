//! Pull request lifecycle over the GitHub CLI (`gh`).

use std::path::PathBuf;
use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info, instrument};

use crate::core::types::{MergeMethod, PrRef, ReviewState};
use crate::io::process::{CommandOutput, run_command};

const GH_TIMEOUT: Duration = Duration::from_secs(300);
const GH_OUTPUT_LIMIT: usize = 1_000_000;

/// Parameters for opening a pull request.
#[derive(Debug, Clone)]
pub struct PrRequest {
    pub head: String,
    pub base: String,
    pub title: String,
    pub body: String,
}

/// Operations the cycle controller needs from the git hosting service.
pub trait PrClient {
    fn create_pr(&self, request: &PrRequest) -> Result<PrRef>;
    /// Aggregate review decision recorded on the hosting side (human reviews included).
    fn review_state(&self, pr: &PrRef) -> Result<ReviewState>;
    fn comment(&self, pr: &PrRef, body: &str) -> Result<()>;
    fn merge(&self, pr: &PrRef, method: MergeMethod) -> Result<()>;
    /// Delete the remote branch.
    fn delete_branch(&self, branch: &str) -> Result<()>;
}

impl<T: PrClient + ?Sized> PrClient for &T {
    fn create_pr(&self, request: &PrRequest) -> Result<PrRef> {
        (**self).create_pr(request)
    }
    fn review_state(&self, pr: &PrRef) -> Result<ReviewState> {
        (**self).review_state(pr)
    }
    fn comment(&self, pr: &PrRef, body: &str) -> Result<()> {
        (**self).comment(pr, body)
    }
    fn merge(&self, pr: &PrRef, method: MergeMethod) -> Result<()> {
        (**self).merge(pr, method)
    }
    fn delete_branch(&self, branch: &str) -> Result<()> {
        (**self).delete_branch(branch)
    }
}

/// `gh`-backed client. Runs in the project directory so `gh` resolves the repository from its remotes.
#[derive(Debug, Clone)]
pub struct GhClient {
    repo_dir: PathBuf,
    binary: PathBuf,
}

impl GhClient {
    pub fn new(repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
            binary: PathBuf::from("gh"),
        }
    }

    /// Use a specific `gh` executable instead of the one on `PATH`.
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    fn run(&self, args: &[&str], stdin: Option<&str>) -> Result<CommandOutput> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .current_dir(&self.repo_dir)
            .env("GH_PROMPT_DISABLED", "1");
        let output = run_command(
            cmd,
            stdin.map(str::as_bytes),
            GH_TIMEOUT,
            GH_OUTPUT_LIMIT,
            None,
        )
        .with_context(|| format!("gh {}", args.join(" ")))?;
        if !output.success() {
            return Err(anyhow!(
                "gh {} failed: {}",
                args.join(" "),
                output.failure_summary()
            ));
        }
        Ok(output)
    }
}

impl PrClient for GhClient {
    #[instrument(skip_all, fields(head = %request.head, base = %request.base))]
    fn create_pr(&self, request: &PrRequest) -> Result<PrRef> {
        let output = self.run(
            &[
                "pr",
                "create",
                "--head",
                &request.head,
                "--base",
                &request.base,
                "--title",
                &request.title,
                "--body-file",
                "-",
            ],
            Some(request.body.as_str()),
        )?;
        let pr = parse_pr_url(&output.stdout_lossy())?;
        info!(number = pr.number, url = %pr.url, "opened pull request");
        Ok(pr)
    }

    #[instrument(skip_all, fields(pr = pr.number))]
    fn review_state(&self, pr: &PrRef) -> Result<ReviewState> {
        let number = pr.number.to_string();
        let output = self.run(&["pr", "view", &number, "--json", "reviewDecision"], None)?;
        let state = parse_review_decision(&output.stdout_lossy())?;
        debug!(?state, "review state");
        Ok(state)
    }

    #[instrument(skip_all, fields(pr = pr.number))]
    fn comment(&self, pr: &PrRef, body: &str) -> Result<()> {
        let number = pr.number.to_string();
        self.run(&["pr", "comment", &number, "--body-file", "-"], Some(body))?;
        Ok(())
    }

    #[instrument(skip_all, fields(pr = pr.number, ?method))]
    fn merge(&self, pr: &PrRef, method: MergeMethod) -> Result<()> {
        let number = pr.number.to_string();
        self.run(&["pr", "merge", &number, method.gh_flag()], None)?;
        info!("merged pull request");
        Ok(())
    }

    #[instrument(skip_all, fields(%branch))]
    fn delete_branch(&self, branch: &str) -> Result<()> {
        let endpoint = format!("repos/{{owner}}/{{repo}}/git/refs/heads/{branch}");
        self.run(&["api", "--method", "DELETE", &endpoint], None)?;
        debug!("deleted remote branch");
        Ok(())
    }
}

static PR_URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://\S+/pull/(\d+)").expect("valid regex"));

/// Extract the PR reference from `gh pr create` output.
pub fn parse_pr_url(output: &str) -> Result<PrRef> {
    let caps = PR_URL_RE
        .captures_iter(output)
        .last()
        .ok_or_else(|| anyhow!("no pull request URL in gh output: {}", output.trim()))?;
    let number = caps[1]
        .parse()
        .with_context(|| format!("parse PR number from {}", &caps[0]))?;
    Ok(PrRef {
        number,
        url: caps[0].to_string(),
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReviewDecision {
    #[serde(default)]
    review_decision: Option<String>,
}

/// Map `gh pr view --json reviewDecision` output to a review state.
pub fn parse_review_decision(output: &str) -> Result<ReviewState> {
    let parsed: ReviewDecision =
        serde_json::from_str(output.trim()).context("parse gh reviewDecision JSON")?;
    Ok(match parsed.review_decision.as_deref() {
        Some("APPROVED") => ReviewState::Approved,
        Some("CHANGES_REQUESTED") => ReviewState::ChangesRequested,
        _ => ReviewState::Pending,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pr_url_from_create_output() {
        let output = "Creating pull request for auto-docs/1 into main\n\nhttps://github.com/owner/repo/pull/123\n";
        let pr = parse_pr_url(output).expect("parse");
        assert_eq!(pr.number, 123);
        assert_eq!(pr.url, "https://github.com/owner/repo/pull/123");
    }

    #[test]
    fn missing_pr_url_is_an_error() {
        assert!(parse_pr_url("a pull request already exists").is_err());
    }

    #[test]
    fn review_decisions_map_to_states() {
        assert_eq!(
            parse_review_decision(r#"{"reviewDecision":"APPROVED"}"#).unwrap(),
            ReviewState::Approved
        );
        assert_eq!(
            parse_review_decision(r#"{"reviewDecision":"CHANGES_REQUESTED"}"#).unwrap(),
            ReviewState::ChangesRequested
        );
        assert_eq!(
            parse_review_decision(r#"{"reviewDecision":"REVIEW_REQUIRED"}"#).unwrap(),
            ReviewState::Pending
        );
        assert_eq!(
            parse_review_decision(r#"{"reviewDecision":""}"#).unwrap(),
            ReviewState::Pending
        );
        assert!(parse_review_decision("not json").is_err());
    }

    #[derive(Clone, Default)]
    struct SharedBuf(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().expect("log buffer").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[cfg(unix)]
    #[test]
    fn delete_branch_span_records_branch() {
        let temp = tempfile::tempdir().expect("tempdir");
        let logs = SharedBuf::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        // `true` accepts any arguments and succeeds, standing in for `gh api`.
        GhClient::new(temp.path())
            .with_binary("true")
            .delete_branch("auto-docs/20260101-120000-abcd")
            .expect("delete branch");

        let output = String::from_utf8(logs.0.lock().expect("log buffer").clone()).expect("utf8");
        assert!(
            output.contains("delete_branch{branch=auto-docs/20260101-120000-abcd}"),
            "{output}"
        );
    }
}
