//! Helpers for running child processes with timeouts and bounded output.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success() && !self.timed_out
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub fn stdout_truncated_notice(&self, label: &str) -> String {
        if self.stdout_truncated > 0 {
            format!(
                "\n[{label} stdout truncated {} bytes]\n",
                self.stdout_truncated
            )
        } else {
            String::new()
        }
    }

    pub fn stderr_truncated_notice(&self, label: &str) -> String {
        if self.stderr_truncated > 0 {
            format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_truncated
            )
        } else {
            String::new()
        }
    }

    /// One-line failure description: timeout, exit code, and a stderr excerpt.
    pub fn failure_summary(&self) -> String {
        if self.timed_out {
            return "timed out".to_string();
        }
        let code = self
            .status
            .code()
            .map_or_else(|| "signal".to_string(), |c| c.to_string());
        let stderr = self.stderr_lossy();
        let detail = stderr.trim();
        let detail = if detail.is_empty() {
            self.stdout_lossy().trim().to_string()
        } else {
            detail.to_string()
        };
        let excerpt: String = detail.chars().take(500).collect();
        if excerpt.is_empty() {
            format!("exit code {code}")
        } else {
            format!("exit code {code}: {excerpt}")
        }
    }
}

/// Put the child in its own process group so a terminal Ctrl-C reaches only
/// the orchestrator, which then lets the running child finish. The group is
/// also what a timeout kills.
fn detach_from_terminal(cmd: &mut Command) {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    #[cfg(not(unix))]
    {
        let _ = cmd;
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
/// When `tee_path` is set, every stdout line is also appended to that file as it arrives.
/// The child runs in its own process group; on timeout the whole group is killed, so
/// grandchildren holding the output pipes cannot outlive the deadline.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes, teeing = tee_path.is_some()))]
pub fn run_command(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
    tee_path: Option<&Path>,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    detach_from_terminal(&mut cmd);

    let program = cmd.get_program().to_string_lossy().into_owned();
    debug!(%program, "spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(%program, err = %e, "failed to spawn command");
            return Err(e).with_context(|| format!("spawn {program}"));
        }
    };

    let stdin_handle = match stdin {
        Some(input) => {
            let mut child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            let input = input.to_vec();
            Some(thread::spawn(move || -> Result<()> {
                match child_stdin.write_all(&input) {
                    Ok(()) => Ok(()),
                    // The child may exit without reading its input.
                    Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
                    Err(e) => Err(e).context("write stdin"),
                }
            }))
        }
        None => None,
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let tee = match tee_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create tee dir {}", parent.display()))?;
            }
            let file = File::create(path)
                .with_context(|| format!("create tee file {}", path.display()))?;
            Some(BufWriter::new(file))
        }
        None => None,
    };

    let stdout_handle =
        thread::spawn(move || read_lines_limited(stdout, output_limit_bytes, tee));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                %program,
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            kill_process_group(&mut child)?;
            child.wait().context("wait command after kill")?
        }
    };

    if let Some(handle) = stdin_handle {
        match handle.join() {
            Ok(result) => result?,
            Err(_) => return Err(anyhow!("stdin writer thread panicked")),
        }
    }
    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(%program, exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

/// SIGKILL the child's process group, falling back to the child alone.
fn kill_process_group(child: &mut Child) -> Result<()> {
    #[cfg(unix)]
    {
        let group = format!("-{}", child.id());
        match Command::new("kill")
            .args(["-KILL", "--", &group])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(status) if status.success() => return Ok(()),
            Ok(status) => warn!(code = ?status.code(), "kill of process group failed"),
            Err(e) => warn!(err = %e, "could not run kill for process group"),
        }
    }
    child.kill().context("kill command")
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

/// Read line by line with a size limit, optionally tee-ing each line to a file.
fn read_lines_limited<R: Read>(
    reader: R,
    limit: usize,
    mut tee: Option<BufWriter<File>>,
) -> Result<(Vec<u8>, usize)> {
    let mut buf_reader = BufReader::new(reader);
    let mut collected = Vec::new();
    let mut truncated = 0usize;

    loop {
        let mut line = Vec::new();
        let n = buf_reader
            .read_until(b'\n', &mut line)
            .context("read line")?;
        if n == 0 {
            break;
        }

        if let Some(writer) = tee.as_mut()
            && let Err(e) = writer.write_all(&line).and_then(|()| writer.flush())
        {
            warn!(err = %e, "failed to write tee file");
            tee = None;
        }

        let remaining = limit.saturating_sub(collected.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            collected.extend_from_slice(&line[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((collected, truncated))
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout_and_stdin() {
        let cmd = Command::new("cat");
        let output = run_command(cmd, Some(b"hello\n"), Duration::from_secs(10), 1024, None)
            .expect("run cat");
        assert!(output.success());
        assert_eq!(output.stdout_lossy(), "hello\n");
    }

    #[test]
    fn truncates_beyond_limit() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "printf 'abcdefghij'"]);
        let output = run_command(cmd, None, Duration::from_secs(10), 4, None).expect("run sh");
        assert_eq!(output.stdout, b"abcd");
        assert_eq!(output.stdout_truncated, 6);
        assert!(output.stdout_truncated_notice("sh").contains("truncated 6 bytes"));
    }

    #[test]
    fn times_out_and_reports() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let output =
            run_command(cmd, None, Duration::from_millis(100), 1024, None).expect("run sleep");
        assert!(output.timed_out);
        assert!(!output.success());
        assert_eq!(output.failure_summary(), "timed out");
    }

    #[test]
    fn timeout_kills_grandchildren_holding_the_pipes() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "sleep 5 | cat; echo done"]);
        let started = std::time::Instant::now();
        let output =
            run_command(cmd, None, Duration::from_millis(200), 1024, None).expect("run sh");
        assert!(output.timed_out);
        assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());
        assert!(!output.stdout_lossy().contains("done"));
    }

    #[test]
    fn tees_stdout_to_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tee = temp.path().join("logs").join("out.log");
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo one; echo two"]);
        let output =
            run_command(cmd, None, Duration::from_secs(10), 1024, Some(&tee)).expect("run sh");
        assert!(output.success());
        assert_eq!(std::fs::read_to_string(&tee).expect("read tee"), "one\ntwo\n");
    }

    #[test]
    fn missing_binary_is_an_error() {
        let cmd = Command::new("definitely-not-a-real-binary-autopr");
        let err = run_command(cmd, None, Duration::from_secs(1), 1024, None)
            .expect_err("spawn should fail");
        assert!(format!("{err:#}").contains("spawn definitely-not-a-real-binary-autopr"));
    }

    #[test]
    fn failure_summary_includes_stderr() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo boom >&2; exit 2"]);
        let output = run_command(cmd, None, Duration::from_secs(10), 1024, None).expect("run sh");
        assert_eq!(output.failure_summary(), "exit code 2: boom");
    }
}
