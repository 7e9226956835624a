//! Command runner: child processes with timeouts and bounded output.
//!
//! Every external program (git, tests, lint, the proposer agent, the hosting
//! CLI) goes through [`run`]. Arguments are passed as a discrete argv list and
//! never interpreted by a shell.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::error::ProcessError;

pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 1_000_000;

/// How a non-zero exit is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Non-zero exit or timeout is an error carrying the captured output.
    Strict,
    /// Return the raw output and let the caller classify it (existence checks,
    /// verification commands).
    Lenient,
}

/// A single process invocation.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub argv: Vec<String>,
    pub workdir: PathBuf,
    pub timeout: Duration,
    pub stdin: Option<Vec<u8>>,
    pub env: Vec<(String, String)>,
    pub output_limit_bytes: usize,
    /// When set, stdout lines are also written (and flushed) to this file as
    /// they arrive.
    pub stream_path: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new<I, S>(argv: I, workdir: impl Into<PathBuf>, timeout: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            workdir: workdir.into(),
            timeout,
            stdin: None,
            env: Vec::new(),
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
            stream_path: None,
        }
    }

    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn output_limit(mut self, bytes: usize) -> Self {
        self.output_limit_bytes = bytes;
        self
    }

    pub fn stream_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.stream_path = Some(path.into());
        self
    }

    /// Human-readable rendering of the argv, quoted where needed.
    pub fn display(&self) -> String {
        shell_words::join(&self.argv)
    }
}

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub command: String,
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.status.code()
    }

    pub fn stdout_str(&self) -> String {
        let mut out = String::from_utf8_lossy(&self.stdout).to_string();
        out.push_str(&truncated_notice("stdout", self.stdout_truncated));
        out
    }

    pub fn stderr_str(&self) -> String {
        let mut out = String::from_utf8_lossy(&self.stderr).to_string();
        out.push_str(&truncated_notice("stderr", self.stderr_truncated));
        out
    }
}

fn truncated_notice(label: &str, truncated: usize) -> String {
    if truncated > 0 {
        format!("\n[{label} truncated {truncated} bytes]\n")
    } else {
        String::new()
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs; bytes beyond
/// `output_limit_bytes` are discarded while the pipe keeps draining. On timeout
/// the child's whole process group is killed.
#[instrument(skip_all, fields(command = %spec.display(), timeout_secs = spec.timeout.as_secs()))]
pub fn run(spec: &CommandSpec, mode: Mode) -> Result<CommandOutput, ProcessError> {
    let command = spec.display();
    let (program, args) = spec.argv.split_first().ok_or_else(|| ProcessError::Io {
        command: command.clone(),
        detail: "empty command".to_string(),
    })?;

    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(&spec.workdir);
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }
    if spec.stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(ProcessError::Spawn {
                program: program.clone(),
                source: e,
            });
        }
    };

    let io_err = |detail: String| ProcessError::Io {
        command: command.clone(),
        detail,
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io_err("stdout was not piped".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| io_err("stderr was not piped".to_string()))?;

    let tee = match &spec.stream_path {
        Some(path) => Some(open_stream_file(path).map_err(|e| io_err(e.to_string()))?),
        None => None,
    };
    let limit = spec.output_limit_bytes;
    let stdout_handle = thread::spawn(move || read_lines_limited(stdout, limit, tee));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, limit));

    if let Some(input) = spec.stdin.clone() {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| io_err("stdin was not piped".to_string()))?;
        // Written off-thread so a child that never reads stdin cannot block the
        // timeout. A broken pipe only means the child exited early; its exit
        // status says what happened.
        thread::spawn(move || {
            if let Err(e) = child_stdin.write_all(&input)
                && e.kind() != std::io::ErrorKind::BrokenPipe
            {
                warn!(err = %e, "failed to write stdin");
            }
        });
    }

    let mut timed_out = false;
    let status = match child
        .wait_timeout(spec.timeout)
        .map_err(|e| io_err(format!("wait: {e}")))?
    {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = spec.timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            kill_tree(&mut child).map_err(|e| io_err(format!("kill: {e}")))?;
            child
                .wait()
                .map_err(|e| io_err(format!("wait after kill: {e}")))?
        }
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).map_err(io_err)?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).map_err(io_err)?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    let output = CommandOutput {
        command,
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    };

    if mode == Mode::Lenient {
        return Ok(output);
    }
    if output.timed_out {
        return Err(ProcessError::TimedOut {
            command: output.command.clone(),
            timeout: spec.timeout,
            stdout: output.stdout_str(),
            stderr: output.stderr_str(),
        });
    }
    if !output.status.success() {
        return Err(ProcessError::Failed {
            command: output.command.clone(),
            exit_code: output.exit_code(),
            stdout: output.stdout_str(),
            stderr: output.stderr_str(),
        });
    }
    Ok(output)
}

fn kill_tree(child: &mut Child) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;
        // The child leads its own process group, so this also reaches anything
        // it spawned that still holds our pipes open.
        if let Ok(pid) = i32::try_from(child.id())
            && let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL)
        {
            debug!(err = %e, "killpg failed, falling back to kill");
        }
    }
    child.kill()
}

fn open_stream_file(path: &Path) -> std::io::Result<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(BufWriter::new(File::create(path)?))
}

type ReadResult = Result<(Vec<u8>, usize), String>;

fn join_output(handle: thread::JoinHandle<ReadResult>) -> ReadResult {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err("output reader thread panicked".to_string()),
    }
}

/// Read line by line with a size limit, optionally tee-ing each line to a file.
fn read_lines_limited<R: Read>(
    reader: R,
    limit: usize,
    mut tee: Option<BufWriter<File>>,
) -> ReadResult {
    let mut buf_reader = BufReader::new(reader);
    let mut collected = Vec::new();
    let mut truncated = 0usize;

    loop {
        let mut line = Vec::new();
        let n = buf_reader
            .read_until(b'\n', &mut line)
            .map_err(|e| format!("read output: {e}"))?;
        if n == 0 {
            break;
        }

        if let Some(writer) = tee.as_mut()
            && let Err(e) = writer.write_all(&line).and_then(|()| writer.flush())
        {
            warn!(err = %e, "failed to write to stream file");
            tee = None;
        }

        let remaining = limit.saturating_sub(collected.len());
        let keep = n.min(remaining);
        collected.extend_from_slice(&line[..keep]);
        truncated += n - keep;
    }

    Ok((collected, truncated))
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> ReadResult {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader
            .read(&mut chunk)
            .map_err(|e| format!("read output: {e}"))?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        let keep = n.min(remaining);
        buf.extend_from_slice(&chunk[..keep]);
        truncated += n - keep;
    }

    Ok((buf, truncated))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str, dir: &Path) -> CommandSpec {
        CommandSpec::new(["sh", "-c", script], dir, Duration::from_secs(10))
    }

    #[test]
    fn captures_stdout_and_stderr() {
        let temp = tempfile::tempdir().expect("tempdir");
        let out = run(&sh("echo out; echo err 1>&2", temp.path()), Mode::Strict).expect("run");
        assert_eq!(String::from_utf8_lossy(&out.stdout), "out\n");
        assert_eq!(String::from_utf8_lossy(&out.stderr), "err\n");
        assert!(out.success());
    }

    #[test]
    fn strict_mode_reports_failure_with_stderr() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = run(&sh("echo boom 1>&2; exit 3", temp.path()), Mode::Strict).unwrap_err();
        match err {
            ProcessError::Failed {
                exit_code, stderr, ..
            } => {
                assert_eq!(exit_code, Some(3));
                assert!(stderr.contains("boom"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn lenient_mode_returns_raw_exit() {
        let temp = tempfile::tempdir().expect("tempdir");
        let out = run(&sh("exit 1", temp.path()), Mode::Lenient).expect("run");
        assert_eq!(out.exit_code(), Some(1));
        assert!(!out.success());
    }

    #[test]
    fn timeout_kills_child_and_reports_timed_out() {
        let temp = tempfile::tempdir().expect("tempdir");
        let spec = CommandSpec::new(["sh", "-c", "sleep 30"], temp.path(), Duration::from_millis(200));
        let started = std::time::Instant::now();
        let err = run(&spec, Mode::Strict).unwrap_err();
        assert!(err.is_timeout(), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(10));

        let out = run(&spec, Mode::Lenient).expect("lenient");
        assert!(out.timed_out);
    }

    #[test]
    fn arguments_are_not_shell_interpreted() {
        let temp = tempfile::tempdir().expect("tempdir");
        let spec = CommandSpec::new(
            ["echo", "$(touch pwned); ls"],
            temp.path(),
            Duration::from_secs(5),
        );
        let out = run(&spec, Mode::Strict).expect("run");
        assert_eq!(String::from_utf8_lossy(&out.stdout), "$(touch pwned); ls\n");
        assert!(!temp.path().join("pwned").exists());
    }

    #[test]
    fn missing_program_is_spawn_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let spec = CommandSpec::new(
            ["definitely-not-a-real-binary-xyz"],
            temp.path(),
            Duration::from_secs(1),
        );
        assert!(matches!(
            run(&spec, Mode::Lenient),
            Err(ProcessError::Spawn { .. })
        ));
    }

    #[test]
    fn output_beyond_limit_is_truncated() {
        let temp = tempfile::tempdir().expect("tempdir");
        let spec = sh("printf 'abcdefghij'", temp.path()).output_limit(4);
        let out = run(&spec, Mode::Strict).expect("run");
        assert_eq!(out.stdout, b"abcd");
        assert_eq!(out.stdout_truncated, 6);
        assert!(out.stdout_str().contains("[stdout truncated 6 bytes]"));
    }

    #[test]
    fn stdin_and_stream_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let stream = temp.path().join("logs").join("stream.log");
        let spec = CommandSpec::new(["cat"], temp.path(), Duration::from_secs(5))
            .stdin("line one\nline two\n")
            .stream_to(&stream);
        let out = run(&spec, Mode::Strict).expect("run");
        assert_eq!(out.stdout, b"line one\nline two\n");
        let streamed = std::fs::read_to_string(&stream).expect("read stream");
        assert_eq!(streamed, "line one\nline two\n");
    }
}
