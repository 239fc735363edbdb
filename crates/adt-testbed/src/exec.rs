//! Command execution with per-kind timeouts.
//!
//! Testbed commands run on the host through the virt-server's execute
//! prefix, so a [`CommandRunner`] only ever spawns local processes. Tests
//! substitute a scripted runner.

use std::fmt;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, warn};

/// Timeout class of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecKind {
    Short,
    Copy,
    Install,
    Test,
    Build,
}

impl fmt::Display for ExecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExecKind::Short => "short",
            ExecKind::Copy => "copy",
            ExecKind::Install => "install",
            ExecKind::Test => "test",
            ExecKind::Build => "build",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Stream {
    /// Pass through to our own stdout/stderr.
    #[default]
    Inherit,
    Capture,
    Null,
}

impl Stream {
    fn stdio(self) -> Stdio {
        match self {
            Stream::Inherit => Stdio::inherit(),
            Stream::Capture => Stdio::piped(),
            Stream::Null => Stdio::null(),
        }
    }
}

/// Options for [`crate::Testbed::execute`].
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub env: Vec<String>,
    pub stdout: Stream,
    pub stderr: Stream,
    pub kind: Option<ExecKind>,
}

impl ExecOptions {
    pub fn kind(kind: ExecKind) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }

    pub fn capture() -> Self {
        Self::default().capture_stdout().capture_stderr()
    }

    pub fn capture_stdout(mut self) -> Self {
        self.stdout = Stream::Capture;
        self
    }

    pub fn capture_stderr(mut self) -> Self {
        self.stderr = Stream::Capture;
        self
    }

    pub fn with_kind(mut self, kind: ExecKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }
}

/// A fully prepared local process invocation.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub argv: Vec<String>,
    pub stdout: Stream,
    pub stderr: Stream,
    pub timeout: Duration,
    /// Reap the process after signalling it on timeout. Off for commands
    /// behind sudo, which may ignore our signal.
    pub wait_after_kill: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Exit code, or the negated signal number for signalled processes.
    pub code: i32,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

impl ExecOutput {
    pub fn stdout_str(&self) -> &str {
        self.stdout.as_deref().unwrap_or("")
    }

    pub fn stderr_str(&self) -> &str {
        self.stderr.as_deref().unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Exited(ExecOutput),
    TimedOut,
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: &RunSpec) -> io::Result<RunOutcome>;
}

/// Spawns real processes, each in its own process group.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: &RunSpec) -> io::Result<RunOutcome> {
        let Some((program, args)) = spec.argv.split_first() else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty argv"));
        };
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(spec.stdout.stdio())
            .stderr(spec.stderr.stdio())
            .process_group(0);

        let mut child = command.spawn()?;
        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // The timeout covers the pipes too; background children may hold
        // them open after the main process exits.
        let finished = async {
            let (status, stdout, stderr) =
                tokio::join!(child.wait(), read_stream(stdout), read_stream(stderr));
            status.map(|status| (status, stdout, stderr))
        };
        let outcome = tokio::time::timeout(spec.timeout, finished).await;

        match outcome {
            Ok(result) => {
                let (status, stdout, stderr) = result?;
                Ok(RunOutcome::Exited(ExecOutput {
                    code: exit_code(status),
                    stdout,
                    stderr,
                }))
            }
            Err(_) => {
                if let Some(pid) = pid {
                    kill_tree(pid).await;
                }
                if spec.wait_after_kill {
                    let _ = child.wait().await;
                }
                Ok(RunOutcome::TimedOut)
            }
        }
    }
}

async fn read_stream<R>(reader: Option<R>) -> Option<String>
where
    R: AsyncRead + Unpin,
{
    let mut reader = reader?;
    let mut out = Vec::new();
    let _ = reader.read_to_end(&mut out).await;
    Some(String::from_utf8_lossy(&out).into_owned())
}

pub fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => -signal,
        (None, None) => -1,
    }
}

/// SIGTERM the process group led by `pid`; when there is no such group,
/// walk the descendants with `ps` and signal each one.
pub async fn kill_tree(pid: u32) {
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: plain syscall on a pid we spawned.
    if unsafe { libc::killpg(raw, libc::SIGTERM) } == 0 {
        debug!(pid, "sent SIGTERM to process group");
        return;
    }
    let mut stack = vec![raw];
    let mut victims = Vec::new();
    while let Some(p) = stack.pop() {
        victims.push(p);
        stack.extend(child_pids(p).await);
    }
    for p in victims {
        // SAFETY: see above.
        if unsafe { libc::kill(p, libc::SIGTERM) } != 0 {
            warn!(pid = p, "cannot signal process: {}", io::Error::last_os_error());
        }
    }
}

async fn child_pids(pid: libc::pid_t) -> Vec<libc::pid_t> {
    let output = Command::new("ps")
        .args(["-o", "pid=", "--ppid", &pid.to_string()])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .await;
    match output {
        Ok(out) => String::from_utf8_lossy(&out.stdout)
            .split_whitespace()
            .filter_map(|p| p.parse().ok())
            .collect(),
        Err(_) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(argv: &[&str], timeout: Duration) -> RunSpec {
        RunSpec {
            argv: argv.iter().map(|s| s.to_string()).collect(),
            stdout: Stream::Capture,
            stderr: Stream::Capture,
            timeout,
            wait_after_kill: true,
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn captures_both_streams_and_exit_code() {
        let outcome = ProcessRunner
            .run(&spec(
                &["sh", "-c", "echo out; echo err >&2; exit 3"],
                Duration::from_secs(10),
            ))
            .await
            .unwrap();
        let RunOutcome::Exited(out) = outcome else {
            panic!("unexpected timeout");
        };
        assert_eq!(out.code, 3);
        assert_eq!(out.stdout_str(), "out\n");
        assert_eq!(out.stderr_str(), "err\n");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn signalled_process_reports_negative_signal() {
        let outcome = ProcessRunner
            .run(&spec(&["sh", "-c", "kill -9 $$"], Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Exited(ExecOutput {
                code: -9,
                stdout: Some(String::new()),
                stderr: Some(String::new()),
            })
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn timeout_terminates_the_process_group() {
        let mut s = spec(&["sh", "-c", "sleep 30 & sleep 30; wait"], Duration::from_millis(200));
        s.stdout = Stream::Null;
        s.stderr = Stream::Null;
        let started = std::time::Instant::now();
        let outcome = ProcessRunner.run(&s).await.unwrap();
        assert_eq!(outcome, RunOutcome::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn timeout_covers_output_held_open_by_a_background_child() {
        let s = spec(&["sh", "-c", "sleep 30 & echo hi"], Duration::from_millis(500));
        let started = std::time::Instant::now();
        let outcome = ProcessRunner.run(&s).await.unwrap();
        assert_eq!(outcome, RunOutcome::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn empty_argv_is_rejected() {
        let err = ProcessRunner
            .run(&spec(&[], Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
