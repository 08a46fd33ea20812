//! Process execution for test runs
//!
//! Spawns one external test-runner process per request and supervises it:
//! streamed stdout/stderr capture, a hard timeout, and cooperative
//! cancellation. Termination is escalated gently — SIGTERM to the process
//! group, a grace window, then SIGKILL — so runners get a chance to flush
//! their summaries. Spawn failures surface before any process starts.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// One test invocation. The target label doubles as the concurrency key:
/// at most one run may be active per target.
#[derive(Debug, Clone)]
pub struct TestRunRequest {
    pub target: String,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub timeout: Duration,
    pub env: Vec<(String, String)>,
}

impl TestRunRequest {
    pub fn new(
        target: impl Into<String>,
        program: impl Into<String>,
        cwd: impl AsRef<Path>,
    ) -> Self {
        Self {
            target: target.into(),
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.as_ref().to_path_buf(),
            timeout: Duration::from_secs(600),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Display form of the full command line.
    pub fn command_label(&self) -> String {
        let mut label = self.program.clone();
        for arg in &self.args {
            label.push(' ');
            label.push_str(arg);
        }
        label
    }
}

/// How a supervised run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Process exited on its own; `None` means killed by a signal.
    Completed(Option<i32>),
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Events emitted while a run is supervised. `Finished` is always the
/// last event, and is never sent before every captured chunk has been
/// delivered.
#[derive(Debug)]
pub enum RunEvent {
    Chunk(OutputStream, String),
    Finished { status: RunStatus, duration: Duration },
}

/// Accumulated capture of one run, frozen at process exit.
#[derive(Debug, Clone)]
pub struct RawCapture {
    pub text: String,
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration: Duration,
}

/// Spawns test processes. Holds only policy (the kill grace window);
/// process handles live in the per-run [`RunningTest`].
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    grace: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(2),
        }
    }
}

impl ProcessRunner {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    /// Spawn the process for `request`. Errors here mean no process was
    /// ever started (bad executable, missing working directory).
    pub fn launch(&self, request: &TestRunRequest) -> Result<RunningTest> {
        if !request.cwd.is_dir() {
            anyhow::bail!(
                "working directory '{}' does not exist",
                request.cwd.display()
            );
        }

        let mut cmd = Command::new(&request.program);
        cmd.current_dir(&request.cwd)
            .args(&request.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &request.env {
            cmd.env(key, value);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to start '{}'", request.command_label()))?;
        let stdout = child.stdout.take().context("stdout pipe missing")?;
        let stderr = child.stderr.take().context("stderr pipe missing")?;

        debug!(label = %request.target, command = %request.command_label(), "test process started");

        Ok(RunningTest {
            child,
            stdout,
            stderr,
            timeout: request.timeout,
            grace: self.grace,
            started_at: Utc::now(),
            started: Instant::now(),
            target: request.target.clone(),
        })
    }
}

/// A launched process plus its supervision parameters.
pub struct RunningTest {
    child: Child,
    stdout: tokio::process::ChildStdout,
    stderr: tokio::process::ChildStderr,
    timeout: Duration,
    grace: Duration,
    pub started_at: DateTime<Utc>,
    started: Instant,
    target: String,
}

impl RunningTest {
    /// Drive the process to a terminal state, forwarding output chunks to
    /// `events`. All buffered chunks are delivered before `Finished`, so
    /// consumers see the complete capture by the time the status arrives.
    pub async fn supervise(
        mut self,
        mut cancel: watch::Receiver<bool>,
        events: mpsc::Sender<RunEvent>,
    ) -> RunStatus {
        let out_pump = tokio::spawn(pump(self.stdout, OutputStream::Stdout, events.clone()));
        let err_pump = tokio::spawn(pump(self.stderr, OutputStream::Stderr, events.clone()));

        let timeout = tokio::time::sleep(self.timeout);
        tokio::pin!(timeout);

        let mut cancel_closed = false;
        let status = loop {
            tokio::select! {
                exit = self.child.wait() => {
                    let code = exit.ok().and_then(|status| status.code());
                    debug!(label = %self.target, code = ?code, "test process exited");
                    break RunStatus::Completed(code);
                }
                _ = &mut timeout => {
                    warn!(label = %self.target, timeout_secs = self.timeout.as_secs(), "test run timed out, terminating");
                    graceful_kill(&mut self.child, self.grace).await;
                    break RunStatus::TimedOut;
                }
                changed = cancel.changed(), if !cancel_closed => {
                    match changed {
                        Ok(()) if *cancel.borrow() => {
                            debug!(label = %self.target, "test run cancelled, terminating");
                            graceful_kill(&mut self.child, self.grace).await;
                            break RunStatus::Cancelled;
                        }
                        Ok(()) => {}
                        Err(_) => cancel_closed = true,
                    }
                }
            }
        };

        // Drain both pumps so every chunk lands before the final event.
        let _ = out_pump.await;
        let _ = err_pump.await;

        let _ = events
            .send(RunEvent::Finished {
                status,
                duration: self.started.elapsed(),
            })
            .await;
        status
    }
}

/// Read a stream in chunks and forward them. Incomplete trailing UTF-8
/// bytes are carried into the next read so multi-byte characters never
/// split into replacement glyphs.
async fn pump<R>(mut reader: R, stream: OutputStream, events: mpsc::Sender<RunEvent>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = [0u8; 8192];
    let mut carry: Vec<u8> = Vec::new();
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        carry.extend_from_slice(&buf[..n]);
        let boundary = utf8_boundary(&carry);
        if boundary == 0 {
            continue;
        }
        let chunk = String::from_utf8_lossy(&carry[..boundary]).into_owned();
        carry.drain(..boundary);
        if events.send(RunEvent::Chunk(stream, chunk)).await.is_err() {
            return;
        }
    }
    if !carry.is_empty() {
        let chunk = String::from_utf8_lossy(&carry).into_owned();
        let _ = events.send(RunEvent::Chunk(stream, chunk)).await;
    }
}

/// Largest prefix of `bytes` that ends on a UTF-8 character boundary.
fn utf8_boundary(bytes: &[u8]) -> usize {
    let mut end = bytes.len();
    for _ in 0..3 {
        if end == 0 || bytes[end - 1] < 0x80 {
            return end;
        }
        if bytes[end - 1] >= 0xc0 {
            // Start byte of an incomplete character: hold it back unless
            // the sequence it begins is fully present.
            let needed = match bytes[end - 1] {
                0xc0..=0xdf => 2,
                0xe0..=0xef => 3,
                _ => 4,
            };
            if bytes.len() - (end - 1) >= needed {
                return bytes.len();
            }
            return end - 1;
        }
        end -= 1;
    }
    bytes.len()
}

/// Terminate a child gently: SIGTERM to its process group, a grace
/// window, then SIGKILL. Non-unix platforms fall back to immediate kill.
#[cfg(unix)]
async fn graceful_kill(child: &mut Child, grace: Duration) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        let _ = child.kill().await;
        return;
    };
    let pgid = Pid::from_raw(pid as i32);
    let _ = killpg(pgid, Signal::SIGTERM);

    tokio::select! {
        _ = tokio::time::sleep(grace) => {
            warn!(pid, "process ignored SIGTERM, sending SIGKILL");
            let _ = killpg(pgid, Signal::SIGKILL);
            let _ = child.wait().await;
        }
        _ = child.wait() => {}
    }
}

#[cfg(not(unix))]
async fn graceful_kill(child: &mut Child, _grace: Duration) {
    let _ = child.kill().await;
}
