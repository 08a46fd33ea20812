//! Capture session orchestration
//!
//! Composes the runner, normalizer, classifier and synthesizer for one
//! test run, and owns the active-run registry that enforces at most one
//! live process per target label. Sessions move through an explicit state
//! machine so timeout/cancel races stay reproducible:
//!
//! `Running -> {Completed | TimedOut | Cancelled | SpawnFailed} -> Finalized`

use crate::classify::{FailureKind, FailureRecord, ResultClassifier, TestResult};
use crate::config::Config;
use crate::normalize::OutputNormalizer;
use crate::report::{DiagnosticReport, ReportContext, ReportSynthesizer};
use crate::runner::{
    OutputStream, ProcessRunner, RawCapture, RunEvent, RunStatus, TestRunRequest,
};
use anyhow::{Context, Result};
use chrono::Utc;
use futures::FutureExt;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

/// Longest in-flight line retained for progress scanning.
const MAX_LINE_CARRY: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SessionId(Uuid);

impl SessionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Running,
    Completed,
    TimedOut,
    Cancelled,
    SpawnFailed,
    Finalized,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionState::Running)
    }
}

/// Live feedback while a run is in flight: counts of recognized per-test
/// and per-file markers seen so far in the normalized stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunProgress {
    pub tests_seen: u32,
    pub files_seen: u32,
}

/// The two artifacts a finalized session yields.
#[derive(Debug, Clone, Serialize)]
pub struct SessionOutcome {
    pub result: TestResult,
    pub report: DiagnosticReport,
}

struct SessionData {
    state: SessionState,
    progress: RunProgress,
    buffer: String,
    line_carry: String,
    capture: Option<RawCapture>,
    /// Set when the session never got a process or its pipeline died.
    fault: Option<String>,
}

struct SessionEntry {
    target: String,
    request: TestRunRequest,
    data: Arc<Mutex<SessionData>>,
    cancel_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<SessionState>,
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<SessionId, SessionEntry>,
    by_target: HashMap<String, SessionId>,
}

/// Line-based scanner for live progress markers.
struct ProgressScanner {
    test_marker: Regex,
    file_marker: Regex,
}

impl ProgressScanner {
    fn new() -> Self {
        Self {
            test_marker: Regex::new(
                r"(?:^\s*[✓✔✕✗×]\s|^test .* \.\.\. (?:ok|FAILED|ignored)|^--- (?:PASS|FAIL|SKIP): |(?:PASSED|FAILED|ERROR|SKIPPED)(?:\s+\[\s*\d+%\])?$)",
            )
            .expect("test marker pattern"),
            file_marker: Regex::new(r"^(?:PASS|FAIL)\s+\S").expect("file marker pattern"),
        }
    }

    fn scan(&self, line: &str, progress: &mut RunProgress) {
        if self.file_marker.is_match(line) {
            progress.files_seen += 1;
        } else if self.test_marker.is_match(line) {
            progress.tests_seen += 1;
        }
    }
}

/// Registry-owning orchestrator. All process handles are reachable only
/// through here; `shutdown` sweeps every live entry.
pub struct CaptureSessions {
    runner: ProcessRunner,
    classifier: ResultClassifier,
    synthesizer: ReportSynthesizer,
    scanner: Arc<ProgressScanner>,
    buffer_cap: usize,
    excerpt_lines: usize,
    registry: Mutex<Registry>,
}

impl CaptureSessions {
    pub fn new(config: &Config) -> Self {
        Self {
            runner: ProcessRunner::new(Duration::from_secs(config.kill_grace_secs)),
            classifier: ResultClassifier::new(),
            synthesizer: ReportSynthesizer::new(config.slow_test_threshold_ms),
            scanner: Arc::new(ProgressScanner::new()),
            buffer_cap: config.capture_buffer_bytes,
            excerpt_lines: config.report_excerpt_lines,
            registry: Mutex::new(Registry::default()),
        }
    }

    /// Start a capture run. If a run is already active for the same
    /// target it is cancelled and awaited first, so the one-run-per-target
    /// invariant holds even under races. The preempted session stays
    /// queryable until its own `end`.
    pub async fn begin(&self, request: TestRunRequest) -> SessionId {
        self.preempt(&request.target).await;

        let id = SessionId::new();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(SessionState::Running);
        let data = Arc::new(Mutex::new(SessionData {
            state: SessionState::Running,
            progress: RunProgress::default(),
            buffer: String::new(),
            line_carry: String::new(),
            capture: None,
            fault: None,
        }));

        match self.runner.launch(&request) {
            Ok(running) => {
                let state_tx = Arc::new(state_tx);
                let pipeline = Pipeline {
                    data: data.clone(),
                    state_tx: state_tx.clone(),
                    scanner: self.scanner.clone(),
                    buffer_cap: self.buffer_cap,
                    started_at: running.started_at,
                };
                let crash_data = data.clone();
                tokio::spawn(async move {
                    let fut = pipeline.run(running, cancel_rx);
                    if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
                        // Never leave a session wedged in Running.
                        let detail = panic_message(panic);
                        warn!(%detail, "capture pipeline crashed");
                        let mut d = crash_data.lock().await;
                        if !d.state.is_terminal() {
                            d.state = SessionState::Completed;
                            d.fault = Some(format!("capture pipeline crashed: {}", detail));
                            let _ = state_tx.send(SessionState::Completed);
                        }
                    }
                });
            }
            Err(err) => {
                let mut d = data.lock().await;
                d.state = SessionState::SpawnFailed;
                d.fault = Some(format!("{:#}", err));
                let _ = state_tx.send(SessionState::SpawnFailed);
            }
        }

        let mut registry = self.registry.lock().await;
        registry.by_target.insert(request.target.clone(), id);
        registry.sessions.insert(
            id,
            SessionEntry {
                target: request.target.clone(),
                request,
                data,
                cancel_tx,
                state_rx,
            },
        );
        id
    }

    /// Cancel the active run for a session. Cooperative: the terminal
    /// state arrives once the process is actually down.
    pub async fn cancel(&self, id: SessionId) {
        let registry = self.registry.lock().await;
        if let Some(entry) = registry.sessions.get(&id) {
            let _ = entry.cancel_tx.send(true);
        }
    }

    pub async fn state(&self, id: SessionId) -> Option<SessionState> {
        let registry = self.registry.lock().await;
        let entry = registry.sessions.get(&id)?;
        let state = entry.data.lock().await.state;
        Some(state)
    }

    pub async fn progress(&self, id: SessionId) -> Option<RunProgress> {
        let registry = self.registry.lock().await;
        let entry = registry.sessions.get(&id)?;
        let progress = entry.data.lock().await.progress;
        Some(progress)
    }

    /// Wait for the run to reach a terminal state, classify the frozen
    /// capture exactly once, and synthesize the report. Finalization
    /// consumes the session; a second `end` for the same id is an error.
    pub async fn end(&self, id: SessionId) -> Result<SessionOutcome> {
        let mut state_rx = {
            let registry = self.registry.lock().await;
            let entry = registry.sessions.get(&id).context("unknown session")?;
            entry.state_rx.clone()
        };
        state_rx
            .wait_for(|s| s.is_terminal())
            .await
            .context("session pipeline dropped before reaching a terminal state")?;

        let entry = {
            let mut registry = self.registry.lock().await;
            let entry = registry.sessions.remove(&id).context("unknown session")?;
            if registry.by_target.get(&entry.target) == Some(&id) {
                registry.by_target.remove(&entry.target);
            }
            entry
        };

        let mut data = entry.data.lock().await;
        let result = self.classify_terminal(&entry, &data);
        let report = self.synthesizer.synthesize(
            &result,
            &ReportContext {
                command: entry.request.command_label(),
                target: entry.target.clone(),
                raw_excerpt: Some(tail_lines(&result.output, self.excerpt_lines)),
            },
        );
        data.state = SessionState::Finalized;
        debug!(session = %id, label = %entry.target, success = result.success, "session finalized");
        Ok(SessionOutcome { result, report })
    }

    /// Cancel and await every live session. Called on shutdown so no
    /// tracked process outlives the registry.
    pub async fn shutdown(&self) {
        let entries: Vec<(SessionId, watch::Receiver<SessionState>)> = {
            let registry = self.registry.lock().await;
            registry
                .sessions
                .iter()
                .map(|(id, entry)| {
                    let _ = entry.cancel_tx.send(true);
                    (*id, entry.state_rx.clone())
                })
                .collect()
        };
        for (id, mut state_rx) in entries {
            if state_rx.wait_for(|s| s.is_terminal()).await.is_err() {
                warn!(session = %id, "session pipeline vanished during shutdown");
            }
        }
        let mut registry = self.registry.lock().await;
        registry.sessions.clear();
        registry.by_target.clear();
    }

    async fn preempt(&self, target: &str) {
        let prior = {
            let registry = self.registry.lock().await;
            let Some(id) = registry.by_target.get(target) else {
                return;
            };
            let entry = match registry.sessions.get(id) {
                Some(entry) => entry,
                None => return,
            };
            let _ = entry.cancel_tx.send(true);
            entry.state_rx.clone()
        };
        let mut state_rx = prior;
        if state_rx.wait_for(|s| s.is_terminal()).await.is_err() {
            warn!(label = %target, "preempted session pipeline vanished");
        }
        debug!(label = %target, "prior run preempted");
    }

    fn classify_terminal(&self, entry: &SessionEntry, data: &SessionData) -> TestResult {
        let target = &entry.target;
        match data.state {
            SessionState::SpawnFailed => self.classifier.spawn_failure(
                target,
                &entry.request.command_label(),
                data.fault.as_deref().unwrap_or("unknown spawn error"),
            ),
            state => {
                let capture = data.capture.clone().unwrap_or_else(|| RawCapture {
                    text: data.buffer.clone(),
                    exit_code: None,
                    started_at: Utc::now(),
                    finished_at: Utc::now(),
                    duration: Duration::ZERO,
                });
                let mut result = match state {
                    SessionState::TimedOut => self.classifier.classify_timeout(
                        target,
                        &capture.text,
                        capture.duration,
                        entry.request.timeout,
                    ),
                    SessionState::Cancelled => {
                        self.classifier
                            .classify_cancelled(target, &capture.text, capture.duration)
                    }
                    _ => self.classifier.classify(
                        target,
                        &capture.text,
                        capture.exit_code,
                        capture.duration,
                    ),
                };
                if let Some(fault) = &data.fault {
                    result.success = false;
                    result.failures.insert(
                        0,
                        FailureRecord::info(FailureKind::RuntimeError, fault.clone()),
                    );
                }
                result
            }
        }
    }
}

/// The per-session background task: normalizes chunks as they arrive,
/// tracks progress, and freezes the capture at the terminal event.
struct Pipeline {
    data: Arc<Mutex<SessionData>>,
    state_tx: Arc<watch::Sender<SessionState>>,
    scanner: Arc<ProgressScanner>,
    buffer_cap: usize,
    started_at: chrono::DateTime<Utc>,
}

impl Pipeline {
    async fn run(self, running: crate::runner::RunningTest, cancel_rx: watch::Receiver<bool>) {
        let (events_tx, mut events_rx) = mpsc::channel::<RunEvent>(64);
        let supervisor = tokio::spawn(running.supervise(cancel_rx, events_tx));

        let mut stdout_norm = OutputNormalizer::new();
        let mut stderr_norm = OutputNormalizer::new();

        while let Some(event) = events_rx.recv().await {
            match event {
                RunEvent::Chunk(stream, raw) => {
                    let cleaned = match stream {
                        OutputStream::Stdout => stdout_norm.feed(&raw),
                        OutputStream::Stderr => stderr_norm.feed(&raw),
                    };
                    if cleaned.is_empty() {
                        continue;
                    }
                    let mut d = self.data.lock().await;
                    self.append(&mut d, &cleaned);
                }
                RunEvent::Finished { status, duration } => {
                    let mut tail = stdout_norm.flush();
                    tail.push_str(&stderr_norm.flush());
                    let mut d = self.data.lock().await;
                    if !tail.is_empty() {
                        self.append(&mut d, &tail);
                    }
                    // Count the final unterminated line, if any.
                    if !d.line_carry.is_empty() {
                        let carry = std::mem::take(&mut d.line_carry);
                        self.scanner.scan(&carry, &mut d.progress);
                    }
                    let state = match status {
                        RunStatus::Completed(_) => SessionState::Completed,
                        RunStatus::TimedOut => SessionState::TimedOut,
                        RunStatus::Cancelled => SessionState::Cancelled,
                    };
                    let exit_code = match status {
                        RunStatus::Completed(code) => code,
                        _ => None,
                    };
                    d.capture = Some(RawCapture {
                        text: d.buffer.clone(),
                        exit_code,
                        started_at: self.started_at,
                        finished_at: Utc::now(),
                        duration,
                    });
                    d.state = state;
                    let _ = self.state_tx.send(state);
                }
            }
        }
        let _ = supervisor.await;
    }

    /// Append normalized text, scanning completed lines for progress
    /// markers and keeping the buffer bounded to a tail window.
    fn append(&self, d: &mut SessionData, cleaned: &str) {
        d.buffer.push_str(cleaned);
        if d.buffer.len() > self.buffer_cap * 2 {
            let keep_from = d.buffer.len() - self.buffer_cap;
            let boundary = (keep_from..d.buffer.len())
                .find(|i| d.buffer.is_char_boundary(*i))
                .unwrap_or(d.buffer.len());
            d.buffer.drain(..boundary);
        }

        d.line_carry.push_str(cleaned);
        while let Some(pos) = d.line_carry.find('\n') {
            let rest = d.line_carry.split_off(pos + 1);
            let line = std::mem::replace(&mut d.line_carry, rest);
            self.scanner
                .scan(line.trim_end_matches('\n'), &mut d.progress);
        }
        // A process that never emits newlines must not grow the carry
        // without bound; such a line holds no recognizable marker anyway.
        if d.line_carry.len() > MAX_LINE_CARRY {
            d.line_carry.clear();
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Last `max_lines` lines of `text`.
fn tail_lines(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!SessionState::Running.is_terminal());
        for state in [
            SessionState::Completed,
            SessionState::TimedOut,
            SessionState::Cancelled,
            SessionState::SpawnFailed,
            SessionState::Finalized,
        ] {
            assert!(state.is_terminal());
        }
    }

    #[test]
    fn test_progress_scanner_counts_markers() {
        let scanner = ProgressScanner::new();
        let mut progress = RunProgress::default();
        for line in [
            "PASS src/app.spec.ts",
            "  ✓ adds numbers (3 ms)",
            "  ✕ subtracts numbers (1 ms)",
            "test parser::tests::ok_case ... ok",
            "tests/test_api.py::test_auth PASSED  [ 50%]",
            "plain unrelated line",
        ] {
            scanner.scan(line, &mut progress);
        }
        assert_eq!(progress.files_seen, 1);
        assert_eq!(progress.tests_seen, 4);
    }

    #[test]
    fn test_tail_lines_bounds_output() {
        let text = "a\nb\nc\nd\n";
        assert_eq!(tail_lines(text, 2), "c\nd");
        assert_eq!(tail_lines(text, 10), "a\nb\nc\nd");
    }
}
