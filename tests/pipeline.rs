//! End-to-end pipeline tests against real processes.
//!
//! Each test drives a capture session through `/bin/sh` fixtures and
//! asserts on the terminal state, the classified result, and the report.

#![cfg(unix)]

use std::time::Duration;
use verdict::classify::FailureKind;
use verdict::config::Config;
use verdict::runner::TestRunRequest;
use verdict::session::{CaptureSessions, SessionState};

fn sessions() -> CaptureSessions {
    CaptureSessions::new(&Config::default())
}

fn sh(target: &str, dir: &std::path::Path, script: &str) -> TestRunRequest {
    TestRunRequest::new(target, "/bin/sh", dir)
        .arg("-c")
        .arg(script)
}

#[tokio::test]
async fn passing_run_produces_passing_report() {
    let dir = tempfile::tempdir().unwrap();
    let sessions = sessions();
    let request = sh(
        "app",
        dir.path(),
        "printf 'PASS src/app.spec.ts\\nTests: 5 passed, 0 failed, 5 total\\nTime: 0.4 s\\n'",
    );

    let id = sessions.begin(request).await;
    let outcome = sessions.end(id).await.unwrap();

    assert!(outcome.result.success);
    assert_eq!(outcome.result.exit_code, Some(0));
    assert_eq!(outcome.result.statistics.tests_passed, Some(5));
    assert!(outcome.report.section("failure-analysis").is_none());
    assert!(outcome.report.to_text().contains("RESULT: PASS"));
}

#[tokio::test]
async fn ansi_colored_failure_is_normalized_and_classified() {
    let dir = tempfile::tempdir().unwrap();
    let sessions = sessions();
    // Red FAIL banner plus a summary, as jest paints them.
    let request = sh(
        "app",
        dir.path(),
        "printf '\\033[31mFAIL\\033[0m src/app.spec.ts\\nTests: 1 failed, 1 total\\n'; exit 1",
    );

    let id = sessions.begin(request).await;
    let outcome = sessions.end(id).await.unwrap();

    assert!(!outcome.result.success);
    assert!(outcome.result.output.contains("FAIL src/app.spec.ts"));
    assert!(!outcome.result.output.contains('\u{1b}'));
}

#[tokio::test]
async fn nonzero_exit_with_clean_counters_still_fails() {
    let dir = tempfile::tempdir().unwrap();
    let sessions = sessions();
    let request = sh(
        "app",
        dir.path(),
        "printf 'Tests: 5 passed, 0 failed, 5 total\\n'; exit 1",
    );

    let id = sessions.begin(request).await;
    let outcome = sessions.end(id).await.unwrap();
    assert!(!outcome.result.success);
    assert_eq!(outcome.result.exit_code, Some(1));
}

#[tokio::test]
async fn timed_out_run_preserves_partial_output() {
    let dir = tempfile::tempdir().unwrap();
    let sessions = sessions();
    let request = sh("app", dir.path(), "echo partial; sleep 30")
        .timeout(Duration::from_millis(400));

    let id = sessions.begin(request).await;
    let outcome = sessions.end(id).await.unwrap();

    assert!(!outcome.result.success);
    assert_eq!(outcome.result.failures[0].kind, FailureKind::TimeoutError);
    assert!(outcome.result.output.contains("partial"));
    assert!(outcome
        .report
        .section("guidance")
        .unwrap()
        .contains("time limit"));
}

#[tokio::test]
async fn cancelled_run_reaches_cancelled_state_with_output() {
    let dir = tempfile::tempdir().unwrap();
    let sessions = sessions();
    let request = sh("app", dir.path(), "echo started; sleep 30");

    let id = sessions.begin(request).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    sessions.cancel(id).await;
    let outcome = sessions.end(id).await.unwrap();

    assert!(!outcome.result.success);
    assert!(outcome.result.output.contains("started"));
}

#[tokio::test]
async fn second_run_for_same_target_preempts_the_first() {
    let dir = tempfile::tempdir().unwrap();
    let sessions = sessions();

    let first = sessions
        .begin(sh("app-a", dir.path(), "echo first; sleep 30"))
        .await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(sessions.state(first).await, Some(SessionState::Running));

    let second = sessions
        .begin(sh("app-a", dir.path(), "echo second; exit 0"))
        .await;

    // The first run was cancelled before the second started.
    assert_eq!(sessions.state(first).await, Some(SessionState::Cancelled));

    let first_outcome = sessions.end(first).await.unwrap();
    assert!(!first_outcome.result.success);
    assert!(first_outcome.result.output.contains("first"));

    let second_outcome = sessions.end(second).await.unwrap();
    assert!(second_outcome.result.success);
}

#[tokio::test]
async fn spawn_failure_yields_spawn_error_result() {
    let dir = tempfile::tempdir().unwrap();
    let sessions = sessions();
    let request = TestRunRequest::new("app", "definitely-not-a-real-binary", dir.path());

    let id = sessions.begin(request).await;
    assert_eq!(sessions.state(id).await, Some(SessionState::SpawnFailed));

    let outcome = sessions.end(id).await.unwrap();
    assert!(!outcome.result.success);
    assert_eq!(outcome.result.failures.len(), 1);
    assert_eq!(outcome.result.failures[0].kind, FailureKind::SpawnError);
    assert!(outcome
        .report
        .section("guidance")
        .unwrap()
        .contains("never started"));
}

#[tokio::test]
async fn exit_never_outruns_buffered_output() {
    let dir = tempfile::tempdir().unwrap();
    let sessions = sessions();
    // A burst of output immediately before exit must all be captured.
    let request = sh(
        "app",
        dir.path(),
        "i=0; while [ $i -lt 200 ]; do echo line-$i; i=$((i+1)); done",
    );

    let id = sessions.begin(request).await;
    let outcome = sessions.end(id).await.unwrap();
    assert!(outcome.result.output.contains("line-0\n"));
    assert!(outcome.result.output.contains("line-199"));
}

#[tokio::test]
async fn progress_counts_markers_while_running() {
    let dir = tempfile::tempdir().unwrap();
    let sessions = sessions();
    let request = sh(
        "app",
        dir.path(),
        "printf 'PASS a.spec.ts\\n'; printf '  \\342\\234\\223 one (2 ms)\\n'; sleep 30",
    );

    let id = sessions.begin(request).await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    let progress = sessions.progress(id).await.unwrap();
    assert_eq!(progress.files_seen, 1);
    assert_eq!(progress.tests_seen, 1);

    sessions.cancel(id).await;
    let _ = sessions.end(id).await.unwrap();
}

#[tokio::test]
async fn ending_a_session_twice_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let sessions = sessions();
    let id = sessions.begin(sh("app", dir.path(), "true")).await;
    let _ = sessions.end(id).await.unwrap();
    assert!(sessions.end(id).await.is_err());
}

#[tokio::test]
async fn shutdown_sweeps_every_live_session() {
    let dir = tempfile::tempdir().unwrap();
    let sessions = sessions();
    let a = sessions.begin(sh("app-a", dir.path(), "sleep 30")).await;
    let b = sessions.begin(sh("app-b", dir.path(), "sleep 30")).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    sessions.shutdown().await;

    // Registry is swept; the sessions are gone.
    assert_eq!(sessions.state(a).await, None);
    assert_eq!(sessions.state(b).await, None);
}
