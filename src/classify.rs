//! Test-run classification
//!
//! Turns normalized runner output plus an exit code into a structured
//! [`TestResult`]. Parsing is tolerant by construction: counters that
//! cannot be located stay unknown instead of being zero-guessed, malformed
//! output never panics, and the exit code always outranks whatever the
//! summary lines claim. Runner dialects (jest/vitest, mocha, cargo,
//! pytest, go test) are covered by pattern tables; supporting another
//! dialect means extending a table, not branching the algorithm.

use regex::Regex;
use serde::Serialize;
use std::time::Duration;

/// What went wrong, per failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureKind {
    CompilationError,
    RuntimeError,
    AssertionFailure,
    SuiteSetupFailure,
    TimeoutError,
    SpawnError,
}

impl FailureKind {
    pub fn label(&self) -> &'static str {
        match self {
            FailureKind::CompilationError => "compilation error",
            FailureKind::RuntimeError => "runtime error",
            FailureKind::AssertionFailure => "assertion failure",
            FailureKind::SuiteSetupFailure => "suite setup failure",
            FailureKind::TimeoutError => "timeout",
            FailureKind::SpawnError => "spawn failure",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    pub kind: FailureKind,
    pub test_name: Option<String>,
    pub suite_name: Option<String>,
    pub message: String,
    pub source_location: Option<SourceLocation>,
}

impl FailureRecord {
    /// A failure with no associated test, e.g. a timeout or spawn error.
    pub fn info(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            test_name: None,
            suite_name: None,
            message: message.into(),
            source_location: None,
        }
    }

    /// An individual failing test, as opposed to a build/setup-level
    /// failure of the whole run.
    pub fn is_per_test(&self) -> bool {
        match self.kind {
            FailureKind::AssertionFailure => true,
            FailureKind::RuntimeError => self.test_name.is_some(),
            _ => false,
        }
    }
}

/// Summary counters. `None` means the output never stated the number;
/// downstream consumers must represent that honestly, not as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TestStatistics {
    pub suites_passed: Option<u32>,
    pub suites_failed: Option<u32>,
    pub suites_total: Option<u32>,
    pub tests_passed: Option<u32>,
    pub tests_failed: Option<u32>,
    pub tests_skipped: Option<u32>,
    pub tests_total: Option<u32>,
    pub elapsed_seconds: Option<f64>,
}

impl TestStatistics {
    pub fn is_unknown(&self) -> bool {
        *self == Self::default()
    }
}

/// Per-test wall time, when the dialect reports one.
#[derive(Debug, Clone, Serialize)]
pub struct TestTiming {
    pub name: String,
    pub duration_ms: u64,
}

/// The structured outcome of one test run. Immutable once created.
#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    pub target: String,
    pub success: bool,
    pub statistics: TestStatistics,
    pub failures: Vec<FailureRecord>,
    pub timings: Vec<TestTiming>,
    pub output: String,
    pub exit_code: Option<i32>,
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy)]
enum CounterField {
    SuitesPassed,
    SuitesFailed,
    SuitesTotal,
    TestsPassed,
    TestsFailed,
    TestsSkipped,
    TestsTotal,
    Elapsed,
}

/// One recognized counter phrasing: `pattern`'s first capture group is the
/// number, `scope` (if set) must appear somewhere in the line first.
struct CounterRule {
    scope: Option<&'static str>,
    pattern: Regex,
    field: CounterField,
}

struct CollapseRule {
    pattern: Regex,
    kind: FailureKind,
}

#[derive(Debug, Clone, Copy)]
enum MarkerStyle {
    /// `● Suite › test` header followed by an indented detail block.
    JestHeader,
    /// `--- FAIL: TestName` followed by indented detail.
    GoFail,
    /// `FAILED path::test - message`, self-contained on one line.
    PytestLine,
    /// `---- name stdout ----` block from the rust test harness.
    CargoBlock,
}

struct FailureStart {
    pattern: Regex,
    style: MarkerStyle,
}

struct TimingRule {
    pattern: Regex,
    /// Multiplier from the captured number to milliseconds.
    to_ms: f64,
}

/// Tolerant classifier over normalized runner output. Construct once and
/// reuse; `classify` is pure and infallible.
pub struct ResultClassifier {
    counters: Vec<CounterRule>,
    collapse: Vec<CollapseRule>,
    failure_starts: Vec<FailureStart>,
    timings: Vec<TimingRule>,
    block_end: Regex,
    stack_line: Regex,
    location: Regex,
    suite_file: Regex,
}

impl Default for ResultClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultClassifier {
    pub fn new() -> Self {
        let rule = |scope, pattern: &str, field| CounterRule {
            scope,
            pattern: Regex::new(pattern).expect("counter pattern"),
            field,
        };
        let collapse = |pattern: &str, kind| CollapseRule {
            pattern: Regex::new(pattern).expect("collapse pattern"),
            kind,
        };
        let start = |pattern: &str, style| FailureStart {
            pattern: Regex::new(pattern).expect("failure pattern"),
            style,
        };

        Self {
            counters: vec![
                // jest / vitest summary lines
                rule(Some("Test Suites:"), r"(\d+) passed", CounterField::SuitesPassed),
                rule(Some("Test Suites:"), r"(\d+) failed", CounterField::SuitesFailed),
                rule(Some("Test Suites:"), r"(\d+) total", CounterField::SuitesTotal),
                rule(Some("Tests:"), r"(\d+) passed", CounterField::TestsPassed),
                rule(Some("Tests:"), r"(\d+) failed", CounterField::TestsFailed),
                rule(
                    Some("Tests:"),
                    r"(\d+) (?:skipped|pending|todo)",
                    CounterField::TestsSkipped,
                ),
                rule(Some("Tests:"), r"(\d+) total", CounterField::TestsTotal),
                rule(None, r"^Time:\s+([0-9.]+)", CounterField::Elapsed),
                // mocha
                rule(None, r"^\s*(\d+) passing\b", CounterField::TestsPassed),
                rule(None, r"^\s*(\d+) failing\b", CounterField::TestsFailed),
                rule(None, r"^\s*(\d+) pending\b", CounterField::TestsSkipped),
                // rust test harness
                rule(Some("test result:"), r"(\d+) passed;", CounterField::TestsPassed),
                rule(Some("test result:"), r"(\d+) failed;", CounterField::TestsFailed),
                rule(Some("test result:"), r"(\d+) ignored;", CounterField::TestsSkipped),
                rule(
                    Some("test result:"),
                    r"finished in ([0-9.]+)s",
                    CounterField::Elapsed,
                ),
                // pytest final banner: ==== 3 passed, 1 failed in 0.12s ====
                rule(Some("=="), r"(\d+) passed", CounterField::TestsPassed),
                rule(Some("=="), r"(\d+) failed", CounterField::TestsFailed),
                rule(Some("=="), r"(\d+) skipped", CounterField::TestsSkipped),
                rule(Some("=="), r"\bin ([0-9.]+)s", CounterField::Elapsed),
            ],
            collapse: vec![
                collapse(r"Test suite failed to run", FailureKind::SuiteSetupFailure),
                collapse(
                    r"must contain at least one test",
                    FailureKind::SuiteSetupFailure,
                ),
                collapse(r"Cannot find module", FailureKind::SuiteSetupFailure),
                collapse(r"Module not found", FailureKind::SuiteSetupFailure),
                collapse(r"SyntaxError:", FailureKind::CompilationError),
                collapse(r"error\[E\d+\]", FailureKind::CompilationError),
                collapse(r"error: could not compile", FailureKind::CompilationError),
            ],
            failure_starts: vec![
                start(r"^\s*●\s+(.+?)\s*$", MarkerStyle::JestHeader),
                start(r"^--- FAIL: (\S+)", MarkerStyle::GoFail),
                start(r"^FAILED\s+(\S+)(?:\s+-\s+(.*))?$", MarkerStyle::PytestLine),
                start(
                    r"^---- (\S+) (?:stdout|stderr) ----$",
                    MarkerStyle::CargoBlock,
                ),
            ],
            timings: vec![
                TimingRule {
                    pattern: Regex::new(r"^\s*[✓✔✕✗×]\s+(.+?)\s+\((\d+)\s*ms\)\s*$")
                        .expect("timing pattern"),
                    to_ms: 1.0,
                },
                TimingRule {
                    pattern: Regex::new(r"^--- (?:PASS|FAIL): (\S+) \(([0-9.]+)s\)")
                        .expect("timing pattern"),
                    to_ms: 1000.0,
                },
            ],
            block_end: Regex::new(
                r"^(?:Test Suites?:|Tests:|Snapshots:|Time:|Ran all test suites|test result:|failures:$|=+\s|ok\s|=== RUN|---- |--- |(?:PASS|FAIL)\s)",
            )
            .expect("block end pattern"),
            stack_line: Regex::new(r"^(?:\s+at\s|\s*stack backtrace:|note: run with)")
                .expect("stack pattern"),
            location: Regex::new(r"([A-Za-z0-9_@./\\-]+\.[A-Za-z][A-Za-z0-9]*):(\d+)(?::\d+)?")
                .expect("location pattern"),
            suite_file: Regex::new(r"^FAIL\s+(\S+)").expect("suite file pattern"),
        }
    }

    /// Classify a completed run. Never fails, never guesses counters.
    pub fn classify(
        &self,
        target: &str,
        output: &str,
        exit_code: Option<i32>,
        duration: Duration,
    ) -> TestResult {
        if output.trim().is_empty() {
            return self.classify_empty(target, output, exit_code, duration);
        }

        let lines: Vec<&str> = output.lines().collect();
        let mut stats = TestStatistics::default();
        let mut failures: Vec<FailureRecord> = Vec::new();
        let mut timings: Vec<TestTiming> = Vec::new();
        let mut collapse_kinds: Vec<FailureKind> = Vec::new();
        let mut current_suite: Option<String> = None;
        let mut seen: Vec<(Option<String>, Option<String>)> = Vec::new();

        let mut i = 0;
        while i < lines.len() {
            let line = lines[i];

            self.scan_counters(line, &mut stats);

            if let Some(caps) = self.suite_file.captures(line) {
                current_suite = Some(caps[1].to_string());
            }

            for t in &self.timings {
                if let Some(caps) = t.pattern.captures(line) {
                    if let Ok(n) = caps[2].parse::<f64>() {
                        timings.push(TestTiming {
                            name: caps[1].to_string(),
                            duration_ms: (n * t.to_ms) as u64,
                        });
                    }
                }
            }

            if let Some(record) = self.match_failure_start(&lines, &mut i, current_suite.as_deref())
            {
                // Collapse-marker headers describe the run, not a test.
                if let Some(kind) = self.collapse_kind(&record) {
                    if !collapse_kinds.contains(&kind) {
                        collapse_kinds.push(kind);
                        failures.push(FailureRecord { kind, ..record });
                    }
                    continue;
                }
                let key = (record.test_name.clone(), record.suite_name.clone());
                if !seen.contains(&key) {
                    seen.push(key);
                    failures.push(record);
                }
                continue;
            }

            if let Some(kind) = self.scan_collapse(line) {
                if !collapse_kinds.contains(&kind) {
                    collapse_kinds.push(kind);
                    failures.push(FailureRecord {
                        kind,
                        test_name: None,
                        suite_name: current_suite.clone(),
                        message: line.trim().to_string(),
                        source_location: None,
                    });
                }
            }

            i += 1;
        }

        let counted_failures = failures.iter().filter(|f| f.is_per_test()).count() as u32;
        let counted = stats
            .tests_failed
            .unwrap_or(0)
            .max(stats.suites_failed.unwrap_or(0))
            .max(counted_failures);

        let success = exit_code == Some(0) && collapse_kinds.is_empty() && counted == 0;

        TestResult {
            target: target.to_string(),
            success,
            statistics: stats,
            failures,
            timings,
            output: output.to_string(),
            exit_code,
            duration,
        }
    }

    /// A run that exceeded its allotted time. Partial output is still
    /// classified so whatever completed before the kill is not lost.
    pub fn classify_timeout(
        &self,
        target: &str,
        output: &str,
        duration: Duration,
        timeout: Duration,
    ) -> TestResult {
        let mut result = self.classify(target, output, None, duration);
        result.success = false;
        result.failures.insert(
            0,
            FailureRecord::info(
                FailureKind::TimeoutError,
                format!(
                    "run exceeded its {}s time limit and was terminated",
                    timeout.as_secs()
                ),
            ),
        );
        result
    }

    /// A run cancelled by the caller before completion.
    pub fn classify_cancelled(&self, target: &str, output: &str, duration: Duration) -> TestResult {
        let mut result = self.classify(target, output, None, duration);
        result.success = false;
        result.failures.insert(
            0,
            FailureRecord::info(
                FailureKind::RuntimeError,
                "run cancelled before completion; partial output preserved",
            ),
        );
        result
    }

    /// The process never started.
    pub fn spawn_failure(&self, target: &str, command: &str, error: &str) -> TestResult {
        TestResult {
            target: target.to_string(),
            success: false,
            statistics: TestStatistics::default(),
            failures: vec![FailureRecord::info(
                FailureKind::SpawnError,
                format!("failed to start '{}': {}", command, error),
            )],
            timings: Vec::new(),
            output: String::new(),
            exit_code: None,
            duration: Duration::ZERO,
        }
    }

    fn classify_empty(
        &self,
        target: &str,
        output: &str,
        exit_code: Option<i32>,
        duration: Duration,
    ) -> TestResult {
        let success = exit_code == Some(0);
        let failures = if success {
            Vec::new()
        } else {
            let detail = match exit_code {
                Some(code) => format!("process exited with code {} and produced no output", code),
                None => "process was killed and produced no output".to_string(),
            };
            vec![FailureRecord::info(FailureKind::RuntimeError, detail)]
        };
        TestResult {
            target: target.to_string(),
            success,
            statistics: TestStatistics::default(),
            failures,
            timings: Vec::new(),
            output: output.to_string(),
            exit_code,
            duration,
        }
    }

    fn scan_counters(&self, line: &str, stats: &mut TestStatistics) {
        for rule in &self.counters {
            if let Some(scope) = rule.scope {
                if !line.contains(scope) {
                    continue;
                }
            }
            let Some(caps) = rule.pattern.captures(line) else {
                continue;
            };
            // First summary wins; later restatements never overwrite.
            match rule.field {
                CounterField::Elapsed => {
                    if stats.elapsed_seconds.is_none() {
                        stats.elapsed_seconds = caps[1].parse::<f64>().ok();
                    }
                }
                field => {
                    let value = caps[1].parse::<u32>().ok();
                    let slot = match field {
                        CounterField::SuitesPassed => &mut stats.suites_passed,
                        CounterField::SuitesFailed => &mut stats.suites_failed,
                        CounterField::SuitesTotal => &mut stats.suites_total,
                        CounterField::TestsPassed => &mut stats.tests_passed,
                        CounterField::TestsFailed => &mut stats.tests_failed,
                        CounterField::TestsSkipped => &mut stats.tests_skipped,
                        CounterField::TestsTotal => &mut stats.tests_total,
                        CounterField::Elapsed => unreachable!(),
                    };
                    if slot.is_none() {
                        *slot = value;
                    }
                }
            }
        }
    }

    fn scan_collapse(&self, line: &str) -> Option<FailureKind> {
        self.collapse
            .iter()
            .find(|r| r.pattern.is_match(line))
            .map(|r| r.kind)
    }

    fn collapse_kind(&self, record: &FailureRecord) -> Option<FailureKind> {
        let header = record.test_name.as_deref().unwrap_or("");
        self.scan_collapse(header)
            .or_else(|| self.scan_collapse(record.message.lines().next().unwrap_or("")))
    }

    /// If `lines[*i]` starts a failure block, consume it and return the
    /// record; `*i` is advanced past the block.
    fn match_failure_start(
        &self,
        lines: &[&str],
        i: &mut usize,
        current_suite: Option<&str>,
    ) -> Option<FailureRecord> {
        let line = lines[*i];
        for fs in &self.failure_starts {
            let Some(caps) = fs.pattern.captures(line) else {
                continue;
            };
            let record = match fs.style {
                MarkerStyle::JestHeader => {
                    let header = caps[1].to_string();
                    let (suite, test) = split_jest_header(&header);
                    let (body, end) = self.take_block(lines, *i + 1);
                    *i = end;
                    let (message, location) = self.digest_block(&body);
                    FailureRecord {
                        kind: refine_kind(&message),
                        test_name: Some(test),
                        suite_name: suite.or_else(|| current_suite.map(str::to_string)),
                        message,
                        source_location: location,
                    }
                }
                MarkerStyle::GoFail => {
                    let test = caps[1].to_string();
                    let (body, end) = self.take_block(lines, *i + 1);
                    *i = end;
                    let (message, location) = self.digest_block(&body);
                    FailureRecord {
                        kind: FailureKind::AssertionFailure,
                        test_name: Some(test),
                        suite_name: None,
                        message,
                        source_location: location,
                    }
                }
                MarkerStyle::PytestLine => {
                    let path = caps[1].to_string();
                    let message = caps
                        .get(2)
                        .map(|m| m.as_str().to_string())
                        .unwrap_or_default();
                    let (suite, test) = match path.split_once("::") {
                        Some((file, test)) => (Some(file.to_string()), test.to_string()),
                        None => (None, path),
                    };
                    *i += 1;
                    FailureRecord {
                        kind: refine_kind(&message),
                        test_name: Some(test),
                        suite_name: suite,
                        message,
                        source_location: None,
                    }
                }
                MarkerStyle::CargoBlock => {
                    let test = caps[1].to_string();
                    let (body, end) = self.take_block(lines, *i + 1);
                    *i = end;
                    let (message, location) = self.digest_block(&body);
                    FailureRecord {
                        kind: FailureKind::AssertionFailure,
                        test_name: Some(test),
                        suite_name: None,
                        message,
                        source_location: location,
                    }
                }
            };
            return Some(record);
        }
        None
    }

    /// Collect body lines from `start` until the next recognized marker or
    /// summary boundary. Returns the body and the index of the boundary.
    fn take_block<'a>(&self, lines: &[&'a str], start: usize) -> (Vec<&'a str>, usize) {
        let mut end = start;
        while end < lines.len() {
            let line = lines[end];
            if self.block_end.is_match(line)
                || self.failure_starts.iter().any(|f| f.pattern.is_match(line))
            {
                break;
            }
            end += 1;
        }
        (lines[start..end].to_vec(), end)
    }

    /// Reduce a failure block to its message (everything before the first
    /// pure-stack-trace line, trailing noise trimmed) and best location.
    fn digest_block(&self, body: &[&str]) -> (String, Option<SourceLocation>) {
        let mut message_lines: Vec<&str> = Vec::new();
        for line in body {
            if self.stack_line.is_match(line) {
                break;
            }
            message_lines.push(line);
        }
        while message_lines
            .last()
            .is_some_and(|l| l.trim().is_empty())
        {
            message_lines.pop();
        }
        while message_lines
            .first()
            .is_some_and(|l| l.trim().is_empty())
        {
            message_lines.remove(0);
        }
        let message = message_lines
            .iter()
            .map(|l| l.trim_end())
            .collect::<Vec<_>>()
            .join("\n");

        // Location from the first stack line if present, otherwise from
        // anywhere in the block.
        let location = body
            .iter()
            .find(|l| self.stack_line.is_match(l))
            .and_then(|l| self.parse_location(l))
            .or_else(|| body.iter().find_map(|l| self.parse_location(l)));

        (message, location)
    }

    fn parse_location(&self, line: &str) -> Option<SourceLocation> {
        let caps = self.location.captures(line)?;
        Some(SourceLocation {
            file: caps[1].to_string(),
            line: caps[2].parse().ok()?,
        })
    }
}

/// `Suite › nested › test name` → suite path and test name.
fn split_jest_header(header: &str) -> (Option<String>, String) {
    match header.rsplit_once(" › ") {
        Some((suite, test)) => (Some(suite.to_string()), test.to_string()),
        None => (None, header.to_string()),
    }
}

/// Assertion failure unless the message clearly reads as a thrown error.
fn refine_kind(message: &str) -> FailureKind {
    let first = message.lines().next().unwrap_or("");
    if first.contains("expect(") || first.contains("AssertionError") || first.contains("assert") {
        return FailureKind::AssertionFailure;
    }
    if first.contains("Error:") || first.contains("panicked at") {
        return FailureKind::RuntimeError;
    }
    FailureKind::AssertionFailure
}
