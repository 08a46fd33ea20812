//! Diagnostic report synthesis
//!
//! Pure derivation of a section-based text report from a [`TestResult`].
//! Generation is byte-deterministic: the same result and context always
//! produce the same report, so a report can be regenerated on demand and
//! diffed, persisted, or pasted into an assistant prompt by collaborators.

use crate::classify::{FailureKind, FailureRecord, TestResult};
use serde::Serialize;

/// Caller-supplied context the result itself does not carry.
#[derive(Debug, Clone, Default)]
pub struct ReportContext {
    pub command: String,
    pub target: String,
    /// Bounded tail of the normalized output, shown when a failed run has
    /// no parsed failure detail.
    pub raw_excerpt: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportSection {
    pub name: &'static str,
    pub body: String,
}

/// Ordered named sections. Render with [`DiagnosticReport::to_text`].
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticReport {
    pub sections: Vec<ReportSection>,
}

impl DiagnosticReport {
    pub fn section(&self, name: &str) -> Option<&str> {
        self.sections
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.body.as_str())
    }

    /// Plain text with fixed `== NAME ==` section boundaries.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for (i, section) in self.sections.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            out.push_str(&format!(
                "== {} ==\n",
                section.name.replace('-', " ").to_uppercase()
            ));
            out.push_str(&section.body);
            if !section.body.ends_with('\n') {
                out.push('\n');
            }
        }
        out
    }
}

/// Report generator. Thresholds are fixed at construction so synthesis
/// stays a pure function of its inputs.
#[derive(Debug, Clone)]
pub struct ReportSynthesizer {
    /// Individual tests slower than this get a callout.
    pub slow_test_threshold_ms: u64,
}

impl Default for ReportSynthesizer {
    fn default() -> Self {
        Self {
            slow_test_threshold_ms: 500,
        }
    }
}

impl ReportSynthesizer {
    pub fn new(slow_test_threshold_ms: u64) -> Self {
        Self {
            slow_test_threshold_ms,
        }
    }

    pub fn synthesize(&self, result: &TestResult, ctx: &ReportContext) -> DiagnosticReport {
        let mut sections = vec![
            ReportSection {
                name: "header",
                body: self.header(result, ctx),
            },
            ReportSection {
                name: "summary",
                body: self.summary(result),
            },
        ];
        if !result.success {
            sections.push(ReportSection {
                name: "failure-analysis",
                body: self.failure_analysis(result, ctx),
            });
        }
        sections.push(ReportSection {
            name: "performance",
            body: self.performance(result),
        });
        sections.push(ReportSection {
            name: "guidance",
            body: guidance(result).to_string(),
        });
        DiagnosticReport { sections }
    }

    fn header(&self, result: &TestResult, ctx: &ReportContext) -> String {
        let exit = match result.exit_code {
            Some(code) => format!("exit: {}", code),
            None if result.failures.iter().any(|f| f.kind == FailureKind::SpawnError) => {
                "exit: not started".to_string()
            }
            None => "exit: killed".to_string(),
        };
        let banner = if result.success { "PASS" } else { "FAIL" };
        format!(
            "target: {}\ncommand: {}\n{}\nRESULT: {}\n",
            ctx.target, ctx.command, exit, banner
        )
    }

    fn summary(&self, result: &TestResult) -> String {
        let stats = &result.statistics;
        let mut lines: Vec<String> = Vec::new();

        if let Some(line) = counter_line(
            "suites",
            stats.suites_passed,
            stats.suites_failed,
            None,
            stats.suites_total,
        ) {
            lines.push(line);
        }
        if let Some(line) = counter_line(
            "tests",
            stats.tests_passed,
            stats.tests_failed,
            stats.tests_skipped,
            stats.tests_total,
        ) {
            lines.push(line);
        }
        if let Some(elapsed) = stats.elapsed_seconds {
            lines.push(format!("elapsed: {:.2}s (reported by runner)", elapsed));
        } else {
            lines.push(format!(
                "elapsed: {:.2}s (wall clock)",
                result.duration.as_secs_f64()
            ));
        }
        if stats.is_unknown() {
            lines.push("counters: unknown (no summary recognized in output)".to_string());
        }
        lines.join("\n")
    }

    fn failure_analysis(&self, result: &TestResult, ctx: &ReportContext) -> String {
        if result.failures.is_empty() {
            let mut body = String::from(
                "no failure detail available for this failed run.\n\
                 the runner exited unsuccessfully without recognizable failure markers.",
            );
            if let Some(excerpt) = &ctx.raw_excerpt {
                if !excerpt.trim().is_empty() {
                    body.push_str("\n\nlast output lines:\n");
                    body.push_str(excerpt.trim_end());
                }
            }
            return body;
        }

        let (per_test, environmental): (Vec<&FailureRecord>, Vec<&FailureRecord>) =
            result.failures.iter().partition(|f| f.is_per_test());

        let mut body = String::new();
        if !environmental.is_empty() {
            body.push_str("build/setup errors:\n");
            for failure in &environmental {
                body.push_str(&format!("  [{}] ", failure.kind.label()));
                body.push_str(first_line(&failure.message));
                body.push('\n');
                if let Some(loc) = &failure.source_location {
                    body.push_str(&format!("    at {}:{}\n", loc.file, loc.line));
                }
            }
        }
        if !per_test.is_empty() {
            if !environmental.is_empty() {
                body.push('\n');
            }
            body.push_str("test failures:\n");
            for (i, failure) in per_test.iter().enumerate() {
                let name = failure.test_name.as_deref().unwrap_or("(unnamed test)");
                body.push_str(&format!("  {}) {}", i + 1, name));
                if let Some(suite) = &failure.suite_name {
                    body.push_str(&format!(" [{}]", suite));
                }
                if let Some(loc) = &failure.source_location {
                    body.push_str(&format!(" ({}:{})", loc.file, loc.line));
                }
                body.push('\n');
                for line in failure.message.lines() {
                    body.push_str("     ");
                    body.push_str(line.trim_start());
                    body.push('\n');
                }
            }
        }
        body
    }

    fn performance(&self, result: &TestResult) -> String {
        let elapsed = result
            .statistics
            .elapsed_seconds
            .unwrap_or_else(|| result.duration.as_secs_f64());
        let band = if elapsed < 5.0 {
            "fast (<5s)"
        } else if elapsed < 15.0 {
            "normal (<15s)"
        } else if elapsed < 60.0 {
            "slow (<60s)"
        } else {
            "very slow (>=60s)"
        };
        let mut body = format!("elapsed band: {}", band);

        let slow: Vec<_> = result
            .timings
            .iter()
            .filter(|t| t.duration_ms > self.slow_test_threshold_ms)
            .collect();
        if !slow.is_empty() {
            body.push_str(&format!(
                "\nslow tests (>{} ms):\n",
                self.slow_test_threshold_ms
            ));
            for timing in slow {
                body.push_str(&format!("  - {} ({} ms)\n", timing.name, timing.duration_ms));
            }
        }
        body
    }
}

fn counter_line(
    label: &str,
    passed: Option<u32>,
    failed: Option<u32>,
    skipped: Option<u32>,
    total: Option<u32>,
) -> Option<String> {
    let mut parts: Vec<String> = Vec::new();
    if let Some(n) = passed {
        parts.push(format!("{} passed", n));
    }
    if let Some(n) = failed {
        parts.push(format!("{} failed", n));
    }
    if let Some(n) = skipped {
        parts.push(format!("{} skipped", n));
    }
    if let Some(n) = total {
        parts.push(format!("{} total", n));
    }
    if parts.is_empty() {
        return None;
    }
    Some(format!("{}: {}", label, parts.join(", ")))
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("")
}

/// Fixed next-step decision table. Ordered by severity: a build that never
/// ran outranks individual assertion detail.
fn guidance(result: &TestResult) -> &'static str {
    if result.success {
        return "all tests passing. safe to proceed with the change.";
    }
    let has = |kind: FailureKind| result.failures.iter().any(|f| f.kind == kind);
    if has(FailureKind::SpawnError) {
        return "the test command never started. check that the runner is installed and the working directory is correct.";
    }
    if has(FailureKind::TimeoutError) {
        return "the run exceeded its time limit. look for hanging tests, missing async completions, or infinite loops before re-running.";
    }
    if has(FailureKind::CompilationError) || has(FailureKind::SuiteSetupFailure) {
        return "fix compilation/setup errors first: the suite never executed, so test counts are not meaningful yet.";
    }
    if has(FailureKind::AssertionFailure) {
        return "review the failing assertions above; compare expected vs received values and update code or expectations.";
    }
    "the run failed but no structured failure detail was recognized. inspect the raw output excerpt above."
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{ResultClassifier, TestTiming};
    use std::time::Duration;

    fn ctx() -> ReportContext {
        ReportContext {
            command: "npx jest".to_string(),
            target: "app".to_string(),
            raw_excerpt: None,
        }
    }

    fn passing_result() -> TestResult {
        ResultClassifier::new().classify(
            "app",
            "Tests: 5 passed, 0 failed, 5 total\nTime: 1.2 s\n",
            Some(0),
            Duration::from_secs(2),
        )
    }

    #[test]
    fn test_synthesis_is_deterministic() {
        let result = passing_result();
        let synthesizer = ReportSynthesizer::default();
        let a = synthesizer.synthesize(&result, &ctx()).to_text();
        let b = synthesizer.synthesize(&result, &ctx()).to_text();
        assert_eq!(a, b);
    }

    #[test]
    fn test_passing_report_has_no_failure_section() {
        let report = ReportSynthesizer::default().synthesize(&passing_result(), &ctx());
        assert!(report.section("failure-analysis").is_none());
        assert!(report.section("header").unwrap().contains("RESULT: PASS"));
        assert!(report.section("summary").unwrap().contains("5 passed"));
    }

    #[test]
    fn test_failed_run_without_detail_gets_notice() {
        let result = ResultClassifier::new().classify(
            "app",
            "something inscrutable happened\n",
            Some(1),
            Duration::from_secs(1),
        );
        let mut context = ctx();
        context.raw_excerpt = Some("something inscrutable happened\n".to_string());
        let report = ReportSynthesizer::default().synthesize(&result, &context);
        let analysis = report.section("failure-analysis").expect("section");
        assert!(analysis.contains("no failure detail available"));
        assert!(analysis.contains("something inscrutable happened"));
    }

    #[test]
    fn test_failures_grouped_by_kind() {
        let output = "\
SyntaxError: unexpected token in src/old.ts
  ● math › adds

    expect(received).toBe(expected)

Tests: 1 failed, 1 total
";
        let result =
            ResultClassifier::new().classify("app", output, Some(1), Duration::from_secs(1));
        let report = ReportSynthesizer::default().synthesize(&result, &ctx());
        let analysis = report.section("failure-analysis").expect("section");
        assert!(analysis.contains("build/setup errors:"));
        assert!(analysis.contains("[compilation error]"));
        assert!(analysis.contains("test failures:"));
        assert!(analysis.contains("1) adds [math]"));
    }

    #[test]
    fn test_performance_bands() {
        let mut result = passing_result();
        let synthesizer = ReportSynthesizer::default();

        result.statistics.elapsed_seconds = Some(2.0);
        let report = synthesizer.synthesize(&result, &ctx());
        assert!(report.section("performance").unwrap().contains("fast (<5s)"));

        result.statistics.elapsed_seconds = Some(30.0);
        let report = synthesizer.synthesize(&result, &ctx());
        assert!(report.section("performance").unwrap().contains("slow (<60s)"));

        result.statistics.elapsed_seconds = Some(90.0);
        let report = synthesizer.synthesize(&result, &ctx());
        assert!(report
            .section("performance")
            .unwrap()
            .contains("very slow (>=60s)"));
    }

    #[test]
    fn test_slow_test_callouts() {
        let mut result = passing_result();
        result.timings = vec![
            TestTiming {
                name: "quick".to_string(),
                duration_ms: 40,
            },
            TestTiming {
                name: "sluggish".to_string(),
                duration_ms: 900,
            },
        ];
        let report = ReportSynthesizer::default().synthesize(&result, &ctx());
        let perf = report.section("performance").unwrap();
        assert!(perf.contains("sluggish (900 ms)"));
        assert!(!perf.contains("quick (40 ms)"));
    }

    #[test]
    fn test_guidance_prefers_compile_errors_over_assertions() {
        let output = "\
SyntaxError: unexpected token
  ● math › adds

    expect(received).toBe(expected)

Tests: 1 failed, 1 total
";
        let result =
            ResultClassifier::new().classify("app", output, Some(1), Duration::from_secs(1));
        let report = ReportSynthesizer::default().synthesize(&result, &ctx());
        assert!(report
            .section("guidance")
            .unwrap()
            .contains("fix compilation/setup errors first"));
    }

    #[test]
    fn test_guidance_for_passing_run() {
        let report = ReportSynthesizer::default().synthesize(&passing_result(), &ctx());
        assert!(report
            .section("guidance")
            .unwrap()
            .contains("all tests passing"));
    }

    #[test]
    fn test_text_rendering_has_named_boundaries() {
        let report = ReportSynthesizer::default().synthesize(&passing_result(), &ctx());
        let text = report.to_text();
        assert!(text.contains("== HEADER =="));
        assert!(text.contains("== SUMMARY =="));
        assert!(text.contains("== PERFORMANCE =="));
        assert!(text.contains("== GUIDANCE =="));
    }
}
