//! Test reporting and output generation.
//!
//! Two seams receive results:
//!
//! - [`ResultsSink`] is fed synchronously by the scheduler, exactly once per
//!   retired test, in completion order. [`ResultsLog`] keeps those entries
//!   and can write them out as JSON.
//! - [`Reporter`] receives run events from the driver. [`ConsoleReporter`]
//!   prints them and [`JUnitReporter`] writes a JUnit XML file at the end.
//!   [`MultiReporter`] fans out to several.

pub mod console;
pub mod junit;

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::Serialize;

use crate::orchestrator::RunResult;
use crate::status::{ResultStatus, SkipReason};
use crate::testlist::TestCase;

pub use console::ConsoleReporter;
pub use junit::JUnitReporter;

/// A snapshot of one test's result, detached from the test list.
#[derive(Debug, Clone, Serialize)]
pub struct TestReport {
    pub name: String,
    pub execute_directory: String,
    pub result: ResultStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Local>>,
    pub np: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
}

impl TestReport {
    pub fn from_case(case: &TestCase) -> Self {
        let record = case.record();
        let status = case.status();
        Self {
            name: record.name().to_string(),
            execute_directory: record.execute_directory().to_string(),
            result: status.result_status(),
            skip_reason: status.skip_reason(),
            runtime_secs: status.runtime().map(|d| d.as_secs()),
            start_date: status.start_date(),
            np: record.np(),
            keywords: record.keywords().iter().cloned().collect(),
        }
    }

    /// Runtime, zero when the test did not run.
    pub fn runtime(&self) -> Duration {
        Duration::from_secs(self.runtime_secs.unwrap_or(0))
    }
}

/// Receives each retired test exactly once.
pub trait ResultsSink {
    fn append_test_result(&mut self, case: &TestCase);
}

/// Results in completion order.
#[derive(Debug, Default)]
pub struct ResultsLog {
    entries: Vec<TestReport>,
}

impl ResultsLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[TestReport] {
        &self.entries
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.entries)
    }

    /// Writes the entries as a JSON array, creating parent directories.
    pub fn write_json(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = self.to_json().context("Failed to serialize results")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write results to {}", path.display()))
    }
}

impl ResultsSink for ResultsLog {
    fn append_test_result(&mut self, case: &TestCase) {
        self.entries.push(TestReport::from_case(case));
    }
}

/// A test reporter receives events during a run.
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Called once before any test starts.
    async fn on_run_start(&self, num_tests: usize);

    /// Called when a test's process has been launched.
    async fn on_test_start(&self, test: &TestReport, exec_dir: &Path);

    /// Called when a test is retired, including tests skipped for their
    /// dependencies.
    async fn on_test_complete(&self, test: &TestReport);

    /// Called after each tick in which at least one test finished.
    async fn on_progress(&self, done: usize, total: usize, elapsed: Duration);

    /// Called when the run is over.
    async fn on_run_complete(&self, result: &RunResult);
}

/// A reporter that does nothing (for testing or when output is not needed).
pub struct NullReporter;

#[async_trait]
impl Reporter for NullReporter {
    async fn on_run_start(&self, _num_tests: usize) {}
    async fn on_test_start(&self, _test: &TestReport, _exec_dir: &Path) {}
    async fn on_test_complete(&self, _test: &TestReport) {}
    async fn on_progress(&self, _done: usize, _total: usize, _elapsed: Duration) {}
    async fn on_run_complete(&self, _result: &RunResult) {}
}

/// A reporter that combines multiple reporters.
#[derive(Default)]
pub struct MultiReporter {
    reporters: Vec<Box<dyn Reporter>>,
}

impl MultiReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a reporter.
    pub fn with_reporter<R: Reporter + 'static>(mut self, reporter: R) -> Self {
        self.reporters.push(Box::new(reporter));
        self
    }
}

#[async_trait]
impl Reporter for MultiReporter {
    async fn on_run_start(&self, num_tests: usize) {
        for reporter in &self.reporters {
            reporter.on_run_start(num_tests).await;
        }
    }

    async fn on_test_start(&self, test: &TestReport, exec_dir: &Path) {
        for reporter in &self.reporters {
            reporter.on_test_start(test, exec_dir).await;
        }
    }

    async fn on_test_complete(&self, test: &TestReport) {
        for reporter in &self.reporters {
            reporter.on_test_complete(test).await;
        }
    }

    async fn on_progress(&self, done: usize, total: usize, elapsed: Duration) {
        for reporter in &self.reporters {
            reporter.on_progress(done, total, elapsed).await;
        }
    }

    async fn on_run_complete(&self, result: &RunResult) {
        for reporter in &self.reporters {
            reporter.on_run_complete(result).await;
        }
    }
}

/// Human readable duration: `7s`, `2m 5s`, `1h 0m 3s`. Never reports zero.
pub fn pretty_time(d: Duration) -> String {
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, (secs / 60) % 60, secs % 60);
    match (h, m) {
        (0, 0) => format!("{}s", s.max(1)),
        (0, _) => format!("{}m {}s", m, s),
        _ => format!("{}h {}m {}s", h, m, s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::TestRecord;
    use crate::status::{TestOutcome, TestStatus};

    fn case(name: &str, outcome: TestOutcome) -> TestCase {
        TestCase::with_status(
            TestRecord::new(name, "/src", format!("{}.vvt", name)).with_keyword("fast"),
            TestStatus::done_previously(outcome, Some(Duration::from_secs(3))),
        )
    }

    #[test]
    fn test_pretty_time() {
        assert_eq!(pretty_time(Duration::ZERO), "1s");
        assert_eq!(pretty_time(Duration::from_secs(7)), "7s");
        assert_eq!(pretty_time(Duration::from_secs(125)), "2m 5s");
        assert_eq!(pretty_time(Duration::from_secs(3603)), "1h 0m 3s");
    }

    #[test]
    fn test_results_log_keeps_completion_order() {
        let mut log = ResultsLog::new();
        log.append_test_result(&case("b", TestOutcome::Pass));
        log.append_test_result(&case("a", TestOutcome::Diff));

        let names: Vec<&str> = log.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
        let last = log.entries().last().unwrap();
        assert_eq!(last.result, ResultStatus::Diff);
        assert_eq!(last.runtime(), Duration::from_secs(3));
    }

    #[test]
    fn test_results_json() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = ResultsLog::new();
        log.append_test_result(&case("a", TestOutcome::Timeout));

        let path = dir.path().join("nested/results.json");
        log.write_json(&path).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value[0]["name"], "a");
        assert_eq!(value[0]["result"], "timeout");
        assert_eq!(value[0]["runtime_secs"], 3);
        assert_eq!(value[0]["keywords"][0], "fast");
        assert!(value[0].get("skip_reason").is_none());
    }
}
