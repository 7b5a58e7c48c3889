//! JUnit XML report generation.
//!
//! Generates JUnit XML for CI systems. Every test becomes a `testcase` named
//! by its execute directory:
//!
//! | Result | Element | Counted as |
//! |--------|---------|------------|
//! | pass | bare `testcase` | passed |
//! | fail, timeout | `<failure message="FAIL">` + log excerpt | failures |
//! | diff | `<skipped message="DIFF">` + log excerpt | skipped |
//! | notrun, notdone, skip | `<skipped message="NOTRUN">` etc. | skipped |
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <testsuites>
//!   <testsuite name="vvtest" tests="2" errors="0" skipped="0" failures="1" time="3.000" timestamp="2026-10-18T14:02:11">
//!     <testcase name="heat.np=4" classname="vvtest.TestResults" time="2.000"/>
//!     <testcase name="cool" classname="vvtest.TestResults" time="1.000">
//!       <failure message="FAIL"/>
//!       <system-out><![CDATA[...]]></system-out>
//!     </testcase>
//!   </testsuite>
//! </testsuites>
//! ```

use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use quick_xml::Writer;
use quick_xml::events::{BytesCData, BytesDecl, BytesEnd, BytesStart, Event};

use super::{Reporter, TestReport};
use crate::orchestrator::RunResult;
use crate::status::ResultStatus;

const LOG_LIMIT_KB: u64 = 10;
const TESTSUITE_NAME: &str = "vvtest";

/// Writes a JUnit XML file when the run completes.
pub struct JUnitReporter {
    output_path: PathBuf,
    test_dir: PathBuf,
    log_file: String,
}

impl JUnitReporter {
    /// `test_dir` is where execute directories live; failing tests' logs are
    /// read from there.
    pub fn new(output_path: PathBuf, test_dir: PathBuf) -> Self {
        Self {
            output_path,
            test_dir,
            log_file: "execute.log".to_string(),
        }
    }

    /// Name of the log attached to failing tests; baseline runs write
    /// `baseline.log`.
    pub fn with_log_file(mut self, name: impl Into<String>) -> Self {
        self.log_file = name.into();
        self
    }

    fn classname(&self) -> String {
        let dir = self
            .test_dir
            .file_name()
            .map(|n| n.to_string_lossy().replace('.', "_"))
            .unwrap_or_else(|| "tests".to_string());
        format!("{}.{}", TESTSUITE_NAME, dir)
    }

    /// Generates the JUnit XML document.
    pub fn generate_xml(&self, run_result: &RunResult) -> anyhow::Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let results = &run_result.results;
        let failures = results
            .iter()
            .filter(|r| matches!(r.result, ResultStatus::Fail | ResultStatus::Timeout))
            .count();
        let skipped = results
            .iter()
            .filter(|r| !matches!(r.result, ResultStatus::Pass | ResultStatus::Fail | ResultStatus::Timeout))
            .count();
        let time: f64 = results.iter().map(|r| r.runtime().as_secs_f64()).sum();
        let timestamp = chrono::Local::now().format("%Y-%m-%dT%H:%M:%S").to_string();

        writer.write_event(Event::Start(BytesStart::new("testsuites")))?;

        let mut testsuite = BytesStart::new("testsuite");
        testsuite.push_attribute(("name", TESTSUITE_NAME));
        testsuite.push_attribute(("tests", results.len().to_string().as_str()));
        testsuite.push_attribute(("errors", "0"));
        testsuite.push_attribute(("skipped", skipped.to_string().as_str()));
        testsuite.push_attribute(("failures", failures.to_string().as_str()));
        testsuite.push_attribute(("time", format!("{:.3}", time).as_str()));
        testsuite.push_attribute(("timestamp", timestamp.as_str()));
        writer.write_event(Event::Start(testsuite))?;

        let classname = self.classname();
        for result in results {
            self.write_testcase(&mut writer, result, &classname)?;
        }

        writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
        writer.write_event(Event::End(BytesEnd::new("testsuites")))?;

        Ok(String::from_utf8(writer.into_inner())?)
    }

    fn write_testcase<W: std::io::Write>(
        &self,
        writer: &mut Writer<W>,
        result: &TestReport,
        classname: &str,
    ) -> anyhow::Result<()> {
        let mut testcase = BytesStart::new("testcase");
        testcase.push_attribute(("name", result.execute_directory.as_str()));
        testcase.push_attribute(("classname", classname));
        testcase.push_attribute(("time", format!("{:.3}", result.runtime().as_secs_f64()).as_str()));

        let (element, with_log) = match result.result {
            ResultStatus::Pass => {
                writer.write_event(Event::Empty(testcase))?;
                return Ok(());
            }
            ResultStatus::Fail | ResultStatus::Timeout => ("failure", true),
            ResultStatus::Diff => ("skipped", true),
            ResultStatus::NotRun | ResultStatus::NotDone | ResultStatus::Skip => ("skipped", false),
        };

        writer.write_event(Event::Start(testcase))?;
        let message = result.result.as_str().to_uppercase();
        let mut marker = BytesStart::new(element);
        marker.push_attribute(("message", message.as_str()));
        writer.write_event(Event::Empty(marker))?;

        if with_log {
            let log = self.test_dir.join(&result.execute_directory).join(&self.log_file);
            let text = match read_with_limit(&log, LOG_LIMIT_KB) {
                Ok(text) => text,
                Err(e) => format!("*** error reading log file: {}: {}", log.display(), e),
            };
            writer.write_event(Event::Start(BytesStart::new("system-out")))?;
            writer.write_event(Event::CData(BytesCData::new(cdata_safe(&text))))?;
            writer.write_event(Event::End(BytesEnd::new("system-out")))?;
        }

        writer.write_event(Event::End(BytesEnd::new("testcase")))?;
        Ok(())
    }
}

#[async_trait]
impl Reporter for JUnitReporter {
    async fn on_run_start(&self, _num_tests: usize) {}

    async fn on_test_start(&self, _test: &TestReport, _exec_dir: &Path) {}

    async fn on_test_complete(&self, _test: &TestReport) {}

    async fn on_progress(&self, _done: usize, _total: usize, _elapsed: std::time::Duration) {}

    async fn on_run_complete(&self, result: &RunResult) {
        match self.generate_xml(result) {
            Ok(xml) => {
                if let Some(parent) = self.output_path.parent()
                    && !parent.as_os_str().is_empty()
                    && !parent.exists()
                    && let Err(e) = std::fs::create_dir_all(parent)
                {
                    tracing::error!("Failed to create output directory: {}", e);
                    return;
                }

                if let Err(e) = std::fs::write(&self.output_path, xml) {
                    tracing::error!("Failed to write JUnit XML: {}", e);
                } else {
                    tracing::info!("JUnit XML written to: {}", self.output_path.display());
                }
            }
            Err(e) => {
                tracing::error!("Failed to generate JUnit XML: {}", e);
            }
        }
    }
}

/// Reads a log file. Files over the limit keep their head (20%) and tail
/// (70%) with a marker in between.
fn read_with_limit(path: &Path, max_kb: u64) -> std::io::Result<String> {
    let max = (max_kb * 1024).max(128);
    let mut file = std::fs::File::open(path)?;
    let size = file.metadata()?.len();

    let mut buf = Vec::new();
    if size < max {
        file.read_to_end(&mut buf)?;
        return Ok(String::from_utf8_lossy(&buf).into_owned());
    }

    let head = (max as f64 * 0.2).round() as u64;
    let tail_start = size - (max as f64 * 0.7).round() as u64;
    (&mut file).take(head).read_to_end(&mut buf)?;
    let mut text = String::from_utf8_lossy(&buf).into_owned();
    text.push_str("\n\n*** middle of file removed ***\n\n");

    buf.clear();
    file.seek(SeekFrom::Start(tail_start))?;
    file.read_to_end(&mut buf)?;
    text.push_str(&String::from_utf8_lossy(&buf));
    Ok(text)
}

/// CDATA sections cannot contain `]]>`; also drops characters XML forbids.
fn cdata_safe(s: &str) -> String {
    s.replace("]]>", "]] >")
        .chars()
        .filter(|c| matches!(c, '\t' | '\n' | '\r' | ' '..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}'))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ExecMode;
    use std::time::Duration;

    fn report(xdir: &str, result: ResultStatus) -> TestReport {
        TestReport {
            name: xdir.to_string(),
            execute_directory: xdir.to_string(),
            result,
            skip_reason: None,
            runtime_secs: Some(2),
            start_date: None,
            np: 1,
            keywords: Vec::new(),
        }
    }

    fn run_result(results: Vec<TestReport>) -> RunResult {
        RunResult::from_reports(results, Vec::new(), Duration::from_secs(4), false)
    }

    #[test]
    fn test_generate_xml() {
        let dir = tempfile::tempdir().unwrap();
        let test_dir = dir.path().join("TestResults.linux");
        std::fs::create_dir_all(test_dir.join("bad")).unwrap();
        std::fs::write(test_dir.join("bad/execute.log"), "boom <here>").unwrap();

        let reporter = JUnitReporter::new(dir.path().join("junit.xml"), test_dir);
        let xml = reporter
            .generate_xml(&run_result(vec![
                report("good", ResultStatus::Pass),
                report("bad", ResultStatus::Fail),
                report("close", ResultStatus::Diff),
                report("blocked", ResultStatus::NotRun),
            ]))
            .unwrap();

        assert!(xml.contains(r#"<testsuite name="vvtest" tests="4" errors="0" skipped="2" failures="1""#));
        assert!(xml.contains(r#"<testcase name="good" classname="vvtest.TestResults_linux" time="2.000"/>"#));
        assert!(xml.contains(r#"<failure message="FAIL"/>"#));
        assert!(xml.contains("<![CDATA[boom <here>]]>"));
        assert!(xml.contains(r#"<skipped message="DIFF"/>"#));
        assert!(xml.contains(r#"<skipped message="NOTRUN"/>"#));
        assert!(xml.contains("*** error reading log file"));
    }

    #[test]
    fn test_baseline_log_attached() {
        let dir = tempfile::tempdir().unwrap();
        let test_dir = dir.path().join("TestResults");
        std::fs::create_dir_all(test_dir.join("bad")).unwrap();
        std::fs::write(test_dir.join("bad/execute.log"), "stale run").unwrap();
        std::fs::write(test_dir.join("bad/baseline.log"), "cannot copy gold file").unwrap();

        let reporter = JUnitReporter::new(dir.path().join("junit.xml"), test_dir)
            .with_log_file(ExecMode::Baseline.log_file_name());
        let xml = reporter
            .generate_xml(&run_result(vec![report("bad", ResultStatus::Fail)]))
            .unwrap();

        assert!(xml.contains("<![CDATA[cannot copy gold file]]>"));
        assert!(!xml.contains("stale run"));
    }

    #[test]
    fn test_read_with_limit_truncates_middle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        let content: String = (0..2000).map(|i| format!("line {}\n", i)).collect();
        std::fs::write(&path, &content).unwrap();

        let text = read_with_limit(&path, 1).unwrap();
        assert!(text.starts_with("line 0\n"));
        assert!(text.contains("*** middle of file removed ***"));
        assert!(text.ends_with("line 1999\n"));
        assert!(text.len() < content.len());
    }

    #[test]
    fn test_cdata_safe() {
        assert_eq!(cdata_safe("a]]>b\u{1}"), "a]] >b");
    }

    #[tokio::test]
    async fn test_writes_file_on_run_complete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/junit.xml");
        let reporter = JUnitReporter::new(path.clone(), dir.path().to_path_buf());
        reporter
            .on_run_complete(&run_result(vec![report("good", ResultStatus::Pass)]))
            .await;
        assert!(std::fs::read_to_string(path).unwrap().contains("testsuites"));
    }
}
