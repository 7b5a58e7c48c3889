//! Line-oriented console output.
//!
//! ```text
//! Starting: TestResults/heat.np=4
//! Finished: heat                 pass     12s  10/18 14:02:11 heat.np=4
//! Progress: 1/6 = 16.7%, time = 13s
//! ```

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use console::{StyledObject, style};

use super::{Reporter, TestReport, pretty_time};
use crate::orchestrator::RunResult;
use crate::status::ResultStatus;

/// Prints run events to stdout.
pub struct ConsoleReporter {
    verbose: bool,
}

impl ConsoleReporter {
    /// With `verbose`, the summary also lists tests that did not fail.
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

/// The `Finished:` line body for one test.
pub fn status_line(test: &TestReport) -> String {
    let runtime = match test.result {
        ResultStatus::NotRun | ResultStatus::Skip => String::new(),
        _ => pretty_time(test.runtime()),
    };
    let date = test
        .start_date
        .map(|d| d.format("%m/%d %H:%M:%S").to_string())
        .unwrap_or_default();
    format!(
        "{:<20} {} {:<4} {:>14} {}",
        test.name,
        styled_status(test.result, 8),
        runtime,
        date,
        test.execute_directory
    )
}

fn styled_status(status: ResultStatus, width: usize) -> StyledObject<String> {
    let word = format!("{:<width$}", status.as_str(), width = width);
    match status {
        ResultStatus::Pass => style(word).green(),
        ResultStatus::Diff => style(word).yellow(),
        ResultStatus::Fail | ResultStatus::Timeout => style(word).red(),
        ResultStatus::NotRun | ResultStatus::NotDone | ResultStatus::Skip => style(word).dim(),
    }
}

#[async_trait]
impl Reporter for ConsoleReporter {
    async fn on_run_start(&self, num_tests: usize) {
        println!("Start time: {}", chrono::Local::now().format("%a %b %e %H:%M:%S %Y"));
        println!("Total number of tests: {}", num_tests);
    }

    async fn on_test_start(&self, _test: &TestReport, exec_dir: &Path) {
        println!("Starting: {}", exec_dir.display());
    }

    async fn on_test_complete(&self, test: &TestReport) {
        println!("Finished: {}", status_line(test));
    }

    async fn on_progress(&self, done: usize, total: usize, elapsed: Duration) {
        let pct = if total == 0 {
            100.0
        } else {
            100.0 * done as f64 / total as f64
        };
        println!(
            "Progress: {}/{} = {:.1}%, time = {}",
            done,
            total,
            pct,
            pretty_time(elapsed)
        );
    }

    async fn on_run_complete(&self, result: &RunResult) {
        if !result.blocked.is_empty() {
            println!();
        }
        for (test, dep) in &result.blocked {
            println!(
                "{} test \"{}\" notrun due to dependency \"{}\"",
                style("*** Warning:").yellow(),
                test,
                dep
            );
        }

        let listed: Vec<&TestReport> = result
            .results
            .iter()
            .filter(|r| self.verbose || !matches!(r.result, ResultStatus::Pass | ResultStatus::Skip))
            .collect();
        if !listed.is_empty() {
            println!();
            println!("==================================================");
            for r in listed {
                println!("{}", status_line(r));
            }
            println!("==================================================");
        }

        println!();
        println!("Test Results:");
        println!("  Total:   {}", result.total_tests);
        println!("  Passed:  {}", style(result.passed).green());
        println!("  Diffed:  {}", style(result.diffed).yellow());
        println!("  Failed:  {}", style(result.failed).red());
        println!("  Timeout: {}", style(result.timed_out).red());
        println!("  Skipped: {}", style(result.skipped).yellow());
        if result.not_run > 0 {
            println!("  Not Run: {}", style(result.not_run).red().bold());
        }
        println!("  Duration: {}", pretty_time(result.duration));

        println!();
        if result.cancelled {
            println!("{}", style("Run interrupted.").red().bold());
        } else if result.success() {
            println!("{}", style("All tests passed!").green().bold());
        } else if result.exit_code() == 2 {
            println!("{}", style("Some tests diffed.").yellow().bold());
        } else {
            println!("{}", style("Some tests failed.").red().bold());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(result: ResultStatus, runtime: Option<u64>) -> TestReport {
        TestReport {
            name: "heat".to_string(),
            execute_directory: "sub/heat.np=4".to_string(),
            result,
            skip_reason: None,
            runtime_secs: runtime,
            start_date: None,
            np: 4,
            keywords: Vec::new(),
        }
    }

    #[test]
    fn test_status_line() {
        console::set_colors_enabled(false);
        let line = status_line(&report(ResultStatus::Pass, Some(12)));
        assert!(line.starts_with("heat                 pass     12s "));
        assert!(line.ends_with(" sub/heat.np=4"));
    }

    #[test]
    fn test_status_line_not_run_has_no_time() {
        console::set_colors_enabled(false);
        let line = status_line(&report(ResultStatus::NotRun, None));
        assert!(line.starts_with("heat                 notrun        "));
    }
}
