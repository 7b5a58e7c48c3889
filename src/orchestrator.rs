//! Test execution engine.
//!
//! This module contains the run loop that drives a [`TestExecutionList`] to
//! completion on a processor-limited platform.
//!
//! # Architecture
//!
//! ```text
//!   TestList ──► TestExecutionList ◄──── pop_next(platform) ──┐
//!                      │                                      │
//!                      │ start_test                           │
//!                      ▼                                      │
//!              ExecutionHandler  (execute dir, command, env)  │
//!                      │                                      │
//!                      ▼                                      │
//!              ProcessSupervisor (child, procs, timeout)      │
//!                      │                                      │
//!                      │ poll_test every tick                 │
//!                      ▼                                      │
//!                  test_done ──► ResultsSink, Reporter ───────┘
//! ```
//!
//! # Execution Flow
//!
//! 1. **Pop**: ask the list for a startable test; start it if there is one
//! 2. **Wait**: otherwise check the info hook and sleep one tick
//! 3. **Poll**: poll every running test, retiring finished ones
//! 4. **Repeat** until nothing is queued or running
//!
//! Everything happens on one task. Parallelism comes only from the child
//! processes. Cancelling the run (SIGINT, SIGTERM or SIGHUP to the harness,
//! or the driver's [`CancellationToken`]) kills every running test and its
//! descendants before the loop returns.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::path::Path;
//! use vvtest::command::{ExecMode, RecordCommandBuilder};
//! use vvtest::config::load_config;
//! use vvtest::orchestrator::{ExecOptions, ExecutionDriver, ExecutionHandler, TestExecutionList};
//! use vvtest::platform::LocalPlatform;
//! use vvtest::report::{ConsoleReporter, ResultsLog};
//! use vvtest::testlist::TestList;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(Path::new("vvtest.toml"))?;
//!     let tlist = TestList::load_manifest(Path::new("tests.toml"))?;
//!
//!     let opts = ExecOptions::from_config(&config.vvtest, ExecMode::Normal);
//!     let handler = ExecutionHandler::new(opts, Arc::new(RecordCommandBuilder));
//!     let xlist = TestExecutionList::new(tlist, handler)?;
//!     let platform = LocalPlatform::from_config(&config.platform, None);
//!
//!     let mut log = ResultsLog::new();
//!     let driver = ExecutionDriver::new(xlist, Box::new(platform), ConsoleReporter::new(false));
//!     let result = driver.run(&mut log).await?;
//!
//!     std::process::exit(result.exit_code());
//! }
//! ```

pub mod handler;
pub mod info;
pub mod proctree;
pub mod scheduler;
pub mod supervisor;

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::ExecMode;
use crate::platform::ResourceManager;
use crate::report::{Reporter, ResultsSink, TestReport};
use crate::status::ResultStatus;
use crate::testlist::TestId;

pub use handler::{ExecOptions, ExecutionHandler, KillTiming, timeout_env_value};
pub use info::InfoPrinter;
pub use proctree::ProcessTree;
pub use scheduler::TestExecutionList;
pub use supervisor::{ExecError, ProcessSupervisor};

/// Aggregated results of an entire run.
///
/// # Exit Codes
///
/// | Code | Meaning |
/// |------|---------|
/// | 0 | Every test passed (skips do not count) |
/// | 2 | The only non-passing results are diffs |
/// | 1 | Anything else: failures, timeouts, tests not run, interruption |
#[derive(Debug, Clone)]
pub struct RunResult {
    /// Number of tests the run was asked to execute.
    pub total_tests: usize,
    pub passed: usize,
    pub diffed: usize,
    pub failed: usize,
    pub timed_out: usize,
    /// Tests skipped during the run because of their dependencies.
    pub skipped: usize,
    /// Tests left unstarted or unfinished.
    pub not_run: usize,
    /// Wall-clock duration of the run.
    pub duration: Duration,
    /// Whether the run was cancelled before it finished.
    pub cancelled: bool,
    /// Tests left queued, with the dependency that held each back.
    pub blocked: Vec<(String, String)>,
    /// Every test, retired ones in completion order, then unstarted ones.
    pub results: Vec<TestReport>,
}

impl RunResult {
    pub fn from_reports(
        results: Vec<TestReport>,
        blocked: Vec<(String, String)>,
        duration: Duration,
        cancelled: bool,
    ) -> Self {
        let count = |status: ResultStatus| results.iter().filter(|r| r.result == status).count();
        Self {
            total_tests: results.len(),
            passed: count(ResultStatus::Pass),
            diffed: count(ResultStatus::Diff),
            failed: count(ResultStatus::Fail),
            timed_out: count(ResultStatus::Timeout),
            skipped: count(ResultStatus::Skip),
            not_run: count(ResultStatus::NotRun) + count(ResultStatus::NotDone),
            duration,
            cancelled,
            blocked,
            results,
        }
    }

    /// Returns `true` when every test passed or was skipped.
    ///
    /// # Example
    ///
    /// ```
    /// use vvtest::orchestrator::RunResult;
    /// use std::time::Duration;
    ///
    /// let result = RunResult::from_reports(vec![], vec![], Duration::from_secs(1), false);
    /// assert!(result.success());
    /// assert_eq!(result.exit_code(), 0);
    /// ```
    pub fn success(&self) -> bool {
        self.exit_code() == 0
    }

    pub fn exit_code(&self) -> i32 {
        if self.cancelled || self.failed > 0 || self.timed_out > 0 || self.not_run > 0 {
            1
        } else if self.diffed > 0 {
            2
        } else {
            0
        }
    }
}

/// Runs a [`TestExecutionList`] to completion.
pub struct ExecutionDriver<R> {
    xlist: TestExecutionList,
    platform: Box<dyn ResourceManager>,
    reporter: R,
    tick: Duration,
    tree: ProcessTree,
    info: InfoPrinter,
    cancel: CancellationToken,
    handle_signals: bool,
}

impl<R: Reporter> ExecutionDriver<R> {
    pub fn new(xlist: TestExecutionList, platform: Box<dyn ResourceManager>, reporter: R) -> Self {
        Self {
            xlist,
            platform,
            reporter,
            tick: Duration::from_secs(1),
            tree: ProcessTree::new(),
            info: InfoPrinter::disabled(),
            cancel: CancellationToken::new(),
            handle_signals: false,
        }
    }

    /// Sleep between polls when nothing can start.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_info_printer(mut self, info: InfoPrinter) -> Self {
        self.info = info;
        self
    }

    pub fn with_process_tree(mut self, tree: ProcessTree) -> Self {
        self.tree = tree;
        self
    }

    /// Cancels the run on SIGINT, SIGTERM or SIGHUP.
    pub fn with_signal_handling(mut self) -> Self {
        self.handle_signals = true;
        self
    }

    /// Token that stops the run when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Executes every queued test and returns the aggregated results.
    ///
    /// # Errors
    ///
    /// Returns an error if execute directories cannot be created. Test
    /// failures are never errors; they are recorded in the results.
    pub async fn run(mut self, sink: &mut dyn ResultsSink) -> anyhow::Result<RunResult> {
        let start = Instant::now();
        self.xlist.create_test_execs()?;

        let total = self.xlist.num_active();
        let baseline = self.xlist.handler().options().mode == ExecMode::Baseline;
        info!(
            "running {} tests on {} ({} processors)",
            total,
            self.platform.name(),
            self.platform.num_procs()
        );
        self.reporter.on_run_start(total).await;

        if self.handle_signals {
            tokio::spawn(watch_signals(self.cancel.clone()));
        }

        let mut cancelled = false;
        loop {
            if self.cancel.is_cancelled() {
                cancelled = true;
                self.kill_running(sink).await;
                break;
            }

            let next = if baseline && self.xlist.num_running() > 0 {
                None
            } else {
                self.xlist.pop_next(self.platform.as_ref())
            };
            let mut finished = self.retire_skipped(sink).await;

            if let Some(id) = next {
                self.xlist.start_test(id, self.platform.as_mut());
                let case = self.xlist.tlist().case(id);
                let exec_dir = self.xlist.handler().exec_dir(case.record());
                self.reporter
                    .on_test_start(&TestReport::from_case(case), &exec_dir)
                    .await;
            } else if self.xlist.num_running() == 0 {
                break;
            } else {
                self.info.check_print(&mut std::io::stdout(), &self.xlist);
                tokio::select! {
                    _ = tokio::time::sleep(self.tick) => {}
                    _ = self.cancel.cancelled() => {}
                }
            }

            for id in self.xlist.get_running() {
                if self.xlist.poll_test(id, self.platform.as_mut()) {
                    self.retire(id, sink).await;
                    finished = true;
                } else if baseline && self.baseline_overrun(id) {
                    warn!("baseline of {} timed out", self.xdir(id));
                    self.xlist
                        .kill_test(id, &self.tree, self.platform.as_mut())
                        .await;
                    self.retire(id, sink).await;
                    finished = true;
                }
            }
            if finished {
                self.reporter
                    .on_progress(self.xlist.num_done(), total, start.elapsed())
                    .await;
            }
        }

        let mut blocked = Vec::new();
        let remaining = self.xlist.pop_remaining();
        for &id in &remaining {
            if let Some(b) = self.xlist.blocking(id) {
                let dep = self.xdir(b.target()).to_string();
                info!("test \"{}\" notrun due to dependency \"{}\"", self.xdir(id), dep);
                blocked.push((self.xdir(id).to_string(), dep));
            }
        }

        let tlist = self.xlist.tlist();
        let results: Vec<TestReport> = self
            .xlist
            .get_stopped()
            .into_iter()
            .chain(remaining)
            .map(|id| TestReport::from_case(tlist.case(id)))
            .collect();
        let result = RunResult::from_reports(results, blocked, start.elapsed(), cancelled);
        debug!(
            "run finished with exit code {} after {:?}",
            result.exit_code(),
            result.duration
        );

        self.reporter.on_run_complete(&result).await;
        Ok(result)
    }

    fn xdir(&self, id: TestId) -> &str {
        self.xlist.tlist().case(id).record().execute_directory()
    }

    /// A baseline past its limit has been interrupted by its supervisor;
    /// the rest of its process tree goes down at once.
    fn baseline_overrun(&self, id: TestId) -> bool {
        self.xlist
            .tlist()
            .case(id)
            .exec()
            .is_some_and(|exec| exec.is_timed_out())
    }

    async fn retire(&mut self, id: TestId, sink: &mut dyn ResultsSink) {
        self.xlist.test_done(id, sink);
        let report = TestReport::from_case(self.xlist.tlist().case(id));
        self.reporter.on_test_complete(&report).await;
    }

    /// Reports tests the scheduler skipped since the last call. Returns
    /// whether there were any.
    async fn retire_skipped(&mut self, sink: &mut dyn ResultsSink) -> bool {
        let skipped = self.xlist.take_skipped();
        for &id in &skipped {
            let case = self.xlist.tlist().case(id);
            sink.append_test_result(case);
            self.reporter
                .on_test_complete(&TestReport::from_case(case))
                .await;
        }
        !skipped.is_empty()
    }

    async fn kill_running(&mut self, sink: &mut dyn ResultsSink) {
        let running = self.xlist.get_running();
        if !running.is_empty() {
            warn!("killing {} running tests", running.len());
        }
        for id in running {
            self.xlist
                .kill_test(id, &self.tree, self.platform.as_mut())
                .await;
            self.retire(id, sink).await;
        }
    }
}

async fn watch_signals(token: CancellationToken) {
    use tokio::signal::unix::{SignalKind, signal};

    let (mut term, mut hup) = match (signal(SignalKind::terminate()), signal(SignalKind::hangup())) {
        (Ok(term), Ok(hup)) => (term, hup),
        (Err(e), _) | (_, Err(e)) => {
            warn!("failed to install signal handlers: {}", e);
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
        _ = hup.recv() => {}
        _ = token.cancelled() => return,
    }
    warn!("signal received, stopping the run");
    token.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::RecordCommandBuilder;
    use crate::platform::{LocalPlatform, ProcAllocation};
    use crate::record::TestRecord;
    use crate::report::{NullReporter, ResultsLog};
    use crate::status::SkipReason;
    use crate::testlist::TestList;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    fn sh(root: &Path, name: &str, script: &str) -> TestRecord {
        TestRecord::new(name, root, format!("{}.vvt", name)).with_command(["sh", "-c", script])
    }

    /// Platform handle the test keeps while the driver owns a clone.
    #[derive(Clone)]
    struct SharedPlatform(Arc<Mutex<LocalPlatform>>);

    impl SharedPlatform {
        fn new(nprocs: u32) -> Self {
            Self(Arc::new(Mutex::new(LocalPlatform::new(nprocs))))
        }
    }

    impl ResourceManager for SharedPlatform {
        fn name(&self) -> &str {
            "shared"
        }

        fn num_procs(&self) -> u32 {
            self.0.lock().unwrap().num_procs()
        }

        fn max_procs(&self) -> u32 {
            self.0.lock().unwrap().max_procs()
        }

        fn num_free(&self) -> u32 {
            self.0.lock().unwrap().num_free()
        }

        fn obtain_procs(&mut self, np: u32) -> ProcAllocation {
            self.0.lock().unwrap().obtain_procs(np)
        }

        fn give_procs(&mut self, allocation: ProcAllocation) {
            self.0.lock().unwrap().give_procs(allocation)
        }
    }

    fn driver(
        root: &Path,
        tlist: TestList,
        nprocs: u32,
        mode: ExecMode,
    ) -> ExecutionDriver<NullReporter> {
        driver_on(root, tlist, Box::new(LocalPlatform::new(nprocs)), mode)
    }

    fn driver_on(
        root: &Path,
        tlist: TestList,
        platform: Box<dyn ResourceManager>,
        mode: ExecMode,
    ) -> ExecutionDriver<NullReporter> {
        let mut opts = ExecOptions::new(root.join("results"));
        opts.mode = mode;
        opts.baseline_timeout = Duration::from_secs(1);
        opts.interrupt_to_kill = Duration::from_millis(500);
        opts.kill_timing = KillTiming {
            after_interrupt: Duration::from_millis(200),
            after_kill: Duration::from_secs(2),
        };
        let handler = ExecutionHandler::new(opts, Arc::new(RecordCommandBuilder));
        let xlist = TestExecutionList::new(tlist, handler).unwrap();
        ExecutionDriver::new(xlist, platform, NullReporter).with_tick(Duration::from_millis(50))
    }

    fn names(log: &ResultsLog) -> Vec<&str> {
        log.entries().iter().map(|e| e.name.as_str()).collect()
    }

    #[test]
    fn test_exit_codes() {
        let report = |result| TestReport {
            name: "t".to_string(),
            execute_directory: "t".to_string(),
            result,
            skip_reason: None,
            runtime_secs: None,
            start_date: None,
            np: 1,
            keywords: Vec::new(),
        };
        let code = |results: Vec<ResultStatus>| {
            RunResult::from_reports(
                results.into_iter().map(report).collect(),
                Vec::new(),
                Duration::ZERO,
                false,
            )
            .exit_code()
        };
        assert_eq!(code(vec![ResultStatus::Pass, ResultStatus::Skip]), 0);
        assert_eq!(code(vec![ResultStatus::Pass, ResultStatus::Diff]), 2);
        assert_eq!(code(vec![ResultStatus::Diff, ResultStatus::Fail]), 1);
        assert_eq!(code(vec![ResultStatus::Timeout]), 1);
        assert_eq!(code(vec![ResultStatus::NotRun]), 1);
        assert_eq!(
            RunResult::from_reports(Vec::new(), Vec::new(), Duration::ZERO, true).exit_code(),
            1
        );
    }

    #[tokio::test]
    async fn test_dependency_runs_in_order() {
        let root = TempDir::new().unwrap();
        let mut tlist = TestList::new();
        tlist
            .add(sh(root.path(), "B", "test -f ../A/done").with_dependency("A", None))
            .unwrap();
        tlist.add(sh(root.path(), "A", "sleep 0.2; touch done")).unwrap();

        let mut log = ResultsLog::new();
        let result = driver(root.path(), tlist, 1, ExecMode::Normal)
            .run(&mut log)
            .await
            .unwrap();

        assert_eq!(names(&log), vec!["A", "B"]);
        assert_eq!(result.passed, 2);
        assert_eq!(result.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_failed_dependency_skips_dependent() {
        let root = TempDir::new().unwrap();
        let mut tlist = TestList::new();
        tlist.add(sh(root.path(), "E", "exit 1")).unwrap();
        tlist
            .add(sh(root.path(), "D", "exit 0").with_dependency("E", Some("pass")))
            .unwrap();

        let mut log = ResultsLog::new();
        let result = driver(root.path(), tlist, 2, ExecMode::Normal)
            .run(&mut log)
            .await
            .unwrap();

        assert_eq!(result.failed, 1);
        assert_eq!(result.skipped, 1);
        let d = log.entries().iter().find(|e| e.name == "D").unwrap();
        assert_eq!(d.skip_reason, Some(SkipReason::Dependency));
        assert!(d.start_date.is_none());
        assert_eq!(result.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_diff_and_timeout() {
        let root = TempDir::new().unwrap();
        let mut tlist = TestList::new();
        tlist.add(sh(root.path(), "diff", "exit 64")).unwrap();
        tlist
            .add(sh(root.path(), "slow", "trap '' INT; sleep 30").with_timeout(1))
            .unwrap();

        let mut log = ResultsLog::new();
        let result = driver(root.path(), tlist, 2, ExecMode::Normal)
            .run(&mut log)
            .await
            .unwrap();

        assert_eq!(result.diffed, 1);
        assert_eq!(result.timed_out, 1);
        assert_eq!(result.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_cycle_reported_as_blocked() {
        let root = TempDir::new().unwrap();
        let mut tlist = TestList::new();
        tlist.add(sh(root.path(), "x", "exit 0").with_dependency("y", None)).unwrap();
        tlist.add(sh(root.path(), "y", "exit 0").with_dependency("x", None)).unwrap();

        let mut log = ResultsLog::new();
        let result = driver(root.path(), tlist, 2, ExecMode::Normal)
            .run(&mut log)
            .await
            .unwrap();

        assert_eq!(result.not_run, 2);
        assert_eq!(result.blocked.len(), 2);
        assert!(log.entries().is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_kills_running() {
        let root = TempDir::new().unwrap();
        let mut tlist = TestList::new();
        tlist.add(sh(root.path(), "long", "sleep 30")).unwrap();
        tlist.add(sh(root.path(), "later", "exit 0").with_dependency("long", None)).unwrap();

        let driver = driver(root.path(), tlist, 1, ExecMode::Normal);
        let token = driver.cancellation_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            token.cancel();
        });

        let mut log = ResultsLog::new();
        let started = Instant::now();
        let result = driver.run(&mut log).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(result.cancelled);
        assert_eq!(result.failed, 1);
        assert_eq!(result.not_run, 1);
        assert_eq!(names(&log), vec!["long"]);
    }

    #[tokio::test]
    async fn test_baseline_runs_one_at_a_time() {
        let root = TempDir::new().unwrap();
        let mut tlist = TestList::new();
        for name in ["a", "b"] {
            tlist
                .add(
                    TestRecord::new(name, root.path(), format!("{}.vvt", name))
                        .with_command(["sh", "-c", "exit 1"])
                        .with_baseline_command(["sh", "-c", "mkdir ../lock && sleep 0.2 && rmdir ../lock"]),
                )
                .unwrap();
        }
        tlist
            .add(
                TestRecord::new("hang", root.path(), "hang.vvt")
                    .with_baseline_command(["sh", "-c", "trap '' INT; sleep 30"]),
            )
            .unwrap();

        let mut log = ResultsLog::new();
        let result = driver(root.path(), tlist, 4, ExecMode::Baseline)
            .run(&mut log)
            .await
            .unwrap();

        assert_eq!(result.passed, 2);
        let hang = log.entries().iter().find(|e| e.name == "hang").unwrap();
        assert_eq!(hang.result, ResultStatus::Timeout);
        assert!(root.path().join("results/a/baseline.log").exists());
    }

    #[tokio::test]
    async fn test_free_procs_restored_after_run() {
        let root = TempDir::new().unwrap();
        let mut tlist = TestList::new();
        for i in 0..5 {
            tlist
                .add(
                    sh(root.path(), &format!("t{}", i), "exit 0").with_param("np", ((i % 3) + 1).to_string()),
                )
                .unwrap();
        }
        tlist
            .add(sh(root.path(), "clean", "trap 'exit 0' INT; while :; do sleep 0.1; done").with_timeout(1))
            .unwrap();
        tlist
            .add(sh(root.path(), "stubborn", "trap '' INT; sleep 30").with_timeout(1))
            .unwrap();

        let platform = SharedPlatform::new(3);
        let mut log = ResultsLog::new();
        let result = driver_on(root.path(), tlist, Box::new(platform.clone()), ExecMode::Normal)
            .run(&mut log)
            .await
            .unwrap();

        assert_eq!(result.passed, 5);
        assert_eq!(result.timed_out, 2);
        for name in ["clean", "stubborn"] {
            let entry = log.entries().iter().find(|e| e.name == name).unwrap();
            assert_eq!(entry.result, ResultStatus::Timeout, "{}", name);
        }
        assert_eq!(platform.num_free(), 3);
    }

    #[tokio::test]
    async fn test_free_procs_restored_after_cancel() {
        let root = TempDir::new().unwrap();
        let mut tlist = TestList::new();
        tlist
            .add(sh(root.path(), "wide", "sleep 30").with_param("np", "2"))
            .unwrap();
        tlist.add(sh(root.path(), "narrow", "trap '' INT; sleep 30")).unwrap();

        let platform = SharedPlatform::new(3);
        let driver = driver_on(root.path(), tlist, Box::new(platform.clone()), ExecMode::Normal);
        let token = driver.cancellation_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            token.cancel();
        });

        let result = driver.run(&mut ResultsLog::new()).await.unwrap();
        assert!(result.cancelled);
        assert_eq!(result.failed, 2);
        assert_eq!(platform.num_free(), 3);
    }

    #[tokio::test]
    async fn test_reruns_keep_previous_outputs() {
        for mode in [ExecMode::AnalyzeOnly, ExecMode::Baseline] {
            let root = TempDir::new().unwrap();
            let exec_dir = root.path().join("results/t");
            std::fs::create_dir_all(&exec_dir).unwrap();
            std::fs::write(exec_dir.join("output.dat"), "x").unwrap();

            let mut tlist = TestList::new();
            tlist
                .add(
                    TestRecord::new("t", root.path(), "t.vvt")
                        .with_command(["sh", "-c", "test -f output.dat"])
                        .with_baseline_command(["sh", "-c", "test -f output.dat"]),
                )
                .unwrap();

            let result = driver(root.path(), tlist, 1, mode)
                .run(&mut ResultsLog::new())
                .await
                .unwrap();
            assert_eq!(result.passed, 1, "{:?}", mode);
            assert!(exec_dir.join("output.dat").exists(), "{:?}", mode);
        }
    }
}
