//! Test status state machine.
//!
//! Every test instance carries a [`TestStatus`] that moves through a small,
//! closed set of states:
//!
//! ```text
//!             mark_skipped()
//!   NotRun ─────────────────────► Skipped(reason)
//!     │
//!     │ start_running()
//!     ▼
//!   Running ──── mark_done(exit) ──────► Done(pass | diff | fail)
//!     │
//!     └───────── mark_timed_out() ─────► Done(timeout)
//! ```
//!
//! `Done` and `Skipped` are terminal. Illegal transitions return
//! [`StatusError::InvalidTransition`] instead of silently overwriting state.
//!
//! # Exit Status Translation
//!
//! | Exit | Outcome |
//! |------|---------|
//! | code 0 | `pass` |
//! | code 64 ([`DIFF_EXIT_STATUS`]) | `diff` |
//! | any other code | `fail` |
//! | killed or stopped by a signal | `fail` |

use std::fmt;
use std::process::ExitStatus;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Exit code a test script uses to report that it ran but its output
/// differs from the baseline.
pub const DIFF_EXIT_STATUS: i32 = 64;

/// Errors raised by illegal state transitions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StatusError {
    /// The requested transition is not allowed from the current state.
    #[error("cannot move test from '{from}' to '{to}'")]
    InvalidTransition {
        /// State the test was in.
        from: &'static str,
        /// State that was requested.
        to: &'static str,
    },
}

/// Final outcome of a test that ran to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestOutcome {
    /// Exit code 0.
    Pass,
    /// Exit code 64: ran, but results differ from the baseline.
    Diff,
    /// Any other exit, including signal termination.
    Fail,
    /// The harness had to interrupt the test after its timeout elapsed.
    Timeout,
}

impl TestOutcome {
    /// Returns the lowercase word used in reports and result expressions.
    pub fn as_str(&self) -> &'static str {
        match self {
            TestOutcome::Pass => "pass",
            TestOutcome::Diff => "diff",
            TestOutcome::Fail => "fail",
            TestOutcome::Timeout => "timeout",
        }
    }
}

impl fmt::Display for TestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps a raw exit code to a test outcome.
pub fn translate_exit_code(code: i32) -> TestOutcome {
    match code {
        0 => TestOutcome::Pass,
        DIFF_EXIT_STATUS => TestOutcome::Diff,
        _ => TestOutcome::Fail,
    }
}

/// Maps a child's exit status to a test outcome.
///
/// A status without an exit code (terminated or stopped by a signal) is a
/// failure.
pub fn translate_exit_status(status: ExitStatus) -> TestOutcome {
    match status.code() {
        Some(code) => translate_exit_code(code),
        None => TestOutcome::Fail,
    }
}

/// Why a test was excluded from execution.
///
/// Filtering happens before scheduling; the only reason assigned during a run
/// is [`SkipReason::Dependency`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    /// Test lives outside the selected subdirectory.
    Subdirectory,
    /// Excluded by a keyword expression.
    Keyword,
    /// Excluded by a keyword expression that refers to previous results.
    ResultsKeyword,
    /// Not enabled on the current platform.
    Platform,
    /// Not enabled for the given option set.
    Option,
    /// Marked as test-driven-development and TDD tests were not requested.
    Tdd,
    /// Excluded by a parameter filter.
    Parameter,
    /// Source files did not match the file search pattern.
    FileSearch,
    /// Needs more processors than the platform allows.
    MaxProcessors,
    /// Expected runtime outside the requested window.
    Runtime,
    /// Cumulative runtime limit reached.
    CumulativeRuntime,
    /// A dependency finished with an unacceptable result or was skipped.
    Dependency,
}

impl SkipReason {
    /// Human readable explanation used by reporters.
    pub fn description(&self) -> &'static str {
        match self {
            SkipReason::Subdirectory => "subdir",
            SkipReason::Keyword => "keyword expression",
            SkipReason::ResultsKeyword => "previous result keyword expression",
            SkipReason::Platform => "platform expression",
            SkipReason::Option => "option expression",
            SkipReason::Tdd => "TDD",
            SkipReason::Parameter => "parameter expression",
            SkipReason::FileSearch => "file search expression",
            SkipReason::MaxProcessors => "exceeds max processors",
            SkipReason::Runtime => "runtime too low or too high",
            SkipReason::CumulativeRuntime => "cumulative runtime exceeded",
            SkipReason::Dependency => "failed dependency",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Execution state of a test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestState {
    /// Waiting to be scheduled.
    NotRun,
    /// A child process is executing the test.
    Running,
    /// The test finished with the given outcome.
    Done(TestOutcome),
    /// The test was excluded and will never run.
    Skipped(SkipReason),
}

impl TestState {
    fn name(&self) -> &'static str {
        match self {
            TestState::NotRun => "notrun",
            TestState::Running => "running",
            TestState::Done(_) => "done",
            TestState::Skipped(_) => "skip",
        }
    }
}

/// Report-level status word combining state and outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Pass,
    Diff,
    Fail,
    Timeout,
    NotRun,
    NotDone,
    Skip,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::Pass => "pass",
            ResultStatus::Diff => "diff",
            ResultStatus::Fail => "fail",
            ResultStatus::Timeout => "timeout",
            ResultStatus::NotRun => "notrun",
            ResultStatus::NotDone => "notdone",
            ResultStatus::Skip => "skip",
        }
    }

    /// Words a result keyword expression may match for this status.
    ///
    /// A timeout is also a failure, and a test still executing is also
    /// `running`.
    pub fn keywords(&self) -> &'static [&'static str] {
        match self {
            ResultStatus::Pass => &["pass"],
            ResultStatus::Diff => &["diff"],
            ResultStatus::Fail => &["fail"],
            ResultStatus::Timeout => &["timeout", "fail"],
            ResultStatus::NotRun => &["notrun"],
            ResultStatus::NotDone => &["notdone", "running"],
            ResultStatus::Skip => &["skip"],
        }
    }
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling state, outcome and timing of a single test.
#[derive(Debug, Clone)]
pub struct TestStatus {
    state: TestState,
    start_date: Option<DateTime<Local>>,
    started_at: Option<Instant>,
    runtime: Option<Duration>,
}

impl Default for TestStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl TestStatus {
    /// A fresh status in the `NotRun` state.
    pub fn new() -> Self {
        Self {
            state: TestState::NotRun,
            start_date: None,
            started_at: None,
            runtime: None,
        }
    }

    /// A status carrying a result from an earlier run.
    ///
    /// Such a test is never scheduled again but can satisfy dependencies.
    pub fn done_previously(outcome: TestOutcome, runtime: Option<Duration>) -> Self {
        Self {
            state: TestState::Done(outcome),
            start_date: None,
            started_at: None,
            runtime,
        }
    }

    pub fn state(&self) -> TestState {
        self.state
    }

    pub fn is_not_run(&self) -> bool {
        self.state == TestState::NotRun
    }

    pub fn is_running(&self) -> bool {
        self.state == TestState::Running
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, TestState::Done(_))
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.state, TestState::Skipped(_))
    }

    /// True once the status can no longer change.
    pub fn is_settled(&self) -> bool {
        self.is_done() || self.is_skipped()
    }

    /// The outcome, present exactly when the state is `Done`.
    pub fn outcome(&self) -> Option<TestOutcome> {
        match self.state {
            TestState::Done(outcome) => Some(outcome),
            _ => None,
        }
    }

    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self.state {
            TestState::Skipped(reason) => Some(reason),
            _ => None,
        }
    }

    /// Wall-clock time the test was started.
    pub fn start_date(&self) -> Option<DateTime<Local>> {
        self.start_date
    }

    /// Runtime recorded at completion.
    pub fn runtime(&self) -> Option<Duration> {
        self.runtime
    }

    /// Time since `start_running`, for tests still executing.
    pub fn elapsed(&self) -> Option<Duration> {
        self.started_at.map(|t| t.elapsed())
    }

    /// Collapses state and outcome into a single report word.
    pub fn result_status(&self) -> ResultStatus {
        match self.state {
            TestState::NotRun => ResultStatus::NotRun,
            TestState::Running => ResultStatus::NotDone,
            TestState::Skipped(_) => ResultStatus::Skip,
            TestState::Done(TestOutcome::Pass) => ResultStatus::Pass,
            TestState::Done(TestOutcome::Diff) => ResultStatus::Diff,
            TestState::Done(TestOutcome::Fail) => ResultStatus::Fail,
            TestState::Done(TestOutcome::Timeout) => ResultStatus::Timeout,
        }
    }

    /// Excludes a test from the run.
    pub fn mark_skipped(&mut self, reason: SkipReason) -> Result<(), StatusError> {
        self.transition(TestState::NotRun, TestState::Skipped(reason))
    }

    /// Records the launch of the test's child process.
    pub fn start_running(&mut self) -> Result<(), StatusError> {
        self.transition(TestState::NotRun, TestState::Running)?;
        self.start_date = Some(Local::now());
        self.started_at = Some(Instant::now());
        Ok(())
    }

    /// Records completion from the child's exit status.
    pub fn mark_done(&mut self, exit: ExitStatus) -> Result<(), StatusError> {
        self.finish(translate_exit_status(exit))
    }

    /// Records that the harness interrupted the test after its timeout.
    pub fn mark_timed_out(&mut self) -> Result<(), StatusError> {
        self.finish(TestOutcome::Timeout)
    }

    /// Records completion with an explicit outcome, used when the child
    /// could not be launched or reaped.
    pub fn finish(&mut self, outcome: TestOutcome) -> Result<(), StatusError> {
        self.transition(TestState::Running, TestState::Done(outcome))?;
        self.runtime = self.started_at.map(|t| Duration::from_secs(t.elapsed().as_secs()));
        Ok(())
    }

    fn transition(&mut self, from: TestState, to: TestState) -> Result<(), StatusError> {
        if self.state != from {
            return Err(StatusError::InvalidTransition {
                from: self.state.name(),
                to: to.name(),
            });
        }
        self.state = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    fn exited(code: i32) -> ExitStatus {
        ExitStatus::from_raw(code << 8)
    }

    #[test]
    fn test_translate_exit_code() {
        assert_eq!(translate_exit_code(0), TestOutcome::Pass);
        assert_eq!(translate_exit_code(64), TestOutcome::Diff);
        assert_eq!(translate_exit_code(1), TestOutcome::Fail);
        assert_eq!(translate_exit_code(63), TestOutcome::Fail);
        assert_eq!(translate_exit_code(65), TestOutcome::Fail);
        assert_eq!(translate_exit_code(255), TestOutcome::Fail);
    }

    #[test]
    fn test_translate_exit_status_signaled() {
        // Raw wait status 9 means "terminated by SIGKILL".
        let killed = ExitStatus::from_raw(9);
        assert!(killed.code().is_none());
        assert_eq!(translate_exit_status(killed), TestOutcome::Fail);
        assert_eq!(translate_exit_status(exited(64)), TestOutcome::Diff);
    }

    #[test]
    fn test_normal_lifecycle() {
        let mut status = TestStatus::new();
        assert!(status.is_not_run());
        assert_eq!(status.outcome(), None);

        status.start_running().unwrap();
        assert!(status.is_running());
        assert!(status.start_date().is_some());
        assert_eq!(status.result_status(), ResultStatus::NotDone);

        status.mark_done(exited(0)).unwrap();
        assert_eq!(status.outcome(), Some(TestOutcome::Pass));
        assert!(status.runtime().is_some());
        assert_eq!(status.result_status(), ResultStatus::Pass);
    }

    #[test]
    fn test_timeout_lifecycle() {
        let mut status = TestStatus::new();
        status.start_running().unwrap();
        status.mark_timed_out().unwrap();
        assert_eq!(status.state(), TestState::Done(TestOutcome::Timeout));
        assert_eq!(status.result_status().keywords(), &["timeout", "fail"]);
    }

    #[test]
    fn test_terminal_states_reject_transitions() {
        let mut status = TestStatus::new();
        status.start_running().unwrap();
        status.mark_done(exited(1)).unwrap();

        assert!(status.start_running().is_err());
        assert!(status.mark_timed_out().is_err());
        assert!(status.mark_skipped(SkipReason::Keyword).is_err());
        assert_eq!(status.outcome(), Some(TestOutcome::Fail));

        let mut skipped = TestStatus::new();
        skipped.mark_skipped(SkipReason::Platform).unwrap();
        assert_eq!(
            skipped.start_running(),
            Err(StatusError::InvalidTransition {
                from: "skip",
                to: "running"
            })
        );
        assert_eq!(skipped.skip_reason(), Some(SkipReason::Platform));
    }

    #[test]
    fn test_done_requires_running() {
        let mut status = TestStatus::new();
        assert!(status.mark_done(exited(0)).is_err());
        assert!(status.is_not_run());
    }

    #[test]
    fn test_done_previously() {
        let status = TestStatus::done_previously(TestOutcome::Diff, Some(Duration::from_secs(3)));
        assert!(status.is_settled());
        assert_eq!(status.result_status(), ResultStatus::Diff);
        assert_eq!(status.runtime(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_skip_reason_serde() {
        let reason: SkipReason = serde_json::from_str("\"max-processors\"").unwrap();
        assert_eq!(reason, SkipReason::MaxProcessors);
        assert_eq!(reason.to_string(), "exceeds max processors");
    }
}
