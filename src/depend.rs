//! Inter-test dependencies.
//!
//! A test may depend on other tests, named by execute-directory glob (see
//! [`matching`]). Each edge optionally carries a result filter, a
//! [`WordExpression`] evaluated against the target's result word. Without
//! one, the target must finish with `pass` or `diff`.
//!
//! [`DependencySet::get_blocking`] tells the scheduler whether a test may
//! start:
//!
//! | Targets | Answer |
//! |---------|--------|
//! | some target not yet settled | [`Blocking::Waiting`] (first such, in order) |
//! | all settled, one fails its filter | [`Blocking::Failed`] (first such, in order) |
//! | all settled and satisfied | `None` |
//!
//! A skipped target reports the word `skip`, which the default filter
//! rejects.

pub mod expr;
pub mod matching;

pub use expr::{ExprError, WordExpression};
pub use matching::{ShellGlob, find_tests_by_execute_directory_match};

use crate::status::TestStatus;
use crate::testlist::TestId;

/// One dependency edge.
#[derive(Debug, Clone)]
pub struct TestDependency {
    target: TestId,
    target_xdir: String,
    match_pattern: Option<String>,
    result_expr: Option<WordExpression>,
}

impl TestDependency {
    pub fn new(target: TestId, target_xdir: impl Into<String>) -> Self {
        Self {
            target,
            target_xdir: target_xdir.into(),
            match_pattern: None,
            result_expr: None,
        }
    }

    /// Records the glob the target was matched with.
    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.match_pattern = Some(pattern.into());
        self
    }

    /// Sets the result filter the target must satisfy.
    pub fn with_result_expr(mut self, expr: WordExpression) -> Self {
        self.result_expr = Some(expr);
        self
    }

    pub fn target(&self) -> TestId {
        self.target
    }

    pub fn target_xdir(&self) -> &str {
        &self.target_xdir
    }

    pub fn match_pattern(&self) -> Option<&str> {
        self.match_pattern.as_deref()
    }

    pub fn result_expr(&self) -> Option<&WordExpression> {
        self.result_expr.as_ref()
    }

    /// Whether a settled target's status passes this edge's filter.
    pub fn is_satisfied_by(&self, status: &TestStatus) -> bool {
        let word = status.result_status().as_str();
        match &self.result_expr {
            Some(expr) => expr.evaluate(|w| w == word),
            None => word == "pass" || word == "diff",
        }
    }
}

/// Why a test cannot start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Blocking {
    /// The target has not finished yet.
    Waiting(TestId),
    /// The target finished with a result the edge does not accept. The
    /// dependent can never run.
    Failed(TestId),
}

impl Blocking {
    pub fn target(&self) -> TestId {
        match self {
            Blocking::Waiting(id) | Blocking::Failed(id) => *id,
        }
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Blocking::Failed(_))
    }
}

/// Ordered dependencies of a single test.
#[derive(Debug, Clone, Default)]
pub struct DependencySet {
    deps: Vec<TestDependency>,
}

impl DependencySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an edge. An edge to an execute directory already present
    /// replaces the earlier one in place.
    pub fn add(&mut self, dep: TestDependency) {
        match self
            .deps
            .iter_mut()
            .find(|d| d.target_xdir == dep.target_xdir)
        {
            Some(existing) => *existing = dep,
            None => self.deps.push(dep),
        }
    }

    pub fn len(&self) -> usize {
        self.deps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deps.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TestDependency> {
        self.deps.iter()
    }

    /// Returns the first reason the owning test cannot start, if any.
    ///
    /// `status_of` resolves a target id to its current status.
    pub fn get_blocking<'a, F>(&self, status_of: F) -> Option<Blocking>
    where
        F: Fn(TestId) -> &'a TestStatus,
    {
        if let Some(dep) = self.deps.iter().find(|d| !status_of(d.target).is_settled()) {
            return Some(Blocking::Waiting(dep.target));
        }
        self.deps
            .iter()
            .find(|d| !d.is_satisfied_by(status_of(d.target)))
            .map(|d| Blocking::Failed(d.target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{SkipReason, TestOutcome};

    fn done(outcome: TestOutcome) -> TestStatus {
        TestStatus::done_previously(outcome, None)
    }

    fn running() -> TestStatus {
        let mut status = TestStatus::new();
        status.start_running().unwrap();
        status
    }

    fn dep(id: usize, xdir: &str) -> TestDependency {
        TestDependency::new(TestId(id), xdir)
    }

    #[test]
    fn test_add_replaces_same_target() {
        let mut set = DependencySet::new();
        set.add(dep(0, "a"));
        set.add(dep(1, "b"));
        set.add(dep(0, "a").with_result_expr(WordExpression::parse("fail").unwrap()));

        assert_eq!(set.len(), 2);
        let first = set.iter().next().unwrap();
        assert_eq!(first.target_xdir(), "a");
        assert_eq!(first.result_expr().unwrap().as_str(), "fail");
    }

    #[test]
    fn test_default_filter() {
        let d = dep(0, "a");
        assert!(d.is_satisfied_by(&done(TestOutcome::Pass)));
        assert!(d.is_satisfied_by(&done(TestOutcome::Diff)));
        assert!(!d.is_satisfied_by(&done(TestOutcome::Fail)));
        assert!(!d.is_satisfied_by(&done(TestOutcome::Timeout)));

        let mut skipped = TestStatus::new();
        skipped.mark_skipped(SkipReason::Keyword).unwrap();
        assert!(!d.is_satisfied_by(&skipped));
    }

    #[test]
    fn test_expression_filter() {
        let d = dep(0, "a").with_result_expr(WordExpression::parse("fail or timeout").unwrap());
        assert!(d.is_satisfied_by(&done(TestOutcome::Timeout)));
        assert!(!d.is_satisfied_by(&done(TestOutcome::Pass)));
    }

    #[test]
    fn test_get_blocking_waits_before_failing() {
        let statuses = [done(TestOutcome::Fail), running(), done(TestOutcome::Pass)];
        let mut set = DependencySet::new();
        set.add(dep(0, "a"));
        set.add(dep(1, "b"));
        set.add(dep(2, "c"));

        let lookup = |id: TestId| &statuses[id.0];
        assert_eq!(set.get_blocking(lookup), Some(Blocking::Waiting(TestId(1))));
    }

    #[test]
    fn test_get_blocking_failed() {
        let statuses = [done(TestOutcome::Pass), done(TestOutcome::Fail)];
        let mut set = DependencySet::new();
        set.add(dep(0, "a"));
        set.add(dep(1, "b"));

        let blocking = set.get_blocking(|id| &statuses[id.0]).unwrap();
        assert_eq!(blocking, Blocking::Failed(TestId(1)));
        assert!(blocking.is_permanent());
    }

    #[test]
    fn test_get_blocking_clear() {
        let statuses = [done(TestOutcome::Pass), done(TestOutcome::Diff)];
        let mut set = DependencySet::new();
        set.add(dep(0, "a"));
        set.add(dep(1, "b"));
        assert_eq!(set.get_blocking(|id| &statuses[id.0]), None);

        let empty = DependencySet::new();
        assert_eq!(empty.get_blocking(|id| &statuses[id.0]), None);
    }
}
