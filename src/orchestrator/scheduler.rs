//! Processor-aware test scheduling.
//!
//! [`TestExecutionList`] holds every test that still has to run, bucketed by
//! processor count. Within a bucket tests are ordered longest last-known
//! runtime first, so long tests do not start at the tail of the run and
//! stretch its wall time.
//!
//! # Selection
//!
//! [`pop_next`](TestExecutionList::pop_next) walks buckets from the largest
//! processor count to the smallest, considering only buckets the platform
//! can fit right now, and returns the first test whose dependencies are all
//! satisfied:
//!
//! | Situation | Result |
//! |-----------|--------|
//! | a fitting test is unblocked | that test, moved to `started` |
//! | nothing fits but tests are running | `None`, try again next tick |
//! | nothing fits and nothing runs | second pass ignoring capacity |
//! | a test's dependency settled badly | test skipped, moved to `stopped` |
//!
//! The second pass keeps tests larger than the whole machine from waiting
//! forever; they run alone and oversubscribe.
//!
//! Every active test is in exactly one of the queue, `started` or
//! `stopped`.

use std::collections::BTreeMap;

use indexmap::IndexMap;
use tracing::{debug, info, warn};

use super::handler::ExecutionHandler;
use super::proctree::ProcessTree;
use super::supervisor::{ExecError, ProcessSupervisor};
use crate::depend::{
    Blocking, TestDependency, WordExpression, find_tests_by_execute_directory_match,
};
use crate::platform::ResourceManager;
use crate::report::ResultsSink;
use crate::status::{SkipReason, TestOutcome};
use crate::testlist::{ManifestError, TestId, TestList};

/// The scheduler's view of a run.
#[derive(Debug)]
pub struct TestExecutionList {
    tlist: TestList,
    handler: ExecutionHandler,
    backlog: BTreeMap<u32, Vec<TestId>>,
    started: IndexMap<String, TestId>,
    stopped: IndexMap<String, TestId>,
    newly_skipped: Vec<TestId>,
    num_active: usize,
}

impl TestExecutionList {
    /// Connects dependencies and queues every test that has not run.
    pub fn new(mut tlist: TestList, handler: ExecutionHandler) -> Result<Self, ManifestError> {
        connect_analyze_groups(&mut tlist);
        connect_general_dependencies(&mut tlist)?;
        mark_tests_with_dependents(&mut tlist);

        let mut backlog: BTreeMap<u32, Vec<TestId>> = BTreeMap::new();
        for id in tlist.ids() {
            let case = tlist.case(id);
            if case.status().is_not_run() {
                backlog.entry(case.record().np()).or_default().push(id);
            }
        }
        for ids in backlog.values_mut() {
            ids.sort_by(|&a, &b| {
                let (ra, rb) = (tlist.case(a).record(), tlist.case(b).record());
                rb.runtime()
                    .unwrap_or(0)
                    .cmp(&ra.runtime().unwrap_or(0))
                    .then_with(|| ra.execute_directory().cmp(rb.execute_directory()))
            });
        }
        let num_active = backlog.values().map(Vec::len).sum();
        debug!(
            "{} active tests in {} processor buckets",
            num_active,
            backlog.len()
        );

        Ok(Self {
            tlist,
            handler,
            backlog,
            started: IndexMap::new(),
            stopped: IndexMap::new(),
            newly_skipped: Vec::new(),
            num_active,
        })
    }

    pub fn tlist(&self) -> &TestList {
        &self.tlist
    }

    pub(crate) fn tlist_mut(&mut self) -> &mut TestList {
        &mut self.tlist
    }

    pub fn handler(&self) -> &ExecutionHandler {
        &self.handler
    }

    /// Creates the execute directory of every queued test.
    pub fn create_test_execs(&self) -> Result<(), ExecError> {
        for ids in self.backlog.values() {
            for &id in ids {
                let record = self.tlist.case(id).record();
                self.handler
                    .create_exec_dir(record)
                    .map_err(|source| ExecError::CreateDir {
                        path: self.handler.exec_dir(record),
                        source,
                    })?;
            }
        }
        Ok(())
    }

    /// Returns the next test to start, or `None` when nothing can start
    /// now.
    pub fn pop_next(&mut self, platform: &dyn ResourceManager) -> Option<TestId> {
        self.skip_permanently_blocked();

        let mut next = self.find_unblocked(Some(platform));
        if next.is_none() && self.started.is_empty() {
            next = self.find_unblocked(None);
        }
        let (np, index) = next?;

        let id = self.remove_queued(np, index);
        let xdir = self.tlist.case(id).record().execute_directory().to_string();
        self.started.insert(xdir, id);
        Some(id)
    }

    fn find_unblocked(&self, platform: Option<&dyn ResourceManager>) -> Option<(u32, usize)> {
        for (&np, ids) in self.backlog.iter().rev() {
            if platform.is_some_and(|p| !p.query_procs(np)) {
                continue;
            }
            if let Some(index) = ids.iter().position(|&id| self.blocking(id).is_none()) {
                return Some((np, index));
            }
        }
        None
    }

    fn remove_queued(&mut self, np: u32, index: usize) -> TestId {
        let bucket = self.backlog.entry(np).or_default();
        let id = bucket.remove(index);
        if bucket.is_empty() {
            self.backlog.remove(&np);
        }
        id
    }

    /// The first dependency keeping `id` from starting.
    pub fn blocking(&self, id: TestId) -> Option<Blocking> {
        self.tlist
            .case(id)
            .deps()
            .get_blocking(|target| self.tlist.case(target).status())
    }

    /// Skips queued tests whose dependencies finished with an unacceptable
    /// result. Repeats until stable, since a skip can doom further tests.
    fn skip_permanently_blocked(&mut self) {
        loop {
            let doomed: Vec<(u32, TestId)> = self
                .backlog
                .iter()
                .flat_map(|(&np, ids)| ids.iter().map(move |&id| (np, id)))
                .filter(|&(_, id)| self.blocking(id).is_some_and(|b| b.is_permanent()))
                .collect();
            if doomed.is_empty() {
                return;
            }

            for (np, id) in doomed {
                if let Some(bucket) = self.backlog.get_mut(&np) {
                    bucket.retain(|&other| other != id);
                    if bucket.is_empty() {
                        self.backlog.remove(&np);
                    }
                }
                let case = self.tlist.case_mut(id);
                if let Err(e) = case.status_mut().mark_skipped(SkipReason::Dependency) {
                    warn!("{}: {}", case.record().execute_directory(), e);
                }
                let xdir = case.record().execute_directory().to_string();
                info!("skipping {}: dependency did not pass", xdir);
                self.stopped.insert(xdir, id);
                self.newly_skipped.push(id);
            }
        }
    }

    /// Tests skipped for their dependencies since the last call.
    pub fn take_skipped(&mut self) -> Vec<TestId> {
        std::mem::take(&mut self.newly_skipped)
    }

    /// Launches a test returned by [`pop_next`](Self::pop_next).
    ///
    /// A launch failure does not propagate: the test is recorded as `fail`
    /// and will be reported done by the next [`poll_test`](Self::poll_test).
    pub fn start_test(&mut self, id: TestId, platform: &mut dyn ResourceManager) {
        let handler = &self.handler;
        let case = self.tlist.case_mut(id);
        if let Err(e) = case.status_mut().start_running() {
            warn!("{}: {}", case.record().execute_directory(), e);
            return;
        }

        match ProcessSupervisor::start(case.record(), handler, platform) {
            Ok(exec) => case.set_exec(exec),
            Err(e) => {
                warn!("{}: {}", case.record().execute_directory(), e);
                if let Err(e) = case.status_mut().finish(TestOutcome::Fail) {
                    warn!("{}: {}", case.record().execute_directory(), e);
                }
            }
        }
    }

    /// Checks a started test without blocking. Returns true once it is done.
    pub fn poll_test(&mut self, id: TestId, platform: &mut dyn ResourceManager) -> bool {
        let case = self.tlist.case_mut(id);
        match case.exec_parts() {
            (Some(exec), status, has_dependent) => exec.poll(status, has_dependent, platform),
            (None, status, _) => status.is_settled(),
        }
    }

    /// Terminates a started test and everything it spawned.
    pub async fn kill_test(
        &mut self,
        id: TestId,
        tree: &ProcessTree,
        platform: &mut dyn ResourceManager,
    ) {
        let case = self.tlist.case_mut(id);
        if let (Some(exec), status, _) = case.exec_parts() {
            exec.kill_job(tree, status, platform).await;
        }
    }

    /// Retires a finished test and hands it to `sink`.
    pub fn test_done(&mut self, id: TestId, sink: &mut dyn ResultsSink) {
        let case = self.tlist.case_mut(id);
        case.take_exec();
        let xdir = case.record().execute_directory().to_string();
        if self.started.shift_remove(&xdir).is_none() {
            warn!("{} retired without being started", xdir);
        }
        sink.append_test_result(self.tlist.case(id));
        self.stopped.insert(xdir, id);
    }

    pub fn num_active(&self) -> usize {
        self.num_active
    }

    pub fn num_running(&self) -> usize {
        self.started.len()
    }

    pub fn num_done(&self) -> usize {
        self.stopped.len()
    }

    pub fn num_queued(&self) -> usize {
        self.backlog.values().map(Vec::len).sum()
    }

    /// Started tests, in start order.
    pub fn get_running(&self) -> Vec<TestId> {
        self.started.values().copied().collect()
    }

    /// Retired tests, in completion order.
    pub fn get_stopped(&self) -> Vec<TestId> {
        self.stopped.values().copied().collect()
    }

    /// Empties the queue, returning what was left in it.
    pub fn pop_remaining(&mut self) -> Vec<TestId> {
        std::mem::take(&mut self.backlog)
            .into_values()
            .flatten()
            .collect()
    }
}

/// Makes each analyze test depend on the members of its parameter group.
fn connect_analyze_groups(tlist: &mut TestList) {
    for (analyze, children) in tlist.analyze_groups() {
        let parent_xdir = tlist.case(analyze).record().execute_directory().to_string();
        for child in children {
            let child_xdir = tlist.case(child).record().execute_directory().to_string();
            tlist
                .case_mut(child)
                .record_mut()
                .set_parent(Some(parent_xdir.clone()));
            tlist
                .case_mut(analyze)
                .deps_mut()
                .add(TestDependency::new(child, child_xdir));
        }
    }
}

/// Resolves each declared dependency pattern against every known execute
/// directory, run or not.
fn connect_general_dependencies(tlist: &mut TestList) -> Result<(), ManifestError> {
    let xdirs: Vec<String> = tlist.execute_directories().map(str::to_string).collect();

    for id in tlist.ids() {
        let record = tlist.case(id).record();
        if record.dependencies().is_empty() {
            continue;
        }
        let xdir = record.execute_directory().to_string();

        let mut edges = Vec::new();
        for dep in record.dependencies() {
            let expr = dep
                .result
                .as_deref()
                .map(WordExpression::parse)
                .transpose()
                .map_err(|source| ManifestError::InvalidResultExpression {
                    test: record.name().to_string(),
                    source,
                })?;

            let matches = find_tests_by_execute_directory_match(
                &xdir,
                &dep.pattern,
                xdirs.iter().map(String::as_str),
            );
            if matches.is_empty() {
                debug!("{}: dependency '{}' matched no tests", xdir, dep.pattern);
            }
            for target_xdir in matches {
                let Some(target) = tlist.find(&target_xdir) else {
                    continue;
                };
                if target == id {
                    continue;
                }
                let mut edge = TestDependency::new(target, target_xdir).with_pattern(&dep.pattern);
                if let Some(expr) = &expr {
                    edge = edge.with_result_expr(expr.clone());
                }
                edges.push(edge);
            }
        }

        let deps = tlist.case_mut(id).deps_mut();
        for edge in edges {
            deps.add(edge);
        }
    }
    Ok(())
}

fn mark_tests_with_dependents(tlist: &mut TestList) {
    let targets: Vec<TestId> = tlist
        .cases()
        .iter()
        .flat_map(|c| c.deps().iter().map(TestDependency::target))
        .collect();
    for target in targets {
        tlist.case_mut(target).set_has_dependent();
    }
}
