//! The test list: every known test case, loaded from a manifest.
//!
//! Test cases live in a single arena indexed by [`TestId`]. Dependency edges,
//! analyze groups and the scheduler's queues all refer to cases by id, so no
//! case ever holds a reference to another.
//!
//! # Manifest Format
//!
//! The manifest stands in for the test-file parsing layer. It lists fully
//! instantiated tests:
//!
//! ```toml
//! root = "."                   # optional, relative to the manifest
//!
//! [[test]]
//! name = "heat"
//! file = "sub/heat.vvt"
//! params = { np = 4 }
//! keywords = ["fast"]
//! timeout = 120
//! runtime = 35                 # last known runtime, for ordering
//! command = ["sh", "heat.sh"]
//! depends_on = [{ pattern = "mesh*", result = "pass or diff" }]
//! link = [{ src = "input.txt" }]
//!
//! [[test]]
//! name = "heat"
//! file = "sub/heat.vvt"
//! analyze = true
//! command = ["sh", "collect.sh"]
//! ```
//!
//! A test may also carry `result = "pass"` (a result from an earlier run,
//! never rescheduled) or `skip = "platform"` (already filtered out).

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::depend::{DependencySet, WordExpression};
use crate::orchestrator::supervisor::ProcessSupervisor;
use crate::record::{AttrValue, DependencyPattern, TestRecord, WorkingFile};
use crate::status::{SkipReason, TestOutcome, TestStatus};

/// Index of a test case in its [`TestList`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TestId(pub usize);

/// Errors raised while building a test list.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("failed to read manifest {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse manifest: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("duplicate execute directory '{0}'")]
    DuplicateExecuteDirectory(String),

    #[error("test '{test}' has an invalid dependency result expression: {source}")]
    InvalidResultExpression {
        test: String,
        #[source]
        source: crate::depend::ExprError,
    },

    #[error("test '{test}' has an invalid initial state: {reason}")]
    InvalidState { test: String, reason: String },
}

/// A test record together with its run state.
#[derive(Debug)]
pub struct TestCase {
    record: TestRecord,
    status: TestStatus,
    deps: DependencySet,
    has_dependent: bool,
    exec: Option<ProcessSupervisor>,
}

impl TestCase {
    pub fn new(record: TestRecord) -> Self {
        Self::with_status(record, TestStatus::new())
    }

    pub fn with_status(record: TestRecord, status: TestStatus) -> Self {
        Self {
            record,
            status,
            deps: DependencySet::new(),
            has_dependent: false,
            exec: None,
        }
    }

    pub fn record(&self) -> &TestRecord {
        &self.record
    }

    pub(crate) fn record_mut(&mut self) -> &mut TestRecord {
        &mut self.record
    }

    pub fn status(&self) -> &TestStatus {
        &self.status
    }

    pub fn status_mut(&mut self) -> &mut TestStatus {
        &mut self.status
    }

    pub fn deps(&self) -> &DependencySet {
        &self.deps
    }

    pub fn deps_mut(&mut self) -> &mut DependencySet {
        &mut self.deps
    }

    /// Whether another test depends on this one.
    pub fn has_dependent(&self) -> bool {
        self.has_dependent
    }

    pub fn set_has_dependent(&mut self) {
        self.has_dependent = true;
    }

    /// The supervisor of the running child, if any.
    pub fn exec(&self) -> Option<&ProcessSupervisor> {
        self.exec.as_ref()
    }

    pub(crate) fn set_exec(&mut self, exec: ProcessSupervisor) {
        self.exec = Some(exec);
    }

    pub(crate) fn take_exec(&mut self) -> Option<ProcessSupervisor> {
        self.exec.take()
    }

    /// Splits the case into the pieces a supervisor poll needs at once.
    pub(crate) fn exec_parts(&mut self) -> (Option<&mut ProcessSupervisor>, &mut TestStatus, bool) {
        (self.exec.as_mut(), &mut self.status, self.has_dependent)
    }
}

/// Arena of test cases keyed by execute directory.
#[derive(Debug, Default)]
pub struct TestList {
    cases: Vec<TestCase>,
    index: HashMap<String, TestId>,
}

impl TestList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a not-yet-run test.
    pub fn add(&mut self, record: TestRecord) -> Result<TestId, ManifestError> {
        self.add_case(TestCase::new(record))
    }

    pub fn add_case(&mut self, case: TestCase) -> Result<TestId, ManifestError> {
        let xdir = case.record.execute_directory().to_string();
        if self.index.contains_key(&xdir) {
            return Err(ManifestError::DuplicateExecuteDirectory(xdir));
        }
        let id = TestId(self.cases.len());
        self.index.insert(xdir, id);
        self.cases.push(case);
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = TestId> + use<> {
        (0..self.cases.len()).map(TestId)
    }

    pub fn cases(&self) -> &[TestCase] {
        &self.cases
    }

    pub fn case(&self, id: TestId) -> &TestCase {
        &self.cases[id.0]
    }

    pub fn case_mut(&mut self, id: TestId) -> &mut TestCase {
        &mut self.cases[id.0]
    }

    pub fn find(&self, xdir: &str) -> Option<TestId> {
        self.index.get(xdir).copied()
    }

    /// Execute directories of every known test, in insertion order.
    pub fn execute_directories(&self) -> impl Iterator<Item = &str> {
        self.cases.iter().map(|c| c.record.execute_directory())
    }

    /// Analyze tests with the ids of the group members they aggregate.
    ///
    /// Members skipped by a parameter filter are not part of the group.
    pub fn analyze_groups(&self) -> Vec<(TestId, Vec<TestId>)> {
        let mut members: HashMap<(String, String), Vec<TestId>> = HashMap::new();
        for id in self.ids() {
            let case = self.case(id);
            if case.record.is_analyze()
                || case.status.skip_reason() == Some(SkipReason::Parameter)
            {
                continue;
            }
            members.entry(case.record.group_key()).or_default().push(id);
        }

        self.ids()
            .filter(|&id| self.case(id).record.is_analyze())
            .map(|id| {
                let children = members
                    .get(&self.case(id).record.group_key())
                    .cloned()
                    .unwrap_or_default();
                (id, children)
            })
            .collect()
    }

    /// Skips tests whose keywords (and name) do not satisfy `expr`.
    pub fn apply_keyword_filter(&mut self, expr: &WordExpression) {
        for case in self.cases.iter_mut().filter(|c| c.status.is_not_run()) {
            let record = &case.record;
            let selected = expr.evaluate(|w| record.has_keyword(w) || record.name() == w);
            if !selected {
                debug!("skipping {} by keyword", record.execute_directory());
                let _ = case.status.mark_skipped(SkipReason::Keyword);
            }
        }
    }

    /// Skips tests that need more processors than the platform has.
    pub fn apply_max_procs(&mut self, max_procs: u32) {
        for case in self.cases.iter_mut().filter(|c| c.status.is_not_run()) {
            if case.record.np() > max_procs {
                debug!(
                    "skipping {}: np={} exceeds {}",
                    case.record.execute_directory(),
                    case.record.np(),
                    max_procs
                );
                let _ = case.status.mark_skipped(SkipReason::MaxProcessors);
            }
        }
    }

    /// Loads a manifest file. Relative roots resolve against the manifest's
    /// directory.
    pub fn load_manifest(path: &Path) -> Result<Self, ManifestError> {
        let content = std::fs::read_to_string(path).map_err(|source| ManifestError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::from_manifest_str(&content, &base)
    }

    /// Builds a test list from manifest text.
    pub fn from_manifest_str(content: &str, base_dir: &Path) -> Result<Self, ManifestError> {
        let manifest: Manifest = toml::from_str(content)?;
        let root = match &manifest.root {
            Some(root) => {
                let expanded = shellexpand::tilde(root).into_owned();
                base_dir.join(expanded)
            }
            None => base_dir.to_path_buf(),
        };

        let mut tlist = TestList::new();
        for entry in manifest.tests {
            let case = entry.into_case(&root)?;
            tlist.add_case(case)?;
        }
        debug!("loaded {} tests from manifest", tlist.len());
        Ok(tlist)
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct Manifest {
    #[serde(default)]
    root: Option<String>,

    #[serde(default, rename = "test")]
    tests: Vec<ManifestTest>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct ManifestTest {
    name: String,
    file: String,
    #[serde(default)]
    params: BTreeMap<String, AttrValue>,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    timeout: Option<u64>,
    #[serde(default)]
    runtime: Option<u64>,
    #[serde(default)]
    analyze: bool,
    #[serde(default)]
    command: Option<Vec<String>>,
    #[serde(default)]
    baseline: Option<Vec<String>>,
    #[serde(default)]
    depends_on: Vec<DependencyPattern>,
    #[serde(default)]
    link: Vec<WorkingFile>,
    #[serde(default)]
    copy: Vec<WorkingFile>,
    #[serde(default)]
    attrs: BTreeMap<String, AttrValue>,
    #[serde(default)]
    result: Option<TestOutcome>,
    #[serde(default)]
    skip: Option<SkipReason>,
}

impl ManifestTest {
    fn into_case(self, root: &Path) -> Result<TestCase, ManifestError> {
        for dep in &self.depends_on {
            if let Some(result) = &dep.result {
                WordExpression::parse(result).map_err(|source| {
                    ManifestError::InvalidResultExpression {
                        test: self.name.clone(),
                        source,
                    }
                })?;
            }
        }

        let mut record = TestRecord::new(&self.name, root, &self.file).with_analyze(self.analyze);
        for (k, v) in self.params {
            record = record.with_param(k, param_string(&v));
        }
        for kw in self.keywords {
            record = record.with_keyword(kw);
        }
        if let Some(t) = self.timeout {
            record = record.with_timeout(t);
        }
        if let Some(r) = self.runtime {
            record = record.with_runtime(r);
        }
        if let Some(cmd) = self.command {
            record = record.with_command(cmd);
        }
        if let Some(cmd) = self.baseline {
            record = record.with_baseline_command(cmd);
        }
        for dep in self.depends_on {
            record = record.with_dependency(dep.pattern, dep.result.as_deref());
        }
        for f in self.link {
            record = record.with_link_file(f);
        }
        for f in self.copy {
            record = record.with_copy_file(f);
        }
        for (k, v) in self.attrs {
            record = record.with_attr(k, v);
        }

        let status = match (self.result, self.skip) {
            (Some(_), Some(_)) => {
                return Err(ManifestError::InvalidState {
                    test: self.name,
                    reason: "both 'result' and 'skip' are set".to_string(),
                });
            }
            (Some(outcome), None) => {
                TestStatus::done_previously(outcome, self.runtime.map(Duration::from_secs))
            }
            (None, Some(reason)) => {
                let mut status = TestStatus::new();
                let _ = status.mark_skipped(reason);
                status
            }
            (None, None) => TestStatus::new(),
        };

        Ok(TestCase::with_status(record, status))
    }
}

fn param_string(value: &AttrValue) -> String {
    match value {
        AttrValue::Bool(b) => b.to_string(),
        AttrValue::Int(i) => i.to_string(),
        AttrValue::Float(f) => f.to_string(),
        AttrValue::Str(s) => s.clone(),
    }
}
