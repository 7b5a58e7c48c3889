//! Test records: one concrete, parameter-instantiated test.
//!
//! A [`TestRecord`] is everything the execution core needs to know about a
//! test before it runs: where it lives, how it is parameterized, what it
//! depends on and how to launch it. Runtime state lives separately in
//! [`TestStatus`](crate::status::TestStatus).
//!
//! # Execute Directory
//!
//! Each record has a unique *execute directory*, relative to the test
//! results root, derived from its source file and parameters:
//!
//! ```text
//! file_path = "sub/dir/heat.vvt", name = "heat", params = {np: 4, dt: 0.1}
//! execute_directory = "sub/dir/heat.dt=0.1.np=4"
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Lexically normalizes a `/`-separated relative path.
///
/// Collapses repeated separators, drops `.` components and resolves `..`
/// against the preceding component. An empty result is `"."`.
pub fn normpath(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => match parts.last() {
                Some(&last) if last != ".." => {
                    parts.pop();
                }
                _ if absolute => {}
                _ => parts.push(".."),
            },
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{}", joined)
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Free-form attribute values attached to a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

/// A dependency declaration as written by the test author.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyPattern {
    /// Glob naming other tests by execute directory.
    pub pattern: String,

    /// Result filter the matched tests must satisfy, e.g. `"pass or diff"`.
    #[serde(default)]
    pub result: Option<String>,
}

/// A working file placed in the execute directory before launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingFile {
    /// Source path relative to the directory holding the test file. May be a
    /// glob when `dest` is unset.
    pub src: String,

    /// Name in the execute directory; defaults to the source file name.
    #[serde(default)]
    pub dest: Option<String>,
}

/// One concrete test instance.
#[derive(Debug, Clone)]
pub struct TestRecord {
    name: String,
    root_path: PathBuf,
    file_path: String,
    xdir: String,
    params: BTreeMap<String, String>,
    keywords: BTreeSet<String>,
    timeout: Option<u64>,
    runtime: Option<u64>,
    dependencies: Vec<DependencyPattern>,
    parent: Option<String>,
    analyze: bool,
    command: Option<Vec<String>>,
    baseline_command: Option<Vec<String>>,
    link_files: Vec<WorkingFile>,
    copy_files: Vec<WorkingFile>,
    attrs: BTreeMap<String, AttrValue>,
}

impl TestRecord {
    /// Creates a record for test `name` defined in `file_path` (relative to
    /// `root_path`).
    pub fn new(
        name: impl Into<String>,
        root_path: impl Into<PathBuf>,
        file_path: impl Into<String>,
    ) -> Self {
        let mut record = Self {
            name: name.into(),
            root_path: root_path.into(),
            file_path: file_path.into(),
            xdir: String::new(),
            params: BTreeMap::new(),
            keywords: BTreeSet::new(),
            timeout: None,
            runtime: None,
            dependencies: Vec::new(),
            parent: None,
            analyze: false,
            command: None,
            baseline_command: None,
            link_files: Vec::new(),
            copy_files: Vec::new(),
            attrs: BTreeMap::new(),
        };
        record.xdir = record.compute_execute_directory();
        record
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self.xdir = self.compute_execute_directory();
        self
    }

    pub fn with_keyword(mut self, keyword: impl Into<String>) -> Self {
        self.keywords.insert(keyword.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Some(secs);
        self
    }

    pub fn with_runtime(mut self, secs: u64) -> Self {
        self.runtime = Some(secs);
        self
    }

    pub fn with_dependency(mut self, pattern: impl Into<String>, result: Option<&str>) -> Self {
        self.dependencies.push(DependencyPattern {
            pattern: pattern.into(),
            result: result.map(str::to_string),
        });
        self
    }

    pub fn with_analyze(mut self, analyze: bool) -> Self {
        self.analyze = analyze;
        self
    }

    pub fn with_command<I, S>(mut self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = Some(argv.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_baseline_command<I, S>(mut self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.baseline_command = Some(argv.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_link_file(mut self, file: WorkingFile) -> Self {
        self.link_files.push(file);
        self
    }

    pub fn with_copy_file(mut self, file: WorkingFile) -> Self {
        self.copy_files.push(file);
        self
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: AttrValue) -> Self {
        self.attrs.insert(name.into(), value);
        self
    }

    pub(crate) fn set_parent(&mut self, parent_xdir: Option<String>) {
        self.parent = parent_xdir;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    /// Source file path relative to the root.
    pub fn file_path(&self) -> &str {
        &self.file_path
    }

    /// Directory containing the source file, as an absolute path.
    pub fn source_dir(&self) -> PathBuf {
        let file = self.root_path.join(&self.file_path);
        file.parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root_path.clone())
    }

    /// Unique execute directory, relative to the test results root.
    pub fn execute_directory(&self) -> &str {
        &self.xdir
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// Number of processors the test needs, from the `np` parameter.
    /// Missing or unparseable values count as zero.
    pub fn np(&self) -> u32 {
        self.param("np")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    pub fn keywords(&self) -> &BTreeSet<String> {
        &self.keywords
    }

    pub fn has_keyword(&self, keyword: &str) -> bool {
        self.keywords.contains(keyword)
    }

    /// Declared timeout in seconds; `None` when unknown or zero.
    pub fn timeout(&self) -> Option<u64> {
        self.timeout.filter(|&t| t > 0)
    }

    /// Last-known runtime in seconds.
    pub fn runtime(&self) -> Option<u64> {
        self.runtime
    }

    pub fn dependencies(&self) -> &[DependencyPattern] {
        &self.dependencies
    }

    /// Execute directory of the analyze test aggregating this one.
    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn is_analyze(&self) -> bool {
        self.analyze
    }

    pub fn command(&self) -> Option<&[String]> {
        self.command.as_deref()
    }

    pub fn baseline_command(&self) -> Option<&[String]> {
        self.baseline_command.as_deref()
    }

    pub fn link_files(&self) -> &[WorkingFile] {
        &self.link_files
    }

    pub fn copy_files(&self) -> &[WorkingFile] {
        &self.copy_files
    }

    pub fn attrs(&self) -> &BTreeMap<String, AttrValue> {
        &self.attrs
    }

    /// Identifies the parameterize/analyze group this record belongs to.
    pub fn group_key(&self) -> (String, String) {
        (self.file_path.clone(), self.name.clone())
    }

    fn compute_execute_directory(&self) -> String {
        let dir = Path::new(&self.file_path)
            .parent()
            .map(|p| {
                p.components()
                    .filter_map(|c| match c {
                        Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                        Component::ParentDir => Some("..".to_string()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("/")
            })
            .unwrap_or_default();

        let mut leaf = self.name.clone();
        if !self.params.is_empty() {
            let mut pairs: Vec<String> = self
                .params
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            pairs.sort();
            leaf.push('.');
            leaf.push_str(&pairs.join("."));
        }

        if dir.is_empty() {
            normpath(&leaf)
        } else {
            normpath(&format!("{}/{}", dir, leaf))
        }
    }
}
