//! Configuration schema definitions for vvtest.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files. Every section and field has a default, so an
//! empty file (or no file at all) is a valid configuration.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── VvtestConfig           - Execution settings (directories, timing, cleaning)
//! ├── PlatformConfig         - Tagged enum selecting the processor pool
//! │   ├── Local              - Processors of this machine
//! │   ├── Mpi                - Local processors, MPI machine files
//! │   └── Ssh                - Processors spread over remote hosts
//! └── ReportConfig           - Output and reporting settings
//! ```

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration structure for vvtest.
///
/// # TOML Structure
///
/// ```toml
/// [vvtest]
/// test_dir = "TestResults"
/// postclean = true
///
/// [platform]
/// type = "mpi"
/// num_procs = 16
/// mpifile = "hostfile"
///
/// [report]
/// junit = true
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Core execution settings.
    #[serde(default)]
    pub vvtest: VvtestConfig,

    /// Processor pool configuration.
    #[serde(default)]
    pub platform: PlatformConfig,

    /// Report configuration for output generation.
    #[serde(default)]
    pub report: ReportConfig,
}

/// Core execution settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `test_dir` | `TestResults` |
/// | `tick_millis` | 1000 |
/// | `interrupt_to_kill_secs` | 30 |
/// | `baseline_timeout_secs` | 30 |
/// | `logfile` | true |
/// | `preclean` | true |
/// | `postclean` | false |
/// | `analyze_only` | false |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VvtestConfig {
    /// Root under which every test gets its execute directory.
    #[serde(default = "default_test_dir")]
    pub test_dir: PathBuf,

    /// Sleep between scheduling passes when nothing can start.
    #[serde(default = "default_tick_millis")]
    pub tick_millis: u64,

    /// Grace period between the SIGINT sent at timeout and the SIGKILL that
    /// follows if the test is still alive.
    #[serde(default = "default_interrupt_to_kill")]
    pub interrupt_to_kill_secs: u64,

    /// Per-test limit in baseline mode.
    #[serde(default = "default_baseline_timeout")]
    pub baseline_timeout_secs: u64,

    /// Redirect test output to `execute.log` (`baseline.log` in baseline
    /// mode) inside the execute directory.
    #[serde(default = "default_true")]
    pub logfile: bool,

    /// Remove leftovers of a previous run from the execute directory before
    /// launching.
    #[serde(default = "default_true")]
    pub preclean: bool,

    /// Remove generated files after a test passes, unless another test
    /// depends on it.
    #[serde(default)]
    pub postclean: bool,

    /// Pass `--execute_analysis_sections` to every test.
    #[serde(default)]
    pub analyze_only: bool,

    /// Extra arguments appended to every test command.
    #[serde(default)]
    pub test_args: Vec<String>,

    /// Environment variables set for every test process.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Default for VvtestConfig {
    fn default() -> Self {
        Self {
            test_dir: default_test_dir(),
            tick_millis: default_tick_millis(),
            interrupt_to_kill_secs: default_interrupt_to_kill(),
            baseline_timeout_secs: default_baseline_timeout(),
            logfile: true,
            preclean: true,
            postclean: false,
            analyze_only: false,
            test_args: Vec::new(),
            env: HashMap::new(),
        }
    }
}

fn default_test_dir() -> PathBuf {
    PathBuf::from("TestResults")
}

fn default_tick_millis() -> u64 {
    1000
}

fn default_interrupt_to_kill() -> u64 {
    30
}

fn default_baseline_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

/// Processor pool configuration.
///
/// This is a tagged enum selecting the platform by the `type` field.
///
/// | Type | Launch strategy |
/// |------|-----------------|
/// | `local` | plain child processes |
/// | `mpi` | child processes given MPI options and a machine file |
/// | `ssh` | child processes run on remote hosts via ssh |
///
/// # Example
///
/// ```toml
/// [platform]
/// type = "ssh"
/// hosts = ["node1", "node2"]
/// num_procs = 8
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PlatformConfig {
    /// Processors of this machine.
    Local(LocalPlatformConfig),

    /// Processors of this machine, launched through MPI.
    Mpi(MpiPlatformConfig),

    /// Processors of remote hosts.
    Ssh(SshPlatformConfig),
}

impl Default for PlatformConfig {
    fn default() -> Self {
        PlatformConfig::Local(LocalPlatformConfig::default())
    }
}

impl PlatformConfig {
    pub fn name(&self) -> &'static str {
        match self {
            PlatformConfig::Local(_) => "local",
            PlatformConfig::Mpi(_) => "mpi",
            PlatformConfig::Ssh(_) => "ssh",
        }
    }
}

/// Settings for the local platform.
///
/// Without `num_procs`, the processor count is detected from the machine.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LocalPlatformConfig {
    /// Processors tests may use concurrently.
    pub num_procs: Option<u32>,

    /// Largest `np` a single test may request. Defaults to `num_procs`.
    pub max_procs: Option<u32>,
}

/// Settings for MPI launches on this machine.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MpiPlatformConfig {
    pub num_procs: Option<u32>,

    pub max_procs: Option<u32>,

    /// Machine file flavor written for each test.
    #[serde(default)]
    pub mpifile: MpiFileStyle,

    /// Extra options appended to the MPI options passed to each test.
    #[serde(default)]
    pub mpi_opts: String,
}

/// Machine file flavor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MpiFileStyle {
    /// OpenMPI style: `--hostfile machinefile`, one `host slots=N` line.
    #[default]
    Hostfile,

    /// MPICH style: `-machinefile machinefile`, the host repeated per rank.
    Machinefile,

    /// No machine file; only `mpi_opts` are passed.
    None,
}

/// Settings for running tests on remote hosts.
///
/// Allocations rotate through `hosts`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SshPlatformConfig {
    /// Hosts to run on.
    pub hosts: Vec<String>,

    /// ssh program and options placed before the host name.
    #[serde(default = "default_ssh")]
    pub ssh: Vec<String>,

    /// Total processors across all hosts. Defaults to one per host.
    pub num_procs: Option<u32>,

    pub max_procs: Option<u32>,
}

fn default_ssh() -> Vec<String> {
    vec!["ssh".to_string(), "-o".to_string(), "BatchMode=yes".to_string()]
}

/// Report configuration for output generation.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `output_dir` | `test-results` |
/// | `junit` | false |
/// | `junit_file` | `junit.xml` |
/// | `results_json` | None |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Directory report files are written to.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Write a JUnit XML report.
    #[serde(default)]
    pub junit: bool,

    /// JUnit file name inside `output_dir`.
    #[serde(default = "default_junit_file")]
    pub junit_file: String,

    /// Write the per-test results, in completion order, as JSON to this
    /// file inside `output_dir`.
    #[serde(default)]
    pub results_json: Option<String>,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            junit: false,
            junit_file: default_junit_file(),
            results_json: None,
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("test-results")
}

fn default_junit_file() -> String {
    "junit.xml".to_string()
}
