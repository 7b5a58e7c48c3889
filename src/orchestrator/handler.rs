//! Per-test launch preparation.
//!
//! Before a test's child process starts, its execute directory is cleaned of
//! leftovers, working files are linked or copied in, the MPI machine file is
//! written and the log file is opened. After a passing test finishes, the
//! directory may be cleaned again. [`ExecutionHandler`] owns these steps and
//! the options that govern them.
//!
//! Problems preparing a single test never abort the run. They are written to
//! the test's log and the test is launched as a child that exits 1, so it
//! fails through the normal completion path.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::command::{Command, CommandBuilder, ExecMode};
use crate::config::VvtestConfig;
use crate::platform::{LaunchStrategy, ProcAllocation};
use crate::record::{TestRecord, WorkingFile, normpath};

const MACHINEFILE: &str = "machinefile";

/// Waits used when the harness kills a test outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KillTiming {
    /// Pause after SIGINT before checking whether the test exited.
    pub after_interrupt: Duration,
    /// Longest wait for the child to be reaped after SIGKILL.
    pub after_kill: Duration,
}

impl Default for KillTiming {
    fn default() -> Self {
        Self {
            after_interrupt: Duration::from_secs(2),
            after_kill: Duration::from_secs(5),
        }
    }
}

/// Options controlling how tests are launched and supervised.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    /// Root of all execute directories.
    pub test_dir: PathBuf,
    pub mode: ExecMode,
    pub logfile: bool,
    pub preclean: bool,
    pub postclean: bool,
    /// Appended to every test command.
    pub test_args: Vec<String>,
    /// Set for every test process.
    pub env: Vec<(String, String)>,
    /// Time between the timeout SIGINT and the follow-up SIGKILL.
    pub interrupt_to_kill: Duration,
    /// Fixed per-test limit in baseline mode.
    pub baseline_timeout: Duration,
    pub kill_timing: KillTiming,
}

impl ExecOptions {
    pub fn new(test_dir: impl Into<PathBuf>) -> Self {
        Self {
            test_dir: test_dir.into(),
            mode: ExecMode::Normal,
            logfile: true,
            preclean: true,
            postclean: false,
            test_args: Vec::new(),
            env: Vec::new(),
            interrupt_to_kill: Duration::from_secs(30),
            baseline_timeout: Duration::from_secs(30),
            kill_timing: KillTiming::default(),
        }
    }

    pub fn from_config(config: &VvtestConfig, mode: ExecMode) -> Self {
        let mode = if config.analyze_only && mode == ExecMode::Normal {
            ExecMode::AnalyzeOnly
        } else {
            mode
        };
        let mut env: Vec<(String, String)> = config
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.sort();
        Self {
            test_dir: config.test_dir.clone(),
            mode,
            logfile: config.logfile,
            preclean: config.preclean,
            postclean: config.postclean,
            test_args: config.test_args.clone(),
            env,
            interrupt_to_kill: Duration::from_secs(config.interrupt_to_kill_secs),
            baseline_timeout: Duration::from_secs(config.baseline_timeout_secs),
            kill_timing: KillTiming::default(),
        }
    }
}

/// Value exported to tests in `TIMEOUT` and `VVTEST_TIMEOUT`.
///
/// Tests get more time than the harness enforces so that their own timers
/// fire after the harness's: under 30 s becomes 60 s, under 120 s is scaled
/// by 1.4, anything longer by 1.2.
pub fn timeout_env_value(timeout_secs: u64) -> u64 {
    if timeout_secs < 30 {
        60
    } else if timeout_secs < 120 {
        (timeout_secs as f64 * 1.4) as u64
    } else {
        (timeout_secs as f64 * 1.2) as u64
    }
}

/// Everything needed to spawn one test.
#[derive(Debug)]
pub struct Launch {
    pub command: Command,
    /// Open log file receiving the child's stdout and stderr.
    pub log: Option<File>,
    pub timeout: Option<Duration>,
}

/// Prepares execute directories and builds launch commands.
#[derive(Clone)]
pub struct ExecutionHandler {
    opts: ExecOptions,
    builder: Arc<dyn CommandBuilder>,
}

impl std::fmt::Debug for ExecutionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionHandler")
            .field("opts", &self.opts)
            .finish_non_exhaustive()
    }
}

impl ExecutionHandler {
    pub fn new(opts: ExecOptions, builder: Arc<dyn CommandBuilder>) -> Self {
        Self { opts, builder }
    }

    pub fn options(&self) -> &ExecOptions {
        &self.opts
    }

    /// Absolute or test-dir relative path of the record's execute directory.
    pub fn exec_dir(&self, record: &TestRecord) -> PathBuf {
        self.opts.test_dir.join(record.execute_directory())
    }

    pub fn create_exec_dir(&self, record: &TestRecord) -> std::io::Result<PathBuf> {
        let dir = self.exec_dir(record);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Limit the supervisor enforces for `record`.
    pub fn effective_timeout(&self, record: &TestRecord) -> Option<Duration> {
        match self.opts.mode {
            ExecMode::Baseline => Some(self.opts.baseline_timeout),
            _ => record.timeout().map(Duration::from_secs),
        }
    }

    /// Prepares the execute directory and builds the command for `record`
    /// running on `allocation`.
    pub fn prepare_launch(&self, record: &TestRecord, allocation: &ProcAllocation) -> Launch {
        let dir = self.exec_dir(record);
        let timeout = self.effective_timeout(record);
        let mut problems = Vec::new();

        if let Err(e) = fs::create_dir_all(&dir) {
            problems.push(format!("cannot create execute directory: {}", e));
        }
        // Analyze-only and baseline runs work from the outputs of a
        // previous run.
        if self.opts.preclean
            && self.opts.mode == ExecMode::Normal
            && let Err(e) = pre_clean(&dir)
        {
            problems.push(format!("pre-clean failed: {}", e));
        }

        let mut log = if self.opts.logfile {
            match File::create(dir.join(self.opts.mode.log_file_name())) {
                Ok(f) => Some(f),
                Err(e) => {
                    warn!("cannot open log for {}: {}", record.execute_directory(), e);
                    None
                }
            }
        } else {
            None
        };

        if self.opts.mode != ExecMode::Baseline {
            problems.extend(set_working_files(record, &dir));
        }
        if let LaunchStrategy::Mpi {
            machinefile: Some(contents),
            ..
        } = allocation.launch()
        {
            if let Err(e) = fs::write(dir.join(MACHINEFILE), contents) {
                problems.push(format!("cannot write machine file: {}", e));
            }
        }

        let command = if problems.is_empty() {
            self.build_command(record, allocation, &dir, timeout)
        } else {
            for p in &problems {
                warn!("{}: {}", record.execute_directory(), p);
            }
            Command::exit_with(1).working_dir(&dir)
        };

        if let Some(f) = log.as_mut() {
            let header = log_header(record, &dir, &command, timeout, &problems);
            if let Err(e) = f.write_all(header.as_bytes()) {
                debug!("cannot write log header: {}", e);
            }
        }

        Launch {
            command,
            log,
            timeout,
        }
    }

    fn build_command(
        &self,
        record: &TestRecord,
        allocation: &ProcAllocation,
        dir: &Path,
        timeout: Option<Duration>,
    ) -> Command {
        let Some(mut command) = self
            .builder
            .build(record, self.opts.mode)
            .as_deref()
            .and_then(Command::from_argv)
        else {
            return Command::noop().working_dir(dir);
        };

        if self.opts.mode == ExecMode::AnalyzeOnly {
            command = command.arg("--execute_analysis_sections");
        }
        command = command
            .args(self.opts.test_args.iter().cloned())
            .working_dir(dir);

        if let Some(t) = timeout.filter(|t| !t.is_zero()) {
            let value = timeout_env_value(t.as_secs()).to_string();
            command = command
                .env("TIMEOUT", value.clone())
                .env("VVTEST_TIMEOUT", value);
        }
        for (k, v) in &self.opts.env {
            command = command.env(k.clone(), v.clone());
        }

        // Remote launches fold the environment into the ssh command line.
        command.with_launch(allocation.launch())
    }

}

fn log_header(
    record: &TestRecord,
    dir: &Path,
    command: &Command,
    timeout: Option<Duration>,
    problems: &[String],
) -> String {
    let mut header = format!(
        "Starting test: {}\nDirectory    : {}\nCommand      : {}\nTimeout      : {}\n",
        record.name(),
        dir.display(),
        command.to_shell_string(),
        timeout.map(|t| t.as_secs().to_string()).unwrap_or_else(|| "none".to_string()),
    );
    for p in problems {
        header.push_str("*** error: ");
        header.push_str(p);
        header.push('\n');
    }
    header.push('\n');
    header
}

fn keep_on_preclean(name: &str) -> bool {
    name == "execute.log" || name == "baseline.log" || name.starts_with("vvtest_util")
}

fn keep_on_postclean(name: &str) -> bool {
    keep_on_preclean(name) || name == MACHINEFILE
}

/// Empties an execute directory, keeping logs and harness utility files.
pub fn pre_clean(dir: &Path) -> std::io::Result<()> {
    clean_dir(dir, keep_on_preclean, false)
}

/// Empties an execute directory after a passing test, additionally keeping
/// the machine file and linked working files.
pub fn post_clean(dir: &Path) -> std::io::Result<()> {
    clean_dir(dir, keep_on_postclean, true)
}

fn clean_dir(dir: &Path, keep: fn(&str) -> bool, keep_links: bool) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let file_type = entry.file_type()?;
        if keep(&name.to_string_lossy()) || (keep_links && file_type.is_symlink()) {
            continue;
        }
        let path = entry.path();
        if file_type.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Links and copies the record's working files into `dir`. Returns the
/// problems encountered, empty on success.
pub fn set_working_files(record: &TestRecord, dir: &Path) -> Vec<String> {
    let srcdir = record.source_dir();
    let mut problems = Vec::new();

    for (file, link) in record
        .link_files()
        .iter()
        .map(|f| (f, true))
        .chain(record.copy_files().iter().map(|f| (f, false)))
    {
        let verb = if link { "soft link" } else { "copy" };
        let sources = match resolve_sources(&srcdir, file) {
            Ok(s) if s.is_empty() => {
                problems.push(format!("cannot {} a non-existent file: {}", verb, file.src));
                continue;
            }
            Ok(s) => s,
            Err(msg) => {
                problems.push(msg);
                continue;
            }
        };

        for src in sources {
            let name = match (&file.dest, src.file_name()) {
                (Some(dest), _) => PathBuf::from(dest),
                (None, Some(base)) => PathBuf::from(base),
                (None, None) => continue,
            };
            let target = dir.join(name);
            let result = remove_existing(&target).and_then(|_| {
                if link {
                    std::os::unix::fs::symlink(&src, &target)
                } else if src.is_dir() {
                    copy_dir(&src, &target)
                } else {
                    fs::copy(&src, &target).map(|_| ())
                }
            });
            if let Err(e) = result {
                problems.push(format!(
                    "cannot {} {} to {}: {}",
                    verb,
                    src.display(),
                    target.display(),
                    e
                ));
            }
        }
    }
    problems
}

fn resolve_sources(srcdir: &Path, file: &WorkingFile) -> Result<Vec<PathBuf>, String> {
    let joined = normpath(&srcdir.join(&file.src).to_string_lossy());
    let path = PathBuf::from(&joined);
    if path.exists() {
        return Ok(vec![path]);
    }

    let (parent, pattern) = match (path.parent(), path.file_name()) {
        (Some(parent), Some(pattern)) => (parent.to_path_buf(), pattern.to_string_lossy().into_owned()),
        _ => return Ok(Vec::new()),
    };
    let glob = match globset::Glob::new(&pattern) {
        Ok(g) => g.compile_matcher(),
        Err(_) => return Ok(Vec::new()),
    };
    let mut found: Vec<PathBuf> = match fs::read_dir(&parent) {
        Ok(entries) => entries
            .filter_map(Result::ok)
            .filter(|e| glob.is_match(e.file_name()))
            .map(|e| e.path())
            .collect(),
        Err(_) => Vec::new(),
    };
    found.sort();

    if found.len() > 1 && file.dest.is_some() {
        return Err(format!(
            "'{}' matched multiple sources but a single destination name was given",
            file.src
        ));
    }
    Ok(found)
}

fn remove_existing(target: &Path) -> std::io::Result<()> {
    match fs::symlink_metadata(target) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(target),
        Ok(_) => fs::remove_file(target),
        Err(_) => Ok(()),
    }
}

fn copy_dir(src: &Path, dst: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_symlink() {
            std::os::unix::fs::symlink(fs::read_link(&from)?, &to)?;
        } else if file_type.is_dir() {
            copy_dir(&from, &to)?;
        } else {
            fs::copy(&from, &to)?;
        }
    }
    Ok(())
}
