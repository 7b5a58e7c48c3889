//! Test command construction.
//!
//! A [`CommandBuilder`] turns a [`TestRecord`] into the argv that runs it in
//! a given [`ExecMode`]. The scheduler then decorates that argv for the
//! processors the test was given (MPI options, remote wrapping) and the run
//! options (analyze-only flag, extra test arguments), producing a
//! [`Command`] that the supervisor spawns.
//!
//! # Example
//!
//! ```
//! use vvtest::command::Command;
//!
//! let cmd = Command::new("sh")
//!     .arg("heat.sh")
//!     .args(["--np", "4"])
//!     .working_dir("/results/heat.np=4")
//!     .env("TIMEOUT", "60");
//!
//! assert_eq!(cmd.program, "sh");
//! assert_eq!(cmd.args.len(), 3);
//! assert_eq!(cmd.to_shell_string(), "sh heat.sh --np 4");
//! ```

use std::path::PathBuf;

use crate::platform::LaunchStrategy;
use crate::record::TestRecord;

/// What a launch is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecMode {
    /// Run the test.
    #[default]
    Normal,
    /// Run only the analysis sections of the test.
    AnalyzeOnly,
    /// Regenerate the test's baseline files.
    Baseline,
}

impl ExecMode {
    /// Name of the log file written in the execute directory.
    pub fn log_file_name(&self) -> &'static str {
        match self {
            ExecMode::Baseline => "baseline.log",
            _ => "execute.log",
        }
    }
}

/// Produces the argv for a test.
///
/// Returning `None` means there is nothing to execute; the test is launched
/// as a trivial child that succeeds immediately.
pub trait CommandBuilder: Send + Sync {
    fn build(&self, record: &TestRecord, mode: ExecMode) -> Option<Vec<String>>;
}

/// Uses the command lists attached to each record.
#[derive(Debug, Clone, Default)]
pub struct RecordCommandBuilder;

impl CommandBuilder for RecordCommandBuilder {
    fn build(&self, record: &TestRecord, mode: ExecMode) -> Option<Vec<String>> {
        let argv = match mode {
            ExecMode::Normal | ExecMode::AnalyzeOnly => record.command(),
            ExecMode::Baseline => record.baseline_command(),
        }?;
        if argv.is_empty() {
            None
        } else {
            Some(argv.to_vec())
        }
    }
}

/// A process to spawn, built with a fluent API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// The program to run.
    pub program: String,

    /// Arguments to pass to the program.
    pub args: Vec<String>,

    /// Directory the process starts in.
    pub working_dir: Option<PathBuf>,

    /// Environment variables set for the process, on top of the harness's.
    pub env: Vec<(String, String)>,
}

impl Command {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
        }
    }

    /// Builds a command from an argv; `None` when the argv is empty.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(program.clone()).args(args.iter().cloned()))
    }

    /// A child that exits 0 immediately.
    pub fn noop() -> Self {
        Self::new("/bin/sh").args(["-c", ":"])
    }

    /// A child that exits with `code` immediately.
    pub fn exit_with(code: i32) -> Self {
        Self::new("/bin/sh").args(["-c".to_string(), format!("exit {}", code)])
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// The command line, shell-quoted.
    pub fn to_shell_string(&self) -> String {
        shell_words::join(std::iter::once(&self.program).chain(self.args.iter()))
    }

    /// Rewrites the command for the given launch strategy.
    ///
    /// Remote launches become an ssh invocation that changes to the working
    /// directory and sets the environment on the far side.
    pub fn with_launch(self, launch: &LaunchStrategy) -> Self {
        match launch {
            LaunchStrategy::Local => self,
            LaunchStrategy::Mpi { mpi_opts, .. } => {
                if mpi_opts.is_empty() {
                    self
                } else {
                    self.arg("--mpirun_opts").arg(mpi_opts.clone())
                }
            }
            LaunchStrategy::Remote { host, ssh } => {
                let mut remote = String::new();
                if let Some(dir) = &self.working_dir {
                    remote.push_str("cd ");
                    remote.push_str(&shell_words::quote(&dir.to_string_lossy()));
                    remote.push_str(" && ");
                }
                if !self.env.is_empty() {
                    remote.push_str("env ");
                    for (k, v) in &self.env {
                        remote.push_str(&shell_words::quote(&format!("{}={}", k, v)));
                        remote.push(' ');
                    }
                }
                remote.push_str(&self.to_shell_string());

                let (program, ssh_opts) = match ssh.split_first() {
                    Some((p, rest)) => (p.clone(), rest.to_vec()),
                    None => ("ssh".to_string(), Vec::new()),
                };
                Command {
                    program,
                    args: ssh_opts
                        .into_iter()
                        .chain([host.clone(), remote])
                        .collect(),
                    working_dir: self.working_dir,
                    env: Vec::new(),
                }
            }
        }
    }

    /// Converts to a tokio command. Stdio is left to the caller.
    pub fn to_tokio(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_builder_modes() {
        let record = TestRecord::new("a", "/root", "a.vvt")
            .with_command(["sh", "a.sh"])
            .with_baseline_command(["sh", "rebase.sh"]);
        let builder = RecordCommandBuilder;

        assert_eq!(
            builder.build(&record, ExecMode::Normal),
            Some(vec!["sh".to_string(), "a.sh".to_string()])
        );
        assert_eq!(
            builder.build(&record, ExecMode::Baseline),
            Some(vec!["sh".to_string(), "rebase.sh".to_string()])
        );

        let bare = TestRecord::new("b", "/root", "b.vvt").with_command(["sh", "b.sh"]);
        assert_eq!(builder.build(&bare, ExecMode::Baseline), None);
    }

    #[test]
    fn test_from_argv() {
        assert!(Command::from_argv(&[]).is_none());
        let cmd = Command::from_argv(&["python".to_string(), "t.py".to_string()]).unwrap();
        assert_eq!(cmd.program, "python");
        assert_eq!(cmd.args, vec!["t.py"]);
    }

    #[test]
    fn test_with_launch_mpi() {
        let cmd = Command::new("sh").arg("t.sh").with_launch(&LaunchStrategy::Mpi {
            mpi_opts: "--hostfile machinefile".to_string(),
            machinefile: None,
        });
        assert_eq!(cmd.args, vec!["t.sh", "--mpirun_opts", "--hostfile machinefile"]);
    }

    #[test]
    fn test_with_launch_remote() {
        let cmd = Command::new("sh")
            .arg("t.sh")
            .working_dir("/results/t")
            .env("TIMEOUT", "60")
            .with_launch(&LaunchStrategy::Remote {
                host: "node1".to_string(),
                ssh: vec!["ssh".to_string(), "-o".to_string(), "BatchMode=yes".to_string()],
            });

        assert_eq!(cmd.program, "ssh");
        assert_eq!(cmd.args[..3], ["-o", "BatchMode=yes", "node1"]);
        assert_eq!(cmd.args[3], "cd /results/t && env TIMEOUT=60 sh t.sh");
        assert!(cmd.env.is_empty());
    }

    #[test]
    fn test_shell_string_quotes() {
        let cmd = Command::new("echo").arg("two words");
        assert_eq!(cmd.to_shell_string(), "echo 'two words'");
    }
}
