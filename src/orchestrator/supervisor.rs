//! Supervision of one running test process.
//!
//! A [`ProcessSupervisor`] owns the child process of a running test and the
//! processors it was given. The scheduler polls it once per tick:
//!
//! ```text
//!   poll ──► exited?  ── yes ──► give procs back, record outcome, post-clean
//!              │
//!              no
//!              ▼
//!          past timeout? ── first time ──► SIGINT to the process group
//!              │
//!              └── interrupt_to_kill later ──► SIGKILL, every poll
//! ```
//!
//! Tests start in their own process group so the signals reach everything
//! the test spawned without leaving it. [`ProcessSupervisor::kill_job`] goes
//! further and signals every descendant found in the process table.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use libc::{SIGINT, SIGKILL};
use tokio::process::Child;
use tracing::{debug, info, warn};

use super::handler::{ExecutionHandler, KillTiming, post_clean};
use super::proctree::ProcessTree;
use crate::platform::{ProcAllocation, ResourceManager};
use crate::record::TestRecord;
use crate::status::{TestOutcome, TestStatus};

/// Errors preparing or starting test processes.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("failed to create execute directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to redirect output to the log file: {0}")]
    Log(#[source] std::io::Error),

    #[error("spawned process has no pid")]
    NoPid,
}

/// The running child of one test.
#[derive(Debug)]
pub struct ProcessSupervisor {
    child: Child,
    pid: u32,
    started: Instant,
    timeout: Option<Duration>,
    timed_out_at: Option<Instant>,
    interrupt_to_kill: Duration,
    kill_timing: KillTiming,
    allocation: Option<ProcAllocation>,
    postclean_dir: Option<PathBuf>,
}

impl ProcessSupervisor {
    /// Takes processors for `record` from `platform`, prepares its execute
    /// directory and spawns its command.
    ///
    /// On failure the processors are already back with the platform.
    pub fn start(
        record: &TestRecord,
        handler: &ExecutionHandler,
        platform: &mut dyn ResourceManager,
    ) -> Result<Self, ExecError> {
        let allocation = platform.obtain_procs(record.np());
        let launch = handler.prepare_launch(record, &allocation);

        let child = match spawn(&launch.command, launch.log) {
            Ok(child) => child,
            Err(e) => {
                platform.give_procs(allocation);
                return Err(e);
            }
        };
        let Some(pid) = child.id() else {
            platform.give_procs(allocation);
            return Err(ExecError::NoPid);
        };

        debug!(
            "started {} (pid {}, np {}): {}",
            record.execute_directory(),
            pid,
            allocation.np(),
            launch.command.to_shell_string()
        );

        let opts = handler.options();
        Ok(Self {
            child,
            pid,
            started: Instant::now(),
            timeout: launch.timeout.filter(|t| !t.is_zero()),
            timed_out_at: None,
            interrupt_to_kill: opts.interrupt_to_kill,
            kill_timing: opts.kill_timing,
            allocation: Some(allocation),
            postclean_dir: opts.postclean.then(|| handler.exec_dir(record)),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Whether the timeout interrupt has been sent.
    pub fn is_timed_out(&self) -> bool {
        self.timed_out_at.is_some()
    }

    /// Processors held, zero once returned.
    pub fn np(&self) -> u32 {
        self.allocation.as_ref().map_or(0, ProcAllocation::np)
    }

    /// Checks the child without blocking. Returns true once the test has
    /// finished and its status is final.
    pub fn poll(
        &mut self,
        status: &mut TestStatus,
        has_dependent: bool,
        platform: &mut dyn ResourceManager,
    ) -> bool {
        if self.allocation.is_none() {
            return true;
        }
        match self.child.try_wait() {
            Ok(Some(exit)) => {
                self.complete(Some(exit), status, has_dependent, platform);
                true
            }
            Ok(None) => {
                self.enforce_timeout();
                false
            }
            Err(e) => {
                warn!("failed to check pid {}: {}", self.pid, e);
                self.complete(None, status, has_dependent, platform);
                true
            }
        }
    }

    fn enforce_timeout(&mut self) {
        let Some(timeout) = self.timeout else {
            return;
        };
        let now = Instant::now();
        if now.duration_since(self.started) <= timeout {
            return;
        }
        match self.timed_out_at {
            None => {
                info!("pid {} exceeded its {:?} timeout, interrupting", self.pid, timeout);
                signal_group(self.pid, SIGINT);
                self.timed_out_at = Some(now);
            }
            Some(at) if now.duration_since(at) > self.interrupt_to_kill => {
                debug!("pid {} still running after interrupt, killing", self.pid);
                signal_group(self.pid, SIGKILL);
            }
            Some(_) => {}
        }
    }

    /// Terminates the test and everything it started.
    ///
    /// Sends SIGINT to the whole descendant tree, then SIGKILL if the child
    /// is still alive. The status always ends up final and the processors
    /// are always returned.
    pub async fn kill_job(
        &mut self,
        tree: &ProcessTree,
        status: &mut TestStatus,
        platform: &mut dyn ResourceManager,
    ) {
        if self.allocation.is_none() {
            return;
        }
        let pids = tree.descendants(self.pid).await;
        debug!("interrupting pid {} and {} descendants", self.pid, pids.len() - 1);
        signal_all(&pids, SIGINT);
        tokio::time::sleep(self.kill_timing.after_interrupt).await;
        if self.poll(status, true, platform) {
            return;
        }

        signal_all(&pids, SIGKILL);
        let exit = match tokio::time::timeout(self.kill_timing.after_kill, self.child.wait()).await {
            Ok(Ok(exit)) => Some(exit),
            Ok(Err(e)) => {
                warn!("failed to reap pid {}: {}", self.pid, e);
                None
            }
            Err(_) => {
                warn!("pid {} did not exit after SIGKILL", self.pid);
                None
            }
        };
        self.complete(exit, status, true, platform);
    }

    fn complete(
        &mut self,
        exit: Option<ExitStatus>,
        status: &mut TestStatus,
        has_dependent: bool,
        platform: &mut dyn ResourceManager,
    ) {
        if let Some(allocation) = self.allocation.take() {
            platform.give_procs(allocation);
        }

        let result = match (self.timed_out_at, exit) {
            (Some(_), _) => status.mark_timed_out(),
            (None, Some(exit)) => status.mark_done(exit),
            (None, None) => status.finish(TestOutcome::Fail),
        };
        if let Err(e) = result {
            warn!("pid {}: {}", self.pid, e);
            return;
        }

        if status.outcome() == Some(TestOutcome::Pass) && !has_dependent {
            if let Some(dir) = &self.postclean_dir {
                if let Err(e) = post_clean(dir) {
                    warn!("post-clean of {} failed: {}", dir.display(), e);
                }
            }
        }
    }
}

fn spawn(command: &crate::command::Command, log: Option<std::fs::File>) -> Result<Child, ExecError> {
    let mut cmd = command.to_tokio();
    cmd.stdin(Stdio::null()).process_group(0);
    match log {
        Some(file) => {
            let err = file.try_clone().map_err(ExecError::Log)?;
            cmd.stdout(Stdio::from(file)).stderr(Stdio::from(err));
        }
        None => {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }
    }
    cmd.spawn().map_err(|source| ExecError::Spawn {
        command: command.to_shell_string(),
        source,
    })
}

/// Signals the process group led by `pid`, or the process alone if it does
/// not lead a group.
fn signal_group(pid: u32, signal: i32) {
    let pid = pid as libc::pid_t;
    // SAFETY: kill has no memory safety requirements.
    unsafe {
        if libc::kill(-pid, signal) != 0 {
            libc::kill(pid, signal);
        }
    }
}

fn signal_all(pids: &[u32], signal: i32) {
    for &pid in pids {
        // SAFETY: kill has no memory safety requirements.
        unsafe {
            libc::kill(pid as libc::pid_t, signal);
        }
    }
}
