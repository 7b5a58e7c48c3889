//! Processor accounting and launch strategies.
//!
//! The scheduler never starts a test without first asking the platform for
//! processors. A [`ResourceManager`] tracks how many processors are free and
//! hands out a [`ProcAllocation`] for each started test. The allocation is
//! returned with [`ResourceManager::give_procs`] when the test finishes.
//!
//! ```text
//!   query_procs(np) ──► bool            (may a test of size np start?)
//!   obtain_procs(np) ──► ProcAllocation  (free -= np)
//!   give_procs(alloc)                    (free += np, capped at total)
//! ```
//!
//! `ProcAllocation` is deliberately not `Clone`: `give_procs` consumes it,
//! so each obtain is paired with exactly one give.
//!
//! # Launch Strategies
//!
//! | Strategy | Effect on the launched command |
//! |----------|--------------------------------|
//! | [`LaunchStrategy::Local`] | run as is |
//! | [`LaunchStrategy::Remote`] | wrapped in an ssh invocation for a host |
//! | [`LaunchStrategy::Mpi`] | `--mpirun_opts` appended, machine file written |

pub mod local;

pub use local::LocalPlatform;

/// How a test's command is launched on the processors it was given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchStrategy {
    /// Plain child process on this machine.
    Local,

    /// Run on another host through ssh.
    Remote {
        /// Host to run on.
        host: String,
        /// ssh program and options preceding the host name.
        ssh: Vec<String>,
    },

    /// MPI launch: the test script receives `mpi_opts` and, when set, a
    /// machine file with the given contents is written to the execute
    /// directory.
    Mpi {
        mpi_opts: String,
        machinefile: Option<String>,
    },
}

/// Processors handed to one running test.
#[derive(Debug, PartialEq, Eq)]
pub struct ProcAllocation {
    np: u32,
    launch: LaunchStrategy,
}

impl ProcAllocation {
    pub fn new(np: u32, launch: LaunchStrategy) -> Self {
        Self { np, launch }
    }

    /// Number of processors held, at least 1.
    pub fn np(&self) -> u32 {
        self.np
    }

    pub fn launch(&self) -> &LaunchStrategy {
        &self.launch
    }
}

/// Processor pool the scheduler draws from.
pub trait ResourceManager: Send {
    /// Short name for logging.
    fn name(&self) -> &str;

    /// Processors available to tests.
    fn num_procs(&self) -> u32;

    /// Upper bound a single test may request.
    fn max_procs(&self) -> u32;

    /// Processors not currently allocated.
    fn num_free(&self) -> u32;

    /// Whether a test needing `np` processors fits right now. Zero counts
    /// as one.
    fn query_procs(&self, np: u32) -> bool {
        np.max(1) <= self.num_free()
    }

    /// Takes `np` processors (zero counts as one). Never fails; when the
    /// scheduler starts an oversized test the free count bottoms out at
    /// zero.
    fn obtain_procs(&mut self, np: u32) -> ProcAllocation;

    /// Returns processors taken by [`obtain_procs`](Self::obtain_procs).
    fn give_procs(&mut self, allocation: ProcAllocation);
}

impl<R: ResourceManager + ?Sized> ResourceManager for Box<R> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn num_procs(&self) -> u32 {
        (**self).num_procs()
    }

    fn max_procs(&self) -> u32 {
        (**self).max_procs()
    }

    fn num_free(&self) -> u32 {
        (**self).num_free()
    }

    fn query_procs(&self, np: u32) -> bool {
        (**self).query_procs(np)
    }

    fn obtain_procs(&mut self, np: u32) -> ProcAllocation {
        (**self).obtain_procs(np)
    }

    fn give_procs(&mut self, allocation: ProcAllocation) {
        (**self).give_procs(allocation)
    }
}
