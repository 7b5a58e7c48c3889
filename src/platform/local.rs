//! Processor pool of the machine running the harness.
//!
//! [`LocalPlatform`] counts processors and nothing else; it does not pin or
//! reserve cores. The launch strategy attached to each allocation comes from
//! configuration:
//!
//! | Config `type` | Allocation |
//! |---------------|------------|
//! | `local` | [`LaunchStrategy::Local`] |
//! | `mpi` | [`LaunchStrategy::Mpi`] with machine file contents |
//! | `ssh` | [`LaunchStrategy::Remote`], hosts taken in rotation |

use tracing::debug;

use super::{LaunchStrategy, ProcAllocation, ResourceManager};
use crate::config::{MpiFileStyle, PlatformConfig};

#[derive(Debug, Clone)]
enum Launcher {
    Local,
    Mpi { style: MpiFileStyle, extra_opts: String },
    Ssh { hosts: Vec<String>, ssh: Vec<String>, next: usize },
}

/// Processor accounting for this machine (or a fixed set of ssh hosts).
#[derive(Debug, Clone)]
pub struct LocalPlatform {
    nprocs: u32,
    maxprocs: u32,
    nfree: u32,
    hostname: String,
    launcher: Launcher,
}

impl LocalPlatform {
    /// A plain local pool of `nprocs` processors.
    pub fn new(nprocs: u32) -> Self {
        let nprocs = nprocs.max(1);
        Self {
            nprocs,
            maxprocs: nprocs,
            nfree: nprocs,
            hostname: hostname(),
            launcher: Launcher::Local,
        }
    }

    /// Builds the pool described by `config`. `num_procs_override` (from the
    /// command line) wins over the configured count, which wins over detection.
    pub fn from_config(config: &PlatformConfig, num_procs_override: Option<u32>) -> Self {
        let (configured, max, launcher) = match config {
            PlatformConfig::Local(c) => (c.num_procs, c.max_procs, Launcher::Local),
            PlatformConfig::Mpi(c) => (
                c.num_procs,
                c.max_procs,
                Launcher::Mpi {
                    style: c.mpifile,
                    extra_opts: c.mpi_opts.clone(),
                },
            ),
            PlatformConfig::Ssh(c) => (
                c.num_procs.or(Some(c.hosts.len() as u32)),
                c.max_procs,
                Launcher::Ssh {
                    hosts: c.hosts.clone(),
                    ssh: c.ssh.clone(),
                    next: 0,
                },
            ),
        };

        let nprocs = num_procs_override
            .or(configured)
            .unwrap_or_else(detect_num_procs)
            .max(1);
        let maxprocs = max.unwrap_or(nprocs).max(1);
        debug!(
            "platform {}: {} processors, max {} per test",
            config.name(),
            nprocs,
            maxprocs
        );

        Self {
            nprocs,
            maxprocs,
            nfree: nprocs,
            hostname: hostname(),
            launcher,
        }
    }

    fn launch_for(&mut self, np: u32) -> LaunchStrategy {
        match &mut self.launcher {
            Launcher::Local => LaunchStrategy::Local,
            Launcher::Mpi { style, extra_opts } => {
                let (mut mpi_opts, machinefile) = match style {
                    MpiFileStyle::Hostfile => (
                        "--hostfile machinefile".to_string(),
                        Some(format!("{} slots={}\n", self.hostname, np.min(self.nprocs))),
                    ),
                    MpiFileStyle::Machinefile => (
                        "-machinefile machinefile".to_string(),
                        Some(format!("{}\n", self.hostname).repeat(np as usize)),
                    ),
                    MpiFileStyle::None => (String::new(), None),
                };
                if !extra_opts.is_empty() {
                    if !mpi_opts.is_empty() {
                        mpi_opts.push(' ');
                    }
                    mpi_opts.push_str(extra_opts);
                }
                LaunchStrategy::Mpi {
                    mpi_opts,
                    machinefile,
                }
            }
            Launcher::Ssh { hosts, ssh, next } => {
                if hosts.is_empty() {
                    return LaunchStrategy::Local;
                }
                let host = hosts[*next % hosts.len()].clone();
                *next += 1;
                LaunchStrategy::Remote {
                    host,
                    ssh: ssh.clone(),
                }
            }
        }
    }
}

impl ResourceManager for LocalPlatform {
    fn name(&self) -> &str {
        match self.launcher {
            Launcher::Local => "local",
            Launcher::Mpi { .. } => "mpi",
            Launcher::Ssh { .. } => "ssh",
        }
    }

    fn num_procs(&self) -> u32 {
        self.nprocs
    }

    fn max_procs(&self) -> u32 {
        self.maxprocs
    }

    fn num_free(&self) -> u32 {
        self.nfree
    }

    fn obtain_procs(&mut self, np: u32) -> ProcAllocation {
        let np = np.max(1);
        self.nfree = self.nfree.saturating_sub(np);
        let launch = self.launch_for(np);
        ProcAllocation::new(np, launch)
    }

    fn give_procs(&mut self, allocation: ProcAllocation) {
        self.nfree = (self.nfree + allocation.np()).min(self.nprocs);
    }
}

/// Processor count of this machine, 1 when it cannot be determined.
pub fn detect_num_procs() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

fn hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: the buffer is valid for its full length and gethostname
    // writes at most that many bytes.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return "localhost".to_string();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    match String::from_utf8_lossy(&buf[..end]).trim() {
        "" => "localhost".to_string(),
        name => name.to_string(),
    }
}
