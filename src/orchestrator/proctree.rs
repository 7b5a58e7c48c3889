//! Descendant discovery through `ps`.
//!
//! Killing a test means killing everything it started, including processes
//! that left its process group. [`ProcessTree`] snapshots the system process
//! table and walks parent links down from the test's pid.
//!
//! The `ps` invocation is resolved once, on first use, and cached in the
//! tree value: `ps -ef` when it works, otherwise `ps -Ao user,pid,ppid`.

use std::collections::HashMap;

use tokio::sync::OnceCell;
use tracing::{debug, warn};

const PS_CANDIDATES: [&[&str]; 2] = [&["ps", "-ef"], &["ps", "-Ao", "user,pid,ppid"]];

/// Walks the process table for descendants of a pid.
#[derive(Debug, Default)]
pub struct ProcessTree {
    ps_command: OnceCell<Vec<String>>,
}

impl ProcessTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses a fixed `ps` invocation instead of detecting one.
    pub fn with_ps_command(argv: Vec<String>) -> Self {
        Self {
            ps_command: OnceCell::new_with(Some(argv)),
        }
    }

    async fn ps_command(&self) -> &[String] {
        self.ps_command
            .get_or_init(|| async {
                for candidate in PS_CANDIDATES {
                    let ok = tokio::process::Command::new(candidate[0])
                        .args(&candidate[1..])
                        .stdin(std::process::Stdio::null())
                        .stdout(std::process::Stdio::null())
                        .stderr(std::process::Stdio::null())
                        .status()
                        .await
                        .map(|s| s.success())
                        .unwrap_or(false);
                    if ok {
                        debug!("using '{}' for process listing", candidate.join(" "));
                        return candidate.iter().map(|s| s.to_string()).collect();
                    }
                }
                warn!("no working ps command found, falling back to 'ps -ef'");
                PS_CANDIDATES[0].iter().map(|s| s.to_string()).collect()
            })
            .await
    }

    /// Returns `root` followed by every live descendant of it.
    ///
    /// When the process table cannot be read, only `root` is returned.
    pub async fn descendants(&self, root: u32) -> Vec<u32> {
        let argv = self.ps_command().await;
        let output = match argv.split_first() {
            Some((program, args)) => {
                tokio::process::Command::new(program)
                    .args(args)
                    .stdin(std::process::Stdio::null())
                    .stderr(std::process::Stdio::null())
                    .output()
                    .await
            }
            None => return vec![root],
        };

        match output {
            Ok(out) => {
                let table = String::from_utf8_lossy(&out.stdout);
                collect_descendants(&parse_ps_table(&table), root)
            }
            Err(e) => {
                warn!("failed to list processes: {}", e);
                vec![root]
            }
        }
    }
}

/// Parses `ps` output into a parent -> children map.
///
/// The first line is a header. The second and third columns are pid and
/// parent pid. Lines that do not parse, and processes whose parent is init
/// or the kernel, are ignored.
pub fn parse_ps_table(output: &str) -> HashMap<u32, Vec<u32>> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for line in output.lines().skip(1) {
        let mut cols = line.split_whitespace().skip(1);
        let (Some(pid), Some(ppid)) = (cols.next(), cols.next()) else {
            continue;
        };
        let (Ok(pid), Ok(ppid)) = (pid.parse::<u32>(), ppid.parse::<u32>()) else {
            continue;
        };
        if ppid <= 1 {
            continue;
        }
        children.entry(ppid).or_default().push(pid);
    }
    children
}

/// Returns `root` and all its descendants in depth-first order.
pub fn collect_descendants(children: &HashMap<u32, Vec<u32>>, root: u32) -> Vec<u32> {
    let mut out = vec![root];
    let mut stack = vec![root];
    while let Some(pid) = stack.pop() {
        if let Some(kids) = children.get(&pid) {
            for &kid in kids {
                // Guard against pid reuse producing a cycle.
                if kid != 1 && !out.contains(&kid) {
                    out.push(kid);
                    stack.push(kid);
                }
            }
        }
    }
    out
}
