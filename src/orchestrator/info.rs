//! On-demand run information.
//!
//! Pressing enter in the terminal running the harness prints the total
//! runtime and the tests currently executing. Lines are read on a dedicated
//! thread and forwarded over a channel; the run loop checks the channel
//! once per tick.

use std::io::{BufRead, IsTerminal, Write};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::debug;

use super::scheduler::TestExecutionList;

/// Prints run information whenever a line arrives on its channel.
#[derive(Debug)]
pub struct InfoPrinter {
    start: Instant,
    requests: Option<mpsc::UnboundedReceiver<()>>,
}

impl InfoPrinter {
    /// Listens on stdin when it is a terminal; otherwise never prints.
    pub fn from_stdin() -> Self {
        if !std::io::stdin().is_terminal() {
            return Self::disabled();
        }
        let (tx, rx) = mpsc::unbounded_channel();
        std::thread::spawn(move || {
            for line in std::io::stdin().lock().lines() {
                if line.is_err() || tx.send(()).is_err() {
                    break;
                }
            }
        });
        Self::with_receiver(rx)
    }

    pub fn with_receiver(requests: mpsc::UnboundedReceiver<()>) -> Self {
        Self {
            start: Instant::now(),
            requests: Some(requests),
        }
    }

    pub fn disabled() -> Self {
        Self {
            start: Instant::now(),
            requests: None,
        }
    }

    /// Prints to `out` if a request is pending. Returns whether it printed.
    pub fn check_print(&mut self, out: &mut impl Write, xlist: &TestExecutionList) -> bool {
        let Some(requests) = self.requests.as_mut() else {
            return false;
        };
        let mut pending = false;
        while requests.try_recv().is_ok() {
            pending = true;
        }
        if pending && let Err(e) = self.write_info(out, xlist) {
            debug!("cannot print run information: {}", e);
        }
        pending
    }

    pub fn write_info(&self, out: &mut impl Write, xlist: &TestExecutionList) -> std::io::Result<()> {
        writeln!(out, "\nInformation:")?;
        writeln!(out, "  * Total runtime: {}", clock(self.start.elapsed()))?;

        let running = xlist.get_running();
        writeln!(out, "  * {} running test(s):", running.len())?;
        for id in running {
            let case = xlist.tlist().case(id);
            let elapsed = case.status().elapsed().unwrap_or_default();
            writeln!(
                out,
                "    * {} {}",
                case.record().execute_directory(),
                clock(elapsed)
            )?;
        }
        out.flush()
    }
}

/// `H:MM:SS`, whole seconds.
fn clock(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}
