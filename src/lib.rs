//! vvtest: a dependency-aware, processor-bounded test harness.
//!
//! This crate runs a list of fully instantiated tests as child processes,
//! honoring inter-test dependencies and a fixed processor budget.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Records**: immutable test descriptions ([`record`]) with their mutable
//!   run state ([`status`])
//! - **Test list**: the arena of cases, loaded from a manifest ([`testlist`])
//! - **Dependencies**: edges between cases and result expressions ([`depend`])
//! - **Platform**: the processor pool and launch strategy ([`platform`])
//! - **Orchestrator**: scheduling, process supervision and the run loop
//!   ([`orchestrator`])
//! - **Report**: console output, JUnit XML and a JSON results log ([`report`])
//!
//! # Example
//!
//! ```no_run
//! use vvtest::config::load_config;
//! use vvtest::testlist::TestList;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("vvtest.toml"))?;
//!     let tlist = TestList::load_manifest(std::path::Path::new("tests.toml"))?;
//!     println!("{} tests, results under {}", tlist.len(), config.vvtest.test_dir.display());
//!     Ok(())
//! }
//! ```

pub mod command;
pub mod config;
pub mod depend;
pub mod orchestrator;
pub mod platform;
pub mod record;
pub mod report;
pub mod status;
pub mod testlist;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use orchestrator::{ExecutionDriver, RunResult, TestExecutionList};
pub use platform::{LocalPlatform, ResourceManager};
pub use record::TestRecord;
pub use report::Reporter;
pub use status::{TestOutcome, TestStatus};
pub use testlist::{TestCase, TestList};
