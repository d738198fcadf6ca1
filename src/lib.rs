//! suitesched: schedules test suites across scarce, exclusive environments.
//!
//! Each suite declares what it needs (a specific handler configuration, or a
//! set of capability tags) and the scheduler decides which environment it
//! runs against, in what order, and how many run at once. Environments are
//! mutually exclusive and can be corrupted by a hung run, so a suite that
//! exceeds its timeout takes its environment out of the pool for the rest of
//! the run.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Environments**: Named exclusive targets advertising capability tags,
//!   with optional host-wide locks shared between scheduler processes
//! - **Matcher**: Resolves a suite's requirement to its eligible environments
//! - **Suites**: The [`Suite`] lifecycle trait and the [`SuiteRecord`] state
//! - **Scheduler**: One runner per environment, timeouts, quarantine
//! - **Report**: Console and JUnit XML output of the run
//!
//! # Example
//!
//! ```no_run
//! use suitesched::config::{build_scheduler, load_config};
//! use suitesched::report::ConsoleReporter;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("suitesched.toml"))?;
//!     let selected = config.select_suites(&[], None)?;
//!     let scheduler = build_scheduler(&config, &selected, config.scheduler.options())?;
//!
//!     let result = scheduler
//!         .run_with_reporter(&ConsoleReporter::new(false))
//!         .await?;
//!     std::process::exit(result.exit_code());
//! }
//! ```

pub mod config;
pub mod environment;
pub mod matcher;
pub mod report;
pub mod scheduler;
pub mod suite;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use environment::EnvironmentConfig;
pub use matcher::{Requirement, ResourceMatcher};
pub use report::Reporter;
pub use scheduler::{RunResult, Scheduler, SchedulerError, SchedulerOptions};
pub use suite::{Suite, SuiteError, SuiteRecord, SuiteStatus};
