//! Suite lifecycle trait and per-suite run state.
//!
//! The scheduler never looks inside a suite. It only needs a handle it can
//! start against an environment, poll for liveness, and forcibly stop; that
//! contract is the [`Suite`] trait. Everything the scheduler learns about a
//! suite during a run (assigned config, timestamps, timeout, skip reason) is
//! kept in its [`SuiteRecord`].
//!
//! ```text
//!   Pending ──► Running ──► Completed
//!      │           │
//!      │           └──────► TimedOut   (terminated by the scheduler)
//!      │
//!      └──────────────────► Skipped    (every eligible config quarantined)
//! ```
//!
//! # Built-in Suites
//!
//! | Implementation | Description |
//! |----------------|-------------|
//! | [`process::ProcessSuite`] | Runs a shell command as a child process |

pub mod process;

#[cfg(test)]
pub(crate) mod fake;

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::environment::EnvironmentConfig;
use crate::matcher::Requirement;

/// Result type for suite operations.
pub type SuiteResult<T> = Result<T, SuiteError>;

/// Errors a suite handle can report.
///
/// None of these are fatal to a run: a failed start is recorded as a failed
/// suite, and a failed terminate is logged before the environment is
/// quarantined anyway.
#[derive(Debug, thiserror::Error)]
pub enum SuiteError {
    /// The suite could not be launched.
    #[error("Failed to start suite: {0}")]
    StartFailed(String),

    /// The suite could not be stopped.
    #[error("Failed to terminate suite: {0}")]
    TerminateFailed(String),

    /// I/O error while managing the suite.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Implementation-specific error.
    #[error("Suite error: {0}")]
    Other(#[from] anyhow::Error),
}

/// A unit of test work the scheduler can drive.
///
/// Implementations are constructed and owned by the caller and handed to the
/// scheduler inside a [`SuiteRecord`]. Whether the work inside "passed" is
/// not the scheduler's business; only liveness and elapsed time matter.
///
/// # Example
///
/// ```no_run
/// use async_trait::async_trait;
/// use suitesched::suite::{Suite, SuiteResult};
/// use suitesched::EnvironmentConfig;
///
/// struct RemoteJob { /* ... */ }
///
/// #[async_trait]
/// impl Suite for RemoteJob {
///     async fn start(&self, target: &EnvironmentConfig) -> SuiteResult<()> { todo!() }
///     async fn is_running(&self) -> bool { todo!() }
///     async fn terminate(&self) -> SuiteResult<()> { todo!() }
/// }
/// ```
#[async_trait]
pub trait Suite: Send + Sync {
    /// Launches the suite against `target`.
    ///
    /// Should return once the work has been kicked off; the scheduler then
    /// polls [`is_running`](Self::is_running).
    async fn start(&self, target: &EnvironmentConfig) -> SuiteResult<()>;

    /// Returns `true` while the suite is still active.
    async fn is_running(&self) -> bool;

    /// Forcibly stops the suite. Must be safe to call more than once.
    async fn terminate(&self) -> SuiteResult<()>;

    /// Whether the finished suite reported a failure.
    ///
    /// Only read for reporting once the suite has stopped.
    fn failed(&self) -> bool {
        false
    }
}

/// Where a suite is in its lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuiteStatus {
    /// Not yet dispatched.
    #[default]
    Pending,
    /// Dispatched and active on its assigned config.
    Running,
    /// Stopped on its own before any timeout.
    Completed,
    /// Forcibly stopped after exceeding the suite timeout.
    TimedOut,
    /// Never dispatched: every eligible config was quarantined.
    Skipped,
}

impl SuiteStatus {
    /// Returns `true` for states a suite never leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SuiteStatus::Completed | SuiteStatus::TimedOut | SuiteStatus::Skipped
        )
    }

    /// Short label used in console and log output.
    pub fn label(&self) -> &'static str {
        match self {
            SuiteStatus::Pending => "pending",
            SuiteStatus::Running => "running",
            SuiteStatus::Completed => "completed",
            SuiteStatus::TimedOut => "timed out",
            SuiteStatus::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Default)]
struct SuiteState {
    status: SuiteStatus,
    assigned_config: Option<String>,
    started: Option<Instant>,
    terminated: Option<Instant>,
    started_at: Option<DateTime<Utc>>,
    failed: bool,
    error: Option<String>,
    quarantined_configs: Vec<String>,
}

/// A suite together with its requirement and run state.
///
/// State is behind a `Mutex` so runners on different environments can
/// update their own suites while the scheduler is shared by reference.
/// Only the scheduler mutates it.
///
/// # Example
///
/// ```
/// use suitesched::{Requirement, SuiteRecord, SuiteStatus};
/// use suitesched::suite::process::ProcessSuite;
///
/// let record = SuiteRecord::new(
///     "hello-world",
///     Requirement::tags(["aws"]),
///     ProcessSuite::new("hello-world", "./run-suite.sh hello_world"),
/// );
/// assert_eq!(record.status(), SuiteStatus::Pending);
/// assert!(record.started().is_none());
/// ```
pub struct SuiteRecord {
    name: String,
    requirement: Requirement,
    handle: Box<dyn Suite>,
    state: Mutex<SuiteState>,
}

impl SuiteRecord {
    /// Wraps a suite handle with its name and requirement.
    pub fn new(
        name: impl Into<String>,
        requirement: Requirement,
        handle: impl Suite + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            requirement,
            handle: Box::new(handle),
            state: Mutex::new(SuiteState::default()),
        }
    }

    /// Unique suite name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The declared requirement.
    pub fn requirement(&self) -> &Requirement {
        &self.requirement
    }

    /// The underlying suite handle.
    pub fn handle(&self) -> &dyn Suite {
        self.handle.as_ref()
    }

    fn state(&self) -> MutexGuard<'_, SuiteState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current lifecycle status.
    pub fn status(&self) -> SuiteStatus {
        self.state().status
    }

    /// Name of the config this suite was dispatched to.
    pub fn assigned_config(&self) -> Option<String> {
        self.state().assigned_config.clone()
    }

    /// When the suite was dispatched.
    pub fn started(&self) -> Option<Instant> {
        self.state().started
    }

    /// When the suite stopped, on its own or by force.
    pub fn terminated(&self) -> Option<Instant> {
        self.state().terminated
    }

    /// Wall-clock dispatch time, for reports.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.state().started_at
    }

    /// Time between dispatch and termination.
    pub fn duration(&self) -> Option<Duration> {
        let state = self.state();
        match (state.started, state.terminated) {
            (Some(start), Some(end)) => Some(end.duration_since(start)),
            _ => None,
        }
    }

    /// Whether the scheduler stopped this suite for exceeding its timeout.
    pub fn timed_out(&self) -> bool {
        self.state().status == SuiteStatus::TimedOut
    }

    /// Whether this suite never ran because its configs were quarantined.
    pub fn skipped(&self) -> bool {
        self.state().status == SuiteStatus::Skipped
    }

    /// Whether the suite completed but reported a failure (or failed to start).
    pub fn failed(&self) -> bool {
        self.state().failed
    }

    /// Start error message, if the suite could not be launched.
    pub fn error(&self) -> Option<String> {
        self.state().error.clone()
    }

    /// For a skipped suite, the quarantined configs it was eligible for.
    pub fn quarantined_configs(&self) -> Vec<String> {
        self.state().quarantined_configs.clone()
    }

    /// Pending → Running on `config`. Returns `false` if already dispatched.
    pub(crate) fn mark_started(&self, config: &str) -> bool {
        let mut state = self.state();
        if state.status != SuiteStatus::Pending {
            return false;
        }
        state.status = SuiteStatus::Running;
        state.assigned_config = Some(config.to_string());
        state.started = Some(Instant::now());
        state.started_at = Some(Utc::now());
        true
    }

    /// Running → Completed, reading the handle's failure flag.
    pub(crate) fn mark_completed(&self) {
        let failed = self.handle.failed();
        let mut state = self.state();
        state.status = SuiteStatus::Completed;
        state.terminated = Some(Instant::now());
        state.failed = failed;
    }

    /// Running → Completed for a suite whose start call failed.
    pub(crate) fn mark_start_failed(&self, error: String) {
        let mut state = self.state();
        state.status = SuiteStatus::Completed;
        state.terminated = Some(Instant::now());
        state.failed = true;
        state.error = Some(error);
    }

    /// Running → TimedOut, after the handle was terminated.
    pub(crate) fn mark_timed_out(&self) {
        let mut state = self.state();
        state.status = SuiteStatus::TimedOut;
        state.terminated = Some(Instant::now());
    }

    /// Pending → Skipped.
    pub(crate) fn mark_skipped(&self, quarantined_configs: Vec<String>) {
        let mut state = self.state();
        state.status = SuiteStatus::Skipped;
        state.quarantined_configs = quarantined_configs;
    }
}

impl std::fmt::Debug for SuiteRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("SuiteRecord")
            .field("name", &self.name)
            .field("requirement", &self.requirement)
            .field("status", &state.status)
            .field("assigned_config", &state.assigned_config)
            .field("failed", &state.failed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeSuite;
    use super::*;

    fn record() -> SuiteRecord {
        SuiteRecord::new("suite1", Requirement::tags(["env1"]), FakeSuite::instant())
    }

    #[test]
    fn test_lifecycle_completed() {
        let record = record();
        assert!(record.mark_started("config1"));
        assert_eq!(record.status(), SuiteStatus::Running);
        record.mark_completed();

        assert_eq!(record.status(), SuiteStatus::Completed);
        assert_eq!(record.assigned_config().as_deref(), Some("config1"));
        assert!(record.started().unwrap() <= record.terminated().unwrap());
        assert!(!record.timed_out());
        assert!(!record.failed());
    }

    #[test]
    fn test_dispatched_at_most_once() {
        let record = record();
        assert!(record.mark_started("config1"));
        assert!(!record.mark_started("config2"));
        assert_eq!(record.assigned_config().as_deref(), Some("config1"));
    }

    #[test]
    fn test_skipped_keeps_reason_and_no_timestamps() {
        let record = record();
        record.mark_skipped(vec!["config1".to_string()]);

        assert!(record.skipped());
        assert!(record.status().is_terminal());
        assert!(record.started().is_none());
        assert!(record.terminated().is_none());
        assert_eq!(record.quarantined_configs(), vec!["config1".to_string()]);
    }

    #[test]
    fn test_start_failure_is_failed_completion() {
        let record = record();
        record.mark_started("config1");
        record.mark_start_failed("boom".to_string());

        assert_eq!(record.status(), SuiteStatus::Completed);
        assert!(record.failed());
        assert_eq!(record.error().as_deref(), Some("boom"));
    }
}
