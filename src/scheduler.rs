//! Suite scheduling across exclusive environment configs.
//!
//! # Architecture
//!
//! ```text
//!   Vec<SuiteRecord> ──┐
//!                      ├──► Scheduler::new ──► DispatchPlan (eligible sets, queues)
//!   Vec<EnvironmentConfig>          │
//!                                   │ run()
//!                                   ▼
//!              ┌────────────┬───────┴────┬────────────┐
//!              ▼            ▼            ▼            ▼
//!        EnvironmentRunner (one per config, concurrent)
//!              │            │            │            │
//!              └──── ClaimBoard (atomic claim / quarantine) ────┘
//!                                   │
//!                                   ▼
//!                               RunResult
//! ```
//!
//! Construction resolves every suite up front and fails if any suite has no
//! eligible config, so a bad configuration never starts anything. During the
//! run each config is driven by its own runner, one suite at a time. A suite
//! that outlives the suite timeout is terminated and its config quarantined
//! for the rest of the run; suites left with no live config are skipped.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use suitesched::{EnvironmentConfig, Requirement, Scheduler, SchedulerOptions, SuiteRecord};
//! use suitesched::suite::process::ProcessSuite;
//!
//! # async fn example() -> Result<(), suitesched::SchedulerError> {
//! let configs = vec![EnvironmentConfig::new("aws-1", "aws-account-1").with_tag("aws")];
//! let suites = vec![SuiteRecord::new(
//!     "hello-world",
//!     Requirement::tags(["aws"]),
//!     ProcessSuite::new("hello-world", "./run-suite.sh hello_world"),
//! )];
//!
//! let options = SchedulerOptions::default().with_suite_timeout(Duration::from_secs(5400));
//! let scheduler = Scheduler::new(suites, configs, options)?;
//! let result = scheduler.run().await?;
//! println!("skipped: {:?}", scheduler.skipped_suites());
//! # let _ = result;
//! # Ok(())
//! # }
//! ```

pub mod claims;
pub mod plan;
mod runner;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::environment::EnvironmentConfig;
use crate::environment::locks::EnvironmentLocks;
use crate::matcher::RequirementError;
use crate::report::{NullReporter, Reporter};
use crate::suite::{SuiteRecord, SuiteStatus};

use claims::ClaimBoard;
use plan::{DispatchPlan, PlanSummary};
use runner::{EnvironmentRunner, RunContext};

/// Errors from building or running a [`Scheduler`].
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// No environment config can satisfy a suite's requirement.
    #[error("Cannot find a matching handler configuration for suite '{suite}' ({requirement})")]
    Unsatisfiable { suite: String, requirement: String },

    /// A suite descriptor is malformed.
    #[error("Invalid requirement for suite '{suite}': {source}")]
    InvalidRequirement {
        suite: String,
        #[source]
        source: RequirementError,
    },

    /// Two suites share a name.
    #[error("Duplicate suite name: {0}")]
    DuplicateSuite(String),

    /// Two environment configs share a name.
    #[error("Duplicate handler configuration name: {0}")]
    DuplicateEnvironment(String),

    /// [`Scheduler::run`] was called a second time.
    #[error("Scheduler has already run")]
    AlreadyRun,
}

/// Runtime scheduling options.
///
/// | Field | Default |
/// |-------|---------|
/// | `optimize` | `false` |
/// | `suite_timeout` | None |
/// | `poll_interval` | 1s |
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Dispatch pinned suites ahead of flexible ones sharing their config.
    pub optimize: bool,
    /// Applies to every suite, covering both start and run.
    pub suite_timeout: Option<Duration>,
    /// Liveness poll period while a suite runs.
    pub poll_interval: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            optimize: false,
            suite_timeout: None,
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl SchedulerOptions {
    pub fn with_optimize(mut self, optimize: bool) -> Self {
        self.optimize = optimize;
        self
    }

    pub fn with_suite_timeout(mut self, timeout: Duration) -> Self {
        self.suite_timeout = Some(timeout);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Schedules suites across environment configs.
///
/// Owns the suites and the config table for the duration of one run. After
/// [`run`](Self::run) returns, every suite is in a terminal state and the
/// query methods describe what happened.
#[derive(Debug)]
pub struct Scheduler {
    suites: Vec<SuiteRecord>,
    configs: Vec<EnvironmentConfig>,
    options: SchedulerOptions,
    plan: DispatchPlan,
    claims: ClaimBoard,
    locks: Option<EnvironmentLocks>,
    has_run: AtomicBool,
}

impl Scheduler {
    /// Resolves every suite against `configs` and builds the dispatch plan.
    ///
    /// # Errors
    ///
    /// Fails without starting anything if:
    /// - a suite's requirement is malformed (empty tag set)
    /// - a suite's requirement matches no config
    /// - suite names or config names are not unique
    pub fn new(
        suites: Vec<SuiteRecord>,
        configs: Vec<EnvironmentConfig>,
        options: SchedulerOptions,
    ) -> Result<Self, SchedulerError> {
        let mut seen = HashSet::new();
        for config in &configs {
            if !seen.insert(config.name.as_str()) {
                return Err(SchedulerError::DuplicateEnvironment(config.name.clone()));
            }
        }

        let mut seen = HashSet::new();
        for suite in &suites {
            if !seen.insert(suite.name()) {
                return Err(SchedulerError::DuplicateSuite(suite.name().to_string()));
            }
            suite
                .requirement()
                .validate()
                .map_err(|source| SchedulerError::InvalidRequirement {
                    suite: suite.name().to_string(),
                    source,
                })?;
        }

        let plan = DispatchPlan::build(&suites, &configs, options.optimize);
        for (i, suite) in suites.iter().enumerate() {
            if plan.eligible(i).is_empty() {
                return Err(SchedulerError::Unsatisfiable {
                    suite: suite.name().to_string(),
                    requirement: suite.requirement().to_string(),
                });
            }
        }

        let claims = ClaimBoard::new(suites.len(), configs.len());
        Ok(Self {
            suites,
            configs,
            options,
            plan,
            claims,
            locks: None,
            has_run: AtomicBool::new(false),
        })
    }

    /// Shares environments with other scheduler processes on this host.
    ///
    /// Each runner takes its config's `env` id in `locks` before dispatching
    /// a suite, waiting while another process holds it, and releases it once
    /// the suite has stopped.
    pub fn with_environment_locks(mut self, locks: EnvironmentLocks) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn environment_locks(&self) -> Option<&EnvironmentLocks> {
        self.locks.as_ref()
    }

    /// Runs every suite to a terminal state.
    ///
    /// Works on any tokio runtime flavour; the per-config runners are driven
    /// concurrently from the calling task.
    pub async fn run(&self) -> Result<RunResult, SchedulerError> {
        self.run_with_reporter(&NullReporter).await
    }

    /// Like [`run`](Self::run), notifying `reporter` of progress.
    ///
    /// Runs at most once per scheduler; a second call returns
    /// [`SchedulerError::AlreadyRun`].
    pub async fn run_with_reporter(&self, reporter: &dyn Reporter) -> Result<RunResult, SchedulerError> {
        if self.has_run.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRun);
        }

        let run_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let start = Instant::now();

        info!(
            run_id = %run_id,
            "Scheduling {} suites across {} handler configurations",
            self.suites.len(),
            self.configs.len()
        );
        reporter.on_run_start(&self.describe()).await;

        let ctx = RunContext {
            suites: &self.suites,
            configs: &self.configs,
            plan: &self.plan,
            claims: &self.claims,
            options: &self.options,
            locks: self.locks.as_ref(),
            reporter,
        };

        // One runner per config, all borrowing the scheduler.
        let ctx = &ctx;
        futures::future::join_all((0..self.configs.len()).map(|config_idx| async move {
            EnvironmentRunner::new(ctx, config_idx).run().await;
        }))
        .await;

        if let Some(locks) = &self.locks {
            match locks.prune(true) {
                Ok(left) if !left.is_empty() => {
                    warn!("Released leftover environment locks: {}", left.join(", "))
                }
                Ok(_) => {}
                Err(e) => warn!("Failed to clean up environment locks: {}", e),
            }
        }

        let result = RunResult::collect(run_id, started_at, start.elapsed(), self);
        info!(
            run_id = %result.run_id,
            completed = result.completed,
            timed_out = result.timed_out,
            skipped = result.skipped,
            failed = result.failed,
            "Run finished in {:?}",
            result.duration
        );
        reporter.on_run_complete(&result).await;

        Ok(result)
    }

    pub fn suites(&self) -> &[SuiteRecord] {
        &self.suites
    }

    pub fn configs(&self) -> &[EnvironmentConfig] {
        &self.configs
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    pub fn plan(&self) -> &DispatchPlan {
        &self.plan
    }

    /// Names-only view of the dispatch plan.
    pub fn describe(&self) -> PlanSummary {
        self.plan.describe(&self.suites, &self.configs)
    }

    /// Looks up a suite by name.
    pub fn suite(&self, name: &str) -> Option<&SuiteRecord> {
        self.suites.iter().find(|s| s.name() == name)
    }

    /// Suites never dispatched because their configs were quarantined.
    pub fn skipped_suites(&self) -> Vec<&SuiteRecord> {
        self.with_status(SuiteStatus::Skipped)
    }

    pub fn timed_out_suites(&self) -> Vec<&SuiteRecord> {
        self.with_status(SuiteStatus::TimedOut)
    }

    /// Suites that stopped on their own, including failed ones.
    pub fn completed_suites(&self) -> Vec<&SuiteRecord> {
        self.with_status(SuiteStatus::Completed)
    }

    pub fn failed_suites(&self) -> Vec<&SuiteRecord> {
        self.suites.iter().filter(|s| s.failed()).collect()
    }

    /// Names of the quarantined configs, in table order.
    pub fn quarantined_configs(&self) -> Vec<&str> {
        self.claims
            .quarantined()
            .into_iter()
            .map(|i| self.configs[i].name.as_str())
            .collect()
    }

    fn with_status(&self, status: SuiteStatus) -> Vec<&SuiteRecord> {
        self.suites.iter().filter(|s| s.status() == status).collect()
    }
}

/// Outcome of one suite, detached from the scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct SuiteReport {
    pub name: String,
    pub status: SuiteStatus,
    pub assigned_config: Option<String>,
    pub failed: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub duration: Option<Duration>,
    pub error: Option<String>,
    pub quarantined_configs: Vec<String>,
}

impl SuiteReport {
    fn from_record(record: &SuiteRecord) -> Self {
        Self {
            name: record.name().to_string(),
            status: record.status(),
            assigned_config: record.assigned_config(),
            failed: record.failed(),
            started_at: record.started_at(),
            duration: record.duration(),
            error: record.error(),
            quarantined_configs: record.quarantined_configs(),
        }
    }
}

/// Aggregated outcome of a run.
///
/// `completed` counts every dispatched suite, timed out ones included, so
/// `completed + skipped == total`.
///
/// # Exit Codes
///
/// | Code | Meaning |
/// |------|---------|
/// | 0 | Every suite completed without failure |
/// | 1 | Some suite failed, timed out or was skipped |
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub total: usize,
    pub completed: usize,
    pub timed_out: usize,
    pub skipped: usize,
    pub failed: usize,
    pub quarantined: Vec<String>,
    pub suites: Vec<SuiteReport>,
}

impl RunResult {
    fn collect(
        run_id: String,
        started_at: DateTime<Utc>,
        duration: Duration,
        scheduler: &Scheduler,
    ) -> Self {
        let suites: Vec<SuiteReport> = scheduler
            .suites
            .iter()
            .map(SuiteReport::from_record)
            .collect();
        let count = |status: SuiteStatus| suites.iter().filter(|s| s.status == status).count();

        Self {
            run_id,
            started_at,
            duration,
            total: suites.len(),
            completed: count(SuiteStatus::Completed) + count(SuiteStatus::TimedOut),
            timed_out: count(SuiteStatus::TimedOut),
            skipped: count(SuiteStatus::Skipped),
            failed: suites.iter().filter(|s| s.failed).count(),
            quarantined: scheduler
                .quarantined_configs()
                .into_iter()
                .map(String::from)
                .collect(),
            suites,
        }
    }

    /// Returns `true` if nothing failed, timed out or was skipped.
    pub fn success(&self) -> bool {
        self.failed == 0 && self.timed_out == 0 && self.skipped == 0
    }

    /// Returns an appropriate process exit code for this result.
    pub fn exit_code(&self) -> i32 {
        if self.success() { 0 } else { 1 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::Requirement;
    use crate::suite::fake::FakeSuite;

    const POLL: Duration = Duration::from_millis(5);

    fn options() -> SchedulerOptions {
        SchedulerOptions::default().with_poll_interval(POLL)
    }

    fn env(name: &str, tags: &[&str]) -> EnvironmentConfig {
        EnvironmentConfig::new(name, format!("{}_id", name)).with_tags(tags.iter().copied())
    }

    fn tagged(name: &str, tags: &[&str], suite: FakeSuite) -> SuiteRecord {
        SuiteRecord::new(name, Requirement::tags(tags.iter().copied()), suite)
    }

    fn pinned(name: &str, config: &str, suite: FakeSuite) -> SuiteRecord {
        SuiteRecord::new(name, Requirement::config(config), suite)
    }

    fn get<'a>(scheduler: &'a Scheduler, name: &str) -> &'a SuiteRecord {
        scheduler.suite(name).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_suite_runs() {
        let scheduler = Scheduler::new(
            vec![tagged("suite1", &["env1"], FakeSuite::instant())],
            vec![env("config1", &["env1"])],
            options(),
        )
        .unwrap();

        let result = scheduler.run().await.unwrap();

        let suite = get(&scheduler, "suite1");
        assert_eq!(suite.status(), SuiteStatus::Completed);
        assert_eq!(suite.assigned_config().as_deref(), Some("config1"));
        assert!(suite.started().is_some());
        assert!(suite.terminated().is_some());
        assert!(!suite.timed_out());
        assert!(scheduler.skipped_suites().is_empty());
        assert!(result.success());
        assert_eq!(result.exit_code(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_config_runs_sequentially() {
        let scheduler = Scheduler::new(
            vec![
                tagged("suite1", &["env1"], FakeSuite::millis(50)),
                tagged("suite2", &["env1"], FakeSuite::millis(50)),
            ],
            vec![env("config1", &["env1"])],
            options(),
        )
        .unwrap();

        scheduler.run().await.unwrap();

        let first = get(&scheduler, "suite1");
        let second = get(&scheduler, "suite2");
        assert!(second.started().unwrap() > first.terminated().unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pinned_and_tagged_on_same_config_are_exclusive() {
        let scheduler = Scheduler::new(
            vec![
                pinned("suite1", "config1", FakeSuite::millis(50)),
                tagged("suite2", &["env1"], FakeSuite::millis(50)),
            ],
            vec![env("config1", &["env1"])],
            options(),
        )
        .unwrap();

        scheduler.run().await.unwrap();

        let first = get(&scheduler, "suite1");
        let second = get(&scheduler, "suite2");
        assert!(second.started().unwrap() > first.terminated().unwrap());
    }

    #[test]
    fn test_unsatisfiable_requirement_fails_construction() {
        let result = Scheduler::new(
            vec![tagged("suite1", &["aaa"], FakeSuite::instant())],
            vec![env("config1", &["env1"])],
            options(),
        );
        match result {
            Err(SchedulerError::Unsatisfiable { suite, .. }) => assert_eq!(suite, "suite1"),
            other => panic!("expected Unsatisfiable, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_unknown_config_name_fails_construction() {
        let result = Scheduler::new(
            vec![pinned("suite1", "nope", FakeSuite::instant())],
            vec![env("config1", &["env1"])],
            options(),
        );
        assert!(matches!(result, Err(SchedulerError::Unsatisfiable { .. })));
    }

    #[test]
    fn test_duplicate_names_fail_construction() {
        let result = Scheduler::new(
            vec![
                tagged("suite1", &["env1"], FakeSuite::instant()),
                tagged("suite1", &["env1"], FakeSuite::instant()),
            ],
            vec![env("config1", &["env1"])],
            options(),
        );
        assert!(matches!(result, Err(SchedulerError::DuplicateSuite(_))));

        let result = Scheduler::new(
            vec![tagged("suite1", &["env1"], FakeSuite::instant())],
            vec![env("config1", &["env1"]), env("config1", &["env2"])],
            options(),
        );
        assert!(matches!(result, Err(SchedulerError::DuplicateEnvironment(_))));
    }

    #[test]
    fn test_empty_tag_set_fails_construction() {
        let result = Scheduler::new(
            vec![SuiteRecord::new("suite1", Requirement::Tags(Default::default()), FakeSuite::instant())],
            vec![env("config1", &["env1"])],
            options(),
        );
        assert!(matches!(
            result,
            Err(SchedulerError::InvalidRequirement {
                source: RequirementError::EmptyTags,
                ..
            })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_distinct_configs_run_in_parallel() {
        let scheduler = Scheduler::new(
            vec![
                tagged("suite1", &["env1"], FakeSuite::millis(300)),
                tagged("suite2", &["env2"], FakeSuite::millis(50)),
                tagged("suite3", &["env2"], FakeSuite::millis(150)),
            ],
            vec![env("config1", &["env1"]), env("config2", &["env2"])],
            options(),
        )
        .unwrap();

        scheduler.run().await.unwrap();

        let long = get(&scheduler, "suite1");
        assert!(get(&scheduler, "suite2").started().unwrap() < long.terminated().unwrap());
        assert!(get(&scheduler, "suite3").started().unwrap() < long.terminated().unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_timeout_quarantines_and_skips() {
        let start = Instant::now();
        let scheduler = Scheduler::new(
            vec![
                tagged("suite1", &["env1"], FakeSuite::millis(5000)),
                tagged("suite2", &["env1"], FakeSuite::instant()),
            ],
            vec![env("config1", &["env1"])],
            options().with_suite_timeout(Duration::from_millis(100)),
        )
        .unwrap();

        let result = scheduler.run().await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));

        let hung = get(&scheduler, "suite1");
        assert!(hung.timed_out());
        assert!(hung.terminated().is_some());

        let stranded = get(&scheduler, "suite2");
        assert!(stranded.started().is_none());
        assert!(stranded.skipped());
        assert_eq!(stranded.quarantined_configs(), vec!["config1".to_string()]);

        let skipped: Vec<&str> = scheduler.skipped_suites().iter().map(|s| s.name()).collect();
        assert_eq!(skipped, vec!["suite2"]);
        assert_eq!(scheduler.quarantined_configs(), vec!["config1"]);
        assert_eq!(result.timed_out, 1);
        assert_eq!(result.skipped, 1);
        assert_eq!(result.exit_code(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_flexible_suite_survives_partial_quarantine() {
        let scheduler = Scheduler::new(
            vec![
                pinned("hang", "config1", FakeSuite::millis(5000)),
                pinned("busy1", "config2", FakeSuite::millis(80)),
                pinned("busy2", "config2", FakeSuite::millis(80)),
                pinned("after", "config1", FakeSuite::instant()),
                tagged("flex", &["env1"], FakeSuite::instant()),
            ],
            vec![env("config1", &["env1"]), env("config2", &["env1"])],
            options().with_suite_timeout(Duration::from_millis(100)),
        )
        .unwrap();

        scheduler.run().await.unwrap();

        let hang = get(&scheduler, "hang");
        assert!(hang.timed_out());
        assert!(get(&scheduler, "after").skipped());
        assert!(!get(&scheduler, "busy2").timed_out());

        // config2 only reaches flex after config1 is already quarantined.
        let flex = get(&scheduler, "flex");
        assert_eq!(flex.status(), SuiteStatus::Completed);
        assert_eq!(flex.assigned_config().as_deref(), Some("config2"));
        assert!(flex.started().unwrap() > hang.terminated().unwrap());
        assert_eq!(scheduler.quarantined_configs(), vec!["config1"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_no_dispatch_after_quarantine() {
        let scheduler = Scheduler::new(
            vec![
                pinned("hang", "config1", FakeSuite::millis(5000)),
                pinned("a", "config1", FakeSuite::instant()),
                tagged("b", &["env1"], FakeSuite::instant()),
                pinned("c", "config1", FakeSuite::instant()),
            ],
            vec![env("config1", &["env1"])],
            options().with_suite_timeout(Duration::from_millis(50)),
        )
        .unwrap();

        scheduler.run().await.unwrap();

        let quarantined_at = get(&scheduler, "hang").terminated().unwrap();
        for suite in scheduler.suites() {
            if let Some(started) = suite.started() {
                assert!(started <= quarantined_at, "{} started after quarantine", suite.name());
            }
        }
        assert_eq!(scheduler.skipped_suites().len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_start_failure_does_not_quarantine() {
        let scheduler = Scheduler::new(
            vec![
                tagged("broken", &["env1"], FakeSuite::instant().failing_start()),
                tagged("next", &["env1"], FakeSuite::instant()),
            ],
            vec![env("config1", &["env1"])],
            options().with_suite_timeout(Duration::from_secs(5)),
        )
        .unwrap();

        let result = scheduler.run().await.unwrap();

        let broken = get(&scheduler, "broken");
        assert_eq!(broken.status(), SuiteStatus::Completed);
        assert!(broken.failed());
        assert!(broken.error().is_some());
        assert_eq!(get(&scheduler, "next").status(), SuiteStatus::Completed);
        assert!(scheduler.quarantined_configs().is_empty());
        assert_eq!(result.failed, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failed_suite_is_reported_not_retried() {
        let scheduler = Scheduler::new(
            vec![tagged("red", &["env1"], FakeSuite::instant().failing())],
            vec![env("config1", &["env1"])],
            options(),
        )
        .unwrap();

        let result = scheduler.run().await.unwrap();

        assert_eq!(scheduler.failed_suites().len(), 1);
        assert_eq!(result.completed, 1);
        assert!(!result.success());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_result_sets_are_disjoint_and_exhaustive() {
        let scheduler = Scheduler::new(
            vec![
                tagged("s1", &["env1"], FakeSuite::millis(5000)),
                tagged("s2", &["env1"], FakeSuite::instant()),
                tagged("s3", &["env2"], FakeSuite::millis(20)),
                tagged("s4", &["env1", "env2"], FakeSuite::instant()),
                pinned("s5", "config2", FakeSuite::instant()),
            ],
            vec![env("config1", &["env1", "env2"]), env("config2", &["env2"])],
            options().with_suite_timeout(Duration::from_millis(100)),
        )
        .unwrap();

        let result = scheduler.run().await.unwrap();

        let completed = scheduler.completed_suites().len();
        let timed_out = scheduler.timed_out_suites().len();
        let skipped = scheduler.skipped_suites().len();
        assert_eq!(completed + timed_out + skipped, 5);
        assert_eq!(result.completed + result.skipped, result.total);
        assert!(scheduler.suites().iter().all(|s| s.status().is_terminal()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_run_only_once() {
        let scheduler = Scheduler::new(
            vec![tagged("suite1", &["env1"], FakeSuite::instant())],
            vec![env("config1", &["env1"])],
            options(),
        )
        .unwrap();

        scheduler.run().await.unwrap();
        assert!(matches!(scheduler.run().await, Err(SchedulerError::AlreadyRun)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_optimize_runs_pinned_before_flexible() {
        // config1 is shared; flex could greedily take it ahead of pin1.
        let scheduler = Scheduler::new(
            vec![
                tagged("flex", &["env1"], FakeSuite::millis(50)),
                pinned("pin1", "config1", FakeSuite::millis(100)),
            ],
            vec![env("config1", &["env1"])],
            options().with_optimize(true),
        )
        .unwrap();

        scheduler.run().await.unwrap();

        let pin = get(&scheduler, "pin1");
        let flex = get(&scheduler, "flex");
        assert!(flex.started().unwrap() > pin.terminated().unwrap());
        assert!(scheduler.skipped_suites().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_optimize_lets_flexible_use_free_config() {
        let scheduler = Scheduler::new(
            vec![
                tagged("flex", &["env1"], FakeSuite::millis(50)),
                pinned("pin1", "config1", FakeSuite::millis(300)),
            ],
            vec![env("config1", &["env1"]), env("config2", &["env1"])],
            options().with_optimize(true),
        )
        .unwrap();

        scheduler.run().await.unwrap();

        let pin = get(&scheduler, "pin1");
        let flex = get(&scheduler, "flex");
        assert_eq!(flex.assigned_config().as_deref(), Some("config2"));
        assert!(flex.started().unwrap() < pin.terminated().unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_optimize_never_causes_skips() {
        let suites = || {
            vec![
                tagged("f1", &["env1"], FakeSuite::millis(20)),
                pinned("p1", "config1", FakeSuite::millis(20)),
                tagged("f2", &["env2"], FakeSuite::millis(20)),
                pinned("p2", "config2", FakeSuite::millis(20)),
                tagged("f3", &["env1", "env2"], FakeSuite::millis(20)),
            ]
        };
        let configs = || {
            vec![
                env("config1", &["env1", "env2"]),
                env("config2", &["env2"]),
            ]
        };

        for optimize in [false, true] {
            let scheduler =
                Scheduler::new(suites(), configs(), options().with_optimize(optimize)).unwrap();
            let result = scheduler.run().await.unwrap();
            assert_eq!(result.skipped, 0);
            assert_eq!(result.completed, 5);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_optimize_never_dispatches_flexible_earlier() {
        let suites = || {
            vec![
                tagged("f1", &["env1"], FakeSuite::millis(40)),
                pinned("p1", "config1", FakeSuite::millis(40)),
                tagged("f2", &["env1"], FakeSuite::millis(40)),
                pinned("p2", "config2", FakeSuite::millis(40)),
            ]
        };
        let configs = || vec![env("config1", &["env1"]), env("config2", &["env1"])];

        let mut offsets = Vec::new();
        for optimize in [false, true] {
            let scheduler =
                Scheduler::new(suites(), configs(), options().with_optimize(optimize)).unwrap();
            let start = Instant::now();
            scheduler.run().await.unwrap();

            let started = |name: &str| get(&scheduler, name).started().unwrap() - start;
            offsets.push((started("f1"), started("f2")));
        }

        let (plain, optimized) = (offsets[0], offsets[1]);
        assert!(optimized.0 >= plain.0, "f1: {:?} < {:?}", optimized.0, plain.0);
        assert!(optimized.1 >= plain.1, "f2: {:?} < {:?}", optimized.1, plain.1);
    }

    #[tokio::test]
    async fn test_runs_on_current_thread_runtime() {
        let scheduler = Scheduler::new(
            vec![
                tagged("suite1", &["env1"], FakeSuite::millis(100)),
                tagged("suite2", &["env2"], FakeSuite::millis(20)),
            ],
            vec![env("config1", &["env1"]), env("config2", &["env2"])],
            options(),
        )
        .unwrap();

        let result = scheduler.run().await.unwrap();

        assert_eq!(result.completed, 2);
        let long = get(&scheduler, "suite1");
        assert!(get(&scheduler, "suite2").started().unwrap() < long.terminated().unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_waits_for_environment_locked_elsewhere() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("environments.json");
        let holder = EnvironmentLocks::new(&path);
        assert!(holder.lock("config1_id").unwrap());

        let scheduler = Scheduler::new(
            vec![tagged("suite1", &["env1"], FakeSuite::instant())],
            vec![env("config1", &["env1"])],
            options(),
        )
        .unwrap()
        .with_environment_locks(EnvironmentLocks::new(&path));

        let start = Instant::now();
        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            holder.release("config1_id").unwrap();
        });
        scheduler.run().await.unwrap();
        release.await.unwrap();

        let suite = get(&scheduler, "suite1");
        assert_eq!(suite.status(), SuiteStatus::Completed);
        assert!(suite.started().unwrap() >= start + Duration::from_millis(100));
        assert_eq!(EnvironmentLocks::new(&path).holder("config1_id").unwrap(), None);
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_lock_of_dead_process_is_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("environments.json");
        let dead = EnvironmentLocks::new(&path).with_pid(999_999_999);
        assert!(dead.lock("config1_id").unwrap());

        let scheduler = Scheduler::new(
            vec![tagged("suite1", &["env1"], FakeSuite::instant())],
            vec![env("config1", &["env1"])],
            options(),
        )
        .unwrap()
        .with_environment_locks(EnvironmentLocks::new(&path));

        let result = scheduler.run().await.unwrap();

        assert!(result.success());
        assert_eq!(EnvironmentLocks::new(&path).holder("config1_id").unwrap(), None);
    }
}
