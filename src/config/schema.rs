//! Configuration schema definitions for suitesched.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── SchedulerConfig        - optimize flag, suite timeout, poll interval
//! ├── ProcessConfig          - how suite commands are launched
//! ├── variables              - free-form table exported to every suite
//! ├── handler_configurations - name -> HandlerConfiguration (env, tags)
//! ├── suites                 - list of SuiteConfig descriptors
//! └── ReportConfig           - output and reporting settings
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::matcher::{Requirement, RequirementError};
use crate::scheduler::SchedulerOptions;

/// Root configuration structure for suitesched.
///
/// # Example
///
/// ```
/// use suitesched::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [handler_configurations.aws-1]
///     env = "aws-account-1"
///     tags = ["aws"]
///
///     [[suites]]
///     name = "hello-world"
///     requires = ["aws"]
///     command = "./run-suite.sh hello_world"
/// "#).unwrap();
///
/// assert_eq!(config.suites.len(), 1);
/// assert!(!config.scheduler.optimize);
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Scheduling settings.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Settings for launching suite commands.
    #[serde(default)]
    pub process: ProcessConfig,

    /// Free-form variables, exported to every suite as `SUITE_VARIABLES`.
    #[serde(default)]
    pub variables: toml::Table,

    /// Environment config table, keyed by config name.
    ///
    /// Iterated in name order; that order is the matcher's table order.
    #[serde(default)]
    pub handler_configurations: BTreeMap<String, HandlerConfiguration>,

    /// Suite descriptors, in dispatch order.
    #[serde(default)]
    pub suites: Vec<SuiteConfig>,

    /// Report configuration (optional, has defaults).
    #[serde(default)]
    pub report: ReportConfig,
}

/// Scheduling settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `optimize` | `false` |
/// | `suite_timeout_secs` | None (no timeout) |
/// | `poll_interval_ms` | 1000 |
/// | `lock_file` | None (environments not shared) |
///
/// # Example
///
/// ```toml
/// [scheduler]
/// optimize = true
/// suite_timeout_secs = 5400
/// lock_file = "/tmp/suitesched-environments.json"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    /// Dispatch pinned suites ahead of flexible ones on shared configs.
    #[serde(default)]
    pub optimize: bool,

    /// Per-suite timeout. A suite exceeding it is terminated and its
    /// environment config quarantined for the rest of the run.
    pub suite_timeout_secs: Option<u64>,

    /// How often running suites are polled for liveness.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Lock file shared with other suitesched processes on this host, so
    /// that no two of them drive the same environment at once.
    pub lock_file: Option<PathBuf>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            optimize: false,
            suite_timeout_secs: None,
            poll_interval_ms: default_poll_interval(),
            lock_file: None,
        }
    }
}

impl SchedulerConfig {
    /// Converts to runtime scheduler options.
    pub fn options(&self) -> SchedulerOptions {
        let mut options = SchedulerOptions::default()
            .with_optimize(self.optimize)
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms.max(1)));
        if let Some(secs) = self.suite_timeout_secs {
            options = options.with_suite_timeout(Duration::from_secs(secs));
        }
        options
    }
}

fn default_poll_interval() -> u64 {
    1000
}

/// Settings for launching suite commands as local processes.
///
/// ```toml
/// [process]
/// shell = "/bin/bash"
/// working_dir = "~/system-tests"
///
/// [process.env]
/// CLOUDIFY_AUTOMATION_TOKEN = "secret"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProcessConfig {
    /// Shell used as `<shell> -c <command>`.
    ///
    /// Default: `"/bin/sh"`
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Working directory for suite commands. `~` and `$VARS` are expanded.
    pub working_dir: Option<PathBuf>,

    /// Environment variables passed to every suite.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            working_dir: None,
            env: BTreeMap::new(),
        }
    }
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

/// One entry of the environment config table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct HandlerConfiguration {
    /// Identifier of the underlying exclusive resource.
    pub env: String,

    /// Capability tags offered.
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

/// A suite descriptor.
///
/// Exactly one of `requires` and `handler_configuration` must be given.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SuiteConfig {
    /// Unique suite name.
    pub name: String,

    /// Required capability tags.
    pub requires: Option<Vec<String>>,

    /// Name of the one environment config this suite must run on.
    pub handler_configuration: Option<String>,

    /// Shell command running the suite.
    pub command: String,

    /// Extra environment variables for this suite only.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Overrides `[process].working_dir`.
    pub working_dir: Option<PathBuf>,
}

impl SuiteConfig {
    /// The requirement declared by this descriptor.
    pub fn requirement(&self) -> Result<Requirement, RequirementError> {
        Requirement::from_descriptor(
            self.requires.as_deref(),
            self.handler_configuration.as_deref(),
        )
    }
}

/// Configuration for run reporting.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `output_dir` | `"suite-results"` |
/// | `junit` | `true` |
/// | `junit_file` | `"junit.xml"` |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Directory for suite logs, per-suite report directories and JUnit XML.
    #[serde(default = "default_report_dir")]
    pub output_dir: PathBuf,

    /// Whether to write a JUnit XML report.
    #[serde(default = "default_true")]
    pub junit: bool,

    /// Filename for the JUnit XML report, written to `{output_dir}/{junit_file}`.
    #[serde(default = "default_junit_file")]
    pub junit_file: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_report_dir(),
            junit: true,
            junit_file: default_junit_file(),
        }
    }
}

impl ReportConfig {
    /// Full path of the JUnit report.
    pub fn junit_path(&self) -> PathBuf {
        self.output_dir.join(&self.junit_file)
    }
}

fn default_report_dir() -> PathBuf {
    PathBuf::from("suite-results")
}

fn default_true() -> bool {
    true
}

fn default_junit_file() -> String {
    "junit.xml".to_string()
}
