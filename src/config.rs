//! Configuration loading and schema definitions for suitesched.
//!
//! This module loads the TOML configuration, selects which suites to run and
//! turns the selection into a ready-to-run [`Scheduler`] backed by
//! [`ProcessSuite`]s.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result, bail};
use regex::Regex;

use crate::environment::EnvironmentConfig;
use crate::environment::locks::EnvironmentLocks;
use crate::scheduler::{Scheduler, SchedulerError, SchedulerOptions};
use crate::suite::SuiteRecord;
use crate::suite::process::ProcessSuite;

/// Loads configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
///
/// # Example
///
/// ```no_run
/// use suitesched::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("suitesched.toml"))?;
/// println!("Suites: {}", config.suites.len());
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads configuration from a TOML string.
///
/// # Example
///
/// ```
/// use suitesched::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [scheduler]
///     optimize = true
///
///     [handler_configurations.config1]
///     env = "env1_id"
///     tags = ["env1"]
/// "#)?;
///
/// assert!(config.scheduler.optimize);
/// assert_eq!(config.environments()[0].name, "config1");
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}

impl Config {
    /// The environment config table, in name order.
    pub fn environments(&self) -> Vec<EnvironmentConfig> {
        self.handler_configurations
            .iter()
            .map(|(name, handler)| EnvironmentConfig {
                name: name.clone(),
                env: handler.env.clone(),
                tags: handler.tags.clone(),
            })
            .collect()
    }

    /// Host-wide environment locks, when `[scheduler].lock_file` is set.
    pub fn environment_locks(&self) -> Option<EnvironmentLocks> {
        self.scheduler.lock_file.as_ref().map(EnvironmentLocks::new)
    }

    /// Selects suites by exact name and/or regex, keeping file order.
    ///
    /// With no names and no filter every suite is selected. A name that does
    /// not match any configured suite is an error.
    pub fn select_suites(&self, names: &[String], filter: Option<&Regex>) -> Result<Vec<&SuiteConfig>> {
        for name in names {
            if !self.suites.iter().any(|s| &s.name == name) {
                bail!("Unknown suite: {}", name);
            }
        }

        let selected: Vec<&SuiteConfig> = self
            .suites
            .iter()
            .filter(|s| names.is_empty() || names.contains(&s.name))
            .filter(|s| filter.is_none_or(|re| re.is_match(&s.name)))
            .collect();

        Ok(selected)
    }
}

/// Builds a scheduler running `selected` as process suites.
///
/// Every configuration error (malformed requirement, unknown config name,
/// unsatisfiable tags, duplicate names) surfaces here, before anything runs.
pub fn build_scheduler(
    config: &Config,
    selected: &[&SuiteConfig],
    options: SchedulerOptions,
) -> Result<Scheduler> {
    let mut records = Vec::with_capacity(selected.len());
    for suite in selected {
        let requirement =
            suite
                .requirement()
                .map_err(|source| SchedulerError::InvalidRequirement {
                    suite: suite.name.clone(),
                    source,
                })?;
        let process = ProcessSuite::from_config(suite, config)
            .with_context(|| format!("Failed to prepare suite '{}'", suite.name))?;
        records.push(SuiteRecord::new(&suite.name, requirement, process));
    }

    let mut scheduler = Scheduler::new(records, config.environments(), options)?;
    if let Some(locks) = config.environment_locks() {
        scheduler = scheduler.with_environment_locks(locks);
    }
    Ok(scheduler)
}
