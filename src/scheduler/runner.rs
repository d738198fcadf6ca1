//! Per-config runner.
//!
//! Exactly one [`EnvironmentRunner`] owns each environment config, which is
//! what keeps configs exclusive: a runner dispatches one suite, watches it
//! until it stops or times out, and only then moves on to its next queue
//! entry.

use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::SchedulerOptions;
use super::claims::{Claim, ClaimBoard};
use super::plan::DispatchPlan;
use crate::environment::EnvironmentConfig;
use crate::environment::locks::{EnvironmentLocks, LockResult};
use crate::report::Reporter;
use crate::suite::{Suite, SuiteError, SuiteRecord};

/// Everything a runner borrows from the scheduler for one run.
pub(crate) struct RunContext<'a> {
    pub suites: &'a [SuiteRecord],
    pub configs: &'a [EnvironmentConfig],
    pub plan: &'a DispatchPlan,
    pub claims: &'a ClaimBoard,
    pub options: &'a SchedulerOptions,
    pub locks: Option<&'a EnvironmentLocks>,
    pub reporter: &'a dyn Reporter,
}

/// How a dispatched suite ended.
enum Outcome {
    Stopped,
    StartFailed(SuiteError),
    TimedOut,
}

/// Drives the queue of a single environment config.
pub(crate) struct EnvironmentRunner<'a> {
    ctx: &'a RunContext<'a>,
    config_idx: usize,
}

impl<'a> EnvironmentRunner<'a> {
    pub fn new(ctx: &'a RunContext<'a>, config_idx: usize) -> Self {
        Self { ctx, config_idx }
    }

    fn config(&self) -> &'a EnvironmentConfig {
        &self.ctx.configs[self.config_idx]
    }

    /// Runs until the queue holds nothing more to claim.
    pub async fn run(&self) {
        let queue = self.ctx.plan.queue(self.config_idx);
        let config = self.config();

        for (pos, &suite_idx) in queue.iter().enumerate() {
            match self.ctx.claims.try_claim(suite_idx, self.config_idx) {
                Claim::Granted => self.dispatch(suite_idx).await,
                Claim::Taken => {
                    debug!(
                        suite = %self.ctx.suites[suite_idx].name(),
                        config = %config.name,
                        "already claimed elsewhere"
                    );
                }
                Claim::Quarantined => {
                    self.skip_stranded(&queue[pos..]).await;
                    break;
                }
            }
        }

        debug!(config = %config.name, "runner finished");
    }

    async fn skip_stranded(&self, remaining: &[usize]) {
        for suite_idx in self.ctx.claims.drain(remaining, self.ctx.plan) {
            let record = &self.ctx.suites[suite_idx];
            let quarantined: Vec<String> = self
                .ctx
                .plan
                .eligible(suite_idx)
                .iter()
                .map(|&c| self.ctx.configs[c].name.clone())
                .collect();

            warn!(
                suite = %record.name(),
                config = %self.config().name,
                "Skipping suite: all eligible configs quarantined ({})",
                quarantined.join(", ")
            );
            record.mark_skipped(quarantined);
            self.ctx.reporter.on_suite_skipped(record).await;
        }
    }

    async fn dispatch(&self, suite_idx: usize) {
        let record = &self.ctx.suites[suite_idx];
        let config = self.config();

        let locked = self.lock_environment().await;

        if !record.mark_started(&config.name) {
            self.release_environment(&locked);
            return;
        }
        info!(suite = %record.name(), config = %config.name, "Starting suite");
        self.ctx.reporter.on_suite_start(record).await;

        let outcome = match &locked {
            Ok(_) => self.execute(record.handle(), config).await,
            Err(e) => Outcome::StartFailed(SuiteError::StartFailed(format!(
                "cannot lock environment '{}': {}",
                config.env, e
            ))),
        };

        match outcome {
            Outcome::Stopped => {
                record.mark_completed();
                info!(
                    suite = %record.name(),
                    config = %config.name,
                    failed = record.failed(),
                    "Suite completed"
                );
            }
            Outcome::StartFailed(e) => {
                error!(suite = %record.name(), config = %config.name, "{}", e);
                record.mark_start_failed(e.to_string());
            }
            Outcome::TimedOut => {
                if let Err(e) = record.handle().terminate().await {
                    error!(suite = %record.name(), config = %config.name, "{}", e);
                }
                record.mark_timed_out();
                if self.ctx.claims.quarantine(self.config_idx) {
                    warn!(
                        suite = %record.name(),
                        config = %config.name,
                        "Suite timed out, quarantining config"
                    );
                }
            }
        }

        self.release_environment(&locked);
        self.ctx.reporter.on_suite_complete(record).await;
    }

    /// Takes this config's environment in the shared lock file, waiting while
    /// another process holds it. `Ok(false)` when no lock file is in use.
    async fn lock_environment(&self) -> LockResult<bool> {
        let Some(locks) = self.ctx.locks else {
            return Ok(false);
        };
        let config = self.config();
        let mut waiting = false;

        loop {
            if locks.lock(&config.env)? {
                if waiting {
                    info!(config = %config.name, env = %config.env, "Environment lock acquired");
                }
                return Ok(true);
            }
            if !waiting {
                info!(
                    config = %config.name,
                    env = %config.env,
                    "Environment is locked elsewhere, waiting"
                );
                waiting = true;
            }
            let pruned = locks.prune(false)?;
            if !pruned.is_empty() {
                debug!(config = %config.name, "pruned stale locks: {}", pruned.join(", "));
            }
            tokio::time::sleep(self.ctx.options.poll_interval.max(Duration::from_millis(1))).await;
        }
    }

    fn release_environment(&self, locked: &LockResult<bool>) {
        let (Some(locks), Ok(true)) = (self.ctx.locks, locked) else {
            return;
        };
        let config = self.config();
        if let Err(e) = locks.release(&config.env) {
            error!(config = %config.name, env = %config.env, "{}", e);
        }
    }

    /// Starts the suite and waits for it to stop, bounded by the suite timeout.
    async fn execute(&self, suite: &dyn Suite, config: &EnvironmentConfig) -> Outcome {
        let work = async {
            suite.start(config).await?;
            watch(suite, self.ctx.options.poll_interval).await;
            Ok::<(), SuiteError>(())
        };

        let finished = match self.ctx.options.suite_timeout {
            Some(limit) => match tokio::time::timeout(limit, work).await {
                Ok(result) => result,
                Err(_) => return Outcome::TimedOut,
            },
            None => work.await,
        };

        match finished {
            Ok(()) => Outcome::Stopped,
            Err(e) => Outcome::StartFailed(e),
        }
    }
}

/// Polls `is_running` until the suite reports it has stopped.
async fn watch(suite: &dyn Suite, poll: Duration) {
    let mut ticker = tokio::time::interval(poll.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if !suite.is_running().await {
            return;
        }
    }
}
