//! Run reporting.
//!
//! Reporters receive events while the scheduler runs. Operators care about
//! three outcomes, reported separately: suites that ran, suites that timed
//! out (and took their environment with them), and suites skipped because
//! their environments were lost.

pub mod junit;

use std::sync::Mutex;

use async_trait::async_trait;

use crate::scheduler::RunResult;
use crate::scheduler::plan::PlanSummary;
use crate::suite::{SuiteRecord, SuiteStatus};

pub use junit::JUnitReporter;

/// A reporter receives events during a scheduling run.
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Called once before any suite is dispatched.
    async fn on_run_start(&self, plan: &PlanSummary);

    /// Called when a suite is dispatched to its config.
    async fn on_suite_start(&self, suite: &SuiteRecord);

    /// Called when a dispatched suite stops, on its own or by timeout.
    async fn on_suite_complete(&self, suite: &SuiteRecord);

    /// Called when a suite is skipped because its configs were quarantined.
    async fn on_suite_skipped(&self, suite: &SuiteRecord);

    /// Called when every suite is terminal.
    async fn on_run_complete(&self, result: &RunResult);
}

/// A reporter that does nothing (for testing or when output is not needed).
pub struct NullReporter;

#[async_trait]
impl Reporter for NullReporter {
    async fn on_run_start(&self, _plan: &PlanSummary) {}
    async fn on_suite_start(&self, _suite: &SuiteRecord) {}
    async fn on_suite_complete(&self, _suite: &SuiteRecord) {}
    async fn on_suite_skipped(&self, _suite: &SuiteRecord) {}
    async fn on_run_complete(&self, _result: &RunResult) {}
}

/// A reporter that combines multiple reporters.
pub struct MultiReporter {
    reporters: Vec<Box<dyn Reporter>>,
}

impl MultiReporter {
    /// Create a new multi-reporter.
    pub fn new() -> Self {
        Self {
            reporters: Vec::new(),
        }
    }

    /// Add a reporter to the multi-reporter.
    pub fn with_reporter<R: Reporter + 'static>(mut self, reporter: R) -> Self {
        self.reporters.push(Box::new(reporter));
        self
    }
}

impl Default for MultiReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Reporter for MultiReporter {
    async fn on_run_start(&self, plan: &PlanSummary) {
        for reporter in &self.reporters {
            reporter.on_run_start(plan).await;
        }
    }

    async fn on_suite_start(&self, suite: &SuiteRecord) {
        for reporter in &self.reporters {
            reporter.on_suite_start(suite).await;
        }
    }

    async fn on_suite_complete(&self, suite: &SuiteRecord) {
        for reporter in &self.reporters {
            reporter.on_suite_complete(suite).await;
        }
    }

    async fn on_suite_skipped(&self, suite: &SuiteRecord) {
        for reporter in &self.reporters {
            reporter.on_suite_skipped(suite).await;
        }
    }

    async fn on_run_complete(&self, result: &RunResult) {
        for reporter in &self.reporters {
            reporter.on_run_complete(result).await;
        }
    }
}

/// Console reporter that shows progress in the terminal.
pub struct ConsoleReporter {
    progress: Mutex<Option<indicatif::ProgressBar>>,
    verbose: bool,
}

impl ConsoleReporter {
    /// Create a new console reporter.
    pub fn new(verbose: bool) -> Self {
        Self {
            progress: Mutex::new(None),
            verbose,
        }
    }

    fn println(&self, line: String) {
        match self.progress.lock().ok().as_deref().and_then(Option::as_ref) {
            Some(pb) => pb.println(line),
            None => println!("{}", line),
        }
    }

    fn inc(&self) {
        if let Ok(guard) = self.progress.lock()
            && let Some(pb) = guard.as_ref()
        {
            pb.inc(1);
        }
    }
}

#[async_trait]
impl Reporter for ConsoleReporter {
    async fn on_run_start(&self, plan: &PlanSummary) {
        println!(
            "Scheduling {} suites across {} handler configurations{}",
            plan.suites.len(),
            plan.configs.len(),
            if plan.optimize { " (optimized)" } else { "" }
        );

        let pb = indicatif::ProgressBar::new(plan.suites.len() as u64);
        if let Ok(style) = indicatif::ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            pb.set_style(style.progress_chars("#>-"));
        }

        if let Ok(mut progress) = self.progress.lock() {
            *progress = Some(pb);
        }
    }

    async fn on_suite_start(&self, suite: &SuiteRecord) {
        if self.verbose {
            self.println(format!(
                "Running: {} on {}",
                suite.name(),
                suite.assigned_config().unwrap_or_default()
            ));
        }
    }

    async fn on_suite_complete(&self, suite: &SuiteRecord) {
        self.inc();

        let status = match suite.status() {
            SuiteStatus::TimedOut => console::style("TIME").red().bold(),
            _ if suite.failed() => console::style("FAIL").red(),
            _ => console::style("DONE").green(),
        };

        if self.verbose || suite.failed() || suite.timed_out() {
            self.println(format!(
                "{} {} [{}]",
                status,
                suite.name(),
                suite.assigned_config().unwrap_or_default()
            ));
        }
    }

    async fn on_suite_skipped(&self, suite: &SuiteRecord) {
        self.inc();
        self.println(format!(
            "{} {}",
            console::style("SKIP").yellow(),
            suite.name()
        ));
    }

    async fn on_run_complete(&self, result: &RunResult) {
        if let Ok(mut progress) = self.progress.lock()
            && let Some(pb) = progress.take()
        {
            pb.finish_and_clear();
        }

        println!();
        println!("Suite Results:");
        println!("  Total:     {}", result.total);
        println!("  Ran:       {}", console::style(result.completed - result.timed_out).green());
        println!("  Timed out: {}", console::style(result.timed_out).red());
        println!("  Skipped:   {}", console::style(result.skipped).yellow());
        println!("  Failed:    {}", console::style(result.failed).red());
        println!("  Duration:  {:?}", result.duration);

        if !result.quarantined.is_empty() {
            println!();
            println!(
                "{} {}",
                console::style("Quarantined configurations:").red().bold(),
                result.quarantined.join(", ")
            );
        }

        let timed_out: Vec<_> = result
            .suites
            .iter()
            .filter(|s| s.status == SuiteStatus::TimedOut)
            .collect();
        if !timed_out.is_empty() {
            println!();
            println!("Timed out suites:");
            for suite in timed_out {
                println!(
                    "  - {} [{}]",
                    suite.name,
                    suite.assigned_config.as_deref().unwrap_or_default()
                );
            }
        }

        let skipped: Vec<_> = result
            .suites
            .iter()
            .filter(|s| s.status == SuiteStatus::Skipped)
            .collect();
        if !skipped.is_empty() {
            println!();
            println!("Skipped suites:");
            for suite in skipped {
                println!("  - {}", suite.name);
                println!(
                    "    {}",
                    console::style(format!(
                        "quarantined: {}",
                        suite.quarantined_configs.join(", ")
                    ))
                    .dim()
                );
            }
        }

        let failed: Vec<_> = result.suites.iter().filter(|s| s.failed).collect();
        if !failed.is_empty() {
            println!();
            println!("Failed suites:");
            for suite in failed {
                println!("  - {}", suite.name);
                if let Some(msg) = &suite.error {
                    println!("    {}", console::style(msg).dim());
                }
            }
        }

        println!();
        if result.success() {
            println!("{}", console::style("All suites completed.").green().bold());
        } else if result.timed_out > 0 || result.skipped > 0 {
            println!(
                "{}",
                console::style("Environment problems: some suites timed out or were skipped.")
                    .red()
                    .bold()
            );
        } else {
            println!("{}", console::style("Some suites failed.").red().bold());
        }
    }
}
