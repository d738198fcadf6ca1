//! Dispatch planning.
//!
//! A [`DispatchPlan`] is computed once at construction: the eligible configs
//! of every suite, its class, and one FIFO queue per config. A flexible suite
//! appears in the queue of every config it is eligible for; which queue
//! actually runs it is settled at dispatch time by the claim board.

use serde::Serialize;

use crate::environment::EnvironmentConfig;
use crate::matcher::ResourceMatcher;
use crate::suite::SuiteRecord;

/// Scheduling class of a suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuiteClass {
    /// Names one specific environment config.
    Pinned,
    /// Declares tags; may run on any eligible config.
    Flexible,
}

/// Eligibility and per-config queues for one run.
#[derive(Debug, Clone)]
pub struct DispatchPlan {
    eligible: Vec<Vec<usize>>,
    classes: Vec<SuiteClass>,
    queues: Vec<Vec<usize>>,
    optimize: bool,
}

impl DispatchPlan {
    /// Resolves every suite and builds the queues.
    ///
    /// Suites with no eligible config are left with an empty eligible set;
    /// rejecting them is the scheduler's job. With `optimize`, each queue is
    /// stably partitioned so pinned suites come before flexible ones, keeping
    /// input order within each class.
    pub fn build(suites: &[SuiteRecord], configs: &[EnvironmentConfig], optimize: bool) -> Self {
        let matcher = ResourceMatcher::new(configs);

        let eligible: Vec<Vec<usize>> = suites
            .iter()
            .map(|s| matcher.eligible(s.requirement()))
            .collect();

        let classes: Vec<SuiteClass> = suites
            .iter()
            .map(|s| {
                if s.requirement().is_pinned() {
                    SuiteClass::Pinned
                } else {
                    SuiteClass::Flexible
                }
            })
            .collect();

        let mut queues: Vec<Vec<usize>> = vec![Vec::new(); configs.len()];
        for (suite_idx, configs) in eligible.iter().enumerate() {
            for &config_idx in configs {
                queues[config_idx].push(suite_idx);
            }
        }

        if optimize {
            for queue in &mut queues {
                queue.sort_by_key(|&s| classes[s] == SuiteClass::Flexible);
            }
        }

        Self {
            eligible,
            classes,
            queues,
            optimize,
        }
    }

    /// Suites queued on config `config`, in dispatch order.
    pub fn queue(&self, config: usize) -> &[usize] {
        &self.queues[config]
    }

    /// All queues, indexed by config.
    pub fn queues(&self) -> &[Vec<usize>] {
        &self.queues
    }

    /// Configs eligible to run suite `suite`, in table order.
    pub fn eligible(&self, suite: usize) -> &[usize] {
        &self.eligible[suite]
    }

    /// Class of suite `suite`.
    pub fn class(&self, suite: usize) -> SuiteClass {
        self.classes[suite]
    }

    /// Whether queues were reordered pinned-first.
    pub fn optimized(&self) -> bool {
        self.optimize
    }

    /// Names-only view of the plan for printing and reporting.
    pub fn describe(&self, suites: &[SuiteRecord], configs: &[EnvironmentConfig]) -> PlanSummary {
        let suite_plans = suites
            .iter()
            .enumerate()
            .map(|(i, s)| SuitePlan {
                name: s.name().to_string(),
                requirement: s.requirement().to_string(),
                class: self.classes[i],
                eligible: self.eligible[i]
                    .iter()
                    .map(|&c| configs[c].name.clone())
                    .collect(),
            })
            .collect();

        let config_plans = configs
            .iter()
            .enumerate()
            .map(|(i, c)| ConfigPlan {
                name: c.name.clone(),
                env: c.env.clone(),
                tags: c.tags.iter().cloned().collect(),
                queue: self.queues[i]
                    .iter()
                    .map(|&s| suites[s].name().to_string())
                    .collect(),
            })
            .collect();

        PlanSummary {
            optimize: self.optimize,
            suites: suite_plans,
            configs: config_plans,
        }
    }
}

/// Serializable view of a [`DispatchPlan`].
#[derive(Debug, Clone, Serialize)]
pub struct PlanSummary {
    pub optimize: bool,
    pub suites: Vec<SuitePlan>,
    pub configs: Vec<ConfigPlan>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SuitePlan {
    pub name: String,
    pub requirement: String,
    pub class: SuiteClass,
    pub eligible: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigPlan {
    pub name: String,
    pub env: String,
    pub tags: Vec<String>,
    pub queue: Vec<String>,
}
