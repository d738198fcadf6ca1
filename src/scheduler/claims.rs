//! The only state shared between runners.
//!
//! Claiming a suite and quarantining a config happen under one lock, so a
//! runner can never claim a suite onto a config that is already quarantined,
//! and a suite whose last eligible config has been quarantined is skipped
//! exactly once.

use std::sync::{Mutex, MutexGuard};

use super::plan::DispatchPlan;

/// Outcome of [`ClaimBoard::try_claim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The suite is now owned by the calling runner.
    Granted,
    /// Another runner claimed (or skipped) it first.
    Taken,
    /// The calling runner's config is quarantined.
    Quarantined,
}

#[derive(Debug)]
struct Board {
    claimed: Vec<bool>,
    quarantined: Vec<bool>,
}

/// Atomic claim and quarantine bookkeeping.
#[derive(Debug)]
pub struct ClaimBoard {
    inner: Mutex<Board>,
}

impl ClaimBoard {
    pub fn new(suites: usize, configs: usize) -> Self {
        Self {
            inner: Mutex::new(Board {
                claimed: vec![false; suites],
                quarantined: vec![false; configs],
            }),
        }
    }

    fn board(&self) -> MutexGuard<'_, Board> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claims `suite` for the runner owning `config`.
    pub fn try_claim(&self, suite: usize, config: usize) -> Claim {
        let mut board = self.board();
        if board.quarantined[config] {
            return Claim::Quarantined;
        }
        if board.claimed[suite] {
            return Claim::Taken;
        }
        board.claimed[suite] = true;
        Claim::Granted
    }

    /// Quarantines `config`. Returns `true` the first time.
    pub fn quarantine(&self, config: usize) -> bool {
        let mut board = self.board();
        let newly = !board.quarantined[config];
        board.quarantined[config] = true;
        newly
    }

    pub fn is_quarantined(&self, config: usize) -> bool {
        self.board().quarantined[config]
    }

    /// Indices of every quarantined config.
    pub fn quarantined(&self) -> Vec<usize> {
        self.board()
            .quarantined
            .iter()
            .enumerate()
            .filter(|(_, q)| **q)
            .map(|(i, _)| i)
            .collect()
    }

    /// Claims and returns the unclaimed suites in `remaining` that have no
    /// eligible config left outside quarantine.
    ///
    /// Suites with another live config are left for that config's runner.
    pub fn drain(&self, remaining: &[usize], plan: &DispatchPlan) -> Vec<usize> {
        let mut board = self.board();
        let mut skipped = Vec::new();
        for &suite in remaining {
            if board.claimed[suite] {
                continue;
            }
            let stranded = plan
                .eligible(suite)
                .iter()
                .all(|&config| board.quarantined[config]);
            if stranded {
                board.claimed[suite] = true;
                skipped.push(suite);
            }
        }
        skipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::EnvironmentConfig;
    use crate::matcher::Requirement;
    use crate::suite::SuiteRecord;
    use crate::suite::fake::FakeSuite;

    #[test]
    fn test_claim_once() {
        let board = ClaimBoard::new(1, 2);
        assert_eq!(board.try_claim(0, 0), Claim::Granted);
        assert_eq!(board.try_claim(0, 1), Claim::Taken);
    }

    #[test]
    fn test_quarantine_blocks_claims_and_is_one_way() {
        let board = ClaimBoard::new(1, 1);
        assert!(board.quarantine(0));
        assert!(!board.quarantine(0));
        assert!(board.is_quarantined(0));
        assert_eq!(board.try_claim(0, 0), Claim::Quarantined);
        assert_eq!(board.quarantined(), vec![0]);
    }

    #[test]
    fn test_drain_only_takes_stranded_suites() {
        let configs = vec![
            EnvironmentConfig::new("config1", "env1_id").with_tag("env1"),
            EnvironmentConfig::new("config2", "env2_id").with_tag("env1"),
        ];
        let suites = vec![
            SuiteRecord::new("pinned", Requirement::config("config1"), FakeSuite::instant()),
            SuiteRecord::new("flex", Requirement::tags(["env1"]), FakeSuite::instant()),
        ];
        let plan = DispatchPlan::build(&suites, &configs, false);
        let board = ClaimBoard::new(2, 2);

        board.quarantine(0);
        assert_eq!(board.drain(plan.queue(0), &plan), vec![0]);
        assert_eq!(board.try_claim(1, 1), Claim::Granted);

        // Already claimed suites are never drained twice.
        board.quarantine(1);
        assert!(board.drain(plan.queue(1), &plan).is_empty());
    }
}
