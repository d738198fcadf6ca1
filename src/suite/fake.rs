//! In-memory suite for scheduler tests.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{Suite, SuiteError, SuiteResult};
use crate::environment::EnvironmentConfig;

#[derive(Default)]
struct FakeState {
    deadline: Option<Instant>,
    terminated: bool,
}

/// A suite that stays active for a fixed duration after `start`.
pub(crate) struct FakeSuite {
    run_for: Duration,
    fail: bool,
    fail_start: bool,
    state: Mutex<FakeState>,
}

impl FakeSuite {
    pub(crate) fn running_for(run_for: Duration) -> Self {
        Self {
            run_for,
            fail: false,
            fail_start: false,
            state: Mutex::new(FakeState::default()),
        }
    }

    pub(crate) fn millis(ms: u64) -> Self {
        Self::running_for(Duration::from_millis(ms))
    }

    pub(crate) fn instant() -> Self {
        Self::running_for(Duration::ZERO)
    }

    pub(crate) fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub(crate) fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }
}

#[async_trait]
impl Suite for FakeSuite {
    async fn start(&self, _target: &EnvironmentConfig) -> SuiteResult<()> {
        if self.fail_start {
            return Err(SuiteError::StartFailed("fake start failure".to_string()));
        }
        let mut state = self.state.lock().unwrap();
        state.deadline = Some(Instant::now() + self.run_for);
        Ok(())
    }

    async fn is_running(&self) -> bool {
        let state = self.state.lock().unwrap();
        !state.terminated && state.deadline.is_some_and(|d| Instant::now() < d)
    }

    async fn terminate(&self) -> SuiteResult<()> {
        self.state.lock().unwrap().terminated = true;
        Ok(())
    }

    fn failed(&self) -> bool {
        self.fail
    }
}
