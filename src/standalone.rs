use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::errors::ScenarioError;
use crate::exceptions::{ErrorKey, ExceptionRecord};
use crate::ramp::RampScheduler;
use crate::runner::{Runner, RunnerContext};
use crate::scenario::ScenarioDefinition;
use crate::state::RunnerState;
use crate::stats::{StatsEntry, StatsKey};

/// Single-process runner: one local scheduler feeding the local registries.
pub struct StandaloneRunner {
    ctx: Arc<RunnerContext>,
    scheduler: RampScheduler,
}

impl StandaloneRunner {
    pub fn new(
        ctx: Arc<RunnerContext>,
        scenarios: Vec<ScenarioDefinition>,
        seed: Option<u64>,
    ) -> Result<Self, ScenarioError> {
        let scheduler = RampScheduler::new(ctx.clone(), scenarios, seed)?;
        Ok(Self { ctx, scheduler })
    }

    pub fn context(&self) -> &Arc<RunnerContext> {
        &self.ctx
    }

    pub fn scheduler(&self) -> &RampScheduler {
        &self.scheduler
    }
}

#[async_trait]
impl Runner for StandaloneRunner {
    fn start_ramp(&self, target_count: usize, hatch_rate: f64) {
        self.scheduler.start_ramp(target_count, hatch_rate);
    }

    fn stop(&self) {
        self.scheduler.stop();
    }

    fn reset_stats(&self) {
        self.ctx.reset_all();
    }

    fn state(&self) -> RunnerState {
        self.scheduler.state()
    }

    async fn wait_for_state(&self, state: RunnerState) {
        self.scheduler.wait_for_state(state).await;
    }

    fn user_count(&self) -> usize {
        self.scheduler.user_count()
    }

    fn target_user_count(&self) -> usize {
        self.scheduler.target_user_count()
    }

    fn hatch_rate(&self) -> f64 {
        self.scheduler.hatch_rate()
    }

    fn request_stats(&self) -> BTreeMap<StatsKey, StatsEntry> {
        self.ctx.stats.entries()
    }

    fn total_stats(&self) -> StatsEntry {
        self.ctx.stats.total()
    }

    fn errors(&self) -> BTreeMap<ErrorKey, ExceptionRecord> {
        self.ctx.exceptions.records()
    }
}
