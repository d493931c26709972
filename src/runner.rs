//! The control surface shared by every deployment mode.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::exceptions::{ErrorKey, ExceptionRecord, ExceptionRegistry};
use crate::state::RunnerState;
use crate::stats::{StatsEntry, StatsKey, StatsRegistry};

/// Per-process runtime state, created once and shared by `Arc`.
pub struct RunnerContext {
    pub node_id: String,
    pub stats: StatsRegistry,
    pub exceptions: ExceptionRegistry,
}

impl RunnerContext {
    pub fn new(node_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            node_id: node_id.into(),
            stats: StatsRegistry::new(),
            exceptions: ExceptionRegistry::new(),
        })
    }

    /// Clears request stats and exception records.
    pub fn reset_all(&self) {
        self.stats.reset();
        self.exceptions.reset();
    }
}

/// Operations every runner supports, whatever its deployment mode.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Begins or re-targets a ramp toward `target_count` users at
    /// `hatch_rate` users per second. Invalid rates are ignored.
    fn start_ramp(&self, target_count: usize, hatch_rate: f64);

    /// Ramps to zero at maximum rate. Idempotent.
    fn stop(&self);

    fn reset_stats(&self);

    fn state(&self) -> RunnerState;

    /// Resolves once the runner reaches `state`.
    async fn wait_for_state(&self, state: RunnerState);

    fn user_count(&self) -> usize;

    fn target_user_count(&self) -> usize;

    fn hatch_rate(&self) -> f64;

    /// Connected, non-lost workers. Always 0 outside controller mode.
    fn worker_count(&self) -> usize {
        0
    }

    fn request_stats(&self) -> BTreeMap<StatsKey, StatsEntry>;

    /// Aggregated row across every endpoint.
    fn total_stats(&self) -> StatsEntry;

    fn errors(&self) -> BTreeMap<ErrorKey, ExceptionRecord>;

    /// True when any failed sample or exception has been recorded.
    fn has_errors(&self) -> bool {
        self.total_stats().num_failures > 0 || !self.errors().is_empty()
    }
}
