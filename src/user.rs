//! The simulated-user task loop.

use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::errors::ActionError;
use crate::metrics::{
    EXCEPTIONS_TOTAL, REQUESTS_TOTAL, REQUEST_DURATION_SECONDS, REQUEST_FAILURES_TOTAL,
};
use crate::runner::RunnerContext;
use crate::scenario::{Action, ActionOutcome, ScenarioDefinition, UserContext};
use crate::selector::WeightedTable;

/// One simulated user: repeatedly picks a weighted action from its scenario,
/// runs it and records the outcome, until its retire flag is raised.
pub struct SimulatedUser {
    ctx: Arc<RunnerContext>,
    scenario: Arc<ScenarioDefinition>,
    actions: WeightedTable,
    retire: Arc<AtomicBool>,
    user: UserContext,
}

impl SimulatedUser {
    pub fn new(
        ctx: Arc<RunnerContext>,
        scenario: Arc<ScenarioDefinition>,
        actions: WeightedTable,
        retire: Arc<AtomicBool>,
        user: UserContext,
    ) -> Self {
        Self {
            ctx,
            scenario,
            actions,
            retire,
            user,
        }
    }

    pub async fn run(mut self) {
        debug!(
            user_id = self.user.user_id,
            scenario = %self.scenario.name,
            "User started"
        );

        while !self.retire.load(Ordering::Acquire) {
            let index = self.actions.pick(&mut self.user.rng);
            let action = self.scenario.actions[index].action.clone();
            if !self.execute(action.as_ref()).await {
                debug!(
                    user_id = self.user.user_id,
                    scenario = %self.scenario.name,
                    "User stopped itself"
                );
                return;
            }
            tokio::task::yield_now().await;
        }

        debug!(
            user_id = self.user.user_id,
            scenario = %self.scenario.name,
            "User retired"
        );
    }

    /// Runs one action and records its outcome. Returns false when the action
    /// asked the user to stop.
    async fn execute(&mut self, action: &dyn Action) -> bool {
        let started = Instant::now();
        let result = AssertUnwindSafe(action.run(&mut self.user))
            .catch_unwind()
            .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let method = action.method();
        let name = action.name();
        match result {
            Ok(Ok(ActionOutcome::Success { content_length })) => {
                self.record(method, name, elapsed_ms, true, content_length);
            }
            Ok(Ok(ActionOutcome::Failure { error })) => {
                self.record(method, name, elapsed_ms, false, 0);
                let summary = error
                    .stack_summary
                    .clone()
                    .unwrap_or_else(|| format!("{} {}", method, name));
                self.record_exception(&error.message, &summary);
            }
            Ok(Ok(ActionOutcome::StopUser)) => return false,
            Ok(Err(error)) => {
                self.record(method, name, elapsed_ms, false, 0);
                let summary = self.default_summary(method, name, &error);
                self.record_exception(&error.message, &summary);
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(
                    user_id = self.user.user_id,
                    scenario = %self.scenario.name,
                    method,
                    name,
                    error = %message,
                    "Action panicked"
                );
                self.record(method, name, elapsed_ms, false, 0);
                let summary = format!("{} -> {} {} (panic)", self.scenario.name, method, name);
                self.record_exception(&message, &summary);
            }
        }
        true
    }

    fn default_summary(&self, method: &str, name: &str, error: &ActionError) -> String {
        error
            .stack_summary
            .clone()
            .unwrap_or_else(|| format!("{} -> {} {}", self.scenario.name, method, name))
    }

    fn record(&self, method: &str, name: &str, elapsed_ms: u64, success: bool, content_length: u64) {
        self.ctx
            .stats
            .record(method, name, elapsed_ms, success, content_length);

        REQUESTS_TOTAL.with_label_values(&[method, name]).inc();
        if !success {
            REQUEST_FAILURES_TOTAL.with_label_values(&[method, name]).inc();
        }
        REQUEST_DURATION_SECONDS.observe(elapsed_ms as f64 / 1000.0);
    }

    fn record_exception(&self, message: &str, stack_summary: &str) {
        self.ctx
            .exceptions
            .record(message, stack_summary, &self.ctx.node_id);
        EXCEPTIONS_TOTAL.inc();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "action panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::atomic::AtomicUsize;

    struct Scripted {
        calls: AtomicUsize,
        retire_after: usize,
        retire: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Action for Scripted {
        fn method(&self) -> &str {
            "GET"
        }

        fn name(&self) -> &str {
            "/scripted"
        }

        async fn run(&self, _user: &mut UserContext) -> Result<ActionOutcome, ActionError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call >= self.retire_after {
                self.retire.store(true, Ordering::Release);
            }
            match call % 4 {
                0 => Ok(ActionOutcome::success(10)),
                1 => Ok(ActionOutcome::failure("bad status")),
                2 => Err(ActionError::new("connection reset")),
                _ => panic!("exploded"),
            }
        }
    }

    #[tokio::test]
    async fn every_outcome_is_recorded_once() {
        let ctx = RunnerContext::new("node-1");
        let retire = Arc::new(AtomicBool::new(false));
        let action = Arc::new(Scripted {
            calls: AtomicUsize::new(0),
            retire_after: 8,
            retire: retire.clone(),
        });
        let scenario = Arc::new(ScenarioDefinition::new("browse", 1.0).with_action(1.0, action));
        let table = scenario.action_table().unwrap();

        let user = SimulatedUser::new(
            ctx.clone(),
            scenario,
            table,
            retire,
            UserContext {
                user_id: 1,
                scenario: "browse".to_string(),
                node_id: "node-1".to_string(),
                rng: StdRng::seed_from_u64(0),
            },
        );
        user.run().await;

        let total = ctx.stats.total();
        assert_eq!(total.num_requests, 8);
        assert_eq!(total.num_failures, 6);

        let errors = ctx.exceptions.records();
        assert_eq!(errors.len(), 3);
        let mut summaries: Vec<_> = errors.values().map(|r| r.stack_summary.clone()).collect();
        summaries.sort();
        assert_eq!(
            summaries,
            vec![
                "GET /scripted".to_string(),
                "browse -> GET /scripted".to_string(),
                "browse -> GET /scripted (panic)".to_string(),
            ]
        );
        assert!(errors.values().all(|r| r.count == 2));
        assert!(errors
            .values()
            .all(|r| r.origin_node_ids.contains("node-1")));
    }

    struct Quitter;

    #[async_trait]
    impl Action for Quitter {
        fn method(&self) -> &str {
            "GET"
        }

        fn name(&self) -> &str {
            "/quit"
        }

        async fn run(&self, _user: &mut UserContext) -> Result<ActionOutcome, ActionError> {
            Ok(ActionOutcome::StopUser)
        }
    }

    #[tokio::test]
    async fn stop_user_exits_without_a_sample() {
        let ctx = RunnerContext::new("node-1");
        let scenario = Arc::new(
            ScenarioDefinition::new("browse", 1.0).with_action(1.0, Arc::new(Quitter)),
        );
        let table = scenario.action_table().unwrap();
        let user = SimulatedUser::new(
            ctx.clone(),
            scenario,
            table,
            Arc::new(AtomicBool::new(false)),
            UserContext {
                user_id: 1,
                scenario: "browse".to_string(),
                node_id: "node-1".to_string(),
                rng: StdRng::seed_from_u64(0),
            },
        );
        user.run().await;

        assert!(ctx.stats.is_empty());
        assert_eq!(ctx.stats.total().num_requests, 0);
        assert!(ctx.exceptions.is_empty());
    }

    #[test]
    fn panic_payloads_become_messages() {
        assert_eq!(panic_message(&"static str"), "static str");
        assert_eq!(panic_message(&"owned".to_string()), "owned");
        assert_eq!(panic_message(&42u8), "action panicked");
    }
}
