//! End-to-end tests for the single-process runner.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use swarmlet::errors::ActionError;
use swarmlet::runner::{Runner, RunnerContext};
use swarmlet::scenario::{Action, ActionOutcome, ScenarioDefinition, UserContext};
use swarmlet::standalone::StandaloneRunner;
use swarmlet::state::RunnerState;
use swarmlet::stats::StatsKey;
use tokio::time::{self, Duration};

/// Hands out a fixed number of tickets. Every ticket is one recorded request;
/// once they run out, users stop themselves.
struct Tickets {
    issued: AtomicUsize,
    limit: usize,
}

#[async_trait]
impl Action for Tickets {
    fn method(&self) -> &str {
        "GET"
    }

    fn name(&self) -> &str {
        "/ticket"
    }

    async fn run(&self, _user: &mut UserContext) -> Result<ActionOutcome, ActionError> {
        if self.issued.fetch_add(1, Ordering::SeqCst) >= self.limit {
            return Ok(ActionOutcome::StopUser);
        }
        time::sleep(Duration::from_secs(1)).await;
        Ok(ActionOutcome::success(128))
    }
}

/// Fails half of its calls, alternating a failed outcome and a raised error.
struct Flaky {
    calls: AtomicUsize,
}

#[async_trait]
impl Action for Flaky {
    fn method(&self) -> &str {
        "POST"
    }

    fn name(&self) -> &str {
        "/flaky"
    }

    async fn run(&self, _user: &mut UserContext) -> Result<ActionOutcome, ActionError> {
        time::sleep(Duration::from_millis(20)).await;
        match self.calls.fetch_add(1, Ordering::SeqCst) % 4 {
            0 => Ok(ActionOutcome::failure("HTTP 500")),
            2 => Err(ActionError::new("connection reset")),
            _ => Ok(ActionOutcome::success(64)),
        }
    }
}

async fn wait_for_requests(runner: &dyn Runner, count: u64) {
    time::timeout(Duration::from_secs(60), async {
        while runner.total_stats().num_requests < count {
            time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("requests were not recorded in time");
}

#[tokio::test(start_paused = true)]
async fn test_end_to_end_twenty_samples() {
    let action = Arc::new(Tickets {
        issued: AtomicUsize::new(0),
        limit: 20,
    });
    let scenario = ScenarioDefinition::new("tickets", 1.0).with_action(1.0, action);
    let runner = StandaloneRunner::new(RunnerContext::new("local"), vec![scenario], Some(1)).unwrap();

    runner.start_ramp(5, 5.0);
    wait_for_requests(&runner, 20).await;
    runner.stop();
    time::timeout(Duration::from_secs(10), runner.wait_for_state(RunnerState::Stopped))
        .await
        .expect("runner did not stop");

    assert_eq!(runner.state(), RunnerState::Stopped);
    assert_eq!(runner.user_count(), 0);

    let stats = runner.request_stats();
    assert_eq!(stats.len(), 1);
    let entry = &stats[&StatsKey::new("GET", "/ticket")];
    assert_eq!(entry.num_requests, 20);
    assert_eq!(entry.num_failures, 0);
    assert_eq!(entry.total_content_length, 20 * 128);
    assert_eq!(runner.total_stats().num_requests, 20);
    assert!(!runner.has_errors());

    println!("✅ 5 users at 5/s record exactly 20 samples and stop cleanly");
}

#[tokio::test(start_paused = true)]
async fn test_failures_are_recorded_and_deduplicated() {
    let action = Arc::new(Flaky {
        calls: AtomicUsize::new(0),
    });
    let scenario = ScenarioDefinition::new("flaky", 1.0).with_action(1.0, action);
    let runner = StandaloneRunner::new(RunnerContext::new("local"), vec![scenario], Some(2)).unwrap();

    runner.start_ramp(3, 10.0);
    wait_for_requests(&runner, 40).await;
    runner.stop();
    time::timeout(Duration::from_secs(10), runner.wait_for_state(RunnerState::Stopped))
        .await
        .expect("runner did not stop");

    let total = runner.total_stats();
    assert!(total.num_failures > 0);
    assert!(total.num_failures < total.num_requests);
    assert!(runner.has_errors());

    let errors = runner.errors();
    assert_eq!(errors.len(), 2, "one record per distinct message");
    let counted: u64 = errors.values().map(|r| r.count).sum();
    assert_eq!(counted, total.num_failures);
    assert!(errors
        .values()
        .all(|r| r.origin_node_ids.len() == 1 && r.origin_node_ids.contains("local")));

    println!("✅ Failed samples land in stats and in deduplicated exception records");
}

#[tokio::test(start_paused = true)]
async fn test_reset_stats_keeps_state() {
    let action = Arc::new(Flaky {
        calls: AtomicUsize::new(0),
    });
    let scenario = ScenarioDefinition::new("flaky", 1.0).with_action(1.0, action);
    let runner = StandaloneRunner::new(RunnerContext::new("local"), vec![scenario], None).unwrap();

    runner.start_ramp(2, 10.0);
    time::timeout(Duration::from_secs(10), runner.wait_for_state(RunnerState::Running))
        .await
        .expect("runner did not reach RUNNING");
    wait_for_requests(&runner, 10).await;

    runner.reset_stats();
    assert!(runner.request_stats().is_empty());
    assert!(runner.errors().is_empty());
    assert_eq!(runner.state(), RunnerState::Running);
    assert_eq!(runner.user_count(), 2);
    assert_eq!(runner.worker_count(), 0);

    println!("✅ reset_stats clears aggregates without touching users");
}
