//! Stop conditions for a run: operator signals, a run-time limit and a
//! request-count limit.

use std::fmt;
use tokio::time::{self, Duration};
use tracing::{info, warn};

use crate::runner::Runner;

/// How often the request limit is checked against the aggregated total.
const REQUEST_LIMIT_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT or SIGTERM.
    Signal,
    RunTimeElapsed,
    RequestLimitReached,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Signal => write!(f, "signal"),
            ShutdownReason::RunTimeElapsed => write!(f, "run time elapsed"),
            ShutdownReason::RequestLimitReached => write!(f, "request limit reached"),
        }
    }
}

/// Limits that end a run on their own.
#[derive(Debug, Clone, Copy, Default)]
pub struct StopConditions {
    pub run_time: Option<Duration>,
    pub num_requests: Option<u64>,
}

/// Resolves on SIGINT, or SIGTERM on unix.
pub async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!(error = %e, "Failed to install SIGTERM handler"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

/// Resolves once the runner has completed at least `limit` requests.
pub async fn wait_for_request_limit(runner: &dyn Runner, limit: u64) {
    let mut poll = time::interval(REQUEST_LIMIT_POLL);
    loop {
        poll.tick().await;
        if runner.total_stats().num_requests >= limit {
            return;
        }
    }
}

async fn maybe_sleep(run_time: Option<Duration>) {
    match run_time {
        Some(run_time) => time::sleep(run_time).await,
        None => std::future::pending().await,
    }
}

async fn maybe_request_limit(runner: &dyn Runner, limit: Option<u64>) {
    match limit {
        Some(limit) => wait_for_request_limit(runner, limit).await,
        None => std::future::pending().await,
    }
}

/// Waits for whichever stop condition fires first.
pub async fn wait_for_stop_condition(
    runner: &dyn Runner,
    conditions: StopConditions,
) -> ShutdownReason {
    let reason = tokio::select! {
        _ = wait_for_signal() => ShutdownReason::Signal,
        _ = maybe_sleep(conditions.run_time) => ShutdownReason::RunTimeElapsed,
        _ = maybe_request_limit(runner, conditions.num_requests) => {
            ShutdownReason::RequestLimitReached
        }
    };
    info!(reason = %reason, "Shutting down");
    reason
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::RunnerContext;
    use crate::scenario_file::ScenarioFile;
    use crate::standalone::StandaloneRunner;

    const FAST: &str = r#"
scenarios:
  - name: fast
    actions:
      - name: /ping
        latency: { min_ms: 10, max_ms: 10 }
"#;

    fn runner() -> StandaloneRunner {
        let scenarios = ScenarioFile::from_str(FAST).unwrap().to_definitions();
        StandaloneRunner::new(RunnerContext::new("local"), scenarios, Some(1)).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn run_time_fires() {
        let runner = runner();
        let conditions = StopConditions {
            run_time: Some(Duration::from_secs(5)),
            num_requests: None,
        };
        assert_eq!(
            wait_for_stop_condition(&runner, conditions).await,
            ShutdownReason::RunTimeElapsed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn request_limit_fires() {
        let runner = runner();
        runner.start_ramp(2, 10.0);
        let conditions = StopConditions {
            run_time: Some(Duration::from_secs(3600)),
            num_requests: Some(10),
        };
        assert_eq!(
            wait_for_stop_condition(&runner, conditions).await,
            ShutdownReason::RequestLimitReached
        );
        assert!(runner.total_stats().num_requests >= 10);
    }

    #[test]
    fn reason_display() {
        assert_eq!(ShutdownReason::RunTimeElapsed.to_string(), "run time elapsed");
    }
}
