use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::env;

use crate::runner::Runner;
use crate::state::RunnerState;

lazy_static::lazy_static! {
    pub static ref METRIC_NAMESPACE: String =
        env::var("METRIC_NAMESPACE").unwrap_or_else(|_| "swarmlet".to_string());

    // === Request Metrics ===

    pub static ref REQUESTS_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("requests_total", "Total number of completed requests")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["method", "name"]
        ).unwrap();

    pub static ref REQUEST_FAILURES_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("request_failures_total", "Number of requests counted as failed")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["method", "name"]
        ).unwrap();

    pub static ref REQUEST_DURATION_SECONDS: Histogram =
        Histogram::with_opts(
            HistogramOpts::new(
                "request_duration_seconds",
                "Request latencies in seconds."
            ).namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref EXCEPTIONS_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("exceptions_total", "Number of failures recorded as exceptions")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    // === Runner Metrics ===

    pub static ref USERS_ACTIVE: IntGauge =
        IntGauge::with_opts(
            Opts::new("users_active", "Number of simulated users currently running")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref USERS_TARGET: IntGauge =
        IntGauge::with_opts(
            Opts::new("users_target", "Target number of simulated users")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref WORKERS_CONNECTED: IntGauge =
        IntGauge::with_opts(
            Opts::new("workers_connected", "Number of connected, non-lost workers")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref RUNNER_STATE: IntGaugeVec =
        IntGaugeVec::new(
            Opts::new("runner_state", "1 for the current runner state, 0 otherwise")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["state"]
        ).unwrap();
}

const ALL_STATES: [RunnerState; 5] = [
    RunnerState::Ready,
    RunnerState::Hatching,
    RunnerState::Running,
    RunnerState::Stopping,
    RunnerState::Stopped,
];

/// Registers all metrics with the default Prometheus registry.
pub fn register_metrics() -> Result<(), prometheus::Error> {
    prometheus::default_registry().register(Box::new(REQUESTS_TOTAL.clone()))?;
    prometheus::default_registry().register(Box::new(REQUEST_FAILURES_TOTAL.clone()))?;
    prometheus::default_registry().register(Box::new(REQUEST_DURATION_SECONDS.clone()))?;
    prometheus::default_registry().register(Box::new(EXCEPTIONS_TOTAL.clone()))?;

    prometheus::default_registry().register(Box::new(USERS_ACTIVE.clone()))?;
    prometheus::default_registry().register(Box::new(USERS_TARGET.clone()))?;
    prometheus::default_registry().register(Box::new(WORKERS_CONNECTED.clone()))?;
    prometheus::default_registry().register(Box::new(RUNNER_STATE.clone()))?;

    Ok(())
}

/// Copies the runner's read accessors into the gauges.
pub fn refresh_runner_gauges(runner: &dyn Runner) {
    USERS_ACTIVE.set(runner.user_count() as i64);
    USERS_TARGET.set(runner.target_user_count() as i64);
    WORKERS_CONNECTED.set(runner.worker_count() as i64);
    let current = runner.state();
    for state in ALL_STATES {
        RUNNER_STATE
            .with_label_values(&[state.as_str()])
            .set(i64::from(state == current));
    }
}

/// Text exposition of every metric in `registry`.
pub fn gather_metrics_string(registry: &Registry) -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposition_contains_registered_metric() {
        let registry = Registry::new();
        let counter = IntCounter::new("probe_total", "probe").unwrap();
        registry.register(Box::new(counter.clone())).unwrap();
        counter.inc_by(3);

        let text = gather_metrics_string(&registry).unwrap();
        assert!(text.contains("probe_total 3"), "exposition was: {}", text);
    }
}
