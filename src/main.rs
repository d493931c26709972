use mimalloc::MiMalloc;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tracing::{error, info, warn};

use swarmlet::config::{help_text, Config, RunMode};
use swarmlet::controller::ControllerRunner;
use swarmlet::errors::{LoadError, RunOutcome, ScenarioError};
use swarmlet::logging::{init_logging, LogFormat};
use swarmlet::metrics::register_metrics;
use swarmlet::ramp::RampScheduler;
use swarmlet::report::{
    print_error_report, print_percentile_stats, print_stats, render_task_ratio, task_ratio_json,
};
use swarmlet::runner::{Runner, RunnerContext};
use swarmlet::scenario::{select_scenarios, task_ratios, ScenarioDefinition, ScenarioProvider};
use swarmlet::scenario_file::YamlScenarioProvider;
use swarmlet::shutdown::{wait_for_signal, wait_for_stop_condition, StopConditions};
use swarmlet::standalone::StandaloneRunner;
use swarmlet::state::RunnerState;
use swarmlet::utils::hostname;
use swarmlet::web::start_web_server;
use swarmlet::worker::{WorkerExit, WorkerRunner};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// How long shutdown waits for users to drain before printing reports.
const STOP_TIMEOUT: Duration = Duration::from_secs(15);

/// Period of the console stats printer.
const PRINT_STATS_INTERVAL: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() {
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}\n", e);
            eprintln!("{}", help_text());
            std::process::exit(1);
        }
    };

    init_logging(LogFormat::from_env());

    if let Err(e) = register_metrics() {
        warn!(error = %e, "Failed to register Prometheus metrics");
    }

    let code = match run(config).await {
        Ok(outcome) => {
            info!(outcome = %outcome, "Run finished");
            outcome.exit_code()
        }
        Err(e) => {
            error!(error = %e, "Run failed");
            e.exit_code()
        }
    };
    std::process::exit(code);
}

fn load_scenarios(config: &Config) -> Result<Vec<ScenarioDefinition>, ScenarioError> {
    let provider = YamlScenarioProvider::new(&config.scenario_file);
    select_scenarios(provider.scenarios()?, &config.scenarios)
}

async fn run(config: Config) -> Result<RunOutcome, LoadError> {
    let scenarios = load_scenarios(&config)?;

    if config.list_scenarios {
        println!("Available scenarios:");
        for scenario in &scenarios {
            println!("    {}", scenario.name);
        }
        return Ok(RunOutcome::Clean);
    }

    if config.show_task_ratio {
        let ratios = task_ratios(&scenarios);
        println!("\n Task ratio per scenario and total:");
        println!("{}", render_task_ratio(&ratios));
        match task_ratio_json(&ratios) {
            Ok(json) => println!("{}", json),
            Err(e) => warn!(error = %e, "Failed to render task ratio JSON"),
        }
        return Ok(RunOutcome::Clean);
    }

    config.print_summary();

    match config.mode {
        RunMode::Standalone => run_standalone(&config, scenarios).await,
        RunMode::Controller => run_controller(&config).await,
        RunMode::Worker => run_worker(&config, scenarios).await,
    }
}

fn stop_conditions(config: &Config) -> StopConditions {
    StopConditions {
        run_time: config.run_time,
        num_requests: config.num_requests,
    }
}

/// Starts the web surface and the console printer, as configured.
fn start_surfaces(config: &Config, runner: Arc<dyn Runner>) -> Vec<JoinHandle<()>> {
    let mut tasks = Vec::new();

    if config.web_enabled {
        let addr = format!("{}:{}", config.web_host, config.web_port);
        match addr.parse::<SocketAddr>() {
            Ok(addr) => tasks.push(tokio::spawn(start_web_server(addr, runner.clone()))),
            Err(e) => warn!(addr = %addr, error = %e, "Invalid web address; web surface disabled"),
        }
    }

    if config.print_stats && !config.only_summary {
        tasks.push(tokio::spawn(async move {
            let mut ticker = time::interval(PRINT_STATS_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                print_stats(&*runner);
            }
        }));
    }

    tasks
}

/// Stops the runner and waits for its users to drain.
async fn stop_and_drain(runner: &dyn Runner) {
    runner.stop();
    if time::timeout(STOP_TIMEOUT, runner.wait_for_state(RunnerState::Stopped))
        .await
        .is_err()
    {
        warn!(
            user_count = runner.user_count(),
            "Users did not stop within the shutdown timeout"
        );
    }
}

fn print_final_reports(runner: &dyn Runner) {
    print_stats(runner);
    print_percentile_stats(runner);
    print_error_report(runner);
}

fn outcome_of(runner: &dyn Runner) -> RunOutcome {
    if runner.has_errors() {
        RunOutcome::Errors
    } else {
        RunOutcome::Clean
    }
}

async fn run_standalone(
    config: &Config,
    scenarios: Vec<ScenarioDefinition>,
) -> Result<RunOutcome, LoadError> {
    let ctx = RunnerContext::new("local");
    let runner = Arc::new(StandaloneRunner::new(ctx, scenarios, config.random_seed)?);
    let surfaces = start_surfaces(config, runner.clone());

    if config.autostart {
        runner.start_ramp(config.num_users, config.hatch_rate);
    }

    wait_for_stop_condition(&*runner, stop_conditions(config)).await;
    stop_and_drain(&*runner).await;
    for task in surfaces {
        task.abort();
    }

    print_final_reports(&*runner);
    Ok(outcome_of(&*runner))
}

async fn run_controller(config: &Config) -> Result<RunOutcome, LoadError> {
    let ctx = RunnerContext::new(format!("controller_{}", hostname()));
    let runner = Arc::new(ControllerRunner::bind(ctx, config.controller_settings()).await?);
    let surfaces = start_surfaces(config, runner.clone());

    let interrupted = if config.autostart {
        info!(expect_workers = config.expect_workers, "Waiting for workers");
        tokio::select! {
            _ = runner.wait_for_workers(config.expect_workers) => false,
            _ = wait_for_signal() => true,
        }
    } else {
        false
    };

    if !interrupted {
        if config.autostart {
            runner.start_ramp(config.num_users, config.hatch_rate);
        }
        wait_for_stop_condition(&*runner, stop_conditions(config)).await;
    }

    stop_and_drain(&*runner).await;
    runner.quit();
    if time::timeout(STOP_TIMEOUT, runner.wait_for_departure())
        .await
        .is_err()
    {
        warn!(
            workers = runner.worker_count(),
            "Workers did not quit within the shutdown timeout"
        );
    }
    for task in surfaces {
        task.abort();
    }

    print_final_reports(&*runner);
    Ok(outcome_of(&*runner))
}

async fn run_worker(
    config: &Config,
    scenarios: Vec<ScenarioDefinition>,
) -> Result<RunOutcome, LoadError> {
    let settings = config.worker_settings();
    let ctx = RunnerContext::new(settings.worker_id.clone());
    let scheduler = RampScheduler::new(ctx, scenarios, config.random_seed)?;
    let runner = WorkerRunner::connect(scheduler, settings).await?;

    let exit = tokio::select! {
        exit = runner.wait_for_exit() => exit,
        _ = wait_for_signal() => {
            info!("Interrupted; stopping local users");
            WorkerExit::Quit
        }
    };
    stop_and_drain(&runner).await;

    print_final_reports(&runner);

    Ok(match exit {
        WorkerExit::ControllerLost => RunOutcome::ControllerLost,
        WorkerExit::Quit => outcome_of(&runner),
    })
}
