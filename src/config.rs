use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use tokio::time::Duration;

use crate::errors::ConfigError;
use crate::utils::{hostname, parse_duration_string, parse_name_list};

/// Deployment mode of this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Standalone,
    Controller,
    Worker,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Standalone => "standalone",
            RunMode::Controller => "controller",
            RunMode::Worker => "worker",
        }
    }
}

impl FromStr for RunMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "standalone" => Ok(RunMode::Standalone),
            "controller" | "master" => Ok(RunMode::Controller),
            "worker" | "slave" => Ok(RunMode::Worker),
            other => Err(ConfigError::UnknownMode(other.to_string())),
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settings a controller needs to accept workers.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub bind_host: String,

    /// Command port. Worker stats arrive on `port + 1`.
    pub port: u16,

    pub heartbeat_interval: Duration,

    /// Consecutive missed heartbeats before a worker is marked lost.
    pub heartbeat_liveness: u32,
}

/// Settings a worker needs to join a controller.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub controller_host: String,
    pub controller_port: u16,
    pub worker_id: String,
    pub heartbeat_interval: Duration,
    pub stats_report_interval: Duration,
}

/// Main configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: RunMode,
    pub scenario_file: PathBuf,
    pub scenarios: Vec<String>,
    pub num_users: usize,
    pub hatch_rate: f64,
    pub autostart: bool,
    pub expect_workers: usize,
    pub run_time: Option<Duration>,
    pub num_requests: Option<u64>,

    pub controller_host: String,
    pub controller_port: u16,
    pub controller_bind_host: String,
    pub controller_bind_port: u16,
    pub heartbeat_interval: Duration,
    pub heartbeat_liveness: u32,
    pub stats_report_interval: Duration,
    pub worker_id: Option<String>,

    pub web_enabled: bool,
    pub web_host: String,
    pub web_port: u16,

    pub print_stats: bool,
    pub only_summary: bool,
    pub show_task_ratio: bool,
    pub list_scenarios: bool,
    pub random_seed: Option<u64>,
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn env_optional<T>(key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse()
                .map(Some)
                .map_err(|e: T::Err| ConfigError::InvalidValue {
                    key,
                    value: raw.clone(),
                    reason: e.to_string(),
                })
        }
        _ => Ok(None),
    }
}

fn env_bool(key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match env::var(key) {
        Ok(raw) => match raw.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" | "" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                key,
                value: raw,
                reason: "expected true or false".to_string(),
            }),
        },
        Err(_) => Ok(default),
    }
}

fn env_duration(key: &'static str) -> Result<Option<Duration>, ConfigError> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => parse_duration_string(&raw)
            .map(Some)
            .map_err(|reason| ConfigError::InvalidValue {
                key,
                value: raw,
                reason,
            }),
        _ => Ok(None),
    }
}

fn env_interval(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match env_duration(key)? {
        Some(d) if d.is_zero() => Err(ConfigError::InvalidValue {
            key,
            value: "0".to_string(),
            reason: "interval must be greater than zero".to_string(),
        }),
        Some(d) => Ok(d),
        None => Ok(default),
    }
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mode: RunMode = env_string("RUN_MODE", "standalone").parse()?;

        let hatch_rate: f64 = env_parse("HATCH_RATE", 1.0)?;
        if !hatch_rate.is_finite() || hatch_rate <= 0.0 {
            return Err(ConfigError::InvalidValue {
                key: "HATCH_RATE",
                value: hatch_rate.to_string(),
                reason: "must be a positive number".to_string(),
            });
        }

        let heartbeat_liveness: u32 = env_parse("HEARTBEAT_LIVENESS", 3)?;
        if heartbeat_liveness == 0 {
            return Err(ConfigError::InvalidValue {
                key: "HEARTBEAT_LIVENESS",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            mode,
            scenario_file: PathBuf::from(env_string("SCENARIO_FILE", "scenarios.yaml")),
            scenarios: parse_name_list(&env_string("SCENARIOS", "")),
            num_users: env_parse("NUM_USERS", 1)?,
            hatch_rate,
            autostart: env_bool("AUTOSTART", false)?,
            expect_workers: env_parse("EXPECT_WORKERS", 1)?,
            run_time: env_duration("RUN_TIME")?,
            num_requests: env_optional("NUM_REQUESTS")?,

            controller_host: env_string("CONTROLLER_HOST", "127.0.0.1"),
            controller_port: env_parse("CONTROLLER_PORT", 5557)?,
            controller_bind_host: env_string("CONTROLLER_BIND_HOST", "0.0.0.0"),
            controller_bind_port: env_parse("CONTROLLER_BIND_PORT", 5557)?,
            heartbeat_interval: env_interval("HEARTBEAT_INTERVAL", Duration::from_secs(3))?,
            heartbeat_liveness,
            stats_report_interval: env_interval("STATS_REPORT_INTERVAL", Duration::from_secs(3))?,
            worker_id: env_optional("WORKER_ID")?,

            web_enabled: env_bool("WEB_ENABLED", true)?,
            web_host: env_string("WEB_HOST", "0.0.0.0"),
            web_port: env_parse("WEB_PORT", 8089)?,

            print_stats: env_bool("PRINT_STATS", false)?,
            only_summary: env_bool("ONLY_SUMMARY", false)?,
            show_task_ratio: env_bool("SHOW_TASK_RATIO", false)?,
            list_scenarios: env_bool("LIST_SCENARIOS", false)?,
            random_seed: env_optional("RANDOM_SEED")?,
        })
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            bind_host: self.controller_bind_host.clone(),
            port: self.controller_bind_port,
            heartbeat_interval: self.heartbeat_interval,
            heartbeat_liveness: self.heartbeat_liveness,
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            controller_host: self.controller_host.clone(),
            controller_port: self.controller_port,
            worker_id: self.worker_id.clone().unwrap_or_else(generate_worker_id),
            heartbeat_interval: self.heartbeat_interval,
            stats_report_interval: self.stats_report_interval,
        }
    }

    /// Prints the configuration summary.
    pub fn print_summary(&self) {
        println!("Starting swarm:");
        println!("  Mode: {}", self.mode);
        println!("  Scenario file: {}", self.scenario_file.display());
        if !self.scenarios.is_empty() {
            println!("  Scenarios: {}", self.scenarios.join(", "));
        }
        if self.autostart {
            println!("  Users: {} (hatch rate {}/s)", self.num_users, self.hatch_rate);
        } else {
            println!("  Autostart: No (waiting for the control surface)");
        }
        if let Some(run_time) = self.run_time {
            println!("  Run time: {:?}", run_time);
        }
        if let Some(n) = self.num_requests {
            println!("  Stop after: {} requests", n);
        }
        match self.mode {
            RunMode::Controller => println!(
                "  Listening on: {}:{} (+1 for stats), expecting {} worker(s)",
                self.controller_bind_host, self.controller_bind_port, self.expect_workers
            ),
            RunMode::Worker => println!(
                "  Controller: {}:{}",
                self.controller_host, self.controller_port
            ),
            RunMode::Standalone => {}
        }
        if self.web_enabled && self.mode != RunMode::Worker {
            println!("  Web UI: http://{}:{}", self.web_host, self.web_port);
        }
    }
}

/// Host name plus a random suffix, unique per process.
pub fn generate_worker_id() -> String {
    format!("{}_{:08x}", hostname(), rand::random::<u32>())
}

/// Usage text printed when configuration fails to load.
pub fn help_text() -> &'static str {
    "Configuration is read from environment variables:
  RUN_MODE                standalone | controller | worker (default standalone)
  SCENARIO_FILE           scenario YAML file (default scenarios.yaml)
  SCENARIOS               comma-separated scenario names to run (default all)
  NUM_USERS, HATCH_RATE   autostart target users and users/second
  AUTOSTART               start immediately (default false)
  EXPECT_WORKERS          controller autostart waits for this many workers
  RUN_TIME                stop after e.g. 30s, 10m, 2h
  NUM_REQUESTS            stop after this many requests
  CONTROLLER_HOST/PORT    controller address for workers (default 127.0.0.1:5557)
  CONTROLLER_BIND_HOST/PORT  controller listen address (default 0.0.0.0:5557)
  HEARTBEAT_INTERVAL, HEARTBEAT_LIVENESS, STATS_REPORT_INTERVAL
  WEB_ENABLED, WEB_HOST, WEB_PORT
  PRINT_STATS, ONLY_SUMMARY, SHOW_TASK_RATIO, LIST_SCENARIOS
  RANDOM_SEED, LOG_LEVEL, LOG_FORMAT"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_mode_parsing() {
        assert_eq!("standalone".parse::<RunMode>().unwrap(), RunMode::Standalone);
        assert_eq!("Controller".parse::<RunMode>().unwrap(), RunMode::Controller);
        assert_eq!("master".parse::<RunMode>().unwrap(), RunMode::Controller);
        assert_eq!(" worker ".parse::<RunMode>().unwrap(), RunMode::Worker);
        assert!(matches!(
            "cluster".parse::<RunMode>(),
            Err(ConfigError::UnknownMode(m)) if m == "cluster"
        ));
    }

    #[test]
    fn worker_ids_are_unique() {
        assert_ne!(generate_worker_id(), generate_worker_id());
    }
}
