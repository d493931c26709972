//! YAML scenario file provider.
//!
//! Actions in a scenario file are simulated: each one waits for a random
//! latency, then reports a response of a fixed size or, with the configured
//! probability, a failure. This lets the binary drive the scheduler, the stats
//! pipeline and the distributed protocol end to end without a protocol client.
//!
//! ```yaml
//! scenarios:
//!   - name: browse
//!     weight: 3
//!     actions:
//!       - name: /
//!         weight: 5
//!         latency: { min_ms: 20, max_ms: 80 }
//!         content_length: 2048
//!       - method: POST
//!         name: /search
//!         failure_rate: 0.05
//!         failure_message: "HTTP 503"
//! ```

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::{self, Duration};

use crate::errors::{ActionError, ScenarioError};
use crate::scenario::{Action, ActionOutcome, ScenarioDefinition, ScenarioProvider, UserContext};

fn default_weight() -> f64 {
    1.0
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_failure_message() -> String {
    "simulated failure".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioFile {
    pub scenarios: Vec<ScenarioSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioSpec {
    pub name: String,

    #[serde(default = "default_weight")]
    pub weight: f64,

    pub actions: Vec<ActionSpec>,
}

/// Simulated latency range, inclusive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySpec {
    pub min_ms: u64,
    pub max_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSpec {
    #[serde(default = "default_method")]
    pub method: String,

    pub name: String,

    #[serde(default = "default_weight")]
    pub weight: f64,

    #[serde(default)]
    pub latency: LatencySpec,

    #[serde(default)]
    pub content_length: u64,

    /// Probability (0.0–1.0) that a call is reported as failed.
    #[serde(default)]
    pub failure_rate: f64,

    #[serde(default = "default_failure_message")]
    pub failure_message: String,
}

impl ScenarioFile {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ScenarioError> {
        let content = fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ScenarioError> {
        let file: ScenarioFile = serde_yaml::from_str(content)?;
        file.validate()?;
        Ok(file)
    }

    fn validate(&self) -> Result<(), ScenarioError> {
        for scenario in &self.scenarios {
            for action in &scenario.actions {
                if action.latency.min_ms > action.latency.max_ms {
                    return Err(ScenarioError::Validation(format!(
                        "{}/{}: latency min_ms ({}) is greater than max_ms ({})",
                        scenario.name, action.name, action.latency.min_ms, action.latency.max_ms
                    )));
                }
                if !(0.0..=1.0).contains(&action.failure_rate) {
                    return Err(ScenarioError::Validation(format!(
                        "{}/{}: failure_rate must be between 0.0 and 1.0, got {}",
                        scenario.name, action.name, action.failure_rate
                    )));
                }
            }
        }
        Ok(())
    }

    /// Builds the runtime scenario definitions.
    pub fn to_definitions(&self) -> Vec<ScenarioDefinition> {
        self.scenarios
            .iter()
            .map(|spec| {
                spec.actions.iter().fold(
                    ScenarioDefinition::new(spec.name.clone(), spec.weight),
                    |scenario, action| {
                        scenario.with_action(
                            action.weight,
                            Arc::new(SimulatedAction::from_spec(action)),
                        )
                    },
                )
            })
            .collect()
    }
}

/// Action that sleeps for a random latency and reports a canned outcome.
#[derive(Debug, Clone)]
pub struct SimulatedAction {
    method: String,
    name: String,
    latency: LatencySpec,
    content_length: u64,
    failure_rate: f64,
    failure_message: String,
}

impl SimulatedAction {
    pub fn from_spec(spec: &ActionSpec) -> Self {
        Self {
            method: spec.method.to_uppercase(),
            name: spec.name.clone(),
            latency: spec.latency,
            content_length: spec.content_length,
            failure_rate: spec.failure_rate,
            failure_message: spec.failure_message.clone(),
        }
    }
}

#[async_trait]
impl Action for SimulatedAction {
    fn method(&self) -> &str {
        &self.method
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, user: &mut UserContext) -> Result<ActionOutcome, ActionError> {
        let latency_ms = if self.latency.max_ms > self.latency.min_ms {
            user.rng.gen_range(self.latency.min_ms..=self.latency.max_ms)
        } else {
            self.latency.min_ms
        };
        let failed = self.failure_rate > 0.0 && user.rng.gen_bool(self.failure_rate);

        time::sleep(Duration::from_millis(latency_ms)).await;

        if failed {
            Ok(ActionOutcome::failure(self.failure_message.clone()))
        } else {
            Ok(ActionOutcome::success(self.content_length))
        }
    }
}

/// Provider reading definitions from a YAML file on each call.
pub struct YamlScenarioProvider {
    path: PathBuf,
}

impl YamlScenarioProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ScenarioProvider for YamlScenarioProvider {
    fn scenarios(&self) -> Result<Vec<ScenarioDefinition>, ScenarioError> {
        Ok(ScenarioFile::from_file(&self.path)?.to_definitions())
    }
}
