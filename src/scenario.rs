//! Scenario definitions consumed by the scheduler.
//!
//! A scenario is a named, weighted behaviour profile for one simulated user: an
//! ordered list of weighted actions. The scheduler only sees scenarios through
//! a [`ScenarioProvider`], so where definitions come from (a YAML file, code
//! compiled into a test, ...) is the provider's business.

use async_trait::async_trait;
use rand::rngs::StdRng;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::errors::{ActionError, ScenarioError};
use crate::selector::WeightedTable;

/// Result of one action that completed without raising.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    /// Request succeeded with a response of `content_length` bytes.
    Success { content_length: u64 },

    /// Request completed but is counted as failed.
    Failure { error: ActionError },

    /// Ends this user without recording a sample. The scheduler does not
    /// replace it once the ramp has reached its target.
    StopUser,
}

impl ActionOutcome {
    pub fn success(content_length: u64) -> Self {
        ActionOutcome::Success { content_length }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        ActionOutcome::Failure {
            error: ActionError::new(message),
        }
    }
}

/// Per-user state handed to every action call.
pub struct UserContext {
    pub user_id: u64,
    pub scenario: String,
    pub node_id: String,

    /// Seeded from the scheduler so runs with `RANDOM_SEED` are repeatable.
    pub rng: StdRng,
}

/// One unit of work a simulated user performs.
///
/// Samples are recorded under `(method(), name())`.
#[async_trait]
pub trait Action: Send + Sync {
    fn method(&self) -> &str;

    fn name(&self) -> &str;

    async fn run(&self, user: &mut UserContext) -> Result<ActionOutcome, ActionError>;
}

#[derive(Clone)]
pub struct WeightedAction {
    pub weight: f64,
    pub action: Arc<dyn Action>,
}

impl fmt::Debug for WeightedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeightedAction")
            .field("weight", &self.weight)
            .field("method", &self.action.method())
            .field("name", &self.action.name())
            .finish()
    }
}

/// Read-only behaviour profile for a simulated user.
#[derive(Debug, Clone)]
pub struct ScenarioDefinition {
    pub name: String,
    pub weight: f64,
    pub actions: Vec<WeightedAction>,
}

impl ScenarioDefinition {
    pub fn new(name: impl Into<String>, weight: f64) -> Self {
        Self {
            name: name.into(),
            weight,
            actions: Vec::new(),
        }
    }

    pub fn with_action(mut self, weight: f64, action: Arc<dyn Action>) -> Self {
        self.actions.push(WeightedAction { weight, action });
        self
    }

    pub fn validate(&self) -> Result<(), ScenarioError> {
        if !self.weight.is_finite() || self.weight <= 0.0 {
            return Err(ScenarioError::InvalidWeight {
                name: self.name.clone(),
                weight: self.weight,
            });
        }
        if self.actions.is_empty() {
            return Err(ScenarioError::NoActions(self.name.clone()));
        }
        for weighted in &self.actions {
            if !weighted.weight.is_finite() || weighted.weight <= 0.0 {
                return Err(ScenarioError::InvalidWeight {
                    name: format!("{}/{}", self.name, weighted.action.name()),
                    weight: weighted.weight,
                });
            }
        }
        Ok(())
    }

    /// Cumulative table over this scenario's action weights.
    pub fn action_table(&self) -> Result<WeightedTable, ScenarioError> {
        let weights: Vec<f64> = self.actions.iter().map(|a| a.weight).collect();
        WeightedTable::new(&weights).ok_or_else(|| ScenarioError::NoActions(self.name.clone()))
    }
}

/// Source of scenario definitions.
pub trait ScenarioProvider: Send + Sync {
    fn scenarios(&self) -> Result<Vec<ScenarioDefinition>, ScenarioError>;
}

/// Provider over definitions already built in memory.
pub struct StaticScenarios(pub Vec<ScenarioDefinition>);

impl ScenarioProvider for StaticScenarios {
    fn scenarios(&self) -> Result<Vec<ScenarioDefinition>, ScenarioError> {
        Ok(self.0.clone())
    }
}

/// Validates `all` and keeps only the scenarios named in `names`.
///
/// An empty `names` keeps everything. Any name with no matching definition is
/// an error.
pub fn select_scenarios(
    all: Vec<ScenarioDefinition>,
    names: &[String],
) -> Result<Vec<ScenarioDefinition>, ScenarioError> {
    if all.is_empty() {
        return Err(ScenarioError::NoScenarios);
    }
    for scenario in &all {
        scenario.validate()?;
    }
    if names.is_empty() {
        return Ok(all);
    }

    let unknown: Vec<&str> = names
        .iter()
        .filter(|name| !all.iter().any(|s| &s.name == *name))
        .map(String::as_str)
        .collect();
    if !unknown.is_empty() {
        return Err(ScenarioError::UnknownScenarios(unknown.join(", ")));
    }

    Ok(all.into_iter().filter(|s| names.contains(&s.name)).collect())
}

/// Share of traffic a scenario or action receives.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskRatio {
    pub name: String,

    /// Share within the parent (scenario among scenarios, action within its scenario)
    pub ratio: f64,

    /// Share of all traffic
    pub total_ratio: f64,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TaskRatio>,
}

/// Computes the scenario/action traffic split.
pub fn task_ratios(scenarios: &[ScenarioDefinition]) -> Vec<TaskRatio> {
    let total_weight: f64 = scenarios.iter().map(|s| s.weight).sum();
    scenarios
        .iter()
        .map(|scenario| {
            let ratio = if total_weight > 0.0 {
                scenario.weight / total_weight
            } else {
                0.0
            };
            let action_weight: f64 = scenario.actions.iter().map(|a| a.weight).sum();
            let children = scenario
                .actions
                .iter()
                .map(|weighted| {
                    let child_ratio = if action_weight > 0.0 {
                        weighted.weight / action_weight
                    } else {
                        0.0
                    };
                    TaskRatio {
                        name: format!("{} {}", weighted.action.method(), weighted.action.name()),
                        ratio: child_ratio,
                        total_ratio: ratio * child_ratio,
                        children: Vec::new(),
                    }
                })
                .collect();
            TaskRatio {
                name: scenario.name.clone(),
                ratio,
                total_ratio: ratio,
                children,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop(&'static str);

    #[async_trait]
    impl Action for Noop {
        fn method(&self) -> &str {
            "GET"
        }

        fn name(&self) -> &str {
            self.0
        }

        async fn run(&self, _user: &mut UserContext) -> Result<ActionOutcome, ActionError> {
            Ok(ActionOutcome::success(0))
        }
    }

    fn scenario(name: &str, weight: f64) -> ScenarioDefinition {
        ScenarioDefinition::new(name, weight)
            .with_action(3.0, Arc::new(Noop("/a")))
            .with_action(1.0, Arc::new(Noop("/b")))
    }

    #[test]
    fn empty_provider_is_an_error() {
        let err = select_scenarios(vec![], &[]).unwrap_err();
        assert!(matches!(err, ScenarioError::NoScenarios));
    }

    #[test]
    fn unknown_name_is_an_error() {
        let err = select_scenarios(
            vec![scenario("browse", 1.0)],
            &["browse".to_string(), "checkout".to_string()],
        )
        .unwrap_err();
        match err {
            ScenarioError::UnknownScenarios(names) => assert_eq!(names, "checkout"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn filter_keeps_named_scenarios() {
        let selected = select_scenarios(
            vec![scenario("browse", 1.0), scenario("checkout", 1.0)],
            &["checkout".to_string()],
        )
        .unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].name, "checkout");
    }

    #[test]
    fn scenario_without_actions_is_rejected() {
        let err = select_scenarios(vec![ScenarioDefinition::new("empty", 1.0)], &[]).unwrap_err();
        assert!(matches!(err, ScenarioError::NoActions(name) if name == "empty"));
    }

    #[test]
    fn zero_weight_is_rejected() {
        let err = scenario("browse", 0.0).validate().unwrap_err();
        assert!(matches!(err, ScenarioError::InvalidWeight { .. }));
    }

    #[test]
    fn ratios_nest_scenarios_and_actions() {
        let ratios = task_ratios(&[scenario("browse", 3.0), scenario("checkout", 1.0)]);
        assert_eq!(ratios.len(), 2);
        assert_eq!(ratios[0].ratio, 0.75);
        assert_eq!(ratios[0].children[0].name, "GET /a");
        assert_eq!(ratios[0].children[0].ratio, 0.75);
        assert!((ratios[1].children[1].total_ratio - 0.0625).abs() < 1e-9);
    }
}
