//! Error taxonomy for the load-generation engine.
//!
//! Errors fall into four groups, each with a distinct effect on the process:
//! configuration errors abort before any load is generated, connectivity errors
//! are fatal for a worker but not for a controller, scenario execution errors are
//! recovered inside the user task, and operator interruption takes the normal
//! shutdown path.

use std::fmt;
use thiserror::Error;

/// Errors raised while reading configuration from the environment.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: '{value}' ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("Unknown RUN_MODE '{0}'. Use standalone, controller or worker.")]
    UnknownMode(String),
}

/// Errors raised while loading or validating scenario definitions.
#[derive(Error, Debug)]
pub enum ScenarioError {
    #[error("No scenario definitions found")]
    NoScenarios,

    #[error("Unknown scenario(s): {0}")]
    UnknownScenarios(String),

    #[error("Scenario '{0}' declares no actions")]
    NoActions(String),

    #[error("Invalid weight {weight} for '{name}': weights must be positive and finite")]
    InvalidWeight { name: String, weight: f64 },

    #[error("Failed to read scenario file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("Failed to parse scenario YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("Invalid scenario definition: {0}")]
    Validation(String),
}

/// Errors on the controller/worker message channels.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("I/O error during {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Wire message exceeded {max_bytes} bytes")]
    MessageTooLarge { max_bytes: usize },

    #[error("Invalid wire message: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Failed to encode wire message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Unexpected message: {0}")]
    Unexpected(String),
}

/// Errors raised while starting or running a runner.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Failed to reach controller at {addr}: {source}")]
    ControllerUnreachable {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Lost connection to controller: {0}")]
    ControllerLost(#[source] ProtocolError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Errors while rendering report exports.
#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Failed to write CSV report: {0}")]
    Csv(#[from] csv::Error),

    #[error("Failed to encode JSON report: {0}")]
    Json(#[from] serde_json::Error),
}

/// Top-level error carried to the process boundary.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Scenario(#[from] ScenarioError),

    #[error(transparent)]
    Runner(#[from] RunnerError),
}

impl LoadError {
    /// Process exit code for this error.
    ///
    /// A worker that cannot reach its controller exits with `-1`; every other
    /// fatal error exits with `1`.
    pub fn exit_code(&self) -> i32 {
        match self {
            LoadError::Runner(RunnerError::ControllerUnreachable { .. }) => -1,
            _ => 1,
        }
    }
}

/// Failure raised by a scenario action.
///
/// Recorded as a failed sample plus an exception record; the user task moves on
/// to its next action.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ActionError {
    pub message: String,

    /// Short, stable description of where the failure happened. Identical
    /// message + stack summary pairs are merged into one exception record.
    pub stack_summary: Option<String>,
}

impl ActionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack_summary: None,
        }
    }

    pub fn with_stack_summary(mut self, summary: impl Into<String>) -> Self {
        self.stack_summary = Some(summary.into());
        self
    }
}

/// How a run ended, mapped onto process exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Shut down with no recorded request errors.
    Clean,
    /// Shut down after request errors were recorded.
    Errors,
    /// A worker lost its controller.
    ControllerLost,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Clean => 0,
            RunOutcome::Errors | RunOutcome::ControllerLost => 1,
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Clean => write!(f, "clean"),
            RunOutcome::Errors => write!(f, "errors recorded"),
            RunOutcome::ControllerLost => write!(f, "controller lost"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreachable_controller_has_distinct_exit_code() {
        let err = LoadError::from(RunnerError::ControllerUnreachable {
            addr: "127.0.0.1:5557".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        });
        assert_eq!(err.exit_code(), -1);
    }

    #[test]
    fn configuration_errors_exit_with_one() {
        assert_eq!(LoadError::from(ScenarioError::NoScenarios).exit_code(), 1);
        assert_eq!(
            LoadError::from(ScenarioError::UnknownScenarios("nope".to_string())).exit_code(),
            1
        );
        assert_eq!(
            LoadError::from(ConfigError::UnknownMode("x".to_string())).exit_code(),
            1
        );
    }

    #[test]
    fn run_outcome_codes() {
        assert_eq!(RunOutcome::Clean.exit_code(), 0);
        assert_eq!(RunOutcome::Errors.exit_code(), 1);
        assert_eq!(RunOutcome::ControllerLost.exit_code(), 1);
    }

    #[test]
    fn action_error_display_is_message() {
        let err = ActionError::new("boom").with_stack_summary("checkout -> POST /pay");
        assert_eq!(err.to_string(), "boom");
        assert_eq!(err.stack_summary.as_deref(), Some("checkout -> POST /pay"));
    }
}
