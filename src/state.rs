use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;
use tracing::debug;

/// Lifecycle of a runner.
///
/// `Ready → Hatching → Running → Stopping → Stopped`, and `Stopped → Hatching`
/// when a new ramp starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    Ready,
    Hatching,
    Running,
    Stopping,
    Stopped,
}

impl RunnerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunnerState::Ready => "ready",
            RunnerState::Hatching => "hatching",
            RunnerState::Running => "running",
            RunnerState::Stopping => "stopping",
            RunnerState::Stopped => "stopped",
        }
    }

    /// True while users are being spawned or are running.
    pub fn is_active(&self) -> bool {
        matches!(self, RunnerState::Hatching | RunnerState::Running)
    }
}

impl fmt::Display for RunnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable holder for a [`RunnerState`].
pub struct StateCell {
    tx: watch::Sender<RunnerState>,
}

impl StateCell {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(RunnerState::Ready);
        Self { tx }
    }

    pub fn get(&self) -> RunnerState {
        *self.tx.borrow()
    }

    /// Unconditionally moves to `next`, returning the previous state.
    pub fn set(&self, next: RunnerState) -> RunnerState {
        let previous = self.tx.send_replace(next);
        if previous != next {
            debug!(from = %previous, to = %next, "Runner state changed");
        }
        previous
    }

    /// Moves to `next` only when the current state is `from`.
    ///
    /// Returns whether the transition happened. Check and update happen under
    /// the same lock, so concurrent callers cannot both win.
    pub fn transition(&self, from: RunnerState, next: RunnerState) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == from {
                *current = next;
                true
            } else {
                false
            }
        });
        if changed {
            debug!(from = %from, to = %next, "Runner state changed");
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<RunnerState> {
        self.tx.subscribe()
    }

    /// Resolves once the state equals `target`.
    pub async fn wait_for(&self, target: RunnerState) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|state| *state == target).await;
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn starts_ready() {
        assert_eq!(StateCell::new().get(), RunnerState::Ready);
    }

    #[test]
    fn conditional_transition() {
        let cell = StateCell::new();
        assert!(!cell.transition(RunnerState::Running, RunnerState::Stopping));
        assert_eq!(cell.get(), RunnerState::Ready);
        assert!(cell.transition(RunnerState::Ready, RunnerState::Hatching));
        assert_eq!(cell.get(), RunnerState::Hatching);
    }

    #[test]
    fn serializes_as_snake_case() {
        let json = serde_json::to_string(&RunnerState::Hatching).unwrap();
        assert_eq!(json, "\"hatching\"");
        assert_eq!(RunnerState::Stopped.to_string(), "stopped");
    }

    #[tokio::test]
    async fn wait_for_resolves_on_change() {
        let cell = Arc::new(StateCell::new());
        let waiter = {
            let cell = cell.clone();
            tokio::spawn(async move { cell.wait_for(RunnerState::Stopped).await })
        };
        cell.set(RunnerState::Stopping);
        cell.set(RunnerState::Stopped);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter timed out")
            .unwrap();
    }

    #[tokio::test]
    async fn wait_for_current_state_is_immediate() {
        let cell = StateCell::new();
        cell.wait_for(RunnerState::Ready).await;
    }
}
