//! Application lifecycle state.
//!
//! The lifecycle of the built application is modeled as an explicit,
//! injectable object rather than global static state: transitions follow
//! {not-started → starting → started → stopping → stopped}, observers can
//! await a state over a watch channel, and invalid transitions are rejected
//! with the states involved. A failed startup may go straight from
//! `Starting` to `Stopping`.

use thiserror::Error;
use tokio::sync::watch;
use tracing::info;

/// The lifecycle states, in progression order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LifecycleState {
  NotStarted,
  Starting,
  Started,
  Stopping,
  Stopped,
}

impl LifecycleState {
  fn can_advance_to(self, next: LifecycleState) -> bool {
    use LifecycleState::*;
    matches!(
      (self, next),
      (NotStarted, Starting) | (Starting, Started) | (Starting, Stopping) | (Started, Stopping) | (Stopping, Stopped)
    )
  }
}

impl std::fmt::Display for LifecycleState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      LifecycleState::NotStarted => "not-started",
      LifecycleState::Starting => "starting",
      LifecycleState::Started => "started",
      LifecycleState::Stopping => "stopping",
      LifecycleState::Stopped => "stopped",
    };
    write!(f, "{}", name)
  }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
  #[error("invalid lifecycle transition from {from} to {to}")]
  InvalidTransition { from: LifecycleState, to: LifecycleState },
}

/// Shared lifecycle handle.
///
/// Clones observe the same underlying state. `Stopped` is terminal.
#[derive(Debug, Clone)]
pub struct Lifecycle {
  tx: watch::Sender<LifecycleState>,
}

impl Default for Lifecycle {
  fn default() -> Self {
    Self::new()
  }
}

impl Lifecycle {
  pub fn new() -> Self {
    let (tx, _) = watch::channel(LifecycleState::NotStarted);
    Self { tx }
  }

  /// The current state.
  pub fn state(&self) -> LifecycleState {
    *self.tx.borrow()
  }

  /// Advance to the next state.
  ///
  /// # Errors
  ///
  /// Returns `InvalidTransition` if `next` does not follow the current
  /// state in the transition table.
  pub fn advance(&self, next: LifecycleState) -> Result<(), LifecycleError> {
    let mut result = Ok(());
    self.tx.send_modify(|state| {
      if state.can_advance_to(next) {
        info!(from = %state, to = %next, "lifecycle transition");
        *state = next;
      } else {
        result = Err(LifecycleError::InvalidTransition { from: *state, to: next });
      }
    });
    result
  }

  /// Wait until the lifecycle reaches (or has passed) `target`.
  ///
  /// Returns the state that satisfied the wait. Never blocks when the
  /// current state already satisfies it.
  pub async fn wait_for(&self, target: LifecycleState) -> LifecycleState {
    let mut rx = self.tx.subscribe();
    // The sender half lives in self, so the channel cannot close under us.
    let state = rx.wait_for(|state| *state >= target).await.unwrap();
    *state
  }
}
