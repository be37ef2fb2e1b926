//! Execution-time phases.
//!
//! Steps are tagged with the phase at which the code generated from their
//! output runs in the deployed application's lifecycle. Phase tags never
//! change how producer/consumer edges resolve; they add one validation rule:
//! a step may consume items produced at its own phase or an earlier one,
//! never a later one. The chain compiler rejects violations before any step
//! executes.

use serde::{Deserialize, Serialize};

/// When generated code tied to a build step runs.
///
/// The variants are totally ordered: `BuildTime < StaticInit < RuntimeInit`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Phase {
  /// Runs only during the build; nothing survives into the application.
  #[default]
  BuildTime,
  /// Runs during static initialization of the built application.
  StaticInit,
  /// Runs on application startup (first-request / runtime initialization).
  RuntimeInit,
}

impl std::fmt::Display for Phase {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      Phase::BuildTime => "build-time",
      Phase::StaticInit => "static-init",
      Phase::RuntimeInit => "runtime-init",
    };
    write!(f, "{}", name)
  }
}
