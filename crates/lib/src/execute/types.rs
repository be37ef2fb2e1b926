//! Types for chain execution.
//!
//! Defines the execution configuration, the all-or-nothing error type, and
//! the immutable [`BuildResult`] snapshot handed back to the caller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::item::{AnyItem, ItemId, MultiBuildItem, SimpleBuildItem};
use crate::step::{StepError, StepId};

/// Errors that fail an entire chain execution.
///
/// Execution is all-or-nothing: no partial result ever escapes, and no step
/// is retried.
#[derive(Debug, Error)]
pub enum BuildError {
  /// A step failed; everything downstream of it was skipped.
  #[error("step {step} failed ({} steps skipped)", .skipped.len())]
  StepFailed {
    step: StepId,
    #[source]
    source: StepError,
    /// Steps that never ran because scheduling stopped.
    skipped: Vec<StepId>,
  },

  /// A declared initial item was never provided.
  #[error("initial item {item} was declared but not provided")]
  MissingInitial { item: ItemId },

  /// An initial item was provided that the chain never declared.
  #[error("initial item {item} was not declared on the chain")]
  UndeclaredInitial { item: ItemId },

  /// The same initial simple item was provided twice.
  #[error("initial item {item} was provided more than once")]
  DuplicateInitial { item: ItemId },

  /// A build task died without reporting a step outcome.
  #[error("a build task panicked before reporting an outcome")]
  Panicked,
}

/// Configuration for chain execution.
#[derive(Debug, Clone)]
pub struct ExecuteConfig {
  /// Maximum number of steps to run concurrently.
  pub parallelism: usize,
}

impl Default for ExecuteConfig {
  fn default() -> Self {
    Self {
      parallelism: num_cpus(),
    }
  }
}

/// Get the number of CPUs for default parallelism.
fn num_cpus() -> usize {
  std::thread::available_parallelism().map(|p| p.get()).unwrap_or(4)
}

/// Wall-time accounting for one execution.
#[derive(Debug, Clone)]
pub struct ExecutionMetrics {
  /// Total wall time of the execution.
  pub total: Duration,
  /// Per-step durations, in execution (topological) order.
  pub steps: Vec<StepMetric>,
}

/// Duration of a single step invocation.
#[derive(Debug, Clone)]
pub struct StepMetric {
  pub id: StepId,
  pub duration: Duration,
}

/// The immutable snapshot of a successful execution.
///
/// Only items declared final on the chain are retained; everything else is
/// discarded with the execution context.
pub struct BuildResult {
  pub(super) finals_simple: HashMap<ItemId, AnyItem>,
  pub(super) finals_multi: HashMap<ItemId, Vec<AnyItem>>,
  pub(super) metrics: ExecutionMetrics,
}

impl std::fmt::Debug for BuildResult {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("BuildResult")
      .field("finals_simple", &self.finals_simple.keys().collect::<Vec<_>>())
      .field("finals_multi", &self.finals_multi.keys().collect::<Vec<_>>())
      .field("metrics", &self.metrics)
      .finish()
  }
}

impl BuildResult {
  /// The final instance of a simple item, if it was produced.
  ///
  /// Returns `None` when the type was not declared final or no included
  /// step produced it.
  pub fn simple<T: SimpleBuildItem>(&self) -> Option<Arc<T>> {
    let value = self.finals_simple.get(&ItemId::simple::<T>())?;
    // The store only ever files an item under its own type id.
    Some(value.clone().downcast::<T>().unwrap())
  }

  /// All final instances of a multi item, in canonical order.
  ///
  /// Empty when the type was not declared final or nothing was produced.
  pub fn multi<T: MultiBuildItem>(&self) -> Vec<Arc<T>> {
    self
      .finals_multi
      .get(&ItemId::multi::<T>())
      .map(Vec::as_slice)
      .unwrap_or_default()
      .iter()
      .map(|value| value.clone().downcast::<T>().unwrap())
      .collect()
  }

  pub fn metrics(&self) -> &ExecutionMetrics {
    &self.metrics
  }
}
