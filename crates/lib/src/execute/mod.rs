//! Chain execution engine.
//!
//! Runs a compiled [`BuildChain`] exactly once per call:
//! - A step is scheduled as soon as every one of its direct producers has
//!   completed; there is no wave barrier, so independent branches never wait
//!   on each other.
//! - Step bodies run on the blocking pool and may block on I/O; a semaphore
//!   caps how many run at once.
//! - Productions are buffered per step and published to the shared store
//!   only after the step returns; multi collections are reassembled in
//!   canonical producer order, never completion order.
//! - The first step failure stops all further scheduling, lets in-flight
//!   steps finish, and fails the execution as a whole. No partial result is
//!   ever returned and nothing is retried.

mod context;
mod types;

pub use context::StepContext;
pub use types::{BuildError, BuildResult, ExecuteConfig, ExecutionMetrics, StepMetric};

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::chain::{BuildChain, StepInfo};
use crate::item::{AnyItem, ItemId, MultiBuildItem, SimpleBuildItem, erase};
use crate::step::{ConsumeMode, StepError, StepId};

use context::{InputValue, ItemStore, ProducedItem};

/// Binds the initial items for one execution of a compiled chain.
///
/// Created via [`BuildChain::execution`]. Every initial simple item the
/// chain declared must be provided before [`run`](Self::run); providing an
/// undeclared or duplicate item fails immediately.
pub struct ExecutionBuilder<'a> {
  chain: &'a BuildChain,
  initial_simple: HashMap<ItemId, AnyItem>,
  initial_multi: HashMap<ItemId, Vec<AnyItem>>,
}

impl std::fmt::Debug for ExecutionBuilder<'_> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ExecutionBuilder")
      .field("chain", self.chain)
      .field("initial_simple", &self.initial_simple.keys().collect::<Vec<_>>())
      .field("initial_multi", &self.initial_multi.keys().collect::<Vec<_>>())
      .finish()
  }
}

impl<'a> ExecutionBuilder<'a> {
  pub(crate) fn new(chain: &'a BuildChain) -> Self {
    Self {
      chain,
      initial_simple: HashMap::new(),
      initial_multi: HashMap::new(),
    }
  }

  /// Provide the instance of a declared initial simple item.
  pub fn provide<T: SimpleBuildItem>(mut self, item: T) -> Result<Self, BuildError> {
    let id = ItemId::simple::<T>();
    if !self.chain.initial_ids.contains(&id) {
      return Err(BuildError::UndeclaredInitial { item: id });
    }
    if self.initial_simple.contains_key(&id) {
      return Err(BuildError::DuplicateInitial { item: id });
    }
    self.initial_simple.insert(id, erase(item));
    Ok(self)
  }

  /// Contribute one instance of a declared initial multi item.
  ///
  /// Instances keep their provision order and rank before every step
  /// contribution in the canonical collection order.
  pub fn provide_multi<T: MultiBuildItem>(mut self, item: T) -> Result<Self, BuildError> {
    let id = ItemId::multi::<T>();
    if !self.chain.initial_ids.contains(&id) {
      return Err(BuildError::UndeclaredInitial { item: id });
    }
    self.initial_multi.entry(id).or_default().push(erase(item));
    Ok(self)
  }

  /// Execute the chain.
  pub async fn run(self, config: &ExecuteConfig) -> Result<BuildResult, BuildError> {
    let chain = self.chain;
    for id in &chain.initial_ids {
      if !id.is_multi() && !self.initial_simple.contains_key(id) {
        return Err(BuildError::MissingInitial { item: *id });
      }
    }

    info!(
      steps = chain.len(),
      parallelism = config.parallelism,
      "starting chain execution"
    );
    let start = Instant::now();

    let mut store = ItemStore::new();
    for (id, value) in self.initial_simple {
      store.publish_simple(id, value, false);
    }
    for (id, values) in self.initial_multi {
      for (seq, value) in values.into_iter().enumerate() {
        store.publish_multi(id, (0, seq), value);
      }
    }

    let total = chain.steps.len();
    let mut remaining: Vec<usize> = chain.steps.iter().map(|info| info.dependencies.len()).collect();
    let mut ready: BTreeSet<usize> = (0..total).filter(|pos| remaining[*pos] == 0).collect();
    let mut spawned = vec![false; total];
    let mut durations: Vec<Duration> = vec![Duration::ZERO; total];
    let mut failure: Option<(StepId, StepError)> = None;
    let mut panicked = false;

    let semaphore = Arc::new(Semaphore::new(config.parallelism.max(1)));
    let mut join_set: JoinSet<(usize, Result<Vec<ProducedItem>, StepError>, Duration)> = JoinSet::new();

    loop {
      if failure.is_none() && !panicked {
        while let Some(pos) = ready.pop_first() {
          spawn_step(&chain.steps[pos], pos, &store, semaphore.clone(), &mut join_set);
          spawned[pos] = true;
        }
      }

      let Some(joined) = join_set.join_next().await else {
        break;
      };
      match joined {
        Ok((pos, outcome, duration)) => {
          let info = &chain.steps[pos];
          durations[pos] = duration;
          match outcome {
            Ok(produced) => {
              debug!(step = %info.id, items = produced.len(), "step completed");
              publish(&mut store, info, produced);
              for dependent in &info.dependents {
                remaining[*dependent] -= 1;
                if remaining[*dependent] == 0 {
                  ready.insert(*dependent);
                }
              }
            }
            Err(err) => {
              error!(step = %info.id, error = %err, "step failed");
              if failure.is_none() {
                failure = Some((info.id.clone(), err));
              }
            }
          }
        }
        Err(join_err) => {
          // The outer task died without reporting; the step identity is
          // lost with it.
          error!(error = %join_err, "build task panicked");
          panicked = true;
        }
      }
    }

    if let Some((step, source)) = failure {
      let skipped: Vec<StepId> = (0..total)
        .filter(|pos| !spawned[*pos])
        .map(|pos| chain.steps[pos].id.clone())
        .collect();
      warn!(failed = %step, skipped = skipped.len(), "chain execution failed");
      return Err(BuildError::StepFailed { step, source, skipped });
    }
    if panicked {
      return Err(BuildError::Panicked);
    }

    let metrics = ExecutionMetrics {
      total: start.elapsed(),
      steps: chain
        .steps
        .iter()
        .enumerate()
        .map(|(pos, info)| StepMetric {
          id: info.id.clone(),
          duration: durations[pos],
        })
        .collect(),
    };

    let mut finals_simple = HashMap::new();
    let mut finals_multi = HashMap::new();
    for id in &chain.final_ids {
      if id.is_multi() {
        finals_multi.insert(*id, store.collect_multi(*id));
      } else if let Some(value) = store.get_simple(*id) {
        finals_simple.insert(*id, value);
      }
    }

    info!(
      steps = total,
      elapsed_ms = metrics.total.as_millis() as u64,
      "chain execution complete"
    );
    Ok(BuildResult {
      finals_simple,
      finals_multi,
      metrics,
    })
  }
}

/// Resolve a step's inputs from the store and spawn it.
///
/// Inputs are snapshotted here, on the scheduler loop, so the running step
/// needs no access to shared state.
fn spawn_step(
  info: &StepInfo,
  pos: usize,
  store: &ItemStore,
  semaphore: Arc<Semaphore>,
  join_set: &mut JoinSet<(usize, Result<Vec<ProducedItem>, StepError>, Duration)>,
) {
  let mut inputs = HashMap::new();
  for consume in &info.consumes {
    let value = match consume.mode {
      ConsumeMode::Multi => InputValue::Multi(store.collect_multi(consume.id)),
      ConsumeMode::Required | ConsumeMode::Optional => match store.get_simple(consume.id) {
        Some(value) => InputValue::Simple(value),
        None => InputValue::Absent,
      },
    };
    inputs.insert(consume.id, value);
  }
  let produce_decls: HashMap<ItemId, bool> = info.produces.iter().map(|p| (p.id, p.overridable)).collect();

  let cx = StepContext::new(info.id.clone(), inputs, produce_decls);
  let step = info.step.clone();
  let id = info.id.clone();

  join_set.spawn(async move {
    // The semaphore lives for the whole execution and is never closed.
    let _permit = semaphore.acquire_owned().await.unwrap();
    debug!(step = %id, "step started");
    let started = Instant::now();
    let joined = tokio::task::spawn_blocking(move || {
      let mut cx = cx;
      let outcome = step.execute(&mut cx);
      (cx, outcome)
    })
    .await;
    match joined {
      Ok((cx, Ok(()))) => (pos, Ok(cx.into_produced()), started.elapsed()),
      Ok((_, Err(err))) => (pos, Err(err), started.elapsed()),
      Err(join_err) => (pos, Err(StepError::failed(join_err)), started.elapsed()),
    }
  });
}

/// Publish a completed step's buffered productions.
fn publish(store: &mut ItemStore, info: &StepInfo, produced: Vec<ProducedItem>) {
  let mut sequences: HashMap<ItemId, usize> = HashMap::new();
  for item in produced {
    if item.id.is_multi() {
      let seq = sequences.entry(item.id).or_insert(0);
      // Initial items occupy rank 0.
      store.publish_multi(item.id, (info.registration_index + 1, *seq), item.value);
      *seq += 1;
    } else {
      store.publish_simple(item.id, item.value, item.overridable);
    }
  }
}
