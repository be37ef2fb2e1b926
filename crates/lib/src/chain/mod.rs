//! Chain registration and compilation.
//!
//! [`ChainBuilder`] accumulates registered build steps plus the initial and
//! final item declarations, and compiles them into an immutable
//! [`BuildChain`]: producer/consumer edges resolved, unreachable steps
//! pruned, cycles rejected, phases validated, and a deterministic execution
//! order fixed. A compiled chain can be executed any number of times with no
//! recompilation cost.

mod compile;

use std::sync::Arc;

use thiserror::Error;
use tracing::warn;

use crate::execute::ExecutionBuilder;
use crate::item::{ItemId, MultiBuildItem, SimpleBuildItem};
use crate::phase::Phase;
use crate::step::{BuildStep, Consume, Produce, RegistrationError, StepBuilder, StepId};

/// Errors raised while compiling a chain.
///
/// Every variant names the steps and item types involved; these errors are
/// the interface an extension author debugs against, so the context must be
/// complete.
#[derive(Debug, Error)]
pub enum ChainBuildError {
  /// A required consumption has no producer anywhere in the chain.
  #[error("no producer for required item {item}, consumed by step {step}")]
  MissingProducer { step: StepId, item: ItemId },

  /// Two producers of the same simple item with the same overridability.
  #[error("multiple producers of simple item {item}: {producer} conflicts with {other} (overridable: {overridable})")]
  DuplicateProducer {
    item: ItemId,
    producer: StepId,
    other: StepId,
    overridable: bool,
  },

  /// A step produces an item that was declared as injected from outside.
  #[error("step {step} produces {item}, which is an initial item")]
  ProducesInitial { step: StepId, item: ItemId },

  /// A produce/consume cycle among the included steps.
  #[error("cycle detected: {}", display_cycle(.path))]
  CycleDetected {
    /// Cycle members in cycle order; each step depends on the next (the
    /// last depends on the first) via the paired item.
    path: Vec<(StepId, ItemId)>,
  },

  /// A step consumes an item only available at a later phase.
  #[error(
    "step {consumer} ({consumer_phase}) consumes {item} produced by step {producer} ({producer_phase}); \
     an earlier phase cannot consume a later-phase item"
  )]
  PhaseViolation {
    consumer: StepId,
    consumer_phase: Phase,
    producer: StepId,
    producer_phase: Phase,
    item: ItemId,
  },
}

impl ChainBuildError {
  /// The steps forming the cycle, when this is a cycle error.
  pub fn cycle_members(&self) -> Option<Vec<&StepId>> {
    match self {
      ChainBuildError::CycleDetected { path } => Some(path.iter().map(|(step, _)| step).collect()),
      _ => None,
    }
  }
}

fn display_cycle(path: &[(StepId, ItemId)]) -> String {
  let mut out = String::new();
  for (i, (step, item)) in path.iter().enumerate() {
    let next = &path[(i + 1) % path.len()].0;
    if i > 0 {
      out.push_str("; ");
    }
    out.push_str(&format!("{step} needs {item} from {next}"));
  }
  out
}

/// Accumulates build steps and compiles them into a [`BuildChain`].
#[derive(Default)]
pub struct ChainBuilder {
  steps: Vec<StepBuilder>,
  initial_ids: Vec<ItemId>,
  final_ids: Vec<ItemId>,
}

impl std::fmt::Debug for ChainBuilder {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ChainBuilder")
      .field("steps", &self.steps.iter().map(|s| &s.id).collect::<Vec<_>>())
      .field("initial_ids", &self.initial_ids)
      .field("final_ids", &self.final_ids)
      .finish()
  }
}

impl ChainBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a build step.
  ///
  /// The declaration set is validated immediately; malformed declarations
  /// never make it into the builder.
  pub fn add_step(&mut self, step: StepBuilder) -> Result<&mut Self, RegistrationError> {
    step.validate()?;
    if self.steps.iter().any(|existing| existing.id == step.id) {
      return Err(RegistrationError::DuplicateStepName { step: step.id });
    }
    self.steps.push(step);
    Ok(self)
  }

  /// Declare a simple item injected from outside the chain.
  ///
  /// No step may produce an initial simple item.
  pub fn add_initial<T: SimpleBuildItem>(&mut self) -> &mut Self {
    self.push_initial(ItemId::simple::<T>());
    self
  }

  /// Declare a multi item whose instances are injected from outside.
  pub fn add_initial_multi<T: MultiBuildItem>(&mut self) -> &mut Self {
    self.push_initial(ItemId::multi::<T>());
    self
  }

  /// Declare a simple item retained in the final [`BuildResult`].
  ///
  /// [`BuildResult`]: crate::execute::BuildResult
  pub fn add_final<T: SimpleBuildItem>(&mut self) -> &mut Self {
    self.push_final(ItemId::simple::<T>());
    self
  }

  /// Declare a multi item retained in the final [`BuildResult`].
  ///
  /// [`BuildResult`]: crate::execute::BuildResult
  pub fn add_final_multi<T: MultiBuildItem>(&mut self) -> &mut Self {
    self.push_final(ItemId::multi::<T>());
    self
  }

  fn push_initial(&mut self, id: ItemId) {
    if !self.initial_ids.contains(&id) {
      self.initial_ids.push(id);
    }
  }

  fn push_final(&mut self, id: ItemId) {
    if !self.final_ids.contains(&id) {
      self.final_ids.push(id);
    }
  }

  /// Compile the registered steps into an executable chain.
  pub fn build(&self) -> Result<BuildChain, ChainBuildError> {
    if self.final_ids.is_empty() && !self.steps.iter().any(|s| s.always_run) {
      warn!("no final items and no always-run steps declared: the chain will be empty");
    }
    let compiled = compile::compile(&self.steps, &self.initial_ids, &self.final_ids)?;
    Ok(BuildChain {
      steps: compiled.steps,
      waves: compiled.waves,
      pruned: compiled.pruned,
      initial_ids: self.initial_ids.clone(),
      final_ids: self.final_ids.clone(),
    })
  }
}

/// One step of a compiled chain.
pub(crate) struct StepInfo {
  pub(crate) id: StepId,
  pub(crate) step: Arc<dyn BuildStep>,
  pub(crate) produces: Vec<Produce>,
  pub(crate) consumes: Vec<Consume>,
  /// Position in the original registration sequence; the canonical sort key
  /// for multi-item contributions.
  pub(crate) registration_index: usize,
  /// Topological positions of direct producers.
  pub(crate) dependencies: Vec<usize>,
  /// Topological positions of direct dependents.
  pub(crate) dependents: Vec<usize>,
}

/// The compiled, immutable, executable graph of build steps.
pub struct BuildChain {
  pub(crate) steps: Vec<StepInfo>,
  waves: Vec<Vec<usize>>,
  pruned: Vec<StepId>,
  pub(crate) initial_ids: Vec<ItemId>,
  pub(crate) final_ids: Vec<ItemId>,
}

impl std::fmt::Debug for BuildChain {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("BuildChain")
      .field("steps", &self.step_order())
      .field("pruned", &self.pruned)
      .field("initial_ids", &self.initial_ids)
      .field("final_ids", &self.final_ids)
      .finish()
  }
}

impl BuildChain {
  /// Begin binding initial items for one execution of this chain.
  pub fn execution(&self) -> ExecutionBuilder<'_> {
    ExecutionBuilder::new(self)
  }

  /// Step identities in execution order.
  pub fn step_order(&self) -> Vec<&StepId> {
    self.steps.iter().map(|info| &info.id).collect()
  }

  /// Steps grouped into parallel waves: every step in a wave only depends
  /// on steps in earlier waves.
  pub fn waves(&self) -> Vec<Vec<&StepId>> {
    self
      .waves
      .iter()
      .map(|wave| wave.iter().map(|pos| &self.steps[*pos].id).collect())
      .collect()
  }

  /// Steps that were registered but pruned during compilation.
  pub fn pruned(&self) -> &[StepId] {
    &self.pruned
  }

  /// Number of steps that will execute.
  pub fn len(&self) -> usize {
    self.steps.len()
  }

  pub fn is_empty(&self) -> bool {
    self.steps.is_empty()
  }

  /// Write the chain as a graphviz digraph, for debugging a step graph
  /// without source-level debugging of the engine.
  pub fn write_dot(&self, out: &mut impl std::io::Write) -> std::io::Result<()> {
    compile::write_dot(&self.steps, out)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::execute::StepContext;
  use crate::item::BuildItem;
  use crate::step::StepError;

  #[derive(Debug)]
  struct ItemX;
  impl BuildItem for ItemX {}
  impl SimpleBuildItem for ItemX {}

  #[derive(Debug)]
  struct ItemY;
  impl BuildItem for ItemY {}
  impl SimpleBuildItem for ItemY {}

  #[derive(Debug)]
  struct ItemZ;
  impl BuildItem for ItemZ {}
  impl SimpleBuildItem for ItemZ {}

  #[derive(Debug)]
  struct ItemW;
  impl BuildItem for ItemW {}
  impl SimpleBuildItem for ItemW {}

  #[derive(Debug)]
  struct RouteEntry;
  impl BuildItem for RouteEntry {}
  impl MultiBuildItem for RouteEntry {}

  fn noop(_: &mut StepContext) -> Result<(), StepError> {
    Ok(())
  }

  fn step(name: &str) -> StepBuilder {
    StepBuilder::new(name, noop)
  }

  fn names(ids: &[&StepId]) -> Vec<String> {
    ids.iter().map(|id| id.as_str().to_string()).collect()
  }

  #[test]
  fn duplicate_step_name_is_a_registration_error() {
    let mut builder = ChainBuilder::new();
    builder.add_step(step("one")).unwrap();
    let err = builder.add_step(step("one")).unwrap_err();
    assert!(matches!(err, RegistrationError::DuplicateStepName { .. }));
  }

  #[test]
  fn missing_producer_names_step_and_item() {
    let mut builder = ChainBuilder::new();
    builder.add_final::<ItemY>();
    builder
      .add_step(step("wants-x").consumes::<ItemX>().produces::<ItemY>())
      .unwrap();
    let err = builder.build().unwrap_err();
    match err {
      ChainBuildError::MissingProducer { step, item } => {
        assert_eq!(step.as_str(), "wants-x");
        assert!(item.to_string().ends_with("ItemX"));
      }
      other => panic!("unexpected error: {other}"),
    }
  }

  #[test]
  fn optional_consume_without_producer_compiles() {
    let mut builder = ChainBuilder::new();
    builder.add_final::<ItemY>();
    builder
      .add_step(step("maybe-x").consumes_optional::<ItemX>().produces::<ItemY>())
      .unwrap();
    let chain = builder.build().unwrap();
    assert_eq!(chain.len(), 1);
  }

  #[test]
  fn multi_consume_without_producer_compiles() {
    let mut builder = ChainBuilder::new();
    builder.add_final::<ItemY>();
    builder
      .add_step(step("collect").consumes_multi::<RouteEntry>().produces::<ItemY>())
      .unwrap();
    assert!(builder.build().is_ok());
  }

  #[test]
  fn duplicate_simple_producer_is_rejected() {
    let mut builder = ChainBuilder::new();
    builder.add_final::<ItemX>();
    builder.add_step(step("first").produces::<ItemX>()).unwrap();
    builder.add_step(step("second").produces::<ItemX>()).unwrap();
    let err = builder.build().unwrap_err();
    assert!(matches!(err, ChainBuildError::DuplicateProducer { .. }));
  }

  #[test]
  fn real_and_overridable_producers_coexist() {
    let mut builder = ChainBuilder::new();
    builder.add_final::<ItemX>();
    builder.add_step(step("real").produces::<ItemX>()).unwrap();
    builder.add_step(step("fallback").produces_overridable::<ItemX>()).unwrap();
    let chain = builder.build().unwrap();
    // The real producer is preferred for inclusion.
    assert_eq!(names(&chain.step_order()), vec!["real"]);
  }

  #[test]
  fn overridable_producer_stands_in_when_no_real_producer_exists() {
    let mut builder = ChainBuilder::new();
    builder.add_final::<ItemX>();
    builder.add_step(step("fallback").produces_overridable::<ItemX>()).unwrap();
    let chain = builder.build().unwrap();
    assert_eq!(names(&chain.step_order()), vec!["fallback"]);
  }

  #[test]
  fn two_overridable_producers_conflict() {
    let mut builder = ChainBuilder::new();
    builder.add_final::<ItemX>();
    builder.add_step(step("first").produces_overridable::<ItemX>()).unwrap();
    builder.add_step(step("second").produces_overridable::<ItemX>()).unwrap();
    let err = builder.build().unwrap_err();
    assert!(matches!(
      err,
      ChainBuildError::DuplicateProducer { overridable: true, .. }
    ));
  }

  #[test]
  fn producing_an_initial_item_is_rejected() {
    let mut builder = ChainBuilder::new();
    builder.add_initial::<ItemX>();
    builder.add_final::<ItemX>();
    builder.add_step(step("rogue").produces::<ItemX>()).unwrap();
    let err = builder.build().unwrap_err();
    assert!(matches!(err, ChainBuildError::ProducesInitial { .. }));
  }

  #[test]
  fn cycle_is_reported_with_its_members() {
    let mut builder = ChainBuilder::new();
    builder.add_final::<ItemX>();
    builder
      .add_step(step("a").consumes::<ItemY>().produces::<ItemX>())
      .unwrap();
    builder
      .add_step(step("b").consumes::<ItemX>().produces::<ItemY>())
      .unwrap();
    let err = builder.build().unwrap_err();
    let members = err.cycle_members().expect("expected a cycle error");
    let mut member_names = names(&members);
    member_names.sort();
    assert_eq!(member_names, vec!["a", "b"]);
  }

  #[test]
  fn self_cycle_is_reported() {
    let mut builder = ChainBuilder::new();
    builder.add_final::<ItemX>();
    builder
      .add_step(step("ouroboros").consumes::<ItemX>().produces::<ItemX>())
      .unwrap();
    let err = builder.build().unwrap_err();
    let members = err.cycle_members().expect("expected a cycle error");
    assert_eq!(names(&members), vec!["ouroboros"]);
  }

  #[test]
  fn phase_violation_names_both_steps() {
    let mut builder = ChainBuilder::new();
    builder.add_final::<ItemX>();
    builder
      .add_step(step("g").produces::<ItemW>().phase(Phase::StaticInit))
      .unwrap();
    builder
      .add_step(
        step("f")
          .consumes::<ItemW>()
          .produces::<ItemX>()
          .phase(Phase::BuildTime),
      )
      .unwrap();
    let err = builder.build().unwrap_err();
    match err {
      ChainBuildError::PhaseViolation {
        consumer,
        producer,
        consumer_phase,
        producer_phase,
        ..
      } => {
        assert_eq!(consumer.as_str(), "f");
        assert_eq!(producer.as_str(), "g");
        assert_eq!(consumer_phase, Phase::BuildTime);
        assert_eq!(producer_phase, Phase::StaticInit);
      }
      other => panic!("unexpected error: {other}"),
    }
  }

  #[test]
  fn later_phase_may_consume_earlier_phase_items() {
    let mut builder = ChainBuilder::new();
    builder.add_final::<ItemX>();
    builder
      .add_step(step("early").produces::<ItemW>().phase(Phase::BuildTime))
      .unwrap();
    builder
      .add_step(
        step("late")
          .consumes::<ItemW>()
          .produces::<ItemX>()
          .phase(Phase::RuntimeInit),
      )
      .unwrap();
    assert!(builder.build().is_ok());
  }

  #[test]
  fn unconsumed_step_is_pruned() {
    let mut builder = ChainBuilder::new();
    builder.add_final::<ItemX>();
    builder.add_step(step("kept").produces::<ItemX>()).unwrap();
    builder.add_step(step("dead").produces::<ItemY>()).unwrap();
    let chain = builder.build().unwrap();
    assert_eq!(names(&chain.step_order()), vec!["kept"]);
    assert_eq!(chain.pruned().len(), 1);
    assert_eq!(chain.pruned()[0].as_str(), "dead");
  }

  #[test]
  fn always_run_step_survives_pruning() {
    let mut builder = ChainBuilder::new();
    builder.add_final::<ItemX>();
    builder.add_step(step("kept").produces::<ItemX>()).unwrap();
    builder.add_step(step("validator").produces::<ItemY>().always_run()).unwrap();
    let chain = builder.build().unwrap();
    let mut ordered = names(&chain.step_order());
    ordered.sort();
    assert_eq!(ordered, vec!["kept", "validator"]);
    assert!(chain.pruned().is_empty());
  }

  #[test]
  fn weak_producer_is_not_pulled_in_by_its_output() {
    let mut builder = ChainBuilder::new();
    builder.add_final::<ItemY>();
    builder.add_step(step("weak").produces_weak::<ItemX>()).unwrap();
    builder
      .add_step(step("wants-x").consumes_optional::<ItemX>().produces::<ItemY>())
      .unwrap();
    let chain = builder.build().unwrap();
    // The weak producer stays out; its consumer observes absence.
    assert_eq!(names(&chain.step_order()), vec!["wants-x"]);
  }

  #[test]
  fn independent_steps_keep_registration_order() {
    let mut builder = ChainBuilder::new();
    builder.add_final_multi::<RouteEntry>();
    for name in ["gamma", "alpha", "beta"] {
      builder.add_step(step(name).produces_multi::<RouteEntry>()).unwrap();
    }
    let chain = builder.build().unwrap();
    assert_eq!(names(&chain.step_order()), vec!["gamma", "alpha", "beta"]);
  }

  #[test]
  fn diamond_orders_and_waves() {
    //     a
    //    / \
    //   b   c
    //    \ /
    //     d
    let mut builder = ChainBuilder::new();
    builder.add_final_multi::<RouteEntry>();
    builder.add_step(step("a").produces::<ItemX>()).unwrap();
    builder
      .add_step(step("b").consumes::<ItemX>().produces::<ItemY>())
      .unwrap();
    builder
      .add_step(step("c").consumes::<ItemX>().produces::<ItemZ>())
      .unwrap();
    builder
      .add_step(
        step("d")
          .consumes::<ItemY>()
          .consumes::<ItemZ>()
          .produces_multi::<RouteEntry>(),
      )
      .unwrap();
    let chain = builder.build().unwrap();

    assert_eq!(names(&chain.step_order()), vec!["a", "b", "c", "d"]);

    let waves = chain.waves();
    assert_eq!(waves.len(), 3);
    assert_eq!(names(&waves[0]), vec!["a"]);
    assert_eq!(names(&waves[1]), vec!["b", "c"]);
    assert_eq!(names(&waves[2]), vec!["d"]);
  }

  #[test]
  fn compiling_twice_yields_the_same_order() {
    let mut builder = ChainBuilder::new();
    builder.add_final::<ItemY>();
    builder.add_step(step("a").produces::<ItemX>()).unwrap();
    builder
      .add_step(step("b").consumes::<ItemX>().produces::<ItemY>())
      .unwrap();
    let first = builder.build().unwrap();
    let second = builder.build().unwrap();
    assert_eq!(names(&first.step_order()), names(&second.step_order()));
  }

  #[test]
  fn dot_output_lists_steps_and_edges() {
    let mut builder = ChainBuilder::new();
    builder.add_final::<ItemY>();
    builder.add_step(step("producer").produces::<ItemX>()).unwrap();
    builder
      .add_step(step("consumer").consumes::<ItemX>().produces::<ItemY>())
      .unwrap();
    let chain = builder.build().unwrap();

    let mut out = Vec::new();
    chain.write_dot(&mut out).unwrap();
    let dot = String::from_utf8(out).unwrap();
    assert!(dot.starts_with("digraph {"));
    assert!(dot.contains("\"producer\" -> \"consumer\";"));
  }

  #[test]
  fn chain_without_finals_or_always_run_is_empty() {
    let mut builder = ChainBuilder::new();
    builder.add_step(step("floating").produces::<ItemX>()).unwrap();
    let chain = builder.build().unwrap();
    assert!(chain.is_empty());
    assert_eq!(chain.pruned().len(), 1);
  }
}
