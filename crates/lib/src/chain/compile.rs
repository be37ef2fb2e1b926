//! Chain compilation: dependency wiring, pruning, cycle detection, ordering.
//!
//! Compilation turns the registered step declarations into an executable
//! graph in six stages:
//!
//! 1. Index every produces declaration per item and enforce the
//!    single-producer rules for simple items.
//! 2. Include steps by walking backwards from the final items and from
//!    every `always_run` step; everything not reached is pruned.
//! 3. Wire consumer-to-producer dependency edges, failing on required
//!    consumption with no producer.
//! 4. Detect cycles, reporting the full membership in cycle order.
//! 5. Validate phases on every resolved edge.
//! 6. Compute a deterministic topological order (registration order breaks
//!    ties) and the parallel wave partition.

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use tracing::{debug, info, warn};

use crate::item::ItemId;
use crate::step::{ConsumeMode, Produce, StepBuilder, StepId};

use super::{ChainBuildError, StepInfo};

/// Output of a successful compilation.
pub(super) struct Compiled {
  /// Step infos in topological order.
  pub steps: Vec<StepInfo>,
  /// Topological positions grouped into parallel waves.
  pub waves: Vec<Vec<usize>>,
  /// Steps that were registered but pruned from the chain.
  pub pruned: Vec<StepId>,
}

pub(super) fn compile(
  registered: &[StepBuilder],
  initial_ids: &[ItemId],
  final_ids: &[ItemId],
) -> Result<Compiled, ChainBuildError> {
  let producers = index_producers(registered, initial_ids)?;

  let (included, dependencies) = wire_dependencies(registered, initial_ids, final_ids, &producers)?;

  detect_cycles(registered, &included, &dependencies)?;
  check_phases(registered, &included, &dependencies)?;

  let compiled = order_steps(registered, &included, &dependencies);

  info!(
    steps = compiled.steps.len(),
    pruned = compiled.pruned.len(),
    waves = compiled.waves.len(),
    "chain compiled"
  );
  Ok(compiled)
}

/// Per-item list of producing steps, in registration order.
type Producers = HashMap<ItemId, Vec<(usize, Produce)>>;

/// Dependency edges per included consumer: (producer index, item).
type Dependencies = HashMap<usize, Vec<(usize, ItemId)>>;

fn index_producers(registered: &[StepBuilder], initial_ids: &[ItemId]) -> Result<Producers, ChainBuildError> {
  let mut producers: Producers = HashMap::new();
  for (idx, step) in registered.iter().enumerate() {
    for produce in &step.produces {
      let list = producers.entry(produce.id).or_default();
      if !produce.id.is_multi() {
        if initial_ids.contains(&produce.id) {
          return Err(ChainBuildError::ProducesInitial {
            step: step.id.clone(),
            item: produce.id,
          });
        }
        // Simple items admit one real and one overridable producer; two of
        // the same kind conflict.
        if let Some((other_idx, _)) = list
          .iter()
          .find(|(_, existing)| existing.overridable == produce.overridable)
        {
          return Err(ChainBuildError::DuplicateProducer {
            item: produce.id,
            producer: step.id.clone(),
            other: registered[*other_idx].id.clone(),
            overridable: produce.overridable,
          });
        }
      }
      list.push((idx, *produce));
    }
  }
  Ok(producers)
}

/// Walk backwards from the final items and every `always_run` step,
/// including producers transitively and recording dependency edges.
fn wire_dependencies(
  registered: &[StepBuilder],
  initial_ids: &[ItemId],
  final_ids: &[ItemId],
  producers: &Producers,
) -> Result<(HashSet<usize>, Dependencies), ChainBuildError> {
  let mut included: HashSet<usize> = HashSet::new();
  let mut to_add: VecDeque<usize> = VecDeque::new();

  for final_id in final_ids {
    include_producers_of(*final_id, producers, &mut included, &mut to_add, None);
  }
  for (idx, step) in registered.iter().enumerate() {
    if step.always_run && included.insert(idx) {
      to_add.push_back(idx);
    }
  }

  let mut dependencies: Dependencies = HashMap::new();
  while let Some(idx) = to_add.pop_front() {
    let step = &registered[idx];
    let mut edges: Vec<(usize, ItemId)> = Vec::new();
    for consume in &step.consumes {
      let id = consume.id;
      if consume.mode == ConsumeMode::Required
        && !initial_ids.contains(&id)
        && !producers.contains_key(&id)
      {
        return Err(ChainBuildError::MissingProducer {
          step: step.id.clone(),
          item: id,
        });
      }
      include_producers_of(id, producers, &mut included, &mut to_add, Some(&mut edges));
    }
    dependencies.entry(idx).or_default().extend(edges);
  }

  // Keep only edges to steps that made it into the chain, deterministically
  // ordered for the passes that follow.
  for edges in dependencies.values_mut() {
    edges.retain(|(producer, _)| included.contains(producer));
    edges.sort_by(|a, b| (a.0, a.1.type_name()).cmp(&(b.0, b.1.type_name())));
    edges.dedup();
  }

  Ok((included, dependencies))
}

/// Include the producers of one item.
///
/// Non-overridable producers are considered first; overridable producers
/// only stand in when no non-overridable producer matched. Weak produces
/// record the dependency edge without pulling the producing step in.
fn include_producers_of(
  id: ItemId,
  producers: &Producers,
  included: &mut HashSet<usize>,
  to_add: &mut VecDeque<usize>,
  edges: Option<&mut Vec<(usize, ItemId)>>,
) {
  let mut edges = edges;
  let mut matched = false;
  for pass_overridable in [false, true] {
    if pass_overridable && matched {
      break;
    }
    for (idx, produce) in producers.get(&id).map(Vec::as_slice).unwrap_or_default() {
      if produce.overridable != pass_overridable {
        continue;
      }
      if !produce.weak && included.insert(*idx) {
        to_add.push_back(*idx);
      }
      if let Some(edges) = edges.as_deref_mut() {
        edges.push((*idx, id));
      }
      matched = true;
    }
  }
}

/// Depth-first search along dependency edges; a revisit within the current
/// path is a cycle, reported with its full membership in cycle order.
fn detect_cycles(
  registered: &[StepBuilder],
  included: &HashSet<usize>,
  dependencies: &Dependencies,
) -> Result<(), ChainBuildError> {
  let mut checked: HashSet<usize> = HashSet::new();
  let mut roots: Vec<usize> = included.iter().copied().collect();
  roots.sort_unstable();
  for root in roots {
    let mut path: Vec<(usize, ItemId)> = Vec::new();
    visit(registered, dependencies, root, &mut path, &mut checked)?;
  }
  return Ok(());

  fn visit(
    registered: &[StepBuilder],
    dependencies: &Dependencies,
    idx: usize,
    path: &mut Vec<(usize, ItemId)>,
    checked: &mut HashSet<usize>,
  ) -> Result<(), ChainBuildError> {
    if checked.contains(&idx) {
      return Ok(());
    }
    if let Some(pos) = path.iter().position(|(step, _)| *step == idx) {
      let members = path[pos..]
        .iter()
        .map(|(step, item)| (registered[*step].id.clone(), *item))
        .collect();
      return Err(ChainBuildError::CycleDetected { path: members });
    }
    for (producer, item) in dependencies.get(&idx).map(Vec::as_slice).unwrap_or_default() {
      path.push((idx, *item));
      visit(registered, dependencies, *producer, path, checked)?;
      path.pop();
    }
    checked.insert(idx);
    Ok(())
  }
}

/// A consumer must not sit at an earlier phase than any of its producers.
fn check_phases(
  registered: &[StepBuilder],
  included: &HashSet<usize>,
  dependencies: &Dependencies,
) -> Result<(), ChainBuildError> {
  let mut consumers: Vec<usize> = included.iter().copied().collect();
  consumers.sort_unstable();
  for idx in consumers {
    let consumer = &registered[idx];
    for (producer_idx, item) in dependencies.get(&idx).map(Vec::as_slice).unwrap_or_default() {
      let producer = &registered[*producer_idx];
      if consumer.phase < producer.phase {
        return Err(ChainBuildError::PhaseViolation {
          consumer: consumer.id.clone(),
          consumer_phase: consumer.phase,
          producer: producer.id.clone(),
          producer_phase: producer.phase,
          item: *item,
        });
      }
    }
  }
  Ok(())
}

/// Deterministic topological order plus the parallel wave partition.
///
/// Kahn's algorithm over a petgraph graph of the included steps; whenever
/// several steps are ready at once, the one registered first runs first, so
/// a given registration sequence always compiles to the same order.
fn order_steps(registered: &[StepBuilder], included: &HashSet<usize>, dependencies: &Dependencies) -> Compiled {
  let mut graph: DiGraph<usize, ItemId> = DiGraph::new();
  let mut nodes: HashMap<usize, NodeIndex> = HashMap::new();

  let mut included_sorted: Vec<usize> = included.iter().copied().collect();
  included_sorted.sort_unstable();
  for idx in &included_sorted {
    nodes.insert(*idx, graph.add_node(*idx));
  }
  for idx in &included_sorted {
    for (producer, item) in dependencies.get(idx).map(Vec::as_slice).unwrap_or_default() {
      // Edge from dependency to dependent.
      graph.add_edge(nodes[producer], nodes[idx], *item);
    }
  }

  // Registration-order priority queue over ready nodes.
  let mut in_degree: HashMap<NodeIndex, usize> = HashMap::new();
  let mut ready: std::collections::BTreeSet<usize> = std::collections::BTreeSet::new();
  for (reg_idx, node) in &nodes {
    let degree = graph.edges_directed(*node, Direction::Incoming).count();
    in_degree.insert(*node, degree);
    if degree == 0 {
      ready.insert(*reg_idx);
    }
  }

  let mut topo: Vec<usize> = Vec::with_capacity(included_sorted.len());
  while let Some(reg_idx) = ready.pop_first() {
    topo.push(reg_idx);
    let node = nodes[&reg_idx];
    for neighbor in graph.neighbors_directed(node, Direction::Outgoing) {
      if let Some(degree) = in_degree.get_mut(&neighbor) {
        *degree = degree.saturating_sub(1);
        if *degree == 0 {
          ready.insert(graph[neighbor]);
        }
      }
    }
  }
  debug_assert_eq!(topo.len(), included_sorted.len(), "cycle check must precede ordering");

  // Wave levels: a step's level is one past the deepest of its producers.
  let mut level: HashMap<usize, usize> = HashMap::new();
  for reg_idx in &topo {
    let deepest = dependencies
      .get(reg_idx)
      .map(Vec::as_slice)
      .unwrap_or_default()
      .iter()
      .map(|(producer, _)| level[producer] + 1)
      .max()
      .unwrap_or(0);
    level.insert(*reg_idx, deepest);
  }

  let position: HashMap<usize, usize> = topo.iter().enumerate().map(|(pos, reg)| (*reg, pos)).collect();

  let mut waves: Vec<Vec<usize>> = Vec::new();
  for reg_idx in &topo {
    let wave = level[reg_idx];
    if waves.len() <= wave {
      waves.resize_with(wave + 1, Vec::new);
    }
    waves[wave].push(position[reg_idx]);
  }

  let mut steps: Vec<StepInfo> = topo
    .iter()
    .map(|reg_idx| {
      let step = &registered[*reg_idx];
      let dependencies: Vec<usize> = dependencies
        .get(reg_idx)
        .map(Vec::as_slice)
        .unwrap_or_default()
        .iter()
        .map(|(producer, _)| position[producer])
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
      debug!(step = %step.id, phase = %step.phase, deps = dependencies.len(), "step ordered");
      StepInfo {
        id: step.id.clone(),
        step: step.step.clone(),
        produces: step.produces.clone(),
        consumes: step.consumes.clone(),
        registration_index: *reg_idx,
        dependencies,
        dependents: Vec::new(),
      }
    })
    .collect();
  for info in &mut steps {
    info.dependencies.sort_unstable();
  }
  for pos in 0..steps.len() {
    let deps = steps[pos].dependencies.clone();
    for dep in deps {
      steps[dep].dependents.push(pos);
    }
  }

  let pruned: Vec<StepId> = registered
    .iter()
    .enumerate()
    .filter(|(idx, _)| !included.contains(idx))
    .map(|(_, step)| {
      warn!(step = %step.id, "pruning step: nothing in the chain consumes its output");
      step.id.clone()
    })
    .collect();

  Compiled { steps, waves, pruned }
}

/// Render the compiled chain as a graphviz digraph.
///
/// Start steps (no dependencies) and end steps (no dependents) are pinned
/// to the same rank, matching how the chain actually fans out and joins.
pub(super) fn write_dot(steps: &[StepInfo], out: &mut impl std::io::Write) -> std::io::Result<()> {
  writeln!(out, "digraph {{")?;
  writeln!(out, "    node [shape=rectangle];")?;
  writeln!(out, "    rankdir=LR;")?;
  writeln!(out)?;

  write!(out, "    {{ rank = same; ")?;
  for step in steps.iter().filter(|s| s.dependencies.is_empty()) {
    write!(out, "{}; ", quote(step.id.as_str()))?;
  }
  writeln!(out, "}};")?;
  write!(out, "    {{ rank = same; ")?;
  for step in steps.iter().filter(|s| s.dependents.is_empty() && !s.dependencies.is_empty()) {
    write!(out, "{}; ", quote(step.id.as_str()))?;
  }
  writeln!(out, "}};")?;
  writeln!(out)?;

  for step in steps {
    for dep in &step.dependencies {
      writeln!(
        out,
        "    {} -> {};",
        quote(steps[*dep].id.as_str()),
        quote(step.id.as_str())
      )?;
    }
  }
  writeln!(out, "}}")
}

fn quote(input: &str) -> String {
  format!("\"{}\"", input.replace('"', "\\\""))
}
